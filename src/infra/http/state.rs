use std::sync::Arc;

use axum::http::HeaderMap;

use crate::application::cache::CacheService;
use crate::infra::db::PostgresRepositories;

/// Header carrying the tenant resolved by the upstream gateway.
pub const ORG_HEADER: &str = "x-org";

#[derive(Clone)]
pub struct HttpState {
    pub cache: Arc<CacheService>,
    /// Present when the service runs against Postgres.
    pub db: Option<Arc<PostgresRepositories>>,
}

impl HttpState {
    pub fn new(cache: Arc<CacheService>, db: Option<Arc<PostgresRepositories>>) -> Self {
        Self { cache, db }
    }

    pub fn tenant(headers: &HeaderMap) -> Option<String> {
        headers
            .get(ORG_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn tenant_header_is_trimmed_and_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(HttpState::tenant(&headers), None);

        headers.insert(ORG_HEADER, HeaderValue::from_static("  "));
        assert_eq!(HttpState::tenant(&headers), None);

        headers.insert(ORG_HEADER, HeaderValue::from_static(" acme "));
        assert_eq!(HttpState::tenant(&headers).as_deref(), Some("acme"));
    }
}
