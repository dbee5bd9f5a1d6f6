use time::OffsetDateTime;

use super::error::DomainError;

const MAX_NAME_LEN: usize = 255;

/// Metadata record for a cache name.
///
/// Lives independently of the entries filed under the name, so a flush leaves
/// it in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNameRecord {
    pub cache_name: String,
    pub description: Option<String>,
    pub deleted: bool,
    pub updated_at: OffsetDateTime,
}

impl CacheNameRecord {
    pub fn new(cache_name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            description,
            deleted: false,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// Check a cache name or key segment before it reaches the store.
pub fn validate_segment(field: &'static str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be blank")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "{field} exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if value.contains('/') {
        return Err(DomainError::validation(format!(
            "{field} must not contain `/`"
        )));
    }
    Ok(())
}
