use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use keystash_api_types::{
    BatchCacheRequest, BatchCacheResponse, BatchCacheResult, BatchDeleteCacheResponse,
    BatchGetCacheRequests, BatchGetCacheResponse, CacheDeleteResponse, CacheGetResponse,
    CacheRequest,
};
use tracing::warn;

use crate::application::cache::{CacheServiceError, SetCommand};
use crate::domain::entry::EntryId;

use super::cache_to_api;
use crate::infra::http::error::{ApiError, codes};
use crate::infra::http::state::HttpState;

const BINARY_PAYLOAD: &str = "application/octet-stream";

fn require_binary(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if essence.eq_ignore_ascii_case(BINARY_PAYLOAD) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_CONTENT_TYPE,
            "This endpoint only accepts application/octet-stream",
            Some(format!("got `{content_type}`")),
        ))
    }
}

async fn store_binary(
    state: HttpState,
    headers: HeaderMap,
    cache_name: String,
    key: String,
    ttl_seconds: Option<u32>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    require_binary(&headers)?;
    state
        .cache
        .set(SetCommand {
            org: HttpState::tenant(&headers),
            cache_name,
            key,
            ttl_seconds,
            payload: body,
        })
        .await
        .map_err(cache_to_api)?;
    Ok(StatusCode::CREATED)
}

/// Binary set using the configured default TTL.
pub async fn set_binary(
    State(state): State<HttpState>,
    Path((cache_name, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    store_binary(state, headers, cache_name, key, None, body).await
}

pub async fn set_binary_with_ttl(
    State(state): State<HttpState>,
    Path((cache_name, key, ttl_seconds)): Path<(String, String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    store_binary(state, headers, cache_name, key, Some(ttl_seconds), body).await
}

pub async fn get_binary(
    State(state): State<HttpState>,
    Path((cache_name, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = state
        .cache
        .get(&cache_name, &key)
        .await
        .map_err(cache_to_api)?;

    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(BINARY_PAYLOAD))],
        payload,
    ))
}

pub async fn delete_entry(
    State(state): State<HttpState>,
    Path((cache_name, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cache
        .delete(&cache_name, &key)
        .await
        .map_err(cache_to_api)?;
    Ok(StatusCode::ACCEPTED)
}

fn set_command(headers: &HeaderMap, request: CacheRequest) -> SetCommand {
    SetCommand {
        org: HttpState::tenant(headers).or(request.org),
        cache_name: request.cache_name,
        key: request.key,
        ttl_seconds: request.ttl_seconds,
        payload: Bytes::from(request.value),
    }
}

pub async fn set_json(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<CacheRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .cache
        .set(set_command(&headers, request))
        .await
        .map_err(cache_to_api)?;
    Ok(StatusCode::CREATED)
}

/// JSON read. Lookup failures are reported in the body, not the status.
pub async fn get_json(
    State(state): State<HttpState>,
    Path((cache_name, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let (success, value) = match state.cache.get(&cache_name, &key).await {
        Ok(payload) => (true, payload.to_vec()),
        Err(err @ CacheServiceError::Invalid(_)) => return Err(cache_to_api(err)),
        Err(err) => {
            if !err.is_not_found() {
                warn!(cache_name = %cache_name, key = %key, error = %err, "JSON get failed");
            }
            (false, Vec::new())
        }
    };

    Ok(Json(CacheGetResponse {
        cache_name,
        key,
        success,
        value,
    }))
}

pub async fn batch_set(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<BatchCacheRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let commands = request
        .cache_requests
        .into_iter()
        .map(|item| set_command(&headers, item))
        .collect();
    let items = state.cache.batch_set(commands).await;

    let complete = items.iter().all(|item| item.is_ok());
    let results = items
        .into_iter()
        .map(|item| BatchCacheResult {
            success: item.is_ok(),
            cache_name: item.id.cache_name().to_string(),
            key: item.id.key().to_string(),
        })
        .collect();

    Ok(Json(BatchCacheResponse { complete, results }))
}

fn batch_ids(request: BatchGetCacheRequests) -> Vec<EntryId> {
    request
        .get_cached_batch
        .into_iter()
        .map(|item| EntryId::new(item.cache_name, item.key))
        .collect()
}

pub async fn batch_get(
    State(state): State<HttpState>,
    Json(request): Json<BatchGetCacheRequests>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.cache.batch_get(batch_ids(request)).await;

    let complete = items.iter().all(|item| item.is_ok());
    let results = items
        .into_iter()
        .map(|item| {
            let (success, value) = match item.result {
                Ok(payload) => (true, payload.to_vec()),
                Err(_) => (false, Vec::new()),
            };
            CacheGetResponse {
                cache_name: item.id.cache_name().to_string(),
                key: item.id.key().to_string(),
                success,
                value,
            }
        })
        .collect();

    Ok(Json(BatchGetCacheResponse { complete, results }))
}

pub async fn batch_delete(
    State(state): State<HttpState>,
    Json(request): Json<BatchGetCacheRequests>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state.cache.batch_delete(batch_ids(request)).await;

    let success = items.iter().all(|item| item.is_ok());
    let cache_delete_responses = items
        .into_iter()
        .map(|item| CacheDeleteResponse {
            success: item.is_ok(),
            cache_name: item.id.cache_name().to_string(),
            key: item.id.key().to_string(),
        })
        .collect();

    Ok(Json(BatchDeleteCacheResponse {
        success,
        cache_delete_responses,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_content_type_accepts_parameters() {
        let mut headers = HeaderMap::new();
        assert!(require_binary(&headers).is_err());

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream; charset=binary"),
        );
        assert!(require_binary(&headers).is_ok());

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let err = require_binary(&headers).expect_err("text rejected");
        assert_eq!(err.code(), codes::INVALID_CONTENT_TYPE);
    }

    #[test]
    fn header_tenant_wins_over_body_org() {
        let mut headers = HeaderMap::new();
        let request = || CacheRequest {
            org: Some("body-org".to_string()),
            cache_name: "sessions".to_string(),
            key: "a".to_string(),
            ttl_seconds: None,
            value: b"x".to_vec(),
        };
        assert_eq!(set_command(&headers, request()).org.as_deref(), Some("body-org"));

        headers.insert("x-org", HeaderValue::from_static("header-org"));
        assert_eq!(set_command(&headers, request()).org.as_deref(), Some("header-org"));
    }
}
