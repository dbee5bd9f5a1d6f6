use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use keystash_api_types::TenantUsageResponse;

use super::cache_to_api;
use crate::infra::http::error::ApiError;
use crate::infra::http::state::HttpState;

pub async fn get_usage(
    State(state): State<HttpState>,
    Path(org): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let usage = state.cache.usage(&org).await.map_err(cache_to_api)?;

    Ok(Json(TenantUsageResponse {
        org: usage.org,
        cache_count: usage.cache_count,
        total_bytes_cached: usage.total_bytes_cached,
    }))
}

pub async fn reset_usage(
    State(state): State<HttpState>,
    Path(org): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.cache.reset_usage(&org).await.map_err(cache_to_api)?;
    Ok(StatusCode::NO_CONTENT)
}
