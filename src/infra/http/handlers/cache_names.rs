use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use keystash_api_types::{CacheGetKeysResponse, CacheNameRequest, CacheNameResponse, DeletionAccepted};

use crate::domain::cache_name::CacheNameRecord;

use super::{cache_name_to_api, cache_to_api};
use crate::infra::http::error::ApiError;
use crate::infra::http::state::HttpState;

fn record_to_response(record: CacheNameRecord) -> CacheNameResponse {
    CacheNameResponse {
        cache_name: record.cache_name,
        description: record.description,
    }
}

pub async fn create_cache_name(
    State(state): State<HttpState>,
    Json(payload): Json<CacheNameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .cache
        .names()
        .create(&payload.cache_name, payload.description)
        .await
        .map_err(cache_name_to_api)?;

    Ok((StatusCode::CREATED, Json(record_to_response(record))))
}

pub async fn update_cache_name(
    State(state): State<HttpState>,
    Json(payload): Json<CacheNameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .cache
        .names()
        .update(&payload.cache_name, payload.description)
        .await
        .map_err(cache_name_to_api)?;

    Ok((StatusCode::ACCEPTED, Json(record_to_response(record))))
}

pub async fn get_cache_name(
    State(state): State<HttpState>,
    Path(cache_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .cache
        .names()
        .get(&cache_name)
        .await
        .map_err(cache_name_to_api)?;

    Ok(Json(record_to_response(record)))
}

/// Remove every key and then the record itself.
pub async fn delete_cache_name(
    State(state): State<HttpState>,
    Path(cache_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state
        .cache
        .delete_all(&cache_name)
        .await
        .map_err(cache_to_api)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionAccepted {
            job_id,
            cache_name,
            flush_only: false,
        }),
    ))
}

/// Remove every key, keeping the record.
pub async fn flush_cache_name(
    State(state): State<HttpState>,
    Path(cache_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.cache.flush(&cache_name).await.map_err(cache_to_api)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionAccepted {
            job_id,
            cache_name,
            flush_only: true,
        }),
    ))
}

pub async fn list_cache_keys(
    State(state): State<HttpState>,
    Path(cache_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let keys = state.cache.keys(&cache_name).await.map_err(cache_to_api)?;

    Ok(Json(CacheGetKeysResponse { cache_name, keys }))
}
