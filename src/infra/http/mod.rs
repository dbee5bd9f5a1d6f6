//! HTTP adapter over the cache service.

pub mod error;
mod handlers;
mod middleware;
mod state;

pub use middleware::{REQUEST_ID_HEADER, RequestContext};
pub use state::{HttpState, ORG_HEADER};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use sqlx::Error as SqlxError;

use crate::application::error::ErrorReport;

use middleware::{log_responses, set_request_context};

pub fn build_router(state: HttpState, max_request_bytes: usize) -> Router {
    let cache_names = Router::new()
        .route(
            "/cache-names",
            post(handlers::create_cache_name).put(handlers::update_cache_name),
        )
        .route(
            "/cache-names/{cache_name}",
            get(handlers::get_cache_name).delete(handlers::delete_cache_name),
        )
        .route("/cache-names/{cache_name}/flush", put(handlers::flush_cache_name))
        .route("/cache-names/{cache_name}/keys", get(handlers::list_cache_keys));

    let cache = Router::new()
        .route(
            "/cache/{cache_name}/{key}",
            post(handlers::set_binary)
                .get(handlers::get_binary)
                .delete(handlers::delete_entry),
        )
        .route(
            "/cache/{cache_name}/{key}/{ttl_seconds}",
            post(handlers::set_binary_with_ttl),
        )
        .route("/set", post(handlers::set_json))
        .route("/get/{cache_name}/{key}", get(handlers::get_json))
        .route(
            "/batch",
            post(handlers::batch_set).delete(handlers::batch_delete),
        )
        .route("/batch/get", post(handlers::batch_get));

    let operations = Router::new()
        .route("/orgs/{org}/usage", get(handlers::get_usage))
        .route("/orgs/{org}/usage/reset", post(handlers::reset_usage))
        .route("/deletions/{job_id}", get(handlers::get_deletion_job))
        .route("/health", get(handlers::health));

    cache_names
        .merge(cache)
        .merge(operations)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
