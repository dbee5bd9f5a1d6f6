//! Route handlers grouped by resource.
//!
//! Service errors are translated to [`ApiError`] here so every handler maps
//! the same failure to the same status and code.

mod cache;
mod cache_names;
mod deletions;
mod health;
mod usage;

pub use cache::*;
pub use cache_names::*;
pub use deletions::*;
pub use health::*;
pub use usage::*;

use axum::http::StatusCode;

use crate::application::bulk_delete::WorkflowError;
use crate::application::cache::CacheServiceError;
use crate::application::cache_names::CacheNameError;
use crate::application::repos::RepoError;
use crate::application::splitter::SplitError;
use crate::domain::error::DomainError;

use super::error::{ApiError, codes};

pub(crate) fn repo_to_api(err: RepoError) -> ApiError {
    match err {
        RepoError::Duplicate { constraint } => ApiError::new(
            StatusCode::CONFLICT,
            codes::DUPLICATE,
            "Duplicate record",
            Some(constraint),
        ),
        RepoError::NotFound => ApiError::not_found("resource not found", None),
        RepoError::InvalidInput { message } => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid input",
            Some(message),
        ),
        RepoError::Integrity { message } => ApiError::new(
            StatusCode::CONFLICT,
            codes::INTEGRITY,
            "Integrity constraint violated",
            Some(message),
        ),
        RepoError::Timeout => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::DB_TIMEOUT,
            "Database timeout",
            None,
        ),
        RepoError::Persistence(msg) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::REPO,
            "Persistence error",
            Some(msg),
        ),
    }
}

fn domain_to_api(err: DomainError) -> ApiError {
    match err {
        DomainError::NotFound { id, .. } => ApiError::not_found("resource not found", Some(id)),
        DomainError::Validation { message } => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid input",
            Some(message),
        ),
        DomainError::Invariant { message } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INTEGRITY,
            "Invariant violated",
            Some(message),
        ),
    }
}

pub(crate) fn cache_name_to_api(err: CacheNameError) -> ApiError {
    match err {
        CacheNameError::NotFound(name) => ApiError::new(
            StatusCode::NOT_FOUND,
            codes::CACHE_NAME_NOT_FOUND,
            "Cache name not found",
            Some(name),
        ),
        CacheNameError::Domain(err) => domain_to_api(err),
        CacheNameError::Repo(err) => repo_to_api(err),
    }
}

pub(crate) fn workflow_to_api(err: WorkflowError) -> ApiError {
    match err {
        WorkflowError::NotFound(job_id) => {
            ApiError::not_found("deletion job not found", Some(job_id.to_string()))
        }
        WorkflowError::CacheName(err) => cache_name_to_api(err),
        WorkflowError::Repo(err) => repo_to_api(err),
    }
}

pub(crate) fn cache_to_api(err: CacheServiceError) -> ApiError {
    match err {
        CacheServiceError::NotFound(id) => {
            ApiError::not_found("cache entry not found", Some(id))
        }
        CacheServiceError::CacheNameNotFound(name) => {
            cache_name_to_api(CacheNameError::NotFound(name))
        }
        CacheServiceError::Invalid(message) => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Invalid input",
            Some(message),
        ),
        CacheServiceError::QuotaExceeded { org, limit } => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::QUOTA_EXCEEDED,
            "Tenant exceeded its cached byte allotment",
            Some(format!("org `{org}` is over {limit} bytes")),
        ),
        CacheServiceError::Incomplete { id, reason } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::INCOMPLETE_PAYLOAD,
            "Cached payload could not be reassembled",
            Some(format!("{id}: {reason}")),
        ),
        CacheServiceError::Split(SplitError::TooLarge(size)) => ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            codes::PAYLOAD_TOO_LARGE,
            "Payload too large",
            Some(format!("{size} bytes")),
        ),
        CacheServiceError::Split(err) => ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_INPUT,
            "Payload could not be stored",
            Some(err.to_string()),
        ),
        CacheServiceError::Workflow(err) => workflow_to_api(err),
        CacheServiceError::Repo(err) => repo_to_api(err),
    }
}
