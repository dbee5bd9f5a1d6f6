//! Application services layer.

pub mod bulk_delete;
pub mod cache;
pub mod cache_names;
pub mod error;
pub mod expiry;
pub mod jobs;
pub mod repos;
pub mod splitter;
pub mod store;
