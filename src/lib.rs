//! keystash: a multi-tenant chunked object cache.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod projection;
pub mod util;
