//! Domain layer types and invariants.

pub mod cache_name;
pub mod deletion;
pub mod entry;
pub mod error;
pub mod usage;
