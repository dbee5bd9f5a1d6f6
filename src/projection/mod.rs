//! Eventually consistent read models fed by store events.

pub mod config;
pub mod consumer;
pub mod events;
pub mod ledger;
pub mod planner;

pub use config::ProjectionConfig;
pub use consumer::ProjectionConsumer;
pub use events::{Epoch, EventKind, EventQueue, StoreEvent};
pub use ledger::UsageLedger;
pub use planner::{IndexAction, ProjectionPlan};
