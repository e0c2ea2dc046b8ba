//! Sync domain models and helpers.

mod sync_model;
mod sync_scheduler;

pub use sync_model::*;
pub use sync_scheduler::*;
