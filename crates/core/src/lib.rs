//! Core domain types for the localbase embedded data engine.
//!
//! This crate holds what every other crate agrees on: the error taxonomy,
//! configuration structs, and the sync domain model. It has no storage or
//! network dependencies.

pub mod config;
pub mod errors;
pub mod sync;

pub use errors::{Error, Result};
