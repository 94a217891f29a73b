//! Shared types for the Conveyor workflow engine.
//!
//! This crate holds the plain data that crosses crate boundaries: the error
//! taxonomy, run/step event records, run states and engine configuration.
//!
//! Zero runtime dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
