//! Workflow execution engine for Conveyor.
//!
//! This crate owns everything that runs: the context store, the step
//! contract, the builder, the runtime and the control-flow steps. It depends
//! only on `conveyor-types` for shared data and never on logging sinks or the
//! CLI.

pub mod config;
pub mod event;
pub mod workflow;
