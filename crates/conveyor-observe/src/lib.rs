//! Observability for Conveyor: subscriber setup and lifecycle logging.
//!
//! - `tracing_setup` -- Global subscriber with optional OpenTelemetry export
//! - `attrs` -- Attribute names used in structured run reports
//! - `listener` -- `WorkflowListener` that logs every lifecycle event

pub mod attrs;
pub mod listener;
pub mod tracing_setup;
