//! Attribute names for workflow runs.
//!
//! Used as keys in structured run reports so JSON output and exported spans
//! agree on naming.

// --- Run attributes ---

/// Name of the workflow being run.
pub const WORKFLOW_NAME: &str = "conveyor.workflow.name";

/// Unique id of a run (UUIDv7).
pub const RUN_ID: &str = "conveyor.run.id";

/// Final state of a run (`completed`, `error_handled`, ...).
pub const RUN_STATE: &str = "conveyor.run.state";

/// Wall-clock duration of a run in milliseconds.
pub const RUN_DURATION_MS: &str = "conveyor.run.duration_ms";

// --- Step attributes ---

/// Number of steps in the built workflow.
pub const STEP_COUNT: &str = "conveyor.step.count";

/// Display name of a step.
pub const STEP_NAME: &str = "conveyor.step.name";

// --- Outcome ---

/// Error message of a failed run.
pub const ERROR_MESSAGE: &str = "conveyor.error.message";

/// Context contents after the run.
pub const CONTEXT: &str = "conveyor.context";
