//! Workflow engine core: steps, builder, runtime and control flow.
//!
//! - `context` -- Per-run data store passed to every step
//! - `step` -- Step contract, boxed dispatch and closure steps
//! - `node` -- Base step wrapper: skip, hooks, retry, compensation
//! - `decorator` -- Cross-cutting step wrappers applied at build time
//! - `retry` -- Fixed, kind-filtered and exponential retry policies
//! - `template` -- Default and named per-step-type configuration
//! - `builder` -- Fluent assembly of the step list
//! - `queue` -- Reversible step queue used for compensation
//! - `runtime` -- The run state machine
//! - `options` -- Run-wide options and the run handle
//! - `listener` -- Lifecycle notifications
//! - `fork_tracker` -- Joins fire-and-forget fork branches
//! - `control` -- Conditional, switch, loop, fork and primitive steps

pub mod builder;
pub mod context;
pub mod control;
pub mod decorator;
pub mod fork_tracker;
pub mod listener;
pub mod node;
pub mod options;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod step;
pub mod template;

pub use builder::{Recipe, WorkflowBuilder, WorkflowDefinition};
pub use context::WorkflowContext;
pub use node::StepNode;
pub use options::{RunHandle, RunOptions};
pub use runtime::{CapturedFailure, Workflow};
pub use step::{BoxStep, FnStep, Step, StepCapabilities, StepOutput};
