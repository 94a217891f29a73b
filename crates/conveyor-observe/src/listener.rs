//! Lifecycle logging through `tracing`.

use conveyor_core::workflow::listener::WorkflowListener;
use conveyor_types::error::WorkflowError;
use conveyor_types::event::{RunInfo, StepInfo};

/// Logs run events at `info` and step events at `debug`; failures at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl WorkflowListener for TracingListener {
    fn on_run_started(&self, run: &RunInfo) {
        tracing::info!(
            run_id = %run.run_id,
            parent_run_id = ?run.parent_run_id,
            workflow = %run.workflow,
            "Run started"
        );
    }

    fn on_run_completed(&self, run: &RunInfo) {
        tracing::info!(run_id = %run.run_id, workflow = %run.workflow, "Run completed");
    }

    fn on_run_failed(&self, run: &RunInfo, error: &WorkflowError) {
        tracing::warn!(
            run_id = %run.run_id,
            workflow = %run.workflow,
            error = %error,
            "Run failed"
        );
    }

    fn on_step_started(&self, step: &StepInfo) {
        tracing::debug!(run_id = %step.run_id, index = step.index, step = %step.name, "Step started");
    }

    fn on_step_completed(&self, step: &StepInfo) {
        tracing::debug!(run_id = %step.run_id, index = step.index, step = %step.name, "Step completed");
    }

    fn on_step_failed(&self, step: &StepInfo, error: &WorkflowError) {
        tracing::warn!(
            run_id = %step.run_id,
            index = step.index,
            step = %step.name,
            error = %error,
            "Step failed"
        );
    }
}
