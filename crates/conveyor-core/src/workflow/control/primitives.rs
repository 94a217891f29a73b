//! Small control steps: delay, stop, throw, conditional throw and
//! sub-workflow continuation.

use std::sync::Arc;
use std::time::Duration;

use conveyor_types::error::StepError;
use tokio_util::sync::CancellationToken;

use crate::workflow::builder::WorkflowDefinition;
use crate::workflow::context::WorkflowContext;
use crate::workflow::node::Predicate;
use crate::workflow::options::{RunEnvironment, RunHandle};
use crate::workflow::runtime::Workflow;
use crate::workflow::step::{Step, StepCapabilities, StepOutput};

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Waits for a fixed duration; cancellable.
#[derive(Debug, Clone, Copy)]
pub struct Delay {
    duration: Duration,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Step for Delay {
    async fn execute(
        &mut self,
        _ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(self.duration) => Ok(StepOutput::Empty),
        }
    }
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

/// Asks the run it executes in to end after this step.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stop;

impl Step for Stop {
    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        match ctx.singleton::<RunHandle>() {
            Some(handle) => handle.request_stop(),
            None => tracing::warn!("Stop executed outside a workflow run, ignoring"),
        }
        Ok(StepOutput::Empty)
    }
}

// ---------------------------------------------------------------------------
// Throw / ThrowIf
// ---------------------------------------------------------------------------

/// Always fails with the configured error.
#[derive(Debug, Clone)]
pub struct Throw {
    error: StepError,
}

impl Throw {
    pub fn new(error: StepError) -> Self {
        Self { error }
    }
}

impl Step for Throw {
    async fn execute(
        &mut self,
        _ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        Err(self.error.clone())
    }
}

pub struct ThrowIf {
    predicate: Predicate,
    error: StepError,
}

impl ThrowIf {
    pub fn new<P>(predicate: P, error: StepError) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            error,
        }
    }
}

impl Step for ThrowIf {
    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        if (self.predicate)(ctx) {
            return Err(self.error.clone());
        }
        Ok(StepOutput::Empty)
    }
}

// ---------------------------------------------------------------------------
// SubWorkflow
// ---------------------------------------------------------------------------

/// Runs a fresh instance of a definition on the shared context and
/// compensates it when the enclosing run unwinds.
pub struct SubWorkflow {
    definition: WorkflowDefinition,
    completed: Option<Workflow>,
}

impl SubWorkflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            completed: None,
        }
    }
}

impl Step for SubWorkflow {
    fn name(&self) -> &str {
        self.definition.name()
    }

    fn capabilities(&self) -> StepCapabilities {
        StepCapabilities {
            compensable: true,
            ..StepCapabilities::default()
        }
    }

    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        self.completed = None;
        let mut workflow = self.definition.build_in(RunEnvironment::current(ctx))?;
        workflow.run_in(ctx, cancel).await?;
        self.completed = Some(workflow);
        Ok(StepOutput::Empty)
    }

    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        match self.completed.as_mut() {
            Some(workflow) => workflow.compensate_completed(ctx, cancel).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::error::WorkflowError;

    #[tokio::test]
    async fn delay_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Delay::new(Duration::from_secs(60))
            .execute(&mut WorkflowContext::new(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn throw_returns_configured_error() {
        let err = Throw::new(StepError::new("policy", "denied"))
            .execute(&mut WorkflowContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "policy");
    }

    #[tokio::test]
    async fn stop_inside_nested_run_ends_only_that_run() {
        let inner = WorkflowDefinition::new("inner", |b| {
            b.stop().throw(StepError::msg("after stop"));
        });
        let ctx = crate::workflow::builder::WorkflowBuilder::new("outer")
            .sub_workflow(&inner)
            .then_fn("outer-after", |ctx| {
                ctx.set("outer_continued", true)?;
                Ok(StepOutput::Empty)
            })
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert!(ctx.get::<bool>("outer_continued").unwrap());
    }

    #[tokio::test]
    async fn failed_sub_workflow_surfaces_as_nested_error() {
        let inner = WorkflowDefinition::new("inner", |b| {
            b.throw(StepError::new("payment", "declined"));
        });
        let mut step = SubWorkflow::new(inner);
        assert_eq!(step.name(), "inner");

        let err = step
            .execute(&mut WorkflowContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            StepError::Nested(inner) => {
                assert!(matches!(*inner, WorkflowError::StepFailed { .. }))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
