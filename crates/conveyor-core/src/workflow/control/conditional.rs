//! When / if-else branching on a context predicate.

use std::sync::Arc;

use conveyor_types::error::StepError;
use tokio_util::sync::CancellationToken;

use crate::workflow::context::WorkflowContext;
use crate::workflow::node::Predicate;
use crate::workflow::step::{BoxStep, Step, StepCapabilities, StepOutput};

/// Runs `then_step` when the predicate holds, otherwise `else_step` if any.
pub struct Conditional {
    predicate: Predicate,
    then_step: BoxStep,
    else_step: Option<BoxStep>,
}

impl Conditional {
    pub fn new<P>(predicate: P, then_step: BoxStep, else_step: Option<BoxStep>) -> Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            then_step,
            else_step,
        }
    }
}

impl Step for Conditional {
    fn capabilities(&self) -> StepCapabilities {
        let else_compensable = self
            .else_step
            .as_ref()
            .is_some_and(|step| step.capabilities().compensable);
        StepCapabilities {
            compensable: self.then_step.capabilities().compensable || else_compensable,
            ..StepCapabilities::default()
        }
    }

    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let taken = (self.predicate)(ctx);
        tracing::debug!(branch = if taken { "then" } else { "else" }, "Condition evaluated");
        if taken {
            return self.then_step.execute(ctx, cancel).await;
        }
        match self.else_step.as_mut() {
            Some(step) => step.execute(ctx, cancel).await,
            None => Ok(StepOutput::Empty),
        }
    }

    /// Re-evaluates the predicate and compensates the selected branch. The
    /// branch node only compensates if it actually ran.
    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if (self.predicate)(ctx) {
            return self.then_step.compensate(ctx, cancel).await;
        }
        match self.else_step.as_mut() {
            Some(step) => step.compensate(ctx, cancel).await,
            None => Ok(()),
        }
    }
}
