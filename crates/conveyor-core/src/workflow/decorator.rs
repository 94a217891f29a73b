//! Step decorators: cross-cutting behavior wrapped around every step.
//!
//! A `DecoratorFactory` maps a step to a wrapped step. Run options carry an
//! ordered list of factories; the builder applies them once, at build time,
//! to every top-level step. Factories compose left to right, so the last
//! factory in the list produces the outermost wrapper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor_types::error::StepError;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;
use super::step::{BoxStep, Step, StepCapabilities, StepOutput};

/// Wraps a step in another step.
pub type DecoratorFactory = Arc<dyn Fn(BoxStep) -> BoxStep + Send + Sync>;

/// Logic that runs around a step without changing it.
pub trait StepDecorator: Send + Sync + 'static {
    /// Runs before the step; an error here fails the step without running it.
    fn before(&self, _step: &str, _ctx: &mut WorkflowContext) -> Result<(), StepError> {
        Ok(())
    }

    /// Runs after the step with its outcome and wall-clock duration.
    fn after(
        &self,
        _step: &str,
        _ctx: &mut WorkflowContext,
        _outcome: &Result<StepOutput, StepError>,
        _elapsed: Duration,
    ) {
    }
}

/// A step wrapped by a decorator. Compensation is forwarded untouched.
pub struct Decorated {
    inner: BoxStep,
    decorator: Arc<dyn StepDecorator>,
}

impl Decorated {
    pub fn new(inner: BoxStep, decorator: Arc<dyn StepDecorator>) -> Self {
        Self { inner, decorator }
    }
}

impl Step for Decorated {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> StepCapabilities {
        self.inner.capabilities()
    }

    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        self.decorator.before(self.inner.name(), ctx)?;
        let started = Instant::now();
        let outcome = self.inner.execute(ctx, cancel).await;
        self.decorator
            .after(self.inner.name(), ctx, &outcome, started.elapsed());
        outcome
    }

    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        self.inner.compensate(ctx, cancel).await
    }
}

/// Factory wrapping every step with `decorator`.
pub fn decorate_with<D: StepDecorator>(decorator: D) -> DecoratorFactory {
    let decorator: Arc<dyn StepDecorator> = Arc::new(decorator);
    Arc::new(move |step| BoxStep::new(Decorated::new(step, decorator.clone())))
}

/// Apply `factories` in order to every step.
pub fn apply_decorators(steps: Vec<BoxStep>, factories: &[DecoratorFactory]) -> Vec<BoxStep> {
    if factories.is_empty() {
        return steps;
    }
    steps
        .into_iter()
        .map(|step| factories.iter().fold(step, |step, factory| factory(step)))
        .collect()
}

// ---------------------------------------------------------------------------
// Provided decorators
// ---------------------------------------------------------------------------

/// Logs every step's duration and outcome at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingDecorator;

impl StepDecorator for TimingDecorator {
    fn after(
        &self,
        step: &str,
        ctx: &mut WorkflowContext,
        outcome: &Result<StepOutput, StepError>,
        elapsed: Duration,
    ) {
        tracing::debug!(
            run_id = ?ctx.run_id(),
            step,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "Step finished"
        );
    }
}

/// Fails any step that starts while one of `keys` is missing from the context.
#[derive(Debug, Clone)]
pub struct RequireKeys {
    keys: Vec<String>,
}

impl RequireKeys {
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl StepDecorator for RequireKeys {
    fn before(&self, step: &str, ctx: &mut WorkflowContext) -> Result<(), StepError> {
        match self.keys.iter().find(|key| !ctx.contains(key)) {
            Some(missing) => Err(StepError::new(
                "validation",
                format!("step '{step}' requires context value '{missing}'"),
            )),
            None => Ok(()),
        }
    }
}
