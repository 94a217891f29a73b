//! Step contract and its object-safe wrapper.
//!
//! Follows the blanket-impl pattern used for every async trait object in the
//! engine:
//! 1. `Step` uses return-position `impl Future` for its async methods
//! 2. `StepDyn` is an object-safe mirror with boxed futures, blanket-implemented
//!    for every `T: Step`
//! 3. `BoxStep` wraps `Box<dyn StepDyn>` and implements `Step` again, so boxed
//!    and concrete steps compose freely

use std::future::Future;

use conveyor_types::error::StepError;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;

/// Capabilities a step opts into explicitly.
///
/// The runtime consults these flags instead of inspecting step types, e.g. it
/// only calls `compensate` on steps that declare `compensable`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCapabilities {
    pub compensable: bool,
    pub retryable: bool,
    pub skippable: bool,
}

/// What a step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StepOutput {
    /// Nothing; the last-output slot is left untouched.
    #[default]
    Empty,
    /// Recorded as the step's output and as the run's last output.
    Value(Value),
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// A unit of work executed against the workflow context.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
/// Implementors can write `async fn execute(...)` directly.
pub trait Step: Send + 'static {
    /// Display name used in logs, listener events and errors.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn capabilities(&self) -> StepCapabilities {
        StepCapabilities::default()
    }

    /// Run the step. Long-running work should observe `cancel`.
    fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;

    /// Reverse a completed execution. Only called when `capabilities()`
    /// reports `compensable`.
    fn compensate(
        &mut self,
        _ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Ok(()) }
    }
}

/// Strip module paths and generic arguments from a type name.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

/// Object-safe version of [`Step`] with boxed futures.
///
/// This trait exists solely to enable `dyn StepDyn`. A blanket implementation
/// is provided for all types implementing `Step`.
pub trait StepDyn: Send {
    fn name_dyn(&self) -> &str;

    fn capabilities_dyn(&self) -> StepCapabilities;

    fn execute_boxed<'a>(
        &'a mut self,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepOutput, StepError>>;

    fn compensate_boxed<'a>(
        &'a mut self,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), StepError>>;
}

impl<T: Step> StepDyn for T {
    fn name_dyn(&self) -> &str {
        Step::name(self)
    }

    fn capabilities_dyn(&self) -> StepCapabilities {
        Step::capabilities(self)
    }

    fn execute_boxed<'a>(
        &'a mut self,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepOutput, StepError>> {
        Box::pin(self.execute(ctx, cancel))
    }

    fn compensate_boxed<'a>(
        &'a mut self,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(self.compensate(ctx, cancel))
    }
}

/// Type-erased step, the element type of every step list.
pub struct BoxStep(Box<dyn StepDyn>);

impl BoxStep {
    pub fn new<S: Step>(step: S) -> Self {
        Self(Box::new(step))
    }
}

impl Step for BoxStep {
    fn name(&self) -> &str {
        self.0.name_dyn()
    }

    fn capabilities(&self) -> StepCapabilities {
        self.0.capabilities_dyn()
    }

    fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send {
        async move { self.0.execute_boxed(ctx, cancel).await }
    }

    fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), StepError>> + Send {
        async move { self.0.compensate_boxed(ctx, cancel).await }
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxStep").field(&self.0.name_dyn()).finish()
    }
}

// ---------------------------------------------------------------------------
// FnStep
// ---------------------------------------------------------------------------

/// A named step backed by a synchronous closure.
pub struct FnStep<F> {
    name: String,
    func: F,
}

impl<F> FnStep<F>
where
    F: FnMut(&mut WorkflowContext) -> Result<StepOutput, StepError> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Step for FnStep<F>
where
    F: FnMut(&mut WorkflowContext) -> Result<StepOutput, StepError> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send {
        std::future::ready((self.func)(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Step for Echo {
        async fn execute(
            &mut self,
            ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            Ok(ctx.last_output().cloned().map(StepOutput::Value).unwrap_or_default())
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("a::b::Deploy"), "Deploy");
        assert_eq!(short_type_name("a::StepNode<b::Deploy>"), "StepNode");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_default_name_and_capabilities() {
        let step = Echo;
        assert_eq!(Step::name(&step), "Echo");
        assert_eq!(Step::capabilities(&step), StepCapabilities::default());
    }

    #[tokio::test]
    async fn box_step_delegates_execution() {
        let mut step = BoxStep::new(Echo);
        let mut ctx = WorkflowContext::new().with_input(json!("hi"));
        let cancel = CancellationToken::new();

        let output = step.execute(&mut ctx, &cancel).await.unwrap();
        assert_eq!(output, StepOutput::Value(json!("hi")));
        assert_eq!(step.name(), "Echo");
        assert!(step.compensate(&mut ctx, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn fn_step_runs_closure() {
        let mut step = FnStep::new("bump", |ctx: &mut WorkflowContext| {
            let n = ctx.try_get::<i32>("n").unwrap_or(0);
            ctx.set("n", n + 1)?;
            Ok(StepOutput::Empty)
        });
        let mut ctx = WorkflowContext::new();
        let cancel = CancellationToken::new();

        step.execute(&mut ctx, &cancel).await.unwrap();
        step.execute(&mut ctx, &cancel).await.unwrap();
        assert_eq!(ctx.get::<i32>("n").unwrap(), 2);
        assert_eq!(step.name(), "bump");
    }
}
