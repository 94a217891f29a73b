//! `StepNode`: the base wrapper every builder-added step runs inside.
//!
//! A node executes its inner step in this order:
//! 1. skip check (a skipped step records no input and no output)
//! 2. last-output propagation into the step's input slot
//! 3. before-run hooks, which bind context values into the step
//! 4. the step body, through the attached retry policy if any
//! 5. output recording into the step's output slot and the last output
//! 6. after-run hooks, which extract step state back into the context
//!
//! Compensation runs only if the body completed, using the attached
//! compensation step when one was given and the inner step's own
//! `compensate` otherwise.

use std::sync::Arc;

use conveyor_types::error::StepError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::context::{WorkflowContext, step_key};
use super::retry::{RetryPolicy, execute_with_retry};
use super::step::{BoxStep, Step, StepCapabilities, StepOutput};

pub type BeforeHook<S> = Box<dyn Fn(&mut S, &WorkflowContext) -> Result<(), StepError> + Send + Sync>;
pub type AfterHook<S> = Box<dyn Fn(&S, &mut WorkflowContext) -> Result<(), StepError> + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// Step wrapper adding skip, hooks, retry and compensation.
pub struct StepNode<S> {
    inner: S,
    key: &'static str,
    name: Option<String>,
    before: Vec<BeforeHook<S>>,
    after: Vec<AfterHook<S>>,
    skip_if: Option<Predicate>,
    retry: Option<Arc<dyn RetryPolicy>>,
    compensation: Option<BoxStep>,
    executed: bool,
}

impl<S: Step> StepNode<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            key: step_key::<S>(),
            name: None,
            before: Vec::new(),
            after: Vec::new(),
            skip_if: None,
            retry: None,
            compensation: None,
            executed: false,
        }
    }

    /// Override the display name.
    pub fn named(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn before<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&mut S, &WorkflowContext) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.before.push(Box::new(hook));
        self
    }

    pub fn after<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&S, &mut WorkflowContext) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.after.push(Box::new(hook));
        self
    }

    /// Read `key` from the context before each run and hand it to `bind`.
    pub fn bind_input<T, F>(&mut self, key: impl Into<String>, bind: F) -> &mut Self
    where
        T: DeserializeOwned,
        F: Fn(&mut S, T) + Send + Sync + 'static,
    {
        let key = key.into();
        self.before(move |step, ctx| {
            let value: T = ctx.get(&key)?;
            bind(step, value);
            Ok(())
        })
    }

    /// Write `extract(step)` to the context under `key` after each run.
    pub fn bind_output<T, F>(&mut self, key: impl Into<String>, extract: F) -> &mut Self
    where
        T: Serialize,
        F: Fn(&S) -> T + Send + Sync + 'static,
    {
        let key = key.into();
        self.after(move |step, ctx| {
            ctx.set(key.clone(), extract(step))?;
            Ok(())
        })
    }

    pub fn skip_if<F>(&mut self, predicate: F) -> &mut Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Arc::new(predicate));
        self
    }

    pub fn retry(&mut self, policy: impl RetryPolicy + 'static) -> &mut Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn retry_shared(&mut self, policy: Arc<dyn RetryPolicy>) -> &mut Self {
        self.retry = Some(policy);
        self
    }

    pub fn has_retry(&self) -> bool {
        self.retry.is_some()
    }

    /// Run `step` to undo this one if the run later fails.
    pub fn compensate_with<C: Step>(&mut self, step: C) -> &mut Self {
        self.compensation = Some(BoxStep::new(step));
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Whether the body ran to completion and has not been compensated since.
    pub fn executed(&self) -> bool {
        self.executed
    }
}

impl<S: Step> Step for StepNode<S> {
    fn name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.inner.name(),
        }
    }

    fn capabilities(&self) -> StepCapabilities {
        StepCapabilities {
            compensable: self.compensation.is_some() || self.inner.capabilities().compensable,
            retryable: true,
            skippable: true,
        }
    }

    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        self.executed = false;

        if let Some(skip) = &self.skip_if {
            if skip(ctx) {
                tracing::debug!(step = self.name(), "Skip predicate matched, step bypassed");
                return Ok(StepOutput::Empty);
            }
        }

        if let Some(previous) = ctx.last_output().cloned() {
            ctx.set_input(self.key, previous);
        }

        for hook in &self.before {
            hook(&mut self.inner, ctx)?;
        }

        let output = execute_with_retry(&mut self.inner, self.retry.as_deref(), ctx, cancel).await?;
        self.executed = true;

        if let StepOutput::Value(value) = &output {
            ctx.set_output(self.key, value.clone());
            ctx.set_last_output(value.clone());
        }

        for hook in &self.after {
            hook(&self.inner, ctx)?;
        }

        Ok(output)
    }

    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if !self.executed {
            return Ok(());
        }
        self.executed = false;

        match &mut self.compensation {
            Some(step) => step.execute(ctx, cancel).await.map(|_| ()),
            None => self.inner.compensate(ctx, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::retry::FixedDelay;
    use crate::workflow::step::FnStep;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Multiply {
        factor: i64,
        result: i64,
    }

    impl Step for Multiply {
        async fn execute(
            &mut self,
            ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            let input: i64 = ctx.last_output_as()?;
            self.result = input * self.factor;
            Ok(StepOutput::Value(json!(self.result)))
        }
    }

    struct Counting(Arc<AtomicU32>);

    impl Step for Counting {
        async fn execute(
            &mut self,
            _ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StepError::msg("always fails"))
        }
    }

    #[tokio::test]
    async fn records_input_output_and_last_output() {
        let mut node = StepNode::new(Multiply { factor: 3, result: 0 });
        let mut ctx = WorkflowContext::new().with_input(json!(5));

        node.execute(&mut ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(ctx.input_of::<Multiply>(), Some(&json!(5)));
        assert_eq!(ctx.output_of::<Multiply>(), Some(&json!(15)));
        assert_eq!(ctx.last_output(), Some(&json!(15)));
        assert!(node.executed());
    }

    #[tokio::test]
    async fn hooks_bind_input_and_output() {
        let mut node = StepNode::new(Multiply::default());
        node.bind_input("factor", |step: &mut Multiply, factor: i64| step.factor = factor)
            .bind_output("product", |step: &Multiply| step.result);

        let mut ctx = WorkflowContext::new().with_input(json!(4));
        ctx.set("factor", 10).unwrap();

        node.execute(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.get::<i64>("product").unwrap(), 40);
    }

    #[tokio::test]
    async fn missing_bound_input_fails_before_body() {
        let mut node = StepNode::new(Multiply::default());
        node.bind_input("factor", |step: &mut Multiply, factor: i64| step.factor = factor);
        let mut ctx = WorkflowContext::new().with_input(json!(4));

        let err = node.execute(&mut ctx, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), "context");
        assert!(ctx.output_of::<Multiply>().is_none());
        assert!(!node.executed());
    }

    #[tokio::test]
    async fn skipped_step_writes_nothing() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut node = StepNode::new(FnStep::new("never", move |_ctx: &mut WorkflowContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::Value(json!("ran")))
        }));
        node.skip_if(|ctx| ctx.contains("skip"));

        let mut ctx = WorkflowContext::new().with_input(json!("seed"));
        ctx.set("skip", true).unwrap();
        let output = node.execute(&mut ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(output, StepOutput::Empty);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.last_output(), Some(&json!("seed")));
        assert!(ctx.input(node.key).is_none());
        assert!(ctx.output(node.key).is_none());
    }

    #[tokio::test]
    async fn retry_policy_wraps_body() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut node = StepNode::new(Counting(calls.clone()));
        node.retry(FixedDelay::new(3, Duration::from_millis(1)));

        let result = node
            .execute(&mut WorkflowContext::new(), &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(node.capabilities().retryable);
    }

    #[tokio::test]
    async fn compensation_only_after_execution() {
        let mut node = StepNode::new(Multiply { factor: 2, result: 0 });
        node.compensate_with(FnStep::new("undo", |ctx: &mut WorkflowContext| {
            ctx.set("undone", true)?;
            Ok(StepOutput::Empty)
        }));
        assert!(node.capabilities().compensable);

        let cancel = CancellationToken::new();
        let mut ctx = WorkflowContext::new().with_input(json!(1));

        node.compensate(&mut ctx, &cancel).await.unwrap();
        assert!(!ctx.contains("undone"));

        node.execute(&mut ctx, &cancel).await.unwrap();
        node.compensate(&mut ctx, &cancel).await.unwrap();
        assert!(ctx.get::<bool>("undone").unwrap());
    }

    #[test]
    fn test_named_overrides_type_name() {
        let mut node = StepNode::new(Multiply::default());
        assert_eq!(node.name(), "Multiply");
        node.named("triple");
        assert_eq!(node.name(), "triple");
    }
}
