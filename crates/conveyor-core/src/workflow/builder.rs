//! Fluent workflow assembly.
//!
//! Every step added through the builder is wrapped in a [`StepNode`]. The
//! default template registered for its type is applied, and so is the
//! run-wide default retry policy if one is set. Control-flow composites take
//! [`Recipe`]s, builder closures that are replayed each time the composite
//! needs a fresh nested workflow.
//!
//! Misuse such as an out-of-range list edit or a missing named template is
//! recorded and surfaces as a configuration error from [`WorkflowBuilder::build`].

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use conveyor_types::error::{StepError, WorkflowError};
use conveyor_types::workflow::ForkStrategy;
use serde_json::Value;

use super::context::WorkflowContext;
use super::control::{
    Conditional, Delay, ForEach, Fork, ForkBranches, LoopBody, Stop, SubWorkflow, Switch,
    SwitchCases, Throw, ThrowIf,
};
use super::decorator::{DecoratorFactory, StepDecorator, apply_decorators, decorate_with};
use super::fork_tracker::ForkTracker;
use super::listener::WorkflowListener;
use super::node::StepNode;
use super::options::{RunEnvironment, RunOptions};
use super::retry::RetryPolicy;
use super::runtime::Workflow;
use super::step::{BoxStep, FnStep, Step, StepOutput, short_type_name};
use super::template::TemplateRegistry;

/// Builder closure replayed to produce a nested workflow.
pub type Recipe = Arc<dyn Fn(&mut WorkflowBuilder) + Send + Sync>;

/// A named, reusable workflow recipe. Each `build` yields a fresh instance.
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    recipe: Recipe,
}

impl WorkflowDefinition {
    pub fn new<F>(name: impl Into<String>, recipe: F) -> Self
    where
        F: Fn(&mut WorkflowBuilder) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            recipe: Arc::new(recipe),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A builder with the recipe already applied, for further tweaks.
    pub fn builder(&self) -> WorkflowBuilder {
        let mut builder = WorkflowBuilder::new(&self.name);
        (self.recipe)(&mut builder);
        builder
    }

    pub fn build(&self) -> Result<Workflow, WorkflowError> {
        self.builder().build()
    }

    pub(crate) fn build_in(&self, env: RunEnvironment) -> Result<Workflow, WorkflowError> {
        build_nested(&self.name, &self.recipe, env)
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .finish()
    }
}

/// Build a nested workflow from `recipe` inside the environment of the
/// enclosing run.
pub(crate) fn build_nested(
    name: &str,
    recipe: &Recipe,
    env: RunEnvironment,
) -> Result<Workflow, WorkflowError> {
    let mut builder = WorkflowBuilder::with_environment(name, env);
    recipe(&mut builder);
    builder.build()
}

/// Fluent assembly of a step list plus run configuration.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<BoxStep>,
    starter: Option<BoxStep>,
    finalizer: Option<BoxStep>,
    error_handler: Option<BoxStep>,
    context: Option<WorkflowContext>,
    env: RunEnvironment,
    errors: Vec<String>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_environment(name, RunEnvironment::default())
    }

    pub(crate) fn with_environment(name: impl Into<String>, env: RunEnvironment) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            starter: None,
            finalizer: None,
            error_handler: None,
            context: None,
            env,
            errors: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------------
    // Step wrapping
    // -----------------------------------------------------------------------

    /// Wrap `step` in a node with the default retry policy and the default
    /// template for its type applied.
    pub fn node<S: Step>(&self, step: S) -> StepNode<S> {
        let mut node = StepNode::new(step);
        if let Some(policy) = &self.env.options.default_retry {
            node.retry_shared(policy.clone());
        }
        self.apply_default_template(&mut node);
        node
    }

    fn apply_default_template<S: Step>(&self, node: &mut StepNode<S>) {
        if let Some(template) = self.env.templates.default_for::<S>() {
            template(node);
        }
    }

    fn push<S: Step>(&mut self, node: StepNode<S>) -> &mut Self {
        self.steps.push(BoxStep::new(node));
        self
    }

    // Composites re-run whole nested workflows, so the default retry policy
    // does not apply to them.
    fn push_control<S: Step>(&mut self, step: S) -> &mut Self {
        let mut node = StepNode::new(step);
        self.apply_default_template(&mut node);
        self.push(node)
    }

    // -----------------------------------------------------------------------
    // Adding steps
    // -----------------------------------------------------------------------

    pub fn then<S: Step>(&mut self, step: S) -> &mut Self {
        let node = self.node(step);
        self.push(node)
    }

    /// Add `step`, configuring its node (retry, hooks, skip, compensation).
    pub fn then_with<S, F>(&mut self, step: S, configure: F) -> &mut Self
    where
        S: Step,
        F: FnOnce(&mut StepNode<S>),
    {
        let mut node = self.node(step);
        configure(&mut node);
        self.push(node)
    }

    /// Add `step` with the named template for its type applied.
    pub fn then_templated<S: Step>(&mut self, step: S, template: &str) -> &mut Self {
        let mut node = self.node(step);
        match self.env.templates.named::<S>(template) {
            Some(apply) => apply(&mut node),
            None => self.errors.push(format!(
                "no template named '{template}' for step {}",
                short_type_name(type_name::<S>())
            )),
        }
        self.push(node)
    }

    /// Add a default-constructed step of type `S`.
    pub fn then_default<S: Step + Default>(&mut self) -> &mut Self {
        self.then(S::default())
    }

    pub fn then_fn<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: FnMut(&mut WorkflowContext) -> Result<StepOutput, StepError> + Send + 'static,
    {
        self.then(FnStep::new(name, func))
    }

    /// Add an already boxed step as is, without wrapping it in a node.
    pub fn then_boxed(&mut self, step: BoxStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn insert_at<S: Step>(&mut self, index: usize, step: S) -> &mut Self {
        if index > self.steps.len() {
            self.out_of_range("insert", index);
            return self;
        }
        let step = BoxStep::new(self.node(step));
        self.steps.insert(index, step);
        self
    }

    pub fn replace_at<S: Step>(&mut self, index: usize, step: S) -> &mut Self {
        if index >= self.steps.len() {
            self.out_of_range("replace", index);
            return self;
        }
        self.steps[index] = BoxStep::new(self.node(step));
        self
    }

    pub fn remove_at(&mut self, index: usize) -> &mut Self {
        if index >= self.steps.len() {
            self.out_of_range("remove", index);
            return self;
        }
        self.steps.remove(index);
        self
    }

    fn out_of_range(&mut self, op: &str, index: usize) {
        self.errors.push(format!(
            "cannot {op} at index {index}: workflow '{}' has {} steps",
            self.name,
            self.steps.len()
        ));
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    /// Run `step` only when `predicate` holds.
    pub fn when<S, P>(&mut self, predicate: P, step: S) -> &mut Self
    where
        S: Step,
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        let then_step = BoxStep::new(self.node(step));
        self.push_control(Conditional::new(predicate, then_step, None))
    }

    pub fn if_else<S, E, P>(&mut self, predicate: P, then_step: S, else_step: E) -> &mut Self
    where
        S: Step,
        E: Step,
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        let then_step = BoxStep::new(self.node(then_step));
        let else_step = BoxStep::new(self.node(else_step));
        self.push_control(Conditional::new(predicate, then_step, Some(else_step)))
    }

    /// Run the first case whose predicate holds; no match is a no-op.
    pub fn switch<F>(&mut self, cases: F) -> &mut Self
    where
        F: FnOnce(&mut SwitchCases),
    {
        let mut collected = SwitchCases::default();
        cases(&mut collected);
        self.push_control(Switch::new(collected))
    }

    /// Apply `action` to each selected item, in order.
    pub fn for_each<Sel, A>(&mut self, selector: Sel, action: A) -> &mut Self
    where
        Sel: Fn(&WorkflowContext) -> Result<Vec<Value>, StepError> + Send + Sync + 'static,
        A: Fn(&Value, &mut WorkflowContext) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.push_control(ForEach::new(selector, LoopBody::Action(Arc::new(action))))
    }

    /// Run a fresh nested workflow per selected item. The item is available
    /// under `CURRENT_ITEM_KEY` while its body runs.
    pub fn for_each_workflow<Sel, R>(&mut self, selector: Sel, body: R) -> &mut Self
    where
        Sel: Fn(&WorkflowContext) -> Result<Vec<Value>, StepError> + Send + Sync + 'static,
        R: Fn(&mut WorkflowBuilder) + Send + Sync + 'static,
    {
        self.push_control(ForEach::new(selector, LoopBody::Workflow(Arc::new(body))))
    }

    pub fn fork<F>(&mut self, strategy: ForkStrategy, branches: F) -> &mut Self
    where
        F: FnOnce(&mut ForkBranches),
    {
        let mut collected = ForkBranches::default();
        branches(&mut collected);
        self.push_control(Fork::new(strategy, collected))
    }

    pub fn delay(&mut self, duration: Duration) -> &mut Self {
        self.push_control(Delay::new(duration))
    }

    /// End the run successfully once the preceding steps are done.
    pub fn stop(&mut self) -> &mut Self {
        self.push_control(Stop)
    }

    pub fn throw(&mut self, error: StepError) -> &mut Self {
        self.push_control(Throw::new(error))
    }

    pub fn throw_if<P>(&mut self, predicate: P, error: StepError) -> &mut Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.push_control(ThrowIf::new(predicate, error))
    }

    /// Run a fresh instance of `definition` on the shared context.
    pub fn sub_workflow(&mut self, definition: &WorkflowDefinition) -> &mut Self {
        self.push_control(SubWorkflow::new(definition.clone()))
    }

    // -----------------------------------------------------------------------
    // Run configuration
    // -----------------------------------------------------------------------

    /// Step prepended at position 0 when the workflow is built.
    pub fn starter<S: Step>(&mut self, step: S) -> &mut Self {
        self.starter = Some(BoxStep::new(self.node(step)));
        self
    }

    /// Step run after the forward pass and any compensation.
    pub fn finalizer<S: Step>(&mut self, step: S) -> &mut Self {
        self.finalizer = Some(BoxStep::new(self.node(step)));
        self
    }

    /// Step that absorbs a failure; the failure is available to it as a
    /// `CapturedFailure` singleton.
    pub fn error_handler<S: Step>(&mut self, step: S) -> &mut Self {
        self.error_handler = Some(BoxStep::new(self.node(step)));
        self
    }

    /// Context used by `Workflow::run`.
    pub fn context(&mut self, ctx: WorkflowContext) -> &mut Self {
        self.context = Some(ctx);
        self
    }

    /// Templates are looked up as steps are added, so set this first.
    pub fn templates(&mut self, templates: Arc<TemplateRegistry>) -> &mut Self {
        self.env.templates = templates;
        self
    }

    /// Share a fork tracker with other workflows.
    pub fn tracker(&mut self, tracker: Arc<ForkTracker>) -> &mut Self {
        self.env.tracker = tracker;
        self
    }

    /// Replace the run options wholesale. The default retry policy applies
    /// only to steps added afterwards.
    pub fn options(&mut self, options: RunOptions) -> &mut Self {
        self.env.options = options;
        self
    }

    pub fn step_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.env.options.step_timeout = Some(timeout);
        self
    }

    pub fn global_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.env.options.global_timeout = Some(timeout);
        self
    }

    pub fn decorate(&mut self, factory: DecoratorFactory) -> &mut Self {
        self.env.options.decorators.push(factory);
        self
    }

    pub fn decorate_with<D: StepDecorator>(&mut self, decorator: D) -> &mut Self {
        self.decorate(decorate_with(decorator))
    }

    pub fn listener(&mut self, listener: Arc<dyn WorkflowListener>) -> &mut Self {
        self.env.options.listeners.push(listener);
        self
    }

    pub fn default_retry(&mut self, policy: impl RetryPolicy + 'static) -> &mut Self {
        self.env.options.default_retry = Some(Arc::new(policy));
        self
    }

    // -----------------------------------------------------------------------
    // Inspection and build
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    /// Produce a single-use workflow, leaving the builder empty.
    pub fn build(&mut self) -> Result<Workflow, WorkflowError> {
        if !self.errors.is_empty() {
            return Err(WorkflowError::Configuration(self.errors.join("; ")));
        }

        let mut steps = std::mem::take(&mut self.steps);
        if let Some(starter) = self.starter.take() {
            steps.insert(0, starter);
        }
        if steps.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        let steps = apply_decorators(steps, &self.env.options.decorators);
        tracing::debug!(workflow = %self.name, steps = steps.len(), "Workflow built");

        Ok(Workflow::new(
            self.name.clone(),
            steps,
            self.finalizer.take(),
            self.error_handler.take(),
            self.context.take(),
            self.env.clone(),
        ))
    }
}

impl std::fmt::Debug for WorkflowBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowBuilder")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::decorator::RequireKeys;
    use crate::workflow::retry::FixedDelay;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Noop;

    impl Step for Noop {
        async fn execute(
            &mut self,
            _ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            Ok(StepOutput::Empty)
        }
    }

    struct Flaky(Arc<AtomicU32>);

    impl Step for Flaky {
        async fn execute(
            &mut self,
            _ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StepError::new("io", "connection reset"))
        }
    }

    #[test]
    fn empty_builder_fails_to_build() {
        let err = WorkflowBuilder::new("empty").build().unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyWorkflow));
    }

    #[test]
    fn starter_is_inserted_first() {
        let workflow = WorkflowBuilder::new("order")
            .then_fn("second", |_| Ok(StepOutput::Empty))
            .starter(FnStep::new("first", |_: &mut WorkflowContext| Ok(StepOutput::Empty)))
            .build()
            .unwrap();
        assert_eq!(workflow.step_names(), vec!["first", "second"]);
    }

    #[test]
    fn list_edits_and_range_errors() {
        let mut builder = WorkflowBuilder::new("edits");
        builder
            .then_fn("a", |_| Ok(StepOutput::Empty))
            .then_fn("c", |_| Ok(StepOutput::Empty))
            .insert_at(1, FnStep::new("b", |_: &mut WorkflowContext| Ok(StepOutput::Empty)))
            .replace_at(2, FnStep::new("z", |_: &mut WorkflowContext| Ok(StepOutput::Empty)))
            .remove_at(0);
        assert_eq!(builder.step_names(), vec!["b", "z"]);

        builder.remove_at(5);
        let err = builder.build().unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(ref msg) if msg.contains("index 5")));
    }

    #[test]
    fn missing_named_template_is_configuration_error() {
        let err = WorkflowBuilder::new("templated")
            .then_templated(Noop, "resilient")
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(ref msg) if msg.contains("resilient")));
    }

    #[tokio::test]
    async fn default_template_applies_to_every_step_of_type() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = TemplateRegistry::new();
        registry.register_default::<Flaky, _>(|node| {
            node.retry(FixedDelay::new(2, Duration::from_millis(1)));
        });

        let err = WorkflowBuilder::new("templated")
            .templates(Arc::new(registry))
            .then(Flaky(calls.clone()))
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::StepFailed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn named_template_applies_on_request() {
        let mut registry = TemplateRegistry::new();
        registry.register::<Noop, _>("marked", |node| {
            node.after(|_, ctx| {
                ctx.set("marked", true)?;
                Ok(())
            });
        });

        let ctx = WorkflowBuilder::new("templated")
            .templates(Arc::new(registry))
            .then(Noop)
            .then_templated(Noop, "marked")
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert!(ctx.get::<bool>("marked").unwrap());
    }

    #[tokio::test]
    async fn default_retry_applies_to_plain_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let _ = WorkflowBuilder::new("retrying")
            .default_retry(FixedDelay::new(4, Duration::from_millis(1)))
            .then(Flaky(calls.clone()))
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn decorators_wrap_every_step() {
        let err = WorkflowBuilder::new("guarded")
            .decorate_with(RequireKeys::new(["order_id"]))
            .then(Noop)
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkflowError::StepFailed { source, .. } => assert_eq!(source.kind(), "validation"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn conditional_and_switch_route_on_context() {
        let taken = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str, taken: &Arc<Mutex<Vec<&'static str>>>| {
            let taken = taken.clone();
            FnStep::new(label, move |_: &mut WorkflowContext| {
                taken.lock().unwrap().push(label);
                Ok(StepOutput::Empty)
            })
        };

        let cases_log = taken.clone();
        let ctx = WorkflowBuilder::new("routing")
            .context(WorkflowContext::new().with_input(json!({"tier": "gold"})))
            .then_fn("seed", |ctx| {
                ctx.set("tier", "gold")?;
                Ok(StepOutput::Empty)
            })
            .when(|ctx| ctx.contains("tier"), record("when", &taken))
            .if_else(
                |ctx| ctx.contains("missing"),
                record("then", &taken),
                record("else", &taken),
            )
            .switch(move |cases| {
                let silver = cases_log.clone();
                let gold = cases_log.clone();
                cases
                    .case(
                        |ctx| ctx.try_get::<String>("tier").as_deref() == Some("silver"),
                        move |b| {
                            let silver = silver.clone();
                            b.then_fn("silver", move |_| {
                                silver.lock().unwrap().push("silver");
                                Ok(StepOutput::Empty)
                            });
                        },
                    )
                    .case(
                        |ctx| ctx.try_get::<String>("tier").as_deref() == Some("gold"),
                        move |b| {
                            let gold = gold.clone();
                            b.then_fn("gold", move |_| {
                                gold.lock().unwrap().push("gold");
                                Ok(StepOutput::Empty)
                            });
                        },
                    );
            })
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*taken.lock().unwrap(), vec!["when", "else", "gold"]);
        assert_eq!(ctx.get::<String>("tier").unwrap(), "gold");
    }

    #[tokio::test]
    async fn throw_if_fails_only_when_predicate_holds() {
        let ok = WorkflowBuilder::new("guard")
            .throw_if(|ctx| ctx.contains("blocked"), StepError::new("policy", "blocked"))
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await;
        assert!(ok.is_ok());

        let err = WorkflowBuilder::new("guard")
            .context({
                let mut ctx = WorkflowContext::new();
                ctx.set_value("blocked", json!(true));
                ctx
            })
            .throw_if(|ctx| ctx.contains("blocked"), StepError::new("policy", "blocked"))
            .build()
            .unwrap()
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            WorkflowError::StepFailed { source, .. } => assert_eq!(source.kind(), "policy"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn definition_builds_fresh_instances() {
        let definition = WorkflowDefinition::new("reusable", |b| {
            b.then_default::<Noop>().then_default::<Noop>();
        });
        let first = definition.build().unwrap();
        let second = definition.build().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(definition.name(), "reusable");
    }
}
