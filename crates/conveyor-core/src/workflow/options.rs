//! Run-wide options, the environment nested runs inherit, and the run handle.
//!
//! `RunOptions` is what callers configure. `RunEnvironment` bundles the
//! options with the fork tracker and template registry; every nested run
//! (switch case, loop body, fork branch, sub-workflow) is built from the
//! environment of the run that contains it. The `RunHandle` is stored in the
//! context as a singleton while a run is active, which is how control-flow
//! steps find that environment and how `Stop` reaches its run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conveyor_types::config::EngineConfig;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::decorator::{DecoratorFactory, StepDecorator, decorate_with};
use super::fork_tracker::ForkTracker;
use super::listener::{CompositeListener, WorkflowListener};
use super::retry::{RetryPolicy, policy_from_config};
use super::template::TemplateRegistry;

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Caller-facing run configuration.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Limit for each individual step.
    pub step_timeout: Option<Duration>,
    /// Limit for the whole run, enforced by the outermost run only.
    pub global_timeout: Option<Duration>,
    /// Applied in order to every step at build time.
    pub decorators: Vec<DecoratorFactory>,
    /// Notified in registration order.
    pub listeners: Vec<Arc<dyn WorkflowListener>>,
    /// Retry policy for steps that do not set their own.
    pub default_retry: Option<Arc<dyn RetryPolicy>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeouts and default retry policy from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            global_timeout: config.global_timeout(),
            default_retry: policy_from_config(&config.retry),
            ..Self::default()
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    pub fn with_decorator(mut self, decorator: impl StepDecorator) -> Self {
        self.decorators.push(decorate_with(decorator));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn WorkflowListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub(crate) fn listener(&self) -> CompositeListener {
        CompositeListener::new(self.listeners.clone())
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("step_timeout", &self.step_timeout)
            .field("global_timeout", &self.global_timeout)
            .field("decorators", &self.decorators.len())
            .field("listeners", &self.listeners.len())
            .field("default_retry", &self.default_retry.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RunEnvironment
// ---------------------------------------------------------------------------

/// Everything a nested run inherits from the run containing it.
#[derive(Clone, Debug, Default)]
pub struct RunEnvironment {
    pub options: RunOptions,
    pub tracker: Arc<ForkTracker>,
    pub templates: Arc<TemplateRegistry>,
}

impl RunEnvironment {
    /// The environment for runs nested in this one. The global deadline
    /// stays with the outermost run.
    pub fn nested(&self) -> Self {
        let mut env = self.clone();
        env.options.global_timeout = None;
        env
    }

    /// Environment of the run currently using `ctx`, or a default one when
    /// called outside any run.
    pub fn current(ctx: &WorkflowContext) -> Self {
        ctx.singleton::<RunHandle>()
            .map(|handle| handle.env.nested())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Context singleton identifying the active run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    parent_run_id: Option<Uuid>,
    stop: AtomicBool,
    env: RunEnvironment,
}

impl RunHandle {
    pub(crate) fn new(run_id: Uuid, parent_run_id: Option<Uuid>, env: RunEnvironment) -> Self {
        Self {
            run_id,
            parent_run_id,
            stop: AtomicBool::new(false),
            env,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent_run_id
    }

    /// Ask the run to finish after the current step, without failing.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn environment(&self) -> &RunEnvironment {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::config::RetryStrategy;

    #[test]
    fn test_from_config() {
        let mut config = EngineConfig::default();
        config.step_timeout_secs = Some(5);
        config.retry.max_retries = 3;
        config.retry.strategy = RetryStrategy::Exponential;

        let options = RunOptions::from_config(&config);
        assert_eq!(options.step_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.global_timeout, None);
        assert!(options.default_retry.is_some());
        assert!(options.listeners.is_empty());
    }

    #[test]
    fn test_nested_environment_drops_global_timeout() {
        let env = RunEnvironment {
            options: RunOptions::new()
                .with_step_timeout(Duration::from_secs(1))
                .with_global_timeout(Duration::from_secs(10)),
            ..RunEnvironment::default()
        };
        let nested = env.nested();
        assert_eq!(nested.options.global_timeout, None);
        assert_eq!(nested.options.step_timeout, Some(Duration::from_secs(1)));
        assert!(Arc::ptr_eq(&env.tracker, &nested.tracker));
    }

    #[test]
    fn test_current_environment_from_context() {
        let mut ctx = WorkflowContext::new();
        assert!(RunEnvironment::current(&ctx).options.step_timeout.is_none());

        let env = RunEnvironment {
            options: RunOptions::new().with_step_timeout(Duration::from_secs(2)),
            ..RunEnvironment::default()
        };
        let handle = Arc::new(RunHandle::new(Uuid::now_v7(), None, env));
        ctx.set_singleton(handle.clone());

        assert_eq!(
            RunEnvironment::current(&ctx).options.step_timeout,
            Some(Duration::from_secs(2))
        );
        assert!(!handle.stop_requested());
        handle.request_stop();
        assert!(ctx.singleton::<RunHandle>().unwrap().stop_requested());
    }
}
