//! Workflow runtime: drives one run of a built step list.
//!
//! # Run protocol
//!
//! 1. Assign a fresh run id, install the `RunHandle` singleton, register an
//!    empty fork-tracker entry, notify "run started".
//! 2. Dequeue steps in order. Each runs under the tighter of the per-step
//!    timeout and the time left on the global timeout, raced against the
//!    caller's cancellation token. A stop request ends the loop early without
//!    failing the run.
//! 3. Join the fire-and-forget branches registered under this run id. A
//!    branch failure is treated exactly like a step failure.
//! 4. On failure: backtrack over the steps that completed and compensate the
//!    compensable ones newest first, run the finalizer, notify, then hand the
//!    failure to the error handler (the run succeeds) or return it.
//! 5. On success: run the finalizer and notify "run completed".
//!
//! Caller cancellation skips compensation, the finalizer and the error
//! handler. Timeouts enforced by the engine are failures and are compensated.

use std::sync::Arc;
use std::time::Duration;

use conveyor_types::error::{CompensationFailure, StepError, WorkflowError};
use conveyor_types::event::{RunInfo, StepInfo};
use conveyor_types::workflow::RunState;
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::fork_tracker::ForkTracker;
use super::listener::WorkflowListener;
use super::options::{RunEnvironment, RunHandle};
use super::queue::StepQueue;
use super::step::{BoxStep, Step, StepOutput};

/// The failure a run's error handler is invoked for, stored in the context
/// as a singleton before the handler runs.
#[derive(Debug, Clone)]
pub struct CapturedFailure {
    pub run_id: Uuid,
    pub error: WorkflowError,
}

/// A built, single-use workflow instance.
pub struct Workflow {
    name: String,
    queue: StepQueue,
    finalizer: Option<BoxStep>,
    error_handler: Option<BoxStep>,
    context: Option<WorkflowContext>,
    env: RunEnvironment,
    state: RunState,
}

impl Workflow {
    pub(crate) fn new(
        name: String,
        steps: Vec<BoxStep>,
        finalizer: Option<BoxStep>,
        error_handler: Option<BoxStep>,
        context: Option<WorkflowContext>,
        env: RunEnvironment,
    ) -> Self {
        Self {
            name,
            queue: StepQueue::new(steps),
            finalizer,
            error_handler,
            context,
            env,
            state: RunState::NotStarted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.queue.names()
    }

    /// Run against the context given to the builder (or a fresh one) and
    /// return it.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<WorkflowContext, WorkflowError> {
        let mut ctx = self.context.take().unwrap_or_default();
        self.run_in(&mut ctx, cancel).await?;
        Ok(ctx)
    }

    /// Run against a caller-owned context, which stays readable afterwards
    /// whatever the outcome.
    pub async fn run_in(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        if self.state != RunState::NotStarted {
            return Err(WorkflowError::Configuration(format!(
                "workflow '{}' has already run",
                self.name
            )));
        }
        self.execute_in(ctx, cancel).await
    }

    /// Compensate the steps of a completed run, newest first.
    ///
    /// Used by control-flow steps that ran this workflow as a nested run
    /// when the enclosing run later fails. Runs that did not complete have
    /// already unwound themselves and are left alone.
    pub async fn compensate_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if self.state != RunState::Completed {
            return Ok(());
        }
        let failures = compensate_queue(&mut self.queue, ctx, cancel, false).await;
        match failures.into_iter().next() {
            Some(first) => Err(first.error),
            None => Ok(()),
        }
    }

    // Boxed so nested runs started from inside steps do not produce a
    // recursive future type.
    fn execute_in<'a>(
        &'a mut self,
        ctx: &'a mut WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), WorkflowError>> {
        Box::pin(async move {
            let parent = ctx.singleton::<RunHandle>();
            let previous_run_id = ctx.run_id();
            let run_id = Uuid::now_v7();
            let handle = Arc::new(RunHandle::new(
                run_id,
                parent.as_ref().map(|p| p.run_id()),
                self.env.clone(),
            ));

            ctx.set_run_id(Some(run_id));
            ctx.set_singleton(handle.clone());
            self.env.tracker.register(run_id);

            let info = RunInfo {
                run_id,
                parent_run_id: handle.parent_run_id(),
                workflow: self.name.clone(),
            };
            let span = tracing::info_span!(
                "workflow.run",
                workflow.name = %self.name,
                workflow.run_id = %run_id,
            );
            let result = self.drive(ctx, cancel, &handle, &info).instrument(span).await;

            match parent {
                Some(parent) => {
                    ctx.set_singleton(parent);
                    ctx.set_run_id(previous_run_id);
                }
                None => {
                    ctx.remove_singleton::<RunHandle>();
                }
            }
            result
        })
    }

    async fn drive(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
        handle: &RunHandle,
        info: &RunInfo,
    ) -> Result<(), WorkflowError> {
        let listener = self.env.options.listener();
        let run_id = info.run_id;
        let global_timeout = self.env.options.global_timeout;
        let deadline = global_timeout.map(|limit| Instant::now() + limit);
        let run_cancel = cancel.child_token();

        self.state = RunState::Running;
        tracing::info!(steps = self.queue.len(), parent_run_id = ?info.parent_run_id, "Workflow run started");
        listener.on_run_started(info);

        let mut failure: Option<(Option<StepInfo>, WorkflowError)> = None;
        let mut cancelled = false;

        loop {
            if let Some(limit) = global_timeout.filter(|_| deadline_passed(deadline)) {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Global timeout elapsed between steps");
                failure = Some((None, WorkflowError::Timeout(limit)));
                break;
            }
            let Some((index, step)) = self.queue.dequeue() else {
                break;
            };
            let step_info = StepInfo {
                run_id,
                index,
                name: step.name().to_string(),
            };
            tracing::debug!(step = %step_info.name, index, "Step started");
            listener.on_step_started(&step_info);

            match run_step(step, ctx, &run_cancel, self.env.options.step_timeout, deadline).await {
                Ok(_) => {
                    tracing::debug!(step = %step_info.name, index, "Step completed");
                    listener.on_step_completed(&step_info);
                    if handle.stop_requested() {
                        tracing::info!(step = %step_info.name, "Stop requested, ending run early");
                        break;
                    }
                }
                Err(_) if cancel.is_cancelled() => {
                    cancelled = true;
                    break;
                }
                Err(source) => {
                    let error = match (&source, global_timeout) {
                        (StepError::Timeout(_), Some(limit)) if deadline_passed(deadline) => {
                            WorkflowError::Timeout(limit)
                        }
                        _ => WorkflowError::StepFailed {
                            step: step_info.name.clone(),
                            index,
                            source,
                        },
                    };
                    failure = Some((Some(step_info), error));
                    break;
                }
            }
        }

        if failure.is_none() && !cancelled {
            let tracker = self.env.tracker.clone();
            match join_branches(tracker, run_id, cancel, &run_cancel, deadline, global_timeout).await {
                Ok(()) => {}
                Err(_) if cancel.is_cancelled() => cancelled = true,
                Err(err) => failure = Some((None, err)),
            }
        }

        if cancelled {
            run_cancel.cancel();
            let aborted = self.env.tracker.abandon(run_id);
            self.state = RunState::Cancelled;
            tracing::info!(aborted, "Workflow run cancelled");
            listener.on_run_failed(info, &WorkflowError::Cancelled);
            return Err(WorkflowError::Cancelled);
        }

        if let Some((step_info, error)) = failure {
            return self
                .unwind(ctx, cancel, &run_cancel, &listener, info, step_info, error)
                .await;
        }

        self.state = RunState::Finalizing;
        if let Some(finalizer) = self.finalizer.as_mut() {
            if let Err(err) = finalizer.execute(ctx, cancel).await {
                let error = WorkflowError::FinalizerFailed(err);
                tracing::warn!(error = %error, "Finalizer failed");
                self.state = RunState::Propagated;
                listener.on_run_failed(info, &error);
                return Err(error);
            }
        }

        self.state = RunState::Completed;
        tracing::info!("Workflow run completed");
        listener.on_run_completed(info);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn unwind(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
        run_cancel: &CancellationToken,
        listener: &dyn WorkflowListener,
        info: &RunInfo,
        step_info: Option<StepInfo>,
        error: WorkflowError,
    ) -> Result<(), WorkflowError> {
        tracing::warn!(error = %error, "Workflow run failed, compensating");

        // Branches still in flight are told to stop and drained before any
        // completed step is reversed.
        run_cancel.cancel();
        if let Err(err) = self.env.tracker.join_all(info.run_id).await {
            tracing::warn!(error = %err, "Forked branches failed while unwinding");
        }

        self.state = RunState::Compensating;
        let failures = compensate_queue(&mut self.queue, ctx, cancel, step_info.is_some()).await;

        self.state = RunState::Finalizing;
        if let Some(finalizer) = self.finalizer.as_mut() {
            if let Err(err) = finalizer.execute(ctx, cancel).await {
                tracing::warn!(error = %err, "Finalizer failed after run failure");
            }
        }

        if let Some(step_info) = &step_info {
            listener.on_step_failed(step_info, &error);
        }
        let error = if failures.is_empty() {
            error
        } else {
            WorkflowError::CompensationFailed {
                original: Box::new(error),
                failures,
            }
        };
        listener.on_run_failed(info, &error);

        match self.error_handler.as_mut() {
            Some(handler) => {
                ctx.set_singleton(Arc::new(CapturedFailure {
                    run_id: info.run_id,
                    error,
                }));
                match handler.execute(ctx, cancel).await {
                    Ok(_) => {
                        tracing::info!("Workflow failure handled by error handler");
                        self.state = RunState::ErrorHandled;
                        Ok(())
                    }
                    Err(err) => {
                        self.state = RunState::Propagated;
                        Err(WorkflowError::ErrorHandlerFailed(err))
                    }
                }
            }
            None => {
                self.state = RunState::Propagated;
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.queue.len())
            .field("state", &self.state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Await this run's fire-and-forget branches, bounded by the global
/// deadline and the caller's token. A deadline that has already passed
/// fails without waiting.
async fn join_branches(
    tracker: Arc<ForkTracker>,
    run_id: Uuid,
    cancel: &CancellationToken,
    run_cancel: &CancellationToken,
    deadline: Option<Instant>,
    global_timeout: Option<Duration>,
) -> Result<(), WorkflowError> {
    if let Some(limit) = global_timeout.filter(|_| deadline_passed(deadline)) {
        run_cancel.cancel();
        return Err(WorkflowError::Timeout(limit));
    }
    let join = async {
        match remaining(deadline) {
            Some(left) => match tokio::time::timeout(left, tracker.join_all(run_id)).await {
                Ok(joined) => joined,
                Err(_) => {
                    run_cancel.cancel();
                    Err(WorkflowError::Timeout(global_timeout.unwrap_or(left)))
                }
            },
            None => tracker.join_all(run_id).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkflowError::Cancelled),
        joined = join => joined,
    }
}

/// Execute one step under the effective timeout, raced against `cancel`.
///
/// The step gets a child token that is cancelled when the step fails or
/// times out, so work it spawned winds down with it.
async fn run_step(
    step: &mut BoxStep,
    ctx: &mut WorkflowContext,
    cancel: &CancellationToken,
    step_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<StepOutput, StepError> {
    let step_cancel = cancel.child_token();
    let limit = match (step_timeout, remaining(deadline)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    let execution = step.execute(ctx, &step_cancel);
    let result = match limit {
        Some(limit) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = tokio::time::timeout(limit, execution) => {
                outcome.unwrap_or(Err(StepError::Timeout(limit)))
            }
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            outcome = execution => outcome,
        },
    };

    if result.is_err() {
        step_cancel.cancel();
    }
    result
}

/// Walk the queue backward, compensating every compensable step.
///
/// With `skip_current` the step under the head (the one that just failed)
/// is passed over first. Compensation is best-effort: a failing
/// compensation is recorded and the walk continues.
pub(crate) async fn compensate_queue(
    queue: &mut StepQueue,
    ctx: &mut WorkflowContext,
    cancel: &CancellationToken,
    skip_current: bool,
) -> Vec<CompensationFailure> {
    if skip_current {
        queue.backtrack();
    }

    let mut failures = Vec::new();
    while let Some((index, step)) = queue.backtrack() {
        if !step.capabilities().compensable {
            continue;
        }
        tracing::debug!(step = step.name(), index, "Compensating step");
        if let Err(error) = step.compensate(ctx, cancel).await {
            tracing::warn!(step = step.name(), index, error = %error, "Compensation failed");
            failures.push(CompensationFailure {
                step: step.name().to_string(),
                error,
            });
        }
    }
    failures
}
