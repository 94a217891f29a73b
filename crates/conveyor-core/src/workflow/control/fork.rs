//! Parallel branches.
//!
//! Every branch is a fresh nested workflow running as its own tokio task on
//! a clone of the context, so branch writes never reach the parent.
//! `WaitAll` joins the branches inside the step and keeps each completed
//! branch with its context so the branch can be compensated later; when one
//! branch fails the completed ones are compensated before the error is
//! returned. `FireAndForget` hands the join handles to the fork tracker
//! under the enclosing run id, and the run joins them after its last step.
//! Detached branches are not compensated.

use std::sync::Arc;

use conveyor_types::error::{StepError, WorkflowError};
use conveyor_types::workflow::ForkStrategy;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::workflow::builder::{Recipe, WorkflowBuilder, build_nested};
use crate::workflow::context::WorkflowContext;
use crate::workflow::options::{RunEnvironment, RunHandle};
use crate::workflow::runtime::Workflow;
use crate::workflow::step::{Step, StepCapabilities, StepOutput};

/// Branch recipes collected by `WorkflowBuilder::fork`.
#[derive(Clone, Default)]
pub struct ForkBranches {
    branches: Vec<Recipe>,
}

impl ForkBranches {
    pub fn branch<R>(&mut self, recipe: R) -> &mut Self
    where
        R: Fn(&mut WorkflowBuilder) + Send + Sync + 'static,
    {
        self.branches.push(Arc::new(recipe));
        self
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

pub struct Fork {
    strategy: ForkStrategy,
    branches: Vec<Recipe>,
    completed: Vec<CompletedBranch>,
}

/// A `WaitAll` branch that ran to completion, with the context it ran on.
struct CompletedBranch {
    index: usize,
    workflow: Workflow,
    ctx: WorkflowContext,
}

impl Fork {
    pub fn new(strategy: ForkStrategy, branches: ForkBranches) -> Self {
        Self {
            strategy,
            branches: branches.branches,
            completed: Vec::new(),
        }
    }
}

impl Step for Fork {
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
        let env = RunEnvironment::current(ctx);
        let workflows = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, recipe)| build_nested(&format!("fork[{index}]"), recipe, env.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(branches = workflows.len(), strategy = ?self.strategy, "Forking");
        self.completed.clear();
        match self.strategy {
            ForkStrategy::WaitAll => {
                let (completed, failure) = wait_all(workflows, ctx, cancel).await;
                self.completed = completed;
                match failure {
                    Some(err) => {
                        if !err.is_cancelled() {
                            tracing::debug!(completed = self.completed.len(), "Fork branch failed, undoing completed branches");
                            if let Err(undo) = compensate_branches(&mut self.completed, cancel).await {
                                tracing::warn!(error = %undo, "Fork rollback incomplete");
                            }
                        }
                        Err(err.into())
                    }
                    None => Ok(StepOutput::Empty),
                }
            }
            ForkStrategy::FireAndForget => fire_and_forget(workflows, ctx, cancel, &env),
        }
    }

    async fn compensate(
        &mut self,
        _ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        compensate_branches(&mut self.completed, cancel).await
    }
}

/// Run every branch to the end. Returns the completed branches in branch
/// order and the first failure seen.
async fn wait_all(
    workflows: Vec<Workflow>,
    ctx: &WorkflowContext,
    cancel: &CancellationToken,
) -> (Vec<CompletedBranch>, Option<WorkflowError>) {
    let mut set = JoinSet::new();
    for (index, mut workflow) in workflows.into_iter().enumerate() {
        let mut branch_ctx = ctx.clone();
        let token = cancel.child_token();
        set.spawn(async move {
            let outcome = workflow.run_in(&mut branch_ctx, &token).await;
            (index, workflow, branch_ctx, outcome)
        });
    }

    let mut completed = Vec::new();
    let mut first_failure: Option<WorkflowError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, workflow, branch_ctx, Ok(()))) => completed.push(CompletedBranch {
                index,
                workflow,
                ctx: branch_ctx,
            }),
            Ok((index, _, _, Err(err))) => {
                tracing::warn!(branch = index, error = %err, "Fork branch failed");
                first_failure.get_or_insert(err);
            }
            Err(e) => {
                let err = WorkflowError::BranchPanicked(e.to_string());
                tracing::warn!(error = %err, "Fork branch failed");
                first_failure.get_or_insert(err);
            }
        }
    }
    completed.sort_by_key(|branch| branch.index);
    (completed, first_failure)
}

/// Compensate completed branches, highest branch index first, each on its
/// own context. Best-effort; the first failure is returned.
async fn compensate_branches(
    completed: &mut Vec<CompletedBranch>,
    cancel: &CancellationToken,
) -> Result<(), StepError> {
    let mut first_failure = None;
    while let Some(mut branch) = completed.pop() {
        if let Err(err) = branch.workflow.compensate_completed(&mut branch.ctx, cancel).await {
            tracing::warn!(branch = branch.index, error = %err, "Fork branch compensation failed");
            first_failure.get_or_insert(err);
        }
    }
    first_failure.map_or(Ok(()), Err)
}

fn fire_and_forget(
    workflows: Vec<Workflow>,
    ctx: &WorkflowContext,
    cancel: &CancellationToken,
    env: &RunEnvironment,
) -> Result<StepOutput, StepError> {
    let Some(handle) = ctx.singleton::<RunHandle>() else {
        return Err(WorkflowError::Configuration(
            "fire-and-forget fork must run inside a workflow run".to_string(),
        )
        .into());
    };

    for mut workflow in workflows {
        let mut branch_ctx = ctx.clone();
        let token = cancel.child_token();
        let task = tokio::spawn(async move { workflow.run_in(&mut branch_ctx, &token).await });
        env.tracker.add(handle.run_id(), task);
    }
    Ok(StepOutput::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn branches(f: impl FnOnce(&mut ForkBranches)) -> ForkBranches {
        let mut collected = ForkBranches::default();
        f(&mut collected);
        collected
    }

    #[tokio::test]
    async fn wait_all_isolates_branch_contexts() {
        let mut fork = Fork::new(
            ForkStrategy::WaitAll,
            branches(|f| {
                f.branch(|b| {
                    b.then_fn("write", |ctx| {
                        ctx.set("branch", "one")?;
                        Ok(StepOutput::Empty)
                    });
                })
                .branch(|b| {
                    b.delay(Duration::from_millis(5));
                });
            }),
        );

        let mut ctx = WorkflowContext::new();
        fork.execute(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert!(!ctx.contains("branch"));
    }

    #[tokio::test]
    async fn wait_all_reports_branch_failure_after_all_finish() {
        let mut fork = Fork::new(
            ForkStrategy::WaitAll,
            branches(|f| {
                f.branch(|b| {
                    b.throw(StepError::new("inventory", "out of stock"));
                })
                .branch(|b| {
                    b.delay(Duration::from_millis(20));
                });
            }),
        );

        let err = fork
            .execute(&mut WorkflowContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of stock"));
    }

    #[tokio::test]
    async fn fire_and_forget_needs_enclosing_run() {
        let mut fork = Fork::new(
            ForkStrategy::FireAndForget,
            branches(|f| {
                f.branch(|b| {
                    b.delay(Duration::from_millis(1));
                });
            }),
        );

        let err = fork
            .execute(&mut WorkflowContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inside a workflow run"));
    }
}
