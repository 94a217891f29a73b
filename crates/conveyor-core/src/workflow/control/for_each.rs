//! Sequential loop over context-selected items.
//!
//! Each nested-workflow item run is kept once it completes. A failing item
//! unwinds itself and the loop then compensates the items before it; a later
//! failure in the enclosing run compensates every item, newest first.

use std::sync::Arc;

use conveyor_types::error::StepError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::workflow::builder::{Recipe, build_nested};
use crate::workflow::context::WorkflowContext;
use crate::workflow::options::RunEnvironment;
use crate::workflow::runtime::Workflow;
use crate::workflow::step::{Step, StepCapabilities, StepOutput};

/// Context key holding the item being processed.
pub const CURRENT_ITEM_KEY: &str = "loop.item";
/// Context key holding the zero-based position of the current item.
pub const CURRENT_INDEX_KEY: &str = "loop.index";

pub type ItemSelector = Arc<dyn Fn(&WorkflowContext) -> Result<Vec<Value>, StepError> + Send + Sync>;
pub type ItemAction = Arc<dyn Fn(&Value, &mut WorkflowContext) -> Result<(), StepError> + Send + Sync>;

/// What runs for each item.
#[derive(Clone)]
pub enum LoopBody {
    Action(ItemAction),
    /// A fresh nested workflow per item.
    Workflow(Recipe),
}

/// Sequential loop over the items returned by a selector.
pub struct ForEach {
    selector: ItemSelector,
    body: LoopBody,
    completed: Vec<(usize, Value, Workflow)>,
}

impl ForEach {
    pub fn new<Sel>(selector: Sel, body: LoopBody) -> Self
    where
        Sel: Fn(&WorkflowContext) -> Result<Vec<Value>, StepError> + Send + Sync + 'static,
    {
        Self {
            selector: Arc::new(selector),
            body,
            completed: Vec::new(),
        }
    }

    /// Compensate completed item runs newest first, with the item and index
    /// keys set to the item being undone.
    async fn compensate_items(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut first_failure = None;
        while let Some((index, item, mut workflow)) = self.completed.pop() {
            ctx.set_value(CURRENT_ITEM_KEY, item);
            ctx.set_value(CURRENT_INDEX_KEY, Value::from(index));
            if let Err(err) = workflow.compensate_completed(ctx, cancel).await {
                tracing::warn!(index, error = %err, "Loop item compensation failed");
                first_failure.get_or_insert(err);
            }
        }
        ctx.remove(CURRENT_ITEM_KEY);
        ctx.remove(CURRENT_INDEX_KEY);
        first_failure.map_or(Ok(()), Err)
    }
}

impl Step for ForEach {
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
        self.completed.clear();
        let items = (self.selector)(ctx)?;
        let body = self.body.clone();
        tracing::debug!(items = items.len(), "Loop items selected");

        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            ctx.set_value(CURRENT_ITEM_KEY, item.clone());
            ctx.set_value(CURRENT_INDEX_KEY, Value::from(index));

            match &body {
                LoopBody::Action(action) => action(&item, ctx)?,
                LoopBody::Workflow(recipe) => {
                    let mut workflow = build_nested(
                        &format!("for_each[{index}]"),
                        recipe,
                        RunEnvironment::current(ctx),
                    )?;
                    if let Err(err) = workflow.run_in(ctx, cancel).await {
                        if !err.is_cancelled() {
                            tracing::debug!(index, completed = self.completed.len(), "Loop item failed, undoing earlier items");
                            if let Err(undo) = self.compensate_items(ctx, cancel).await {
                                tracing::warn!(error = %undo, "Loop rollback incomplete");
                            }
                        }
                        return Err(err.into());
                    }
                    self.completed.push((index, item, workflow));
                }
            }
        }

        ctx.remove(CURRENT_ITEM_KEY);
        ctx.remove(CURRENT_INDEX_KEY);
        Ok(StepOutput::Empty)
    }

    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        self.compensate_items(ctx, cancel).await
    }
}
