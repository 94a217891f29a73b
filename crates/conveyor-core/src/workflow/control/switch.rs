//! Multi-way branch: the first matching case runs as a nested workflow.

use std::sync::Arc;

use conveyor_types::error::StepError;
use tokio_util::sync::CancellationToken;

use crate::workflow::builder::{Recipe, WorkflowBuilder, build_nested};
use crate::workflow::context::WorkflowContext;
use crate::workflow::node::Predicate;
use crate::workflow::options::RunEnvironment;
use crate::workflow::runtime::Workflow;
use crate::workflow::step::{Step, StepCapabilities, StepOutput};

/// Ordered `(predicate, recipe)` cases collected by `WorkflowBuilder::switch`.
#[derive(Clone, Default)]
pub struct SwitchCases {
    cases: Vec<(Predicate, Recipe)>,
}

impl SwitchCases {
    pub fn case<P, R>(&mut self, predicate: P, recipe: R) -> &mut Self
    where
        P: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
        R: Fn(&mut WorkflowBuilder) + Send + Sync + 'static,
    {
        self.cases.push((Arc::new(predicate), Arc::new(recipe)));
        self
    }

    /// Case that always matches; put it last.
    pub fn otherwise<R>(&mut self, recipe: R) -> &mut Self
    where
        R: Fn(&mut WorkflowBuilder) + Send + Sync + 'static,
    {
        self.case(|_| true, recipe)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Runs a fresh nested workflow for the first matching case.
pub struct Switch {
    cases: Vec<(Predicate, Recipe)>,
    completed: Option<(usize, Workflow)>,
}

impl Switch {
    pub fn new(cases: SwitchCases) -> Self {
        Self {
            cases: cases.cases,
            completed: None,
        }
    }

    fn resolve(&self, ctx: &WorkflowContext) -> Option<usize> {
        self.cases.iter().position(|(predicate, _)| predicate(ctx))
    }
}

impl Step for Switch {
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
        let Some(index) = self.resolve(ctx) else {
            tracing::debug!(cases = self.cases.len(), "No switch case matched");
            return Ok(StepOutput::Empty);
        };

        tracing::debug!(case = index, "Switch case matched");
        let mut workflow = build_nested(
            &format!("switch[{index}]"),
            &self.cases[index].1,
            RunEnvironment::current(ctx),
        )?;
        workflow.run_in(ctx, cancel).await?;
        self.completed = Some((index, workflow));
        Ok(StepOutput::Empty)
    }

    /// Re-resolves the match; the completed case is compensated only if it
    /// is still the one selected.
    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let current = self.resolve(ctx);
        match self.completed.as_mut() {
            Some((index, workflow)) if current == Some(*index) => {
                workflow.compensate_completed(ctx, cancel).await
            }
            Some((index, _)) => {
                tracing::debug!(case = *index, "Switch case no longer selected, skipping compensation");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn no_match_is_a_no_op() {
        let mut cases = SwitchCases::default();
        cases.case(|ctx| ctx.contains("never"), |b| {
            b.throw(StepError::msg("should not run"));
        });
        let mut switch = Switch::new(cases);

        let mut ctx = WorkflowContext::new();
        let out = switch.execute(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert!(matches!(out, StepOutput::Empty));
    }

    #[tokio::test]
    async fn first_matching_case_wins() {
        let mut cases = SwitchCases::default();
        cases
            .case(|ctx| ctx.contains("a"), |b| {
                b.then_fn("first", |ctx| {
                    ctx.set("picked", "first")?;
                    Ok(StepOutput::Empty)
                });
            })
            .otherwise(|b| {
                b.then_fn("fallback", |ctx| {
                    ctx.set("picked", "fallback")?;
                    Ok(StepOutput::Empty)
                });
            });
        assert_eq!(cases.len(), 2);
        let mut switch = Switch::new(cases);

        let mut ctx = WorkflowContext::new();
        ctx.set_value("a", json!(1));
        switch.execute(&mut ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.get::<String>("picked").unwrap(), "first");
    }
}
