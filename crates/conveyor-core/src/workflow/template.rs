//! Step templates: reusable per-step-type configuration.
//!
//! A template is a typed closure over `StepNode<S>` that can attach a retry
//! policy, hooks, a skip predicate or a compensation. The registry holds one
//! optional default template per step type, applied to every step of that
//! type the builder adds, plus any number of named templates applied on
//! request. The registry is an ordinary value handed to the builder.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use super::node::StepNode;
use super::step::Step;

/// Configuration applied to a freshly wrapped step of type `S`.
pub type StepTemplate<S> = Arc<dyn Fn(&mut StepNode<S>) + Send + Sync>;

type TemplateKey = (TypeId, Option<String>);

/// Default and named templates keyed by step type.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: HashMap<TemplateKey, Box<dyn Any + Send + Sync>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the template applied to every added step of type `S`.
    pub fn register_default<S, F>(&mut self, template: F) -> &mut Self
    where
        S: Step,
        F: Fn(&mut StepNode<S>) + Send + Sync + 'static,
    {
        let template: StepTemplate<S> = Arc::new(template);
        self.templates
            .insert((TypeId::of::<S>(), None), Box::new(template));
        self
    }

    /// Register a template for `S` that steps opt into by name.
    pub fn register<S, F>(&mut self, name: impl Into<String>, template: F) -> &mut Self
    where
        S: Step,
        F: Fn(&mut StepNode<S>) + Send + Sync + 'static,
    {
        let template: StepTemplate<S> = Arc::new(template);
        self.templates
            .insert((TypeId::of::<S>(), Some(name.into())), Box::new(template));
        self
    }

    pub fn default_for<S: Step>(&self) -> Option<StepTemplate<S>> {
        self.lookup::<S>(None)
    }

    pub fn named<S: Step>(&self, name: &str) -> Option<StepTemplate<S>> {
        self.lookup::<S>(Some(name.to_string()))
    }

    fn lookup<S: Step>(&self, name: Option<String>) -> Option<StepTemplate<S>> {
        self.templates
            .get(&(TypeId::of::<S>(), name))
            .and_then(|entry| entry.downcast_ref::<StepTemplate<S>>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("templates", &self.templates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::WorkflowContext;
    use crate::workflow::step::StepOutput;
    use conveyor_types::error::StepError;
    use tokio_util::sync::CancellationToken;

    struct Fetch;

    impl Step for Fetch {
        async fn execute(
            &mut self,
            _ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            Ok(StepOutput::Empty)
        }
    }

    struct Other;

    impl Step for Other {
        async fn execute(
            &mut self,
            _ctx: &mut WorkflowContext,
            _cancel: &CancellationToken,
        ) -> Result<StepOutput, StepError> {
            Ok(StepOutput::Empty)
        }
    }

    #[test]
    fn test_default_and_named_lookup_by_type() {
        let mut registry = TemplateRegistry::new();
        registry
            .register_default::<Fetch, _>(|node| {
                node.named("fetch-default");
            })
            .register::<Fetch, _>("slow", |node| {
                node.named("fetch-slow");
            });

        assert_eq!(registry.len(), 2);
        assert!(registry.default_for::<Other>().is_none());
        assert!(registry.named::<Fetch>("missing").is_none());

        let mut node = StepNode::new(Fetch);
        (registry.default_for::<Fetch>().unwrap())(&mut node);
        assert_eq!(node.name(), "fetch-default");

        (registry.named::<Fetch>("slow").unwrap())(&mut node);
        assert_eq!(node.name(), "fetch-slow");
    }
}
