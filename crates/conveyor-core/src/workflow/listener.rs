//! Lifecycle listeners.
//!
//! Six notifications with no-op defaults, so a listener implements only what
//! it needs. `CompositeListener` fans every notification out to its members
//! in registration order.

use std::sync::Arc;

use conveyor_types::error::WorkflowError;
use conveyor_types::event::{RunInfo, StepInfo};

/// Receives run and step lifecycle notifications.
///
/// Callbacks run inline on the run loop and should return quickly.
pub trait WorkflowListener: Send + Sync {
    fn on_run_started(&self, _run: &RunInfo) {}

    fn on_run_completed(&self, _run: &RunInfo) {}

    fn on_run_failed(&self, _run: &RunInfo, _error: &WorkflowError) {}

    fn on_step_started(&self, _step: &StepInfo) {}

    fn on_step_completed(&self, _step: &StepInfo) {}

    fn on_step_failed(&self, _step: &StepInfo, _error: &WorkflowError) {}
}

/// Fan-out over several listeners.
#[derive(Clone, Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn WorkflowListener>>,
}

impl CompositeListener {
    pub fn new(listeners: Vec<Arc<dyn WorkflowListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn WorkflowListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl WorkflowListener for CompositeListener {
    fn on_run_started(&self, run: &RunInfo) {
        for l in &self.listeners {
            l.on_run_started(run);
        }
    }

    fn on_run_completed(&self, run: &RunInfo) {
        for l in &self.listeners {
            l.on_run_completed(run);
        }
    }

    fn on_run_failed(&self, run: &RunInfo, error: &WorkflowError) {
        for l in &self.listeners {
            l.on_run_failed(run, error);
        }
    }

    fn on_step_started(&self, step: &StepInfo) {
        for l in &self.listeners {
            l.on_step_started(step);
        }
    }

    fn on_step_completed(&self, step: &StepInfo) {
        for l in &self.listeners {
            l.on_step_completed(step);
        }
    }

    fn on_step_failed(&self, step: &StepInfo, error: &WorkflowError) {
        for l in &self.listeners {
            l.on_step_failed(step, error);
        }
    }
}

impl std::fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
