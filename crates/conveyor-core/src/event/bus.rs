//! Broadcast event bus for distributing `WorkflowEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! `EventBusListener` plugs the bus into a run as a `WorkflowListener`.

use chrono::Utc;
use conveyor_types::error::WorkflowError;
use conveyor_types::event::{RunInfo, StepInfo, WorkflowEvent};
use tokio::sync::broadcast;

use crate::workflow::listener::WorkflowListener;

/// Multi-consumer bus for workflow lifecycle events.
///
/// Cloning the bus clones the sender, so clones publish to and subscribe
/// from the same channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity. Slow subscribers that
    /// fall more than `capacity` events behind observe a lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers; dropped if there are none.
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> &broadcast::Sender<WorkflowEvent> {
        &self.sender
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Listener adapter
// ---------------------------------------------------------------------------

/// Publishes every lifecycle notification onto an `EventBus`.
#[derive(Debug, Clone)]
pub struct EventBusListener {
    bus: EventBus,
}

impl EventBusListener {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl WorkflowListener for EventBusListener {
    fn on_run_started(&self, run: &RunInfo) {
        self.bus.publish(WorkflowEvent::RunStarted {
            run_id: run.run_id,
            parent_run_id: run.parent_run_id,
            workflow: run.workflow.clone(),
            at: Utc::now(),
        });
    }

    fn on_run_completed(&self, run: &RunInfo) {
        self.bus.publish(WorkflowEvent::RunCompleted {
            run_id: run.run_id,
            workflow: run.workflow.clone(),
            at: Utc::now(),
        });
    }

    fn on_run_failed(&self, run: &RunInfo, error: &WorkflowError) {
        self.bus.publish(WorkflowEvent::RunFailed {
            run_id: run.run_id,
            workflow: run.workflow.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    fn on_step_started(&self, step: &StepInfo) {
        self.bus.publish(WorkflowEvent::StepStarted {
            run_id: step.run_id,
            index: step.index,
            step: step.name.clone(),
            at: Utc::now(),
        });
    }

    fn on_step_completed(&self, step: &StepInfo) {
        self.bus.publish(WorkflowEvent::StepCompleted {
            run_id: step.run_id,
            index: step.index,
            step: step.name.clone(),
            at: Utc::now(),
        });
    }

    fn on_step_failed(&self, step: &StepInfo, error: &WorkflowError) {
        self.bus.publish(WorkflowEvent::StepFailed {
            run_id: step.run_id,
            index: step.index,
            step: step.name.clone(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }
}
