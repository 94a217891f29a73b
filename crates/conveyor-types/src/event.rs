//! Run and step lifecycle records.
//!
//! `RunInfo` and `StepInfo` are handed to listeners synchronously; the
//! serializable `WorkflowEvent` is what gets published on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a run, passed to run-level listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    /// Set when the run is nested inside another (switch case, loop body,
    /// fork branch or sub-workflow).
    pub parent_run_id: Option<Uuid>,
    pub workflow: String,
}

/// Identity of one step inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub run_id: Uuid,
    /// Position in the built step list (the starter, if any, is 0).
    pub index: usize,
    pub name: String,
}

/// Serializable lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        parent_run_id: Option<Uuid>,
        workflow: String,
        at: DateTime<Utc>,
    },
    RunCompleted {
        run_id: Uuid,
        workflow: String,
        at: DateTime<Utc>,
    },
    RunFailed {
        run_id: Uuid,
        workflow: String,
        error: String,
        at: DateTime<Utc>,
    },
    StepStarted {
        run_id: Uuid,
        index: usize,
        step: String,
        at: DateTime<Utc>,
    },
    StepCompleted {
        run_id: Uuid,
        index: usize,
        step: String,
        at: DateTime<Utc>,
    },
    StepFailed {
        run_id: Uuid,
        index: usize,
        step: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = Uuid::now_v7();
        let event = WorkflowEvent::StepFailed {
            run_id,
            index: 1,
            step: "Deploy".to_string(),
            error: "step: boom".to_string(),
            at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_failed");
        assert_eq!(json["index"], 1);

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.run_id(), run_id);
    }
}
