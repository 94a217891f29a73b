//! Run state and fork strategy enums.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single workflow run.
///
/// ```text
/// NotStarted -> Running -> Compensating -> Finalizing -> ErrorHandled | Propagated
///                       \-> Finalizing -> Completed
///                       \-> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Compensating,
    Finalizing,
    Completed,
    /// A failure was absorbed by the configured error handler.
    ErrorHandled,
    /// A failure was returned to the caller.
    Propagated,
    Cancelled,
}

impl RunState {
    /// Whether the run has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::ErrorHandled | Self::Propagated | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::ErrorHandled => "error_handled",
            Self::Propagated => "propagated",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a fork step waits for its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkStrategy {
    /// Block the fork step until every branch finishes.
    #[default]
    WaitAll,
    /// Start the branches and continue; the owning run joins them before it
    /// reports completion.
    FireAndForget,
}
