//! Registry of fire-and-forget fork branches, keyed by owning run.
//!
//! A fire-and-forget fork returns as soon as its branches are spawned. The
//! branch tasks are registered here under the parent run's id, and the
//! parent joins them after its last step, so a run never reports completion
//! while one of its branches is still going.

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

use conveyor_types::error::WorkflowError;

pub type BranchHandle = JoinHandle<Result<(), WorkflowError>>;

/// Tracks in-flight branch tasks per run.
#[derive(Debug, Default)]
pub struct ForkTracker {
    entries: DashMap<Uuid, Vec<BranchHandle>>,
}

impl ForkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty entry for `run_id`.
    pub fn register(&self, run_id: Uuid) {
        self.entries.entry(run_id).or_default();
    }

    /// Track a branch task for `run_id`, creating the entry if needed.
    pub fn add(&self, run_id: Uuid, handle: BranchHandle) {
        self.entries.entry(run_id).or_default().push(handle);
    }

    /// Number of tracked tasks for `run_id`.
    pub fn pending(&self, run_id: Uuid) -> usize {
        self.entries.get(&run_id).map_or(0, |entry| entry.len())
    }

    /// Remove the entry for `run_id` and await every task in it.
    ///
    /// Unknown or empty entries resolve immediately. Failed and panicked
    /// branches are collected into a single `ForkFailed`.
    pub async fn join_all(&self, run_id: Uuid) -> Result<(), WorkflowError> {
        let Some((_, handles)) = self.entries.remove(&run_id) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(join_err) if join_err.is_cancelled() => failures.push(WorkflowError::Cancelled),
                Err(join_err) => failures.push(WorkflowError::BranchPanicked(join_err.to_string())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::warn!(%run_id, failed = failures.len(), "Forked branches failed");
            Err(WorkflowError::ForkFailed { failures })
        }
    }

    /// Abort and forget every task for `run_id`. Returns how many were aborted.
    pub fn abandon(&self, run_id: Uuid) -> usize {
        match self.entries.remove(&run_id) {
            Some((_, handles)) => {
                for handle in &handles {
                    handle.abort();
                }
                handles.len()
            }
            None => 0,
        }
    }
}
