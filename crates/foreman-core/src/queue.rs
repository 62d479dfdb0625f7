use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    store::TaskStore,
    types::{sort_by_priority, Finalization, HistoryEntry, PullRequestRecord, Release, Task},
};

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(500);

/// Why a claimed task is handed back. Every release keeps the task queued:
/// none of these is the task's fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The agent is stopping.
    Shutdown,
    /// The build binary could not be started.
    SpawnFailure(String),
    /// The working tree could not be put on a fresh task branch.
    BranchSetup(String),
}

impl ReleaseReason {
    /// Local environment problem, as opposed to an orderly stop.
    pub fn is_environment(&self) -> bool {
        !matches!(self, Self::Shutdown)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Shutdown => "shutdown".into(),
            Self::SpawnFailure(msg) => format!("spawn failure: {msg}"),
            Self::BranchSetup(msg) => format!("branch setup failed: {msg}"),
        }
    }
}

/// Task-queue operations for one agent.
///
/// Transport failures are logged here and surface as "nothing happened"
/// (`None` / `false`); callers never advance local state on an unconfirmed
/// write.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn TaskStore>,
    agent_id: String,
}

impl QueueClient {
    pub fn new(store: Arc<dyn TaskStore>, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Claimable tasks, oldest first. A failed read yields an empty list.
    pub async fn list_claimable(&self) -> Vec<Task> {
        match self.store.list_claimable().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list claimable tasks");
                Vec::new()
            }
        }
    }

    /// One conditional claim. `None` on a lost race or a transport failure.
    pub async fn try_claim(&self, task: &Task) -> Option<Task> {
        let entry = HistoryEntry::new(format!("Claimed by {}", self.agent_id), &self.agent_id);
        match self.store.claim(task, &self.agent_id, &entry).await {
            Ok(Some(claimed)) => {
                info!(task_id = %claimed.id, title = %claimed.title, "claimed task");
                Some(claimed)
            }
            Ok(None) => {
                debug!(task_id = %task.id, "claim lost, task taken by another agent");
                None
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "claim failed");
                None
            }
        }
    }

    /// Walk the claimable list in priority order until one claim lands.
    pub async fn claim_next(&self) -> Option<Task> {
        let mut candidates = self.list_claimable().await;
        if candidates.is_empty() {
            return None;
        }
        sort_by_priority(&mut candidates);
        debug!(count = candidates.len(), "claimable tasks");
        for task in &candidates {
            if let Some(claimed) = self.try_claim(task).await {
                return Some(claimed);
            }
        }
        None
    }

    /// Best-effort branch bookkeeping right after the branch is created.
    pub async fn record_branch(&self, task_id: &str, branch: &str) {
        if let Err(e) = self.store.set_branch(task_id, branch).await {
            warn!(task_id, branch, error = %e, "failed to record branch name");
        }
    }

    /// Persist the local record of an opened pull request.
    pub async fn record_pull_request(&self, record: &PullRequestRecord) {
        if let Err(e) = self.store.insert_pull_request(record).await {
            warn!(task_id = %record.roadmap_item_id, pr = record.pr_number, error = %e, "failed to record pull request");
        }
    }

    /// Terminal write, retried on transport failure. Entries are pre-built,
    /// so a retry that reaches the store twice appends them once.
    ///
    /// Returns `true` once the store confirms the write, or reports that the
    /// task is no longer ours (nothing left to retry).
    pub async fn finalize(&self, task_id: &str, fin: &Finalization) -> bool {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.store.finalize(task_id, &self.agent_id, fin).await {
                Ok(Some(task)) => {
                    info!(task_id, status = %task.status, "task finalized");
                    return true;
                }
                Ok(None) => {
                    warn!(task_id, "finalize skipped, task no longer assigned to this agent");
                    return true;
                }
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "finalize failed");
                    if attempt < FINALIZE_ATTEMPTS {
                        tokio::time::sleep(FINALIZE_BACKOFF * attempt).await;
                    }
                }
            }
        }
        false
    }

    /// Hand the task back to `planned`. Returns `true` when the store
    /// confirmed the release (or the task was no longer ours).
    pub async fn release(&self, task_id: &str, reason: &ReleaseReason) -> bool {
        let rel = Release {
            history: HistoryEntry::new(
                format!("Released by {} ({})", self.agent_id, reason.describe()),
                &self.agent_id,
            ),
        };
        match self.store.release(task_id, &self.agent_id, &rel).await {
            Ok(Some(_)) => {
                info!(task_id, reason = %reason.describe(), "task released");
                true
            }
            Ok(None) => {
                debug!(task_id, "release skipped, task no longer assigned to this agent");
                true
            }
            Err(e) => {
                warn!(task_id, error = %e, "release failed");
                false
            }
        }
    }
}
