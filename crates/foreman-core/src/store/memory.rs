use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::TaskStore;
use crate::{
    error::StoreError,
    types::{
        ActivityEntry, AgentMetrics, AgentRegistration, AgentStatus, AgentUpdate, Comment,
        Finalization, HistoryEntry, PullRequestRecord, Release, Task, TaskStatus,
    },
};

/// Registry row as held by the in-memory store.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub registration: AgentRegistration,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: AgentMetrics,
}

/// In-process store with the same compare-and-swap rules as the real ones.
///
/// Used for `memory://` dry runs and throughout the test suites. Failure
/// injection simulates transport errors both before a write reaches the
/// store and after it was applied (lost response).
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<Vec<Task>>,
    agents: Mutex<HashMap<String, AgentRow>>,
    activity: Mutex<Vec<ActivityEntry>>,
    pull_requests: Mutex<Vec<PullRequestRecord>>,
    listeners: Mutex<Vec<mpsc::Sender<()>>>,
    claim_attempts: AtomicUsize,
    fail_requests: AtomicUsize,
    lose_responses: AtomicUsize,
    no_feed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected() -> StoreError {
    StoreError::Rejected {
        status: 503,
        body: "injected transport failure".into(),
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

fn push_history(task: &mut Task, entry: &HistoryEntry) {
    if entry.id.is_empty() || !task.history.iter().any(|h| h.id == entry.id) {
        task.history.push(entry.clone());
    }
}

fn push_comment(task: &mut Task, comment: &Comment) {
    if comment.id.is_empty() || !task.comments.iter().any(|c| c.id == comment.id) {
        task.comments.push(comment.clone());
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store without a notification feed, like a backend that can only
    /// be polled.
    pub fn polling_only() -> Self {
        Self {
            no_feed: true,
            ..Self::default()
        }
    }

    /// Insert (or replace) a task row. Fires a queue notification when the
    /// row is claimable, like the database trigger does.
    pub fn insert_task(&self, task: Task) {
        let claimable = task.is_claimable();
        {
            let mut tasks = lock(&self.tasks);
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task,
                None => tasks.push(task),
            }
        }
        if claimable {
            self.notify();
        }
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        lock(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    pub fn agent(&self, id: &str) -> Option<AgentRow> {
        lock(&self.agents).get(id).cloned()
    }

    pub fn activity(&self) -> Vec<ActivityEntry> {
        lock(&self.activity).clone()
    }

    pub fn pull_requests(&self) -> Vec<PullRequestRecord> {
        lock(&self.pull_requests).clone()
    }

    /// Number of conditional claim writes received so far.
    pub fn claim_attempts(&self) -> usize {
        self.claim_attempts.load(Ordering::Acquire)
    }

    /// Fail the next `n` calls before they touch any state.
    pub fn fail_next(&self, n: usize) {
        self.fail_requests.store(n, Ordering::Release);
    }

    /// Apply the next `n` writes but report a transport failure.
    pub fn lose_next_responses(&self, n: usize) {
        self.lose_responses.store(n, Ordering::Release);
    }

    fn check_request(&self) -> Result<(), StoreError> {
        if take_one(&self.fail_requests) {
            return Err(injected());
        }
        Ok(())
    }

    fn check_response(&self) -> Result<(), StoreError> {
        if take_one(&self.lose_responses) {
            return Err(injected());
        }
        Ok(())
    }

    fn notify(&self) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|tx| !tx.is_closed());
        for tx in listeners.iter() {
            // A full channel already holds a pending wake-up.
            let _ = tx.try_send(());
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list_claimable(&self) -> Result<Vec<Task>, StoreError> {
        self.check_request()?;
        let mut claimable: Vec<Task> = lock(&self.tasks)
            .iter()
            .filter(|t| t.is_claimable())
            .cloned()
            .collect();
        claimable.sort_by_key(|t| t.created_at);
        Ok(claimable)
    }

    async fn claim(
        &self,
        task: &Task,
        agent_id: &str,
        entry: &HistoryEntry,
    ) -> Result<Option<Task>, StoreError> {
        self.claim_attempts.fetch_add(1, Ordering::AcqRel);
        self.check_request()?;
        let claimed = {
            let mut tasks = lock(&self.tasks);
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(row) if row.is_claimable() => {
                    row.assigned_agent = Some(agent_id.to_string());
                    row.status = TaskStatus::InProgress;
                    push_history(row, entry);
                    Some(row.clone())
                }
                _ => None,
            }
        };
        self.check_response()?;
        Ok(claimed)
    }

    async fn set_branch(&self, task_id: &str, branch: &str) -> Result<(), StoreError> {
        self.check_request()?;
        if let Some(row) = lock(&self.tasks).iter_mut().find(|t| t.id == task_id) {
            row.branch_name = Some(branch.to_string());
        }
        self.check_response()
    }

    async fn finalize(
        &self,
        task_id: &str,
        agent_id: &str,
        fin: &Finalization,
    ) -> Result<Option<Task>, StoreError> {
        self.check_request()?;
        let updated = {
            let mut tasks = lock(&self.tasks);
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(row) if row.assigned_agent.as_deref() == Some(agent_id) => {
                    row.status = fin.status;
                    row.auto_queued = false;
                    if let Some(branch) = &fin.branch_name {
                        row.branch_name = Some(branch.clone());
                    }
                    if let Some(number) = fin.pr_number {
                        row.pr_number = Some(number);
                    }
                    if let Some(url) = &fin.github_url {
                        row.github_url = Some(url.clone());
                    }
                    push_history(row, &fin.history);
                    push_comment(row, &fin.comment);
                    Some(row.clone())
                }
                _ => None,
            }
        };
        self.check_response()?;
        Ok(updated)
    }

    async fn release(
        &self,
        task_id: &str,
        agent_id: &str,
        rel: &Release,
    ) -> Result<Option<Task>, StoreError> {
        self.check_request()?;
        let released = {
            let mut tasks = lock(&self.tasks);
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(row) if row.assigned_agent.as_deref() == Some(agent_id) => {
                    row.assigned_agent = None;
                    row.status = TaskStatus::Planned;
                    push_history(row, &rel.history);
                    Some(row.clone())
                }
                _ => None,
            }
        };
        if released.as_ref().is_some_and(Task::is_claimable) {
            self.notify();
        }
        self.check_response()?;
        Ok(released)
    }

    async fn upsert_agent(&self, reg: &AgentRegistration) -> Result<(), StoreError> {
        self.check_request()?;
        let mut agents = lock(&self.agents);
        let metrics = agents.get(&reg.id).map(|r| r.metrics).unwrap_or_default();
        agents.insert(
            reg.id.clone(),
            AgentRow {
                registration: reg.clone(),
                status: reg.status,
                current_task_id: None,
                last_heartbeat: reg.last_heartbeat,
                metrics,
            },
        );
        drop(agents);
        self.check_response()
    }

    async fn update_agent(&self, agent_id: &str, update: &AgentUpdate) -> Result<(), StoreError> {
        self.check_request()?;
        if let Some(row) = lock(&self.agents).get_mut(agent_id) {
            if let Some(status) = update.status {
                row.status = status;
            }
            if let Some(current) = &update.current_task_id {
                row.current_task_id = current.clone();
            }
            if let Some(ts) = update.heartbeat {
                row.last_heartbeat = ts;
            }
            if let Some(metrics) = update.metrics {
                row.metrics = metrics;
            }
        }
        self.check_response()
    }

    async fn agent_metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError> {
        self.check_request()?;
        Ok(lock(&self.agents).get(agent_id).map(|r| r.metrics))
    }

    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        self.check_request()?;
        lock(&self.activity).push(entry.clone());
        Ok(())
    }

    async fn insert_pull_request(&self, record: &PullRequestRecord) -> Result<(), StoreError> {
        self.check_request()?;
        lock(&self.pull_requests).push(record.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>, StoreError> {
        if self.no_feed {
            return Ok(None);
        }
        let (tx, rx) = mpsc::channel(16);
        lock(&self.listeners).push(tx);
        Ok(Some(rx))
    }
}
