//! Shared task store.
//!
//! The store is an external collaborator exposing row-level reads, inserts
//! and conditional updates. Three backends implement [`TaskStore`]:
//!
//! - `postgres://…`: direct PostgreSQL ([`PgStore`]), with server-side
//!   `jsonb` appends and `LISTEN`-based change notifications.
//! - `http(s)://…`: PostgREST / Supabase REST ([`RestStore`]), poll only.
//! - `memory://`: in-process ([`MemoryStore`]), for dry runs and tests.
//!
//! Every backend must implement `claim` as a single conditional write on
//! `assigned_agent IS NULL`; nothing here relies on client-side locking.

mod memory;
mod postgres;
mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::{AgentRow, MemoryStore};
pub use postgres::PgStore;
pub use rest::RestStore;

use crate::{
    error::StoreError,
    types::{
        ActivityEntry, AgentMetrics, AgentRegistration, AgentUpdate, Finalization, HistoryEntry,
        PullRequestRecord, Release, Task,
    },
};

/// Channel name used for "task became eligible" notifications.
pub const QUEUE_CHANNEL: &str = "foreman_task_queued";

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Queued, unassigned tasks in `requested`/`planned`, oldest first.
    async fn list_claimable(&self) -> Result<Vec<Task>, StoreError>;

    /// Conditionally assign `task` to `agent_id`, moving it to `in_progress`
    /// and appending `entry`. `Ok(None)` when another agent won the race or
    /// the row disappeared.
    async fn claim(
        &self,
        task: &Task,
        agent_id: &str,
        entry: &HistoryEntry,
    ) -> Result<Option<Task>, StoreError>;

    async fn set_branch(&self, task_id: &str, branch: &str) -> Result<(), StoreError>;

    /// Terminal write, guarded on `assigned_agent = agent_id`. Entries whose
    /// id is already present are not appended again. `Ok(None)` when the
    /// task is no longer owned by `agent_id`.
    async fn finalize(
        &self,
        task_id: &str,
        agent_id: &str,
        fin: &Finalization,
    ) -> Result<Option<Task>, StoreError>;

    /// Clear ownership and reset to `planned`, guarded on ownership.
    async fn release(
        &self,
        task_id: &str,
        agent_id: &str,
        rel: &Release,
    ) -> Result<Option<Task>, StoreError>;

    async fn upsert_agent(&self, reg: &AgentRegistration) -> Result<(), StoreError>;

    async fn update_agent(&self, agent_id: &str, update: &AgentUpdate) -> Result<(), StoreError>;

    async fn agent_metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError>;

    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError>;

    async fn insert_pull_request(&self, record: &PullRequestRecord) -> Result<(), StoreError>;

    /// Push channel of "task became eligible" events. `None` when the
    /// backend has no push transport and polling is the only trigger.
    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>, StoreError> {
        Ok(None)
    }
}

/// Open the backend selected by the URL scheme.
pub async fn connect(url: &str, key: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PgStore::connect(url).await?))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(RestStore::new(url, key)?))
    } else if url.starts_with("memory://") {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Err(StoreError::InvalidUrl(url.to_string()))
    }
}
