use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_types::ToSql;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, info, warn};

use super::{TaskStore, QUEUE_CHANNEL};
use crate::{
    error::StoreError,
    types::{
        ActivityEntry, AgentMetrics, AgentRegistration, AgentUpdate, Finalization, HistoryEntry,
        PullRequestRecord, Release, Task,
    },
};

const SCHEMA_SQL: &str = include_str!("../../schema.sql");

const POOL_SIZE: usize = 4;

// ── SQL ───────────────────────────────────────────────────────────────────

const LIST_CLAIMABLE: &str = "SELECT to_jsonb(r) FROM roadmap_items AS r \
     WHERE r.auto_queued AND r.assigned_agent IS NULL \
       AND r.status IN ('requested', 'planned') \
     ORDER BY r.created_at ASC";

const CLAIM: &str = "UPDATE roadmap_items AS r \
     SET assigned_agent = $2, \
         status = 'in_progress', \
         history = COALESCE(r.history, '[]'::jsonb) || jsonb_build_array($3::jsonb), \
         updated_at = now() \
     WHERE r.id::text = $1 \
       AND r.assigned_agent IS NULL \
       AND r.auto_queued \
       AND r.status IN ('requested', 'planned') \
     RETURNING to_jsonb(r)";

const SET_BRANCH: &str =
    "UPDATE roadmap_items SET branch_name = $2, updated_at = now() WHERE id::text = $1";

const UPSERT_AGENT: &str = "INSERT INTO agent_registry \
       (id, name, agent_type, status, machine_url, last_heartbeat, capabilities, config, current_task_id) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL) \
     ON CONFLICT (id) DO UPDATE SET \
       name = EXCLUDED.name, \
       agent_type = EXCLUDED.agent_type, \
       status = EXCLUDED.status, \
       machine_url = EXCLUDED.machine_url, \
       last_heartbeat = EXCLUDED.last_heartbeat, \
       capabilities = EXCLUDED.capabilities, \
       config = EXCLUDED.config, \
       current_task_id = NULL";

const UPDATE_AGENT: &str = "UPDATE agent_registry SET \
       status = COALESCE($2::text, status), \
       current_task_id = CASE WHEN $3::boolean THEN $4::text ELSE current_task_id END, \
       last_heartbeat = COALESCE($5::timestamptz, last_heartbeat), \
       metrics = COALESCE($6::jsonb, metrics) \
     WHERE id = $1";

const AGENT_METRICS: &str = "SELECT metrics FROM agent_registry WHERE id = $1";

const INSERT_ACTIVITY: &str = "INSERT INTO agent_activity_log \
       (agent_id, roadmap_item_id, action, severity, message, details, duration_ms) \
     VALUES ($1, $2::text::uuid, $3, $4, $5, $6, $7)";

const INSERT_PULL_REQUEST: &str = "INSERT INTO github_pull_requests \
       (roadmap_item_id, agent_id, pr_number, branch_name, title, body, status, github_url) \
     VALUES ($1::text::uuid, $2, $3, $4, $5, $6, $7, $8)";

/// `col || [entry]` unless an element with the same `id` is already present.
fn append_once(col: &str, param: &str) -> String {
    format!(
        "CASE WHEN COALESCE(r.{col}, '[]'::jsonb) @> \
           jsonb_build_array(jsonb_build_object('id', {param}::jsonb -> 'id')) \
         THEN r.{col} \
         ELSE COALESCE(r.{col}, '[]'::jsonb) || jsonb_build_array({param}::jsonb) END"
    )
}

fn finalize_sql() -> String {
    format!(
        "UPDATE roadmap_items AS r SET \
           status = $3::text, \
           auto_queued = false, \
           branch_name = COALESCE($4::text, r.branch_name), \
           pr_number = COALESCE($5::bigint, r.pr_number), \
           github_url = COALESCE($6::text, r.github_url), \
           history = {}, \
           comments = {}, \
           updated_at = now() \
         WHERE r.id::text = $1 AND r.assigned_agent = $2 \
         RETURNING to_jsonb(r)",
        append_once("history", "$7"),
        append_once("comments", "$8"),
    )
}

fn release_sql() -> String {
    format!(
        "UPDATE roadmap_items AS r SET \
           assigned_agent = NULL, \
           status = 'planned', \
           history = {}, \
           updated_at = now() \
         WHERE r.id::text = $1 AND r.assigned_agent = $2 \
         RETURNING to_jsonb(r)",
        append_once("history", "$3"),
    )
}

// ── PgStore ───────────────────────────────────────────────────────────────

/// Direct PostgreSQL backend.
///
/// History and comment appends happen server-side, so a concurrent append
/// from another writer is never overwritten.
pub struct PgStore {
    pool: Pool,
    url: String,
}

impl PgStore {
    /// Build the pool, probe one connection and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pg_config = url.parse::<tokio_postgres::Config>()?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager).max_size(POOL_SIZE).build()?;
        let store = Self {
            pool,
            url: url.to_string(),
        };
        store.migrate().await?;
        info!("connected to task store (postgres)");
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }

    async fn update_returning(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Task>, StoreError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(sql, params).await?;
        row.map(|r| Task::from_row(r.get::<_, serde_json::Value>(0)))
            .transpose()
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn list_claimable(&self) -> Result<Vec<Task>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client.query(LIST_CLAIMABLE, &[]).await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match Task::from_row(row.get::<_, serde_json::Value>(0)) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(error = %e, "skipping malformed roadmap item"),
            }
        }
        Ok(tasks)
    }

    async fn claim(
        &self,
        task: &Task,
        agent_id: &str,
        entry: &HistoryEntry,
    ) -> Result<Option<Task>, StoreError> {
        let entry = serde_json::to_value(entry)?;
        self.update_returning(CLAIM, &[&task.id, &agent_id, &entry])
            .await
    }

    async fn set_branch(&self, task_id: &str, branch: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.execute(SET_BRANCH, &[&task_id, &branch]).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        task_id: &str,
        agent_id: &str,
        fin: &Finalization,
    ) -> Result<Option<Task>, StoreError> {
        let history = serde_json::to_value(&fin.history)?;
        let comment = serde_json::to_value(&fin.comment)?;
        self.update_returning(
            &finalize_sql(),
            &[
                &task_id,
                &agent_id,
                &fin.status.as_str(),
                &fin.branch_name,
                &fin.pr_number,
                &fin.github_url,
                &history,
                &comment,
            ],
        )
        .await
    }

    async fn release(
        &self,
        task_id: &str,
        agent_id: &str,
        rel: &Release,
    ) -> Result<Option<Task>, StoreError> {
        let history = serde_json::to_value(&rel.history)?;
        self.update_returning(
            &release_sql(),
            &[&task_id, &agent_id, &history],
        )
        .await
    }

    async fn upsert_agent(&self, reg: &AgentRegistration) -> Result<(), StoreError> {
        let config = serde_json::to_value(&reg.config)?;
        let client = self.pool.get().await?;
        client
            .execute(
                UPSERT_AGENT,
                &[
                    &reg.id,
                    &reg.name,
                    &reg.agent_type,
                    &reg.status.as_str(),
                    &reg.machine_url,
                    &reg.last_heartbeat,
                    &reg.capabilities,
                    &config,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_agent(&self, agent_id: &str, update: &AgentUpdate) -> Result<(), StoreError> {
        let status = update.status.map(|s| s.as_str());
        let touch_task = update.current_task_id.is_some();
        let current_task = update.current_task_id.clone().flatten();
        let metrics = update.metrics.map(serde_json::to_value).transpose()?;
        let client = self.pool.get().await?;
        client
            .execute(
                UPDATE_AGENT,
                &[
                    &agent_id,
                    &status,
                    &touch_task,
                    &current_task,
                    &update.heartbeat,
                    &metrics,
                ],
            )
            .await?;
        Ok(())
    }

    async fn agent_metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError> {
        let client = self.pool.get().await?;
        let Some(row) = client.query_opt(AGENT_METRICS, &[&agent_id]).await? else {
            return Ok(None);
        };
        let metrics = match row.get::<_, Option<serde_json::Value>>(0) {
            Some(value) => serde_json::from_value(value)?,
            None => AgentMetrics::default(),
        };
        Ok(Some(metrics))
    }

    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        let duration = entry.duration_ms.map(|d| d as i64);
        let client = self.pool.get().await?;
        client
            .execute(
                INSERT_ACTIVITY,
                &[
                    &entry.agent_id,
                    &entry.roadmap_item_id,
                    &entry.action.as_str(),
                    &entry.severity.as_str(),
                    &entry.message,
                    &entry.details,
                    &duration,
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_pull_request(&self, record: &PullRequestRecord) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute(
                INSERT_PULL_REQUEST,
                &[
                    &record.roadmap_item_id,
                    &record.agent_id,
                    &record.pr_number,
                    &record.branch_name,
                    &record.title,
                    &record.body,
                    &record.status,
                    &record.github_url,
                ],
            )
            .await?;
        Ok(())
    }

    /// Dedicated connection outside the pool running `LISTEN`. The returned
    /// channel closes when that connection drops; callers fall back to polling.
    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<()>>, StoreError> {
        let (client, mut connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        let (tx, rx) = mpsc::channel(16);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let _done = done_tx;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = std::future::poll_fn(|cx| connection.poll_message(cx)) => match msg {
                        Some(Ok(AsyncMessage::Notification(n))) => {
                            debug!(channel = n.channel(), task_id = n.payload(), "queue notification");
                            // A full channel already holds a pending wake-up.
                            let _ = tx.try_send(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "notification connection failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        client.batch_execute(&format!("LISTEN {QUEUE_CHANNEL}")).await?;
        info!(channel = QUEUE_CHANNEL, "listening for queued tasks");

        // Keep the client (and with it the session) alive for as long as
        // the connection task runs.
        tokio::spawn(async move {
            let _client = client;
            let _ = done_rx.await;
        });

        Ok(Some(rx))
    }
}
