use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::TaskStore;
use crate::{
    error::StoreError,
    types::{
        ActivityEntry, AgentMetrics, AgentRegistration, AgentUpdate, Comment, Finalization,
        HistoryEntry, PullRequestRecord, Release, Task, TaskStatus,
    },
};

const CLAIMABLE_STATUSES: &str = "in.(requested,planned)";

/// PostgREST / Supabase REST backend.
///
/// Row filters in the query string make every write conditional. `jsonb`
/// columns cannot be appended server-side through PostgREST, so terminal
/// writes re-read the row first and merge entries by id.
pub struct RestStore {
    http: reqwest::Client,
    base: String,
    key: String,
}

fn merge_history(existing: &[HistoryEntry], entry: &HistoryEntry) -> Vec<HistoryEntry> {
    let mut merged = existing.to_vec();
    if entry.id.is_empty() || !merged.iter().any(|h| h.id == entry.id) {
        merged.push(entry.clone());
    }
    merged
}

fn merge_comments(existing: &[Comment], comment: &Comment) -> Vec<Comment> {
    let mut merged = existing.to_vec();
    if comment.id.is_empty() || !merged.iter().any(|c| c.id == comment.id) {
        merged.push(comment.clone());
    }
    merged
}

impl RestStore {
    pub fn new(url: &str, key: &str) -> Result<Self, StoreError> {
        let trimmed = url.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        let base = if trimmed.ends_with("/rest/v1") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/rest/v1")
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        info!(base = %base, "using task store (rest)");
        Ok(Self {
            http,
            base,
            key: key.to_string(),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}/{table}", self.base))
            .header("Content-Type", "application/json");
        if self.key.is_empty() {
            req
        } else {
            req.header("apikey", &self.key).bearer_auth(&self.key)
        }
    }

    async fn send(req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn rows(req: RequestBuilder) -> Result<Vec<Value>, StoreError> {
        Ok(Self::send(req).await?.json::<Vec<Value>>().await?)
    }

    /// First returned row as a task; `None` when the filter matched nothing.
    async fn first_task(req: RequestBuilder) -> Result<Option<Task>, StoreError> {
        Self::rows(req)
            .await?
            .into_iter()
            .next()
            .map(Task::from_row)
            .transpose()
    }

    async fn fetch(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let req = self
            .request(Method::GET, "roadmap_items")
            .query(&[("select", "*"), ("id", format!("eq.{task_id}").as_str())]);
        Self::first_task(req).await
    }

    /// PATCH a task row guarded on id and current owner, returning the row.
    async fn patch_owned(
        &self,
        task_id: &str,
        agent_id: &str,
        body: &Value,
    ) -> Result<Option<Task>, StoreError> {
        let req = self
            .request(Method::PATCH, "roadmap_items")
            .query(&[
                ("id", format!("eq.{task_id}")),
                ("assigned_agent", format!("eq.{agent_id}")),
            ])
            .header("Prefer", "return=representation")
            .json(body);
        Self::first_task(req).await
    }
}

#[async_trait]
impl TaskStore for RestStore {
    async fn list_claimable(&self) -> Result<Vec<Task>, StoreError> {
        let req = self.request(Method::GET, "roadmap_items").query(&[
            ("select", "*"),
            ("auto_queued", "eq.true"),
            ("assigned_agent", "is.null"),
            ("status", CLAIMABLE_STATUSES),
            ("order", "created_at.asc"),
        ]);
        let mut tasks = Vec::new();
        for row in Self::rows(req).await? {
            match Task::from_row(row) {
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
        let body = json!({
            "assigned_agent": agent_id,
            "status": TaskStatus::InProgress,
            "history": merge_history(&task.history, entry),
        });
        let req = self
            .request(Method::PATCH, "roadmap_items")
            .query(&[
                ("id", format!("eq.{}", task.id)),
                ("assigned_agent", "is.null".to_string()),
                ("auto_queued", "eq.true".to_string()),
                ("status", CLAIMABLE_STATUSES.to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(&body);
        Self::first_task(req).await
    }

    async fn set_branch(&self, task_id: &str, branch: &str) -> Result<(), StoreError> {
        let req = self
            .request(Method::PATCH, "roadmap_items")
            .query(&[("id", format!("eq.{task_id}"))])
            .json(&json!({ "branch_name": branch }));
        Self::send(req).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        task_id: &str,
        agent_id: &str,
        fin: &Finalization,
    ) -> Result<Option<Task>, StoreError> {
        let Some(current) = self.fetch(task_id).await? else {
            return Ok(None);
        };
        if current.assigned_agent.as_deref() != Some(agent_id) {
            return Ok(None);
        }
        let mut body = json!({
            "status": fin.status,
            "auto_queued": false,
            "history": merge_history(&current.history, &fin.history),
            "comments": merge_comments(&current.comments, &fin.comment),
        });
        if let Some(branch) = &fin.branch_name {
            body["branch_name"] = json!(branch);
        }
        if let Some(number) = fin.pr_number {
            body["pr_number"] = json!(number);
        }
        if let Some(url) = &fin.github_url {
            body["github_url"] = json!(url);
        }
        self.patch_owned(task_id, agent_id, &body).await
    }

    async fn release(
        &self,
        task_id: &str,
        agent_id: &str,
        rel: &Release,
    ) -> Result<Option<Task>, StoreError> {
        let Some(current) = self.fetch(task_id).await? else {
            return Ok(None);
        };
        if current.assigned_agent.as_deref() != Some(agent_id) {
            return Ok(None);
        }
        let body = json!({
            "assigned_agent": Value::Null,
            "status": TaskStatus::Planned,
            "history": merge_history(&current.history, &rel.history),
        });
        self.patch_owned(task_id, agent_id, &body).await
    }

    async fn upsert_agent(&self, reg: &AgentRegistration) -> Result<(), StoreError> {
        let mut body = serde_json::to_value(reg)?;
        body["current_task_id"] = Value::Null;
        let req = self
            .request(Method::POST, "agent_registry")
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body);
        Self::send(req).await?;
        Ok(())
    }

    async fn update_agent(&self, agent_id: &str, update: &AgentUpdate) -> Result<(), StoreError> {
        let req = self
            .request(Method::PATCH, "agent_registry")
            .query(&[("id", format!("eq.{agent_id}"))])
            .json(update);
        Self::send(req).await?;
        Ok(())
    }

    async fn agent_metrics(&self, agent_id: &str) -> Result<Option<AgentMetrics>, StoreError> {
        let req = self
            .request(Method::GET, "agent_registry")
            .query(&[("select", "metrics"), ("id", format!("eq.{agent_id}").as_str())]);
        let Some(row) = Self::rows(req).await?.into_iter().next() else {
            return Ok(None);
        };
        match row.get("metrics") {
            Some(Value::Null) | None => Ok(Some(AgentMetrics::default())),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    async fn insert_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        let req = self
            .request(Method::POST, "agent_activity_log")
            .header("Prefer", "return=minimal")
            .json(entry);
        Self::send(req).await?;
        Ok(())
    }

    async fn insert_pull_request(&self, record: &PullRequestRecord) -> Result<(), StoreError> {
        let req = self
            .request(Method::POST, "github_pull_requests")
            .header("Prefer", "return=minimal")
            .json(record);
        Self::send(req).await?;
        Ok(())
    }
}
