use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StoreError;

// ── Deserialization helpers ──────────────────────────────────────────────

/// Treat an explicit JSON `null` the same as a missing field.
fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Row ids are opaque: accept strings (uuid) and integers alike.
fn opaque_id<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or integer id, got {other}"
        ))),
    }
}

/// Timestamps come from several writers; anything unparsable becomes `None`.
fn lenient_ts<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|ndt| ndt.and_utc())
        .ok())
}

// ── Task ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    /// Missing or unrecognised priority; sorts after every ranked one.
    #[default]
    #[serde(other)]
    Unranked,
}

impl Priority {
    /// Claim order: lower ranks are attempted first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
            Self::Unranked => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Unranked => "unranked",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Requested,
    Planned,
    InProgress,
    Review,
    Done,
    /// Any status this agent never acts on.
    #[serde(other)]
    Other,
}

impl TaskStatus {
    /// Statuses from which a queued, unassigned task may be claimed.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Requested | Self::Planned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(default, deserialize_with = "null_default")]
    pub text: String,
    #[serde(default, deserialize_with = "null_default")]
    pub done: bool,
}

/// One append-only history line on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique per logical event; lets a retried write recognise itself.
    /// Entries written by other tools may not carry one.
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub action: String,
    #[serde(default, deserialize_with = "null_default")]
    pub actor: String,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn new(action: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            actor: actor.into(),
            at: Some(Utc::now()),
        }
    }
}

/// One append-only comment on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default, deserialize_with = "null_default", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "null_default")]
    pub author: String,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(content: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            author: author.into(),
            created_at: Some(Utc::now()),
        }
    }
}

/// A roadmap item as stored in the shared `roadmap_items` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    pub title: String,
    /// Module / area the item belongs to.
    #[serde(default, deserialize_with = "null_default")]
    pub category: String,
    #[serde(default, deserialize_with = "null_default")]
    pub description: String,
    #[serde(default, deserialize_with = "null_default")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "null_default")]
    pub status: TaskStatus,
    /// Eligible for autonomous pickup.
    #[serde(default, deserialize_with = "null_default")]
    pub auto_queued: bool,
    /// `None` means unclaimed.
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub files_affected: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub subtasks: Vec<Subtask>,
    #[serde(default, deserialize_with = "null_default")]
    pub depends_on: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub history: Vec<HistoryEntry>,
    #[serde(default, deserialize_with = "null_default")]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub github_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_ts")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Validate a raw store row into a `Task`.
    ///
    /// Shape errors surface here as `StoreError::Malformed` instead of
    /// leaking half-populated records into instruction text.
    pub fn from_row(row: serde_json::Value) -> Result<Self, StoreError> {
        let id = row
            .get("id")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "<missing>".into());
        let task: Task = serde_json::from_value(row).map_err(|e| StoreError::Malformed {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        if task.id.trim().is_empty() {
            return Err(StoreError::Malformed {
                id,
                reason: "empty id".into(),
            });
        }
        Ok(task)
    }

    /// Unclaimed, queued and in a pickup status.
    pub fn is_claimable(&self) -> bool {
        self.auto_queued && self.assigned_agent.is_none() && self.status.is_claimable()
    }

    pub fn pending_subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter().filter(|s| !s.done)
    }

    /// Short id prefix used in branch names.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }
}

/// Stable priority sort; ties keep the store's creation order.
pub fn sort_by_priority(tasks: &mut [Task]) {
    tasks.sort_by_key(|t| t.priority.rank());
}

// ── Task writes ──────────────────────────────────────────────────────────

/// Terminal write for a finished cycle. Entries are pre-built by the caller
/// so a retried write can be recognised by entry id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization {
    /// `Review` on success, `InProgress` on failure.
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub github_url: Option<String>,
    pub history: HistoryEntry,
    pub comment: Comment,
}

/// Ownership hand-back. `auto_queued` is left as it was, so the task goes
/// straight back into the claimable set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub history: HistoryEntry,
}

// ── Agent registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub avg_duration_ms: u64,
    #[serde(default)]
    pub error_count: u64,
}

impl AgentMetrics {
    /// Fold one finished task into the running mean.
    pub fn record(self, success: bool, duration_ms: u64) -> Self {
        let completed = self.tasks_completed + 1;
        let total = self.avg_duration_ms as f64 * self.tasks_completed as f64 + duration_ms as f64;
        Self {
            tasks_completed: completed,
            avg_duration_ms: (total / completed as f64).round() as u64,
            error_count: self.error_count + u64::from(!success),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRuntimeConfig {
    pub timeout_ms: u64,
    pub pid: u32,
}

/// Upsert payload written once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub machine_url: String,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: Vec<String>,
    pub config: AgentRuntimeConfig,
}

/// Partial update of an `agent_registry` row; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    /// `Some(None)` clears the current task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Option<String>>,
    #[serde(rename = "last_heartbeat", skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
}

/// `builder-1` → `Builder 1`.
pub fn display_name(agent_id: &str) -> String {
    agent_id
        .split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Activity log ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    AgentStarted,
    StartedTask,
    CompletedTask,
    FailedTask,
    AgentError,
    ReleasedTask,
    AgentStopped,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::StartedTask => "started_task",
            Self::CompletedTask => "completed_task",
            Self::FailedTask => "failed_task",
            Self::AgentError => "agent_error",
            Self::ReleasedTask => "released_task",
            Self::AgentStopped => "agent_stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Write-once audit record in `agent_activity_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub agent_id: String,
    pub roadmap_item_id: Option<String>,
    pub action: Activity,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub duration_ms: Option<u64>,
}

// ── Pull requests ────────────────────────────────────────────────────────

/// Local record of an opened pull request (`github_pull_requests`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub roadmap_item_id: String,
    pub agent_id: String,
    pub pr_number: i64,
    pub branch_name: String,
    pub title: String,
    pub body: String,
    pub status: String,
    pub github_url: String,
}
