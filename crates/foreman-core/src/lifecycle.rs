use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::StoreError,
    store::TaskStore,
    types::{
        display_name, Activity, ActivityEntry, AgentRegistration, AgentRuntimeConfig, AgentStatus,
        AgentUpdate, Severity,
    },
};

/// Static identity written at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub machine_url: String,
    pub timeout: Duration,
}

/// Status and task last written to the registry. Held across every
/// registry write so a heartbeat never interleaves with a transition.
#[derive(Debug, Clone, Default)]
struct Reported {
    status: AgentStatus,
    current_task_id: Option<String>,
}

/// One agent's registry record and audit trail.
pub struct AgentLifecycle {
    store: Arc<dyn TaskStore>,
    identity: AgentIdentity,
    reported: Mutex<Reported>,
}

impl AgentLifecycle {
    pub fn new(store: Arc<dyn TaskStore>, identity: AgentIdentity) -> Self {
        Self {
            store,
            identity,
            reported: Mutex::new(Reported::default()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.identity.agent_id
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Upsert the registry row as `idle`. Errors are returned: an agent that
    /// failed to register must not start claiming.
    pub async fn register(&self) -> Result<(), StoreError> {
        let reg = AgentRegistration {
            id: self.identity.agent_id.clone(),
            name: display_name(&self.identity.agent_id),
            agent_type: self.identity.agent_type.clone(),
            status: AgentStatus::Idle,
            machine_url: self.identity.machine_url.clone(),
            last_heartbeat: Utc::now(),
            capabilities: self.identity.capabilities.clone(),
            config: AgentRuntimeConfig {
                timeout_ms: self.identity.timeout.as_millis() as u64,
                pid: std::process::id(),
            },
        };
        {
            let mut reported = self.reported.lock().await;
            self.store.upsert_agent(&reg).await?;
            *reported = Reported::default();
        }
        info!(agent_id = %reg.id, name = %reg.name, "registered agent");
        self.log_activity(
            Activity::AgentStarted,
            Severity::Info,
            None,
            format!("{} started on {}", reg.name, reg.machine_url),
            serde_json::json!({ "capabilities": reg.capabilities, "pid": reg.config.pid }),
            None,
        )
        .await;
        Ok(())
    }

    /// Liveness write of the last reported status and task; failures are
    /// logged and otherwise ignored.
    pub async fn heartbeat(&self) {
        let reported = self.reported.lock().await;
        let update = AgentUpdate {
            status: Some(reported.status),
            current_task_id: Some(reported.current_task_id.clone()),
            heartbeat: Some(Utc::now()),
            metrics: None,
        };
        match self.store.update_agent(&self.identity.agent_id, &update).await {
            Ok(()) => debug!(status = %reported.status, "heartbeat"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }

    /// Status transition, with the current task when one is held.
    pub async fn set_status(&self, status: AgentStatus, current_task_id: Option<&str>) {
        let mut reported = self.reported.lock().await;
        reported.status = status;
        reported.current_task_id = current_task_id.map(str::to_string);
        let update = AgentUpdate {
            status: Some(status),
            current_task_id: Some(reported.current_task_id.clone()),
            heartbeat: Some(Utc::now()),
            metrics: None,
        };
        if let Err(e) = self.store.update_agent(&self.identity.agent_id, &update).await {
            warn!(%status, error = %e, "failed to update agent status");
        }
    }

    /// Fold one finished task into the agent metrics, then write them with
    /// `next_status` and the current task cleared.
    pub async fn record_outcome(&self, success: bool, duration: Duration, next_status: AgentStatus) {
        let mut reported = self.reported.lock().await;
        reported.status = next_status;
        reported.current_task_id = None;
        let metrics = match self.store.agent_metrics(&self.identity.agent_id).await {
            Ok(current) => Some(current.unwrap_or_default().record(success, duration.as_millis() as u64)),
            Err(e) => {
                warn!(error = %e, "failed to read agent metrics, metrics not updated");
                None
            }
        };
        let update = AgentUpdate {
            status: Some(next_status),
            current_task_id: Some(None),
            heartbeat: Some(Utc::now()),
            metrics,
        };
        match self.store.update_agent(&self.identity.agent_id, &update).await {
            Ok(()) => {
                if let Some(metrics) = metrics {
                    debug!(
                        tasks_completed = metrics.tasks_completed,
                        avg_duration_ms = metrics.avg_duration_ms,
                        error_count = metrics.error_count,
                        "metrics updated"
                    );
                }
            }
            Err(e) => warn!(status = %next_status, error = %e, "failed to write agent metrics"),
        }
    }

    pub async fn mark_offline(&self) {
        self.set_status(AgentStatus::Offline, None).await;
        info!(agent_id = %self.identity.agent_id, "agent offline");
    }

    /// Append to the activity log. Write-only; failures never propagate.
    pub async fn log_activity(
        &self,
        action: Activity,
        severity: Severity,
        task_id: Option<&str>,
        message: impl Into<String>,
        details: Value,
        duration: Option<Duration>,
    ) {
        let entry = ActivityEntry {
            agent_id: self.identity.agent_id.clone(),
            roadmap_item_id: task_id.map(str::to_string),
            action,
            severity,
            message: message.into(),
            details,
            duration_ms: duration.map(|d| d.as_millis() as u64),
        };
        if let Err(e) = self.store.insert_activity(&entry).await {
            warn!(action = action.as_str(), error = %e, "failed to write activity log");
        }
    }
}
