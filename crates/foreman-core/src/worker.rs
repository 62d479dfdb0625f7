//! Worker orchestrator.
//!
//! One cycle at a time: `Idle → Claiming → Executing → Publishing →
//! Recording → Idle`, with `ShuttingDown` reachable from anywhere. Wake-ups
//! come from store notifications, a poll timer and a short follow-up after
//! each finished task; all of them go through [`Worker::wake`], which drops
//! the wake when a cycle is already in flight. After a local environment
//! failure claims pause for a back-off that doubles per consecutive failure.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    agent::BuildRunner,
    config::Config,
    error::ExecError,
    github::OpenedRequest,
    lifecycle::AgentLifecycle,
    process::{tail_chars, ExecOutcome},
    publisher::Publisher,
    queue::{QueueClient, ReleaseReason},
    types::{Activity, AgentStatus, Comment, Finalization, HistoryEntry, Severity, Task, TaskStatus},
};

const COMMENT_OUTPUT_CHARS: usize = 2000;
const ACTIVITY_OUTPUT_CHARS: usize = 500;
/// Back-off ceiling, in poll intervals.
const BACKOFF_MAX_POLLS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub followup_delay: Duration,
    /// Build on the current checkout when the task branch could not be set up.
    pub proceed_without_branch: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            poll_interval: config.poll_interval,
            followup_delay: config.followup_delay,
            proceed_without_branch: config.proceed_without_branch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Publishing,
    Recording,
    ShuttingDown,
}

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Startup,
    Notification,
    Poll,
    Followup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// A cycle was already running, or the worker is shutting down.
    Skipped,
    /// An earlier terminal write is still unconfirmed; nothing was claimed.
    Deferred,
    /// Claims are paused after an environment failure.
    BackingOff,
    NoWork,
    Completed {
        task_id: String,
        success: bool,
        exit_code: i32,
        pr_number: Option<i64>,
    },
    /// Claim handed back because of a local environment problem.
    Released { task_id: String, reason: String },
    /// Shutdown arrived while the task was held.
    Interrupted { task_id: String },
}

/// A terminal write the store has not confirmed yet.
#[derive(Debug, Clone)]
enum PendingWrite {
    Finalize { task_id: String, fin: Finalization },
    Release { task_id: String, reason: ReleaseReason },
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    until: Instant,
    delay: Duration,
}

/// Single-flight guard: set on acquire, cleared on drop.
struct FlightGuard {
    flag: Arc<AtomicBool>,
}

impl FlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Terminal write for a finished build, entries pre-built for retries.
pub fn build_finalization(
    agent_id: &str,
    outcome: &ExecOutcome,
    branch: Option<&str>,
    request: Option<&OpenedRequest>,
) -> Finalization {
    let success = outcome.success();
    let verdict = if success { "completed" } else { "failed" };

    let mut content = format!(
        "**Auto-build {verdict}** by `{agent_id}` (exit code {})\n",
        outcome.exit_code
    );
    if let Some(pr) = request {
        content.push_str(&format!("**PR:** [#{}]({})\n", pr.number, pr.html_url));
    }
    let tail = tail_chars(&outcome.output, COMMENT_OUTPUT_CHARS).trim();
    let tail = if tail.is_empty() { "(no output captured)" } else { tail };
    content.push_str(&format!("\n```\n{tail}\n```"));

    let mut action = if success {
        "Auto-build completed".to_string()
    } else if outcome.timed_out {
        format!("Auto-build timed out (exit {})", outcome.exit_code)
    } else {
        format!("Auto-build failed (exit {})", outcome.exit_code)
    };
    if let Some(pr) = request {
        action.push_str(&format!(", PR #{}", pr.number));
    }

    Finalization {
        status: if success {
            TaskStatus::Review
        } else {
            TaskStatus::InProgress
        },
        branch_name: branch.map(str::to_string),
        pr_number: request.map(|pr| pr.number),
        github_url: request.map(|pr| pr.html_url.clone()),
        history: HistoryEntry::new(action, agent_id),
        comment: Comment::new(content, agent_id),
    }
}

pub struct Worker {
    queue: QueueClient,
    publisher: Publisher,
    lifecycle: AgentLifecycle,
    runner: Arc<dyn BuildRunner>,
    settings: WorkerSettings,
    is_working: Arc<AtomicBool>,
    state: Mutex<WorkerState>,
    held: Mutex<Option<Task>>,
    pending: Mutex<Option<PendingWrite>>,
    backoff: Mutex<Option<Backoff>>,
    cycle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    wake_tx: mpsc::UnboundedSender<Wake>,
    wake_rx: Mutex<Option<mpsc::UnboundedReceiver<Wake>>>,
    span: Span,
}

impl Worker {
    pub fn new(
        queue: QueueClient,
        publisher: Publisher,
        lifecycle: AgentLifecycle,
        runner: Arc<dyn BuildRunner>,
        settings: WorkerSettings,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let span = info_span!("worker", agent_id = %queue.agent_id());
        Arc::new(Self {
            queue,
            publisher,
            lifecycle,
            runner,
            settings,
            is_working: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(WorkerState::Idle),
            held: Mutex::new(None),
            pending: Mutex::new(None),
            backoff: Mutex::new(None),
            cycle: Mutex::new(None),
            cancel: CancellationToken::new(),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            span,
        })
    }

    pub fn agent_id(&self) -> &str {
        self.queue.agent_id()
    }

    pub fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    pub fn is_working(&self) -> bool {
        self.is_working.load(Ordering::Acquire)
    }

    pub fn held_task_id(&self) -> Option<String> {
        lock(&self.held).as_ref().map(|t| t.id.clone())
    }

    pub fn has_pending_write(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Time left before claims resume after an environment failure.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let backoff = *lock(&self.backoff);
        backoff
            .map(|b| b.until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = lock(&self.state);
        if *current != WorkerState::ShuttingDown {
            *current = state;
        }
    }

    /// Start a cycle in the background unless one is already in flight.
    /// Returns whether a cycle was started.
    pub fn wake(self: &Arc<Self>, reason: Wake) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Some(guard) = FlightGuard::acquire(&self.is_working) else {
            debug!(parent: &self.span, ?reason, "cycle in flight, ignoring wake");
            return false;
        };
        debug!(parent: &self.span, ?reason, "starting cycle");
        let worker = Arc::clone(self);
        let handle = tokio::spawn(
            async move {
                let report = worker.guarded_cycle(guard).await;
                debug!(?report, "cycle finished");
                if matches!(report, CycleReport::Completed { .. }) {
                    worker.schedule_followup();
                }
            }
            .instrument(self.span.clone()),
        );
        *lock(&self.cycle) = Some(handle);
        true
    }

    /// Run one cycle inline, or report `Skipped` when one is in flight.
    pub async fn check_for_work(&self) -> CycleReport {
        if self.cancel.is_cancelled() {
            return CycleReport::Skipped;
        }
        let Some(guard) = FlightGuard::acquire(&self.is_working) else {
            return CycleReport::Skipped;
        };
        self.guarded_cycle(guard)
            .instrument(self.span.clone())
            .await
    }

    async fn guarded_cycle(&self, guard: FlightGuard) -> CycleReport {
        let report = self.cycle().await;
        self.set_state(WorkerState::Idle);
        drop(guard);
        report
    }

    fn schedule_followup(&self) {
        let tx = self.wake_tx.clone();
        let delay = self.settings.followup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Wake::Followup);
        });
    }

    async fn cycle(&self) -> CycleReport {
        if !self.settle_pending().await {
            warn!("previous task write still unconfirmed, not claiming");
            return CycleReport::Deferred;
        }
        if let Some(left) = self.backoff_remaining() {
            debug!(remaining_ms = left.as_millis() as u64, "environment back-off, not claiming");
            return CycleReport::BackingOff;
        }

        self.set_state(WorkerState::Claiming);
        let Some(task) = self.queue.claim_next().await else {
            return CycleReport::NoWork;
        };

        let report = self.process(&task).await;

        if !self.publisher.restore_default().await {
            error!(task_id = %task.id, "working tree left off the default branch");
        }
        report
    }

    async fn process(&self, task: &Task) -> CycleReport {
        let started = Instant::now();
        self.set_state(WorkerState::Executing);
        self.lifecycle
            .set_status(AgentStatus::Working, Some(&task.id))
            .await;
        *lock(&self.held) = Some(task.clone());
        self.lifecycle
            .log_activity(
                Activity::StartedTask,
                Severity::Info,
                Some(&task.id),
                format!("Started: {}", task.title),
                json!({
                    "priority": task.priority,
                    "category": task.category,
                    "runner": self.runner.name(),
                }),
                None,
            )
            .await;

        let setup = self.publisher.create_branch(task).await;
        let branch = match setup.branch.clone() {
            Some(branch) => {
                self.queue.record_branch(&task.id, &branch).await;
                Some(branch)
            }
            None => {
                let failure = setup.failure().unwrap_or_else(|| "unknown step".into());
                if !self.settings.proceed_without_branch {
                    return self
                        .abandon(task, ReleaseReason::BranchSetup(failure))
                        .await;
                }
                warn!(task_id = %task.id, %failure, "branch setup failed, building without a task branch");
                None
            }
        };

        if self.cancel.is_cancelled() {
            return CycleReport::Interrupted {
                task_id: task.id.clone(),
            };
        }

        let outcome = match self.runner.run_build(task, self.cancel.child_token()).await {
            Ok(outcome) => outcome,
            Err(e @ ExecError::Spawn { .. }) => {
                return self
                    .abandon(task, ReleaseReason::SpawnFailure(e.to_string()))
                    .await
            }
            // The build ran but could not be supervised to the end; record
            // it as a failed build.
            Err(e @ ExecError::Io(_)) => {
                error!(task_id = %task.id, error = %e, "lost track of build process");
                ExecOutcome {
                    exit_code: -1,
                    output: e.to_string(),
                    timed_out: false,
                    cancelled: false,
                    duration: started.elapsed(),
                }
            }
        };
        if outcome.cancelled {
            info!(task_id = %task.id, "build interrupted by shutdown");
            return CycleReport::Interrupted {
                task_id: task.id.clone(),
            };
        }

        let success = outcome.success();
        let mut pushed = false;
        let mut request = None;
        if success {
            if let Some(branch) = &branch {
                self.set_state(WorkerState::Publishing);
                pushed = self.publisher.push(branch).await;
                if pushed {
                    request = self.publisher.open_request(task, branch, &outcome.output).await;
                }
            }
        }

        self.set_state(WorkerState::Recording);
        let fin = build_finalization(
            self.agent_id(),
            &outcome,
            branch.as_deref(),
            request.as_ref(),
        );
        *lock(&self.held) = None;
        if !self.queue.finalize(&task.id, &fin).await {
            error!(task_id = %task.id, "finalize unconfirmed, will retry before the next claim");
            *lock(&self.pending) = Some(PendingWrite::Finalize {
                task_id: task.id.clone(),
                fin,
            });
        }

        let duration = started.elapsed();
        self.lifecycle
            .record_outcome(success, duration, AgentStatus::Idle)
            .await;

        let (action, severity, message) = if !success {
            (
                Activity::FailedTask,
                Severity::Error,
                format!("Failed: {} (exit {})", task.title, outcome.exit_code),
            )
        } else if !pushed {
            (
                Activity::CompletedTask,
                Severity::Warn,
                format!("Completed: {} (not published)", task.title),
            )
        } else {
            (
                Activity::CompletedTask,
                Severity::Info,
                format!("Completed: {}", task.title),
            )
        };
        self.lifecycle
            .log_activity(
                action,
                severity,
                Some(&task.id),
                message,
                json!({
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                    "branch": branch,
                    "pr_number": request.as_ref().map(|pr| pr.number),
                    "output_tail": tail_chars(&outcome.output, ACTIVITY_OUTPUT_CHARS),
                }),
                Some(duration),
            )
            .await;

        *lock(&self.backoff) = None;
        CycleReport::Completed {
            task_id: task.id.clone(),
            success,
            exit_code: outcome.exit_code,
            pr_number: request.map(|pr| pr.number),
        }
    }

    /// Hand the claim back after a local environment failure and mark the
    /// agent as errored.
    async fn abandon(&self, task: &Task, reason: ReleaseReason) -> CycleReport {
        let described = reason.describe();
        error!(task_id = %task.id, reason = %described, "abandoning task");
        *lock(&self.held) = None;
        if !self.queue.release(&task.id, &reason).await {
            *lock(&self.pending) = Some(PendingWrite::Release {
                task_id: task.id.clone(),
                reason: reason.clone(),
            });
        }
        self.lifecycle.set_status(AgentStatus::Error, None).await;
        let pause = reason.is_environment().then(|| self.back_off());
        self.lifecycle
            .log_activity(
                Activity::AgentError,
                Severity::Error,
                Some(&task.id),
                format!("Released {}: {described}", task.title),
                json!({
                    "reason": described,
                    "backoff_ms": pause.map(|d| d.as_millis() as u64),
                }),
                None,
            )
            .await;
        CycleReport::Released {
            task_id: task.id.clone(),
            reason: described,
        }
    }

    /// Pause claims for one poll interval, doubling on each consecutive
    /// environment failure.
    fn back_off(&self) -> Duration {
        let base = self.settings.poll_interval;
        let mut backoff = lock(&self.backoff);
        let delay = match *backoff {
            Some(prev) => (prev.delay * 2).min(base * BACKOFF_MAX_POLLS),
            None => base,
        };
        *backoff = Some(Backoff {
            until: Instant::now() + delay,
            delay,
        });
        warn!(delay_ms = delay.as_millis() as u64, "pausing claims after environment failure");
        delay
    }

    async fn settle(&self, write: &PendingWrite) -> bool {
        match write {
            PendingWrite::Finalize { task_id, fin } => self.queue.finalize(task_id, fin).await,
            PendingWrite::Release { task_id, reason } => self.queue.release(task_id, reason).await,
        }
    }

    /// Retry an unconfirmed terminal write. `true` when nothing is pending.
    async fn settle_pending(&self) -> bool {
        let pending = lock(&self.pending).take();
        let Some(write) = pending else {
            return true;
        };
        if self.settle(&write).await {
            return true;
        }
        *lock(&self.pending) = Some(write);
        false
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        let period = self.settings.heartbeat_interval;
        tokio::spawn(
            async move {
                let mut tick =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tick.tick().await;
                    worker.lifecycle.heartbeat().await;
                }
            }
            .instrument(self.span.clone()),
        )
    }

    /// Drive the worker until `shutdown` resolves, then shut down cleanly.
    pub async fn run<F>(self: &Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let Some(mut wake_rx) = lock(&self.wake_rx).take() else {
            warn!(parent: &self.span, "worker already running");
            return;
        };

        let mut notifications = match self.queue.store().subscribe().await {
            Ok(Some(rx)) => {
                info!(parent: &self.span, "subscribed to queue notifications");
                Some(rx)
            }
            Ok(None) => {
                info!(parent: &self.span, "store has no notification feed, polling only");
                None
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "queue subscription failed, polling only");
                None
            }
        };

        let heartbeat = self.spawn_heartbeat();
        let period = self.settings.poll_interval;
        let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.wake(Wake::Startup);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => {
                    self.wake(Wake::Poll);
                }
                Some(reason) = wake_rx.recv() => {
                    self.wake(reason);
                }
                event = next_notification(&mut notifications) => match event {
                    Some(()) => {
                        self.wake(Wake::Notification);
                    }
                    None => {
                        warn!(parent: &self.span, "notification feed closed, polling only");
                        notifications = None;
                    }
                },
            }
        }

        heartbeat.abort();
        self.shutdown().await;
    }

    /// Cancel any running build, settle the held task, go offline.
    pub async fn shutdown(&self) {
        let span = self.span.clone();
        async {
            info!("shutting down");
            self.set_state(WorkerState::ShuttingDown);
            self.cancel.cancel();

            let running = lock(&self.cycle).take();
            if let Some(handle) = running {
                if let Err(e) = handle.await {
                    warn!(error = %e, "cycle task ended abnormally");
                }
            }

            let pending = lock(&self.pending).take();
            if let Some(write) = pending {
                if !self.settle(&write).await {
                    error!(?write, "terminal write lost at shutdown");
                }
            }

            let held = lock(&self.held).take();
            if let Some(task) = held {
                if self.queue.release(&task.id, &ReleaseReason::Shutdown).await {
                    self.lifecycle
                        .log_activity(
                            Activity::ReleasedTask,
                            Severity::Warn,
                            Some(&task.id),
                            format!("Released on shutdown: {}", task.title),
                            json!({ "reason": "shutdown" }),
                            None,
                        )
                        .await;
                } else {
                    error!(task_id = %task.id, "failed to release task on shutdown");
                }
            }

            self.lifecycle.mark_offline().await;
            self.lifecycle
                .log_activity(
                    Activity::AgentStopped,
                    Severity::Info,
                    None,
                    format!("{} stopped", self.agent_id()),
                    json!({}),
                    None,
                )
                .await;
        }
        .instrument(span)
        .await;
    }
}

async fn next_notification(feed: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
