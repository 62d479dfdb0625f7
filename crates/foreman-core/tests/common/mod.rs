#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foreman_core::{
    agent::BuildRunner,
    error::{ExecError, PublishError},
    git::SourceControl,
    github::{OpenedRequest, PullRequestHost},
    lifecycle::{AgentIdentity, AgentLifecycle},
    process::{self, ExecOutcome, ProcessSpec},
    publisher::Publisher,
    queue::QueueClient,
    store::{MemoryStore, TaskStore},
    types::Task,
    worker::{Worker, WorkerSettings},
};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const AGENT: &str = "builder-1";

pub fn task(id: &str, title: &str, priority: &str) -> Task {
    Task::from_row(json!({
        "id": id,
        "title": title,
        "category": "auth",
        "description": "Implement it.",
        "priority": priority,
        "status": "planned",
        "auto_queued": true,
        "assigned_agent": null,
    }))
    .unwrap()
}

// ── Source control ───────────────────────────────────────────────────────

/// Records git operations and tracks the checked-out branch.
pub struct FakeScm {
    pub calls: Mutex<Vec<String>>,
    pub branch: Mutex<String>,
    pub fail_step: Mutex<Option<&'static str>>,
    pub fail_push: AtomicBool,
}

impl Default for FakeScm {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            branch: Mutex::new("main".into()),
            fail_step: Mutex::new(None),
            fail_push: AtomicBool::new(false),
        }
    }
}

impl FakeScm {
    pub fn current(&self) -> String {
        self.branch.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, step: &'static str, arg: &str) -> Result<(), PublishError> {
        self.calls.lock().unwrap().push(format!("{step} {arg}"));
        if *self.fail_step.lock().unwrap() == Some(step) {
            return Err(PublishError::Git {
                step: step.into(),
                output: "fatal: unable to access remote".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn checkout(&self, branch: &str) -> Result<(), PublishError> {
        self.record("checkout", branch)?;
        *self.branch.lock().unwrap() = branch.to_string();
        Ok(())
    }

    async fn pull(&self, branch: &str) -> Result<(), PublishError> {
        self.record("pull", branch)
    }

    async fn create_branch(&self, branch: &str) -> Result<(), PublishError> {
        self.record("create_branch", branch)?;
        *self.branch.lock().unwrap() = branch.to_string();
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<(), PublishError> {
        self.record("push", branch)?;
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(PublishError::Git {
                step: "push".into(),
                output: "rejected".into(),
            });
        }
        Ok(())
    }

    async fn restore(&self, branch: &str) -> Result<(), PublishError> {
        self.record("restore", branch)?;
        *self.branch.lock().unwrap() = branch.to_string();
        Ok(())
    }
}

// ── Real git fixture ─────────────────────────────────────────────────────

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// Bare `origin` plus a working clone on `main` with one commit.
pub fn fixture_repo() -> (tempfile::TempDir, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let remote = root.path().join("origin.git");
    let work = root.path().join("work");
    std::fs::create_dir_all(&remote).unwrap();
    std::fs::create_dir_all(&work).unwrap();

    git(&remote, &["init", "--bare", "-q"]);
    git(&work, &["init", "-q"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&work, &["config", "user.email", "ci@example.com"]);
    git(&work, &["config", "user.name", "CI"]);
    git(&work, &["config", "commit.gpgsign", "false"]);
    std::fs::write(work.join("README.md"), "app\n").unwrap();
    git(&work, &["add", "."]);
    git(&work, &["commit", "-q", "-m", "init"]);
    git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]);
    git(&work, &["push", "-q", "-u", "origin", "main"]);
    (root, work)
}

// ── Pull request host ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeHost {
    /// (head, base, title, body)
    pub opened: Mutex<Vec<(String, String, String, String)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl PullRequestHost for FakeHost {
    async fn open_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedRequest, PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Status {
                status: 422,
                body: "Validation Failed".into(),
            });
        }
        let mut opened = self.opened.lock().unwrap();
        opened.push((head.into(), base.into(), title.into(), body.into()));
        let number = 6 + opened.len() as i64;
        Ok(OpenedRequest {
            number,
            html_url: format!("https://github.com/acme/app/pull/{number}"),
        })
    }
}

// ── Build runners ────────────────────────────────────────────────────────

pub enum Script {
    Exit { code: i32, output: &'static str },
    SpawnFail,
    /// Spawned, then the wait on the child failed.
    WaitFail,
    /// Block until the cancel token fires.
    UntilCancelled,
    /// Block until `gate` is notified, then exit 0.
    Gated,
}

pub struct FakeRunner {
    pub script: Script,
    pub calls: AtomicUsize,
    pub started: Notify,
    pub gate: Notify,
    /// Runs inside the build, before it returns.
    pub during: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FakeRunner {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            gate: Notify::new(),
            during: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn outcome(exit_code: i32, output: &str, cancelled: bool) -> ExecOutcome {
    ExecOutcome {
        exit_code,
        output: output.into(),
        timed_out: false,
        cancelled,
        duration: Duration::from_millis(25),
    }
}

#[async_trait]
impl BuildRunner for FakeRunner {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_build(
        &self,
        _task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(hook) = &self.during {
            hook();
        }
        match &self.script {
            Script::Exit { code, output } => Ok(outcome(*code, output, false)),
            Script::SpawnFail => Err(ExecError::Spawn {
                command: "claude".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
            Script::WaitFail => Err(ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdout pipe closed",
            ))),
            Script::UntilCancelled => {
                cancel.cancelled().await;
                Ok(outcome(143, "interrupted", true))
            }
            Script::Gated => {
                self.gate.notified().await;
                Ok(outcome(0, "done", false))
            }
        }
    }
}

/// Real subprocess: `sh -c <script>` under the process executor.
pub struct ShellRunner {
    pub script: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

#[async_trait]
impl BuildRunner for ShellRunner {
    fn name(&self) -> &str {
        "sh"
    }

    async fn run_build(
        &self,
        _task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        let spec = ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), self.script.clone()],
            cwd: self.cwd.clone(),
            env: Vec::new(),
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            output_window: 4000,
        };
        process::run(&spec, &cancel).await
    }
}

// ── Worker harness ───────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub scm: Arc<FakeScm>,
    pub host: Arc<FakeHost>,
    pub worker: Arc<Worker>,
}

pub struct HarnessOptions {
    pub with_host: bool,
    pub proceed_without_branch: bool,
    pub heartbeat: Duration,
    pub poll: Duration,
    pub followup: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            with_host: true,
            proceed_without_branch: false,
            heartbeat: Duration::from_secs(30),
            poll: Duration::from_secs(30),
            followup: Duration::from_secs(3),
        }
    }
}

pub async fn harness(runner: Arc<dyn BuildRunner>, opts: HarnessOptions) -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), runner, opts).await
}

pub async fn harness_with_store(
    store: Arc<MemoryStore>,
    runner: Arc<dyn BuildRunner>,
    opts: HarnessOptions,
) -> Harness {
    let scm = Arc::new(FakeScm::default());
    let host = Arc::new(FakeHost::default());
    let worker = worker_with(
        store.clone(),
        scm.clone(),
        opts.with_host
            .then(|| host.clone() as Arc<dyn PullRequestHost>),
        runner,
        opts,
    )
    .await;
    Harness {
        store,
        scm,
        host,
        worker,
    }
}

/// Registered worker over any source control and host.
pub async fn worker_with(
    store: Arc<MemoryStore>,
    scm: Arc<dyn SourceControl>,
    host: Option<Arc<dyn PullRequestHost>>,
    runner: Arc<dyn BuildRunner>,
    opts: HarnessOptions,
) -> Arc<Worker> {
    let dyn_store: Arc<dyn TaskStore> = store;
    let queue = QueueClient::new(Arc::clone(&dyn_store), AGENT);
    let publisher = Publisher::new(scm, host, queue.clone(), "main", "roadmap");
    let lifecycle = AgentLifecycle::new(
        dyn_store,
        AgentIdentity {
            agent_id: AGENT.into(),
            agent_type: "builder".into(),
            capabilities: vec!["build".into(), "test".into()],
            machine_url: "local://test".into(),
            timeout: Duration::from_secs(600),
        },
    );
    lifecycle.register().await.unwrap();
    Worker::new(
        queue,
        publisher,
        lifecycle,
        runner,
        WorkerSettings {
            heartbeat_interval: opts.heartbeat,
            poll_interval: opts.poll,
            followup_delay: opts.followup,
            proceed_without_branch: opts.proceed_without_branch,
        },
    )
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
