mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    eventually, fixture_repo, harness, harness_with_store, task, worker_with, FakeRunner,
    HarnessOptions, Script, ShellRunner, AGENT,
};
use foreman_core::{
    git::Git,
    store::MemoryStore,
    types::{Activity, AgentStatus, Severity, TaskStatus},
    worker::{CycleReport, Wake, WorkerState},
};

const T1: &str = "t1aaaaaa-0000-4000-8000-000000000001";
const T2: &str = "t2bbbbbb-0000-4000-8000-000000000002";

fn actions(store: &MemoryStore) -> Vec<Activity> {
    store.activity().iter().map(|a| a.action).collect()
}

// ── Happy path ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_build_opens_request_and_moves_to_review() {
    let runner = Arc::new(FakeRunner::new(Script::Exit {
        code: 0,
        output: "all tests passed",
    }));
    let h = harness(runner.clone(), HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "critical"));
    h.store.insert_task(task(T2, "Tidy docs", "low"));

    let report = h.worker.check_for_work().await;
    assert_eq!(
        report,
        CycleReport::Completed {
            task_id: T1.into(),
            success: true,
            exit_code: 0,
            pr_number: Some(7),
        }
    );

    let branch = "roadmap/t1aaaaaa-add-login-page";
    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert!(!row.auto_queued);
    assert_eq!(row.assigned_agent.as_deref(), Some(AGENT));
    assert_eq!(row.branch_name.as_deref(), Some(branch));
    assert_eq!(row.pr_number, Some(7));
    assert_eq!(
        row.github_url.as_deref(),
        Some("https://github.com/acme/app/pull/7")
    );
    assert_eq!(row.history.len(), 2);
    assert_eq!(row.history[1].action, "Auto-build completed, PR #7");
    assert_eq!(row.comments.len(), 1);
    assert!(row.comments[0].content.contains("**Auto-build completed**"));
    assert!(row.comments[0].content.contains("all tests passed"));

    let opened = h.host.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, branch);
    assert_eq!(opened[0].1, "main");
    assert_eq!(opened[0].2, "[auth] Add login page");

    let prs = h.store.pull_requests();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].roadmap_item_id, T1);
    assert_eq!(prs[0].pr_number, 7);
    assert_eq!(prs[0].status, "open");

    // The low-priority task is untouched.
    assert!(h.store.task(T2).unwrap().is_claimable());

    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.metrics.tasks_completed, 1);
    assert_eq!(agent.metrics.error_count, 0);

    assert_eq!(
        actions(&h.store),
        vec![
            Activity::AgentStarted,
            Activity::StartedTask,
            Activity::CompletedTask
        ]
    );
    let started = &h.store.activity()[1];
    assert_eq!(started.roadmap_item_id.as_deref(), Some(T1));
    assert_eq!(started.details["runner"], "fake");

    assert_eq!(h.scm.current(), "main");
    assert!(!h.worker.is_working());
    assert!(h.worker.held_task_id().is_none());
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn test_git_steps_run_in_order() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "" }));
    let h = harness(runner, HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    h.worker.check_for_work().await;

    let branch = "roadmap/t1aaaaaa-add-login-page";
    assert_eq!(
        h.scm.calls(),
        vec![
            "checkout main".to_string(),
            "pull main".to_string(),
            format!("create_branch {branch}"),
            format!("push {branch}"),
            "restore main".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_without_host_credential_task_still_reaches_review() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "ok" }));
    let h = harness(
        runner,
        HarnessOptions {
            with_host: false,
            ..Default::default()
        },
    )
    .await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    let report = h.worker.check_for_work().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            success: true,
            pr_number: None,
            ..
        }
    ));
    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert!(row.pr_number.is_none());
    assert_eq!(row.history[1].action, "Auto-build completed");
    assert!(h.store.pull_requests().is_empty());
}

#[tokio::test]
async fn test_push_failure_skips_request_and_warns() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "ok" }));
    let h = harness(runner, HarnessOptions::default()).await;
    h.scm.fail_push.store(true, Ordering::SeqCst);
    h.store.insert_task(task(T1, "Add login page", "high"));

    h.worker.check_for_work().await;

    assert!(h.host.opened.lock().unwrap().is_empty());
    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert!(row.pr_number.is_none());
    let completed = h
        .store
        .activity()
        .into_iter()
        .find(|a| a.action == Activity::CompletedTask)
        .unwrap();
    assert_eq!(completed.severity, Severity::Warn);
    assert_eq!(h.scm.current(), "main");
}

#[tokio::test]
async fn test_no_work_leaves_agent_idle() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "" }));
    let h = harness(runner.clone(), HarnessOptions::default()).await;

    assert_eq!(h.worker.check_for_work().await, CycleReport::NoWork);
    assert_eq!(runner.calls(), 0);
    assert!(h.scm.calls().is_empty());
    assert_eq!(h.worker.state(), WorkerState::Idle);
}

// ── Failed builds ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_timed_out_build_stays_in_progress() {
    let runner = Arc::new(ShellRunner {
        script: "trap '' TERM; echo compiling; sleep 30".into(),
        cwd: std::env::temp_dir(),
        timeout: Duration::from_millis(300),
        kill_grace: Duration::from_millis(300),
    });
    let h = harness(runner, HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "critical"));

    let report = h.worker.check_for_work().await;
    assert_eq!(
        report,
        CycleReport::Completed {
            task_id: T1.into(),
            success: false,
            exit_code: 137,
            pr_number: None,
        }
    );

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::InProgress);
    assert!(!row.auto_queued);
    assert_eq!(row.assigned_agent.as_deref(), Some(AGENT));
    assert!(row.pr_number.is_none());
    assert_eq!(row.history[1].action, "Auto-build timed out (exit 137)");
    assert!(row.comments[0].content.contains("**Auto-build failed**"));
    assert!(row.comments[0].content.contains("compiling"));

    assert!(h.host.opened.lock().unwrap().is_empty());
    assert!(h.store.pull_requests().is_empty());
    assert!(!h.scm.calls().iter().any(|c| c.starts_with("push")));

    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.metrics.error_count, 1);
    assert_eq!(agent.metrics.tasks_completed, 1);
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(actions(&h.store).contains(&Activity::FailedTask));
    assert_eq!(h.scm.current(), "main");
}

#[tokio::test]
async fn test_nonzero_exit_is_recorded_as_failure() {
    let runner = Arc::new(FakeRunner::new(Script::Exit {
        code: 2,
        output: "error[E0425]: cannot find value",
    }));
    let h = harness(runner, HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    h.worker.check_for_work().await;

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::InProgress);
    assert_eq!(row.history[1].action, "Auto-build failed (exit 2)");
    assert!(row.comments[0].content.contains("exit code 2"));
    assert!(row.comments[0].content.contains("E0425"));
}

#[tokio::test]
async fn test_spawn_failure_releases_task() {
    let runner = Arc::new(FakeRunner::new(Script::SpawnFail));
    let h = harness(runner, HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    let report = h.worker.check_for_work().await;
    match report {
        CycleReport::Released { task_id, reason } => {
            assert_eq!(task_id, T1);
            assert!(reason.starts_with("spawn failure"));
        }
        other => panic!("expected release, got {other:?}"),
    }

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Planned);
    assert!(row.assigned_agent.is_none());
    assert!(row.auto_queued);

    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.status, AgentStatus::Error);
    assert!(agent.current_task_id.is_none());
    assert!(actions(&h.store).contains(&Activity::AgentError));
    assert_eq!(h.scm.current(), "main");
    assert!(!h.worker.is_working());
}

#[tokio::test]
async fn test_lost_build_process_is_recorded_as_failure() {
    let runner = Arc::new(FakeRunner::new(Script::WaitFail));
    let h = harness(runner, HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    let report = h.worker.check_for_work().await;
    assert_eq!(
        report,
        CycleReport::Completed {
            task_id: T1.into(),
            success: false,
            exit_code: -1,
            pr_number: None,
        }
    );

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::InProgress);
    assert_eq!(row.assigned_agent.as_deref(), Some(AGENT));
    assert_eq!(row.history[1].action, "Auto-build failed (exit -1)");
    assert!(row.comments[0].content.contains("stdout pipe closed"));

    assert_eq!(h.store.agent(AGENT).unwrap().status, AgentStatus::Idle);
    assert!(h.worker.backoff_remaining().is_none());
    assert_eq!(h.scm.current(), "main");
}

// ── Environment failures ─────────────────────────────────────────────────

#[tokio::test]
async fn test_environment_failure_pauses_claims() {
    let runner = Arc::new(FakeRunner::new(Script::SpawnFail));
    let h = harness(runner.clone(), HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));
    h.store.insert_task(task(T2, "Tidy docs", "low"));

    assert!(matches!(
        h.worker.check_for_work().await,
        CycleReport::Released { .. }
    ));
    assert!(h.worker.backoff_remaining().is_some());

    assert_eq!(h.worker.check_for_work().await, CycleReport::BackingOff);
    assert_eq!(h.store.claim_attempts(), 1);
    assert_eq!(runner.calls(), 1);
    assert!(h.store.task(T1).unwrap().is_claimable());
    assert!(h.store.task(T2).unwrap().is_claimable());
    assert_eq!(h.store.agent(AGENT).unwrap().status, AgentStatus::Error);
}

#[tokio::test]
async fn test_broken_agent_does_not_drain_queue() {
    let runner = Arc::new(FakeRunner::new(Script::SpawnFail));
    let h = harness(
        runner,
        HarnessOptions {
            poll: Duration::from_millis(20),
            followup: Duration::from_millis(20),
            ..Default::default()
        },
    )
    .await;
    let ids: Vec<String> = (0..5).map(|i| format!("q{i}aaaaaa-0000")).collect();
    for id in &ids {
        h.store.insert_task(task(id, "Queued work", "medium"));
    }

    let worker = h.worker.clone();
    worker
        .run(tokio::time::sleep(Duration::from_millis(400)))
        .await;

    // Back-off of 20, 40, 80, 160 ms leaves room for at most five claims.
    let claims = h.store.claim_attempts();
    assert!((1..=5).contains(&claims), "claims = {claims}");
    for id in &ids {
        assert!(h.store.task(id).unwrap().is_claimable(), "{id} left the queue");
    }
}

#[tokio::test]
async fn test_dirty_failed_build_leaves_clean_default_branch() {
    let (_root, work) = fixture_repo();
    let git = Arc::new(Git::new(&work));
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(ShellRunner {
        script: "echo step1 >> README.md && git commit -qam step1 \
                 && echo wip >> README.md && echo junk > scratch.txt && exit 1"
            .into(),
        cwd: work.clone(),
        timeout: Duration::from_secs(30),
        kill_grace: Duration::from_secs(1),
    });
    let worker = worker_with(
        store.clone(),
        git.clone(),
        None,
        runner,
        HarnessOptions {
            with_host: false,
            ..Default::default()
        },
    )
    .await;
    store.insert_task(task(T1, "First task", "critical"));
    store.insert_task(task(T2, "Second task", "low"));

    let first = worker.check_for_work().await;
    assert!(matches!(
        first,
        CycleReport::Completed {
            success: false,
            exit_code: 1,
            ..
        }
    ));
    assert_eq!(git.current_branch().await.unwrap(), "main");
    assert_eq!(std::fs::read_to_string(work.join("README.md")).unwrap(), "app\n");
    assert!(!work.join("scratch.txt").exists());

    // The next task starts from a usable tree instead of being released.
    match worker.check_for_work().await {
        CycleReport::Completed { task_id, .. } => assert_eq!(task_id, T2),
        other => panic!("expected a build, got {other:?}"),
    }
    let row = store.task(T2).unwrap();
    assert_eq!(row.status, TaskStatus::InProgress);
    assert_eq!(row.branch_name.as_deref(), Some("roadmap/t2bbbbbb-second-task"));
    assert_eq!(git.current_branch().await.unwrap(), "main");
    assert_eq!(store.agent(AGENT).unwrap().status, AgentStatus::Idle);
}

// ── Branch setup ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_branch_setup_failure_releases_without_building() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "" }));
    let h = harness(runner.clone(), HarnessOptions::default()).await;
    *h.scm.fail_step.lock().unwrap() = Some("pull");
    h.store.insert_task(task(T1, "Add login page", "high"));

    let report = h.worker.check_for_work().await;
    match report {
        CycleReport::Released { reason, .. } => assert!(reason.contains("pull")),
        other => panic!("expected release, got {other:?}"),
    }
    assert_eq!(runner.calls(), 0);
    assert!(!h.scm.calls().iter().any(|c| c.starts_with("create_branch")));

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Planned);
    assert!(row.assigned_agent.is_none());
    assert_eq!(h.store.agent(AGENT).unwrap().status, AgentStatus::Error);
    assert_eq!(h.scm.current(), "main");
}

#[tokio::test]
async fn test_branch_setup_failure_can_be_tolerated() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "ok" }));
    let h = harness(
        runner.clone(),
        HarnessOptions {
            proceed_without_branch: true,
            ..Default::default()
        },
    )
    .await;
    *h.scm.fail_step.lock().unwrap() = Some("pull");
    h.store.insert_task(task(T1, "Add login page", "high"));

    let report = h.worker.check_for_work().await;
    assert!(matches!(
        report,
        CycleReport::Completed {
            success: true,
            pr_number: None,
            ..
        }
    ));
    assert_eq!(runner.calls(), 1);
    assert!(!h.scm.calls().iter().any(|c| c.starts_with("push")));

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert!(row.branch_name.is_none());
}

// ── Concurrency ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_cycle_in_flight() {
    let runner = Arc::new(FakeRunner::new(Script::Gated));
    let h = harness(runner.clone(), HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "high"));
    h.store.insert_task(task(T2, "Tidy docs", "low"));

    assert!(h.worker.wake(Wake::Startup));
    runner.started.notified().await;
    assert!(h.worker.is_working());
    assert_eq!(h.worker.held_task_id().as_deref(), Some(T1));

    for _ in 0..5 {
        assert!(!h.worker.wake(Wake::Notification));
    }
    assert_eq!(h.worker.check_for_work().await, CycleReport::Skipped);
    assert_eq!(h.store.claim_attempts(), 1);

    runner.gate.notify_one();
    let worker = h.worker.clone();
    assert!(eventually(move || !worker.is_working()).await);
    assert_eq!(h.store.claim_attempts(), 1);
    assert_eq!(runner.calls(), 1);
    assert_eq!(h.store.task(T1).unwrap().status, TaskStatus::Review);
    assert!(h.store.task(T2).unwrap().is_claimable());
}

#[tokio::test]
async fn test_two_workers_share_one_queue() {
    let store = Arc::new(MemoryStore::new());
    store.insert_task(task(T1, "Add login page", "high"));
    let a = harness_with_store(
        store.clone(),
        Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "" })),
        HarnessOptions::default(),
    )
    .await;
    let b = harness_with_store(
        store.clone(),
        Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "" })),
        HarnessOptions::default(),
    )
    .await;

    let (ra, rb) = tokio::join!(a.worker.check_for_work(), b.worker.check_for_work());
    let completed = [ra, rb]
        .iter()
        .filter(|r| matches!(r, CycleReport::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(store.task(T1).unwrap().history.len(), 2);
}

// ── Unconfirmed writes ───────────────────────────────────────────────────

#[tokio::test]
async fn test_unconfirmed_finalize_is_retried_before_next_claim() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = FakeRunner::new(Script::Exit { code: 0, output: "ok" });
    let injected = store.clone();
    let armed = AtomicBool::new(true);
    runner.during = Some(Box::new(move || {
        if armed.swap(false, Ordering::SeqCst) {
            injected.fail_next(3);
        }
    }));
    let h = harness_with_store(
        store.clone(),
        Arc::new(runner),
        HarnessOptions {
            with_host: false,
            ..Default::default()
        },
    )
    .await;
    store.insert_task(task(T1, "Add login page", "high"));
    store.insert_task(task(T2, "Tidy docs", "low"));

    h.worker.check_for_work().await;
    assert!(h.worker.has_pending_write());
    assert_eq!(store.task(T1).unwrap().status, TaskStatus::InProgress);
    let claims = store.claim_attempts();

    // Next cycle settles the write, then claims the next task.
    h.worker.check_for_work().await;
    assert!(!h.worker.has_pending_write());
    let row = store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert_eq!(row.history.len(), 2);
    assert_eq!(store.claim_attempts(), claims + 1);
}

#[tokio::test]
async fn test_cycle_defers_while_write_unconfirmed() {
    let store = Arc::new(MemoryStore::new());
    let mut runner = FakeRunner::new(Script::Exit { code: 0, output: "ok" });
    let injected = store.clone();
    let armed = AtomicBool::new(true);
    runner.during = Some(Box::new(move || {
        if armed.swap(false, Ordering::SeqCst) {
            injected.fail_next(3);
        }
    }));
    let h = harness_with_store(
        store.clone(),
        Arc::new(runner),
        HarnessOptions {
            with_host: false,
            ..Default::default()
        },
    )
    .await;
    store.insert_task(task(T1, "Add login page", "high"));
    store.insert_task(task(T2, "Tidy docs", "low"));

    h.worker.check_for_work().await;
    assert!(h.worker.has_pending_write());

    store.fail_next(3);
    assert_eq!(h.worker.check_for_work().await, CycleReport::Deferred);
    assert!(h.worker.has_pending_write());
    assert!(store.task(T2).unwrap().is_claimable());
}

// ── Shutdown ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_mid_build_requeues_task() {
    let runner = Arc::new(FakeRunner::new(Script::UntilCancelled));
    let h = harness(runner.clone(), HarnessOptions::default()).await;
    h.store.insert_task(task(T1, "Add login page", "critical"));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let worker = h.worker.clone();
    let running = tokio::spawn(async move {
        worker
            .run(async {
                let _ = rx.await;
            })
            .await;
    });

    runner.started.notified().await;
    assert_eq!(h.worker.held_task_id().as_deref(), Some(T1));
    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    let row = h.store.task(T1).unwrap();
    assert_eq!(row.status, TaskStatus::Planned);
    assert!(row.assigned_agent.is_none());
    assert!(row.auto_queued);
    assert!(row.comments.is_empty());

    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.status, AgentStatus::Offline);
    assert!(agent.current_task_id.is_none());
    let logged = actions(&h.store);
    assert!(logged.contains(&Activity::ReleasedTask));
    assert_eq!(logged.last(), Some(&Activity::AgentStopped));

    assert_eq!(h.scm.current(), "main");
    assert_eq!(h.worker.state(), WorkerState::ShuttingDown);
    assert!(!h.worker.wake(Wake::Poll));
}

#[tokio::test]
async fn test_heartbeat_reports_status_and_held_task() {
    let runner = Arc::new(FakeRunner::new(Script::Gated));
    let h = harness(
        runner.clone(),
        HarnessOptions {
            heartbeat: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await;
    h.store.insert_task(task(T1, "Add login page", "high"));

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let worker = h.worker.clone();
    let running = tokio::spawn(async move {
        worker
            .run(async {
                let _ = rx.await;
            })
            .await;
    });

    runner.started.notified().await;
    let before = h.store.agent(AGENT).unwrap().last_heartbeat;
    let store = h.store.clone();
    assert!(eventually(move || store.agent(AGENT).unwrap().last_heartbeat > before).await);
    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.status, AgentStatus::Working);
    assert_eq!(agent.current_task_id.as_deref(), Some(T1));

    runner.gate.notify_one();
    let store = h.store.clone();
    assert!(eventually(move || store.agent(AGENT).unwrap().status == AgentStatus::Idle).await);

    // Later beats keep reporting the finished state.
    let done = h.store.agent(AGENT).unwrap().last_heartbeat;
    let store = h.store.clone();
    assert!(eventually(move || store.agent(AGENT).unwrap().last_heartbeat > done).await);
    let agent = h.store.agent(AGENT).unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert!(agent.current_task_id.is_none());

    tx.send(()).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_poll_timer_finds_work_without_feed() {
    let store = Arc::new(MemoryStore::polling_only());
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "ok" }));
    let h = harness_with_store(
        store.clone(),
        runner.clone(),
        HarnessOptions {
            poll: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let worker = h.worker.clone();
    let running = tokio::spawn(async move {
        worker
            .run(async {
                let _ = rx.await;
            })
            .await;
    });

    // Nothing to claim at startup, and no feed to announce the insert.
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.insert_task(task(T1, "Add login page", "high"));

    let polled = store.clone();
    assert!(eventually(move || polled.task(T1).unwrap().status == TaskStatus::Review).await);
    assert_eq!(runner.calls(), 1);

    tx.send(()).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_run_picks_up_notified_task() {
    let runner = Arc::new(FakeRunner::new(Script::Exit { code: 0, output: "ok" }));
    let h = harness(runner.clone(), HarnessOptions::default()).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let worker = h.worker.clone();
    let running = tokio::spawn(async move {
        worker
            .run(async {
                let _ = rx.await;
            })
            .await;
    });

    // Startup cycle finds nothing; the insert notification wakes the worker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.claim_attempts(), 0);
    h.store.insert_task(task(T1, "Add login page", "high"));

    let store = h.store.clone();
    assert!(eventually(move || store.task(T1).unwrap().status == TaskStatus::Review).await);
    assert_eq!(runner.calls(), 1);

    tx.send(()).unwrap();
    running.await.unwrap();
    assert_eq!(h.store.agent(AGENT).unwrap().status, AgentStatus::Offline);
}
