// End-to-end scheduler behaviour over a real SQLite file: the fire loop,
// retry chains, skip-on-busy, timeouts, and lifecycle management.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use rusqlite::Connection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use harvest_core::config::HarvestConfig;
use harvest_core::{Schedule, TaskId};
use harvest_scheduler::{SchedulerError, SchedulerService};
use harvest_scripts::{Script, ScriptError, ScriptOutcome, ScriptRegistry};
use harvest_store::{
    db, Execution, ExecutionFilter, ExecutionStatus, ExecutionStore, NewTask, Page, TaskPatch,
    TaskStore, TriggeredBy,
};

// ---------------------------------------------------------------------------
// Mock scripts
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AlwaysOk;

#[async_trait]
impl Script for AlwaysOk {
    fn id(&self) -> &str {
        "always-ok"
    }
    async fn execute(
        &self,
        _parameters: &serde_json::Value,
        _cancel: CancellationToken,
    ) -> harvest_scripts::Result<ScriptOutcome> {
        Ok(ScriptOutcome {
            rows_before: Some(100),
            rows_after: Some(112),
        })
    }
}

/// Fails the first `n` invocations, succeeds afterwards.
#[derive(Debug)]
struct FailNTimes {
    id: &'static str,
    left: AtomicU32,
}

impl FailNTimes {
    fn new(id: &'static str, failures: u32) -> Self {
        Self {
            id,
            left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Script for FailNTimes {
    fn id(&self) -> &str {
        self.id
    }
    async fn execute(
        &self,
        _parameters: &serde_json::Value,
        _cancel: CancellationToken,
    ) -> harvest_scripts::Result<ScriptOutcome> {
        // Attempts of one task are serialised by the run lock, so a plain
        // load/store pair is enough here.
        let left = self.left.load(Ordering::SeqCst);
        if left > 0 {
            self.left.store(left - 1, Ordering::SeqCst);
            return Err(ScriptError::Failed {
                message: "upstream returned garbage".to_string(),
                trace: None,
            });
        }
        Ok(ScriptOutcome {
            rows_before: Some(10),
            rows_after: Some(11),
        })
    }
}

/// Parks until its cancellation token fires.
#[derive(Debug)]
struct BlocksUntilCancelled;

#[async_trait]
impl Script for BlocksUntilCancelled {
    fn id(&self) -> &str {
        "blocker"
    }
    async fn execute(
        &self,
        _parameters: &serde_json::Value,
        cancel: CancellationToken,
    ) -> harvest_scripts::Result<ScriptOutcome> {
        cancel.cancelled().await;
        Err(ScriptError::Cancelled)
    }
}

/// Blocks on the first invocation only; every later one succeeds at once.
#[derive(Debug)]
struct BlockFirstRun {
    calls: AtomicU32,
}

#[async_trait]
impl Script for BlockFirstRun {
    fn id(&self) -> &str {
        "block-first"
    }
    async fn execute(
        &self,
        _parameters: &serde_json::Value,
        cancel: CancellationToken,
    ) -> harvest_scripts::Result<ScriptOutcome> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            cancel.cancelled().await;
            return Err(ScriptError::Cancelled);
        }
        Ok(ScriptOutcome::default())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    service: SchedulerService,
    tasks: Arc<TaskStore>,
    executions: Arc<ExecutionStore>,
    dir: TempDir,
}

fn open_stores(dir: &TempDir) -> (Arc<TaskStore>, Arc<ExecutionStore>) {
    let path = dir.path().join("harvest.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")
        .unwrap();
    db::init_db(&conn).unwrap();
    let tasks = Arc::new(TaskStore::new(conn));

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA busy_timeout=3000;").unwrap();
    (tasks, Arc::new(ExecutionStore::new(conn)))
}

/// Config with instant retries so chains complete within a test budget.
fn fast_retry_config() -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.retry.base_secs = 0;
    config.retry.cap_secs = 1;
    config
}

fn harness_with(scripts: Vec<Arc<dyn Script>>, config: HarvestConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (tasks, executions) = open_stores(&dir);
    let registry = Arc::new(ScriptRegistry::new());
    for script in scripts {
        registry.register(script);
    }
    let service = SchedulerService::new(
        Arc::clone(&tasks),
        Arc::clone(&executions),
        registry,
        &config,
    );
    Harness {
        service,
        tasks,
        executions,
        dir,
    }
}

fn harness(scripts: Vec<Arc<dyn Script>>) -> Harness {
    harness_with(scripts, fast_retry_config())
}

/// Poll until `cond` holds or the budget runs out.
async fn wait_for(mut cond: impl FnMut() -> bool, budget_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// All attempts for one task, oldest first.
fn history(executions: &ExecutionStore, task_id: &TaskId) -> Vec<Execution> {
    let filter = ExecutionFilter {
        task_id: Some(task_id.clone()),
        ..Default::default()
    };
    let mut rows = executions
        .list(
            &filter,
            &Page {
                limit: 100,
                offset: 0,
            },
        )
        .unwrap()
        .executions;
    rows.reverse();
    rows
}

fn in_the_past(ms: i64) -> Schedule {
    Schedule::Once {
        at: Utc::now() - chrono::Duration::milliseconds(ms),
    }
}

fn shortly(ms: i64) -> Schedule {
    Schedule::Once {
        at: Utc::now() + chrono::Duration::milliseconds(ms),
    }
}

// ---------------------------------------------------------------------------
// Fire loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interval_fire_records_a_completed_execution() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "prices",
            "always-ok",
            Schedule::Interval { every_secs: 1 },
        ))
        .unwrap();

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status.is_terminal()),
            5000
        )
        .await,
        "first interval fire never completed"
    );

    let row = &history(&h.executions, &task.id)[0];
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.triggered_by, TriggeredBy::Scheduler);
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.rows_before, Some(100));
    assert_eq!(row.rows_after, Some(112));
    assert!(row.start_time.is_some());
    assert!(row.end_time.is_some());
    assert!(row.duration_secs.is_some());

    // The schedule stays armed and the task remembers its last run.
    let health = h.service.scheduler_health();
    assert_eq!(health.active_job_count, 1);
    assert!(health.earliest_next_fire.is_some());
    let stored = h.service.get_task(&task.id).unwrap();
    assert!(stored.last_execution_at.is_some());
    assert!(stored.next_execution_at.is_some());

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Retry chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_attempts_retry_and_eventually_succeed() {
    let h = harness(vec![Arc::new(FailNTimes::new("flaky", 2))]);
    h.service.start().unwrap();

    let mut new = NewTask::new("flaky ingest", "flaky", shortly(200));
    new.max_retries = 2;
    let task = h.service.create_task(new).unwrap();

    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 3 && rows.iter().all(|e| e.status.is_terminal())
            },
            5000
        )
        .await,
        "retry chain did not finish"
    );

    let rows = history(&h.executions, &task.id);
    let statuses: Vec<ExecutionStatus> = rows.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Failed,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed
        ]
    );
    let retry_counts: Vec<u32> = rows.iter().map(|e| e.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    let sources: Vec<TriggeredBy> = rows.iter().map(|e| e.triggered_by).collect();
    assert_eq!(
        sources,
        vec![
            TriggeredBy::Scheduler,
            TriggeredBy::Retry,
            TriggeredBy::Retry
        ]
    );
    assert_eq!(
        rows[0].error_message.as_deref(),
        Some("upstream returned garbage")
    );

    // A one-shot schedule is spent after its chain ends.
    let stored = h.service.get_task(&task.id).unwrap();
    assert!(!stored.is_active);
    assert!(stored.next_execution_at.is_none());
    assert_eq!(h.service.scheduler_health().active_job_count, 0);

    // History queries through the service see the whole chain.
    let filter = ExecutionFilter {
        task_id: Some(task.id.clone()),
        ..Default::default()
    };
    let stats = h.service.get_execution_stats(&filter).unwrap();
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.success_count, 1);
    assert_eq!(stats.failed_count, 2);
    assert!((stats.success_rate - 100.0 / 3.0).abs() < 0.1);
    let page = h
        .service
        .list_executions(
            &filter,
            &Page {
                limit: 2,
                offset: 0,
            },
        )
        .unwrap();
    assert_eq!(page.executions.len(), 2);
    assert_eq!(page.total, 3);

    h.service.stop().await;
}

#[tokio::test]
async fn retry_budget_caps_the_chain() {
    let h = harness(vec![Arc::new(FailNTimes::new("doomed", u32::MAX))]);
    h.service.start().unwrap();

    let mut new = NewTask::new("doomed ingest", "doomed", shortly(200));
    new.max_retries = 2;
    let task = h.service.create_task(new).unwrap();

    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 3 && rows.iter().all(|e| e.status.is_terminal())
            },
            5000
        )
        .await,
        "expected three failed attempts"
    );
    // Give a stray fourth attempt a chance to show up before asserting.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let rows = history(&h.executions, &task.id);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(
        rows.iter().map(|e| e.retry_count).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    h.service.stop().await;
}

#[tokio::test]
async fn recurring_schedule_survives_a_failed_chain() {
    let h = harness(vec![Arc::new(FailNTimes::new("wobbly", 2))]);
    h.service.start().unwrap();

    let mut new = NewTask::new(
        "wobbly ingest",
        "wobbly",
        Schedule::Interval { every_secs: 1 },
    );
    new.max_retries = 1;
    let task = h.service.create_task(new).unwrap();

    // Fire, retry until the budget is spent, then the next occurrence runs.
    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 3 && rows.iter().all(|e| e.status.is_terminal())
            },
            8000
        )
        .await,
        "schedule did not outlive the failed chain"
    );

    let rows = history(&h.executions, &task.id);
    assert_eq!(
        rows.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![
            ExecutionStatus::Failed,
            ExecutionStatus::Failed,
            ExecutionStatus::Completed
        ]
    );
    assert_eq!(
        rows.iter().map(|e| e.retry_count).collect::<Vec<_>>(),
        vec![0, 1, 0]
    );
    assert_eq!(
        rows.iter().map(|e| e.triggered_by).collect::<Vec<_>>(),
        vec![
            TriggeredBy::Scheduler,
            TriggeredBy::Retry,
            TriggeredBy::Scheduler
        ]
    );

    // Still armed for the occurrence after that.
    let stored = h.service.get_task(&task.id).unwrap();
    assert!(stored.is_active);
    assert!(stored.next_execution_at.is_some());
    assert_eq!(h.service.scheduler_health().active_job_count, 1);

    h.service.stop().await;
}

#[tokio::test]
async fn failures_are_not_retried_when_disabled() {
    let h = harness(vec![Arc::new(FailNTimes::new("one-shot-fail", u32::MAX))]);
    h.service.start().unwrap();

    let mut new = NewTask::new("no retries", "one-shot-fail", shortly(200));
    new.retry_on_failure = false;
    let task = h.service.create_task(new).unwrap();

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status.is_terminal()),
            5000
        )
        .await,
        "attempt never finished"
    );
    // Any retry would have fired well within this window.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let rows = history(&h.executions, &task.id);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Failed);
    assert_eq!(rows[0].retry_count, 0);
    assert_eq!(rows[0].triggered_by, TriggeredBy::Scheduler);

    // The spent one-shot is deactivated even though it failed.
    let stored = h.service.get_task(&task.id).unwrap();
    assert!(!stored.is_active);
    assert!(stored.next_execution_at.is_none());

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Manual triggers and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_trigger_while_running_is_rejected() {
    let h = harness(vec![Arc::new(BlocksUntilCancelled)]);
    h.service.start().unwrap();

    // Armed far in the future so only manual triggers run it.
    let task = h
        .service
        .create_task(NewTask::new(
            "slow sync",
            "blocker",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();

    let first = h.service.trigger_now(&task.id, Some("op-7")).unwrap();
    assert_eq!(first.status, ExecutionStatus::Pending);
    assert_eq!(first.triggered_by, TriggeredBy::Manual);
    assert_eq!(first.operator_id.as_deref(), Some("op-7"));

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status == ExecutionStatus::Running),
            3000
        )
        .await,
        "manual attempt never started"
    );

    // A second trigger is rejected and leaves no trace in history.
    let err = h.service.trigger_now(&task.id, Some("op-8")).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
    assert_eq!(history(&h.executions, &task.id).len(), 1);

    let cancelled = h.service.cancel_running(&task.id, Some("op-9")).unwrap();
    assert_eq!(cancelled, first.id);

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status.is_terminal()),
            3000
        )
        .await,
        "cancelled attempt never settled"
    );

    let row = &history(&h.executions, &task.id)[0];
    assert_eq!(row.status, ExecutionStatus::Cancelled);
    assert_eq!(row.error_message.as_deref(), Some("cancelled by op-9"));
    assert!(row.end_time.is_some());

    // Cancelled attempts are never retried.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(history(&h.executions, &task.id).len(), 1);

    h.service.stop().await;
}

#[tokio::test]
async fn cancel_without_a_running_attempt_is_an_error() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "idle",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();

    let err = h.service.cancel_running(&task.id, None).unwrap_err();
    assert!(matches!(err, SchedulerError::NoRunningExecution { .. }));

    h.service.stop().await;
}

#[tokio::test]
async fn manual_trigger_runs_a_paused_task() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "on demand",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();
    h.service.pause_task(&task.id).unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 0);

    // Pausing stops the schedule, not the operator.
    let execution = h.service.trigger_now(&task.id, Some("op-4")).unwrap();
    assert_eq!(execution.triggered_by, TriggeredBy::Manual);

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status.is_terminal()),
            3000
        )
        .await,
        "manual run of a paused task never finished"
    );

    let rows = history(&h.executions, &task.id);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ExecutionStatus::Completed);
    assert_eq!(rows[0].operator_id.as_deref(), Some("op-4"));

    // The task stays paused and disarmed.
    let stored = h.service.get_task(&task.id).unwrap();
    assert!(!stored.is_active);
    assert!(stored.next_execution_at.is_none());
    assert_eq!(h.service.scheduler_health().active_job_count, 0);

    // A task the store has never seen is still an error.
    let err = h.service.trigger_now(&TaskId::new(), None).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));

    h.service.stop().await;
}

#[tokio::test]
async fn paused_task_manual_failures_still_retry() {
    let h = harness(vec![Arc::new(FailNTimes::new("flaky-by-hand", 1))]);
    h.service.start().unwrap();

    let mut new = NewTask::new(
        "hand run",
        "flaky-by-hand",
        Schedule::Interval { every_secs: 3600 },
    );
    new.max_retries = 2;
    let task = h.service.create_task(new).unwrap();
    h.service.pause_task(&task.id).unwrap();

    h.service.trigger_now(&task.id, Some("op-5")).unwrap();

    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 2 && rows.iter().all(|e| e.status.is_terminal())
            },
            5000
        )
        .await,
        "manual retry chain did not finish"
    );

    let rows = history(&h.executions, &task.id);
    assert_eq!(
        rows.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![ExecutionStatus::Failed, ExecutionStatus::Completed]
    );
    assert_eq!(
        rows.iter().map(|e| e.triggered_by).collect::<Vec<_>>(),
        vec![TriggeredBy::Manual, TriggeredBy::Retry]
    );
    assert_eq!(
        rows.iter().map(|e| e.retry_count).collect::<Vec<_>>(),
        vec![0, 1]
    );

    // The chain never re-arms the paused schedule.
    assert_eq!(h.service.scheduler_health().active_job_count, 0);
    assert!(h
        .service
        .get_task(&task.id)
        .unwrap()
        .next_execution_at
        .is_none());

    h.service.stop().await;
}

#[tokio::test]
async fn queued_attempt_behind_the_run_cap_can_be_cancelled() {
    let mut config = fast_retry_config();
    config.scheduler.max_concurrent_runs = 1;
    let h = harness_with(
        vec![Arc::new(BlocksUntilCancelled), Arc::new(AlwaysOk)],
        config,
    );
    h.service.start().unwrap();

    let hog = h
        .service
        .create_task(NewTask::new(
            "hog",
            "blocker",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();
    let starved = h
        .service
        .create_task(NewTask::new(
            "starved",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();

    h.service.trigger_now(&hog.id, None).unwrap();
    assert!(
        wait_for(
            || history(&h.executions, &hog.id)
                .first()
                .is_some_and(|e| e.status == ExecutionStatus::Running),
            3000
        )
        .await,
        "first run never took the permit"
    );

    // The second trigger is accepted but waits for the permit as pending.
    let queued = h.service.trigger_now(&starved.id, Some("op-2")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let row = h.executions.get(&queued.id).unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Pending);

    // A queued attempt is live enough to cancel.
    let cancelled = h.service.cancel_running(&starved.id, Some("op-2")).unwrap();
    assert_eq!(cancelled, queued.id);
    assert!(
        wait_for(
            || history(&h.executions, &starved.id)
                .first()
                .is_some_and(|e| e.status.is_terminal()),
            3000
        )
        .await,
        "queued attempt never settled"
    );

    // It went straight from pending to cancelled, never having run.
    let row = h.executions.get(&queued.id).unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);
    assert_eq!(row.error_message.as_deref(), Some("cancelled by op-2"));
    assert!(row.start_time.is_none());

    // The permit holder was untouched throughout.
    let first = &history(&h.executions, &hog.id)[0];
    assert_eq!(first.status, ExecutionStatus::Running);

    h.service.cancel_running(&hog.id, None).unwrap();
    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Skip-on-busy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn busy_scheduled_fire_is_skipped_without_a_row() {
    let h = harness(vec![Arc::new(BlockFirstRun {
        calls: AtomicU32::new(0),
    })]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "hourly pull",
            "block-first",
            Schedule::Interval { every_secs: 1 },
        ))
        .unwrap();

    // Occupy the task with a manual run, then let two scheduled fires pass.
    h.service.trigger_now(&task.id, None).unwrap();
    tokio::time::sleep(Duration::from_millis(2400)).await;

    // Both due fires were skipped: no extra rows appeared.
    assert_eq!(history(&h.executions, &task.id).len(), 1);

    // Once the manual run ends, the re-armed schedule fires normally.
    h.service.cancel_running(&task.id, None).unwrap();
    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 2 && rows.iter().all(|e| e.status.is_terminal())
            },
            5000
        )
        .await,
        "re-armed fire never ran"
    );

    let rows = history(&h.executions, &task.id);
    assert_eq!(rows[0].status, ExecutionStatus::Cancelled);
    assert_eq!(rows[1].status, ExecutionStatus::Completed);
    assert_eq!(rows[1].triggered_by, TriggeredBy::Scheduler);
    assert_eq!(rows[1].retry_count, 0);

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeouts_are_recorded_and_retried() {
    let h = harness(vec![Arc::new(BlocksUntilCancelled)]);
    h.service.start().unwrap();

    let mut new = NewTask::new("stuck feed", "blocker", shortly(200));
    new.timeout_secs = 1;
    new.max_retries = 1;
    let task = h.service.create_task(new).unwrap();

    assert!(
        wait_for(
            || {
                let rows = history(&h.executions, &task.id);
                rows.len() == 2 && rows.iter().all(|e| e.status.is_terminal())
            },
            8000
        )
        .await,
        "timed-out chain did not finish"
    );

    let rows = history(&h.executions, &task.id);
    assert!(rows.iter().all(|e| e.status == ExecutionStatus::Timeout));
    assert_eq!(
        rows.iter().map(|e| e.retry_count).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(rows[0].error_message.as_deref(), Some("timed out after 1s"));
    assert!(rows[0].end_time.is_some());
    assert!(rows[0].duration_secs.is_some());

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Task management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_task_rejects_bad_definitions() {
    let h = harness(vec![Arc::new(AlwaysOk)]);

    let err = h
        .service
        .create_task(NewTask::new(
            "ghost",
            "no-such-script",
            Schedule::Interval { every_secs: 60 },
        ))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ScriptNotFound { .. }));

    let err = h
        .service
        .create_task(NewTask::new("too late", "always-ok", in_the_past(5000)))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

    let err = h
        .service
        .create_task(NewTask::new(
            "never",
            "always-ok",
            Schedule::Interval { every_secs: 0 },
        ))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

    let err = h
        .service
        .create_task(NewTask::new(
            "bad clock",
            "always-ok",
            Schedule::Daily {
                hour: 24,
                minute: 0,
            },
        ))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule(_)));

    assert!(h.service.list_tasks().unwrap().is_empty());
}

#[tokio::test]
async fn pause_and_resume_control_arming() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "pausable",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 1);

    h.service.pause_task(&task.id).unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 0);
    assert!(!h.service.get_task(&task.id).unwrap().is_active);

    // Pausing an already paused task is harmless.
    h.service.pause_task(&task.id).unwrap();
    assert!(h
        .service
        .get_task(&task.id)
        .unwrap()
        .next_execution_at
        .is_none());

    let resumed = h.service.resume_task(&task.id).unwrap();
    assert!(resumed.is_active);
    // The returned task already carries the fire time arming just persisted.
    let next = resumed.next_execution_at.clone().expect("fresh fire time");
    assert_eq!(
        h.service.get_task(&task.id).unwrap().next_execution_at,
        Some(next)
    );
    assert_eq!(h.service.scheduler_health().active_job_count, 1);

    // Resuming twice does not double-arm.
    h.service.resume_task(&task.id).unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 1);

    h.service.stop().await;
}

#[tokio::test]
async fn delete_disarms_but_keeps_history() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "short lived",
            "always-ok",
            Schedule::Interval { every_secs: 1 },
        ))
        .unwrap();

    assert!(
        wait_for(|| !history(&h.executions, &task.id).is_empty(), 5000).await,
        "task never fired"
    );

    h.service.delete_task(&task.id).unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 0);
    let err = h.service.get_task(&task.id).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));

    // Execution history outlives the task definition.
    assert!(!history(&h.executions, &task.id).is_empty());

    // Deleting again reports the missing task.
    let err = h.service.delete_task(&task.id).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));

    h.service.stop().await;
}

#[tokio::test]
async fn updating_the_schedule_rearms_the_task() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let task = h
        .service
        .create_task(NewTask::new(
            "daily pull",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();

    let patch = TaskPatch {
        name: Some("minutely pull".to_string()),
        schedule: Some(Schedule::Interval { every_secs: 1 }),
        ..Default::default()
    };
    let updated = h.service.update_task(&task.id, patch).unwrap();
    assert_eq!(updated.name, "minutely pull");

    // Under the old schedule the first fire was an hour away.
    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status == ExecutionStatus::Completed),
            5000
        )
        .await,
        "updated schedule never fired"
    );

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_is_exclusive_and_restartable() {
    let h = harness(vec![Arc::new(AlwaysOk)]);

    assert!(!h.service.scheduler_health().running);
    h.service.start().unwrap();
    assert!(
        wait_for(|| h.service.scheduler_health().running, 1000).await,
        "fire loop never came up"
    );

    let err = h.service.start().unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyStarted));

    h.service.stop().await;
    assert!(!h.service.scheduler_health().running);

    // A stopped service can be started again.
    h.service.start().unwrap();
    assert!(wait_for(|| h.service.scheduler_health().running, 1000).await);
    h.service.stop().await;
}

#[tokio::test]
async fn orphaned_executions_are_closed_on_start() {
    let h = harness(vec![Arc::new(AlwaysOk)]);

    // Simulate rows left behind by a crash: one running, one pending.
    let running = h
        .executions
        .create(&TaskId::new(), TriggeredBy::Scheduler, None, 0)
        .unwrap();
    h.executions.mark_running(&running.id, Utc::now()).unwrap();
    let pending = h
        .executions
        .create(&TaskId::new(), TriggeredBy::Manual, Some("op-1"), 0)
        .unwrap();

    h.service.start().unwrap();

    for id in [&running.id, &pending.id] {
        let row = h.executions.get(id).unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert!(row
            .error_message
            .as_deref()
            .unwrap()
            .contains("process terminated"));
        assert!(row.end_time.is_some());
    }

    h.service.stop().await;
}

#[tokio::test]
async fn reload_skips_corrupt_tasks_and_rearms_the_rest() {
    let h = harness(vec![Arc::new(AlwaysOk)]);
    h.service.start().unwrap();

    let keep = h
        .service
        .create_task(NewTask::new(
            "good",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();
    let corrupt = h
        .service
        .create_task(NewTask::new(
            "bad",
            "always-ok",
            Schedule::Interval { every_secs: 3600 },
        ))
        .unwrap();
    assert_eq!(h.service.scheduler_health().active_job_count, 2);

    // Break one schedule behind the scheduler's back.
    let conn = Connection::open(h.dir.path().join("harvest.db")).unwrap();
    conn.execute(
        "UPDATE tasks SET schedule = '{\"kind\":\"fortnightly\"}' WHERE id = ?1",
        [corrupt.id.as_str()],
    )
    .unwrap();

    h.service.reload().unwrap();

    let health = h.service.scheduler_health();
    assert_eq!(health.active_job_count, 1);
    assert!(h.service.get_task(&keep.id).unwrap().is_active);

    h.service.stop().await;
}

// ---------------------------------------------------------------------------
// Catch-up
// ---------------------------------------------------------------------------

/// A daily task whose persisted fire time is two hours stale, as after a
/// process restart.
fn stale_daily_task(tasks: &TaskStore) -> harvest_store::Task {
    let missed_at = Utc::now() - chrono::Duration::hours(2);
    let task = tasks
        .create(&NewTask::new(
            "overnight load",
            "always-ok",
            Schedule::Daily {
                hour: missed_at.hour() as u8,
                minute: missed_at.minute() as u8,
            },
        ))
        .unwrap();
    tasks.set_next_execution(&task.id, Some(missed_at)).unwrap();
    task
}

#[tokio::test]
async fn startup_catchup_runs_missed_fires_once() {
    let mut config = fast_retry_config();
    config.scheduler.startup_catchup = true;
    let h = harness_with(vec![Arc::new(AlwaysOk)], config);

    let task = stale_daily_task(&h.tasks);
    h.service.start().unwrap();

    assert!(
        wait_for(
            || history(&h.executions, &task.id)
                .first()
                .is_some_and(|e| e.status == ExecutionStatus::Completed),
            3000
        )
        .await,
        "missed fire was not caught up"
    );

    // Exactly one catch-up attempt; the regular schedule stays armed for
    // its real slot.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let rows = history(&h.executions, &task.id);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].triggered_by, TriggeredBy::Scheduler);
    assert_eq!(h.service.scheduler_health().active_job_count, 1);

    h.service.stop().await;
}

#[tokio::test]
async fn missed_fires_are_skipped_without_catchup() {
    let h = harness(vec![Arc::new(AlwaysOk)]);

    let task = stale_daily_task(&h.tasks);
    h.service.start().unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(history(&h.executions, &task.id).is_empty());

    // Still armed, with the fire time recomputed into the future.
    assert_eq!(h.service.scheduler_health().active_job_count, 1);
    let stored = h.service.get_task(&task.id).unwrap();
    let next = stored.next_execution_at.expect("re-armed fire time");
    assert!(next > Utc::now().to_rfc3339());

    h.service.stop().await;
}
