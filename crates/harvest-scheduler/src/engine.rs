//! The fire loop: an owned registry of armed tasks, a min-heap of planned
//! fires, and per-task run locks.
//!
//! The loop sleeps until the earliest heap entry is due, then pops every due
//! entry and tries to start an attempt for it. A task whose previous attempt
//! is still in flight has its fire *skipped* — no execution row is created —
//! and its next fire is re-armed from the current instant. Heap entries are
//! invalidated lazily: each armed task carries a generation number, and a
//! popped entry whose generation no longer matches is discarded, so
//! unregister and re-register never have to dig entries out of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use harvest_core::{ExecutionId, TaskId};
use harvest_scripts::{ScriptError, ScriptOutcome, ScriptRegistry};
use harvest_store::{
    Execution, ExecutionOutcome, ExecutionStatus, ExecutionStore, Task, TaskStore, TriggeredBy,
};

use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::trigger::{next_fire_time, validate};
use crate::types::SchedulerHealth;

/// How long a timed-out script gets to honour its cancellation token before
/// the attempt task is aborted outright.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Idle sleep when nothing is armed; a `Notify` wakes the loop early
/// whenever the heap changes.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// What kind of attempt a fire represents. Manual attempts never enter the
/// heap — they are started directly by [`TaskScheduler::trigger_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    /// A regular fire from the task's own schedule.
    Scheduled,
    /// One immediate startup fire for a schedule missed while the process
    /// was down. The regular fire is armed separately.
    CatchUp,
    /// Operator-requested immediate run.
    Manual,
    /// Retry number `attempt` (1-based) after a failed attempt.
    /// `reschedules` records whether this chain started from a scheduled
    /// fire and must therefore re-arm the regular schedule when it ends.
    Retry { attempt: u32, reschedules: bool },
}

impl AttemptKind {
    fn triggered_by(&self) -> TriggeredBy {
        match self {
            AttemptKind::Scheduled | AttemptKind::CatchUp => TriggeredBy::Scheduler,
            AttemptKind::Manual => TriggeredBy::Manual,
            AttemptKind::Retry { .. } => TriggeredBy::Retry,
        }
    }

    fn retry_count(&self) -> u32 {
        match self {
            AttemptKind::Retry { attempt, .. } => *attempt,
            _ => 0,
        }
    }

    /// Whether the regular schedule is re-armed once this attempt (and any
    /// retry chain it starts) is over.
    fn reschedules(&self) -> bool {
        match self {
            AttemptKind::Scheduled => true,
            AttemptKind::CatchUp | AttemptKind::Manual => false,
            AttemptKind::Retry { reschedules, .. } => *reschedules,
        }
    }
}

/// One planned fire. Ordered by time so the `BinaryHeap` pops earliest
/// first.
#[derive(Debug, Clone)]
struct FireEntry {
    at: DateTime<Utc>,
    task_id: TaskId,
    generation: u64,
    kind: AttemptKind,
}

impl Ord for FireEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest on top.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.task_id.0.cmp(&self.task_id.0))
    }
}

impl PartialOrd for FireEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FireEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.task_id == other.task_id
    }
}

impl Eq for FireEntry {}

/// A registered task plus its scheduling bookkeeping.
struct ArmedJob {
    task: Task,
    /// Bumped on every (re-)register; stale heap entries are discarded.
    generation: u64,
    /// The currently planned fire (regular or retry), for health reporting.
    next_fire: Option<DateTime<Utc>>,
}

struct SchedState {
    jobs: HashMap<TaskId, ArmedJob>,
    queue: BinaryHeap<FireEntry>,
    next_generation: u64,
}

/// Tracks one in-flight attempt so it can be cancelled by an operator.
struct RunHandle {
    execution_id: ExecutionId,
    cancel: CancellationToken,
    /// Who asked for the cancellation, for the execution row's message.
    cancelled_by: Mutex<Option<String>>,
}

/// The scheduler core. Owns the armed-task registry and drives attempts.
///
/// Shared as `Arc<TaskScheduler>`; all methods take `&self`. The fire loop
/// itself runs in [`TaskScheduler::run`], spawned by the service.
pub struct TaskScheduler {
    state: Mutex<SchedState>,
    /// Per-task run locks. An entry survives re-registration for as long as
    /// anything holds it, so an update can never let two attempts of one
    /// task overlap; [`TaskScheduler::unregister`] prunes entries nothing
    /// holds.
    locks: DashMap<TaskId, Arc<tokio::sync::Mutex<()>>>,
    /// In-flight attempts by task.
    running: DashMap<TaskId, RunHandle>,
    /// Wakes the fire loop when the heap changes.
    notify: Notify,
    started: AtomicBool,
    tasks: Arc<TaskStore>,
    executions: Arc<ExecutionStore>,
    registry: Arc<ScriptRegistry>,
    retry: RetryPolicy,
    /// Global cap on concurrent script runs; `None` means unlimited.
    run_permits: Option<Arc<Semaphore>>,
}

impl TaskScheduler {
    pub fn new(
        tasks: Arc<TaskStore>,
        executions: Arc<ExecutionStore>,
        registry: Arc<ScriptRegistry>,
        retry: RetryPolicy,
        max_concurrent_runs: u32,
    ) -> Self {
        Self {
            state: Mutex::new(SchedState {
                jobs: HashMap::new(),
                queue: BinaryHeap::new(),
                next_generation: 0,
            }),
            locks: DashMap::new(),
            running: DashMap::new(),
            notify: Notify::new(),
            started: AtomicBool::new(false),
            tasks,
            executions,
            registry,
            retry,
            run_permits: if max_concurrent_runs > 0 {
                Some(Arc::new(Semaphore::new(max_concurrent_runs as usize)))
            } else {
                None
            },
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Arm a task: validate its schedule, compute the first fire, persist it,
    /// and queue the fire entry.
    ///
    /// Fails with [`SchedulerError::DuplicateTask`] if the task is already
    /// armed and [`SchedulerError::InvalidSchedule`] if the schedule is
    /// malformed or will never fire again.
    pub fn register(&self, task: Task) -> Result<()> {
        validate(&task.schedule)?;

        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask {
                id: task.id.to_string(),
            });
        }

        let next = next_fire_time(&task.schedule, Utc::now()).ok_or_else(|| {
            SchedulerError::InvalidSchedule("the schedule will never fire again".to_string())
        })?;

        self.tasks.set_next_execution(&task.id, Some(next))?;

        let generation = state.next_generation;
        state.next_generation += 1;
        let id = task.id.clone();
        state.queue.push(FireEntry {
            at: next,
            task_id: id.clone(),
            generation,
            kind: AttemptKind::Scheduled,
        });
        state.jobs.insert(
            id.clone(),
            ArmedJob {
                task,
                generation,
                next_fire: Some(next),
            },
        );
        drop(state);

        info!(task_id = %id, next_fire = %next, "task armed");
        self.notify.notify_one();
        Ok(())
    }

    /// Disarm a task. Idempotent — returns whether anything was armed.
    ///
    /// Pending fires and retries die with the registration (their heap
    /// entries are discarded when popped); an attempt already in flight
    /// finishes and writes its terminal row as usual.
    pub fn unregister(&self, id: &TaskId) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.jobs.remove(id).is_some()
        };
        // An in-flight attempt pins its lock through the clones held by the
        // guard, so only an entry the map alone holds is dropped. Pruned
        // even when nothing was armed — a paused task can leave an entry
        // behind after a manual run.
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        if removed {
            // Best effort — the task row may already be deleted.
            if let Err(e) = self.tasks.set_next_execution(id, None) {
                debug!(task_id = %id, "could not clear next fire: {e}");
            }
            info!(task_id = %id, "task disarmed");
            self.notify.notify_one();
        }
        removed
    }

    pub fn is_registered(&self, id: &TaskId) -> bool {
        self.state.lock().unwrap().jobs.contains_key(id)
    }

    pub fn armed_ids(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().jobs.keys().cloned().collect()
    }

    /// Queue one immediate scheduler-triggered fire for an armed task whose
    /// schedule was missed while the process was down.
    pub fn trigger_catchup(&self, id: &TaskId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        let entry = FireEntry {
            at: Utc::now(),
            task_id: id.clone(),
            generation: job.generation,
            kind: AttemptKind::CatchUp,
        };
        state.queue.push(entry);
        drop(state);

        info!(task_id = %id, "catch-up fire queued");
        self.notify.notify_one();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Manual control
    // -----------------------------------------------------------------------

    /// Start an attempt right now, outside the schedule.
    ///
    /// The task does not have to be armed: a paused or exhausted task can
    /// still be run by hand, and its schedule stays untouched either way.
    /// Fails with [`SchedulerError::AlreadyRunning`] — creating no execution
    /// row — when an attempt for the task is already in flight, and with
    /// [`SchedulerError::TaskNotFound`] only when the store has no such
    /// task. Failures consult the retry policy like any other attempt.
    pub fn trigger_now(
        self: &Arc<Self>,
        id: &TaskId,
        operator_id: Option<&str>,
    ) -> Result<Execution> {
        let armed = {
            let state = self.state.lock().unwrap();
            state
                .jobs
                .get(id)
                .map(|job| (job.task.clone(), job.generation))
        };
        let (task, generation) = match armed {
            Some((task, generation)) => (task, Some(generation)),
            // Not armed — paused, exhausted, or the loop is not up yet.
            None => {
                let task = self
                    .tasks
                    .get(id)?
                    .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
                (task, None)
            }
        };

        let guard = self
            .lock_for(id)
            .try_lock_owned()
            .map_err(|_| SchedulerError::AlreadyRunning { id: id.to_string() })?;

        let execution =
            self.executions
                .create(&task.id, TriggeredBy::Manual, operator_id, 0)?;
        info!(task_id = %id, execution_id = %execution.id, "manual trigger accepted");

        let scheduler = Arc::clone(self);
        let spawned = execution.clone();
        tokio::spawn(async move {
            scheduler
                .run_attempt(task, generation, AttemptKind::Manual, spawned, guard)
                .await;
        });
        Ok(execution)
    }

    /// Cancel the in-flight attempt of a task, recording who asked.
    ///
    /// Cancellation is cooperative: the script's token fires and the attempt
    /// finalises as cancelled once the script yields. A cancelled attempt is
    /// never retried.
    pub fn cancel_running(&self, id: &TaskId, operator_id: Option<&str>) -> Result<ExecutionId> {
        let handle = self
            .running
            .get(id)
            .ok_or_else(|| SchedulerError::NoRunningExecution { id: id.to_string() })?;
        *handle.cancelled_by.lock().unwrap() = operator_id.map(str::to_string);
        handle.cancel.cancel();
        info!(task_id = %id, execution_id = %handle.execution_id, "cancellation requested");
        Ok(handle.execution_id.clone())
    }

    pub fn health(&self) -> SchedulerHealth {
        let state = self.state.lock().unwrap();
        SchedulerHealth {
            running: self.started.load(AtomicOrdering::SeqCst),
            active_job_count: state.jobs.len(),
            earliest_next_fire: state.jobs.values().filter_map(|j| j.next_fire).min(),
        }
    }

    // -----------------------------------------------------------------------
    // Fire loop
    // -----------------------------------------------------------------------

    /// Main loop. Sleeps until the earliest planned fire, dispatches
    /// everything due, repeats — until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("task scheduler started");
        self.started.store(true, AtomicOrdering::SeqCst);

        loop {
            let sleep = {
                let state = self.state.lock().unwrap();
                match state.queue.peek() {
                    Some(entry) => (entry.at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                    None => IDLE_SLEEP,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => self.dispatch_due(),
                // heap changed — recompute the deadline
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("task scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.started.store(false, AtomicOrdering::SeqCst);
    }

    /// Pop and start every due fire. Entries whose generation no longer
    /// matches their task's are discarded unfired.
    fn dispatch_due(self: &Arc<Self>) {
        let now = Utc::now();
        // Collect eagerly so the state lock is not held while firing.
        let due: Vec<(Task, u64, AttemptKind)> = {
            let mut state = self.state.lock().unwrap();
            let mut due = Vec::new();
            while let Some(head_at) = state.queue.peek().map(|e| e.at) {
                if head_at > now {
                    break;
                }
                if let Some(entry) = state.queue.pop() {
                    match state.jobs.get(&entry.task_id) {
                        Some(job) if job.generation == entry.generation => {
                            due.push((job.task.clone(), entry.generation, entry.kind));
                        }
                        _ => {
                            debug!(task_id = %entry.task_id, "discarding superseded fire entry");
                        }
                    }
                }
            }
            due
        };

        for (task, generation, kind) in due {
            Arc::clone(self).fire(task, Some(generation), kind);
        }
    }

    /// Try to start one attempt: take the task's run lock, record a pending
    /// execution, and hand off to a spawned `run_attempt`.
    ///
    /// If the lock is busy the fire is skipped entirely — no row — and the
    /// regular schedule is re-armed from now when this fire owned it.
    /// `generation` is `None` for fires of a task that is not armed (the
    /// detached retries of a manual run).
    fn fire(self: Arc<Self>, task: Task, generation: Option<u64>, kind: AttemptKind) {
        let guard = match self.lock_for(&task.id).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!(task_id = %task.id, ?kind, "previous attempt still in flight; fire skipped");
                self.rearm_owned(&task.id, generation, kind);
                return;
            }
        };

        let execution = match self
            .executions
            .create(&task.id, kind.triggered_by(), None, kind.retry_count())
        {
            Ok(execution) => execution,
            Err(e) => {
                error!(task_id = %task.id, "could not record execution: {e}");
                drop(guard);
                self.rearm_owned(&task.id, generation, kind);
                return;
            }
        };

        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            scheduler
                .run_attempt(task, generation, kind, execution, guard)
                .await;
        });
    }

    /// Drive one attempt from pending to a terminal state, then decide what
    /// comes next (retry or re-arm). Holds the task's run lock throughout.
    async fn run_attempt(
        self: Arc<Self>,
        task: Task,
        generation: Option<u64>,
        kind: AttemptKind,
        execution: Execution,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) {
        // The handle is registered before any waiting so an attempt still
        // queued on the global cap can be cancelled too.
        let cancel = CancellationToken::new();
        self.running.insert(
            task.id.clone(),
            RunHandle {
                execution_id: execution.id.clone(),
                cancel: cancel.clone(),
                cancelled_by: Mutex::new(None),
            },
        );

        // Global concurrency cap: the row stays pending while queued here.
        let permit = tokio::select! {
            permit = self.acquire_run_permit() => Some(permit),
            _ = cancel.cancelled() => None,
        };

        let outcome = match permit {
            Some(_permit) => {
                let started = Utc::now();
                if let Err(e) = self.executions.mark_running(&execution.id, started) {
                    error!(execution_id = %execution.id, "could not mark execution running: {e}");
                    self.running.remove(&task.id);
                    drop(guard);
                    self.rearm_owned(&task.id, generation, kind);
                    return;
                }
                if let Err(e) = self.tasks.set_last_execution(&task.id, started) {
                    // The task may have been deleted mid-flight; the attempt goes on.
                    debug!(task_id = %task.id, "could not record last execution: {e}");
                }
                info!(
                    task_id = %task.id,
                    execution_id = %execution.id,
                    source = %kind.triggered_by(),
                    retry = kind.retry_count(),
                    "attempt started"
                );
                self.invoke_script(&task, cancel).await
            }
            None => {
                info!(
                    task_id = %task.id,
                    execution_id = %execution.id,
                    "cancelled while queued for a run permit"
                );
                AttemptOutcome::Cancelled
            }
        };

        let cancelled_by = self
            .running
            .remove(&task.id)
            .and_then(|(_, handle)| handle.cancelled_by.lock().unwrap().take());

        let (status, fields) = match outcome {
            AttemptOutcome::Completed(result) => (
                ExecutionStatus::Completed,
                ExecutionOutcome {
                    rows_before: result.rows_before,
                    rows_after: result.rows_after,
                    ..ExecutionOutcome::default()
                },
            ),
            AttemptOutcome::Failed { message, trace } => (
                ExecutionStatus::Failed,
                ExecutionOutcome {
                    error_message: Some(message),
                    error_trace: trace,
                    ..ExecutionOutcome::default()
                },
            ),
            AttemptOutcome::TimedOut { after } => (
                ExecutionStatus::Timeout,
                ExecutionOutcome {
                    error_message: Some(format!("timed out after {}s", after.as_secs())),
                    ..ExecutionOutcome::default()
                },
            ),
            AttemptOutcome::Cancelled => (
                ExecutionStatus::Cancelled,
                ExecutionOutcome {
                    error_message: Some(match &cancelled_by {
                        Some(operator) => format!("cancelled by {operator}"),
                        None => "cancelled".to_string(),
                    }),
                    ..ExecutionOutcome::default()
                },
            ),
        };

        if let Err(e) = self
            .executions
            .mark_terminal(&execution.id, status, Utc::now(), &fields)
        {
            error!(execution_id = %execution.id, "could not finalise execution: {e}");
        }
        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            status = %status,
            "attempt finished"
        );

        // Release the run lock before arming followups so a retry that is
        // already due can start immediately.
        drop(guard);
        self.after_attempt(&task, generation, kind, status);
    }

    /// Post-terminal bookkeeping: schedule a retry when the policy says so,
    /// otherwise re-arm the regular schedule if this attempt owned it.
    fn after_attempt(
        self: &Arc<Self>,
        task: &Task,
        generation: Option<u64>,
        kind: AttemptKind,
        status: ExecutionStatus,
    ) {
        let attempt = kind.retry_count() + 1;
        if self
            .retry
            .should_retry(status, attempt, task.retry_on_failure, task.max_retries)
        {
            let delay = self.retry.backoff_delay(attempt);
            info!(
                task_id = %task.id,
                attempt,
                delay_secs = delay.as_secs(),
                "attempt failed; retry scheduled"
            );
            match generation {
                Some(generation) => {
                    self.schedule_retry(&task.id, generation, attempt, kind.reschedules(), delay)
                }
                None => self.detached_retry(task.clone(), attempt, delay),
            }
        } else {
            self.rearm_owned(&task.id, generation, kind);
        }
    }

    /// Queue retry number `attempt` after `delay`. The chain dies silently
    /// if the task was unregistered or re-registered in the meantime.
    fn schedule_retry(
        &self,
        id: &TaskId,
        generation: u64,
        attempt: u32,
        reschedules: bool,
        delay: Duration,
    ) {
        let at = Utc::now() + chrono::Duration::seconds(delay.as_secs().min(i64::MAX as u64) as i64);

        let mut state = self.state.lock().unwrap();
        match state.jobs.get_mut(id) {
            Some(job) if job.generation == generation => {
                job.next_fire = Some(at);
            }
            _ => {
                debug!(task_id = %id, "dropping retry for a superseded registration");
                return;
            }
        }
        state.queue.push(FireEntry {
            at,
            task_id: id.clone(),
            generation,
            kind: AttemptKind::Retry {
                attempt,
                reschedules,
            },
        });
        drop(state);

        if let Err(e) = self.tasks.set_next_execution(id, Some(at)) {
            warn!(task_id = %id, "could not persist retry fire time: {e}");
        }
        self.notify.notify_one();
    }

    /// Retry timer for an attempt whose task is not armed — the chain of a
    /// manual run of a paused task. The chain carries its task snapshot and
    /// fires directly, bypassing the heap; the run lock still serialises it
    /// against everything else.
    fn detached_retry(self: &Arc<Self>, task: Task, attempt: u32, delay: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(
                task,
                None,
                AttemptKind::Retry {
                    attempt,
                    reschedules: false,
                },
            );
        });
    }

    /// Re-arm the regular schedule from now when this attempt owned it and
    /// its registration is still the live one.
    fn rearm_owned(&self, id: &TaskId, generation: Option<u64>, kind: AttemptKind) {
        if !kind.reschedules() {
            return;
        }
        if let Some(generation) = generation {
            self.rearm(id, generation, Utc::now());
        }
    }

    /// Compute and queue the next regular fire strictly after `after`.
    /// An exhausted schedule (a `Once` that has fired) disarms and
    /// deactivates the task.
    fn rearm(&self, id: &TaskId, generation: u64, after: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        let next = match state.jobs.get_mut(id) {
            Some(job) if job.generation == generation => {
                let next = next_fire_time(&job.task.schedule, after);
                job.next_fire = next;
                next
            }
            _ => return,
        };

        match next {
            Some(at) => {
                state.queue.push(FireEntry {
                    at,
                    task_id: id.clone(),
                    generation,
                    kind: AttemptKind::Scheduled,
                });
                drop(state);
                if let Err(e) = self.tasks.set_next_execution(id, Some(at)) {
                    warn!(task_id = %id, "could not persist next fire time: {e}");
                }
                self.notify.notify_one();
            }
            None => {
                state.jobs.remove(id);
                drop(state);
                if let Err(e) = self.tasks.set_next_execution(id, None) {
                    warn!(task_id = %id, "could not clear next fire time: {e}");
                }
                if let Err(e) = self.tasks.set_active(id, false) {
                    warn!(task_id = %id, "could not deactivate exhausted task: {e}");
                }
                info!(task_id = %id, "schedule exhausted; task deactivated");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Script invocation
    // -----------------------------------------------------------------------

    /// Resolve and run the task's script under its effective deadline.
    ///
    /// On timeout the token is cancelled first; a script that does not yield
    /// within [`CANCEL_GRACE`] is aborted. Either way the attempt reports
    /// a timeout, not a cancellation.
    async fn invoke_script(&self, task: &Task, cancel: CancellationToken) -> AttemptOutcome {
        let script = match self.registry.resolve(&task.script_id) {
            Ok(script) => script,
            Err(e) => {
                // Registered at creation but gone now — config changed.
                return AttemptOutcome::Failed {
                    message: e.to_string(),
                    trace: None,
                };
            }
        };

        let deadline = if task.timeout_secs > 0 {
            Some(Duration::from_secs(task.timeout_secs))
        } else {
            script.default_timeout()
        };

        let parameters = task.parameters.clone();
        let script_cancel = cancel.clone();
        let mut handle =
            tokio::spawn(async move { script.execute(&parameters, script_cancel).await });

        let joined = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_elapsed) => {
                    warn!(task_id = %task.id, limit_secs = limit.as_secs(), "deadline passed");
                    cancel.cancel();
                    if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                        handle.abort();
                        let _ = handle.await;
                    }
                    return AttemptOutcome::TimedOut { after: limit };
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok(Ok(result)) => AttemptOutcome::Completed(result),
            Ok(Err(ScriptError::Cancelled)) => AttemptOutcome::Cancelled,
            Ok(Err(ScriptError::Failed { message, trace })) => {
                AttemptOutcome::Failed { message, trace }
            }
            Ok(Err(other)) => AttemptOutcome::Failed {
                message: other.to_string(),
                trace: None,
            },
            Err(join_error) => AttemptOutcome::Failed {
                message: format!("script task panicked: {join_error}"),
                trace: None,
            },
        }
    }

    async fn acquire_run_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.run_permits {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        }
    }

    fn lock_for(&self, id: &TaskId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// How a single attempt ended, before it is written to the store.
enum AttemptOutcome {
    Completed(ScriptOutcome),
    Failed {
        message: String,
        trace: Option<String>,
    },
    TimedOut {
        after: Duration,
    },
    Cancelled,
}
