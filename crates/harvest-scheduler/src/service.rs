//! Lifecycle and management facade over the fire loop.
//!
//! The service owns the [`TaskScheduler`] plus the stores and exposes the
//! operations the daemon and CLI call: task CRUD with arming, manual
//! triggers, cancellation, history queries, and start/stop/reload.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use harvest_core::config::HarvestConfig;
use harvest_core::{ExecutionId, TaskId};
use harvest_scripts::ScriptRegistry;
use harvest_store::{
    Execution, ExecutionFilter, ExecutionPage, ExecutionStats, ExecutionStore, NewTask, Page,
    StoreError, Task, TaskPatch, TaskStore,
};

use crate::engine::TaskScheduler;
use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;
use crate::trigger::{next_fire_time, validate};
use crate::types::SchedulerHealth;

pub struct SchedulerService {
    engine: Arc<TaskScheduler>,
    tasks: Arc<TaskStore>,
    executions: Arc<ExecutionStore>,
    registry: Arc<ScriptRegistry>,
    startup_catchup: bool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(
        tasks: Arc<TaskStore>,
        executions: Arc<ExecutionStore>,
        registry: Arc<ScriptRegistry>,
        config: &HarvestConfig,
    ) -> Self {
        let engine = Arc::new(TaskScheduler::new(
            Arc::clone(&tasks),
            Arc::clone(&executions),
            Arc::clone(&registry),
            RetryPolicy::from_config(&config.retry),
            config.scheduler.max_concurrent_runs,
        ));
        Self {
            engine,
            tasks,
            executions,
            registry,
            startup_catchup: config.scheduler.startup_catchup,
            shutdown: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover orphaned executions, arm every active task from the store,
    /// and spawn the fire loop. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut shutdown = self.shutdown.lock().unwrap();
        if shutdown.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        // Attempts left non-terminal by a crash are closed before anything
        // new fires, so at most one live attempt per task holds afterwards.
        self.executions.fail_orphaned(Utc::now())?;
        self.arm_from_store(self.startup_catchup)?;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.engine).run(rx));
        *shutdown = Some(tx);
        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop firing. In-flight attempts are not awaited — on the next start
    /// their rows are closed by orphan recovery. Idempotent.
    pub async fn stop(&self) {
        let tx = self.shutdown.lock().unwrap().take();
        if let Some(tx) = tx {
            tx.send(true).ok();
        }
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("fire loop ended abnormally: {e}");
            }
        }
        info!("scheduler service stopped");
    }

    /// Re-sync the armed set with the store: disarm everything, then arm all
    /// active tasks with fire times recomputed from now. Missed fires are
    /// skipped; catch-up is a startup-only behaviour.
    pub fn reload(&self) -> Result<()> {
        self.arm_from_store(false)
    }

    fn arm_from_store(&self, catchup: bool) -> Result<()> {
        let now = Utc::now();
        for id in self.engine.armed_ids() {
            self.engine.unregister(&id);
        }

        // Unreadable rows were already logged and skipped by the store.
        let tasks = self.tasks.list_active()?;
        let total = tasks.len();
        let mut armed = 0usize;
        for task in tasks {
            if !self.registry.contains(&task.script_id) {
                warn!(
                    task_id = %task.id,
                    script_id = %task.script_id,
                    "script not registered; attempts will fail until it appears"
                );
            }
            let missed = task
                .next_execution_at
                .as_deref()
                .and_then(parse_rfc3339)
                .is_some_and(|at| at < now);

            let id = task.id.clone();
            match self.engine.register(task) {
                Ok(()) => {
                    armed += 1;
                    if catchup && missed {
                        info!(task_id = %id, "fire was missed while down; catching up");
                        if let Err(e) = self.engine.trigger_catchup(&id) {
                            warn!(task_id = %id, "could not queue catch-up fire: {e}");
                        }
                    }
                }
                Err(e) => warn!(task_id = %id, "skipping unschedulable task: {e}"),
            }
        }
        info!(armed, total, "tasks armed from store");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Create a task and, when it is active, arm it immediately.
    ///
    /// Rejected up front: malformed schedules, schedules that would never
    /// fire (a `Once` in the past), and script IDs the registry does not
    /// know.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        validate(&new.schedule)?;
        if !self.registry.contains(&new.script_id) {
            return Err(SchedulerError::ScriptNotFound {
                id: new.script_id.clone(),
            });
        }
        if next_fire_time(&new.schedule, Utc::now()).is_none() {
            return Err(SchedulerError::InvalidSchedule(
                "the schedule would never fire".to_string(),
            ));
        }

        let task = self.tasks.create(&new)?;
        if task.is_active {
            self.engine.register(task.clone())?;
        }
        Ok(task)
    }

    /// Apply a partial update and re-arm under the new definition.
    ///
    /// An in-flight attempt keeps running to its terminal state; the
    /// per-task run lock survives re-arming, so the new definition cannot
    /// overlap with it.
    pub fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        if let Some(schedule) = &patch.schedule {
            validate(schedule)?;
        }
        let task = self.tasks.update(id, &patch).map_err(not_found)?;

        self.engine.unregister(id);
        if task.is_active {
            self.engine.register(task.clone())?;
        }
        Ok(task)
    }

    /// Disarm and delete a task. Its execution history is kept.
    pub fn delete_task(&self, id: &TaskId) -> Result<()> {
        self.engine.unregister(id);
        self.tasks.delete(id).map_err(not_found)
    }

    /// Disarm a task and mark it inactive. Pending fires and retries are
    /// dropped; an in-flight attempt is not interrupted.
    pub fn pause_task(&self, id: &TaskId) -> Result<()> {
        self.engine.unregister(id);
        self.tasks.set_active(id, false).map_err(not_found)
    }

    /// Reactivate a paused task, computing its next fire from now.
    pub fn resume_task(&self, id: &TaskId) -> Result<Task> {
        let mut task = self
            .tasks
            .get(id)?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        task.is_active = true;

        if !self.engine.is_registered(id) {
            self.engine.register(task)?;
        }
        self.tasks.set_active(id, true).map_err(not_found)?;
        // `register` persisted a fresh fire time; hand back the stored row.
        self.get_task(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.tasks
            .get(id)?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.list_all()?)
    }

    // -----------------------------------------------------------------------
    // Execution control and history
    // -----------------------------------------------------------------------

    /// Run a task immediately, recording who asked. Works on paused tasks
    /// too; only the schedule honours `is_active`.
    pub fn trigger_now(&self, id: &TaskId, operator_id: Option<&str>) -> Result<Execution> {
        self.engine.trigger_now(id, operator_id)
    }

    /// Cancel a task's in-flight attempt.
    pub fn cancel_running(&self, id: &TaskId, operator_id: Option<&str>) -> Result<ExecutionId> {
        self.engine.cancel_running(id, operator_id)
    }

    pub fn list_executions(&self, filter: &ExecutionFilter, page: &Page) -> Result<ExecutionPage> {
        Ok(self.executions.list(filter, page)?)
    }

    pub fn get_execution_stats(&self, filter: &ExecutionFilter) -> Result<ExecutionStats> {
        Ok(self.executions.stats(filter)?)
    }

    pub fn scheduler_health(&self) -> SchedulerHealth {
        self.engine.health()
    }
}

/// Store-level "no such task" becomes the scheduler's own variant so
/// callers see one error shape for missing tasks.
fn not_found(e: StoreError) -> SchedulerError {
    match e {
        StoreError::TaskNotFound { id } => SchedulerError::TaskNotFound { id },
        other => SchedulerError::Store(other),
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
