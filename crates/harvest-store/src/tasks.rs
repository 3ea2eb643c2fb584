use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{error, info, instrument};

use harvest_core::{Schedule, TaskId};

use crate::error::{Result, StoreError};
use crate::types::{NewTask, Task, TaskPatch};

const TASK_COLUMNS: &str = "id, name, script_id, schedule, parameters, is_active, \
     retry_on_failure, max_retries, timeout_secs, last_execution_at, next_execution_at, \
     created_at, updated_at";

/// Thread-safe store for persisted task definitions.
///
/// Wraps a single SQLite connection in a `Mutex`; the scheduler and
/// management callers each hold their own store over their own connection.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Insert a new task. The next fire time is left unset; arming the task
    /// fills it in.
    #[instrument(skip(self, new), fields(name = %new.name, script = %new.script_id))]
    pub fn create(&self, new: &NewTask) -> Result<Task> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        let schedule_json = serde_json::to_string(&new.schedule)?;
        let parameters_json = serde_json::to_string(&new.parameters)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tasks
             (id, name, script_id, schedule, parameters, is_active,
              retry_on_failure, max_retries, timeout_secs,
              last_execution_at, next_execution_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,NULL,?10,?10)",
            rusqlite::params![
                id.as_str(),
                new.name,
                new.script_id,
                schedule_json,
                parameters_json,
                new.is_active,
                new.retry_on_failure,
                new.max_retries,
                new.timeout_secs as i64,
                now,
            ],
        )?;
        info!(task_id = %id, "task created");

        Ok(Task {
            id,
            name: new.name.clone(),
            script_id: new.script_id.clone(),
            schedule: new.schedule.clone(),
            parameters: new.parameters.clone(),
            is_active: new.is_active,
            retry_on_failure: new.retry_on_failure,
            max_retries: new.max_retries,
            timeout_secs: new.timeout_secs,
            last_execution_at: None,
            next_execution_at: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Retrieve a task by id, returning `None` if it does not exist.
    pub fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let db = self.db.lock().unwrap();
        let raw = match db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            rusqlite::params![id.as_str()],
            row_to_raw,
        ) {
            Ok(raw) => raw,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };
        raw.parse().map(Some)
    }

    /// All tasks ordered by creation time. Rows whose schedule or parameter
    /// JSON no longer parses are logged and skipped, never fatal.
    pub fn list_all(&self) -> Result<Vec<Task>> {
        self.list_where("")
    }

    /// Active tasks only — the set the scheduler arms on startup.
    pub fn list_active(&self) -> Result<Vec<Task>> {
        self.list_where("WHERE is_active = 1")
    }

    fn list_where(&self, where_clause: &str) -> Result<Vec<Task>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_clause} ORDER BY created_at"
        ))?;
        let raws: Vec<RawTask> = stmt
            .query_map([], row_to_raw)?
            .filter_map(|r| r.ok())
            .collect();

        let mut tasks = Vec::with_capacity(raws.len());
        for raw in raws {
            let id = raw.id.clone();
            match raw.parse() {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    error!(task_id = %id, "skipping unreadable task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    /// Apply a partial update and return the new task state.
    #[instrument(skip(self, patch), fields(task_id = %id))]
    pub fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task> {
        let mut task = self.get(id)?.ok_or_else(|| StoreError::TaskNotFound {
            id: id.to_string(),
        })?;

        if let Some(name) = &patch.name {
            task.name = name.clone();
        }
        if let Some(schedule) = &patch.schedule {
            task.schedule = schedule.clone();
        }
        if let Some(parameters) = &patch.parameters {
            task.parameters = parameters.clone();
        }
        if let Some(retry) = patch.retry_on_failure {
            task.retry_on_failure = retry;
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(timeout) = patch.timeout_secs {
            task.timeout_secs = timeout;
        }
        task.updated_at = Utc::now().to_rfc3339();

        let schedule_json = serde_json::to_string(&task.schedule)?;
        let parameters_json = serde_json::to_string(&task.parameters)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE tasks
             SET name = ?1, schedule = ?2, parameters = ?3, retry_on_failure = ?4,
                 max_retries = ?5, timeout_secs = ?6, updated_at = ?7
             WHERE id = ?8",
            rusqlite::params![
                task.name,
                schedule_json,
                parameters_json,
                task.retry_on_failure,
                task.max_retries,
                task.timeout_secs as i64,
                task.updated_at,
                id.as_str(),
            ],
        )?;
        info!("task updated");
        Ok(task)
    }

    /// Permanently delete a task definition. Its execution history survives.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn delete(&self, id: &TaskId) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "DELETE FROM tasks WHERE id = ?1",
            rusqlite::params![id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        info!("task deleted");
        Ok(())
    }

    /// Flip the active flag. Arming/disarming is the scheduler's job.
    #[instrument(skip(self), fields(task_id = %id, active))]
    pub fn set_active(&self, id: &TaskId, active: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![active, now, id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record the planned next fire, or clear it when the task is disarmed.
    pub fn set_next_execution(&self, id: &TaskId, next: Option<DateTime<Utc>>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET next_execution_at = ?1 WHERE id = ?2",
            rusqlite::params![next.map(|dt| dt.to_rfc3339()), id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record the start instant of the most recent attempt.
    pub fn set_last_execution(&self, id: &TaskId, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE tasks SET last_execution_at = ?1 WHERE id = ?2",
            rusqlite::params![at.to_rfc3339(), id.as_str()],
        )?;
        if rows_changed == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

/// Column values as stored, before the JSON columns are parsed.
struct RawTask {
    id: String,
    name: String,
    script_id: String,
    schedule_json: String,
    parameters_json: String,
    is_active: bool,
    retry_on_failure: bool,
    max_retries: u32,
    timeout_secs: i64,
    last_execution_at: Option<String>,
    next_execution_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        name: row.get(1)?,
        script_id: row.get(2)?,
        schedule_json: row.get(3)?,
        parameters_json: row.get(4)?,
        is_active: row.get(5)?,
        retry_on_failure: row.get(6)?,
        max_retries: row.get(7)?,
        timeout_secs: row.get(8)?,
        last_execution_at: row.get(9)?,
        next_execution_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl RawTask {
    fn parse(self) -> Result<Task> {
        let schedule: Schedule = serde_json::from_str(&self.schedule_json)?;
        let parameters: serde_json::Value = serde_json::from_str(&self.parameters_json)?;
        Ok(Task {
            id: TaskId::from(self.id),
            name: self.name,
            script_id: self.script_id,
            schedule,
            parameters,
            is_active: self.is_active,
            retry_on_failure: self.retry_on_failure,
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs as u64,
            last_execution_at: self.last_execution_at,
            next_execution_at: self.next_execution_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
