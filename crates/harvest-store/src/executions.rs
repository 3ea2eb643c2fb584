use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use harvest_core::{ExecutionId, TaskId};

use crate::error::{Result, StoreError};
use crate::types::{
    Execution, ExecutionFilter, ExecutionOutcome, ExecutionPage, ExecutionStats, ExecutionStatus,
    Page, TriggeredBy,
};

const EXECUTION_COLUMNS: &str = "id, task_id, status, triggered_by, operator_id, retry_count, \
     start_time, end_time, duration_secs, rows_before, rows_after, error_message, error_trace, \
     created_at";

/// Append-only execution history.
///
/// Rows are never deleted; every attempt (first run, manual trigger, retry)
/// gets its own row, and terminal rows are immutable.
pub struct ExecutionStore {
    db: Mutex<Connection>,
}

impl ExecutionStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Record a new pending attempt. Called after the task's run lock is
    /// held, so at most one non-terminal row exists per task.
    #[instrument(skip(self), fields(task_id = %task_id, source = %triggered_by))]
    pub fn create(
        &self,
        task_id: &TaskId,
        triggered_by: TriggeredBy,
        operator_id: Option<&str>,
        retry_count: u32,
    ) -> Result<Execution> {
        let id = ExecutionId::new();
        let now = Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO executions
             (id, task_id, status, triggered_by, operator_id, retry_count, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id.as_str(),
                task_id.as_str(),
                triggered_by.to_string(),
                operator_id,
                retry_count,
                now,
            ],
        )?;
        debug!(execution_id = %id, retry_count, "execution recorded");

        Ok(Execution {
            id,
            task_id: task_id.clone(),
            status: ExecutionStatus::Pending,
            triggered_by,
            operator_id: operator_id.map(str::to_string),
            retry_count,
            start_time: None,
            end_time: None,
            duration_secs: None,
            rows_before: None,
            rows_after: None,
            error_message: None,
            error_trace: None,
            created_at: now,
        })
    }

    /// Transition a pending row to running and stamp its start time.
    #[instrument(skip(self), fields(execution_id = %id))]
    pub fn mark_running(&self, id: &ExecutionId, start: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE executions SET status = 'running', start_time = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![start.to_rfc3339(), id.as_str()],
        )?;
        if rows_changed == 0 {
            return match status_of(&db, id)? {
                Some(status) => Err(StoreError::AlreadyTerminal {
                    id: id.to_string(),
                    status,
                }),
                None => Err(StoreError::ExecutionNotFound { id: id.to_string() }),
            };
        }
        Ok(())
    }

    /// Finalise an attempt. `status` must be one of the terminal states.
    ///
    /// The duration is derived in SQL from the stored start time, so a row
    /// that never reached running (e.g. cancelled while pending) keeps a
    /// NULL duration. Calling this on an already-terminal row fails with
    /// [`StoreError::AlreadyTerminal`] and leaves the row untouched.
    #[instrument(skip(self, outcome), fields(execution_id = %id, status = %status))]
    pub fn mark_terminal(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        end: DateTime<Utc>,
        outcome: &ExecutionOutcome,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE executions
             SET status = ?1,
                 end_time = ?2,
                 duration_secs = CASE WHEN start_time IS NULL THEN NULL
                                      ELSE (julianday(?2) - julianday(start_time)) * 86400.0 END,
                 rows_before = ?3,
                 rows_after = ?4,
                 error_message = ?5,
                 error_trace = ?6
             WHERE id = ?7 AND status IN ('pending', 'running')",
            rusqlite::params![
                status.to_string(),
                end.to_rfc3339(),
                outcome.rows_before,
                outcome.rows_after,
                outcome.error_message,
                outcome.error_trace,
                id.as_str(),
            ],
        )?;
        if rows_changed == 0 {
            return match status_of(&db, id)? {
                Some(status) => Err(StoreError::AlreadyTerminal {
                    id: id.to_string(),
                    status,
                }),
                None => Err(StoreError::ExecutionNotFound { id: id.to_string() }),
            };
        }
        debug!("execution finalised");
        Ok(())
    }

    /// Retrieve one attempt by id.
    pub fn get(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            rusqlite::params![id.as_str()],
            row_to_execution,
        ) {
            Ok(execution) => Ok(Some(execution)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Page through history, newest first. Filter fields are conjunctive;
    /// time bounds apply to the row's creation time.
    pub fn list(&self, filter: &ExecutionFilter, page: &Page) -> Result<ExecutionPage> {
        let (where_clause, params) = filter_sql(filter);
        let db = self.db.lock().unwrap();

        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM executions {where_clause}"),
            rusqlite::params_from_iter(params.iter()),
            |row| row.get(0),
        )?;

        let mut stmt = db.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions {where_clause}
             ORDER BY created_at DESC, id DESC
             LIMIT {} OFFSET {}",
            page.limit, page.offset
        ))?;
        let executions = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_execution)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(ExecutionPage {
            executions,
            total: total as u64,
            limit: page.limit,
            offset: page.offset,
        })
    }

    /// Aggregate statistics over the rows matching `filter`.
    pub fn stats(&self, filter: &ExecutionFilter) -> Result<ExecutionStats> {
        let (where_clause, mut params) = filter_sql(filter);
        // Midnight UTC, in the same textual form the timestamps are stored in.
        let today_start = format!("{}T00:00:00+00:00", Utc::now().format("%Y-%m-%d"));
        let today_param = params.len() + 1;
        params.push(today_start);

        let db = self.db.lock().unwrap();
        let (total, success, failed, avg_duration, today) = db.query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status IN ('failed', 'timeout') THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(duration_secs), 0.0),
                        COALESCE(SUM(CASE WHEN created_at >= ?{today_param} THEN 1 ELSE 0 END), 0)
                 FROM executions {where_clause}"
            ),
            rusqlite::params_from_iter(params.iter()),
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        let success_rate = if total == 0 {
            0.0
        } else {
            success as f64 * 100.0 / total as f64
        };

        Ok(ExecutionStats {
            total_count: total as u64,
            success_count: success as u64,
            failed_count: failed as u64,
            success_rate,
            avg_duration_secs: avg_duration,
            today_count: today as u64,
        })
    }

    /// Close attempts left in a non-terminal state by a previous process,
    /// e.g. after a crash or hard kill. Returns how many rows were closed.
    pub fn fail_orphaned(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let rows_changed = db.execute(
            "UPDATE executions
             SET status = 'failed',
                 end_time = ?1,
                 duration_secs = CASE WHEN start_time IS NULL THEN NULL
                                      ELSE (julianday(?1) - julianday(start_time)) * 86400.0 END,
                 error_message = ?2
             WHERE status IN ('pending', 'running')",
            rusqlite::params![
                now.to_rfc3339(),
                "process terminated before the attempt completed",
            ],
        )?;
        if rows_changed > 0 {
            info!(count = rows_changed, "closed orphaned executions from a previous run");
        }
        Ok(rows_changed)
    }
}

fn status_of(db: &Connection, id: &ExecutionId) -> Result<Option<String>> {
    match db.query_row(
        "SELECT status FROM executions WHERE id = ?1",
        rusqlite::params![id.as_str()],
        |row| row.get(0),
    ) {
        Ok(status) => Ok(Some(status)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Database(e)),
    }
}

/// Build a conjunctive WHERE clause with numbered placeholders.
fn filter_sql(filter: &ExecutionFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut params: Vec<String> = Vec::new();

    if let Some(task_id) = &filter.task_id {
        clauses.push(format!("task_id = ?{}", params.len() + 1));
        params.push(task_id.to_string());
    }
    if let Some(status) = filter.status {
        clauses.push(format!("status = ?{}", params.len() + 1));
        params.push(status.to_string());
    }
    if let Some(since) = filter.since {
        clauses.push(format!("created_at >= ?{}", params.len() + 1));
        params.push(since.to_rfc3339());
    }
    if let Some(until) = filter.until {
        clauses.push(format!("created_at < ?{}", params.len() + 1));
        params.push(until.to_rfc3339());
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (where_clause, params)
}

fn parse_text_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    let triggered_by: String = row.get(3)?;
    Ok(Execution {
        id: ExecutionId::from(row.get::<_, String>(0)?),
        task_id: TaskId::from(row.get::<_, String>(1)?),
        status: parse_text_col(2, &status)?,
        triggered_by: parse_text_col(3, &triggered_by)?,
        operator_id: row.get(4)?,
        retry_count: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        duration_secs: row.get(8)?,
        rows_before: row.get(9)?,
        rows_after: row.get(10)?,
        error_message: row.get(11)?,
        error_trace: row.get(12)?,
        created_at: row.get(13)?,
    })
}
