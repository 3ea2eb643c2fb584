use rusqlite::Connection;

use crate::error::Result;

/// Initialise the harvest schema. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_tasks_table(conn)?;
    create_executions_table(conn)?;
    Ok(())
}

fn create_tasks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL,
            script_id         TEXT    NOT NULL,
            schedule          TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            parameters        TEXT    NOT NULL,   -- JSON object passed to the script
            is_active         INTEGER NOT NULL DEFAULT 1,
            retry_on_failure  INTEGER NOT NULL DEFAULT 1,
            max_retries       INTEGER NOT NULL DEFAULT 3,
            timeout_secs      INTEGER NOT NULL DEFAULT 0,  -- 0 means no limit
            last_execution_at TEXT,               -- ISO-8601 or NULL
            next_execution_at TEXT,               -- ISO-8601 or NULL
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_tasks_active ON tasks (is_active);
        ",
    )?;
    Ok(())
}

fn create_executions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS executions (
            id            TEXT    NOT NULL PRIMARY KEY,
            task_id       TEXT    NOT NULL,   -- weak reference; survives task deletion
            status        TEXT    NOT NULL DEFAULT 'pending',
            triggered_by  TEXT    NOT NULL DEFAULT 'scheduler',
            operator_id   TEXT,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            start_time    TEXT,               -- ISO-8601, set on transition to running
            end_time      TEXT,               -- ISO-8601, set on any terminal transition
            duration_secs REAL,
            rows_before   INTEGER,
            rows_after    INTEGER,
            error_message TEXT,
            error_trace   TEXT,
            created_at    TEXT    NOT NULL
        ) STRICT;

        -- History listing: WHERE task_id = ? ORDER BY created_at DESC
        CREATE INDEX IF NOT EXISTS idx_executions_task
            ON executions (task_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions (status);
        ",
    )?;
    Ok(())
}
