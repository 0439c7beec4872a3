//! SQLite-backed schema for the audit store, per spec §6's logical
//! table layout. Connection handling follows the teacher's
//! `MemoryDatabase::new`: WAL journal mode, a busy timeout, and an
//! idempotent `CREATE TABLE IF NOT EXISTS` schema init guarded by a
//! single `Arc<tokio::sync::Mutex<Connection>>`.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{StoreError, StoreResult};

pub(crate) fn open(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Write(format!("failed to open audit store at {path:?}: {e}")))?;
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    init_schema(&conn)?;
    Ok(conn)
}

pub(crate) fn open_in_memory() -> StoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

const CURRENT_SCHEMA_VERSION: i64 = 1;

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            plan_hash TEXT NOT NULL,
            policy_hash TEXT NOT NULL,
            plan_json TEXT NOT NULL,
            policy_json TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            total_steps INTEGER NOT NULL DEFAULT 0,
            completed_steps INTEGER NOT NULL DEFAULT 0,
            denied_steps INTEGER NOT NULL DEFAULT 0,
            failed_steps INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);

        CREATE TABLE IF NOT EXISTS tool_calls (
            call_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(run_id),
            step_index INTEGER NOT NULL,
            tool_name TEXT NOT NULL,
            args_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_calls_run_id ON tool_calls(run_id);

        CREATE TABLE IF NOT EXISTS tool_results (
            call_id TEXT PRIMARY KEY REFERENCES tool_calls(call_id),
            run_id TEXT NOT NULL REFERENCES runs(run_id),
            status TEXT NOT NULL,
            output_json TEXT,
            error TEXT,
            policy_decision_json TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            output_hash TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_results_run_id ON tool_results(run_id);",
    )?;

    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(None);
    if current.unwrap_or(0) < CURRENT_SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![CURRENT_SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
        )?;
    }
    Ok(())
}
