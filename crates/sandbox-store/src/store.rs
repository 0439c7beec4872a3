//! The Audit Store: durable, single-file, append-only persistence with
//! transactional guarantees across one process. See spec §4.2.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sandbox_types::{
    hash_value, Call, CallResult, CallStatus, Plan, Policy, PolicyDecision, Run, RunMode,
    RunStatus, RunSummary,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db;
use crate::error::{StoreError, StoreResult};

/// Durable, single-file audit store. Cloning shares the same
/// underlying connection (wrapped in `Arc<Mutex<..>>`), matching the
/// teacher's `MemoryDatabase`/`Storage` pattern of a cheaply-cloneable
/// handle over one shared connection.
#[derive(Clone)]
pub struct AuditStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// The default audit store location: `<data dir>/sandbox/audit.sqlite`,
/// mirroring the teacher's `resolve_shared_paths` convention of one
/// app-named directory under the OS data dir.
pub fn default_store_path() -> StoreResult<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| StoreError::Write("failed to resolve platform data dir".to_string()))?;
    Ok(base.join("sandbox").join("audit.sqlite"))
}

impl AuditStore {
    /// Open (creating if absent) a single-file audit store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || db::open(&path))
                .await
                .map_err(|e| StoreError::Write(format!("audit store open task panicked: {e}")))??
        };
        tracing::info!(path = %path.display(), "audit store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// An in-memory store, used by tests and by callers that want a
    /// scratch audit trail for a single process lifetime.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = db::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Computes `plan_hash`/`policy_hash`, embeds the serialized plan
    /// and policy verbatim (so replay needs no external files), and
    /// sets `status = running`, `total_steps` from the plan length.
    pub async fn create_run(&self, plan: Plan, policy: Policy, mode: RunMode) -> StoreResult<String> {
        let run = Run::new(plan, policy, mode);
        let run_id = run.run_id.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn_guard_blocking(&conn)?;
            insert_run(&guard, &run)
        })
            .await
            .map_err(|e| StoreError::Write(format!("create_run task panicked: {e}")))??;
        tracing::debug!(run_id = %run_id, "run created");
        Ok(run_id)
    }

    /// Sets `completed_at` when `status` is terminal (`completed` or
    /// `failed`). Counters are overwritten, not incremented — the
    /// caller computes totals.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        completed: u64,
        denied: u64,
        failed: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let completed_at = matches!(status, RunStatus::Completed | RunStatus::Failed)
            .then(|| Utc::now().to_rfc3339());
        let rows = conn
            .execute(
                "UPDATE runs SET status = ?1, completed_steps = ?2, denied_steps = ?3, failed_steps = ?4,
                    completed_at = COALESCE(?5, completed_at)
                 WHERE run_id = ?6",
                params![status_str(status), completed, denied, failed, completed_at, run_id],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::Write(format!("run not found: {run_id}")));
        }
        tracing::debug!(run_id, ?status, "run status updated");
        Ok(())
    }

    /// Writes a call row. No validation that the run exists — the
    /// foreign-key constraint catches that per spec §4.2.
    pub async fn record_call(
        &self,
        run_id: &str,
        step_index: u64,
        tool_name: &str,
        args: Value,
    ) -> StoreResult<String> {
        let call = Call::new(run_id, step_index, tool_name, args);
        let call_id = call.call_id.clone();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tool_calls (call_id, run_id, step_index, tool_name, args_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                call.call_id,
                call.run_id,
                call.step_index,
                call.tool_name,
                serde_json::to_string(&call.args).map_err(StoreError::from)?,
                call.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(call_id)
    }

    /// Computes `input_hash = hash(input_data)` and
    /// `output_hash = hash(output)`. Exactly one result row per
    /// `call_id` — the primary key enforces this.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_result(
        &self,
        call_id: &str,
        run_id: &str,
        status: CallStatus,
        output: Option<Value>,
        error: Option<String>,
        decision: PolicyDecision,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        input_data: &Value,
    ) -> StoreResult<CallResult> {
        let input_hash = hash_value(input_data);
        let output_hash = output.as_ref().map(hash_value).unwrap_or_else(|| hash_value(&Value::Null));
        let decision_json = serde_json::to_string(&decision).map_err(StoreError::from)?;
        let output_json = match &output {
            Some(v) => Some(serde_json::to_string(v).map_err(StoreError::from)?),
            None => None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tool_results
                (call_id, run_id, status, output_json, error, policy_decision_json,
                 started_at, ended_at, input_hash, output_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                call_id,
                run_id,
                call_status_str(status),
                output_json,
                error,
                decision_json,
                started_at.to_rfc3339(),
                ended_at.to_rfc3339(),
                input_hash,
                output_hash,
            ],
        )
        .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(CallResult {
            call_id: call_id.to_string(),
            run_id: run_id.to_string(),
            status,
            output,
            error,
            decision,
            started_at,
            ended_at,
            input_hash,
            output_hash,
        })
    }

    pub async fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM runs WHERE run_id = ?1", params![run_id], row_to_run)
            .optional()
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    pub async fn get_run_plan(&self, run_id: &str) -> StoreResult<Option<Plan>> {
        Ok(self.get_run(run_id).await?.map(|r| r.plan))
    }

    pub async fn get_run_policy(&self, run_id: &str) -> StoreResult<Option<Policy>> {
        Ok(self.get_run(run_id).await?.map(|r| r.policy))
    }

    pub async fn get_calls_for_run(&self, run_id: &str) -> StoreResult<Vec<Call>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM tool_calls WHERE run_id = ?1 ORDER BY step_index ASC")
            .map_err(|e| StoreError::Read(e.to_string()))?;
        let rows = stmt
            .query_map(params![run_id], row_to_call)
            .map_err(|e| StoreError::Read(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    pub async fn get_results_for_run(&self, run_id: &str) -> StoreResult<Vec<CallResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT tr.* FROM tool_results tr
                 JOIN tool_calls tc ON tc.call_id = tr.call_id
                 WHERE tr.run_id = ?1 ORDER BY tc.step_index ASC",
            )
            .map_err(|e| StoreError::Read(e.to_string()))?;
        let rows = stmt
            .query_map(params![run_id], row_to_result)
            .map_err(|e| StoreError::Read(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    pub async fn get_result_for_call(&self, call_id: &str) -> StoreResult<Option<CallResult>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM tool_results WHERE call_id = ?1",
            params![call_id],
            row_to_result,
        )
        .optional()
        .map_err(|e| StoreError::Read(e.to_string()))
    }

    /// Most recent first.
    pub async fn list_runs(&self, limit: u64) -> StoreResult<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM runs ORDER BY created_at DESC LIMIT ?1")
            .map_err(|e| StoreError::Read(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit], row_to_run)
            .map_err(|e| StoreError::Read(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Read(e.to_string()))
    }

    pub async fn get_run_summary(&self, run_id: &str) -> StoreResult<Option<RunSummary>> {
        Ok(self.get_run(run_id).await?.map(|r| RunSummary {
            run_id: r.run_id,
            total_steps: r.total_steps,
            completed_steps: r.completed_steps,
            denied_steps: r.denied_steps,
            failed_steps: r.failed_steps,
            status: Some(r.status),
        }))
    }

    /// A batched-write scope: the closure runs inside a SQLite
    /// transaction that commits on `Ok` and rolls back on `Err`.
    pub async fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            let tx = guard
                .unchecked_transaction()
                .map_err(|e| StoreError::Write(e.to_string()))?;
            let result = f(&tx);
            match result {
                Ok(value) => {
                    tx.commit().map_err(|e| StoreError::Write(e.to_string()))?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = tx.rollback();
                    Err(err)
                }
            }
        })
        .await
        .map_err(|e| StoreError::Write(format!("transaction task panicked: {e}")))?
    }
}

fn conn_guard_blocking(conn: &Arc<Mutex<Connection>>) -> StoreResult<tokio::sync::MutexGuard<'_, Connection>> {
    Ok(conn.blocking_lock())
}

fn insert_run(conn: &Connection, run: &Run) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO runs (run_id, created_at, completed_at, plan_hash, policy_hash,
            plan_json, policy_json, mode, status, total_steps, completed_steps, denied_steps, failed_steps)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            run.run_id,
            run.created_at.to_rfc3339(),
            run.completed_at.map(|t| t.to_rfc3339()),
            run.plan_hash,
            run.policy_hash,
            serde_json::to_string(&run.plan).map_err(StoreError::from)?,
            serde_json::to_string(&run.policy).map_err(StoreError::from)?,
            mode_str(run.mode),
            status_str(run.status),
            run.total_steps,
            run.completed_steps,
            run.denied_steps,
            run.failed_steps,
        ],
    )
    .map_err(|e| StoreError::Write(e.to_string()))?;
    Ok(())
}

fn mode_str(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Run => "run",
        RunMode::Replay => "replay",
    }
}

fn parse_mode(s: &str) -> rusqlite::Result<RunMode> {
    match s {
        "run" => Ok(RunMode::Run),
        "replay" => Ok(RunMode::Replay),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown run mode: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> rusqlite::Result<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown run status: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn call_status_str(status: CallStatus) -> &'static str {
    match status {
        CallStatus::Success => "success",
        CallStatus::Denied => "denied",
        CallStatus::Error => "error",
    }
}

fn parse_call_status(s: &str) -> rusqlite::Result<CallStatus> {
    match s {
        "success" => Ok(CallStatus::Success),
        "denied" => Ok(CallStatus::Denied),
        "error" => Ok(CallStatus::Error),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown call status: {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let plan_json: String = row.get("plan_json")?;
    let policy_json: String = row.get("policy_json")?;
    let created_at: String = row.get("created_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    Ok(Run {
        run_id: row.get("run_id")?,
        created_at: parse_rfc3339(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_rfc3339).transpose()?,
        plan_hash: row.get("plan_hash")?,
        policy_hash: row.get("policy_hash")?,
        plan: serde_json::from_str(&plan_json).map_err(json_err)?,
        policy: serde_json::from_str(&policy_json).map_err(json_err)?,
        mode: parse_mode(&mode)?,
        status: parse_status(&status)?,
        total_steps: row.get("total_steps")?,
        completed_steps: row.get("completed_steps")?,
        denied_steps: row.get("denied_steps")?,
        failed_steps: row.get("failed_steps")?,
    })
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    let args_json: String = row.get("args_json")?;
    let created_at: String = row.get("created_at")?;
    Ok(Call {
        call_id: row.get("call_id")?,
        run_id: row.get("run_id")?,
        step_index: row.get("step_index")?,
        tool_name: row.get("tool_name")?,
        args: serde_json::from_str(&args_json).map_err(json_err)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallResult> {
    let status: String = row.get("status")?;
    let output_json: Option<String> = row.get("output_json")?;
    let decision_json: String = row.get("policy_decision_json")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: String = row.get("ended_at")?;
    Ok(CallResult {
        call_id: row.get("call_id")?,
        run_id: row.get("run_id")?,
        status: parse_call_status(&status)?,
        output: output_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(json_err)?,
        error: row.get("error")?,
        decision: serde_json::from_str(&decision_json).map_err(json_err)?,
        started_at: parse_rfc3339(&started_at)?,
        ended_at: parse_rfc3339(&ended_at)?,
        input_hash: row.get("input_hash")?,
        output_hash: row.get("output_hash")?,
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::Step;
    use serde_json::json;

    fn sample_plan() -> Plan {
        Plan::new(vec![Step {
            tool: "fs.read".into(),
            args: json!({"path": "/w/a.txt"}),
        }])
    }

    #[tokio::test]
    async fn create_and_fetch_run_round_trips_plan_and_policy() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let run_id = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.total_steps, 1);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.plan.steps[0].tool, "fs.read");
    }

    #[tokio::test]
    async fn update_run_status_overwrites_counters_and_sets_completed_at() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let run_id = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        store
            .update_run_status(&run_id, RunStatus::Completed, 1, 0, 0)
            .await
            .unwrap();
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_steps, 1);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn record_call_and_result_round_trip_with_hashes() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let run_id = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        let args = json!({"path": "/w/a.txt"});
        let call_id = store.record_call(&run_id, 0, "fs.read", args.clone()).await.unwrap();
        let now = Utc::now();
        let result = store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Success,
                Some(json!("hello")),
                None,
                PolicyDecision::allow("allow_paths[/w/**]"),
                now,
                now,
                &args,
            )
            .await
            .unwrap();
        assert_eq!(result.input_hash, hash_value(&args));
        let fetched = store.get_result_for_call(&call_id).await.unwrap().unwrap();
        assert_eq!(fetched.output, Some(json!("hello")));
    }

    #[tokio::test]
    async fn calls_for_run_are_ordered_by_step_index() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let run_id = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        store.record_call(&run_id, 2, "fs.read", json!({})).await.unwrap();
        store.record_call(&run_id, 0, "fs.read", json!({})).await.unwrap();
        store.record_call(&run_id, 1, "fs.read", json!({})).await.unwrap();
        let calls = store.get_calls_for_run(&run_id).await.unwrap();
        let indices: Vec<u64> = calls.iter().map(|c| c.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn list_runs_returns_most_recent_first() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let first = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .create_run(sample_plan(), Policy::default(), RunMode::Run)
            .await
            .unwrap();
        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs[0].run_id, second);
        assert_eq!(runs[1].run_id, first);
    }
}
