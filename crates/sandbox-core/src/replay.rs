//! The Replay Engine: bit-exact reconstruction of a past run without
//! re-invoking any tool, plus integrity verification over stored
//! hashes. See spec §4.7. Replay never touches the filesystem or
//! network — every byte returned comes from the audit store.

use sandbox_store::AuditStore;
use sandbox_types::{hash_value, CallStatus, Plan, Policy, RunMode, RunStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayMismatch {
    pub kind: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub original_run_id: String,
    pub replay_run_id: String,
    pub status: RunStatus,
    pub mismatches: Vec<ReplayMismatch>,
}

pub async fn replay(
    store: &AuditStore,
    run_id: &str,
    verify_plan: bool,
    plan: Option<Plan>,
    policy: Option<Policy>,
) -> anyhow::Result<ReplayResult> {
    let original = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!(sandbox_types::ReplayError::RunNotFound(run_id.to_string())))?;

    let mut mismatches = Vec::new();
    if let (Some(supplied), true) = (plan.as_ref(), verify_plan) {
        let supplied_hash = supplied.content_hash();
        if supplied_hash != original.plan_hash {
            mismatches.push(ReplayMismatch {
                kind: "plan_hash".to_string(),
                expected: original.plan_hash.clone(),
                actual: supplied_hash,
            });
        }
    }

    let replay_plan = plan.unwrap_or_else(|| original.plan.clone());
    let replay_policy = policy.unwrap_or_else(|| original.policy.clone());
    let replay_run_id = store
        .create_run(replay_plan, replay_policy, RunMode::Replay)
        .await?;

    let original_calls = store.get_calls_for_run(run_id).await?;
    let mut completed = 0u64;
    let mut denied = 0u64;
    let mut failed = 0u64;

    for call in &original_calls {
        let Some(result) = store.get_result_for_call(&call.call_id).await? else {
            mismatches.push(ReplayMismatch {
                kind: "missing_result".to_string(),
                expected: call.call_id.clone(),
                actual: "<none>".to_string(),
            });
            continue;
        };

        let recomputed_input_hash = hash_value(&call.args);
        if recomputed_input_hash != result.input_hash {
            mismatches.push(ReplayMismatch {
                kind: "input_hash".to_string(),
                expected: result.input_hash.clone(),
                actual: recomputed_input_hash,
            });
        }

        let new_call_id = store
            .record_call(&replay_run_id, call.step_index, &call.tool_name, call.args.clone())
            .await?;
        store
            .record_result(
                &new_call_id,
                &replay_run_id,
                result.status,
                result.output.clone(),
                result.error.clone(),
                result.decision.clone(),
                result.started_at,
                result.ended_at,
                &call.args,
            )
            .await?;

        match result.status {
            CallStatus::Success => completed += 1,
            CallStatus::Denied => denied += 1,
            CallStatus::Error => failed += 1,
        }
    }

    let status = if !mismatches.is_empty() || denied > 0 || failed > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    store
        .update_run_status(&replay_run_id, status, completed, denied, failed)
        .await?;
    tracing::info!(
        original_run_id = run_id,
        replay_run_id = %replay_run_id,
        mismatches = mismatches.len(),
        "replay finished"
    );

    Ok(ReplayResult {
        original_run_id: run_id.to_string(),
        replay_run_id,
        status,
        mismatches,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VerifyStats {
    pub total_calls: u64,
    pub total_results: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VerifyResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub stats: VerifyStats,
}

/// Recomputes every stored hash and checks step-index sequencing.
/// Never raises — any anomaly becomes an entry in `errors`.
pub async fn verify_run(store: &AuditStore, run_id: &str) -> anyhow::Result<VerifyResult> {
    let calls = store.get_calls_for_run(run_id).await?;
    let results = store.get_results_for_run(run_id).await?;

    let mut errors = Vec::new();

    if calls.len() != results.len() {
        errors.push(format!(
            "call/result count mismatch: {} calls, {} results",
            calls.len(),
            results.len()
        ));
    }

    for (index, call) in calls.iter().enumerate() {
        if call.step_index != index as u64 {
            errors.push(format!(
                "non-sequential step_index at position {index}: found {}",
                call.step_index
            ));
        }
    }

    for call in &calls {
        let Some(result) = results.iter().find(|r| r.call_id == call.call_id) else {
            errors.push(format!("no result for call {}", call.call_id));
            continue;
        };
        let expected_input_hash = hash_value(&call.args);
        if expected_input_hash != result.input_hash {
            errors.push(format!(
                "input hash mismatch for call {}: expected {}, got {}",
                call.call_id, expected_input_hash, result.input_hash
            ));
        }
        let expected_output_hash = result
            .output
            .as_ref()
            .map(hash_value)
            .unwrap_or_else(|| hash_value(&serde_json::Value::Null));
        if expected_output_hash != result.output_hash {
            errors.push(format!(
                "output hash mismatch for call {}: expected {}, got {}",
                call.call_id, expected_output_hash, result.output_hash
            ));
        }
    }

    Ok(VerifyResult {
        valid: errors.is_empty(),
        stats: VerifyStats {
            total_calls: calls.len() as u64,
            total_results: results.len() as u64,
        },
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_tools::default_registry;
    use sandbox_types::Step;
    use serde_json::json;

    // S7 — Replay fidelity.
    #[tokio::test]
    async fn s7_replay_returns_stored_output_not_current_filesystem_state() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let registry = default_registry();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut policy = Policy::default();
        policy.fs_read.allow_paths = vec![format!("{}/**", dir.path().display())];
        let plan = Plan::new(vec![Step {
            tool: "fs.read".to_string(),
            args: json!({"path": "a.txt"}),
        }]);

        let run_result = crate::execution::run(&store, &registry, plan, policy, dir.path().to_path_buf(), true)
            .await
            .unwrap();

        std::fs::write(dir.path().join("a.txt"), "world").unwrap();

        let replayed = replay(&store, &run_result.run_id, false, None, None).await.unwrap();
        assert_eq!(replayed.status, RunStatus::Completed);
        assert!(replayed.mismatches.is_empty());

        let results = store.get_results_for_run(&replayed.replay_run_id).await.unwrap();
        assert_eq!(results[0].output.as_ref().unwrap()["content"], "hello");
    }

    // S8 — Hash tamper detected.
    #[tokio::test]
    async fn s8_tampered_output_fails_verification() {
        let store = AuditStore::open_in_memory().await.unwrap();
        let registry = default_registry();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut policy = Policy::default();
        policy.fs_read.allow_paths = vec![format!("{}/**", dir.path().display())];
        let plan = Plan::new(vec![Step {
            tool: "fs.read".to_string(),
            args: json!({"path": "a.txt"}),
        }]);
        let run_result = crate::execution::run(&store, &registry, plan, policy, dir.path().to_path_buf(), true)
            .await
            .unwrap();

        let before = verify_run(&store, &run_result.run_id).await.unwrap();
        assert!(before.valid);

        let calls = store.get_calls_for_run(&run_result.run_id).await.unwrap();
        let call_id = calls[0].call_id.clone();
        store
            .transaction(move |tx| {
                tx.execute(
                    "UPDATE tool_results SET output_hash = 'tampered' WHERE call_id = ?1",
                    rusqlite::params![call_id],
                )
                .map_err(|e| sandbox_store::StoreError::Write(e.to_string()))?;
                Ok(())
            })
            .await
            .unwrap();

        let after = verify_run(&store, &run_result.run_id).await.unwrap();
        assert!(!after.valid);
        assert!(after.errors.iter().any(|e| e.contains("output hash mismatch")));
    }
}
