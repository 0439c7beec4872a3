//! The Execution Engine: drives one `Plan` through the Policy Engine
//! and the tool registry, recording every call/result pair to the
//! audit store as it goes. See spec §4.5.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sandbox_store::AuditStore;
use sandbox_tools::{ToolContext, ToolOutput, ToolRegistry};
use sandbox_types::{CallStatus, Plan, Policy, PolicyDecision, Run, RunMode, RunStatus};

use crate::policy::PolicyEngine;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StepOutcome {
    pub step_index: u64,
    pub tool_name: String,
    pub call_id: String,
    pub status: CallStatus,
    pub decision: PolicyDecision,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepOutcome>,
}

/// Executes `plan` under `policy`, against `registry`, inside
/// `working_dir`, recording the run to `store`. Stops at the first
/// denial or tool failure when `fail_fast` is set — per spec §4.5 the
/// default execution mode is fail-fast; a caller wanting best-effort
/// execution of every step regardless of earlier failures passes
/// `false`.
pub async fn run(
    store: &AuditStore,
    registry: &ToolRegistry,
    plan: Plan,
    policy: Policy,
    working_dir: PathBuf,
    fail_fast: bool,
) -> anyhow::Result<RunResult> {
    let engine = PolicyEngine::new(policy.clone());
    let run_id = store
        .create_run(plan.clone(), policy.clone(), RunMode::Run)
        .await?;

    let context = ToolContext {
        run_id: run_id.clone(),
        policy: Arc::new(policy.clone()),
        working_dir,
    };

    let deadline = Duration::from_secs(policy.global_timeout_seconds);
    let started = Instant::now();

    let mut outcomes = Vec::with_capacity(plan.steps.len());
    let mut completed = 0u64;
    let mut denied = 0u64;
    let mut failed = 0u64;
    let mut timed_out = false;

    for (index, step) in plan.steps.iter().enumerate() {
        if started.elapsed() >= deadline {
            timed_out = true;
            let step_index = index as u64;
            let decision = PolicyDecision::deny("global_timeout_seconds");
            let call_id = store
                .record_call(&run_id, step_index, &step.tool, step.args.clone())
                .await?;
            let call_started = Utc::now();
            store
                .record_result(
                    &call_id,
                    &run_id,
                    CallStatus::Error,
                    None,
                    Some("global timeout exceeded".to_string()),
                    decision.clone(),
                    call_started,
                    Utc::now(),
                    &step.args,
                )
                .await?;
            failed += 1;
            outcomes.push(StepOutcome {
                step_index,
                tool_name: step.tool.clone(),
                call_id,
                status: CallStatus::Error,
                decision,
                output: None,
                error: Some("global timeout exceeded".to_string()),
            });
            break;
        }

        let step_index = index as u64;
        let call_id = store
            .record_call(&run_id, step_index, &step.tool, step.args.clone())
            .await?;
        let call_started = Utc::now();

        let decision = engine.evaluate(&step.tool, &step.args, &context.working_dir);
        if !decision.allowed {
            denied += 1;
            let call_ended = Utc::now();
            store
                .record_result(
                    &call_id,
                    &run_id,
                    CallStatus::Denied,
                    None,
                    Some(decision.reason.clone()),
                    decision.clone(),
                    call_started,
                    call_ended,
                    &step.args,
                )
                .await?;
            outcomes.push(StepOutcome {
                step_index,
                tool_name: step.tool.clone(),
                call_id,
                status: CallStatus::Denied,
                decision,
                output: None,
                error: Some("denied by policy".to_string()),
            });
            if fail_fast {
                break;
            }
            continue;
        }

        let outcome = match registry.execute(&step.tool, step.args.clone(), &context).await {
            Ok(ToolOutput::Success { data, .. }) => {
                completed += 1;
                let call_ended = Utc::now();
                store
                    .record_result(
                        &call_id,
                        &run_id,
                        CallStatus::Success,
                        Some(data.clone()),
                        None,
                        decision.clone(),
                        call_started,
                        call_ended,
                        &step.args,
                    )
                    .await?;
                StepOutcome {
                    step_index,
                    tool_name: step.tool.clone(),
                    call_id,
                    status: CallStatus::Success,
                    decision,
                    output: Some(data),
                    error: None,
                }
            }
            Ok(ToolOutput::Failure { error, metadata }) => {
                failed += 1;
                let call_ended = Utc::now();
                store
                    .record_result(
                        &call_id,
                        &run_id,
                        CallStatus::Error,
                        Some(metadata.clone()),
                        Some(error.clone()),
                        decision.clone(),
                        call_started,
                        call_ended,
                        &step.args,
                    )
                    .await?;
                StepOutcome {
                    step_index,
                    tool_name: step.tool.clone(),
                    call_id,
                    status: CallStatus::Error,
                    decision,
                    output: Some(metadata),
                    error: Some(error),
                }
            }
            Err(err) => {
                failed += 1;
                let call_ended = Utc::now();
                store
                    .record_result(
                        &call_id,
                        &run_id,
                        CallStatus::Error,
                        None,
                        Some(err.to_string()),
                        decision.clone(),
                        call_started,
                        call_ended,
                        &step.args,
                    )
                    .await?;
                StepOutcome {
                    step_index,
                    tool_name: step.tool.clone(),
                    call_id,
                    status: CallStatus::Error,
                    decision,
                    output: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let is_error = outcome.status == CallStatus::Error;
        outcomes.push(outcome);
        if is_error && fail_fast {
            break;
        }
    }

    let final_status = if failed > 0 || timed_out {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    store
        .update_run_status(&run_id, final_status, completed, denied, failed)
        .await?;
    tracing::info!(run_id = %run_id, ?final_status, completed, denied, failed, "plan run finished");

    Ok(RunResult {
        run_id,
        status: final_status,
        steps: outcomes,
    })
}

/// Loads a previously-recorded `Run` by id, mainly for callers that
/// want to inspect a run's plan/policy without re-running it.
pub async fn load_run(store: &AuditStore, run_id: &str) -> anyhow::Result<Option<Run>> {
    Ok(store.get_run(run_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::Step;
    use serde_json::json;

    async fn store_and_registry() -> (AuditStore, ToolRegistry) {
        (
            AuditStore::open_in_memory().await.unwrap(),
            sandbox_tools::default_registry(),
        )
    }

    #[tokio::test]
    async fn successful_plan_marks_run_completed() {
        let (store, registry) = store_and_registry().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut policy = Policy::default();
        policy.fs_read.allow_paths = vec![format!("{}/**", dir.path().display())];

        let plan = Plan::new(vec![Step {
            tool: "fs.read".to_string(),
            args: json!({"path": "a.txt"}),
        }]);

        let result = run(&store, &registry, plan, policy, dir.path().to_path_buf(), true)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, CallStatus::Success);
    }

    #[tokio::test]
    async fn denied_step_stops_fail_fast_execution() {
        let (store, registry) = store_and_registry().await;
        let dir = tempfile::tempdir().unwrap();

        let policy = Policy::default(); // no allow_paths => everything denied
        let plan = Plan::new(vec![
            Step {
                tool: "fs.read".to_string(),
                args: json!({"path": "a.txt"}),
            },
            Step {
                tool: "fs.read".to_string(),
                args: json!({"path": "b.txt"}),
            },
        ]);

        let result = run(&store, &registry, plan, policy, dir.path().to_path_buf(), true)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, CallStatus::Denied);
    }

    #[tokio::test]
    async fn global_timeout_records_synthetic_error_step() {
        let (store, registry) = store_and_registry().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut policy = Policy::default();
        policy.global_timeout_seconds = 0;
        policy.fs_read.allow_paths = vec![format!("{}/**", dir.path().display())];

        let plan = Plan::new(vec![Step {
            tool: "fs.read".to_string(),
            args: json!({"path": "a.txt"}),
        }]);

        let result = run(&store, &registry, plan, policy, dir.path().to_path_buf(), true)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].status, CallStatus::Error);
        assert_eq!(result.steps[0].decision.reason, "global_timeout_seconds");

        let calls = store.get_calls_for_run(&result.run_id).await.unwrap();
        let results = store.get_results_for_run(&result.run_id).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn non_fail_fast_continues_after_denial() {
        let (store, registry) = store_and_registry().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut policy = Policy::default();
        policy.fs_read.allow_paths = vec![format!("{}/a.txt", dir.path().display())];

        let plan = Plan::new(vec![
            Step {
                tool: "fs.read".to_string(),
                args: json!({"path": "missing-from-allow.txt"}),
            },
            Step {
                tool: "fs.read".to_string(),
                args: json!({"path": "a.txt"}),
            },
        ]);

        let result = run(&store, &registry, plan, policy, dir.path().to_path_buf(), false)
            .await
            .unwrap();
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].status, CallStatus::Denied);
        assert_eq!(result.steps[1].status, CallStatus::Success);
    }
}
