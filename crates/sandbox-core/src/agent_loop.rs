//! The Agent Loop: dynamic execution driven by a `Proposer`. Unlike
//! `execution::run`, which replays a fixed plan, this drives the
//! propose -> evaluate -> execute -> record cycle one proposal at a
//! time, bounding it with history truncation, repetition detection,
//! and timeouts. See spec §4.6.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sandbox_store::AuditStore;
use sandbox_tools::{ToolContext, ToolOutput, ToolRegistry};
use sandbox_types::{CallStatus, DoneReason, Plan, Policy, Proposal, RunMode, RunStatus};

use crate::policy::PolicyEngine;
use crate::proposer::{HistoryItem, Proposer, ProposerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    Completed,
    MaxIterations,
    Timeout,
    RepetitionDetected,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentLoopConfig {
    pub max_iterations: u32,
    pub iteration_timeout_seconds: u64,
    pub total_timeout_seconds: u64,
    pub repetition_threshold: u32,
    pub max_history_items: usize,
    pub max_history_chars: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            iteration_timeout_seconds: 60,
            total_timeout_seconds: 300,
            repetition_threshold: 3,
            max_history_items: 10,
            max_history_chars: 8000,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentResult {
    pub run_id: String,
    pub termination: TerminationStatus,
    pub iterations: u32,
    pub final_output: Option<serde_json::Value>,
    pub completed_steps: u64,
    pub denied_steps: u64,
    pub failed_steps: u64,
}

pub async fn run(
    store: &AuditStore,
    registry: &ToolRegistry,
    proposer: &dyn Proposer,
    task: String,
    policy: Policy,
    working_dir: PathBuf,
    config: AgentLoopConfig,
) -> anyhow::Result<AgentResult> {
    let engine = PolicyEngine::new(policy.clone());
    let run_id = store
        .create_run(Plan::new(Vec::new()), policy.clone(), RunMode::Run)
        .await?;
    let context = ToolContext {
        run_id: run_id.clone(),
        policy: Arc::new(policy),
        working_dir,
    };
    let tool_schemas = registry.schemas();
    let policy_summary = engine.summarize();

    let mut history: Vec<HistoryItem> = Vec::new();
    let mut completed_steps = 0u64;
    let mut denied_steps = 0u64;
    let mut failed_steps = 0u64;
    let mut final_output = None;

    let total_deadline = Duration::from_secs(config.total_timeout_seconds);
    let started = Instant::now();

    let termination = 'outer: loop {
        let iteration = history.len() as u32;

        if started.elapsed() >= total_deadline {
            break TerminationStatus::Timeout;
        }
        if iteration >= config.max_iterations {
            break TerminationStatus::MaxIterations;
        }

        let state = ProposerState {
            task: task.clone(),
            tool_schemas: tool_schemas.clone(),
            policy_summary: policy_summary.clone(),
            history: history.clone(),
            iteration,
        };

        let iteration_timeout = Duration::from_secs(config.iteration_timeout_seconds);
        let proposal = match tokio::time::timeout(iteration_timeout, proposer.propose_next(&state)).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => break TerminationStatus::Error,
            Err(_) => break TerminationStatus::Timeout,
        };

        let (tool_name, args) = match proposal {
            Proposal::Done { final_output: output, .. } => {
                proposer.finalize(&state).await;
                final_output = output;
                break 'outer TerminationStatus::Completed;
            }
            Proposal::ToolCall { tool_name, args } => (tool_name, args),
        };

        if trailing_repeat_count(&history, &tool_name, &args) + 1 >= config.repetition_threshold {
            break TerminationStatus::RepetitionDetected;
        }

        let step_index = history.len() as u64;
        let call_id = store
            .record_call(&run_id, step_index, &tool_name, args.clone())
            .await?;
        let call_started = Utc::now();
        let decision = engine.evaluate(&tool_name, &args, &context.working_dir);

        let outcome_summary;
        if !decision.allowed {
            denied_steps += 1;
            outcome_summary = format!("denied: {}", decision.reason);
            store
                .record_result(
                    &call_id,
                    &run_id,
                    CallStatus::Denied,
                    None,
                    Some(decision.reason.clone()),
                    decision,
                    call_started,
                    Utc::now(),
                    &args,
                )
                .await?;
        } else {
            match registry.execute(&tool_name, args.clone(), &context).await {
                Ok(ToolOutput::Success { data, .. }) => {
                    completed_steps += 1;
                    outcome_summary = summarize(&data);
                    store
                        .record_result(
                            &call_id,
                            &run_id,
                            CallStatus::Success,
                            Some(data),
                            None,
                            decision,
                            call_started,
                            Utc::now(),
                            &args,
                        )
                        .await?;
                }
                Ok(ToolOutput::Failure { error, metadata }) => {
                    failed_steps += 1;
                    outcome_summary = format!("error: {error}");
                    store
                        .record_result(
                            &call_id,
                            &run_id,
                            CallStatus::Error,
                            Some(metadata),
                            Some(error),
                            decision,
                            call_started,
                            Utc::now(),
                            &args,
                        )
                        .await?;
                }
                Err(err) => {
                    failed_steps += 1;
                    outcome_summary = format!("error: {err}");
                    store
                        .record_result(
                            &call_id,
                            &run_id,
                            CallStatus::Error,
                            None,
                            Some(err.to_string()),
                            decision,
                            call_started,
                            Utc::now(),
                            &args,
                        )
                        .await?;
                }
            }
        }

        history.push(HistoryItem {
            tool_name,
            args,
            outcome_summary,
        });
        truncate_history(&mut history, config.max_history_items, config.max_history_chars);
    };

    let stored_status = match termination {
        TerminationStatus::Completed => RunStatus::Completed,
        TerminationStatus::Error => RunStatus::Failed,
        TerminationStatus::MaxIterations | TerminationStatus::Timeout | TerminationStatus::RepetitionDetected => {
            RunStatus::Completed
        }
    };
    store
        .update_run_status(&run_id, stored_status, completed_steps, denied_steps, failed_steps)
        .await?;
    tracing::info!(run_id = %run_id, ?termination, iterations = history.len(), "agent loop finished");

    Ok(AgentResult {
        run_id,
        termination,
        iterations: history.len() as u32,
        final_output,
        completed_steps,
        denied_steps,
        failed_steps,
    })
}

fn trailing_repeat_count(history: &[HistoryItem], tool_name: &str, args: &serde_json::Value) -> u32 {
    let mut count = 0u32;
    for item in history.iter().rev() {
        if item.tool_name == tool_name && &item.args == args {
            count += 1;
        } else {
            break;
        }
    }
    count
}

fn truncate_history(history: &mut Vec<HistoryItem>, max_items: usize, max_chars: usize) {
    if history.len() > max_items {
        let drop = history.len() - max_items;
        history.drain(0..drop);
    }
    loop {
        let total: usize = history
            .iter()
            .map(|item| serde_json::to_string(item).map(|s| s.len()).unwrap_or(0))
            .sum();
        if total <= max_chars || history.is_empty() {
            break;
        }
        history.remove(0);
    }
}

fn summarize(data: &serde_json::Value) -> String {
    let rendered = data.to_string();
    if rendered.len() > 200 {
        format!("{}...", &rendered[..200])
    } else {
        rendered
    }
}
