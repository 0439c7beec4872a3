//! Core data model: Policy, Plan, Proposal, Run, Call, Result,
//! PolicyDecision. See spec §3 for the authoritative invariants; this
//! module only carries the shapes, not the adjudication or persistence
//! logic (those live in `sandbox-core` and `sandbox-store`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::{canonical_json, hash_value, new_id};

// ---------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsPolicy {
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub allow_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpPolicy {
    #[serde(default)]
    pub allow_domains: Vec<String>,
    #[serde(default = "default_true")]
    pub deny_private_ips: bool,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShellPolicy {
    #[serde(default)]
    pub allow_executables: Vec<String>,
    #[serde(default = "default_deny_tokens")]
    pub deny_tokens: Vec<String>,
    #[serde(default = "default_shell_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_response_bytes() -> u64 {
    1_048_576
}
fn default_http_timeout_seconds() -> u64 {
    30
}
fn default_shell_timeout_seconds() -> u64 {
    30
}
fn default_max_output_bytes() -> u64 {
    262_144
}
fn default_deny_tokens() -> Vec<String> {
    vec![
        "sudo".into(),
        "rm".into(),
        "curl".into(),
        "wget".into(),
        "chmod".into(),
        "chown".into(),
    ]
}

impl Default for FsPolicy {
    fn default() -> Self {
        Self {
            allow_paths: Vec::new(),
            deny_paths: Vec::new(),
            max_size_bytes: 0,
            allow_hidden: false,
        }
    }
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            allow_domains: Vec::new(),
            deny_private_ips: true,
            max_response_bytes: default_max_response_bytes(),
            timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self {
            allow_executables: Vec::new(),
            deny_tokens: default_deny_tokens(),
            timeout_seconds: default_shell_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    #[serde(default = "default_global_timeout_seconds")]
    pub global_timeout_seconds: u64,
    #[serde(default = "default_max_calls_per_tool")]
    pub max_calls_per_tool: u64,
    #[serde(rename = "fs.read", default)]
    pub fs_read: FsPolicy,
    #[serde(rename = "fs.write", default)]
    pub fs_write: FsPolicy,
    #[serde(rename = "http.get", default)]
    pub http_get: HttpPolicy,
    #[serde(rename = "shell.run", default)]
    pub shell_run: ShellPolicy,
}

fn default_global_timeout_seconds() -> u64 {
    300
}
fn default_max_calls_per_tool() -> u64 {
    50
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            global_timeout_seconds: default_global_timeout_seconds(),
            max_calls_per_tool: default_max_calls_per_tool(),
            fs_read: FsPolicy::default(),
            fs_write: FsPolicy::default(),
            http_get: HttpPolicy::default(),
            shell_run: ShellPolicy::default(),
        }
    }
}

impl Policy {
    /// The SHA-256 of this policy's canonical JSON. Two policies with
    /// semantically identical content always hash identically.
    pub fn content_hash(&self) -> String {
        hash_value(&serde_json::to_value(self).unwrap_or(Value::Null))
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

// ---------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Plan {
    #[serde(default = "default_plan_version")]
    pub version: String,
    pub steps: Vec<Step>,
}

fn default_plan_version() -> String {
    "1".to_string()
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            version: default_plan_version(),
            steps,
        }
    }

    pub fn content_hash(&self) -> String {
        hash_value(&serde_json::to_value(self).unwrap_or(Value::Null))
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

// ---------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    TaskComplete,
    CannotProceed,
    MaxIterations,
    UserCancel,
    PolicyBlocked,
    Timeout,
    RepetitionDetected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Proposal {
    ToolCall { tool_name: String, args: Value },
    Done {
        reason: DoneReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_output: Option<Value>,
    },
}

// ---------------------------------------------------------------------
// Run / Call / Result / PolicyDecision
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Replay,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub plan_hash: String,
    pub policy_hash: String,
    pub plan: Plan,
    pub policy: Policy,
    pub mode: RunMode,
    pub status: RunStatus,
    pub total_steps: u64,
    pub completed_steps: u64,
    pub denied_steps: u64,
    pub failed_steps: u64,
}

impl Run {
    pub fn new(plan: Plan, policy: Policy, mode: RunMode) -> Self {
        let plan_hash = plan.content_hash();
        let policy_hash = policy.content_hash();
        let total_steps = plan.steps.len() as u64;
        Self {
            run_id: new_id(),
            created_at: Utc::now(),
            completed_at: None,
            plan_hash,
            policy_hash,
            plan,
            policy,
            mode,
            status: RunStatus::Running,
            total_steps,
            completed_steps: 0,
            denied_steps: 0,
            failed_steps: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub call_id: String,
    pub run_id: String,
    pub step_index: u64,
    pub tool_name: String,
    pub args: Value,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn new(run_id: impl Into<String>, step_index: u64, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: new_id(),
            run_id: run_id.into(),
            step_index,
            tool_name: tool_name.into(),
            args,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_matched: Option<String>,
}

impl PolicyDecision {
    pub fn allow(rule_matched: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: "allowed".to_string(),
            rule_matched: Some(rule_matched.into()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            allowed: false,
            rule_matched: Some(reason.clone()),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResult {
    pub call_id: String,
    pub run_id: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub decision: PolicyDecision,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub input_hash: String,
    pub output_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub total_steps: u64,
    pub completed_steps: u64,
    pub denied_steps: u64,
    pub failed_steps: u64,
    pub status: Option<RunStatus>,
}
