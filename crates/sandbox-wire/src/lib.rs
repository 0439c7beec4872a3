//! Logical wire-format shapes from spec §6, kept distinct from the
//! in-memory domain types in `sandbox_types` the way the teacher keeps
//! `tandem-wire`'s API-facing structs distinct from `tandem-types`'s
//! domain structs. A manifest/YAML front end (out of scope here) is
//! expected to deserialize one of these and hand it to the
//! `TryFrom` conversion below to get a `sandbox_types::Policy`/`Plan`.

use sandbox_types::{FsPolicy, HttpPolicy, Plan as DomainPlan, Policy as DomainPolicy, ShellPolicy, Step as DomainStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FsPolicyDocument {
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: u64,
    #[serde(default)]
    pub allow_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HttpPolicyDocument {
    #[serde(default)]
    pub allow_domains: Vec<String>,
    #[serde(default)]
    pub deny_private_ips: Option<bool>,
    #[serde(default)]
    pub max_response_bytes: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ShellPolicyDocument {
    #[serde(default)]
    pub allow_executables: Vec<String>,
    #[serde(default)]
    pub deny_tokens: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PolicyToolsDocument {
    #[serde(rename = "fs.read", default)]
    pub fs_read: FsPolicyDocument,
    #[serde(rename = "fs.write", default)]
    pub fs_write: FsPolicyDocument,
    #[serde(rename = "http.get", default)]
    pub http_get: HttpPolicyDocument,
    #[serde(rename = "shell.run", default)]
    pub shell_run: ShellPolicyDocument,
}

/// The top-level logical policy document from spec §6:
/// `{ boundary, global_timeout_seconds, max_calls_per_tool, tools: {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    #[serde(default = "default_boundary")]
    pub boundary: String,
    pub global_timeout_seconds: u64,
    pub max_calls_per_tool: u64,
    #[serde(default)]
    pub tools: PolicyToolsDocument,
}

fn default_boundary() -> String {
    "deny_by_default".to_string()
}

impl From<PolicyDocument> for DomainPolicy {
    fn from(doc: PolicyDocument) -> Self {
        DomainPolicy {
            global_timeout_seconds: doc.global_timeout_seconds,
            max_calls_per_tool: doc.max_calls_per_tool,
            fs_read: into_fs_policy(doc.tools.fs_read),
            fs_write: into_fs_policy(doc.tools.fs_write),
            http_get: into_http_policy(doc.tools.http_get),
            shell_run: into_shell_policy(doc.tools.shell_run),
        }
    }
}

fn into_fs_policy(doc: FsPolicyDocument) -> FsPolicy {
    FsPolicy {
        allow_paths: doc.allow_paths,
        deny_paths: doc.deny_paths,
        max_size_bytes: doc.max_size_bytes,
        allow_hidden: doc.allow_hidden,
    }
}

fn into_http_policy(doc: HttpPolicyDocument) -> HttpPolicy {
    let defaults = HttpPolicy::default();
    HttpPolicy {
        allow_domains: doc.allow_domains,
        deny_private_ips: doc.deny_private_ips.unwrap_or(defaults.deny_private_ips),
        max_response_bytes: doc.max_response_bytes.unwrap_or(defaults.max_response_bytes),
        timeout_seconds: doc.timeout_seconds.unwrap_or(defaults.timeout_seconds),
    }
}

fn into_shell_policy(doc: ShellPolicyDocument) -> ShellPolicy {
    let defaults = ShellPolicy::default();
    ShellPolicy {
        allow_executables: doc.allow_executables,
        deny_tokens: doc.deny_tokens.unwrap_or(defaults.deny_tokens),
        timeout_seconds: doc.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        max_output_bytes: doc.max_output_bytes.unwrap_or(defaults.max_output_bytes),
    }
}

/// The top-level logical plan document from spec §6:
/// `{ version, steps: [{tool, args}] }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDocument {
    #[serde(default = "default_plan_version")]
    pub version: String,
    pub steps: Vec<StepDocument>,
}

fn default_plan_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDocument {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl From<PlanDocument> for DomainPlan {
    fn from(doc: PlanDocument) -> Self {
        DomainPlan {
            version: doc.version,
            steps: doc
                .steps
                .into_iter()
                .map(|s| DomainStep {
                    tool: s.tool,
                    args: s.args,
                })
                .collect(),
        }
    }
}

/// A single proposer response envelope, per spec §6's Proposer JSON
/// protocol: either `{"tool", "args", "reasoning"?}` or
/// `{"done": true, "reason"?, "output"?}`. Kept as a loosely-typed
/// envelope here; `sandbox-core::proposer` is responsible for turning
/// this (after best-effort JSON repair) into a `sandbox_types::Proposal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposerResponseEnvelope {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_document_converts_with_defaults_filled_in() {
        let doc = PolicyDocument {
            boundary: default_boundary(),
            global_timeout_seconds: 120,
            max_calls_per_tool: 10,
            tools: PolicyToolsDocument::default(),
        };
        let policy: DomainPolicy = doc.into();
        assert_eq!(policy.global_timeout_seconds, 120);
        assert!(policy.http_get.deny_private_ips);
        assert!(!policy.shell_run.deny_tokens.is_empty());
    }

    #[test]
    fn plan_document_round_trips_steps() {
        let json = r#"{"version":"1","steps":[{"tool":"fs.read","args":{"path":"a"}}]}"#;
        let doc: PlanDocument = serde_json::from_str(json).unwrap();
        let plan: DomainPlan = doc.into();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "fs.read");
    }

    #[test]
    fn proposer_envelope_parses_tool_call_shape() {
        let json = r#"{"tool":"fs.read","args":{"path":"a.txt"},"reasoning":"because"}"#;
        let env: ProposerResponseEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.tool.as_deref(), Some("fs.read"));
    }

    #[test]
    fn proposer_envelope_parses_done_shape() {
        let json = r#"{"done":true,"reason":"task_complete"}"#;
        let env: ProposerResponseEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.done, Some(true));
    }
}
