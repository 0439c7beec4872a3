//! Error kinds shared across the sandbox core, per spec §7.
//!
//! Each leaf error carries enough structure to satisfy "every error
//! carries a numeric code, a machine-readable kind, a human message, an
//! optional suggestion, and a context map" without forcing every call
//! site to build that context map by hand — `ErrorContext` gives a
//! builder-ish constructor. The top-level `SandboxError` composes the
//! per-subsystem enums via `#[from]`, the same aggregation idiom the
//! teacher's `MemoryError` uses for `rusqlite`/`io`/`serde_json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorContext(pub HashMap<String, Value>);

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{kind}: {message}")]
pub struct PolicyDenied {
    pub kind: PolicyDeniedKind,
    pub tool: String,
    pub argument: Option<String>,
    pub message: String,
    pub suggestion: Option<String>,
    #[serde(default)]
    pub context: ErrorContext,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDeniedKind {
    PathBlocked,
    DomainBlocked,
    ExecutableBlocked,
    TokenBlocked,
    SizeExceeded,
    QuotaExceeded,
    DenyByDefault,
}

impl std::fmt::Display for PolicyDeniedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PolicyDeniedKind::PathBlocked => "path_blocked",
            PolicyDeniedKind::DomainBlocked => "domain_blocked",
            PolicyDeniedKind::ExecutableBlocked => "executable_blocked",
            PolicyDeniedKind::TokenBlocked => "token_blocked",
            PolicyDeniedKind::SizeExceeded => "size_exceeded",
            PolicyDeniedKind::QuotaExceeded => "quota_exceeded",
            PolicyDeniedKind::DenyByDefault => "deny_by_default",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("tool execution failed: {0}")]
    ToolExecutionFailed(String),
    #[error("tool timed out after {0}s")]
    ToolTimeout(u64),
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum PlanValidation {
    #[error("plan has no steps")]
    PlanEmpty,
    #[error("step {step_index} is invalid: {reason}")]
    StepInvalid { step_index: u64, reason: String },
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum ProposerError {
    #[error("proposer connection error: {0}")]
    Connection(String),
    #[error("proposer timed out")]
    Timeout,
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("could not parse proposer output: {0}")]
    Parse(String),
    #[error("invalid proposer response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum ReplayError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("replay mismatch ({kind}): expected {expected}, got {actual}")]
    Mismatch {
        kind: String,
        expected: String,
        actual: String,
    },
    #[error("hash mismatch for {subject}")]
    HashMismatch { subject: String },
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),
    #[error("storage read error: {0}")]
    Read(String),
    #[error("storage write error: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum SandboxError {
    #[error(transparent)]
    PolicyDenied(#[from] PolicyDenied),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Plan(#[from] PlanValidation),
    #[error(transparent)]
    Proposer(#[from] ProposerError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SandboxError {
    /// A stable numeric code per top-level kind, for machine-readable
    /// reporting by whatever front end consumes this core (§7: "every
    /// error carries a numeric code").
    pub fn code(&self) -> u32 {
        match self {
            SandboxError::PolicyDenied(_) => 1000,
            SandboxError::Tool(_) => 2000,
            SandboxError::Plan(_) => 3000,
            SandboxError::Proposer(_) => 4000,
            SandboxError::Replay(_) => 5000,
            SandboxError::Storage(_) => 6000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denied_displays_kind_and_message() {
        let err = PolicyDenied {
            kind: PolicyDeniedKind::PathBlocked,
            tool: "fs.read".into(),
            argument: Some("path".into()),
            message: "allow_paths=[]".into(),
            suggestion: Some("add to allow_paths".into()),
            context: ErrorContext::new(),
        };
        assert!(err.to_string().contains("path_blocked"));
        assert_eq!(SandboxError::from(err).code(), 1000);
    }

    #[test]
    fn error_context_builder_accumulates() {
        let ctx = ErrorContext::new().with("path", "/w/a").with("rule", "deny_paths");
        assert_eq!(ctx.0.len(), 2);
    }
}
