//! The Tool Contract: a uniform call/response shape for executors,
//! plus the registry that resolves a tool name to an implementation.
//! Dynamic dispatch stays name-keyed on purpose — the Policy Engine
//! must be able to deny tool names it has never seen.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_types::{Policy, ToolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// What a tool needs to execute, borrowed from whoever drives it (the
/// Execution Engine or the Agent Loop). `policy` is handed down so a
/// tool can perform its own defense-in-depth checks — the Policy
/// Engine has already adjudicated the call, but e.g. `http.get` still
/// needs the configured timeout and size cap to enforce them itself.
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub policy: Arc<Policy>,
    pub working_dir: PathBuf,
}

/// Tagged success/failure pair. Tools return `Failure` for *expected*
/// errors (missing file, non-2xx HTTP, non-zero exit) — those are
/// recorded as `ERROR` results by the caller, not propagated as Rust
/// errors. Only genuinely unexpected failures (a panic-worthy bug, a
/// broken pipe mid-stream) should surface as `execute`'s `Err`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutput {
    Success {
        data: Value,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
    Failure {
        error: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        metadata: Value,
    },
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        Self::Success {
            data,
            metadata: Value::Null,
        }
    }

    pub fn success_with(data: Value, metadata: Value) -> Self {
        Self::Success { data, metadata }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            metadata: Value::Null,
        }
    }

    pub fn failure_with(error: impl Into<String>, metadata: Value) -> Self {
        Self::Failure {
            error: error.into(),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> ToolSchema;

    /// Cheap, synchronous shape-checking, separate from `execute`'s
    /// actual I/O. Default: no complaints.
    fn validate_args(&self, _args: &Value) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, args: Value, context: &ToolContext) -> anyhow::Result<ToolOutput>;
}

/// Unordered map from tool name to implementation. Iteration exists
/// only to list schemas; lookup is always by exact name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::ToolNotFound(name.to_string()))?;
        tool.execute(args, context).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(tool_name: &str, path: &str, value: &Value) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: serde_json::json!({
                "type":"object",
                "properties":{"items":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.items"));
    }

    #[test]
    fn tool_output_success_serializes_with_status_tag() {
        let out = ToolOutput::success(serde_json::json!("hello"));
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["data"], "hello");
    }
}
