//! `shell.run` — the Policy Engine has already rejected any `cmd`
//! that isn't a list of strings (the single most important invariant
//! in the whole system: a shell-interpreted string is never
//! permitted). This tool invokes the argument list directly, never
//! through a shell interpreter, honors the configured timeout, and
//! caps combined stdout+stderr.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::contract::{Tool, ToolContext, ToolOutput, ToolSchema};

pub struct ShellRunTool;

#[async_trait]
impl Tool for ShellRunTool {
    fn name(&self) -> &str {
        "shell.run"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "shell.run".to_string(),
            description: "Run a subprocess from an explicit argument list".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cmd": {"type": "array", "items": {"type": "string"}},
                    "env": {"type": "object"}
                },
                "required": ["cmd"]
            }),
        }
    }

    fn validate_args(&self, args: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        match args.get("cmd") {
            Some(Value::Array(items)) if !items.is_empty() => {
                if !items.iter().all(|v| v.is_string()) {
                    errors.push("cmd must be a list of strings".to_string());
                }
            }
            _ => errors.push("cmd must be a non-empty list of strings".to_string()),
        }
        errors
    }

    async fn execute(&self, args: Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(cmd) = args.get("cmd").and_then(|v| v.as_array()) else {
            return Ok(ToolOutput::failure("cmd must be a list of strings"));
        };
        let argv: Vec<&str> = cmd.iter().filter_map(|v| v.as_str()).collect();
        if argv.len() != cmd.len() || argv.is_empty() {
            return Ok(ToolOutput::failure("cmd must be a list of strings"));
        }

        let policy = &context.policy.shell_run;
        let mut command = Command::new(argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&context.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = args.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(value) = v.as_str() {
                    command.env(k, value);
                }
            }
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(err) => return Ok(ToolOutput::failure(format!("failed to spawn {}: {err}", argv[0]))),
        };

        let timeout = Duration::from_secs(policy.timeout_seconds);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => return Ok(ToolOutput::failure(format!("process wait failed: {err}"))),
            Err(_) => {
                return Ok(ToolOutput::failure(format!(
                    "command timed out after {}s",
                    policy.timeout_seconds
                )));
            }
        };

        let cap = policy.max_output_bytes as usize;
        let mut stdout = output.stdout;
        let mut stderr = output.stderr;
        let truncated = stdout.len() + stderr.len() > cap;
        if stdout.len() > cap {
            stdout.truncate(cap);
        }
        let remaining = cap.saturating_sub(stdout.len());
        if stderr.len() > remaining {
            stderr.truncate(remaining);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let data = json!({
            "stdout": String::from_utf8_lossy(&stdout),
            "stderr": String::from_utf8_lossy(&stderr),
            "exit_code": exit_code,
        });
        let metadata = json!({"truncated": truncated});

        if output.status.success() {
            Ok(ToolOutput::success_with(data, metadata))
        } else {
            Ok(ToolOutput::failure_with(format!("exited with code {exit_code}"), json!({
                "truncated": truncated,
                "stdout": String::from_utf8_lossy(&stdout),
                "stderr": String::from_utf8_lossy(&stderr),
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::Policy;
    use std::sync::Arc;

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: "r1".to_string(),
            policy: Arc::new(Policy::default()),
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn runs_argv_directly() {
        let out = ShellRunTool
            .execute(json!({"cmd": ["echo", "hi"]}), &ctx())
            .await
            .unwrap();
        match out {
            ToolOutput::Success { data, .. } => assert_eq!(data["stdout"].as_str().unwrap().trim(), "hi"),
            ToolOutput::Failure { error, .. } => panic!("unexpected failure: {error}"),
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let out = ShellRunTool
            .execute(json!({"cmd": ["false"]}), &ctx())
            .await
            .unwrap();
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn rejects_non_list_cmd_before_spawning() {
        let out = ShellRunTool
            .execute(json!({"cmd": "echo hi; rm -rf /"}), &ctx())
            .await
            .unwrap();
        assert!(!out.is_success());
    }
}
