//! `fs.read` — the Policy Engine has already adjudicated the path;
//! this tool's own job is narrower: resolve against `working_dir`,
//! refuse non-files, and decode per the requested encoding.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tokio::fs;

use crate::contract::{Tool, ToolContext, ToolOutput, ToolSchema};

pub struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fs.read".to_string(),
            description: "Read a file's contents".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "encoding": {"type": "string", "enum": ["utf8", "binary"]}
                },
                "required": ["path"]
            }),
        }
    }

    fn validate_args(&self, args: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if args.get("path").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            errors.push("path is required".to_string());
        }
        errors
    }

    async fn execute(&self, args: Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::failure("missing path"));
        };
        let resolved = resolve(&context.working_dir, path);
        let encoding = args.get("encoding").and_then(|v| v.as_str()).unwrap_or("utf8");

        let metadata = match fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ToolOutput::failure(format!("file not found: {}", resolved.display())));
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Ok(ToolOutput::failure(format!("not a regular file: {}", resolved.display())));
        }

        let bytes = match fs::read(&resolved).await {
            Ok(b) => b,
            Err(err) => return Ok(ToolOutput::failure(format!("read failed: {err}"))),
        };

        let data = match encoding {
            "binary" => json!({"encoding": "base64", "content": STANDARD.encode(&bytes)}),
            _ => json!({"encoding": "utf8", "content": String::from_utf8_lossy(&bytes)}),
        };

        Ok(ToolOutput::success_with(
            data,
            json!({"path": resolved.display().to_string(), "size": bytes.len()}),
        ))
    }
}

fn resolve(working_dir: &std::path::Path, path: &str) -> std::path::PathBuf {
    let candidate = std::path::Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_dir.join(candidate)
    }
}
