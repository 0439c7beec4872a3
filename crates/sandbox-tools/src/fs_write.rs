//! `fs.write` — defense-in-depth duties beyond policy adjudication:
//! refuse if the parent directory is absent unless `create_dirs` is
//! set, and support `append` mode.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::contract::{Tool, ToolContext, ToolOutput, ToolSchema};

pub struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn name(&self) -> &str {
        "fs.write"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fs.write".to_string(),
            description: "Write (or append) content to a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "append": {"type": "boolean"},
                    "create_dirs": {"type": "boolean"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn validate_args(&self, args: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if args.get("path").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            errors.push("path is required".to_string());
        }
        if args.get("content").and_then(|v| v.as_str()).is_none() {
            errors.push("content is required".to_string());
        }
        errors
    }

    async fn execute(&self, args: Value, context: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
            return Ok(ToolOutput::failure("missing path"));
        };
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let append = args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);
        let create_dirs = args.get("create_dirs").and_then(|v| v.as_bool()).unwrap_or(false);

        let resolved = resolve(&context.working_dir, path);
        let Some(parent) = resolved.parent() else {
            return Ok(ToolOutput::failure("path has no parent directory"));
        };
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if create_dirs {
                fs::create_dir_all(parent).await?;
            } else {
                return Ok(ToolOutput::failure(format!(
                    "parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        let bytes_written = content.len();
        if append {
            let mut file = match fs::OpenOptions::new().create(true).append(true).open(&resolved).await {
                Ok(f) => f,
                Err(err) => return Ok(ToolOutput::failure(format!("open for append failed: {err}"))),
            };
            if let Err(err) = file.write_all(content.as_bytes()).await {
                return Ok(ToolOutput::failure(format!("append failed: {err}")));
            }
        } else if let Err(err) = fs::write(&resolved, content).await {
            return Ok(ToolOutput::failure(format!("write failed: {err}")));
        }

        Ok(ToolOutput::success_with(
            json!({"path": resolved.display().to_string()}),
            json!({"bytes_written": bytes_written, "append": append}),
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

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::Policy;
    use std::sync::Arc;

    fn ctx(working_dir: std::path::PathBuf) -> ToolContext {
        ToolContext {
            run_id: "r1".to_string(),
            policy: Arc::new(Policy::default()),
            working_dir,
        }
    }

    #[tokio::test]
    async fn writes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = FsWriteTool
            .execute(json!({"path": "a.txt", "content": "hi"}), &ctx(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn refuses_missing_parent_without_create_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let out = FsWriteTool
            .execute(
                json!({"path": "missing/a.txt", "content": "hi"}),
                &ctx(dir.path().to_path_buf()),
            )
            .await
            .unwrap();
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn create_dirs_makes_parent() {
        let dir = tempfile::tempdir().unwrap();
        let out = FsWriteTool
            .execute(
                json!({"path": "nested/a.txt", "content": "hi", "create_dirs": true}),
                &ctx(dir.path().to_path_buf()),
            )
            .await
            .unwrap();
        assert!(out.is_success());
    }

    #[tokio::test]
    async fn append_adds_to_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one-").unwrap();
        let out = FsWriteTool
            .execute(
                json!({"path": "a.txt", "content": "two", "append": true}),
                &ctx(dir.path().to_path_buf()),
            )
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one-two");
    }
}
