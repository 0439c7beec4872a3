//! The Tool Contract (§4.4) and the four default tool implementations:
//! `fs.read`, `fs.write`, `http.get`, `shell.run`. The Policy Engine
//! (in `sandbox-core`) is the only trust boundary; these tools still
//! carry defense-in-depth duties the policy layer cannot perform
//! itself (DNS-rebinding checks, parent-directory checks, output caps).

mod contract;
mod fs_read;
mod fs_write;
mod http_get;
mod shell_run;

pub use contract::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolSchema, ToolSchemaValidationError, validate_tool_schemas};
pub use fs_read::FsReadTool;
pub use fs_write::FsWriteTool;
pub use http_get::HttpGetTool;
pub use shell_run::ShellRunTool;

use std::sync::Arc;

/// The four built-in tools, registered under their spec-mandated
/// dotted names. Callers needing a custom registry can build one from
/// scratch and register a subset, or add external tools alongside
/// these.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(FsReadTool));
    registry.register(Arc::new(FsWriteTool));
    registry.register(Arc::new(HttpGetTool::default()));
    registry.register(Arc::new(ShellRunTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_registry_schemas_are_unique_and_valid() {
        let registry = default_registry();
        let schemas = registry.schemas();
        validate_tool_schemas(&schemas).expect("tool schemas should validate");
        let unique: HashSet<_> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(unique.len(), schemas.len());
        assert_eq!(unique.len(), 4);
    }
}
