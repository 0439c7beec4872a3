//! The Policy Engine: the security boundary. Every proposal is
//! adjudicated here before any side effect. Fail-closed throughout —
//! any internal uncertainty is a denial, never a thrown error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use regex::Regex;
use sandbox_types::{FsPolicy, HttpPolicy, Policy, PolicyDecision, ShellPolicy};
use serde_json::Value;

/// Owns a snapshot of a `Policy` plus an in-memory per-tool quota
/// counter scoped to its own lifetime. `evaluate` is synchronous and
/// non-suspending per spec §5 — a `std::sync::Mutex` is enough since
/// one engine instance is never shared across concurrently-executing
/// runs without the caller explicitly resetting counts between them.
pub struct PolicyEngine {
    policy: Policy,
    quota: Mutex<HashMap<String, u64>>,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            quota: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// A short, human-readable rendering of what this policy permits —
    /// handed to a proposer each iteration per spec §4.6's "State
    /// construction" so it knows the boundary it's working within
    /// without needing the `Policy` struct itself.
    pub fn summarize(&self) -> String {
        summarize_policy(&self.policy)
    }

    /// Zeros the quota counters. Call when reusing one engine for a
    /// new run.
    pub fn reset_counts(&self) {
        self.quota.lock().unwrap().clear();
    }

    pub fn evaluate(&self, tool_name: &str, args: &Value, working_dir: &Path) -> PolicyDecision {
        let count = *self.quota.lock().unwrap().get(tool_name).unwrap_or(&0);
        if count >= self.policy.max_calls_per_tool {
            return PolicyDecision::deny("max_calls_per_tool");
        }

        let decision = match tool_name {
            "fs.read" => adjudicate_fs(&self.policy.fs_read, args, working_dir, false),
            "fs.write" => adjudicate_fs(&self.policy.fs_write, args, working_dir, true),
            "http.get" => adjudicate_http(&self.policy.http_get, args),
            "shell.run" => adjudicate_shell(&self.policy.shell_run, args),
            _ => PolicyDecision::deny("deny_by_default"),
        };

        if decision.allowed {
            *self.quota.lock().unwrap().entry(tool_name.to_string()).or_insert(0) += 1;
        } else {
            tracing::warn!(tool = tool_name, rule = ?decision.rule_matched, "policy denied call");
        }
        decision
    }
}

// ---------------------------------------------------------------------
// Filesystem adjudication — §4.3.1
// ---------------------------------------------------------------------

fn adjudicate_fs(rule: &FsPolicy, args: &Value, working_dir: &Path, is_write: bool) -> PolicyDecision {
    let Some(path) = args.get("path").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return PolicyDecision::deny("missing_argument");
    };

    let resolved = match resolve_path(working_dir, path) {
        Some(p) => p,
        None => return PolicyDecision::deny("invalid_path"),
    };

    if !rule.allow_hidden && has_hidden_component(&resolved) {
        return PolicyDecision::deny("allow_hidden=false");
    }

    for pattern in &rule.deny_paths {
        if pattern_matches(pattern, &resolved, working_dir) {
            return PolicyDecision::deny(format!("deny_paths[{pattern}]"));
        }
    }

    if rule.allow_paths.is_empty() {
        return PolicyDecision::deny("allow_paths=[]");
    }

    let mut escape_reason: Option<String> = None;
    for pattern in &rule.allow_paths {
        let base = glob_base_prefix(pattern);
        let base_resolved = resolve_path(working_dir, &base).unwrap_or_else(|| working_dir.join(&base));

        if is_symlink(&base_resolved) {
            escape_reason.get_or_insert_with(|| format!("symlink_escape[{pattern}]"));
            continue;
        }
        if !resolved.starts_with(&base_resolved) {
            escape_reason.get_or_insert_with(|| format!("symlink_escape[{pattern}]"));
            continue;
        }
        if pattern_matches(pattern, &resolved, working_dir) {
            return PolicyDecision::allow(format!("allow_paths[{pattern}]"));
        }
    }

    if let Some(reason) = escape_reason {
        return PolicyDecision::deny(reason);
    }

    if is_write {
        if let Some(content) = args.get("content").and_then(|v| v.as_str()) {
            if rule.max_size_bytes > 0 && content.as_bytes().len() as u64 > rule.max_size_bytes {
                return PolicyDecision::deny("max_size_bytes");
            }
        }
    }

    PolicyDecision::deny("allow_paths")
}

/// Joins a relative path onto `working_dir`, then normalizes: follows
/// real symlinks where the path exists (`fs::canonicalize`), and
/// falls back to lexical `..`/`.` collapsing when it doesn't (writes
/// may target paths that don't exist yet).
fn resolve_path(working_dir: &Path, path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_dir.join(candidate)
    };
    if let Ok(canon) = joined.canonicalize() {
        return Some(canon);
    }
    Some(lexical_normalize(&joined))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn has_hidden_component(path: &Path) -> bool {
    path.components().any(|c| {
        let std::path::Component::Normal(name) = c else {
            return false;
        };
        name.to_str().map(|s| s.starts_with('.') && s != "." && s != "..").unwrap_or(false)
    })
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata().map(|m| m.is_symlink()).unwrap_or(false)
}

fn glob_base_prefix(pattern: &str) -> String {
    let is_glob_char = |c: char| matches!(c, '*' | '?' | '[' | ']');
    let mut base_components = Vec::new();
    for component in pattern.split('/') {
        if component.is_empty() {
            continue;
        }
        if component.chars().any(is_glob_char) {
            break;
        }
        base_components.push(component);
    }
    let prefix = base_components.join("/");
    if pattern.starts_with('/') {
        format!("/{prefix}")
    } else {
        prefix
    }
}

fn pattern_matches(pattern: &str, resolved: &Path, working_dir: &Path) -> bool {
    let anchored = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        working_dir.join(pattern).to_string_lossy().to_string()
    };
    let Ok(glob_pattern) = glob::Pattern::new(&anchored) else {
        return false;
    };
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    glob_pattern.matches_path_with(resolved, options)
}

// ---------------------------------------------------------------------
// HTTP adjudication — §4.3.2
// ---------------------------------------------------------------------

fn adjudicate_http(rule: &HttpPolicy, args: &Value) -> PolicyDecision {
    let Some(url_str) = args.get("url").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return PolicyDecision::deny("missing_argument");
    };
    let Ok(url) = url::Url::parse(url_str) else {
        return PolicyDecision::deny("invalid_url");
    };
    let Some(host) = url.host_str() else {
        return PolicyDecision::deny("invalid_url");
    };
    let host = host.to_lowercase();

    if rule.allow_domains.is_empty() {
        return PolicyDecision::deny("allow_domains=[]");
    }

    let matched = rule.allow_domains.iter().find(|pattern| domain_matches(pattern, &host));
    let Some(matched) = matched else {
        return PolicyDecision::deny("domain_blocked");
    };

    if rule.deny_private_ips && is_private_host_literal(&host) {
        return PolicyDecision::deny("private_ip_blocked");
    }

    PolicyDecision::allow(format!("allow_domains[{matched}]"))
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        pattern == host
    }
}

fn is_private_host_literal(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
    }
    false
}

// ---------------------------------------------------------------------
// Shell adjudication — §4.3.3
// ---------------------------------------------------------------------

fn adjudicate_shell(rule: &ShellPolicy, args: &Value) -> PolicyDecision {
    let Some(cmd) = args.get("cmd").and_then(|v| v.as_array()) else {
        return PolicyDecision::deny("cmd_must_be_list");
    };
    if cmd.is_empty() {
        return PolicyDecision::deny("cmd_empty");
    }
    if !cmd.iter().all(|v| v.is_string()) {
        return PolicyDecision::deny("cmd_must_be_list");
    }
    let argv: Vec<&str> = cmd.iter().filter_map(|v| v.as_str()).collect();

    let basename = Path::new(argv[0])
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(argv[0]);
    if !rule.allow_executables.iter().any(|e| e == basename) {
        return PolicyDecision::deny("executable_blocked");
    }

    let joined = argv.join(" ");
    for token in &rule.deny_tokens {
        if token_matches(token, &joined) {
            return PolicyDecision::deny(format!("deny_tokens[{token}]"));
        }
    }

    PolicyDecision::allow(format!("allow_executables[{basename}]"))
}

fn token_matches(token: &str, haystack: &str) -> bool {
    let pattern = format!(r"(?i)(?:^|[^a-zA-Z0-9]){}(?:[^a-zA-Z0-9]|$)", regex::escape(token));
    Regex::new(&pattern).map(|re| re.is_match(haystack)).unwrap_or(false)
}

fn summarize_policy(policy: &Policy) -> String {
    let fs_read = if policy.fs_read.allow_paths.is_empty() {
        "none".to_string()
    } else {
        policy.fs_read.allow_paths.join(", ")
    };
    let fs_write = if policy.fs_write.allow_paths.is_empty() {
        "none".to_string()
    } else {
        policy.fs_write.allow_paths.join(", ")
    };
    let domains = if policy.http_get.allow_domains.is_empty() {
        "none".to_string()
    } else {
        policy.http_get.allow_domains.join(", ")
    };
    let executables = if policy.shell_run.allow_executables.is_empty() {
        "none".to_string()
    } else {
        policy.shell_run.allow_executables.join(", ")
    };
    format!(
        "fs.read allowed: {fs_read}; fs.write allowed: {fs_write}; http.get domains: {domains}; \
         shell.run executables: {executables}; global timeout: {}s; max calls per tool: {}",
        policy.global_timeout_seconds, policy.max_calls_per_tool
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::Policy;
    use serde_json::json;
    use std::os::unix::fs::symlink;

    fn policy_with_fs_read(allow: Vec<&str>) -> Policy {
        let mut policy = Policy::default();
        policy.fs_read.allow_paths = allow.into_iter().map(String::from).collect();
        policy.fs_read.allow_hidden = false;
        policy
    }

    // S1 — Allowed read.
    #[test]
    fn s1_allowed_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let pattern = format!("{}/**", dir.path().display());
        let engine = PolicyEngine::new(policy_with_fs_read(vec![&pattern]));
        let decision = engine.evaluate("fs.read", &json!({"path": "./a.txt"}), dir.path());
        assert!(decision.allowed);
        assert!(decision.rule_matched.unwrap().starts_with("allow_paths["));
    }

    // S2 — Hidden blocked.
    #[test]
    fn s2_hidden_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/**", dir.path().display());
        let engine = PolicyEngine::new(policy_with_fs_read(vec![&pattern]));
        let decision = engine.evaluate("fs.read", &json!({"path": ".env"}), dir.path());
        assert!(!decision.allowed);
        assert_eq!(decision.rule_matched.as_deref(), Some("allow_hidden=false"));
    }

    // S3 — Symlink escape.
    #[test]
    fn s3_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let w = dir.path().join("w");
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&w).unwrap();
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("passwd"), "secret").unwrap();
        symlink(&etc, w.join("link")).unwrap();

        let pattern = format!("{}/**", w.display());
        let engine = PolicyEngine::new(policy_with_fs_read(vec![&pattern]));
        let decision = engine.evaluate("fs.read", &json!({"path": w.join("link").join("passwd").to_string_lossy()}), &w);
        assert!(!decision.allowed);
        assert!(decision.rule_matched.unwrap().contains("symlink_escape"));
    }

    // S4 — Shell string rejected.
    #[test]
    fn s4_shell_string_rejected() {
        let mut policy = Policy::default();
        policy.shell_run.allow_executables = vec!["echo".to_string()];
        let engine = PolicyEngine::new(policy);
        let decision = engine.evaluate("shell.run", &json!({"cmd": "echo hi; rm -rf /"}), Path::new("/"));
        assert!(!decision.allowed);
        assert_eq!(decision.rule_matched.as_deref(), Some("cmd_must_be_list"));
    }

    #[test]
    fn shell_empty_cmd_rejected_distinctly() {
        let mut policy = Policy::default();
        policy.shell_run.allow_executables = vec!["echo".to_string()];
        let engine = PolicyEngine::new(policy);
        let decision = engine.evaluate("shell.run", &json!({"cmd": []}), Path::new("/"));
        assert!(!decision.allowed);
        assert_eq!(decision.rule_matched.as_deref(), Some("cmd_empty"));
    }

    // S5 — Deny-token.
    #[test]
    fn s5_deny_token() {
        let mut policy = Policy::default();
        policy.shell_run.allow_executables = vec!["bash".to_string()];
        let engine = PolicyEngine::new(policy);
        let decision = engine.evaluate("shell.run", &json!({"cmd": ["bash", "-c", "sudo ls"]}), Path::new("/"));
        assert!(!decision.allowed);
        assert_eq!(decision.rule_matched.as_deref(), Some("deny_tokens[sudo]"));
    }

    #[test]
    fn deny_token_word_boundary_does_not_false_positive() {
        let mut policy = Policy::default();
        policy.shell_run.allow_executables = vec!["bash".to_string()];
        let engine = PolicyEngine::new(policy);
        let decision = engine.evaluate("shell.run", &json!({"cmd": ["bash", "-c", "capsule build"]}), Path::new("/"));
        assert!(decision.allowed);
    }

    // S6 — Quota.
    #[test]
    fn s6_quota() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/**", dir.path().display());
        let mut policy = policy_with_fs_read(vec![&pattern]);
        policy.max_calls_per_tool = 2;
        let engine = PolicyEngine::new(policy);
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();

        let d1 = engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path());
        let d2 = engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path());
        let d3 = engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path());
        assert!(d1.allowed && d2.allowed);
        assert!(!d3.allowed);
        assert_eq!(d3.rule_matched.as_deref(), Some("max_calls_per_tool"));
    }

    #[test]
    fn deny_paths_takes_precedence_over_allow_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.env"), "x").unwrap();
        let allow = format!("{}/**", dir.path().display());
        let deny = format!("{}/*.env", dir.path().display());
        let mut policy = Policy::default();
        policy.fs_read.allow_hidden = true;
        policy.fs_read.allow_paths = vec![allow];
        policy.fs_read.deny_paths = vec![deny];
        let engine = PolicyEngine::new(policy);
        let decision = engine.evaluate("fs.read", &json!({"path": "secret.env"}), dir.path());
        assert!(!decision.allowed);
        assert!(decision.rule_matched.unwrap().starts_with("deny_paths["));
    }

    #[test]
    fn unknown_tool_denies_by_default() {
        let engine = PolicyEngine::new(Policy::default());
        let decision = engine.evaluate("mystery.tool", &json!({}), Path::new("/"));
        assert!(!decision.allowed);
        assert_eq!(decision.rule_matched.as_deref(), Some("deny_by_default"));
    }

    #[test]
    fn reset_counts_zeros_quota() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let pattern = format!("{}/**", dir.path().display());
        let mut policy = policy_with_fs_read(vec![&pattern]);
        policy.max_calls_per_tool = 1;
        let engine = PolicyEngine::new(policy);
        assert!(engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path()).allowed);
        assert!(!engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path()).allowed);
        engine.reset_counts();
        assert!(engine.evaluate("fs.read", &json!({"path": "a.txt"}), dir.path()).allowed);
    }
}
