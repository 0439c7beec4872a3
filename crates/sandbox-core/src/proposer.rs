//! The `Proposer` seam (§4.6): whatever decides the next step of an
//! agent loop — a model, a script, a fixed plan. The loop only ever
//! asks for the next `Proposal`; it never knows whether that came from
//! an LLM or a canned script.

use async_trait::async_trait;
use sandbox_tools::ToolSchema;
use sandbox_types::{DoneReason, Plan, Proposal, ProposerError};
use sandbox_wire::ProposerResponseEnvelope;
use serde_json::Value;

/// State handed to a proposer at the top of every iteration: the
/// original task, a snapshot of tool schemas, a human-readable policy
/// summary, the trimmed history of prior (tool, args, outcome) tuples,
/// and the iteration index — per spec §4.6's "State construction". A
/// proposer backed by a real model needs all of this to know what
/// tools exist and what the policy permits; it never sees the `Policy`
/// or `ToolRegistry` directly.
#[derive(Debug, Clone)]
pub struct ProposerState {
    pub task: String,
    pub tool_schemas: Vec<ToolSchema>,
    pub policy_summary: String,
    pub history: Vec<HistoryItem>,
    pub iteration: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct HistoryItem {
    pub tool_name: String,
    pub args: Value,
    pub outcome_summary: String,
}

#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose_next(&self, state: &ProposerState) -> Result<Proposal, ProposerError>;

    /// Called once after the loop terminates, win or lose. Default is
    /// a no-op — most proposers have nothing to clean up.
    async fn finalize(&self, _state: &ProposerState) {}
}

/// Best-effort repair of near-miss JSON a model might emit: trailing
/// commas, single-quoted strings, unquoted object keys, Python-cased
/// booleans/null, and `//`-style comments. Used before falling back to
/// `ProposerError::Parse`.
pub struct JsonProposalParser;

impl JsonProposalParser {
    pub fn parse(raw: &str) -> Result<Proposal, ProposerError> {
        let trimmed = extract_json_object(raw);
        let envelope: ProposerResponseEnvelope = if let Ok(envelope) = serde_json::from_str(trimmed) {
            envelope
        } else {
            let repaired = repair_json(trimmed);
            serde_json::from_str(&repaired)
                .map_err(|e| ProposerError::Parse(format!("could not parse proposal: {e}")))?
        };
        envelope_to_proposal(envelope)
    }
}

/// Converts the wire-level `{"tool",...}` / `{"done": true,...}` shape
/// (spec §6) into the internal tagged-enum `Proposal` the rest of
/// `sandbox-core` works with.
fn envelope_to_proposal(envelope: ProposerResponseEnvelope) -> Result<Proposal, ProposerError> {
    if envelope.done == Some(true) {
        let reason = match envelope.reason {
            Some(reason) => serde_json::from_value(Value::String(reason.clone()))
                .map_err(|_| ProposerError::InvalidResponse(format!("unknown done reason: {reason}")))?,
            None => DoneReason::TaskComplete,
        };
        return Ok(Proposal::Done {
            reason,
            final_output: envelope.output,
        });
    }

    let tool_name = envelope
        .tool
        .ok_or_else(|| ProposerError::InvalidResponse("response has neither \"tool\" nor \"done\": true".to_string()))?;
    let args = envelope.args.unwrap_or_else(|| Value::Object(Default::default()));
    Ok(Proposal::ToolCall { tool_name, args })
}

fn extract_json_object(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

fn repair_json(input: &str) -> String {
    let no_comments = strip_line_comments(input);
    let no_trailing_commas = strip_trailing_commas(&no_comments);
    let quoted_keys = quote_bare_keys(&no_trailing_commas);
    normalize_literals(&quoted_keys)
}

fn strip_line_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' && !in_string {
            in_string = true;
            out.push(c);
        } else if c == '"' && in_string {
            in_string = false;
            out.push(c);
        } else if !in_string && c == '/' && chars.peek() == Some(&'/') {
            while let Some(&next) = chars.peek() {
                if next == '\n' {
                    break;
                }
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_trailing_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn quote_bare_keys(input: &str) -> String {
    let re = regex::Regex::new(r"(?m)([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").unwrap();
    re.replace_all(input, "$1\"$2\"$3").to_string()
}

fn normalize_literals(input: &str) -> String {
    let re = regex::Regex::new(r"\b(True|False|None)\b").unwrap();
    re.replace_all(input, |caps: &regex::Captures| match &caps[1] {
        "True" => "true",
        "False" => "false",
        _ => "null",
    })
    .to_string()
}

/// Feeds a fixed `Plan`'s steps through the proposer seam, one step at
/// a time, then returns `Done { TaskComplete }`. Lets the Execution
/// Engine and the Agent Loop share the same driving code path — a
/// scripted plan is "a proposer that never deviates."
pub struct StaticPlanProposer {
    plan: Plan,
    cursor: std::sync::atomic::AtomicUsize,
}

impl StaticPlanProposer {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Proposer for StaticPlanProposer {
    async fn propose_next(&self, _state: &ProposerState) -> Result<Proposal, ProposerError> {
        let index = self.cursor.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.plan.steps.get(index) {
            Some(step) => Ok(Proposal::ToolCall {
                tool_name: step.tool.clone(),
                args: step.args.clone(),
            }),
            None => Ok(Proposal::Done {
                reason: sandbox_types::DoneReason::TaskComplete,
                final_output: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json_proposal() {
        let proposal = JsonProposalParser::parse(r#"{"tool":"fs.read","args":{"path":"a.txt"}}"#).unwrap();
        match proposal {
            Proposal::ToolCall { tool_name, .. } => assert_eq!(tool_name, "fs.read"),
            _ => panic!("expected tool_call"),
        }
    }

    #[test]
    fn repairs_trailing_comma_and_bare_keys() {
        let raw = r#"{tool: "fs.read", args: {"path": "a.txt",},}"#;
        let proposal = JsonProposalParser::parse(raw).unwrap();
        match proposal {
            Proposal::ToolCall { tool_name, .. } => assert_eq!(tool_name, "fs.read"),
            _ => panic!("expected tool_call"),
        }
    }

    #[test]
    fn repairs_python_literals_and_strips_comments() {
        let raw = "{\n  // a done proposal\n  \"done\": true,\n  \"reason\": \"task_complete\",\n  \"output\": None\n}";
        let proposal = JsonProposalParser::parse(raw).unwrap();
        match proposal {
            Proposal::Done { final_output, reason } => {
                assert_eq!(final_output, None);
                assert_eq!(reason, DoneReason::TaskComplete);
            }
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn done_without_reason_defaults_to_task_complete() {
        let proposal = JsonProposalParser::parse(r#"{"done": true}"#).unwrap();
        match proposal {
            Proposal::Done { reason, .. } => assert_eq!(reason, DoneReason::TaskComplete),
            _ => panic!("expected done"),
        }
    }

    #[test]
    fn response_with_neither_tool_nor_done_is_invalid() {
        let err = JsonProposalParser::parse(r#"{"reasoning": "thinking out loud"}"#).unwrap_err();
        assert!(matches!(err, ProposerError::InvalidResponse(_)));
    }

    #[test]
    fn unrepairable_garbage_is_a_parse_error() {
        let err = JsonProposalParser::parse("not json at all").unwrap_err();
        assert!(matches!(err, ProposerError::Parse(_)));
    }

    #[tokio::test]
    async fn static_plan_proposer_replays_steps_then_completes() {
        let plan = Plan::new(vec![sandbox_types::Step {
            tool: "fs.read".to_string(),
            args: serde_json::json!({"path": "a.txt"}),
        }]);
        let proposer = StaticPlanProposer::new(plan);
        let state = ProposerState {
            task: "read a file".to_string(),
            tool_schemas: Vec::new(),
            policy_summary: String::new(),
            history: Vec::new(),
            iteration: 0,
        };
        let first = proposer.propose_next(&state).await.unwrap();
        assert!(matches!(first, Proposal::ToolCall { .. }));
        let second = proposer.propose_next(&state).await.unwrap();
        assert!(matches!(second, Proposal::Done { .. }));
    }
}
