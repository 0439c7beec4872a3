//! Policy Engine, Execution Engine, Agent Loop, and Replay Engine —
//! the four subsystems that make up the sandbox core. See spec §4.

mod agent_loop;
mod execution;
mod policy;
mod proposer;
mod replay;

pub use agent_loop::{AgentLoopConfig, AgentResult, TerminationStatus};
pub use execution::{RunResult, StepOutcome};
pub use policy::PolicyEngine;
pub use proposer::{HistoryItem, JsonProposalParser, Proposer, ProposerState, StaticPlanProposer};
pub use replay::{ReplayMismatch, ReplayResult, VerifyResult, VerifyStats};

pub use execution::{load_run, run as run_plan};
pub use agent_loop::run as run_agent_loop;
pub use replay::{replay, verify_run};
