//! Error kinds for the orchestrator core (§7).
//!
//! Each variant is a *behavioral* category, not a type name — the dispatcher
//! and worker loop match on these to decide whether to retry, degrade, or
//! log-and-skip. Follows the donor's plain `Display` + `Error` enum style
//! (`tool_protocol::ToolError`, `tools::bash::BashError`) rather than pulling
//! in a derive-macro error crate.

use std::fmt;

/// Behavioral error category threading through the dispatcher and worker
/// loop (§7).
#[derive(Debug)]
pub enum OrchestratorError {
    /// Task DB / context store IO, override store IO, RPC read timeout.
    /// Policy: log, retry on next tick; never crash the worker.
    TransientBackend(String),
    /// The runtime returned an error, ended without output, or tool-call
    /// retries were exhausted. Policy: synthesize a failed execution result;
    /// do not advance to a success-only next state.
    AgentTurnFailure(String),
    /// Shell command exit ≠ 0 or timeout. Not a worker-level error — normal
    /// input to the Procedural QA Synthesizer.
    PreflightFailure(String),
    /// VCS command failed or branch name invalid. Fatal for the current
    /// tick; worker continues with the next tick.
    BranchError(String),
    /// Override store locked or otherwise unusable. Policy: degrade to
    /// defaults-only, continue.
    ConfigError(String),
    /// Unknown workflow state, unknown profile, or an unknown transition
    /// returned by the decider. Policy: log-and-skip-tick.
    ProgrammingError(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::TransientBackend(msg) => write!(f, "transient backend error: {}", msg),
            OrchestratorError::AgentTurnFailure(msg) => write!(f, "agent turn failure: {}", msg),
            OrchestratorError::PreflightFailure(msg) => write!(f, "preflight failure: {}", msg),
            OrchestratorError::BranchError(msg) => write!(f, "branch error: {}", msg),
            OrchestratorError::ConfigError(msg) => write!(f, "config error: {}", msg),
            OrchestratorError::ProgrammingError(msg) => write!(f, "programming error: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl OrchestratorError {
    /// §7: whether the worker loop should simply log and continue rather
    /// than treat this as requiring any special recovery action.
    pub fn is_tick_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::BranchError(_) | OrchestratorError::ProgrammingError(_)
        )
    }
}

/// Errors raised by the Branch Manager (§4.6).
#[derive(Debug)]
pub enum BranchManagerError {
    InvalidName(String),
    VcsCommandFailed { command: String, stderr: String },
    BranchMissing(String),
}

impl fmt::Display for BranchManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchManagerError::InvalidName(name) => {
                write!(f, "invalid branch name: {}", name)
            }
            BranchManagerError::VcsCommandFailed { command, stderr } => {
                write!(f, "vcs command `{}` failed: {}", command, stderr)
            }
            BranchManagerError::BranchMissing(name) => {
                write!(f, "branch `{}` does not exist and this transition cannot create it", name)
            }
        }
    }
}

impl std::error::Error for BranchManagerError {}

impl From<BranchManagerError> for OrchestratorError {
    fn from(e: BranchManagerError) -> Self {
        OrchestratorError::BranchError(e.to_string())
    }
}

/// Errors raised by the Agent Session Driver's RPC transport (§4.8).
#[derive(Debug)]
pub enum RpcError {
    Spawn(String),
    Io(String),
    Timeout,
    Protocol(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Spawn(msg) => write!(f, "failed to spawn agent runtime: {}", msg),
            RpcError::Io(msg) => write!(f, "rpc io error: {}", msg),
            RpcError::Timeout => write!(f, "rpc turn timed out"),
            RpcError::Protocol(msg) => write!(f, "rpc protocol error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for OrchestratorError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout => OrchestratorError::AgentTurnFailure("turn exceeded its wall-clock deadline".into()),
            other => OrchestratorError::AgentTurnFailure(other.to_string()),
        }
    }
}

/// Errors raised by a [`crate::orchestrator::task_store::TaskStore`] or
/// [`crate::orchestrator::context_store::ContextStore`] implementation.
#[derive(Debug)]
pub enum StoreError {
    Locked(String),
    Io(String),
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Locked(msg) => write!(f, "store locked: {}", msg),
            StoreError::Io(msg) => write!(f, "store io error: {}", msg),
            StoreError::NotFound(id) => write!(f, "not found: {}", id),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::TransientBackend(e.to_string())
    }
}
