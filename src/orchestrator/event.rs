//! Observability layer for the orchestrator core.
//!
//! A single [`EventHandler`] trait with default no-op methods, mirroring the
//! donor crate's agent/orchestration event system: implement only what you
//! care about, the handler is shared as `Arc<dyn EventHandler>` across
//! workers.
//!
//! Every tick emits exactly one [`OrchestratorEvent::TickStarted`]/
//! [`OrchestratorEvent::TickCompleted`] pair (§4.10, §7: "every tick emits
//! one log line"); agent-session retries and aborts emit
//! [`OrchestratorEvent::AgentRetry`]/[`OrchestratorEvent::AgentAborted`]
//! (rendered as `[ACP] ...` in the default logging handler, §7).

use async_trait::async_trait;

/// Events emitted by one worker's tick (§4.10).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Emitted once at the top of every tick.
    TickStarted {
        worker_id: String,
        state: String,
        transition: Option<String>,
        task_count: usize,
    },
    /// Emitted once at the end of every tick, success or caught error.
    TickCompleted {
        worker_id: String,
        next_state: String,
        duration_ms: u64,
    },
    /// No runnable task matched and the transition cannot run without one
    /// (§4.10 step 5d). Throttled by the worker loop to at most once per
    /// 60 seconds.
    NoTaskWaitHeartbeat { worker_id: String, state: String },
    /// A tick-local error was caught, logged, and swallowed (§7).
    TickErrorCaught { worker_id: String, message: String },
}

/// Events emitted by the Agent Session Driver (§4.8).
#[derive(Debug, Clone)]
pub enum AgentSessionEvent {
    SessionStarted {
        transition: String,
        profile: String,
        runtime: String,
    },
    ToolCallObserved {
        title: String,
        is_mcp: bool,
    },
    /// One of the four §4.8 correctness retries fired.
    CorrectnessRetry {
        reason: String,
        attempt: u32,
    },
    SessionAborted {
        reason: String,
    },
    SessionCompleted {
        stop_reason: String,
        text_len: usize,
    },
}

/// Events emitted by the QA Preflight runner and Procedural QA Synthesizer
/// (§4.4, §4.5).
#[derive(Debug, Clone)]
pub enum QaEvent {
    PreflightStarted { stage: String },
    PreflightCompleted { stage: String, pass: bool },
    ProceduralSummary { stage: String, summary: String },
}

/// Single callback surface for all orchestrator observability. All methods
/// default to no-ops so handlers only implement what they need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_worker_event(&self, _event: &WorkerEvent) {}
    async fn on_agent_session_event(&self, _event: &AgentSessionEvent) {}
    async fn on_qa_event(&self, _event: &QaEvent) {}
}

/// Default handler: renders every event through the `log` facade, matching
/// the §7 user-visible behavior contract (one line per tick, `[ACP] ...` for
/// retries/aborts, a rendered summary for procedural QA).
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_worker_event(&self, event: &WorkerEvent) {
        match event {
            WorkerEvent::TickStarted {
                worker_id,
                state,
                transition,
                task_count,
            } => {
                log::info!(
                    "worker={} state={} transition={} tasks={}",
                    worker_id,
                    state,
                    transition.as_deref().unwrap_or("<none>"),
                    task_count
                );
            }
            WorkerEvent::TickCompleted {
                worker_id,
                next_state,
                duration_ms,
            } => {
                log::debug!(
                    "worker={} tick complete next_state={} duration_ms={}",
                    worker_id,
                    next_state,
                    duration_ms
                );
            }
            WorkerEvent::NoTaskWaitHeartbeat { worker_id, state } => {
                log::info!("worker={} state={} waiting for a runnable task", worker_id, state);
            }
            WorkerEvent::TickErrorCaught { worker_id, message } => {
                log::warn!("worker={} tick error (swallowed): {}", worker_id, message);
            }
        }
    }

    async fn on_agent_session_event(&self, event: &AgentSessionEvent) {
        match event {
            AgentSessionEvent::SessionStarted { transition, profile, runtime } => {
                log::info!(
                    "[ACP] starting session transition={} profile={} runtime={}",
                    transition,
                    profile,
                    runtime
                );
            }
            AgentSessionEvent::ToolCallObserved { title, is_mcp } => {
                log::debug!("[ACP] tool_call title={} mcp={}", title, is_mcp);
            }
            AgentSessionEvent::CorrectnessRetry { reason, attempt } => {
                log::warn!("[ACP] correctness retry #{}: {}", attempt, reason);
            }
            AgentSessionEvent::SessionAborted { reason } => {
                log::error!("[ACP] session aborted: {}", reason);
            }
            AgentSessionEvent::SessionCompleted { stop_reason, text_len } => {
                log::info!("[ACP] session complete stop_reason={} text_len={}", stop_reason, text_len);
            }
        }
    }

    async fn on_qa_event(&self, event: &QaEvent) {
        match event {
            QaEvent::PreflightStarted { stage } => log::info!("preflight stage={} started", stage),
            QaEvent::PreflightCompleted { stage, pass } => {
                log::info!("preflight stage={} pass={}", stage, pass)
            }
            QaEvent::ProceduralSummary { stage, summary } => {
                log::info!("procedural qa stage={}: {}", stage, summary)
            }
        }
    }
}

/// A handler that drops every event. Useful in tests that don't care about
/// observability.
pub struct NoopEventHandler;

#[async_trait]
impl EventHandler for NoopEventHandler {}
