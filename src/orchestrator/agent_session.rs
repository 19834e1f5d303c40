//! Agent Session Driver (§4.8): spawns an agent-runtime subprocess,
//! establishes a JSON-RPC-over-stdio session, submits one prompt turn,
//! consumes the `session/update` event stream, and enforces bounded
//! tool-call correctness retries on the same session.
//!
//! Grounded on a bounded tool-iteration loop in the style of an in-process
//! agent send loop (event-emission-per-step, a hard iteration cap) and
//! similar message/tool-call-parsing shapes, retargeted from an in-process
//! LLM HTTP call onto a subprocess speaking line-delimited JSON-RPC — the
//! transport plumbing itself follows
//! [`crate::orchestrator::preflight::ShellCommandRunner`]'s
//! spawn/capture/timeout/kill discipline.

use crate::orchestrator::error::RpcError;
use crate::orchestrator::event::{AgentSessionEvent, EventHandler};
use crate::orchestrator::prompt_builder::required_base_tools;
use crate::orchestrator::types::{ExecutionResult, McpServerDecl, RuntimeFlavor};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};

/// Transitions for which the bounded correctness enforcement (§4.8) is
/// skipped entirely: these never require an MCP task-manager call.
const MCP_EXEMPT_TRANSITIONS: [&str; 2] = ["review-task-validity", "pick-up-next-task"];

const MAX_CORRECTNESS_RETRIES: u32 = 3;
const TURN_WALL_CLOCK: Duration = Duration::from_secs(10 * 60);

/// One `session/update` notification observed during a turn (§4.8, §6).
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    ToolCall {
        #[allow(dead_code)]
        id: String,
        title: String,
        is_mcp: bool,
    },
    ToolCallUpdate {
        #[allow(dead_code)]
        id: String,
        #[allow(dead_code)]
        status: String,
    },
    AgentMessageChunk {
        text: String,
    },
    AgentThoughtChunk {
        #[allow(dead_code)]
        text: String,
    },
    SessionMeta {
        model_name: Option<String>,
        mcp_tool_names: Vec<String>,
    },
    TurnComplete {
        stop_reason: String,
    },
}

/// Everything one prompt turn needs to carry to the runtime (§4.8).
pub struct PromptRequest {
    pub prompt: String,
    /// `writeTextFile` capability granted iff the transition is agent-edit.
    pub can_write_files: bool,
    pub model: String,
    pub sandbox_policy: Option<String>,
    pub approval_policy: Option<String>,
    pub mcp_servers: Vec<McpServerDecl>,
}

/// Abstraction over one live agent-runtime RPC session, so the driver's
/// retry/accounting logic can be tested against a fake without spawning a
/// real subprocess (§A.4 of SPEC_FULL.md).
#[async_trait]
pub trait RpcSession: Send {
    async fn initialize(&mut self) -> Result<(), RpcError>;
    async fn submit_prompt(&mut self, request: &PromptRequest) -> Result<(), RpcError>;
    /// Returns the next notification, or `None` once the stream has closed.
    async fn next_update(&mut self) -> Result<Option<SessionUpdate>, RpcError>;
    /// Guaranteed to be called exactly once per session by the driver,
    /// regardless of how the turn ended (§4.8 "session cleanup").
    async fn shutdown(&mut self);
}

/// Spawns a fresh [`RpcSession`] for a given runtime flavor.
#[async_trait]
pub trait RpcSessionFactory: Send + Sync {
    async fn spawn(&self, flavor: RuntimeFlavor) -> Result<Box<dyn RpcSession>, RpcError>;
}

/// Real subprocess-backed session: line-delimited JSON-RPC over stdio,
/// grounded on `tools/bash.rs`'s `TokioCommand` spawn/pipe discipline.
pub struct SubprocessRpcSession {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    next_id: u64,
}

fn runtime_binary(flavor: RuntimeFlavor) -> &'static str {
    match flavor {
        RuntimeFlavor::Codex => "codex",
        RuntimeFlavor::Opencode => "opencode",
    }
}

impl SubprocessRpcSession {
    async fn spawn(flavor: RuntimeFlavor) -> Result<Self, RpcError> {
        let mut child = TokioCommand::new(runtime_binary(flavor))
            .arg("acp")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RpcError::Spawn(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| RpcError::Spawn("no stdin pipe".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| RpcError::Spawn("no stdout pipe".into()))?;

        Ok(SubprocessRpcSession {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        })
    }

    async fn write_line(&mut self, value: &serde_json::Value) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(value).map_err(|e| RpcError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.map_err(|e| RpcError::Io(e.to_string()))?;
        self.stdin.flush().await.map_err(|e| RpcError::Io(e.to_string()))
    }

    async fn read_line(&mut self) -> Result<Option<serde_json::Value>, RpcError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await.map_err(|e| RpcError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            return Ok(Some(serde_json::Value::Null));
        }
        serde_json::from_str(&line).map(Some).map_err(|e| RpcError::Protocol(e.to_string()))
    }
}

/// Parses a raw JSON-RPC frame into a [`SessionUpdate`], tolerating both
/// `functions.mcp__{server}__{tool}` and `{server}_{tool}` MCP tool-name
/// spellings (§6).
fn parse_notification(value: &serde_json::Value) -> Option<SessionUpdate> {
    let method = value.get("method")?.as_str()?;
    let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);
    match method {
        "session/update" => {
            let update_type = params.get("type")?.as_str()?;
            match update_type {
                "tool_call" => {
                    let title = params.get("title")?.as_str()?.to_string();
                    let id = params.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let is_mcp = title.contains("mcp__") || title.contains("mcp_");
                    Some(SessionUpdate::ToolCall { id, title, is_mcp })
                }
                "tool_call_update" => Some(SessionUpdate::ToolCallUpdate {
                    id: params.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    status: params.get("status").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                }),
                "agent_message_chunk" => Some(SessionUpdate::AgentMessageChunk {
                    text: params.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                }),
                "agent_thought_chunk" => Some(SessionUpdate::AgentThoughtChunk {
                    text: params.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                }),
                "session_meta" => Some(SessionUpdate::SessionMeta {
                    model_name: params
                        .get("model")
                        .or_else(|| params.get("modelName"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    mcp_tool_names: params
                        .get("mcpTools")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
                        .unwrap_or_default(),
                }),
                "turn_complete" => Some(SessionUpdate::TurnComplete {
                    stop_reason: params.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

#[async_trait]
impl RpcSession for SubprocessRpcSession {
    async fn initialize(&mut self) -> Result<(), RpcError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_line(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": { "clientCapabilities": { "readTextFile": true } },
        }))
        .await?;
        // Drain lines until we see the matching response id, tolerating any
        // interleaved notifications the runtime sends before its reply.
        loop {
            match self.read_line().await? {
                None => return Err(RpcError::Protocol("runtime closed stdout during initialize".into())),
                Some(v) => {
                    if v.get("id").and_then(|v| v.as_u64()) == Some(id) {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn submit_prompt(&mut self, request: &PromptRequest) -> Result<(), RpcError> {
        let id = self.next_id;
        self.next_id += 1;
        let fs_caps = serde_json::json!({
            "readTextFile": true,
            "writeTextFile": request.can_write_files,
        });
        self.write_line(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "prompt",
            "params": {
                "prompt": request.prompt,
                "fsCapabilities": fs_caps,
                "model": request.model,
                "sandboxPolicy": request.sandbox_policy,
                "approvalPolicy": request.approval_policy,
                "mcpServers": request.mcp_servers.iter().map(|s| serde_json::json!({
                    "name": s.name,
                    "transport": s.transport,
                    "endpointOrCommand": s.endpoint_or_command,
                })).collect::<Vec<_>>(),
            },
        }))
        .await
    }

    async fn next_update(&mut self) -> Result<Option<SessionUpdate>, RpcError> {
        loop {
            match self.read_line().await? {
                None => return Ok(None),
                Some(v) => {
                    if v.is_null() {
                        continue;
                    }
                    if let Some(update) = parse_notification(&v) {
                        return Ok(Some(update));
                    }
                    // A request/response frame unrelated to session/update
                    // (e.g. the initialize reply arriving late); keep reading.
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Spawns [`SubprocessRpcSession`]s for the real runtime binaries.
pub struct SubprocessRpcSessionFactory;

#[async_trait]
impl RpcSessionFactory for SubprocessRpcSessionFactory {
    async fn spawn(&self, flavor: RuntimeFlavor) -> Result<Box<dyn RpcSession>, RpcError> {
        Ok(Box::new(SubprocessRpcSession::spawn(flavor).await?))
    }
}

/// Outcome of one driven turn, including any correctness retries folded in
/// (§4.8, §4.9). This is the input the dispatcher turns into an
/// [`ExecutionResult`] plus context patch.
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub model_name: Option<String>,
    pub stop_reason: String,
    pub tool_call_titles: Vec<String>,
    pub mcp_tool_call_count: u32,
    pub non_mcp_tool_call_count: u32,
    pub retries_used: u32,
}

impl TurnCompletion {
    pub fn to_execution_result(&self) -> ExecutionResult {
        ExecutionResult {
            success: self.success,
            output: self.output.clone(),
            error: self.error.clone(),
            summary: extract_summary(&self.output),
        }
    }
}

/// Pulls a trailing `Summary:` line out of agent output, if present (§4.7
/// step 13 requires one be present on non-exempt transitions).
pub fn extract_summary(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let trimmed = line.trim();
        trimmed.strip_prefix("Summary:").map(|s| s.trim().to_string())
    })
}

const RESOURCE_DISCOVERY_SUFFIXES: [&str; 3] = ["list_mcp_resources", "read_mcp_resource", "_templates"];

fn is_resource_discovery_title(title: &str) -> bool {
    RESOURCE_DISCOVERY_SUFFIXES.iter().any(|suffix| title.contains(suffix))
}

/// §4.8 retry #1: the output text claims MCP tools are missing/unavailable
/// while exact names are in fact declared.
fn asserts_tools_missing(output: &str) -> bool {
    let lower = output.to_lowercase();
    let mentions_tool = lower.contains("mcp") || lower.contains("tool");
    let mentions_absence = lower.contains("missing") || lower.contains("unavailable") || lower.contains("not available");
    mentions_tool && mentions_absence
}

fn observed_required_call(titles: &[String], required: &[&str]) -> bool {
    titles.iter().any(|title| required.iter().any(|r| title.contains(r)))
}

fn only_resource_discovery_calls(titles: &[String], mcp_call_seen: bool) -> bool {
    mcp_call_seen && titles.iter().all(|t| is_resource_discovery_title(t))
}

/// Accumulated state across one base submission plus its correction resubmits.
struct TurnAccumulator {
    text: String,
    tool_call_titles: Vec<String>,
    mcp_titles: Vec<String>,
    mcp_tool_call_count: u32,
    non_mcp_tool_call_count: u32,
    model_name: Option<String>,
    stop_reason: Option<String>,
}

impl TurnAccumulator {
    fn new() -> Self {
        TurnAccumulator {
            text: String::new(),
            tool_call_titles: Vec::new(),
            mcp_titles: Vec::new(),
            mcp_tool_call_count: 0,
            non_mcp_tool_call_count: 0,
            model_name: None,
            stop_reason: None,
        }
    }

    fn apply(&mut self, update: SessionUpdate, events: &Arc<dyn EventHandler>) {
        match update {
            SessionUpdate::ToolCall { title, is_mcp, .. } => {
                self.tool_call_titles.push(title.clone());
                if is_mcp {
                    self.mcp_tool_call_count += 1;
                    self.mcp_titles.push(title.clone());
                } else {
                    self.non_mcp_tool_call_count += 1;
                }
                let handler = events.clone();
                let title_for_event = title;
                tokio::spawn(async move {
                    handler.on_agent_session_event(&AgentSessionEvent::ToolCallObserved { title: title_for_event, is_mcp }).await;
                });
            }
            SessionUpdate::AgentMessageChunk { text } => self.text.push_str(&text),
            SessionUpdate::SessionMeta { model_name, .. } => {
                if model_name.is_some() {
                    self.model_name = model_name;
                }
            }
            SessionUpdate::TurnComplete { stop_reason } => self.stop_reason = Some(stop_reason),
            SessionUpdate::ToolCallUpdate { .. } | SessionUpdate::AgentThoughtChunk { .. } => {}
        }
    }
}

/// Drains `session.next_update()` until a `TurnComplete` notification or the
/// turn's remaining wall-clock budget elapses (§4.8).
async fn drain_turn(session: &mut dyn RpcSession, acc: &mut TurnAccumulator, events: &Arc<dyn EventHandler>, budget: Duration) -> Result<(), RpcError> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(RpcError::Timeout);
        }
        match tokio::time::timeout(remaining, session.next_update()).await {
            Err(_) => return Err(RpcError::Timeout),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(update))) => {
                let is_turn_complete = matches!(update, SessionUpdate::TurnComplete { .. });
                acc.apply(update, events);
                if is_turn_complete {
                    return Ok(());
                }
            }
        }
    }
}

/// Drives a single agent-runtime turn end to end (§4.8): spawn, initialize,
/// submit, drain events, then — on the same session — resubmit up to
/// [`MAX_CORRECTNESS_RETRIES`] correction prompts until a required
/// task-manager tool call is observed, or give up and report failure.
pub struct AgentSessionDriver {
    factory: Arc<dyn RpcSessionFactory>,
    events: Arc<dyn EventHandler>,
    turn_wall_clock: Duration,
}

impl AgentSessionDriver {
    pub fn new(factory: Arc<dyn RpcSessionFactory>, events: Arc<dyn EventHandler>) -> Self {
        AgentSessionDriver {
            factory,
            events,
            turn_wall_clock: TURN_WALL_CLOCK,
        }
    }

    #[cfg(test)]
    fn with_wall_clock(mut self, d: Duration) -> Self {
        self.turn_wall_clock = d;
        self
    }

    pub async fn run_turn(&self, flavor: RuntimeFlavor, transition: &str, request: PromptRequest) -> TurnCompletion {
        self.events
            .on_agent_session_event(&AgentSessionEvent::SessionStarted {
                transition: transition.to_string(),
                profile: String::new(),
                runtime: format!("{:?}", flavor),
            })
            .await;

        let mut session = match self.factory.spawn(flavor).await {
            Ok(s) => s,
            Err(e) => {
                return TurnCompletion {
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    model_name: None,
                    stop_reason: "spawn-failed".to_string(),
                    tool_call_titles: vec![],
                    mcp_tool_call_count: 0,
                    non_mcp_tool_call_count: 0,
                    retries_used: 0,
                };
            }
        };

        let completion = self.drive(session.as_mut(), transition, request).await;
        session.shutdown().await;
        completion
    }

    async fn drive(&self, session: &mut dyn RpcSession, transition: &str, request: PromptRequest) -> TurnCompletion {
        if let Err(e) = session.initialize().await {
            return failed_completion(e.to_string());
        }
        if let Err(e) = session.submit_prompt(&request).await {
            return failed_completion(e.to_string());
        }

        let mut acc = TurnAccumulator::new();
        if let Err(e) = drain_turn(session, &mut acc, &self.events, self.turn_wall_clock).await {
            return failed_completion(e.to_string());
        }

        let mcp_exempt = MCP_EXEMPT_TRANSITIONS.contains(&transition);
        let required = required_base_tools(transition);
        let mut retries_used = 0u32;

        while retries_used < MAX_CORRECTNESS_RETRIES {
            let correction = if asserts_tools_missing(&acc.text) && !acc.mcp_titles.is_empty() {
                Some(format!(
                    "Your last response claimed MCP tools are missing or unavailable, but these exact tool names are visible in the advertised tool list: {}. Proceed using those exact names; do not claim they are missing.",
                    acc.mcp_titles.join(", ")
                ))
            } else if !mcp_exempt && !required.is_empty() && !acc.mcp_titles.is_empty() && !observed_required_call(&acc.tool_call_titles, &required) {
                Some(format!(
                    "This transition requires invoking one of: {}. No such call was observed. Invoke the exact tool name now.",
                    required.join(", ")
                ))
            } else if only_resource_discovery_calls(&acc.tool_call_titles, !acc.mcp_titles.is_empty()) {
                Some(
                    "Only resource-discovery calls (list_mcp_resources / read_mcp_resource / *_templates) were observed. \
                     These do not satisfy the task-manager operation this transition requires. Invoke the required \
                     task-manager tool now."
                        .to_string(),
                )
            } else {
                None
            };

            let Some(correction_prompt) = correction else { break };
            retries_used += 1;
            self.events
                .on_agent_session_event(&AgentSessionEvent::CorrectnessRetry {
                    reason: correction_prompt.clone(),
                    attempt: retries_used,
                })
                .await;

            let retry_request = PromptRequest {
                prompt: correction_prompt,
                ..request_clone(&request)
            };
            if session.submit_prompt(&retry_request).await.is_err() {
                break;
            }
            if drain_turn(session, &mut acc, &self.events, self.turn_wall_clock).await.is_err() {
                break;
            }
        }

        // §4.8 step 4: final enforcement.
        if !mcp_exempt && !required.is_empty() && !acc.mcp_titles.is_empty() && !observed_required_call(&acc.tool_call_titles, &required) {
            let msg = format!(
                "required task-manager operation not invoked after {} retries; required one of: {}; observed tool calls: {}",
                retries_used,
                required.join(", "),
                acc.tool_call_titles.join(", ")
            );
            self.events.on_agent_session_event(&AgentSessionEvent::SessionAborted { reason: msg.clone() }).await;
            return TurnCompletion {
                success: false,
                output: acc.text,
                error: Some(msg),
                model_name: acc.model_name,
                stop_reason: acc.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
                tool_call_titles: acc.tool_call_titles,
                mcp_tool_call_count: acc.mcp_tool_call_count,
                non_mcp_tool_call_count: acc.non_mcp_tool_call_count,
                retries_used,
            };
        }

        let stop_reason = acc.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string());
        if stop_reason == "end_turn" && acc.text.trim().is_empty() {
            let msg = "runtime ended the turn without output (probable invalid or unavailable model)".to_string();
            self.events.on_agent_session_event(&AgentSessionEvent::SessionAborted { reason: msg.clone() }).await;
            return TurnCompletion {
                success: false,
                output: acc.text,
                error: Some(msg),
                model_name: acc.model_name,
                stop_reason,
                tool_call_titles: acc.tool_call_titles,
                mcp_tool_call_count: acc.mcp_tool_call_count,
                non_mcp_tool_call_count: acc.non_mcp_tool_call_count,
                retries_used,
            };
        }

        self.events
            .on_agent_session_event(&AgentSessionEvent::SessionCompleted {
                stop_reason: stop_reason.clone(),
                text_len: acc.text.len(),
            })
            .await;

        TurnCompletion {
            success: true,
            output: acc.text,
            error: None,
            model_name: acc.model_name,
            stop_reason,
            tool_call_titles: acc.tool_call_titles,
            mcp_tool_call_count: acc.mcp_tool_call_count,
            non_mcp_tool_call_count: acc.non_mcp_tool_call_count,
            retries_used,
        }
    }
}

fn failed_completion(error: String) -> TurnCompletion {
    TurnCompletion {
        success: false,
        output: String::new(),
        error: Some(error),
        model_name: None,
        stop_reason: "error".to_string(),
        tool_call_titles: vec![],
        mcp_tool_call_count: 0,
        non_mcp_tool_call_count: 0,
        retries_used: 0,
    }
}

fn request_clone(request: &PromptRequest) -> PromptRequest {
    PromptRequest {
        prompt: request.prompt.clone(),
        can_write_files: request.can_write_files,
        model: request.model.clone(),
        sandbox_policy: request.sandbox_policy.clone(),
        approval_policy: request.approval_policy.clone(),
        mcp_servers: request.mcp_servers.clone(),
    }
}
