//! Data model shared across the orchestrator core (see §3 of the design doc).
//!
//! These are plain data types — no behavior beyond constructors and the
//! occasional derived predicate. Components that own a type are documented
//! on the type itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Runtime flavor an agent session is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFlavor {
    Codex,
    Opencode,
}

/// One declared MCP server entry on a [`Profile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDecl {
    pub name: String,
    pub transport: String,
    /// Endpoint URL, or a `command args...` string when transport is a subprocess.
    pub endpoint_or_command: String,
    pub tool_base_names: Vec<String>,
}

/// A named agent persona: system prompt, default model, declared tool set.
///
/// Owned by the Profile Registry. Profiles differ only in data — the
/// task-prompt builder is a plain function pointer, never a trait impl, so
/// that adding a profile never requires a new type (§9 design note).
#[derive(Clone)]
pub struct Profile {
    pub name: String,
    pub role_label: String,
    pub capabilities: Vec<String>,
    pub concurrency_cap: u32,
    /// Lower = higher strategic rank.
    pub priority: u32,
    pub default_runtime: RuntimeFlavor,
    pub default_model: String,
    pub default_system_prompt: String,
    pub task_prompt_builder: fn(&WorkflowContext) -> String,
    pub mcp_servers: Vec<McpServerDecl>,
    pub sandbox_hint: Option<String>,
}

impl Profile {
    pub fn declared_tool_base_names(&self) -> Vec<String> {
        self.mcp_servers
            .iter()
            .flat_map(|s| s.tool_base_names.iter().cloned())
            .collect()
    }
}

/// Persisted override for one profile name (§3). An override record with
/// every field `None` is meaningless and the store deletes it on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOverride {
    pub profile_name: String,
    pub runtime: Option<RuntimeFlavor>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub task_prompt_prefix: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileOverride {
    /// An override with no field set carries no information; the store
    /// treats writing one as a deletion (§4.1).
    pub fn is_empty(&self) -> bool {
        self.runtime.is_none()
            && self.model.is_none()
            && self.system_prompt.is_none()
            && self.task_prompt_prefix.is_none()
    }
}

/// One entry in a profile's rolling last-100 processing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

/// In-memory, per-profile runtime state (§3). Never persisted.
#[derive(Debug, Clone)]
pub struct ProfileState {
    pub active: bool,
    pub in_flight: u32,
    pub completed: u64,
    pub failed: u64,
    pub history: Vec<ProcessingRecord>,
    pub queue_size: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ProfileState {
    const HISTORY_CAP: usize = 100;

    pub fn new() -> Self {
        ProfileState {
            active: true,
            in_flight: 0,
            completed: 0,
            failed: 0,
            history: Vec::new(),
            queue_size: 0,
            last_activity: None,
        }
    }

    pub fn record(&mut self, duration_ms: u64, success: bool) {
        self.history.push(ProcessingRecord {
            timestamp: Utc::now(),
            duration_ms,
            success,
        });
        if self.history.len() > Self::HISTORY_CAP {
            let overflow = self.history.len() - Self::HISTORY_CAP;
            self.history.drain(0..overflow);
        }
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.last_activity = Some(Utc::now());
    }

    pub fn moving_average_ms(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.history.iter().map(|r| r.duration_ms).sum();
        sum as f64 / self.history.len() as f64
    }
}

impl Default for ProfileState {
    fn default() -> Self {
        Self::new()
    }
}

/// Task priority (§3). Ordered `High > Medium > Low > Unspecified` by the
/// Task Selector's sort step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    Unspecified,
    Low,
    Medium,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Unspecified
    }
}

/// Task type (§3). `Implementation` and `Task` are treated as aliases by the
/// selector, as are `Testing` and `Integration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Theme,
    Initiative,
    Feature,
    Story,
    Implementation,
    Task,
    Testing,
    Integration,
}

impl TaskType {
    /// True if `self` and `other` should be treated as the same target type
    /// by the Task Selector (§4.3: implementation/task and testing/integration
    /// aliased).
    pub fn aliases(&self, other: TaskType) -> bool {
        use TaskType::*;
        if *self == other {
            return true;
        }
        matches!(
            (*self, other),
            (Implementation, Task)
                | (Task, Implementation)
                | (Testing, Integration)
                | (Integration, Testing)
        )
    }
}

/// Task status (§3). `todo|in-progress|done|invalid` plus reserved aliases
/// are represented as a closed enum; unknown wire values deserialize into
/// `Other` rather than failing, since the Task DB is an external collaborator
/// that may introduce aliases this core does not need to reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Invalid,
    #[serde(other)]
    Other,
}

/// A unit of work tracked by the external Task DB (§3, consumed via
/// [`crate::orchestrator::task_store::TaskStore`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub dependency_ids: Vec<String>,
    pub branch: Option<String>,
    pub assigned_profile_id: Option<String>,
    pub action_log: Vec<JsonValue>,
}

impl Task {
    /// §3 invariant: a task is "runnable" iff type∈{implementation,task} ∧
    /// status∈{todo,in-progress} ∧ all dependencies are `done` or `invalid`.
    pub fn is_runnable(&self, all_tasks: &HashMap<String, Task>) -> bool {
        let type_ok = matches!(self.task_type, TaskType::Implementation | TaskType::Task);
        let status_ok = matches!(self.status, TaskStatus::Todo | TaskStatus::InProgress);
        type_ok && status_ok && self.dependencies_satisfied(all_tasks)
    }

    pub fn dependencies_satisfied(&self, all_tasks: &HashMap<String, Task>) -> bool {
        self.dependency_ids.iter().all(|dep_id| {
            all_tasks
                .get(dep_id)
                .map(|t| matches!(t.status, TaskStatus::Done | TaskStatus::Invalid))
                .unwrap_or(false)
        })
    }

    /// A "text-incomplete" task per §4.3's `selectInvalidTaskForClosure`:
    /// empty or placeholder description.
    pub fn is_text_incomplete(&self) -> bool {
        let d = self.description.trim();
        d.is_empty() || d.eq_ignore_ascii_case("todo") || d.eq_ignore_ascii_case("tbd")
    }
}

/// Pass/fail status of the last recorded test run (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Structured test report written into the workflow context (§3, §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub failed_tests: Vec<String>,
    pub repro_steps: Vec<String>,
    pub suspected_root_cause: String,
    pub notes: String,
}

/// A durable JSON map keyed by `contextId` (§3). Well-known keys are
/// schema-checked accessors; anything else lives in the `extra` bag (§9
/// design note: "tagged sum of known keys plus an extension bag").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub context_id: String,
    pub current_task_id: Option<String>,
    pub current_task: Option<JsonValue>,
    pub current_task_branch: Option<String>,
    pub last_test_result: Option<JsonValue>,
    pub test_status: Option<TestStatus>,
    pub test_report: Option<TestReport>,
    pub e2e_test_result_status: Option<String>,
    pub e2e_test_results: Option<JsonValue>,
    pub e2e_test_failure_investigation_report: Option<String>,
    pub mechanical_qa_preflight_results: Option<JsonValue>,
    pub mechanical_qa_preflight_stage: Option<String>,
    pub mechanical_qa_preflight_updated_at: Option<DateTime<Utc>>,
    pub auto_recovered: bool,
    #[serde(default)]
    pub extra: HashMap<String, JsonValue>,
}

impl WorkflowContext {
    pub fn new(context_id: impl Into<String>) -> Self {
        WorkflowContext {
            context_id: context_id.into(),
            ..Default::default()
        }
    }

    /// Clears every key the §8 `tests-passing` invariant names: all
    /// test-result/e2e/mechanical keys plus the current-task triple.
    pub fn clear_task_and_test_keys(&mut self) {
        self.current_task_id = None;
        self.current_task = None;
        self.current_task_branch = None;
        self.last_test_result = None;
        self.test_status = None;
        self.test_report = None;
        self.e2e_test_result_status = None;
        self.e2e_test_results = None;
        self.e2e_test_failure_investigation_report = None;
        self.mechanical_qa_preflight_results = None;
        self.mechanical_qa_preflight_stage = None;
        self.mechanical_qa_preflight_updated_at = None;
    }
}

/// Result of one shell command run by the QA Preflight runner (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub label: String,
    pub command: String,
    /// `None` if the process errored before producing an exit code.
    pub exit_code: Option<i32>,
    pub stdout_preview: String,
    pub stderr_preview: String,
    pub stdout_full: String,
    pub stderr_full: String,
    pub error_message: Option<String>,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of a QA Preflight run for one stage (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightResult {
    pub stage: String,
    pub pass: bool,
    pub command_results: Vec<CommandResult>,
    pub rendered_aggregate: String,
}

/// A synthesized, non-LLM execution outcome plus its context patch and
/// report (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduralQaReport {
    pub transition: String,
    pub stage_label: String,
    pub status: TestStatus,
    pub summary: String,
    pub full_output: String,
    pub test_report: TestReport,
    pub command_results: Vec<CommandResult>,
    pub coverage_sub_report: Option<JsonValue>,
}

/// The result of running one agent-session turn, whether produced by a real
/// runtime subprocess or synthesized procedurally (§4.5, §4.8, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub summary: Option<String>,
}

/// A worker's handle on a workflow run: the only thing persisted per-worker
/// beyond the contextId (§4.10 step 8 — state is derivable from context on
/// restart, so the token itself need not be durable).
#[derive(Debug, Clone)]
pub struct WorkflowToken {
    pub state: String,
    pub context_id: String,
}
