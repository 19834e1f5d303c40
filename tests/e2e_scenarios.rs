//! Integration tests for the six literal end-to-end scenarios: each wires a
//! real `Dispatcher` to in-memory stores, a scripted command runner, and a
//! scripted agent-runtime session, then drives one or more `dispatch` calls
//! the way a `WorkerLoop` tick would.

use agentflow::orchestrator::agent_session::{AgentSessionDriver, PromptRequest, RpcSession, RpcSessionFactory, SessionUpdate};
use agentflow::orchestrator::branch_manager::BranchManager;
use agentflow::orchestrator::builtin::builtin_profiles;
use agentflow::orchestrator::context_store::{ContextStore, InMemoryContextStore};
use agentflow::orchestrator::error::RpcError;
use agentflow::orchestrator::event::NoopEventHandler;
use agentflow::orchestrator::preflight::CommandRunner;
use agentflow::orchestrator::profile::ProfileRegistry;
use agentflow::orchestrator::task_store::{InMemoryTaskStore, TaskStore};
use agentflow::orchestrator::types::{CommandResult, RuntimeFlavor, Task, TaskPriority, TaskStatus, TaskType};
use agentflow::orchestrator::workflow_graph::{StateDef, TargetType, TransitionDef, WorkflowGraph};
use agentflow::Dispatcher;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;

fn feature_task(id: &str, priority: TaskPriority) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Feature {}", id),
        description: "a feature candidate".to_string(),
        priority,
        task_type: TaskType::Feature,
        status: TaskStatus::Todo,
        dependency_ids: vec![],
        branch: None,
        assigned_profile_id: None,
        action_log: vec![],
    }
}

fn story_task(id: &str, title: &str) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        description: "a user story".to_string(),
        priority: TaskPriority::High,
        task_type: TaskType::Story,
        status: TaskStatus::Todo,
        dependency_ids: vec![],
        branch: None,
        assigned_profile_id: None,
        action_log: vec![],
    }
}

fn implementation_task(id: &str, title: &str, status: TaskStatus, branch: Option<&str>) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        description: "an implementation task".to_string(),
        priority: TaskPriority::Medium,
        task_type: TaskType::Implementation,
        status,
        dependency_ids: vec![],
        branch: branch.map(|b| b.to_string()),
        assigned_profile_id: None,
        action_log: vec![],
    }
}

/// A `CommandRunner` that always returns the same scripted result, ignoring
/// which command string it was asked to run.
struct ScriptedRunner {
    result: CommandResult,
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str, _cwd: &Path, _timeout: Duration) -> CommandResult {
        CommandResult { label: command.to_string(), command: command.to_string(), ..self.result.clone() }
    }
}

/// One scripted agent-runtime session: replays a fixed update queue and
/// records the prompt it was asked to submit.
struct CapturingSession {
    updates: VecDeque<SessionUpdate>,
    captured_prompt: Arc<StdMutex<Option<String>>>,
}

#[async_trait]
impl RpcSession for CapturingSession {
    async fn initialize(&mut self) -> Result<(), RpcError> {
        Ok(())
    }
    async fn submit_prompt(&mut self, request: &PromptRequest) -> Result<(), RpcError> {
        *self.captured_prompt.lock().unwrap() = Some(request.prompt.clone());
        Ok(())
    }
    async fn next_update(&mut self) -> Result<Option<SessionUpdate>, RpcError> {
        Ok(self.updates.pop_front())
    }
    async fn shutdown(&mut self) {}
}

/// A factory that hands out one scripted session per queued turn, in order,
/// each one capturing the prompt it received into a slot the test can read
/// back after `dispatch` returns.
struct CapturingFactory {
    turns: StdMutex<VecDeque<Vec<SessionUpdate>>>,
    prompts: StdMutex<Vec<Arc<StdMutex<Option<String>>>>>,
    spawn_count: StdMutex<u32>,
}

impl CapturingFactory {
    fn new(turns: Vec<Vec<SessionUpdate>>) -> Self {
        CapturingFactory {
            turns: StdMutex::new(turns.into()),
            prompts: StdMutex::new(Vec::new()),
            spawn_count: StdMutex::new(0),
        }
    }

    fn prompt(&self, turn_index: usize) -> Option<String> {
        self.prompts.lock().unwrap().get(turn_index).and_then(|slot| slot.lock().unwrap().clone())
    }

    fn spawn_count(&self) -> u32 {
        *self.spawn_count.lock().unwrap()
    }
}

#[async_trait]
impl RpcSessionFactory for CapturingFactory {
    async fn spawn(&self, _flavor: RuntimeFlavor) -> Result<Box<dyn RpcSession>, RpcError> {
        *self.spawn_count.lock().unwrap() += 1;
        let updates = self.turns.lock().unwrap().pop_front().unwrap_or_default();
        let slot = Arc::new(StdMutex::new(None));
        self.prompts.lock().unwrap().push(slot.clone());
        Ok(Box::new(CapturingSession { updates: updates.into(), captured_prompt: slot }))
    }
}

fn single_transition_graph(state: &str, transition: &str, profile: &str, target_type: TargetType) -> WorkflowGraph {
    let states = vec![StateDef::new(state, profile)
        .with_target_type(target_type)
        .with_transition(transition, "next-state")];
    let transitions = vec![TransitionDef::new(transition).needs_task_snapshot()];
    WorkflowGraph::new(states, transitions)
}

struct Harness {
    dispatcher: Dispatcher,
    task_store: Arc<InMemoryTaskStore>,
    context_store: Arc<InMemoryContextStore>,
    factory: Arc<CapturingFactory>,
    #[allow(dead_code)]
    workspace: TempDir,
}

fn build_harness(graph: WorkflowGraph, tasks: Vec<Task>, preflight: CommandResult, agent_turns: Vec<Vec<SessionUpdate>>) -> Harness {
    let workspace = TempDir::new().unwrap();
    let task_store = Arc::new(InMemoryTaskStore::new(tasks));
    let context_store = Arc::new(InMemoryContextStore::new());
    let branch_manager = Arc::new(BranchManager::new(workspace.path()));
    let command_runner: Arc<dyn CommandRunner> = Arc::new(ScriptedRunner { result: preflight });
    let factory = Arc::new(CapturingFactory::new(agent_turns));
    let session_driver = Arc::new(AgentSessionDriver::new(factory.clone(), Arc::new(NoopEventHandler)));
    let profiles = Arc::new(ProfileRegistry::new_without_store(builtin_profiles()));
    let dispatcher = Dispatcher::new(
        Arc::new(graph),
        profiles,
        task_store.clone(),
        context_store.clone(),
        branch_manager,
        command_runner,
        session_driver,
        Arc::new(NoopEventHandler),
        workspace.path().to_path_buf(),
    );
    Harness { dispatcher, task_store, context_store, factory, workspace }
}

fn passing_preflight() -> CommandResult {
    CommandResult {
        label: String::new(),
        command: String::new(),
        exit_code: Some(0),
        stdout_preview: String::new(),
        stderr_preview: String::new(),
        stdout_full: String::new(),
        stderr_full: String::new(),
        error_message: None,
    }
}

fn run_git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git").args(args).current_dir(dir).status().unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn init_repo_on_main(dir: &Path) {
    run_git(dir, &["init"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "user.name", "Test"]);
    run_git(dir, &["commit", "--allow-empty", "-m", "init"]);
    run_git(dir, &["branch", "-m", "main"]);
}

fn current_branch(dir: &Path) -> String {
    let out = std::process::Command::new("git").args(["rev-parse", "--abbrev-ref", "HEAD"]).current_dir(dir).output().unwrap();
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Scenario 1 (§8): prioritize-features is handed a prefetched list of
/// exactly the three feature tasks and the orchestrator itself never
/// mutates the task store for this transition — any create/update comes
/// back through the external MCP server, not from this crate.
#[tokio::test]
async fn scenario_prioritize_features_prefetches_exact_three_tasks() {
    let graph = single_transition_graph("features-proposed", "prioritize-features", "prioritization-lead", TargetType::Feature);
    let tasks = vec![feature_task("f1", TaskPriority::High), feature_task("f2", TaskPriority::Low), feature_task("f3", TaskPriority::Medium)];
    let turn = vec![
        SessionUpdate::ToolCall { id: "1".into(), title: "functions.mcp__task-manager__update_task_priority".into(), is_mcp: true },
        SessionUpdate::AgentMessageChunk { text: "Top features: f1:high, f3:medium, f2:low\nSummary: ranked features".into() },
        SessionUpdate::TurnComplete { stop_reason: "end_turn".into() },
    ];
    let harness = build_harness(graph, tasks, passing_preflight(), vec![turn]);
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();

    let outcome = harness.dispatcher.dispatch("features-proposed", "prioritize-features", true, &context_id, None).await.unwrap();

    assert!(outcome.advance);
    let prompt = harness.factory.prompt(0).expect("agent turn must have submitted a prompt");
    assert!(prompt.contains("f1"));
    assert!(prompt.contains("f2"));
    assert!(prompt.contains("f3"));

    let remaining = harness.task_store.list_tasks().await.unwrap();
    assert_eq!(remaining.len(), 3, "the orchestrator never creates or removes tasks on its own for this transition");
}

/// Scenario 2 (§8): refine-into-tasks composes a prompt citing the selected
/// story and requires the full task-manager tool set.
#[tokio::test]
async fn scenario_refine_into_tasks_cites_the_selected_story() {
    let graph = single_transition_graph("stories-prioritized", "refine-into-tasks", "prioritization-lead", TargetType::Story);
    let s1 = story_task("s1", "Checkout should survive a network blip");
    let turn = vec![
        SessionUpdate::ToolCall { id: "1".into(), title: "functions.mcp__task-manager__create_task".into(), is_mcp: true },
        SessionUpdate::AgentMessageChunk { text: "Created t1..t4.\nSummary: split story into four tasks".into() },
        SessionUpdate::TurnComplete { stop_reason: "end_turn".into() },
    ];
    let harness = build_harness(graph, vec![s1.clone()], passing_preflight(), vec![turn]);
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();

    let outcome = harness.dispatcher.dispatch("stories-prioritized", "refine-into-tasks", false, &context_id, Some(&s1)).await.unwrap();

    assert!(outcome.advance);
    let prompt = harness.factory.prompt(0).unwrap();
    assert!(prompt.contains("id=s1"));
    assert!(prompt.contains("Checkout should survive a network blip"));
}

/// Scenario 3 (§8): begin-implementation originates
/// `implementation/42-fix-cache-eviction-bug`, checks it out, and persists
/// the branch plus in-progress status on the task.
#[tokio::test]
async fn scenario_begin_implementation_creates_and_persists_branch() {
    let graph = single_transition_graph("tasks-prepared", "begin-implementation", "senior-developer", TargetType::Implementation);
    let t42 = implementation_task("t42", "Fix cache eviction bug", TaskStatus::Todo, None);
    let turn = vec![
        SessionUpdate::ToolCall { id: "1".into(), title: "functions.mcp__task-manager__update_task_status".into(), is_mcp: true },
        SessionUpdate::AgentMessageChunk { text: "Starting work.\nSummary: kicked off implementation".into() },
        SessionUpdate::TurnComplete { stop_reason: "end_turn".into() },
    ];
    let harness = build_harness(graph, vec![t42.clone()], passing_preflight(), vec![turn]);
    init_repo_on_main(harness.workspace.path());
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();

    let outcome = harness.dispatcher.dispatch("tasks-prepared", "begin-implementation", false, &context_id, Some(&t42)).await.unwrap();

    assert!(outcome.advance);
    let updated = harness.task_store.get_task("t42").await.unwrap();
    assert_eq!(updated.branch.as_deref(), Some("implementation/42-fix-cache-eviction-bug"));
    assert_eq!(updated.status, TaskStatus::InProgress);
    assert_eq!(current_branch(harness.workspace.path()), "implementation/42-fix-cache-eviction-bug");
}

/// Scenario 4 (§8): a passing lint preflight never spawns an agent turn.
#[tokio::test]
async fn scenario_run_lint_pass_never_spawns_an_agent() {
    let graph = single_transition_graph("task-in-progress", "run-lint", "senior-developer", TargetType::Implementation);
    let harness = build_harness(graph, vec![], passing_preflight(), vec![]);
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();

    let outcome = harness.dispatcher.dispatch("task-in-progress", "run-lint", false, &context_id, None).await.unwrap();

    assert!(outcome.advance);
    assert_eq!(harness.factory.spawn_count(), 0);
}

/// Scenario 5 (§8): an e2e failure is recorded, then a two-phase
/// investigation + remediation turn runs against the failed context.
#[tokio::test]
async fn scenario_e2e_failure_triggers_investigation_then_remediation() {
    let states = vec![
        StateDef::new("unit-tests-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("run-e2e-tests", "e2e-tests-completed"),
        StateDef::new("e2e-tests-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("e2e-tests-failed", "task-in-progress"),
    ];
    let transitions = vec![
        TransitionDef::new("run-e2e-tests").needs_task_snapshot(),
        TransitionDef::new("e2e-tests-failed").with_profile_override("senior-developer").needs_task_snapshot(),
    ];
    let graph = WorkflowGraph::new(states, transitions);

    let playwright_output = "Running 3 tests\n1) [chromium] \u{203a} tests/checkout.spec.ts:12:3 \u{203a} user can pay\n2 passed, 1 failed";
    let failing_preflight = CommandResult {
        label: String::new(),
        command: String::new(),
        exit_code: Some(1),
        stdout_preview: playwright_output.to_string(),
        stderr_preview: String::new(),
        stdout_full: playwright_output.to_string(),
        stderr_full: String::new(),
        error_message: None,
    };

    let investigator_turn = vec![
        SessionUpdate::ToolCall { id: "1".into(), title: "functions.mcp__task-manager__update_context".into(), is_mcp: true },
        SessionUpdate::AgentMessageChunk { text: "Looked at the cart reducer.\nSummary: investigated".into() },
        SessionUpdate::TurnComplete { stop_reason: "end_turn".into() },
    ];
    let remediation_turn = vec![
        SessionUpdate::ToolCall { id: "1".into(), title: "functions.mcp__task-manager__update_context".into(), is_mcp: true },
        SessionUpdate::AgentMessageChunk { text: "Fixed the race.\nSummary: fixed checkout payment bug".into() },
        SessionUpdate::TurnComplete { stop_reason: "end_turn".into() },
    ];

    let harness = build_harness(graph, vec![], failing_preflight, vec![investigator_turn, remediation_turn]);
    std::fs::write(harness.workspace.path().join("playwright.config.ts"), "").unwrap();
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();

    let failed = harness.dispatcher.dispatch("unit-tests-completed", "run-e2e-tests", false, &context_id, None).await.unwrap();
    assert!(failed.advance);
    assert_eq!(failed.context.e2e_test_result_status.as_deref(), Some("FAILED"));
    assert!(failed
        .context
        .e2e_test_results
        .as_ref()
        .and_then(|v| v.get("failedTests"))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().any(|line| line.as_str().unwrap_or("").contains("checkout.spec.ts:12:3")))
        .unwrap_or(false));

    let remediated = harness.dispatcher.dispatch("e2e-tests-completed", "e2e-tests-failed", false, &context_id, None).await.unwrap();
    assert!(remediated.advance);
    assert_eq!(harness.factory.spawn_count(), 2);
    assert!(remediated.context.e2e_test_failure_investigation_report.as_ref().unwrap().contains("FAILED"));
    assert_eq!(remediated.execution.unwrap().summary.as_deref(), Some("fixed checkout payment bug"));
}

/// Scenario 6 (§8): tests-passing checks out main, closes the task, and
/// clears every test/e2e/mechanical key in the context.
#[tokio::test]
async fn scenario_tests_passing_closes_task_and_clears_context() {
    let graph = single_transition_graph("coverage-completed", "tests-passing", "senior-developer", TargetType::Testing);
    let t42 = implementation_task("t42", "Fix cache eviction bug", TaskStatus::InProgress, Some("implementation/42-fix-cache-eviction-bug"));
    let harness = build_harness(graph, vec![t42.clone()], passing_preflight(), vec![]);
    init_repo_on_main(harness.workspace.path());
    run_git(harness.workspace.path(), &["checkout", "-b", "implementation/42-fix-cache-eviction-bug"]);
    let context_id = harness.context_store.ensure_context_id(None).await.unwrap();
    harness
        .context_store
        .patch(&context_id, serde_json::json!({"currentTaskId": "t42", "testStatus": "passed"}))
        .await
        .unwrap();

    let outcome = harness.dispatcher.dispatch("coverage-completed", "tests-passing", false, &context_id, Some(&t42)).await.unwrap();

    assert!(outcome.advance);
    let closed = harness.task_store.get_task("t42").await.unwrap();
    assert_eq!(closed.status, TaskStatus::Done);
    assert!(closed.action_log.iter().any(|e| e.get("summary").and_then(|v| v.as_str()) == Some("tests passing; task closed")));
    assert!(outcome.context.current_task_id.is_none());
    assert!(outcome.context.test_status.is_none());
    assert_eq!(current_branch(harness.workspace.path()), "main");
}
