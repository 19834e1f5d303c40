//! Worker Loop (§4.10): one logical thread per worker. Each tick resolves
//! state from context, picks a transition, resolves a task (with optional
//! claim/lease), dispatches, advances `token.state`, sleeps, repeats.
//!
//! Grounded on the donor orchestration engine's run loop (`orchestration.rs`)
//! and `agent.rs`'s per-tick try/log/continue discipline: every tick is
//! wrapped so a caught error never kills the worker (§7).

use crate::orchestrator::context_store::ContextStore;
use crate::orchestrator::dispatcher::{is_qa_tracked, Dispatcher};
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::{EventHandler, WorkerEvent};
use crate::orchestrator::task_selector::{derive_state_from_tasks, select_task_for_state, SelectionInput};
use crate::orchestrator::task_store::TaskStore;
use crate::orchestrator::types::{Task, WorkflowToken};
use crate::orchestrator::workflow_graph::WorkflowGraph;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A callable that, given the current state, the task list, and the loaded
/// context, returns `(transition, isDecider)` (§4.10 step 3). Implemented as
/// a plain closure per the donor's polymorphism-via-data convention (§9).
pub type Decider = Arc<dyn Fn(&str, &[Task], &crate::orchestrator::types::WorkflowContext) -> Option<(String, bool)> + Send + Sync>;

const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const NO_TASK_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const AUTO_RECOVERY_GATED_STATES: [&str; 2] = ["themes-proposed", "new-feature-proposed"];

/// A stable worker identity (§4.10): `worker-{pid}-{8 random hex}`.
pub fn generate_worker_id() -> String {
    let pid = std::process::id();
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("worker-{}-{}", pid, suffix)
}

/// The builtin decider: looks up the current state's declared decider
/// transition in the workflow graph. Deployments that need smarter routing
/// (e.g. consulting an LLM to pick among siblings) can supply their own
/// [`Decider`] instead.
pub fn graph_decider(graph: Arc<WorkflowGraph>) -> Decider {
    Arc::new(move |state: &str, _tasks: &[Task], _context: &crate::orchestrator::types::WorkflowContext| {
        graph.state(state).and_then(|s| s.decider_transition.clone()).map(|t| (t, true))
    })
}

/// One worker's run loop (§4.10). Holds only what's needed to execute a tick;
/// all shared state (task store, context store, dispatcher, graph) is handed
/// in by `Arc` so many workers can share one set of backing stores.
pub struct WorkerLoop {
    worker_id: String,
    graph: Arc<WorkflowGraph>,
    task_store: Arc<dyn TaskStore>,
    context_store: Arc<dyn ContextStore>,
    dispatcher: Arc<Dispatcher>,
    decider: Decider,
    events: Arc<dyn EventHandler>,
    poll_interval: Duration,
    claim_mode: bool,
    last_no_task_heartbeat_ms: AtomicU64,
}

impl WorkerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: impl Into<String>,
        graph: Arc<WorkflowGraph>,
        task_store: Arc<dyn TaskStore>,
        context_store: Arc<dyn ContextStore>,
        dispatcher: Arc<Dispatcher>,
        decider: Decider,
        events: Arc<dyn EventHandler>,
        claim_mode: bool,
    ) -> Self {
        WorkerLoop {
            worker_id: worker_id.into(),
            graph,
            task_store,
            context_store,
            dispatcher,
            decider,
            events,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            claim_mode,
            last_no_task_heartbeat_ms: AtomicU64::new(0),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs forever, one tick per iteration, until `shutdown` resolves
    /// (signal handling, per §5: "outstanding sessions are torn down, the
    /// tick exits, and the loop stops at the next sleep boundary").
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut token: Option<WorkflowToken> = None;
        loop {
            if shutdown.try_recv().is_ok() {
                return;
            }
            let tick_start = std::time::Instant::now();
            match self.tick(&mut token).await {
                Ok(next_state) => {
                    self.events
                        .on_worker_event(&WorkerEvent::TickCompleted {
                            worker_id: self.worker_id.clone(),
                            next_state,
                            duration_ms: tick_start.elapsed().as_millis() as u64,
                        })
                        .await;
                }
                Err(e) => {
                    self.events
                        .on_worker_event(&WorkerEvent::TickErrorCaught {
                            worker_id: self.worker_id.clone(),
                            message: e.to_string(),
                        })
                        .await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => { return; }
            }
        }
    }

    /// One tick of §4.10. Returns the state the worker's token now sits at
    /// (for the `TickCompleted` event), or an error caught and logged by
    /// [`Self::run`].
    async fn tick(&self, token: &mut Option<WorkflowToken>) -> Result<String, OrchestratorError> {
        // Step 1: load tasks.
        let tasks = self.task_store.list_tasks().await?;

        // Step 2: resolve or create the workflow context; auto-recover a
        // fresh context's state exactly once.
        let context_id = self
            .context_store
            .ensure_context_id(token.as_ref().map(|t| t.context_id.as_str()))
            .await?;
        let mut context = self.context_store.load(&context_id).await?;

        let mut state = token
            .as_ref()
            .map(|t| t.state.clone())
            .unwrap_or_else(|| "themes-proposed".to_string());

        if !self.claim_mode && AUTO_RECOVERY_GATED_STATES.contains(&state.as_str()) && !context.auto_recovered {
            let derived = derive_state_from_tasks(&tasks);
            let mut patch = json!({ "autoRecovered": true });
            if let Some(task_id) = &derived.task_id {
                if let Some(task) = tasks.iter().find(|t| &t.id == task_id) {
                    patch["currentTaskId"] = json!(task_id);
                    patch["currentTask"] = serde_json::to_value(task).unwrap_or(serde_json::Value::Null);
                    patch["currentTaskBranch"] = json!(task.branch);
                }
            }
            context = self.context_store.patch(&context_id, patch).await?;
            state = derived.state;
        }

        // Step 3: invoke the decider.
        let Some((transition, is_decider)) = (self.decider)(&state, &tasks, &context) else {
            *token = Some(WorkflowToken { state: state.clone(), context_id: context_id.clone() });
            return Ok(state);
        };

        self.events
            .on_worker_event(&WorkerEvent::TickStarted {
                worker_id: self.worker_id.clone(),
                state: state.clone(),
                transition: Some(transition.clone()),
                task_count: tasks.len(),
            })
            .await;

        // Step 4: compute next state / target type.
        let next_state = self.graph.next_state(&state, &transition).unwrap_or_else(|| state.clone());
        let target_type = self.graph.target_type_for(&state, &transition);

        // Step 5: resolve the task.
        let mut excluded: HashSet<String> = HashSet::new();
        let prefer_preferred = is_qa_tracked(&transition);
        let mut effective_transition = transition.clone();
        let mut effective_next_state = next_state.clone();

        let task = loop {
            let candidate = select_task_for_state(SelectionInput {
                tasks: &tasks,
                target_type,
                preferred_task_id: context.current_task_id.as_deref(),
                prefer_preferred,
                restrict_in_progress_to_preferred: self.claim_mode,
                excluded_ids: &excluded,
            });

            let candidate = match candidate {
                Some(c) => Some(c),
                None => {
                    // Step 5b: begin-implementation with no implementation
                    // task ready falls through to need-more-tasks.
                    if effective_transition == "begin-implementation" && self.graph.transition_allowed(&state, "need-more-tasks") {
                        effective_transition = "need-more-tasks".to_string();
                        effective_next_state = self.graph.next_state(&state, &effective_transition).unwrap_or_else(|| state.clone());
                        select_task_for_state(SelectionInput {
                            tasks: &tasks,
                            target_type: self.graph.target_type_for(&state, &effective_transition),
                            preferred_task_id: context.current_task_id.as_deref(),
                            prefer_preferred,
                            restrict_in_progress_to_preferred: self.claim_mode,
                            excluded_ids: &excluded,
                        })
                    } else {
                        None
                    }
                }
            };

            if let Some(t) = candidate {
                if self.claim_mode {
                    match self.task_store.claim_task(&t.id, &self.worker_id).await? {
                        Ok(claimed) => break Some(claimed),
                        Err(_rejection) => {
                            excluded.insert(t.id.clone());
                            continue;
                        }
                    }
                }
                break Some(t);
            }

            // Step 5c: walk the fallback chain.
            if !self.graph.can_run_without_task(&effective_transition) {
                if let Some(fallback) = self.graph.fallback_transition(&state, &effective_transition) {
                    if fallback != effective_transition {
                        effective_transition = fallback;
                        effective_next_state = self.graph.next_state(&state, &effective_transition).unwrap_or_else(|| state.clone());
                        continue;
                    }
                }
                // Step 5d: no task matches and the transition cannot run
                // without one; emit a throttled heartbeat and give up this
                // tick.
                self.maybe_emit_no_task_heartbeat(&state).await;
                *token = Some(WorkflowToken { state: state.clone(), context_id: context_id.clone() });
                return Ok(state);
            }
            break None;
        };

        // Step 6: pick-up-next-task with no runnable implementation task
        // skips the tick entirely.
        if effective_transition == "pick-up-next-task" {
            let any_runnable = tasks.iter().any(|t| {
                t.is_runnable(&tasks.iter().map(|x| (x.id.clone(), x.clone())).collect())
            });
            if !any_runnable {
                *token = Some(WorkflowToken { state: state.clone(), context_id: context_id.clone() });
                return Ok(state);
            }
        }

        // Step 7: dispatch.
        let outcome = self
            .dispatcher
            .dispatch(&state, &effective_transition, is_decider, &context_id, task.as_ref())
            .await?;

        // Step 8: advance state (only on success; a failed agent turn keeps
        // the worker where the decider will observe the failure next tick,
        // per §7 AgentTurnFailure policy).
        let final_state = if outcome.advance { effective_next_state } else { state.clone() };
        *token = Some(WorkflowToken { state: final_state.clone(), context_id: context_id.clone() });
        let _ = outcome.context;
        Ok(final_state)
    }

    async fn maybe_emit_no_task_heartbeat(&self, state: &str) {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let last = self.last_no_task_heartbeat_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) >= NO_TASK_HEARTBEAT_INTERVAL.as_millis() as u64 {
            self.last_no_task_heartbeat_ms.store(now_ms, Ordering::Relaxed);
            self.events
                .on_worker_event(&WorkerEvent::NoTaskWaitHeartbeat {
                    worker_id: self.worker_id.clone(),
                    state: state.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::branch_manager::BranchManager;
    use crate::orchestrator::context_store::InMemoryContextStore;
    use crate::orchestrator::event::NoopEventHandler;
    use crate::orchestrator::preflight::CommandRunner;
    use crate::orchestrator::agent_session::{AgentSessionDriver, PromptRequest, RpcSession, RpcSessionFactory, SessionUpdate};
    use crate::orchestrator::error::RpcError;
    use crate::orchestrator::profile::ProfileRegistry;
    use crate::orchestrator::task_store::InMemoryTaskStore;
    use crate::orchestrator::types::{CommandResult, RuntimeFlavor, TaskPriority, TaskStatus, TaskType};
    use crate::orchestrator::workflow_graph::{StateDef, TargetType, TransitionDef};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn sample_task(id: &str, ttype: TaskType, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {}", id),
            description: "do the thing".to_string(),
            priority: TaskPriority::High,
            task_type: ttype,
            status,
            dependency_ids: vec![],
            branch: None,
            assigned_profile_id: None,
            action_log: vec![],
        }
    }

    struct AlwaysPassRunner;
    #[async_trait]
    impl CommandRunner for AlwaysPassRunner {
        async fn run(&self, command: &str, _cwd: &std::path::Path, _timeout: Duration) -> CommandResult {
            CommandResult {
                label: command.to_string(),
                command: command.to_string(),
                exit_code: Some(0),
                stdout_preview: String::new(),
                stderr_preview: String::new(),
                stdout_full: String::new(),
                stderr_full: String::new(),
                error_message: None,
            }
        }
    }

    struct EmptySession;
    #[async_trait]
    impl RpcSession for EmptySession {
        async fn initialize(&mut self) -> Result<(), RpcError> {
            Ok(())
        }
        async fn submit_prompt(&mut self, _r: &PromptRequest) -> Result<(), RpcError> {
            Ok(())
        }
        async fn next_update(&mut self) -> Result<Option<SessionUpdate>, RpcError> {
            Ok(None)
        }
        async fn shutdown(&mut self) {}
    }
    struct EmptyFactory;
    #[async_trait]
    impl RpcSessionFactory for EmptyFactory {
        async fn spawn(&self, _flavor: RuntimeFlavor) -> Result<Box<dyn RpcSession>, RpcError> {
            Ok(Box::new(EmptySession))
        }
    }

    fn test_dispatcher(graph: Arc<WorkflowGraph>, tasks: Vec<Task>) -> (Arc<Dispatcher>, Arc<InMemoryTaskStore>, Arc<InMemoryContextStore>, TempDir) {
        let workspace = TempDir::new().unwrap();
        let task_store = Arc::new(InMemoryTaskStore::new(tasks));
        let context_store = Arc::new(InMemoryContextStore::new());
        let branch_manager = Arc::new(BranchManager::new(workspace.path()));
        let command_runner: Arc<dyn CommandRunner> = Arc::new(AlwaysPassRunner);
        let factory: Arc<dyn RpcSessionFactory> = Arc::new(EmptyFactory);
        let session_driver = Arc::new(AgentSessionDriver::new(factory, Arc::new(NoopEventHandler)));
        let profiles = Arc::new(ProfileRegistry::new_without_store(crate::orchestrator::builtin::builtin_profiles()));
        let dispatcher = Arc::new(Dispatcher::new(
            graph,
            profiles,
            task_store.clone(),
            context_store.clone(),
            branch_manager,
            command_runner,
            session_driver,
            Arc::new(NoopEventHandler),
            workspace.path().to_path_buf(),
        ));
        (dispatcher, task_store, context_store, workspace)
    }

    #[tokio::test]
    async fn worker_id_is_stable_shape() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker-"));
        assert_eq!(id.split('-').count(), 3);
    }

    #[tokio::test]
    async fn empty_task_list_never_raises_and_sleeps_via_heartbeat() {
        let states = vec![StateDef::new("tasks-prepared", "senior-developer")
            .with_target_type(TargetType::Implementation)
            .with_transition("begin-implementation", "task-in-progress")
            .with_decider("begin-implementation")];
        let transitions = vec![TransitionDef::new("begin-implementation").needs_task_snapshot()];
        let graph = Arc::new(WorkflowGraph::new(states, transitions));
        let (dispatcher, task_store, context_store, _ws) = test_dispatcher(graph.clone(), vec![]);

        let worker = WorkerLoop::new(
            "worker-test",
            graph.clone(),
            task_store,
            context_store,
            dispatcher,
            graph_decider(graph),
            Arc::new(NoopEventHandler),
            false,
        );

        let mut token = None;
        let result = worker.tick(&mut token).await;
        assert!(result.is_ok());
        assert_eq!(token.unwrap().state, "tasks-prepared");
    }

    #[tokio::test]
    async fn unknown_state_with_no_decider_match_logs_and_sleeps() {
        let graph = Arc::new(WorkflowGraph::new(vec![], vec![]));
        let (dispatcher, task_store, context_store, _ws) = test_dispatcher(graph.clone(), vec![]);
        let worker = WorkerLoop::new(
            "worker-test",
            graph.clone(),
            task_store,
            context_store,
            dispatcher,
            graph_decider(graph),
            Arc::new(NoopEventHandler),
            false,
        );
        let mut token = None;
        let result = worker.tick(&mut token).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn control_transition_advances_state_and_clears_context() {
        let states = vec![
            StateDef::new("coverage-completed", "senior-developer")
                .with_target_type(TargetType::Testing)
                .with_transition("tests-passing", "tests-completed")
                .with_decider("tests-passing"),
        ];
        let transitions = vec![TransitionDef::new("tests-passing").needs_task_snapshot()];
        let graph = Arc::new(WorkflowGraph::new(states, transitions));

        let task = sample_task("t1", TaskType::Implementation, TaskStatus::InProgress);
        let (dispatcher, task_store, context_store, workspace) = test_dispatcher(graph.clone(), vec![task.clone()]);

        // tests-passing checks out "main"; give the tempdir a real repo with
        // a main branch so the Branch Manager's checkout succeeds.
        std::process::Command::new("git").args(["init", "-q"]).current_dir(workspace.path()).output().unwrap();
        std::process::Command::new("git").args(["config", "user.email", "a@b.c"]).current_dir(workspace.path()).output().unwrap();
        std::process::Command::new("git").args(["config", "user.name", "a"]).current_dir(workspace.path()).output().unwrap();
        std::fs::write(workspace.path().join("f.txt"), "x").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(workspace.path()).output().unwrap();
        std::process::Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(workspace.path()).output().unwrap();
        std::process::Command::new("git").args(["branch", "-M", "main"]).current_dir(workspace.path()).output().unwrap();

        let worker = WorkerLoop::new(
            "worker-test",
            graph.clone(),
            task_store.clone(),
            context_store.clone(),
            dispatcher,
            graph_decider(graph),
            Arc::new(NoopEventHandler),
            false,
        );

        let context_id = context_store.ensure_context_id(None).await.unwrap();
        context_store.patch(&context_id, json!({"currentTaskId": "t1"})).await.unwrap();
        let mut token = Some(WorkflowToken { state: "coverage-completed".to_string(), context_id: context_id.clone() });

        let result = worker.tick(&mut token).await.unwrap();
        assert_eq!(result, "tests-completed");

        let closed = task_store.get_task("t1").await.unwrap();
        assert_eq!(closed.status, TaskStatus::Done);
    }
}
