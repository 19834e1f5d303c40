//! Concrete built-in profiles and the default workflow graph (§3, §4.1,
//! §4.2, §9: "implement the richer [Profile Registry] variant"). Everything
//! here is plain data — no behavior beyond the task-prompt function pointers
//! — constructed once at process start and handed to
//! [`crate::orchestrator::profile::ProfileRegistry::new_with_store`] /
//! [`crate::orchestrator::workflow_graph::WorkflowGraph::new`].

use crate::orchestrator::types::{McpServerDecl, Profile, RuntimeFlavor, WorkflowContext};
use crate::orchestrator::workflow_graph::{StateDef, TargetType, TransitionDef, WorkflowGraph};

fn task_manager_server() -> McpServerDecl {
    McpServerDecl {
        name: "task-manager".to_string(),
        transport: "stdio".to_string(),
        endpoint_or_command: "task-manager-server".to_string(),
        tool_base_names: vec![
            "list_tasks".to_string(),
            "get_task".to_string(),
            "create_task".to_string(),
            "update_task".to_string(),
            "update_task_priority".to_string(),
            "update_task_status".to_string(),
            "get_file_context".to_string(),
            "update_context".to_string(),
        ],
    }
}

fn prioritization_task_prompt(_ctx: &WorkflowContext) -> String {
    "Review the prefetched task list for this target type. Rank by urgency and user impact. \
     Call update_task_priority only for tasks whose priority should change; never reorder tasks \
     that are already correctly ranked, and never create new tasks from this transition."
        .to_string()
}

fn refinement_task_prompt(ctx: &WorkflowContext) -> String {
    let subject = ctx
        .current_task
        .as_ref()
        .and_then(|t| t.get("title"))
        .and_then(|v| v.as_str())
        .unwrap_or("the selected story");
    format!(
        "Break \"{}\" down into concrete implementation tasks. Create one task per independently \
         shippable unit of work, then update the parent's dependency list to reference every task \
         you created.",
        subject
    )
}

fn senior_developer_task_prompt(ctx: &WorkflowContext) -> String {
    match &ctx.current_task {
        Some(task) => {
            let title = task.get("title").and_then(|v| v.as_str()).unwrap_or("the current task");
            format!(
                "Implement \"{}\" on the checked-out branch. Keep the change scoped to what the task \
                 describes. Run no test commands yourself — the QA preflight stages handle that.",
                title
            )
        }
        None => "Implement the selected task on the checked-out branch.".to_string(),
    }
}

fn qa_investigator_task_prompt(ctx: &WorkflowContext) -> String {
    let root_cause = ctx
        .test_report
        .as_ref()
        .map(|r| r.suspected_root_cause.as_str())
        .unwrap_or("unknown");
    format!(
        "Investigate the end-to-end test failure. Suspected root cause so far: \"{}\". Identify the \
         underlying defect (not just the failing assertion) and write your findings via \
         update_context under the key `e2eTestFailureInvestigationReport`.",
        root_cause
    )
}

/// The richer Profile Registry variant (§9): prioritization-lead,
/// senior-developer, and the e2e-investigator, each PRD-standard with no
/// legacy `"codex" tool prefix` naming.
pub fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile {
            name: "prioritization-lead".to_string(),
            role_label: "Prioritization Lead".to_string(),
            capabilities: vec!["triage".to_string(), "planning".to_string()],
            concurrency_cap: 2,
            priority: 5,
            default_runtime: RuntimeFlavor::Codex,
            default_model: "gpt-5".to_string(),
            default_system_prompt: "You are the prioritization lead for this workflow. You rank \
                 and refine backlog items; you never implement code."
                .to_string(),
            task_prompt_builder: prioritization_task_prompt,
            mcp_servers: vec![task_manager_server()],
            sandbox_hint: None,
        },
        Profile {
            name: "senior-developer".to_string(),
            role_label: "Senior Developer".to_string(),
            capabilities: vec!["implementation".to_string(), "debugging".to_string()],
            concurrency_cap: 4,
            priority: 10,
            default_runtime: RuntimeFlavor::Codex,
            default_model: "gpt-5".to_string(),
            default_system_prompt: "You are a senior developer implementing and remediating tasks \
                 on a dedicated branch."
                .to_string(),
            task_prompt_builder: senior_developer_task_prompt,
            mcp_servers: vec![task_manager_server()],
            sandbox_hint: Some("workspace-write".to_string()),
        },
        Profile {
            name: "qa-e2e-failure-investigation-specialist".to_string(),
            role_label: "QA E2E Failure Investigator".to_string(),
            capabilities: vec!["diagnosis".to_string()],
            concurrency_cap: 2,
            priority: 8,
            default_runtime: RuntimeFlavor::Codex,
            default_model: "gpt-5".to_string(),
            default_system_prompt: "You investigate end-to-end test failures and write a root-cause \
                 report for the developer who will fix them. You do not modify code."
                .to_string(),
            task_prompt_builder: qa_investigator_task_prompt,
            mcp_servers: vec![task_manager_server()],
            sandbox_hint: None,
        },
    ]
}

/// Returns the one profile used by `refine-into-tasks`/`research`-family
/// transitions (shares the prioritization lead's breadth; the task prompt
/// differs, so the dispatcher swaps in [`refinement_task_prompt`]'s builder
/// via a transition-scoped profile override rather than a new named profile).
pub fn refinement_task_prompt_fn() -> fn(&WorkflowContext) -> String {
    refinement_task_prompt
}

/// The default, closed workflow graph (§3, §4.2): the proposal → prioritize →
/// refine → implement → QA pipeline, with each QA stage's failure transition
/// routing back to `task-in-progress` for remediation.
pub fn default_graph() -> WorkflowGraph {
    let states = vec![
        StateDef::new("themes-proposed", "prioritization-lead")
            .with_target_type(TargetType::Theme)
            .with_transition("prioritize-themes", "themes-prioritized")
            .with_decider("prioritize-themes"),
        StateDef::new("themes-prioritized", "prioritization-lead")
            .with_target_type(TargetType::Initiative)
            .with_transition("prioritize-initiatives", "initiatives-prioritized")
            .with_decider("prioritize-initiatives"),
        StateDef::new("initiatives-prioritized", "prioritization-lead")
            .with_target_type(TargetType::Feature)
            .with_transition("prioritize-features", "features-prioritized")
            .with_decider("prioritize-features"),
        StateDef::new("features-proposed", "prioritization-lead")
            .with_target_type(TargetType::Feature)
            .with_transition("prioritize-features", "features-prioritized")
            .with_decider("prioritize-features"),
        StateDef::new("features-prioritized", "prioritization-lead")
            .with_target_type(TargetType::Story)
            .with_transition("prioritize-stories", "stories-prioritized")
            .with_transition("review-story-coverage", "stories-prioritized")
            .with_decider("prioritize-stories"),
        StateDef::new("stories-prioritized", "prioritization-lead")
            .with_target_type(TargetType::Story)
            .with_transition("refine-into-tasks", "tasks-prepared")
            .with_decider("refine-into-tasks"),
        StateDef::new("tasks-prepared", "senior-developer")
            .with_target_type(TargetType::Implementation)
            .with_transition("begin-implementation", "task-in-progress")
            .with_transition("pick-up-next-task", "tasks-prepared")
            .with_transition("need-more-tasks", "stories-prioritized")
            .with_decider("begin-implementation"),
        StateDef::new("task-in-progress", "senior-developer")
            .with_target_type(TargetType::Implementation)
            .with_transition("run-lint", "lint-completed")
            .with_decider("run-lint"),
        StateDef::new("lint-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("lint-failed", "task-in-progress")
            .with_transition("run-typecheck", "typecheck-completed")
            .with_decider("run-typecheck"),
        StateDef::new("typecheck-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("typecheck-failed", "task-in-progress")
            .with_transition("run-unit-tests", "unit-tests-completed")
            .with_decider("run-unit-tests"),
        StateDef::new("unit-tests-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("unit-tests-failed", "task-in-progress")
            .with_transition("run-e2e-tests", "e2e-tests-completed")
            .with_decider("run-e2e-tests"),
        StateDef::new("e2e-tests-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("e2e-tests-failed", "task-in-progress")
            .with_transition("ensure-coverage", "coverage-completed")
            .with_decider("ensure-coverage"),
        StateDef::new("coverage-completed", "senior-developer")
            .with_target_type(TargetType::Testing)
            .with_transition("coverage-failed", "task-in-progress")
            .with_transition("tests-passing", "tests-completed")
            .with_decider("tests-passing"),
        StateDef::new("tests-completed", "senior-developer")
            .with_target_type(TargetType::Implementation)
            .with_transition("pick-up-next-task", "tasks-prepared")
            .with_decider("pick-up-next-task"),
        StateDef::new("new-feature-proposed", "prioritization-lead")
            .with_target_type(TargetType::Feature)
            .with_transition("prioritize-features", "features-prioritized")
            .with_decider("prioritize-features"),
    ];

    let transitions = vec![
        TransitionDef::new("prioritize-themes").needs_description_in_prompt(),
        TransitionDef::new("prioritize-initiatives").needs_description_in_prompt(),
        TransitionDef::new("prioritize-features")
            .needs_description_in_prompt()
            .with_fallbacks(vec!["review-story-coverage"]),
        TransitionDef::new("prioritize-stories").needs_description_in_prompt(),
        TransitionDef::new("review-story-coverage").allow_without_task(),
        TransitionDef::new("review-task-validity").allow_without_task(),
        TransitionDef::new("refine-into-tasks").needs_task_snapshot(),
        TransitionDef::new("research").allow_without_task(),
        TransitionDef::new("do-ux-research").allow_without_task(),
        TransitionDef::new("need-more-tasks").allow_without_task(),
        TransitionDef::new("begin-implementation")
            .with_target_type(TargetType::Implementation)
            .needs_task_snapshot(),
        TransitionDef::new("close-invalid-task").needs_task_snapshot(),
        TransitionDef::new("pick-up-next-task").allow_without_task(),
        TransitionDef::new("run-lint").with_target_type(TargetType::Testing).needs_task_snapshot(),
        TransitionDef::new("run-typecheck").with_target_type(TargetType::Testing).needs_task_snapshot(),
        TransitionDef::new("run-unit-tests").with_target_type(TargetType::Testing).needs_task_snapshot(),
        TransitionDef::new("run-e2e-tests").with_target_type(TargetType::Testing).needs_task_snapshot(),
        TransitionDef::new("ensure-coverage").with_target_type(TargetType::Testing).needs_task_snapshot(),
        TransitionDef::new("lint-failed")
            .with_profile_override("senior-developer")
            .needs_task_snapshot(),
        TransitionDef::new("typecheck-failed")
            .with_profile_override("senior-developer")
            .needs_task_snapshot(),
        TransitionDef::new("unit-tests-failed")
            .with_profile_override("senior-developer")
            .needs_task_snapshot(),
        TransitionDef::new("e2e-tests-failed")
            .with_profile_override("senior-developer")
            .needs_task_snapshot(),
        TransitionDef::new("coverage-failed")
            .with_profile_override("senior-developer")
            .needs_task_snapshot(),
        TransitionDef::new("tests-passing").needs_task_snapshot(),
    ];

    WorkflowGraph::new(states, transitions)
}
