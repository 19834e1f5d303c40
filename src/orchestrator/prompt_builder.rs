//! Prompt Builder (§4.7): deterministic, byte-identical-for-identical-input
//! composition of the prompt text sent to an agent-runtime turn.
//!
//! Mirrors the donor's `Agent::send` tool-description composition
//! (`agent.rs`) — a plain ordered sequence of `push_str` calls building one
//! string, never a templating engine.

use crate::orchestrator::profile::EffectiveProfile;
use crate::orchestrator::types::{PreflightResult, Task, TestReport, WorkflowContext};

const CONTROL_DECIDER_SUMMARY_EXEMPT: [&str; 3] =
    ["review-task-validity", "close-invalid-task", "review-story-coverage"];

/// Required base tool names for a transition (§4.7 table). `default` is the
/// union of every row, used when no more specific row matches.
pub fn required_base_tools(transition: &str) -> Vec<&'static str> {
    if transition.starts_with("prioritize-") {
        return vec!["list_tasks", "update_task_priority"];
    }
    if matches!(transition, "research" | "refine" | "do-ux-research" | "need-more-tasks") {
        return vec!["list_tasks", "get_task", "create_task", "update_task"];
    }
    if transition == "begin-implementation" || transition.ends_with("-failed") {
        return vec!["update_task_status", "get_file_context", "update_context"];
    }
    if transition.starts_with("run-") {
        return vec!["update_context", "update_task_status", "get_file_context"];
    }
    if transition == "close-invalid-task" {
        return vec!["update_task_status"];
    }
    if matches!(transition, "review-task-validity" | "review-story-coverage" | "pick-up-next-task") {
        return vec!["list_tasks", "get_task"];
    }
    vec![
        "list_tasks",
        "get_task",
        "create_task",
        "update_task",
        "update_task_priority",
        "update_task_status",
        "get_file_context",
        "update_context",
    ]
}

/// `functions.mcp__{server}__{tool}`, plus the `_`-for-`-` server-name
/// variant (§4.7 step 3).
fn exact_tool_names(server_name: &str, tool: &str) -> Vec<String> {
    let mut names = vec![format!("functions.mcp__{}__{}", server_name, tool)];
    let underscored = server_name.replace('-', "_");
    if underscored != server_name {
        names.push(format!("functions.mcp__{}__{}", underscored, tool));
    }
    names
}

/// All inputs the fourteen-step composition consumes; optional sections are
/// omitted entirely from the prompt when `None` (§4.7).
pub struct PromptInputs<'a> {
    pub profile: &'a EffectiveProfile,
    pub state: &'a str,
    pub transition: &'a str,
    pub is_decider: bool,
    pub declared_tool_base_names: &'a [String],
    pub mcp_server_name: &'a str,
    pub workflow_hint: Option<&'a str>,
    pub selected_task: Option<&'a Task>,
    pub test_report: Option<&'a TestReport>,
    pub failure_packet: Option<&'a str>,
    pub mechanical_preflight: Option<&'a PreflightResult>,
    pub prefetched_list_tasks: Option<&'a [Task]>,
    pub reference_prompt_blocks: &'a [String],
    pub context: &'a WorkflowContext,
}

fn role_label(is_decider: bool) -> &'static str {
    if is_decider {
        "decider"
    } else {
        "transition-executor"
    }
}

/// Composes the full prompt per the fourteen-step order in §4.7.
pub fn build_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();

    // 1. Profile system prompt.
    out.push_str(&inputs.profile.system_prompt);
    out.push_str("\n\n");

    // 2. Transition SOP block.
    out.push_str(&format!(
        "Transition SOP:\nstate={}\ntransition={}\nrole={}\nExecute this transition only. Prefer prefetched context. Minimize tool calls. Use exact tool names.\n\n",
        inputs.state,
        inputs.transition,
        role_label(inputs.is_decider)
    ));

    // 3. MCP tooling block.
    let required = required_base_tools(inputs.transition);
    let declared: Vec<&str> = inputs
        .declared_tool_base_names
        .iter()
        .map(|s| s.as_str())
        .filter(|t| required.contains(t))
        .collect();
    if !declared.is_empty() {
        out.push_str("MCP tools available for this transition:\n");
        for base in &declared {
            for exact in exact_tool_names(inputs.mcp_server_name, base) {
                out.push_str(&format!("- {} -> {}\n", base, exact));
            }
        }
        out.push_str(
            "The ACP-exposed tool list above is authoritative. Map each base name to its exact \
             name. Never invent tool name variants. Never claim a tool is missing when its exact \
             name is visible above. Do not substitute resource-discovery calls \
             (codex/list_mcp_resources, */read_mcp_resource) for task-manager operations.\n\n",
        );
    }

    // 4. Optional workflow hint.
    if let Some(hint) = inputs.workflow_hint {
        out.push_str(&format!("Workflow hint: {}\n\n", hint));
    }

    // 5. Optional selected task context block.
    if let Some(task) = inputs.selected_task {
        out.push_str(&format!(
            "Selected task:\nid={}\ntitle={}\ndescription={}\npriority={:?}\n\n",
            task.id, task.title, task.description, task.priority
        ));
    }

    // 6. Optional test report block.
    if let Some(report) = inputs.test_report {
        out.push_str("Test report:\n");
        out.push_str(&format!("failedTests: {}\n", report.failed_tests.join("; ")));
        out.push_str(&format!("reproSteps: {}\n", report.repro_steps.join("; ")));
        out.push_str(&format!("suspectedRootCause: {}\n\n", report.suspected_root_cause));
    }

    // 7. Optional failure packet (QA failure transitions only).
    if let Some(packet) = inputs.failure_packet {
        out.push_str(&format!("Failure packet:\n{}\n\n", packet));
    }

    // 8. Optional mechanical preflight results block.
    if let Some(preflight) = inputs.mechanical_preflight {
        out.push_str(&format!(
            "Mechanical preflight results ({}):\npass={}\n{}\n\n",
            preflight.stage, preflight.pass, preflight.rendered_aggregate
        ));
    }

    // 9. Optional prefetched list_tasks block.
    if let Some(tasks) = inputs.prefetched_list_tasks {
        out.push_str("Prefetched task list:\n");
        for t in tasks {
            out.push_str(&format!("- [{}] {} (status={:?}, priority={:?})\n", t.id, t.title, t.status, t.priority));
        }
        out.push('\n');
    }

    // 10. Reference prompt blocks loaded from disk by profile.
    for block in inputs.reference_prompt_blocks {
        out.push_str(block);
        out.push_str("\n\n");
    }

    // 11. Project rules.
    out.push_str(
        "Project rules: follow repository conventions. Never restart the daemon directly.\n",
    );
    if is_coding_profile(inputs.profile) {
        out.push_str(
            "Coding conventions: 4-space indent, double quotes, functional style, ESM with explicit extensions.\n",
        );
    }
    out.push('\n');

    // 12. Resolution guardrails.
    out.push_str(
        "Guardrails: if the task is already implemented, say so and propose a follow-up. If a \
         file read is permission-denied, say so and proceed. If the sandbox blocks a command, \
         say so and emit the exact command.\n\n",
    );

    // 13. Summary instruction.
    if !CONTROL_DECIDER_SUMMARY_EXEMPT.contains(&inputs.transition) {
        out.push_str("End your response with a trailing `Summary:` line.\n\n");
    }

    // 14. Profile-specific task prompt.
    out.push_str(&inputs.profile.build_task_prompt(inputs.context));

    out
}

fn is_coding_profile(profile: &EffectiveProfile) -> bool {
    matches!(profile.name.as_str(), "senior-developer" | "implementation-engineer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::profile::ProfileRegistry;
    use crate::orchestrator::types::{McpServerDecl, Profile, RuntimeFlavor};

    fn builder(_ctx: &WorkflowContext) -> String {
        "Implement the task now.".to_string()
    }

    fn profile() -> Profile {
        Profile {
            name: "senior-developer".to_string(),
            role_label: "Senior Developer".to_string(),
            capabilities: vec![],
            concurrency_cap: 1,
            priority: 1,
            default_runtime: RuntimeFlavor::Codex,
            default_model: "gpt-5".to_string(),
            default_system_prompt: "You are a senior developer.".to_string(),
            task_prompt_builder: builder,
            mcp_servers: vec![McpServerDecl {
                name: "task-manager".to_string(),
                transport: "stdio".to_string(),
                endpoint_or_command: "task-manager-server".to_string(),
                tool_base_names: vec!["update_task_status".to_string(), "get_file_context".to_string(), "update_context".to_string()],
            }],
            sandbox_hint: None,
        }
    }

    fn effective(p: &Profile) -> EffectiveProfile {
        ProfileRegistry::effective_from_defaults(p)
    }

    #[test]
    fn required_base_tools_match_table_rows() {
        assert_eq!(required_base_tools("prioritize-features"), vec!["list_tasks", "update_task_priority"]);
        assert_eq!(required_base_tools("run-lint"), vec!["update_context", "update_task_status", "get_file_context"]);
        assert_eq!(required_base_tools("close-invalid-task"), vec!["update_task_status"]);
        assert_eq!(required_base_tools("e2e-tests-failed"), vec!["update_task_status", "get_file_context", "update_context"]);
    }

    #[test]
    fn summary_instruction_omitted_for_exempt_transitions() {
        let p = profile();
        let e = effective(&p);
        let ctx = WorkflowContext::new("ctx-1");
        let inputs = PromptInputs {
            profile: &e,
            state: "stories-prioritized",
            transition: "review-story-coverage",
            is_decider: true,
            declared_tool_base_names: &[],
            mcp_server_name: "task-manager",
            workflow_hint: None,
            selected_task: None,
            test_report: None,
            failure_packet: None,
            mechanical_preflight: None,
            prefetched_list_tasks: None,
            reference_prompt_blocks: &[],
            context: &ctx,
        };
        let prompt = build_prompt(&inputs);
        assert!(!prompt.contains("trailing `Summary:`"));
    }

    #[test]
    fn summary_instruction_present_by_default() {
        let p = profile();
        let e = effective(&p);
        let ctx = WorkflowContext::new("ctx-1");
        let inputs = PromptInputs {
            profile: &e,
            state: "task-in-progress",
            transition: "begin-implementation",
            is_decider: false,
            declared_tool_base_names: &[],
            mcp_server_name: "task-manager",
            workflow_hint: None,
            selected_task: None,
            test_report: None,
            failure_packet: None,
            mechanical_preflight: None,
            prefetched_list_tasks: None,
            reference_prompt_blocks: &[],
            context: &ctx,
        };
        let prompt = build_prompt(&inputs);
        assert!(prompt.contains("trailing `Summary:`"));
    }

    #[test]
    fn mcp_block_lists_exact_names_filtered_by_required_tools() {
        let p = profile();
        let e = effective(&p);
        let ctx = WorkflowContext::new("ctx-1");
        let declared = vec![
            "update_task_status".to_string(),
            "get_file_context".to_string(),
            "update_context".to_string(),
            "create_task".to_string(),
        ];
        let inputs = PromptInputs {
            profile: &e,
            state: "task-in-progress",
            transition: "begin-implementation",
            is_decider: false,
            declared_tool_base_names: &declared,
            mcp_server_name: "task-manager",
            workflow_hint: None,
            selected_task: None,
            test_report: None,
            failure_packet: None,
            mechanical_preflight: None,
            prefetched_list_tasks: None,
            reference_prompt_blocks: &[],
            context: &ctx,
        };
        let prompt = build_prompt(&inputs);
        assert!(prompt.contains("functions.mcp__task-manager__update_task_status"));
        assert!(!prompt.contains("create_task"));
    }

    #[test]
    fn task_prompt_is_appended_last() {
        let p = profile();
        let e = effective(&p);
        let ctx = WorkflowContext::new("ctx-1");
        let inputs = PromptInputs {
            profile: &e,
            state: "task-in-progress",
            transition: "begin-implementation",
            is_decider: false,
            declared_tool_base_names: &[],
            mcp_server_name: "task-manager",
            workflow_hint: None,
            selected_task: None,
            test_report: None,
            failure_packet: None,
            mechanical_preflight: None,
            prefetched_list_tasks: None,
            reference_prompt_blocks: &[],
            context: &ctx,
        };
        let prompt = build_prompt(&inputs);
        assert!(prompt.trim_end().ends_with("Implement the task now."));
    }
}
