//! Task Selector (§4.3): given the current task list, state, and a preferred
//! task, choose which task to work next.

use crate::orchestrator::workflow_graph::TargetType;
use crate::orchestrator::types::{Task, TaskPriority, TaskStatus, TaskType};
use std::collections::{HashMap, HashSet};

/// Inputs to [`select_task_for_state`] (§4.3).
pub struct SelectionInput<'a> {
    pub tasks: &'a [Task],
    pub target_type: Option<TargetType>,
    pub preferred_task_id: Option<&'a str>,
    pub prefer_preferred: bool,
    /// True in claim mode: excludes `in-progress` tasks whose id isn't the
    /// preferred one.
    pub restrict_in_progress_to_preferred: bool,
    pub excluded_ids: &'a HashSet<String>,
}

fn target_type_matches(task_type: TaskType, target: TargetType) -> bool {
    match target {
        TargetType::Theme => task_type == TaskType::Theme,
        TargetType::Initiative => task_type == TaskType::Initiative,
        TargetType::Feature => task_type == TaskType::Feature,
        TargetType::Story => task_type == TaskType::Story,
        TargetType::Implementation => task_type.aliases(TaskType::Implementation),
        TargetType::Testing => task_type.aliases(TaskType::Testing),
    }
}

fn by_id_map(tasks: &[Task]) -> HashMap<String, Task> {
    tasks.iter().map(|t| (t.id.clone(), t.clone())).collect()
}

fn sort_key(task: &Task) -> (std::cmp::Reverse<TaskPriority>, String) {
    (std::cmp::Reverse(task.priority), task.title.to_lowercase())
}

/// Step 1 of §4.3: filter out `done` (except `theme` type) and `invalid`; in
/// claim mode, exclude `in-progress` tasks whose id isn't the preferred one.
fn active_tasks<'a>(input: &SelectionInput<'a>) -> Vec<&'a Task> {
    input
        .tasks
        .iter()
        .filter(|t| !input.excluded_ids.contains(&t.id))
        .filter(|t| match t.status {
            TaskStatus::Done => t.task_type == TaskType::Theme,
            TaskStatus::Invalid => false,
            _ => true,
        })
        .filter(|t| {
            if input.restrict_in_progress_to_preferred && t.status == TaskStatus::InProgress {
                Some(t.id.as_str()) == input.preferred_task_id
            } else {
                true
            }
        })
        .collect()
}

/// §4.3 main selection algorithm.
pub fn select_task_for_state(input: SelectionInput<'_>) -> Option<Task> {
    let active = active_tasks(&input);
    let all_by_id = by_id_map(input.tasks);

    // Step 2: choose targetType. If none, return the first active task.
    let target_type = match input.target_type {
        Some(t) => t,
        None => return active.first().map(|t| (*t).clone()),
    };

    // Step 3: preferred task short-circuit.
    if let Some(pref_id) = input.preferred_task_id {
        if let Some(pref) = active.iter().find(|t| t.id == pref_id) {
            let type_matches = target_type_matches(pref.task_type, target_type);
            let actionable = pref.status == TaskStatus::InProgress || pref.dependencies_satisfied(&all_by_id);
            if input.prefer_preferred || (type_matches && actionable) {
                return Some((*pref).clone());
            }
        }
    }

    // Step 4: candidates = active ∧ type matches ∧ deps satisfied.
    let mut candidates: Vec<&Task> = active
        .iter()
        .filter(|t| target_type_matches(t.task_type, target_type) && t.dependencies_satisfied(&all_by_id))
        .cloned()
        .collect();

    // Step 5: fallback for testing with no candidates.
    if candidates.is_empty() && matches!(target_type, TargetType::Testing) {
        candidates = active
            .iter()
            .filter(|t| t.task_type.aliases(TaskType::Implementation) && t.dependencies_satisfied(&all_by_id))
            .cloned()
            .collect();
    }

    // Step 6: sort by priority desc then title.
    candidates.sort_by_key(|t| sort_key(t));
    candidates.first().map(|t| (*t).clone())
}

/// `selectInvalidTaskForClosure` (§4.3): implementation-typed, `todo`,
/// text-incomplete tasks, ordered by priority then title.
pub fn select_invalid_task_for_closure(tasks: &[Task]) -> Option<Task> {
    let mut candidates: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.task_type.aliases(TaskType::Implementation))
        .filter(|t| t.status == TaskStatus::Todo)
        .filter(|t| t.is_text_incomplete())
        .collect();
    candidates.sort_by_key(|t| sort_key(t));
    candidates.first().map(|t| (*t).clone())
}

/// Derived state for auto-recovery (§4.3, §4.10 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedState {
    pub state: String,
    pub task_id: Option<String>,
}

/// §4.3 state-derivation heuristic used for auto-recovery of a fresh
/// context.
pub fn derive_state_from_tasks(tasks: &[Task]) -> DerivedState {
    let all_by_id = by_id_map(tasks);

    if let Some(t) = tasks
        .iter()
        .find(|t| t.task_type.aliases(TaskType::Implementation) && t.status == TaskStatus::InProgress)
    {
        return DerivedState {
            state: "task-in-progress".to_string(),
            task_id: Some(t.id.clone()),
        };
    }

    if tasks.iter().any(|t| {
        t.task_type.aliases(TaskType::Implementation)
            && t.status == TaskStatus::Todo
            && t.dependencies_satisfied(&all_by_id)
    }) {
        return DerivedState {
            state: "tasks-prepared".to_string(),
            task_id: None,
        };
    }

    let most_specific = [TaskType::Story, TaskType::Feature, TaskType::Initiative, TaskType::Theme]
        .iter()
        .find(|want| tasks.iter().any(|t| t.task_type == **want));

    let state = match most_specific {
        Some(TaskType::Story) => "stories-prioritized",
        Some(TaskType::Feature) => "features-prioritized",
        Some(TaskType::Initiative) => "initiatives-prioritized",
        _ => "themes-prioritized",
    };

    DerivedState {
        state: state.to_string(),
        task_id: None,
    }
}
