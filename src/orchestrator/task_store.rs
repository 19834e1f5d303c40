//! Task DB (§6, consumed external interface). The core only ever talks to
//! this trait; the in-memory reference implementation here exists so the
//! crate is runnable and testable standalone (§B of SPEC_FULL.md) — it is
//! not a substitute for a production task database's CRUD/dependency-graph
//! product, which remains an explicit Non-goal (§1).

use crate::orchestrator::error::StoreError;
use crate::orchestrator::types::{Task, TaskStatus};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;

/// Why a [`TaskStore::claim_task`] call was rejected (§4.10 step 5e).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimRejection {
    AlreadyClaimedByOther,
    NonClaimableStatus,
    DependenciesUnsatisfied,
    Stale,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;
    async fn get_task(&self, id: &str) -> Result<Task, StoreError>;
    async fn update_task_status(&self, id: &str, status: TaskStatus, changed_by: &str) -> Result<(), StoreError>;
    /// Partial-field update, used for `branch`, `dependencies`, and other
    /// metadata (§6).
    async fn update_task(&self, id: &str, fields: HashMap<String, JsonValue>, changed_by: &str) -> Result<(), StoreError>;
    /// Atomic claim: succeeds only if the task is unassigned or assigned to
    /// `worker_id`, its status is `todo`/`in-progress`, and its dependencies
    /// are satisfied (§6).
    async fn claim_task(&self, id: &str, worker_id: &str) -> Result<Result<Task, ClaimRejection>, StoreError>;
    async fn append_action_log(&self, task_id: &str, entry: JsonValue) -> Result<(), StoreError>;
}

struct InMemoryState {
    tasks: HashMap<String, Task>,
    /// task id -> worker id that currently holds the claim lease.
    claims: HashMap<String, String>,
}

/// In-memory `TaskStore` reference implementation.
pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut map = HashMap::new();
        for t in tasks {
            map.insert(t.id.clone(), t);
        }
        InMemoryTaskStore {
            state: Mutex::new(InMemoryState {
                tasks: map,
                claims: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, task: Task) {
        self.state.lock().unwrap().tasks.insert(task.id.clone(), task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.state.lock().unwrap().tasks.values().cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus, _changed_by: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }

    async fn update_task(&self, id: &str, fields: HashMap<String, JsonValue>, _changed_by: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(branch) = fields.get("branch") {
            task.branch = branch.as_str().map(|s| s.to_string());
        }
        if let Some(deps) = fields.get("dependencies").and_then(|v| v.as_array()) {
            task.dependency_ids = deps.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
        }
        Ok(())
    }

    async fn claim_task(&self, id: &str, worker_id: &str) -> Result<Result<Task, ClaimRejection>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let all_tasks = state.tasks.clone();
        let task = state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(holder) = state.claims.get(id) {
            if holder != worker_id {
                return Ok(Err(ClaimRejection::AlreadyClaimedByOther));
            }
        }
        if !matches!(task.status, TaskStatus::Todo | TaskStatus::InProgress) {
            return Ok(Err(ClaimRejection::NonClaimableStatus));
        }
        if !task.dependencies_satisfied(&all_tasks) {
            return Ok(Err(ClaimRejection::DependenciesUnsatisfied));
        }

        state.claims.insert(id.to_string(), worker_id.to_string());
        let task_mut = state.tasks.get_mut(id).unwrap();
        task_mut.assigned_profile_id = Some(worker_id.to_string());
        Ok(Ok(task_mut.clone()))
    }

    async fn append_action_log(&self, task_id: &str, entry: JsonValue) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        task.action_log.push(entry);
        Ok(())
    }
}
