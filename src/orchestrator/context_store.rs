//! Context Store Adapter (§3, §4, §6): read/merge/patch a JSON-shaped
//! workflow context by id.
//!
//! `ensureContextId(token) → contextId`, `load(contextId) → map`,
//! `patch(contextId, partialMap)` (§6). The durable reference implementation
//! is grounded on the donor's `ThoughtChain` append-only `.jsonl` pattern:
//! every patch is appended as an event, and the committed context is the
//! fold of all events for that `contextId`.

use crate::orchestrator::error::StoreError;
use crate::orchestrator::types::WorkflowContext;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Returns the contextId for a workflow token, creating a fresh empty
    /// context if none exists yet.
    async fn ensure_context_id(&self, existing: Option<&str>) -> Result<String, StoreError>;
    async fn load(&self, context_id: &str) -> Result<WorkflowContext, StoreError>;
    /// Merge `patch` on top of the current context and persist the result.
    /// Patching is idempotent for identical input (§8 round-trip law).
    async fn patch(&self, context_id: &str, patch: JsonValue) -> Result<WorkflowContext, StoreError>;
}

fn merge_patch(base: &mut JsonValue, patch: JsonValue) {
    match (base, patch) {
        (base @ &mut JsonValue::Object(_), JsonValue::Object(patch_map)) => {
            let base_map = base.as_object_mut().unwrap();
            for (k, v) in patch_map {
                if v.is_null() {
                    base_map.remove(&k);
                } else {
                    merge_patch(base_map.entry(k).or_insert(JsonValue::Null), v);
                }
            }
        }
        (base, patch) => {
            *base = patch;
        }
    }
}

fn context_to_json(ctx: &WorkflowContext) -> JsonValue {
    serde_json::to_value(ctx).unwrap_or(JsonValue::Null)
}

fn json_to_context(context_id: &str, value: JsonValue) -> WorkflowContext {
    let mut ctx: WorkflowContext = serde_json::from_value(value).unwrap_or_default();
    ctx.context_id = context_id.to_string();
    ctx
}

/// In-memory reference implementation.
pub struct InMemoryContextStore {
    contexts: Mutex<HashMap<String, JsonValue>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        InMemoryContextStore {
            contexts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn ensure_context_id(&self, existing: Option<&str>) -> Result<String, StoreError> {
        if let Some(id) = existing {
            return Ok(id.to_string());
        }
        let id = Uuid::new_v4().to_string();
        let mut guard = self.contexts.lock().unwrap();
        guard.insert(id.clone(), context_to_json(&WorkflowContext::new(id.clone())));
        Ok(id)
    }

    async fn load(&self, context_id: &str) -> Result<WorkflowContext, StoreError> {
        let guard = self.contexts.lock().unwrap();
        let value = guard
            .get(context_id)
            .cloned()
            .unwrap_or_else(|| context_to_json(&WorkflowContext::new(context_id)));
        Ok(json_to_context(context_id, value))
    }

    async fn patch(&self, context_id: &str, patch: JsonValue) -> Result<WorkflowContext, StoreError> {
        let mut guard = self.contexts.lock().unwrap();
        let mut current = guard
            .get(context_id)
            .cloned()
            .unwrap_or_else(|| context_to_json(&WorkflowContext::new(context_id)));
        merge_patch(&mut current, patch);
        guard.insert(context_id.to_string(), current.clone());
        Ok(json_to_context(context_id, current))
    }
}

/// Durable `.jsonl`-backed store: one `{contextId, patch}` event per line,
/// folded on load. Grounded on `thought_chain.rs`'s append/replay discipline.
pub struct JsonlContextStore {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ContextEvent {
    context_id: String,
    patch: JsonValue,
}

impl JsonlContextStore {
    pub fn open(dir: &PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(JsonlContextStore {
            file_path: dir.join("contexts.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    fn fold_all(&self) -> std::io::Result<HashMap<String, JsonValue>> {
        let mut committed: HashMap<String, JsonValue> = HashMap::new();
        if !self.file_path.exists() {
            return Ok(committed);
        }
        let file = fs::File::open(&self.file_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ContextEvent = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let entry = committed
                .entry(event.context_id.clone())
                .or_insert_with(|| context_to_json(&WorkflowContext::new(event.context_id.clone())));
            merge_patch(entry, event.patch);
        }
        Ok(committed)
    }

    fn append(&self, context_id: &str, patch: JsonValue) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        let line = serde_json::to_string(&ContextEvent {
            context_id: context_id.to_string(),
            patch,
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    }
}

#[async_trait]
impl ContextStore for JsonlContextStore {
    async fn ensure_context_id(&self, existing: Option<&str>) -> Result<String, StoreError> {
        if let Some(id) = existing {
            return Ok(id.to_string());
        }
        let id = Uuid::new_v4().to_string();
        self.append(&id, context_to_json(&WorkflowContext::new(id.clone())))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(id)
    }

    async fn load(&self, context_id: &str) -> Result<WorkflowContext, StoreError> {
        let all = self.fold_all().map_err(|e| StoreError::Io(e.to_string()))?;
        let value = all
            .get(context_id)
            .cloned()
            .unwrap_or_else(|| context_to_json(&WorkflowContext::new(context_id)));
        Ok(json_to_context(context_id, value))
    }

    async fn patch(&self, context_id: &str, patch: JsonValue) -> Result<WorkflowContext, StoreError> {
        self.append(context_id, patch.clone()).map_err(|e| StoreError::Io(e.to_string()))?;
        let all = self.fold_all().map_err(|e| StoreError::Io(e.to_string()))?;
        let value = all.get(context_id).cloned().unwrap();
        Ok(json_to_context(context_id, value))
    }
}
