//! Profile Registry (§4.1).
//!
//! Loads built-in profiles at construction, then asynchronously opens the
//! override store; reads return snapshots over a committed map (lock-free),
//! mutations are serialized per profile name — mirroring the donor's
//! `ToolRegistry` convention of an `Arc`-shared registry guarded by
//! `tokio::sync::RwLock` with async constructors.
//!
//! Implements the richer of the two Profile Registry variants named in §9:
//! prioritization-lead and e2e-investigator profiles, PRD-standard task
//! prompts, no legacy `"codex" tool prefix` naming.

use crate::orchestrator::profile_store::ProfileOverrideStore;
use crate::orchestrator::types::{McpServerDecl, Profile, ProfileOverride, ProfileState, RuntimeFlavor, WorkflowContext};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// `{defaults, overrides, effective, updatedAt?}` returned by the snapshot
/// API (§4.1).
#[derive(Clone)]
pub struct ProfileSnapshot {
    pub defaults: EffectiveProfile,
    pub overrides: Option<ProfileOverride>,
    pub effective: EffectiveProfile,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The resolved `{runtime, model, systemPrompt, taskPromptBuilder}` a
/// dispatcher actually uses — either a profile's defaults, or defaults with
/// an override applied (§4.1).
#[derive(Clone)]
pub struct EffectiveProfile {
    pub name: String,
    pub runtime: RuntimeFlavor,
    pub model: String,
    pub system_prompt: String,
    pub mcp_servers: Vec<McpServerDecl>,
    task_prompt_prefix: Option<String>,
    default_builder: fn(&WorkflowContext) -> String,
}

impl EffectiveProfile {
    /// §4.1: "if a non-empty taskPromptPrefix override exists, the effective
    /// task-prompt builder is `context ↦ prefix + "\n\n" + defaultBuilder(context)`."
    pub fn build_task_prompt(&self, context: &WorkflowContext) -> String {
        let base = (self.default_builder)(context);
        match &self.task_prompt_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}\n\n{}", prefix, base),
            _ => base,
        }
    }
}

struct RegistryInner {
    profiles: HashMap<String, Profile>,
    states: HashMap<String, ProfileState>,
}

/// The orchestrator's Profile Registry. Constructible (not a global
/// singleton, §9 design note) so every worker takes a reference and tests
/// can build an isolated registry.
pub struct ProfileRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    overrides: Arc<RwLock<HashMap<String, ProfileOverride>>>,
    store: Option<Arc<dyn ProfileOverrideStore>>,
    /// Set once the override store has been (successfully or not)
    /// consulted at startup; mutating operations await this.
    loaded: Arc<tokio::sync::Notify>,
    load_failed: Arc<RwLock<bool>>,
}

impl ProfileRegistry {
    /// Construct with the built-in profile set and no override store —
    /// overrides are permanently unavailable (reads still work).
    pub fn new_without_store(profiles: Vec<Profile>) -> Self {
        let mut map = HashMap::new();
        let mut states = HashMap::new();
        for p in profiles {
            states.insert(p.name.clone(), ProfileState::new());
            map.insert(p.name.clone(), p);
        }
        let loaded = Arc::new(tokio::sync::Notify::new());
        loaded.notify_waiters();
        ProfileRegistry {
            inner: Arc::new(RwLock::new(RegistryInner { profiles: map, states })),
            overrides: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            loaded,
            load_failed: Arc::new(RwLock::new(false)),
        }
    }

    /// Construct with the built-in profile set, then kick off an
    /// asynchronous load of the override store. Callers that need to be
    /// certain overrides have been applied should `await` [`Self::wait_loaded`].
    pub fn new_with_store(profiles: Vec<Profile>, store: Arc<dyn ProfileOverrideStore>) -> Self {
        let registry = Self::new_without_store(profiles);
        let registry = ProfileRegistry { store: Some(store), ..registry };
        registry.spawn_load();
        registry
    }

    fn spawn_load(&self) {
        let store = self.store.clone().expect("spawn_load requires a store");
        let overrides = self.overrides.clone();
        let loaded = self.loaded.clone();
        let load_failed = self.load_failed.clone();
        tokio::spawn(async move {
            match store.load_all().await {
                Ok(records) => {
                    let mut guard = overrides.write().await;
                    for rec in records {
                        guard.insert(rec.profile_name.clone(), rec);
                    }
                }
                Err(e) => {
                    log::warn!("profile override store locked at open, falling back to defaults-only: {}", e);
                    *load_failed.write().await = true;
                }
            }
            loaded.notify_waiters();
        });
    }

    pub async fn wait_loaded(&self) {
        self.loaded.notified().await;
    }

    /// Snapshot reads are lock-free over a committed map (§4.1 concurrency
    /// contract) in the sense that they never wait on the store-load
    /// in-flight future — they simply read whatever has committed so far.
    pub async fn snapshot(&self, profile_name: &str) -> Option<ProfileSnapshot> {
        let inner = self.inner.read().await;
        let profile = inner.profiles.get(profile_name)?;
        let defaults = Self::to_effective(profile, None);
        let overrides = self.overrides.read().await;
        let ov = overrides.get(profile_name).cloned();
        let effective = Self::to_effective(profile, ov.as_ref());
        Some(ProfileSnapshot {
            updated_at: ov.as_ref().map(|o| o.updated_at),
            defaults,
            overrides: ov,
            effective,
        })
    }

    pub async fn effective(&self, profile_name: &str) -> Option<EffectiveProfile> {
        self.snapshot(profile_name).await.map(|s| s.effective)
    }

    /// Build an [`EffectiveProfile`] straight from defaults, bypassing the
    /// registry. Exists so other modules' tests can get a usable profile
    /// without standing up an async registry just to read a snapshot.
    #[cfg(test)]
    pub(crate) fn effective_from_defaults(profile: &Profile) -> EffectiveProfile {
        Self::to_effective(profile, None)
    }

    fn to_effective(profile: &Profile, ov: Option<&ProfileOverride>) -> EffectiveProfile {
        let runtime = ov.and_then(|o| o.runtime).unwrap_or(profile.default_runtime);
        let model = ov
            .and_then(|o| o.model.clone())
            .unwrap_or_else(|| profile.default_model.clone());
        let system_prompt = ov
            .and_then(|o| o.system_prompt.clone())
            .unwrap_or_else(|| profile.default_system_prompt.clone());
        let task_prompt_prefix = ov.and_then(|o| o.task_prompt_prefix.clone());
        EffectiveProfile {
            name: profile.name.clone(),
            runtime,
            model,
            system_prompt,
            mcp_servers: profile.mcp_servers.clone(),
            task_prompt_prefix,
            default_builder: profile.task_prompt_builder,
        }
    }

    /// Apply (persist + commit) an override. Mutations are serialized per
    /// profile name by virtue of taking the write lock; an empty override is
    /// deleted instead of stored (§4.1). Put/del errors are logged and do
    /// not propagate (§4.1).
    pub async fn apply_override(&self, ov: ProfileOverride) {
        self.wait_loaded().await;
        let name = ov.profile_name.clone();
        if let Some(store) = &self.store {
            let result = if ov.is_empty() {
                store.delete(&name).await
            } else {
                store.put(&name, ov.clone()).await
            };
            if let Err(e) = result {
                log::warn!("profile override store write failed for `{}`: {}", name, e);
            }
        }
        let mut guard = self.overrides.write().await;
        if ov.is_empty() {
            guard.remove(&name);
        } else {
            guard.insert(name, ov);
        }
    }

    pub async fn profile_names(&self) -> Vec<String> {
        self.inner.read().await.profiles.keys().cloned().collect()
    }

    pub async fn record_completion(&self, profile_name: &str, duration_ms: u64, success: bool) {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.states.get_mut(profile_name) {
            state.record(duration_ms, success);
        }
    }

    pub async fn state_of(&self, profile_name: &str) -> Option<ProfileState> {
        self.inner.read().await.states.get(profile_name).cloned()
    }
}
