//! Workflow Graph (§3, §4.2): a closed, immutable state → transition → state
//! table built once at process start, grounded on the donor orchestration
//! engine's state/mode table shape (`orchestration.rs`).

use std::collections::HashMap;

/// One of the five target types a transition or state can be scoped to
/// (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Theme,
    Initiative,
    Feature,
    Story,
    Implementation,
    Testing,
}

/// Per-transition attributes the dispatcher and prompt builder consume
/// (§3).
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub name: String,
    pub target_type_override: Option<TargetType>,
    pub executing_profile_override: Option<String>,
    pub allowed_without_task: bool,
    pub context_needs_task_snapshot: bool,
    pub description_needed_in_prompt: bool,
    /// Ordered fallback transitions tried when no task matches this one.
    pub fallbacks: Vec<String>,
}

impl TransitionDef {
    pub fn new(name: impl Into<String>) -> Self {
        TransitionDef {
            name: name.into(),
            target_type_override: None,
            executing_profile_override: None,
            allowed_without_task: false,
            context_needs_task_snapshot: false,
            description_needed_in_prompt: false,
            fallbacks: Vec::new(),
        }
    }

    pub fn with_target_type(mut self, t: TargetType) -> Self {
        self.target_type_override = Some(t);
        self
    }

    pub fn with_profile_override(mut self, profile: impl Into<String>) -> Self {
        self.executing_profile_override = Some(profile.into());
        self
    }

    pub fn allow_without_task(mut self) -> Self {
        self.allowed_without_task = true;
        self
    }

    pub fn needs_task_snapshot(mut self) -> Self {
        self.context_needs_task_snapshot = true;
        self
    }

    pub fn needs_description_in_prompt(mut self) -> Self {
        self.description_needed_in_prompt = true;
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<&str>) -> Self {
        self.fallbacks = fallbacks.into_iter().map(|s| s.to_string()).collect();
        self
    }
}

/// One workflow state (§3): default profile, outgoing transitions, optional
/// target type, prompt hint, and decider transition name.
#[derive(Debug, Clone)]
pub struct StateDef {
    pub name: String,
    pub default_profile: String,
    pub transitions: HashMap<String, String>,
    pub target_type: Option<TargetType>,
    pub prompt_hint: Option<String>,
    pub decider_transition: Option<String>,
}

impl StateDef {
    pub fn new(name: impl Into<String>, default_profile: impl Into<String>) -> Self {
        StateDef {
            name: name.into(),
            default_profile: default_profile.into(),
            transitions: HashMap::new(),
            target_type: None,
            prompt_hint: None,
            decider_transition: None,
        }
    }

    pub fn with_transition(mut self, transition: impl Into<String>, target_state: impl Into<String>) -> Self {
        self.transitions.insert(transition.into(), target_state.into());
        self
    }

    pub fn with_target_type(mut self, t: TargetType) -> Self {
        self.target_type = Some(t);
        self
    }

    pub fn with_prompt_hint(mut self, hint: impl Into<String>) -> Self {
        self.prompt_hint = Some(hint.into());
        self
    }

    pub fn with_decider(mut self, transition: impl Into<String>) -> Self {
        self.decider_transition = Some(transition.into());
        self
    }
}

/// Pure, immutable workflow table (§4.2). Constructed once at process start
/// and shared read-only across workers.
pub struct WorkflowGraph {
    states: HashMap<String, StateDef>,
    transitions: HashMap<String, TransitionDef>,
}

impl WorkflowGraph {
    pub fn new(states: Vec<StateDef>, transitions: Vec<TransitionDef>) -> Self {
        WorkflowGraph {
            states: states.into_iter().map(|s| (s.name.clone(), s)).collect(),
            transitions: transitions.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    pub fn transition(&self, name: &str) -> Option<&TransitionDef> {
        self.transitions.get(name)
    }

    /// `nextState(state, transition) → state|None` (§4.2).
    pub fn next_state(&self, state: &str, transition: &str) -> Option<String> {
        self.states.get(state)?.transitions.get(transition).cloned()
    }

    /// `transitionAllowed(state, transition)` (§4.2).
    pub fn transition_allowed(&self, state: &str, transition: &str) -> bool {
        self.states
            .get(state)
            .map(|s| s.transitions.contains_key(transition))
            .unwrap_or(false)
    }

    /// Walks the ordered fallback list and returns the first transition
    /// defined from `state`; a graph with cyclic fallback lists cannot loop
    /// forever because each fallback is tried at most once and the list is
    /// finite (§8 round-trip law: terminates in ≤ |transitions| steps).
    pub fn fallback_transition(&self, state: &str, current_transition: &str) -> Option<String> {
        let def = self.transitions.get(current_transition)?;
        for candidate in &def.fallbacks {
            if self.transition_allowed(state, candidate) {
                return Some(candidate.clone());
            }
        }
        None
    }

    pub fn can_run_without_task(&self, transition: &str) -> bool {
        self.transitions
            .get(transition)
            .map(|t| t.allowed_without_task)
            .unwrap_or(false)
    }

    /// `targetTypeFor(state, transition)`: override table then state default
    /// (§4.2).
    pub fn target_type_for(&self, state: &str, transition: &str) -> Option<TargetType> {
        if let Some(t) = self.transitions.get(transition).and_then(|t| t.target_type_override) {
            return Some(t);
        }
        self.states.get(state).and_then(|s| s.target_type)
    }

    /// `profileFor(state, transition)`: override table then state default
    /// (§4.2).
    pub fn profile_for(&self, state: &str, transition: &str) -> Option<String> {
        if let Some(p) = self
            .transitions
            .get(transition)
            .and_then(|t| t.executing_profile_override.clone())
        {
            return Some(p);
        }
        self.states.get(state).map(|s| s.default_profile.clone())
    }
}
