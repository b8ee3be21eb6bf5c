//! Callback resolution.
//!
//! States name their hooks with plain identifiers; a [`CallbackResolver`]
//! turns an identifier into something callable. Three strategies ship with
//! the crate:
//!
//! - [`CallbackRegistry`]: explicit name -> function table.
//! - [`InjectedSources`]: one trigger source and one action source that
//!   receive the identifier as an argument.
//! - [`NoCallbacks`]: resolves nothing.
//!
//! A [`ProcessingMap`] registered on a runner overrides identifiers per state
//! and hook kind, whatever the resolver says.

use crate::error::CoreError;
use crate::runner::RunnerProxy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Hook slots a state can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    OnEnter,
    OnExit,
    OnChange,
    Trigger,
    Action,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::OnEnter,
        HookKind::OnExit,
        HookKind::OnChange,
        HookKind::Trigger,
        HookKind::Action,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::OnEnter => "on_enter",
            HookKind::OnExit => "on_exit",
            HookKind::OnChange => "on_change",
            HookKind::Trigger => "trigger",
            HookKind::Action => "action",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enter/exit/change/action callback.
pub type Callback = Arc<dyn Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync>;

/// Trigger callback, returns the event to send next.
pub type TriggerFn = Arc<dyn Fn(&mut RunnerProxy<'_>) -> Result<String, CoreError> + Send + Sync>;

/// Injected trigger source, receives the declared identifier.
pub type TriggerSource =
    Arc<dyn Fn(&mut RunnerProxy<'_>, &str) -> Result<String, CoreError> + Send + Sync>;

/// Injected action source, receives the declared identifier.
pub type ActionSource =
    Arc<dyn Fn(&mut RunnerProxy<'_>, &str) -> Result<(), CoreError> + Send + Sync>;

/// Resolves declared identifiers to callables.
pub trait CallbackResolver: Send + Sync {
    /// Resolves an enter/exit/change/action identifier declared by `state`.
    fn resolve_hook(&self, identifier: &str, state: &str, kind: HookKind) -> Option<Callback>;

    /// Resolves a trigger identifier declared by `state`.
    fn resolve_trigger(&self, identifier: &str, state: &str) -> Option<TriggerFn>;

    /// Returns true if the identifier resolves. Used for load-time checks.
    fn can_resolve(&self, identifier: &str, state: &str, kind: HookKind) -> bool {
        match kind {
            HookKind::Trigger => self.resolve_trigger(identifier, state).is_some(),
            _ => self.resolve_hook(identifier, state, kind).is_some(),
        }
    }
}

/// Resolver that knows no callbacks.
///
/// Charts declaring hook identifiers fail to load with it unless load-time
/// verification is disabled or a processing map covers them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCallbacks;

impl CallbackResolver for NoCallbacks {
    fn resolve_hook(&self, _identifier: &str, _state: &str, _kind: HookKind) -> Option<Callback> {
        None
    }

    fn resolve_trigger(&self, _identifier: &str, _state: &str) -> Option<TriggerFn> {
        None
    }
}

/// Name -> function table.
///
/// Hooks and triggers live in separate namespaces, so `"check"` may name
/// both an action and a trigger.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Callback>,
    triggers: HashMap<String, TriggerFn>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an enter/exit/change/action callback.
    pub fn callback<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.register_callback(name, f);
        self
    }

    /// Registers a trigger.
    pub fn trigger<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<String, CoreError> + Send + Sync + 'static,
    {
        self.register_trigger(name, f);
        self
    }

    pub fn register_callback<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(f));
    }

    pub fn register_trigger<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<String, CoreError> + Send + Sync + 'static,
    {
        self.triggers.insert(name.into(), Arc::new(f));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len() + self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.triggers.is_empty()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut callbacks: Vec<&String> = self.callbacks.keys().collect();
        let mut triggers: Vec<&String> = self.triggers.keys().collect();
        callbacks.sort();
        triggers.sort();
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &callbacks)
            .field("triggers", &triggers)
            .finish()
    }
}

impl CallbackResolver for CallbackRegistry {
    fn resolve_hook(&self, identifier: &str, _state: &str, _kind: HookKind) -> Option<Callback> {
        self.callbacks.get(identifier).cloned()
    }

    fn resolve_trigger(&self, identifier: &str, _state: &str) -> Option<TriggerFn> {
        self.triggers.get(identifier).cloned()
    }
}

/// Two callables shared by every state: identifiers are passed through as
/// arguments instead of being looked up.
///
/// Only `trigger` and `action` hooks resolve through this strategy.
#[derive(Clone, Default)]
pub struct InjectedSources {
    trigger_source: Option<TriggerSource>,
    action_source: Option<ActionSource>,
}

impl InjectedSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger_source<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>, &str) -> Result<String, CoreError> + Send + Sync + 'static,
    {
        self.trigger_source = Some(Arc::new(f));
        self
    }

    pub fn with_action_source<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>, &str) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.action_source = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for InjectedSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedSources")
            .field("trigger_source", &self.trigger_source.is_some())
            .field("action_source", &self.action_source.is_some())
            .finish()
    }
}

impl CallbackResolver for InjectedSources {
    fn resolve_hook(&self, identifier: &str, _state: &str, kind: HookKind) -> Option<Callback> {
        if kind != HookKind::Action {
            return None;
        }
        let source = self.action_source.clone()?;
        let identifier = identifier.to_string();
        let callback: Callback =
            Arc::new(move |proxy: &mut RunnerProxy<'_>| source(proxy, &identifier));
        Some(callback)
    }

    fn resolve_trigger(&self, identifier: &str, _state: &str) -> Option<TriggerFn> {
        let source = self.trigger_source.clone()?;
        let identifier = identifier.to_string();
        let trigger: TriggerFn =
            Arc::new(move |proxy: &mut RunnerProxy<'_>| source(proxy, &identifier));
        Some(trigger)
    }
}

/// Callables bound to one state.
#[derive(Clone, Default)]
struct StateHooks {
    on_enter: Option<Callback>,
    on_exit: Option<Callback>,
    on_change: Option<Callback>,
    action: Option<Callback>,
    trigger: Option<TriggerFn>,
}

/// Per-state overrides that take precedence over declared identifiers.
///
/// A state present in the map only has the hooks set here overridden; its
/// other declared identifiers still go through the resolver.
#[derive(Clone, Default)]
pub struct ProcessingMap {
    states: HashMap<String, StateHooks>,
}

impl ProcessingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter<F>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.hook(state, HookKind::OnEnter, Arc::new(f))
    }

    pub fn on_exit<F>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.hook(state, HookKind::OnExit, Arc::new(f))
    }

    pub fn on_change<F>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.hook(state, HookKind::OnChange, Arc::new(f))
    }

    pub fn action<F>(self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> + Send + Sync + 'static,
    {
        self.hook(state, HookKind::Action, Arc::new(f))
    }

    pub fn trigger<F>(mut self, state: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut RunnerProxy<'_>) -> Result<String, CoreError> + Send + Sync + 'static,
    {
        self.states.entry(state.into()).or_default().trigger = Some(Arc::new(f));
        self
    }

    fn hook(mut self, state: impl Into<String>, kind: HookKind, f: Callback) -> Self {
        let hooks = self.states.entry(state.into()).or_default();
        match kind {
            HookKind::OnEnter => hooks.on_enter = Some(f),
            HookKind::OnExit => hooks.on_exit = Some(f),
            HookKind::OnChange => hooks.on_change = Some(f),
            HookKind::Action => hooks.action = Some(f),
            HookKind::Trigger => {}
        }
        self
    }

    /// Returns the override for a non-trigger hook of `state`.
    pub fn callback_for(&self, state: &str, kind: HookKind) -> Option<Callback> {
        let hooks = self.states.get(state)?;
        match kind {
            HookKind::OnEnter => hooks.on_enter.clone(),
            HookKind::OnExit => hooks.on_exit.clone(),
            HookKind::OnChange => hooks.on_change.clone(),
            HookKind::Action => hooks.action.clone(),
            HookKind::Trigger => None,
        }
    }

    pub fn trigger_for(&self, state: &str) -> Option<TriggerFn> {
        self.states.get(state)?.trigger.clone()
    }

    /// Returns true if the map overrides the given hook of `state`.
    pub fn covers(&self, state: &str, kind: HookKind) -> bool {
        match kind {
            HookKind::Trigger => self.trigger_for(state).is_some(),
            _ => self.callback_for(state, kind).is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl fmt::Debug for ProcessingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut states: Vec<&String> = self.states.keys().collect();
        states.sort();
        f.debug_struct("ProcessingMap")
            .field("states", &states)
            .finish()
    }
}
