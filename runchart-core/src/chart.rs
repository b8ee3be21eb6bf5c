//! State chart model.
//!
//! A [`StateChart`] is built once (see [`crate::builder`]) and is immutable
//! afterwards except for its position: the current state, the history log
//! and the per-machine datamodel, which only the runner mutates.
//!
//! Transition lookups are O(1): the table is indexed by event first, then by
//! source state, and destinations are resolved to [`StateId`]s at build time.

use crate::callback::HookKind;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Datamodel key naming the party that owns a machine.
pub const OWNER_KEY: &str = "owner";

/// Index of a state inside its chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub(crate) usize);

/// A state in the chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Unique name.
    pub name: String,

    /// Outgoing events: event -> destination state name.
    #[serde(default)]
    pub events: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_enter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_change: Option<String>,

    /// Trigger identifier, produces the next event automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,

    /// Action identifier, a side effect that never chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default)]
    pub is_initial: bool,

    #[serde(default)]
    pub is_final: bool,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: BTreeMap::new(),
            on_enter: None,
            on_exit: None,
            on_change: None,
            trigger: None,
            action: None,
            is_initial: false,
            is_final: true,
        }
    }

    /// Returns the identifier declared for the given hook, if any.
    pub fn declared(&self, kind: HookKind) -> Option<&str> {
        match kind {
            HookKind::OnEnter => self.on_enter.as_deref(),
            HookKind::OnExit => self.on_exit.as_deref(),
            HookKind::OnChange => self.on_change.as_deref(),
            HookKind::Trigger => self.trigger.as_deref(),
            HookKind::Action => self.action.as_deref(),
        }
    }
}

/// How a transition came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    /// The initial transition performed by `start`.
    Initial,
    /// An externally sent event.
    Event,
    /// An event produced by a trigger.
    Trigger,
}

/// One committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Commit time (Unix millis).
    pub timestamp: i64,

    /// Event that caused the transition, `None` for the initial one.
    pub event: Option<String>,

    /// State left, `None` for the initial transition.
    pub src: Option<String>,

    /// State entered.
    pub state: String,

    pub status: TransitionStatus,
}

/// Validated and indexed state chart.
#[derive(Debug, Clone)]
pub struct StateChart {
    pub(crate) id: String,
    pub(crate) name: String,
    /// States ordered by name.
    pub(crate) states: Vec<State>,
    pub(crate) index: HashMap<String, StateId>,
    /// event -> (source -> destination)
    pub(crate) table: HashMap<String, HashMap<StateId, StateId>>,
    pub(crate) initial: StateId,
    pub(crate) finals: BTreeSet<StateId>,
    pub(crate) current: Option<StateId>,
    pub(crate) history: Vec<HistoryRecord>,
    pub(crate) datamodel: Map<String, Value>,
}

impl StateChart {
    /// Indexes and validates a set of flat states.
    ///
    /// Shared by the builder and the deserializer; meta states must already
    /// be flattened.
    pub(crate) fn assemble(
        name: impl Into<String>,
        mut states: Vec<State>,
        datamodel: Map<String, Value>,
    ) -> Result<Self, CoreError> {
        states.sort_by(|a, b| a.name.cmp(&b.name));

        let mut index = HashMap::with_capacity(states.len());
        for (i, state) in states.iter().enumerate() {
            if state.name.is_empty() {
                return Err(CoreError::MalformedChart {
                    reason: "state with an empty identifier".to_string(),
                });
            }
            if index.insert(state.name.clone(), StateId(i)).is_some() {
                return Err(CoreError::MalformedChart {
                    reason: format!("state '{}' is declared more than once", state.name),
                });
            }
        }

        let initials: Vec<&State> = states.iter().filter(|s| s.is_initial).collect();
        let initial = match initials.as_slice() {
            [] => return Err(CoreError::NoInitialState),
            [only] => index[&only.name],
            many => {
                return Err(CoreError::AmbiguousInitialState {
                    states: many.iter().map(|s| s.name.clone()).collect(),
                })
            }
        };

        let mut table: HashMap<String, HashMap<StateId, StateId>> = HashMap::new();
        for (i, state) in states.iter().enumerate() {
            for (event, target) in &state.events {
                let dst = index
                    .get(target)
                    .copied()
                    .ok_or_else(|| CoreError::UnknownTarget {
                        state: state.name.clone(),
                        event: event.clone(),
                        target: target.clone(),
                    })?;
                table.entry(event.clone()).or_default().insert(StateId(i), dst);
            }
        }

        let finals = states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_final)
            .map(|(i, _)| StateId(i))
            .collect();

        let id = content_id(&states)?;

        Ok(Self {
            id,
            name: name.into(),
            states,
            index,
            table,
            initial,
            finals,
            current: None,
            history: Vec::new(),
            datamodel,
        })
    }

    /// Content-derived identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chart type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owner recorded in the datamodel.
    pub fn owner(&self) -> Option<&str> {
        self.datamodel.get(OWNER_KEY).and_then(Value::as_str)
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.datamodel
            .insert(OWNER_KEY.to_string(), Value::String(owner.into()));
    }

    pub fn datamodel(&self) -> &Map<String, Value> {
        &self.datamodel
    }

    pub fn datamodel_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.datamodel
    }

    /// Looks up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|id| &self.states[id.0])
    }

    /// All states, ordered by name.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// All declared events, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.table.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    /// Returns true if the event is declared by any state.
    pub fn is_registered(&self, event: &str) -> bool {
        self.table.contains_key(event)
    }

    /// Returns the destination of `event` from the named state.
    pub fn transition(&self, event: &str, from: &str) -> Option<&State> {
        let from = self.index.get(from)?;
        self.lookup(event, *from).map(|id| self.get(id))
    }

    pub fn initial_state(&self) -> &State {
        self.get(self.initial)
    }

    pub fn final_states(&self) -> Vec<&State> {
        self.finals.iter().map(|id| self.get(*id)).collect()
    }

    /// The occupied state, `None` until started.
    pub fn current_state(&self) -> Option<&State> {
        self.current.map(|id| self.get(id))
    }

    pub fn is_started(&self) -> bool {
        self.current.is_some()
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Returns true if both charts were built from the same definition,
    /// whatever their positions.
    pub fn same_definition(&self, other: &StateChart) -> bool {
        self.id == other.id
    }

    pub(crate) fn get(&self, id: StateId) -> &State {
        &self.states[id.0]
    }

    pub(crate) fn lookup(&self, event: &str, from: StateId) -> Option<StateId> {
        self.table.get(event).and_then(|sources| sources.get(&from)).copied()
    }

    pub(crate) fn is_final_id(&self, id: StateId) -> bool {
        self.finals.contains(&id)
    }

    pub(crate) fn commit(&mut self, dst: StateId, record: HistoryRecord) {
        self.current = Some(dst);
        self.history.push(record);
    }

    /// Flattened `(event, source, destination)` triples in canonical order.
    pub(crate) fn transition_triples(&self) -> Vec<(String, String, String)> {
        let mut triples: Vec<(String, String, String)> = self
            .table
            .iter()
            .flat_map(|(event, sources)| {
                sources.iter().map(move |(src, dst)| {
                    (
                        event.clone(),
                        self.get(*src).name.clone(),
                        self.get(*dst).name.clone(),
                    )
                })
            })
            .collect();
        triples.sort();
        triples
    }
}

impl PartialEq for StateChart {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.states == other.states
            && self.initial == other.initial
            && self.finals == other.finals
            && self.current == other.current
            && self.history == other.history
            && self.datamodel == other.datamodel
    }
}

impl Eq for StateChart {}

/// SHA-256 over the canonical JSON encoding of the name-ordered states.
fn content_id(states: &[State]) -> Result<String, CoreError> {
    let canonical = serde_json::to_vec(states)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
