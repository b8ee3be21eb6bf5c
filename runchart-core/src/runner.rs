//! Transition engine.
//!
//! A [`Runner`] holds at most one chart and drives it:
//!
//! ```text
//! Unloaded --load--> Loaded --start--> Started(initial) --send--> Started(s) ...
//! ```
//!
//! Every transition (the initial one, each sent event and each event produced
//! by a trigger) follows the same protocol:
//!
//! 1. source `on_exit` (and source `on_change` with `source_on_change`)
//! 2. destination `on_enter`
//! 3. commit: current state, history record, payload merge
//! 4. flush hook
//! 5. destination `on_change`
//! 6. destination `action`
//! 7. destination `trigger`, whose event is sent next
//!
//! Step 7 is a loop, not recursion: chained transitions are bounded by
//! [`RunnerOptions::max_trigger_depth`] and, by default, a chain that sends
//! the same event from the same state twice is rejected.

use crate::builder::{ChartBuilder, ChartDescription};
use crate::callback::{Callback, CallbackResolver, HookKind, NoCallbacks, ProcessingMap, TriggerFn};
use crate::chart::{HistoryRecord, State, StateChart, StateId, TransitionStatus, OWNER_KEY};
use crate::codec::{self, Format};
use crate::error::CoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Error returned by a [`FlushHook`].
pub type FlushError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence hook invoked after every commit.
pub type FlushHook = Arc<dyn Fn(&StateChart) -> Result<(), FlushError> + Send + Sync>;

/// Engine knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Maximum chained trigger transitions per `start`/`send`.
    pub max_trigger_depth: usize,

    /// Reject chains that send the same event from the same state twice.
    ///
    /// This also rejects finite loops steered by the datamodel, such as a
    /// retry counter that sends `retry` from the same state until it runs
    /// out. Disable it for such charts and rely on `max_trigger_depth`.
    pub detect_trigger_cycles: bool,

    /// Resolve every declared identifier when a chart is loaded.
    pub verify_callbacks_on_load: bool,

    /// Merge object payloads into the datamodel on commit.
    pub merge_payload: bool,

    /// Also fire the source state's `on_change` right after its `on_exit`.
    pub source_on_change: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_trigger_depth: 64,
            detect_trigger_cycles: true,
            verify_callbacks_on_load: true,
            merge_payload: false,
            source_on_change: false,
        }
    }
}

/// View of the running machine handed to callbacks.
pub struct RunnerProxy<'a> {
    pub chart_id: &'a str,
    pub chart_name: &'a str,
    /// Event being processed, `None` during the initial transition.
    pub event: Option<&'a str>,
    pub payload: &'a Value,
    pub src: Option<&'a State>,
    pub dst: &'a State,
    /// Shared datamodel. The `owner` entry is fixed: changes to it are
    /// reverted once the callback returns.
    pub datamodel: &'a mut Map<String, Value>,
}

impl RunnerProxy<'_> {
    pub fn owner(&self) -> Option<&str> {
        self.datamodel.get(OWNER_KEY).and_then(Value::as_str)
    }

    /// Reads a payload field.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// One planned transition.
struct Step {
    event: Option<String>,
    src: Option<StateId>,
    dst: StateId,
    status: TransitionStatus,
}

/// Executes a state chart.
pub struct Runner {
    chart: Option<StateChart>,
    resolver: Arc<dyn CallbackResolver>,
    processing_map: ProcessingMap,
    options: RunnerOptions,
    flush_hook: Option<FlushHook>,
    autosave: bool,
}

impl Runner {
    /// Creates an unloaded runner that resolves no callbacks.
    pub fn new() -> Self {
        Self::with_shared_resolver(Arc::new(NoCallbacks))
    }

    pub fn with_resolver<R: CallbackResolver + 'static>(resolver: R) -> Self {
        Self::with_shared_resolver(Arc::new(resolver))
    }

    /// Creates a runner sharing a resolver with others, as pooled runners do.
    pub fn with_shared_resolver(resolver: Arc<dyn CallbackResolver>) -> Self {
        Self {
            chart: None,
            resolver,
            processing_map: ProcessingMap::new(),
            options: RunnerOptions::default(),
            flush_hook: None,
            autosave: true,
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Replaces the per-state overrides. The loaded chart is untouched.
    pub fn register_processing_map(&mut self, map: ProcessingMap) {
        self.processing_map = map;
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Loads a chart, replacing any held one.
    ///
    /// A chart that was started stays started. On failure the runner is left
    /// unloaded.
    pub fn load(&mut self, chart: StateChart) -> Result<&mut Self, CoreError> {
        self.chart = None;
        if self.options.verify_callbacks_on_load {
            self.verify_callbacks(&chart)?;
        }
        tracing::debug!(
            "Loaded chart {} ({}), current state {:?}",
            chart.name(),
            short_id(chart.id()),
            chart.current_state().map(|s| s.name.as_str())
        );
        self.chart = Some(chart);
        Ok(self)
    }

    /// Loads a dump produced by [`Runner::dump`], in either format.
    pub fn load_serialized(&mut self, data: &[u8]) -> Result<&mut Self, CoreError> {
        self.chart = None;
        let chart = codec::decode(data)?;
        self.load(chart)
    }

    pub fn load_json(&mut self, data: &str) -> Result<&mut Self, CoreError> {
        self.load_serialized(data.as_bytes())
    }

    /// Builds a chart from a description and loads it.
    pub fn parse(&mut self, description: ChartDescription) -> Result<&mut Self, CoreError> {
        self.chart = None;
        let chart = ChartBuilder::new(description).build()?;
        self.load(chart)
    }

    /// Unloads the chart.
    pub fn clear(&mut self) {
        self.chart = None;
    }

    pub fn chart(&self) -> Option<&StateChart> {
        self.chart.as_ref()
    }

    /// Mutable access to the machine data of the loaded chart.
    pub fn datamodel_mut(&mut self) -> Result<&mut Map<String, Value>, CoreError> {
        Ok(self.chart.as_mut().ok_or(CoreError::NotLoaded)?.datamodel_mut())
    }

    pub fn is_loaded(&self) -> bool {
        self.chart.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.chart.as_ref().is_some_and(StateChart::is_started)
    }

    /// Returns true if the loaded chart is of `chart_type` and owned by `owner`.
    pub fn is_occupied_by(&self, owner: &str, chart_type: &str) -> bool {
        self.chart
            .as_ref()
            .is_some_and(|c| c.name() == chart_type && c.owner() == Some(owner))
    }

    pub fn dump(&self, format: Format) -> Result<Vec<u8>, CoreError> {
        codec::encode(self.loaded()?, format)
    }

    pub fn dump_json(&self) -> Result<String, CoreError> {
        let data = self.dump(Format::Json)?;
        String::from_utf8(data).map_err(|e| CoreError::InvalidModel {
            reason: e.to_string(),
        })
    }

    // =========================================================================
    // Persistence hook
    // =========================================================================

    pub fn set_flush_hook(&mut self, hook: FlushHook) {
        self.flush_hook = Some(hook);
    }

    pub fn clear_flush_hook(&mut self) {
        self.flush_hook = None;
    }

    /// Enables or disables the flush after every commit.
    pub fn set_autosave(&mut self, autosave: bool) {
        self.autosave = autosave;
    }

    /// Hands the loaded chart to the flush hook, if one is set.
    pub fn flush(&self) -> Result<(), CoreError> {
        let chart = self.loaded()?;
        if let Some(hook) = &self.flush_hook {
            hook(chart).map_err(|e| {
                tracing::warn!("Flush of chart {} failed: {}", chart.name(), e);
                CoreError::Flush(e)
            })?;
        }
        Ok(())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Performs the initial transition.
    ///
    /// Returns `Ok(false)` without side effects if already started.
    pub fn start(&mut self, payload: Value) -> Result<bool, CoreError> {
        let chart = self.loaded()?;
        if chart.is_started() {
            return Ok(false);
        }
        let step = Step {
            event: None,
            src: None,
            dst: chart.initial,
            status: TransitionStatus::Initial,
        };
        self.run(step, &payload)?;
        Ok(true)
    }

    /// Sends an event to the machine.
    pub fn send(&mut self, event: &str, payload: Value) -> Result<bool, CoreError> {
        let (chart, current) = self.started()?;
        let dst = match chart.lookup(event, current) {
            Some(dst) => dst,
            None if !chart.is_registered(event) => {
                return Err(CoreError::UnregisteredEvent {
                    event: event.to_string(),
                })
            }
            None => {
                return Err(CoreError::ImpossibleEvent {
                    event: event.to_string(),
                    state: chart.get(current).name.clone(),
                })
            }
        };
        let step = Step {
            event: Some(event.to_string()),
            src: Some(current),
            dst,
            status: TransitionStatus::Event,
        };
        self.run(step, &payload)?;
        Ok(true)
    }

    /// Returns true if `event` can be sent from the current state.
    pub fn can_send(&self, event: &str) -> Result<bool, CoreError> {
        let chart = self.loaded()?;
        Ok(chart
            .current
            .is_some_and(|current| chart.lookup(event, current).is_some()))
    }

    /// Events available from the current state, with their destinations.
    pub fn possible_transitions(&self) -> Result<&BTreeMap<String, String>, CoreError> {
        let (chart, current) = self.started()?;
        Ok(&chart.get(current).events)
    }

    pub fn in_state(&self, name: &str) -> Result<bool, CoreError> {
        let (chart, current) = self.started()?;
        Ok(chart.get(current).name == name)
    }

    /// Returns true if the current state is final.
    pub fn is_finished(&self) -> Result<bool, CoreError> {
        let (chart, current) = self.started()?;
        Ok(chart.is_final_id(current))
    }

    pub fn is_initial(&self) -> Result<bool, CoreError> {
        let (chart, current) = self.started()?;
        Ok(current == chart.initial)
    }

    pub fn current_state(&self) -> Result<&State, CoreError> {
        let (chart, current) = self.started()?;
        Ok(chart.get(current))
    }

    pub fn history(&self) -> Result<&[HistoryRecord], CoreError> {
        Ok(self.loaded()?.history())
    }

    /// Human readable history: `(one:- @ts) -> (two:true @ts)`.
    pub fn describe_history(&self) -> Result<String, CoreError> {
        let chart = self.loaded()?;
        if chart.history().is_empty() {
            return Ok(format!("{} [{}]: not started", chart.name(), short_id(chart.id())));
        }
        let steps: Vec<String> = chart
            .history()
            .iter()
            .map(|r| {
                format!(
                    "({}:{} @{})",
                    r.state,
                    r.event.as_deref().unwrap_or("-"),
                    r.timestamp
                )
            })
            .collect();
        Ok(format!(
            "{} [{}]: {}",
            chart.name(),
            short_id(chart.id()),
            steps.join(" -> ")
        ))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn loaded(&self) -> Result<&StateChart, CoreError> {
        self.chart.as_ref().ok_or(CoreError::NotLoaded)
    }

    fn loaded_mut(&mut self) -> Result<&mut StateChart, CoreError> {
        self.chart.as_mut().ok_or(CoreError::NotLoaded)
    }

    fn started(&self) -> Result<(&StateChart, StateId), CoreError> {
        let chart = self.loaded()?;
        let current = chart.current.ok_or(CoreError::NotStarted)?;
        Ok((chart, current))
    }

    fn verify_callbacks(&self, chart: &StateChart) -> Result<(), CoreError> {
        for state in chart.states() {
            for kind in HookKind::ALL {
                let Some(identifier) = state.declared(kind) else {
                    continue;
                };
                if self.processing_map.covers(&state.name, kind) {
                    continue;
                }
                if !self.resolver.can_resolve(identifier, &state.name, kind) {
                    return Err(undefined(state, kind, identifier));
                }
            }
        }
        Ok(())
    }

    fn callback_for(&self, state: &State, kind: HookKind) -> Result<Option<Callback>, CoreError> {
        if let Some(callback) = self.processing_map.callback_for(&state.name, kind) {
            return Ok(Some(callback));
        }
        match state.declared(kind) {
            None => Ok(None),
            Some(identifier) => self
                .resolver
                .resolve_hook(identifier, &state.name, kind)
                .map(Some)
                .ok_or_else(|| undefined(state, kind, identifier)),
        }
    }

    fn trigger_for(&self, state: &State) -> Result<Option<TriggerFn>, CoreError> {
        if let Some(trigger) = self.processing_map.trigger_for(&state.name) {
            return Ok(Some(trigger));
        }
        match state.trigger.as_deref() {
            None => Ok(None),
            Some(identifier) => self
                .resolver
                .resolve_trigger(identifier, &state.name)
                .map(Some)
                .ok_or_else(|| undefined(state, HookKind::Trigger, identifier)),
        }
    }

    /// Applies `first` and every transition its triggers chain into.
    fn run(&mut self, first: Step, payload: &Value) -> Result<(), CoreError> {
        let max_depth = self.options.max_trigger_depth;
        let detect_cycles = self.options.detect_trigger_cycles;
        let mut sent: HashSet<(StateId, String)> = HashSet::new();
        let mut depth = 0;
        let mut step = first;

        loop {
            self.apply(&step, payload)?;

            let Some(event) = self.next_event(&step, payload)? else {
                return Ok(());
            };
            let from = step.dst;
            let chart = self.loaded()?;

            depth += 1;
            if depth > max_depth {
                tracing::warn!(
                    "Trigger chain in chart {} aborted at state {} after {} transitions",
                    chart.name(),
                    chart.get(from).name,
                    max_depth
                );
                return Err(CoreError::TriggerChainTooLong { max_depth });
            }
            if detect_cycles && !sent.insert((from, event.clone())) {
                tracing::warn!(
                    "Trigger cycle in chart {}: event {} from state {} repeated",
                    chart.name(),
                    event,
                    chart.get(from).name
                );
                return Err(CoreError::TriggerCycle {
                    state: chart.get(from).name.clone(),
                    event,
                });
            }

            let dst = chart
                .lookup(&event, from)
                .ok_or_else(|| CoreError::WrongTrigger {
                    event: event.clone(),
                    state: chart.get(from).name.clone(),
                })?;
            step = Step {
                event: Some(event),
                src: Some(from),
                dst,
                status: TransitionStatus::Trigger,
            };
        }
    }

    /// Steps 1 to 6 of the protocol.
    fn apply(&mut self, step: &Step, payload: &Value) -> Result<(), CoreError> {
        if let Some(src) = step.src {
            self.fire(HookKind::OnExit, src, step, payload)?;
            if self.options.source_on_change {
                self.fire(HookKind::OnChange, src, step, payload)?;
            }
        }
        self.fire(HookKind::OnEnter, step.dst, step, payload)?;

        let merge_payload = self.options.merge_payload;
        let chart = self.loaded_mut()?;
        let record = HistoryRecord {
            timestamp: Utc::now().timestamp_millis(),
            event: step.event.clone(),
            src: step.src.map(|id| chart.get(id).name.clone()),
            state: chart.get(step.dst).name.clone(),
            status: step.status,
        };
        tracing::debug!(
            "Chart {} moved {} -> {} on {:?} ({:?})",
            chart.name(),
            record.src.as_deref().unwrap_or("-"),
            record.state,
            record.event,
            record.status
        );
        chart.commit(step.dst, record);
        if merge_payload {
            if let Value::Object(fields) = payload {
                for (key, value) in fields {
                    if key == OWNER_KEY {
                        tracing::warn!(
                            "Ignoring payload field {} for chart {}: the owner is fixed",
                            OWNER_KEY,
                            chart.name()
                        );
                        continue;
                    }
                    chart.datamodel.insert(key.clone(), value.clone());
                }
            }
        }

        if self.autosave {
            self.flush()?;
        }

        self.fire(HookKind::OnChange, step.dst, step, payload)?;
        self.fire(HookKind::Action, step.dst, step, payload)
    }

    fn fire(
        &mut self,
        kind: HookKind,
        state: StateId,
        step: &Step,
        payload: &Value,
    ) -> Result<(), CoreError> {
        let callback = {
            let chart = self.loaded()?;
            self.callback_for(chart.get(state), kind)?
        };
        let Some(callback) = callback else {
            return Ok(());
        };
        let chart = self.loaded_mut()?;
        chart.with_proxy(step, payload, |proxy| callback(proxy))
    }

    /// Step 7: asks the destination's trigger for the next event.
    fn next_event(&mut self, step: &Step, payload: &Value) -> Result<Option<String>, CoreError> {
        let trigger = {
            let chart = self.loaded()?;
            self.trigger_for(chart.get(step.dst))?
        };
        let Some(trigger) = trigger else {
            return Ok(None);
        };

        let chart = self.loaded_mut()?;
        let event = chart.with_proxy(step, payload, |proxy| trigger(proxy))?;
        if chart.lookup(&event, step.dst).is_none() {
            tracing::warn!(
                "Trigger of state {} in chart {} produced unusable event {}",
                chart.get(step.dst).name,
                chart.name(),
                event
            );
            return Err(CoreError::WrongTrigger {
                event,
                state: chart.get(step.dst).name.clone(),
            });
        }
        Ok(Some(event))
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("chart", &self.chart.as_ref().map(StateChart::name))
            .field(
                "current",
                &self
                    .chart
                    .as_ref()
                    .and_then(|c| c.current_state())
                    .map(|s| s.name.as_str()),
            )
            .field("options", &self.options)
            .field("autosave", &self.autosave)
            .field("flush_hook", &self.flush_hook.is_some())
            .finish()
    }
}

impl StateChart {
    /// Hands `f` a proxy for `step`. Changes `f` makes to the owner are
    /// reverted.
    fn with_proxy<T>(
        &mut self,
        step: &Step,
        payload: &Value,
        f: impl FnOnce(&mut RunnerProxy<'_>) -> T,
    ) -> T {
        let owner = self.datamodel.get(OWNER_KEY).cloned();
        let result = {
            let states = &self.states;
            let mut proxy = RunnerProxy {
                chart_id: &self.id,
                chart_name: &self.name,
                event: step.event.as_deref(),
                payload,
                src: step.src.map(|id| &states[id.0]),
                dst: &states[step.dst.0],
                datamodel: &mut self.datamodel,
            };
            f(&mut proxy)
        };

        if self.datamodel.get(OWNER_KEY) != owner.as_ref() {
            tracing::warn!(
                "Callback in chart {} changed {}, reverting",
                self.name,
                OWNER_KEY
            );
            match owner {
                Some(owner) => {
                    self.datamodel.insert(OWNER_KEY.to_string(), owner);
                }
                None => {
                    self.datamodel.remove(OWNER_KEY);
                }
            }
        }
        result
    }
}

fn undefined(state: &State, kind: HookKind, identifier: &str) -> CoreError {
    match kind {
        HookKind::Trigger => CoreError::UndefinedTrigger {
            state: state.name.clone(),
            trigger: identifier.to_string(),
        },
        HookKind::Action => CoreError::UndefinedAction {
            state: state.name.clone(),
            action: identifier.to_string(),
        },
        _ => CoreError::UndefinedCallback {
            state: state.name.clone(),
            hook: kind.as_str(),
            callback: identifier.to_string(),
        },
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StateDescription;
    use crate::callback::{CallbackRegistry, InjectedSources};
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;

    const RULES: &str = r#"[
        {"state": "one", "is_initial": true, "events": {"true": "two", "false": "three"}},
        {"state": "two"},
        {"state": "three"}
    ]"#;

    fn rules_runner() -> Runner {
        let mut runner = Runner::new();
        runner.load(StateChart::from_json(RULES).unwrap()).unwrap();
        runner
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, entry: &str) -> impl Fn(&mut RunnerProxy<'_>) -> Result<(), CoreError> {
        let log = log.clone();
        let entry = entry.to_string();
        move |_| {
            log.lock().push(entry.clone());
            Ok(())
        }
    }

    #[test]
    fn test_preconditions() {
        let mut runner = Runner::new();
        assert!(matches!(runner.start(Value::Null), Err(CoreError::NotLoaded)));
        assert!(matches!(runner.can_send("true"), Err(CoreError::NotLoaded)));
        assert!(matches!(runner.send("true", Value::Null), Err(CoreError::NotLoaded)));
        assert!(matches!(runner.dump(Format::Json), Err(CoreError::NotLoaded)));

        let mut runner = rules_runner();
        assert!(runner.is_loaded());
        assert!(!runner.is_started());
        assert!(!runner.can_send("true").unwrap());
        assert!(matches!(runner.send("true", Value::Null), Err(CoreError::NotStarted)));
        assert!(matches!(runner.in_state("one"), Err(CoreError::NotStarted)));
        assert!(matches!(runner.is_finished(), Err(CoreError::NotStarted)));
        assert!(matches!(runner.possible_transitions(), Err(CoreError::NotStarted)));
        assert!(runner.history().unwrap().is_empty());
    }

    #[test]
    fn test_one_two_three() {
        let mut runner = rules_runner();

        assert!(runner.start(Value::Null).unwrap());
        assert!(runner.in_state("one").unwrap());
        assert!(runner.is_initial().unwrap());
        assert!(!runner.is_finished().unwrap());
        assert!(runner.can_send("true").unwrap());
        assert!(runner.can_send("false").unwrap());
        assert_eq!(runner.possible_transitions().unwrap().len(), 2);

        assert!(runner.send("true", Value::Null).unwrap());
        assert!(runner.in_state("two").unwrap());
        assert!(runner.is_finished().unwrap());
        assert!(!runner.can_send("true").unwrap());
        assert!(!runner.can_send("false").unwrap());

        let err = runner.send("true", Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::ImpossibleEvent { ref state, .. } if state == "two"));

        let err = runner.send("ghost", Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::UnregisteredEvent { .. }));
        assert_eq!(err.kind(), ErrorKind::Event);

        let history = runner.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TransitionStatus::Initial);
        assert_eq!(history[0].src, None);
        assert_eq!(history[0].event, None);
        assert_eq!(history[1].src.as_deref(), Some("one"));
        assert_eq!(history[1].state, "two");
        assert_eq!(history[1].event.as_deref(), Some("true"));
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut runner = rules_runner();
        assert!(runner.start(Value::Null).unwrap());
        assert!(!runner.start(Value::Null).unwrap());
        assert_eq!(runner.history().unwrap().len(), 1);
    }

    #[test]
    fn test_protocol_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new()
            .callback("exit_a", recorder(&log, "exit:a"))
            .callback("enter_a", recorder(&log, "enter:a"))
            .callback("change_a", recorder(&log, "change:a"))
            .callback("enter_b", recorder(&log, "enter:b"))
            .callback("change_b", recorder(&log, "change:b"))
            .callback("act_b", recorder(&log, "action:b"));
        let chart = StateChart::from_json(
            r#"[
                {"state": "a", "initial": true, "events": {"go": "b"},
                 "on_enter": "enter_a", "on_exit": "exit_a", "on_change": "change_a"},
                {"state": "b", "on_enter": "enter_b", "on_change": "change_b", "action": "act_b"}
            ]"#,
        )
        .unwrap();

        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();

        let flushes = log.clone();
        runner.set_flush_hook(Arc::new(move |chart: &StateChart| -> Result<(), FlushError> {
            let current = chart.current_state().map(|s| s.name.clone()).unwrap_or_default();
            flushes.lock().push(format!("flush:{}", current));
            Ok(())
        }));

        runner.start(Value::Null).unwrap();
        runner.send("go", Value::Null).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "enter:a", "flush:a", "change:a", "exit:a", "enter:b", "flush:b", "change:b",
                "action:b",
            ]
        );
    }

    #[test]
    fn test_source_on_change_option() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let map = ProcessingMap::new()
            .on_change("one", recorder(&log, "change:one"))
            .on_change("two", recorder(&log, "change:two"));

        let mut runner = Runner::new().with_options(RunnerOptions {
            source_on_change: true,
            ..RunnerOptions::default()
        });
        runner.register_processing_map(map);
        runner.load(StateChart::from_json(RULES).unwrap()).unwrap();
        runner.start(Value::Null).unwrap();
        log.lock().clear();

        runner.send("true", Value::Null).unwrap();
        assert_eq!(*log.lock(), vec!["change:one", "change:two"]);
    }

    #[test]
    fn test_triggers_chain() {
        let registry = CallbackRegistry::new().trigger("answer", |proxy| {
            Ok(proxy.arg("answer").and_then(Value::as_str).unwrap_or("false").to_string())
        });
        let chart = StateChart::from_json(
            r#"[
                {"state": "one", "is_initial": true, "trigger": "answer",
                 "events": {"true": "two", "false": "three"}},
                {"state": "two"},
                {"state": "three"}
            ]"#,
        )
        .unwrap();

        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();
        runner.start(json!({"answer": "true"})).unwrap();

        assert!(runner.in_state("two").unwrap());
        let history = runner.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, TransitionStatus::Trigger);
        assert_eq!(history[1].event.as_deref(), Some("true"));
    }

    #[test]
    fn test_wrong_trigger() {
        let registry = CallbackRegistry::new()
            .trigger("yes", |_| Ok("true".to_string()))
            .trigger("no", |_| Ok("false".to_string()));
        let chart = StateChart::from_json(
            r#"[
                {"state": "one", "is_initial": true, "trigger": "yes", "events": {"true": "two"}},
                {"state": "two", "trigger": "no", "events": {"back": "one"}}
            ]"#,
        )
        .unwrap();

        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();

        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(
            err,
            CoreError::WrongTrigger { ref event, ref state } if event == "false" && state == "two"
        ));
        assert_eq!(err.kind(), ErrorKind::TriggerConsistency);

        // The chain stops at the last committed state.
        assert!(runner.in_state("two").unwrap());
        assert_eq!(runner.history().unwrap().len(), 2);
    }

    #[test]
    fn test_injected_sources() {
        let actions: Log = Arc::new(Mutex::new(Vec::new()));
        let seen = actions.clone();
        let sources = InjectedSources::new()
            .with_trigger_source(|proxy, id| match id {
                "1" => Ok(proxy.arg("first").and_then(Value::as_str).unwrap_or("false").to_string()),
                other => Err(CoreError::condition(format!("no rule {}", other))),
            })
            .with_action_source(move |proxy, id| {
                seen.lock().push(format!("{}@{}", id, proxy.dst.name));
                Ok(())
            });
        let chart = StateChart::from_json(
            r#"[
                {"state": "one", "is_initial": true, "trigger": "1", "action": "a1",
                 "events": {"true": "two", "false": "three"}},
                {"state": "two", "action": "a2"},
                {"state": "three", "action": "a3"}
            ]"#,
        )
        .unwrap();

        let mut runner = Runner::with_resolver(sources);
        runner.load(chart).unwrap();
        runner.start(json!({"first": "false"})).unwrap();

        assert!(runner.in_state("three").unwrap());
        assert_eq!(*actions.lock(), vec!["a1@one", "a3@three"]);
    }

    #[test]
    fn test_undefined_identifiers() {
        let chart = || {
            StateChart::from_json(
                r#"[
                    {"state": "one", "is_initial": true, "trigger": "missing", "events": {"go": "two"}},
                    {"state": "two", "on_enter": "nowhere"}
                ]"#,
            )
            .unwrap()
        };

        let mut runner = Runner::new();
        let err = runner.load(chart()).unwrap_err();
        // states are checked by name, so "one" and its trigger come first
        assert!(matches!(
            err,
            CoreError::UndefinedTrigger { ref state, ref trigger } if state == "one" && trigger == "missing"
        ));
        assert!(!runner.is_loaded());

        let mut runner = Runner::new().with_options(RunnerOptions {
            verify_callbacks_on_load: false,
            ..RunnerOptions::default()
        });
        runner.load(chart()).unwrap();
        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::UndefinedTrigger { ref trigger, .. } if trigger == "missing"));
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(runner.in_state("one").unwrap());
    }

    #[test]
    fn test_undefined_action() {
        let chart = StateChart::from_json(
            r#"[{"state": "one", "is_initial": true, "action": "ship"}]"#,
        )
        .unwrap();
        let mut runner = Runner::new();
        assert!(matches!(
            runner.load(chart),
            Err(CoreError::UndefinedAction { ref action, .. }) if action == "ship"
        ));
    }

    #[test]
    fn test_processing_map_takes_precedence() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new().callback("enter_two", recorder(&log, "declared"));
        let chart = StateChart::from_json(
            r#"[
                {"state": "one", "is_initial": true, "events": {"true": "two"}},
                {"state": "two", "on_enter": "enter_two"}
            ]"#,
        )
        .unwrap();

        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();
        runner.register_processing_map(ProcessingMap::new().on_enter("two", recorder(&log, "override")));
        runner.start(Value::Null).unwrap();
        runner.send("true", Value::Null).unwrap();

        assert_eq!(*log.lock(), vec!["override"]);
    }

    #[test]
    fn test_processing_map_satisfies_load_check() {
        let chart = StateChart::from_json(
            r#"[{"state": "one", "is_initial": true, "on_enter": "greet"}]"#,
        )
        .unwrap();
        let mut runner = Runner::new();
        runner.register_processing_map(ProcessingMap::new().on_enter("one", |_| Ok(())));
        runner.load(chart).unwrap();
        assert!(runner.start(Value::Null).unwrap());
    }

    #[test]
    fn test_business_error_propagates() {
        let chart = StateChart::from_json(
            r#"[
                {"state": "basket", "is_initial": true, "events": {"pay": "payment", "ship": "shipping"}},
                {"state": "payment", "on_enter": "check_card"},
                {"state": "shipping", "on_change": "check_address"}
            ]"#,
        )
        .unwrap();
        let registry = CallbackRegistry::new()
            .callback("check_card", |_| Err(CoreError::condition("card declined")))
            .callback("check_address", |_| Err(CoreError::condition("no address")));

        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();
        runner.start(Value::Null).unwrap();

        // on_enter runs before the commit
        let err = runner.send("pay", Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::StateCondition { ref reason } if reason == "card declined"));
        assert!(runner.in_state("basket").unwrap());
        assert_eq!(runner.history().unwrap().len(), 1);

        // on_change runs after it
        let err = runner.send("ship", Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Business);
        assert!(runner.in_state("shipping").unwrap());
        assert_eq!(runner.history().unwrap().len(), 2);
    }

    fn ping_pong(options: RunnerOptions) -> Runner {
        let chart = StateChart::from_json(
            r#"[
                {"state": "ping", "initial": true, "trigger": "next", "events": {"next": "pong"}},
                {"state": "pong", "trigger": "next", "events": {"next": "ping"}}
            ]"#,
        )
        .unwrap();
        let registry = CallbackRegistry::new().trigger("next", |_| Ok("next".to_string()));
        let mut runner = Runner::with_resolver(registry).with_options(options);
        runner.load(chart).unwrap();
        runner
    }

    #[test]
    fn test_trigger_cycle_detected() {
        let mut runner = ping_pong(RunnerOptions::default());
        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(
            err,
            CoreError::TriggerCycle { ref state, ref event } if state == "ping" && event == "next"
        ));
        // ping, pong, ping
        assert_eq!(runner.history().unwrap().len(), 3);
    }

    #[test]
    fn test_trigger_chain_bounded() {
        let mut runner = ping_pong(RunnerOptions {
            max_trigger_depth: 5,
            detect_trigger_cycles: false,
            ..RunnerOptions::default()
        });
        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::TriggerChainTooLong { max_depth: 5 }));
        assert_eq!(runner.history().unwrap().len(), 6);
    }

    #[test]
    fn test_flush_failure() {
        let mut runner = rules_runner();
        runner.set_flush_hook(Arc::new(|_: &StateChart| -> Result<(), FlushError> {
            Err("disk full".into())
        }));

        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::Flush(_)));
        assert_eq!(err.kind(), ErrorKind::Persistence);

        runner.set_autosave(false);
        runner.send("true", Value::Null).unwrap();
        assert!(runner.flush().is_err());

        runner.clear_flush_hook();
        runner.flush().unwrap();
    }

    #[test]
    fn test_merge_payload() {
        let mut runner = Runner::new().with_options(RunnerOptions {
            merge_payload: true,
            ..RunnerOptions::default()
        });
        runner.load(StateChart::from_json(RULES).unwrap()).unwrap();
        runner.start(json!({"items": 2})).unwrap();
        runner.send("true", json!({"paid": true})).unwrap();

        let datamodel = runner.chart().unwrap().datamodel();
        assert_eq!(datamodel["items"], json!(2));
        assert_eq!(datamodel["paid"], json!(true));
    }

    #[test]
    fn test_owner_is_fixed() {
        let registry = CallbackRegistry::new().callback("steal", |proxy| {
            proxy.datamodel.insert(OWNER_KEY.to_string(), json!("mallory"));
            proxy.datamodel.insert("touched".to_string(), json!(true));
            Ok(())
        });
        let chart = StateChart::from_json(
            r#"[
                {"state": "one", "is_initial": true, "events": {"go": "two"}},
                {"state": "two", "on_enter": "steal"}
            ]"#,
        )
        .unwrap();
        let mut runner = Runner::with_resolver(registry).with_options(RunnerOptions {
            merge_payload: true,
            ..RunnerOptions::default()
        });
        runner.load(chart).unwrap();
        runner.datamodel_mut().unwrap().insert(OWNER_KEY.to_string(), json!("alice"));

        runner.start(json!({"owner": "mallory", "items": 1})).unwrap();
        assert_eq!(runner.chart().unwrap().owner(), Some("alice"));
        assert_eq!(runner.chart().unwrap().datamodel()["items"], json!(1));

        runner.send("go", Value::Null).unwrap();
        assert_eq!(runner.chart().unwrap().owner(), Some("alice"));
        assert_eq!(runner.chart().unwrap().datamodel()["touched"], json!(true));
    }

    #[test]
    fn test_counted_retry_loop() {
        let chart = || {
            StateChart::from_json(
                r#"[
                    {"state": "trying", "initial": true, "on_enter": "count", "trigger": "retry",
                     "events": {"retry": "trying", "give_up": "failed"}},
                    {"state": "failed"}
                ]"#,
            )
            .unwrap()
        };
        let registry = || {
            CallbackRegistry::new()
                .callback("count", |proxy| {
                    let n = proxy.datamodel.get("attempts").and_then(Value::as_u64).unwrap_or(0);
                    proxy.datamodel.insert("attempts".to_string(), json!(n + 1));
                    Ok(())
                })
                .trigger("retry", |proxy| {
                    let n = proxy.datamodel.get("attempts").and_then(Value::as_u64).unwrap_or(0);
                    Ok(if n < 3 { "retry" } else { "give_up" }.to_string())
                })
        };

        // a finite loop still repeats (trying, retry)
        let mut runner = Runner::with_resolver(registry());
        runner.load(chart()).unwrap();
        let err = runner.start(Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::TriggerCycle { .. }));

        let mut runner = Runner::with_resolver(registry()).with_options(RunnerOptions {
            detect_trigger_cycles: false,
            ..RunnerOptions::default()
        });
        runner.load(chart()).unwrap();
        runner.start(Value::Null).unwrap();
        assert!(runner.in_state("failed").unwrap());
        assert_eq!(runner.chart().unwrap().datamodel()["attempts"], json!(3));
    }

    #[test]
    fn test_callbacks_share_datamodel() {
        let registry = CallbackRegistry::new().callback("count", |proxy| {
            let visits = proxy.datamodel.get("visits").and_then(Value::as_u64).unwrap_or(0);
            proxy.datamodel.insert("visits".to_string(), json!(visits + 1));
            Ok(())
        });
        let chart = StateChart::from_json(
            r#"[
                {"state": "a", "initial": true, "on_enter": "count", "events": {"go": "b"}},
                {"state": "b", "on_enter": "count", "events": {"go": "a"}}
            ]"#,
        )
        .unwrap();
        let mut runner = Runner::with_resolver(registry);
        runner.load(chart).unwrap();
        runner.start(Value::Null).unwrap();
        runner.send("go", Value::Null).unwrap();
        runner.send("go", Value::Null).unwrap();

        assert_eq!(runner.chart().unwrap().datamodel()["visits"], json!(3));
    }

    #[test]
    fn test_dump_and_resume() {
        let mut runner = rules_runner();
        runner.datamodel_mut().unwrap().insert(OWNER_KEY.to_string(), json!("user-1"));
        runner.start(Value::Null).unwrap();

        for format in [Format::Json, Format::Binary] {
            let dump = runner.dump(format).unwrap();

            let mut resumed = Runner::new();
            resumed.load_serialized(&dump).unwrap();
            assert!(resumed.is_started());
            assert!(resumed.in_state("one").unwrap());
            assert!(resumed.is_occupied_by("user-1", ""));
            assert_eq!(resumed.dump(format).unwrap(), dump);

            resumed.send("false", Value::Null).unwrap();
            assert!(resumed.in_state("three").unwrap());
            assert_eq!(resumed.history().unwrap().len(), 2);
        }
    }

    #[test]
    fn test_invalid_dump_leaves_runner_unloaded() {
        let mut runner = rules_runner();
        let err = runner.load_json("{\"not\": \"a chart\"}").unwrap_err();
        assert!(matches!(err, CoreError::InvalidModel { .. }));
        assert!(!runner.is_loaded());
    }

    #[test]
    fn test_parse_and_clear() {
        let mut runner = Runner::new();
        let description = ChartDescription::new("review")
            .state(StateDescription::new("draft").initial().on("submit", "review"))
            .state(StateDescription::new("review"));
        runner.parse(description).unwrap();
        runner.start(Value::Null).unwrap();
        runner.send("submit", Value::Null).unwrap();
        assert!(runner.is_finished().unwrap());

        runner.clear();
        assert!(!runner.is_loaded());
        assert!(!runner.is_started());
    }

    #[test]
    fn test_describe_history() {
        let mut runner = rules_runner();
        assert!(runner.describe_history().unwrap().ends_with("not started"));

        runner.start(Value::Null).unwrap();
        runner.send("true", Value::Null).unwrap();
        let description = runner.describe_history().unwrap();
        assert!(description.contains("(one:- @"));
        assert!(description.contains(" -> (two:true @"));
    }

    #[test]
    fn test_is_occupied_by() {
        let mut runner = Runner::new();
        assert!(!runner.is_occupied_by("user-1", "checkout"));

        let mut chart = StateChart::from_json(
            r#"{"name": "checkout", "states": [{"state": "basket", "initial": true}]}"#,
        )
        .unwrap();
        chart.set_owner("user-1");
        runner.load(chart).unwrap();

        assert!(runner.is_occupied_by("user-1", "checkout"));
        assert!(!runner.is_occupied_by("user-2", "checkout"));
        assert!(!runner.is_occupied_by("user-1", "refund"));
    }

    const RING: &str = r#"[
        {"state": "s0", "initial": true, "events": {"next": "s1"}},
        {"state": "s1", "events": {"next": "s2", "back": "s0"}},
        {"state": "s2", "events": {"back": "s1", "reset": "s0"}}
    ]"#;

    proptest! {
        #[test]
        fn can_send_predicts_send(events in prop::collection::vec(
            prop::sample::select(vec!["next", "back", "reset", "ghost"]),
            0..40,
        )) {
            let mut runner = Runner::new();
            runner.load(StateChart::from_json(RING).unwrap()).unwrap();
            runner.start(Value::Null).unwrap();

            let mut committed = 1;
            for event in events {
                let before = runner.current_state().unwrap().name.clone();
                let expected = runner.can_send(event).unwrap();
                match runner.send(event, Value::Null) {
                    Ok(_) => {
                        prop_assert!(expected);
                        committed += 1;
                        let last = runner.history().unwrap().last().unwrap().clone();
                        prop_assert_eq!(last.src.as_deref(), Some(before.as_str()));
                        prop_assert_eq!(&last.state, &runner.current_state().unwrap().name);
                    }
                    Err(CoreError::UnregisteredEvent { .. }) => {
                        prop_assert!(!expected);
                        prop_assert_eq!(event, "ghost");
                    }
                    Err(CoreError::ImpossibleEvent { state, .. }) => {
                        prop_assert!(!expected);
                        prop_assert_eq!(state, before);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
                prop_assert_eq!(runner.history().unwrap().len(), committed);
            }
        }
    }
}
