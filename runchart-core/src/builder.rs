//! Chart descriptions and the chart builder.
//!
//! Charts are described as a list of state records, in JSON or YAML:
//!
//! ```yaml
//! name: checkout
//! states:
//!   - id: in_frontpage
//!     initial: true
//!     events:
//!       do_goto_basket: in_basket
//!   - id: in_basket
//!     substates: [in_basket_normal, in_basket_empty]
//!     on_change: checkout.recalculate
//!   - id: in_basket_normal
//!   - id: in_basket_empty
//! ```
//!
//! A bare sequence of records (without `name`) is accepted too. Record keys
//! `state`, `is_initial` and `is_final` are aliases of `id`, `initial` and
//! `final`. Event names and identifiers may be strings, numbers or booleans;
//! they are normalised to strings.
//!
//! `substates` marks a meta state: each listed sub-state becomes reachable
//! through a synthesized `~do_goto_<substate>` event. Meta states exist only
//! here, the built chart is flat.

use crate::chart::{State, StateChart};
use crate::error::CoreError;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of events synthesized for meta state sub-states.
pub const META_EVENT_PREFIX: &str = "~do_goto_";

/// Returns the synthesized event leading to a meta state's sub-state.
pub fn meta_event(substate: &str) -> String {
    format!("{META_EVENT_PREFIX}{substate}")
}

/// One state record of a chart description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescription {
    #[serde(
        default,
        alias = "state",
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    #[serde(default, alias = "is_initial")]
    pub initial: bool,

    /// Explicit final flag; derived from the event map when absent.
    #[serde(
        default,
        rename = "final",
        alias = "is_final",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_final: Option<bool>,

    #[serde(default, deserialize_with = "deserialize_events")]
    pub events: BTreeMap<String, String>,

    #[serde(
        default,
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_enter: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_exit: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_change: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub trigger: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_identifier",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<String>,

    /// Sub-states reachable from this meta state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substates: Vec<String>,
}

impl StateDescription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    pub fn final_state(mut self, is_final: bool) -> Self {
        self.is_final = Some(is_final);
        self
    }

    /// Adds an outgoing event.
    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.events.insert(event.into(), target.into());
        self
    }

    pub fn on_enter(mut self, callback: impl Into<String>) -> Self {
        self.on_enter = Some(callback.into());
        self
    }

    pub fn on_exit(mut self, callback: impl Into<String>) -> Self {
        self.on_exit = Some(callback.into());
        self
    }

    pub fn on_change(mut self, callback: impl Into<String>) -> Self {
        self.on_change = Some(callback.into());
        self
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn substate(mut self, substate: impl Into<String>) -> Self {
        self.substates.push(substate.into());
        self
    }

    /// Flattens the record into a chart state.
    fn into_state(self) -> Result<State, CoreError> {
        let name = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(CoreError::MalformedChart {
                    reason: "no state identifier found in a state definition".to_string(),
                })
            }
        };

        let mut events = self.events;
        for substate in self.substates {
            events.entry(meta_event(&substate)).or_insert(substate);
        }
        let is_final = self.is_final.unwrap_or(events.is_empty());

        Ok(State {
            name,
            events,
            on_enter: self.on_enter,
            on_exit: self.on_exit,
            on_change: self.on_change,
            trigger: self.trigger,
            action: self.action,
            is_initial: self.initial,
            is_final,
        })
    }
}

/// A complete chart description, the builder's input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartDescription {
    /// Chart type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub states: Vec<StateDescription>,

    /// Initial datamodel of machines built from this chart.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub datamodel: Map<String, Value>,
}

/// Accepted top-level shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChartDocument {
    States(Vec<StateDescription>),
    Chart(ChartDescription),
}

impl From<ChartDocument> for ChartDescription {
    fn from(doc: ChartDocument) -> Self {
        match doc {
            ChartDocument::States(states) => ChartDescription {
                states,
                ..ChartDescription::default()
            },
            ChartDocument::Chart(chart) => chart,
        }
    }
}

impl ChartDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn state(mut self, state: StateDescription) -> Self {
        self.states.push(state);
        self
    }

    /// Parses a JSON description.
    pub fn from_json(s: &str) -> Result<Self, CoreError> {
        let doc: ChartDocument = serde_json::from_str(s)?;
        Ok(doc.into())
    }

    /// Parses a YAML description.
    pub fn from_yaml(s: &str) -> Result<Self, CoreError> {
        let doc: ChartDocument = serde_yaml::from_str(s)?;
        Ok(doc.into())
    }

    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        let doc: ChartDocument = serde_json::from_value(value.clone())?;
        Ok(doc.into())
    }
}

/// Builds [`StateChart`]s from descriptions.
#[derive(Debug, Clone)]
pub struct ChartBuilder {
    description: ChartDescription,
}

impl ChartBuilder {
    pub fn new(description: ChartDescription) -> Self {
        Self { description }
    }

    /// Overrides the chart type name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.description.name = Some(name.into());
        self
    }

    pub fn with_datamodel(mut self, datamodel: Map<String, Value>) -> Self {
        self.description.datamodel = datamodel;
        self
    }

    /// Validates the description and builds the chart.
    pub fn build(self) -> Result<StateChart, CoreError> {
        let ChartDescription {
            name,
            states,
            datamodel,
        } = self.description;

        let states = states
            .into_iter()
            .map(StateDescription::into_state)
            .collect::<Result<Vec<_>, _>>()?;

        let chart = StateChart::assemble(name.unwrap_or_default(), states, datamodel)?;
        tracing::debug!(
            "Built chart '{}' ({} states, {} events, id {})",
            chart.name(),
            chart.states().len(),
            chart.events().len(),
            chart.id()
        );
        Ok(chart)
    }
}

impl StateChart {
    pub fn build(description: ChartDescription) -> Result<Self, CoreError> {
        ChartBuilder::new(description).build()
    }

    pub fn from_json(s: &str) -> Result<Self, CoreError> {
        Self::build(ChartDescription::from_json(s)?)
    }

    pub fn from_yaml(s: &str) -> Result<Self, CoreError> {
        Self::build(ChartDescription::from_yaml(s)?)
    }
}

/// A string, number or boolean, normalised to a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Scalar(String);

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string, number or boolean")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v.to_string()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v))
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v.to_string()))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Scalar(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

fn deserialize_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| s.0))
}

fn deserialize_events<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<Scalar, Scalar>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(event, target)| (event.0, target.0))
        .collect())
}
