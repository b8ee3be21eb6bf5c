//! Hierarchical XML chart descriptions.
//!
//! ```xml
//! <statechart name="checkout" initial="in_frontpage">
//!   <datamodel>
//!     <data id="basket_max_amount">2</data>
//!   </datamodel>
//!   <state id="in_frontpage">
//!     <transition event="do_goto_basket" target="in_basket"/>
//!   </state>
//!   <state id="in_basket">
//!     <onchange>checkout.recalculate</onchange>
//!     <state id="in_basket_normal">
//!       <transition event="do_pay" target="done"/>
//!     </state>
//!     <state id="in_basket_empty"/>
//!   </state>
//!   <final id="done"/>
//! </statechart>
//! ```
//!
//! A `state` nested in another is a sub-state of that meta state. `onentry`,
//! `onexit`, `onchange`, `trigger` and `action` hold identifiers as text.
//! `data` text is read as JSON, falling back to a plain string. The result is
//! the same [`ChartDescription`] the JSON and YAML forms produce.

use crate::builder::{ChartDescription, StateDescription};
use crate::chart::StateChart;
use crate::error::CoreError;
use roxmltree::{Document, Node};
use serde_json::{Map, Value};

impl ChartDescription {
    /// Parses an XML description.
    pub fn from_xml(s: &str) -> Result<Self, CoreError> {
        let doc = Document::parse(s)?;
        let root = doc.root_element();

        let mut description = ChartDescription {
            name: root.attribute("name").map(str::to_string),
            ..ChartDescription::default()
        };
        for child in root.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "state" | "final" => collect_state(child, &mut description.states)?,
                "datamodel" => read_datamodel(child, &mut description.datamodel)?,
                other => return Err(malformed(format!("unexpected <{}> in chart", other))),
            }
        }

        if let Some(initial) = root.attribute("initial") {
            let state = description
                .states
                .iter_mut()
                .find(|s| s.id.as_deref() == Some(initial))
                .ok_or_else(|| malformed(format!("initial state '{}' is not declared", initial)))?;
            state.initial = true;
        }

        Ok(description)
    }
}

impl StateChart {
    pub fn from_xml(s: &str) -> Result<Self, CoreError> {
        Self::build(ChartDescription::from_xml(s)?)
    }
}

/// Appends the record for `node`, then the records of its sub-states.
fn collect_state(node: Node<'_, '_>, out: &mut Vec<StateDescription>) -> Result<(), CoreError> {
    let mut state = StateDescription {
        id: node.attribute("id").map(str::to_string),
        initial: flag(node, "initial")?.unwrap_or(false),
        is_final: if node.has_tag_name("final") {
            Some(true)
        } else {
            flag(node, "final")?
        },
        ..StateDescription::default()
    };
    let mut nested = Vec::new();

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "transition" => {
                let event = required(child, "event")?;
                let target = required(child, "target")?;
                state.events.insert(event, target);
            }
            "onentry" => state.on_enter = Some(identifier(child)?),
            "onexit" => state.on_exit = Some(identifier(child)?),
            "onchange" => state.on_change = Some(identifier(child)?),
            "trigger" => state.trigger = Some(identifier(child)?),
            "action" => state.action = Some(identifier(child)?),
            "state" | "final" => {
                state.substates.push(required(child, "id")?);
                collect_state(child, &mut nested)?;
            }
            other => {
                return Err(malformed(format!(
                    "unexpected <{}> in state '{}'",
                    other,
                    state.id.as_deref().unwrap_or("?")
                )))
            }
        }
    }

    out.push(state);
    out.append(&mut nested);
    Ok(())
}

fn read_datamodel(node: Node<'_, '_>, datamodel: &mut Map<String, Value>) -> Result<(), CoreError> {
    for data in node.children().filter(Node::is_element) {
        if !data.has_tag_name("data") {
            return Err(malformed(format!(
                "unexpected <{}> in datamodel",
                data.tag_name().name()
            )));
        }
        let key = required(data, "id")?;
        let value = match data.text().map(str::trim) {
            None | Some("") => Value::Null,
            Some(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
            }
        };
        datamodel.insert(key, value);
    }
    Ok(())
}

fn required(node: Node<'_, '_>, attribute: &str) -> Result<String, CoreError> {
    node.attribute(attribute)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            malformed(format!(
                "<{}> without '{}'",
                node.tag_name().name(),
                attribute
            ))
        })
}

fn identifier(node: Node<'_, '_>) -> Result<String, CoreError> {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("empty <{}>", node.tag_name().name())))
}

fn flag(node: Node<'_, '_>, attribute: &str) -> Result<Option<bool>, CoreError> {
    match node.attribute(attribute) {
        None => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(other) => Err(malformed(format!(
            "'{}' is not a boolean for '{}'",
            other, attribute
        ))),
    }
}

fn malformed(reason: String) -> CoreError {
    CoreError::MalformedChart { reason }
}
