//! Serialized form of a chart, used to suspend and resume machines.
//!
//! The dump is a self-describing JSON document ([`ChartDump`]). It travels
//! either as plain text ([`Format::Json`]) or wrapped in a checksummed
//! binary frame ([`Format::Binary`]):
//!
//! ```text
//! +--------+---------+-------------+--------+------------------+
//! | magic  | version | payload_len | crc32c | payload (JSON)   |
//! | 4 bytes| 2 bytes |   4 bytes   | 4 bytes| payload_len bytes|
//! +--------+---------+-------------+--------+------------------+
//! ```

use crate::chart::{HistoryRecord, State, StateChart};
use crate::error::CoreError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Magic bytes identifying binary dumps: "RCHT"
pub const MAGIC: [u8; 4] = *b"RCHT";

/// Binary frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the binary frame header (4+2+4+4 = 14).
pub const FRAME_HEADER_SIZE: usize = 14;

/// Largest payload accepted in a binary frame (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Dump encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// JSON payload in a checksummed binary frame.
    Binary,
}

impl Format {
    /// Guesses the format of encoded bytes from the frame magic.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&MAGIC) {
            Format::Binary
        } else {
            Format::Json
        }
    }
}

/// Serialized chart, including its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartDump {
    pub chart_id: String,

    #[serde(default)]
    pub name: String,

    /// Occupied state, `None` if the machine was never started.
    pub current_state: Option<String>,

    pub initial_state: String,

    pub final_states: Vec<String>,

    /// Full state definitions, ordered by name.
    pub states: Vec<State>,

    /// `(event, (source, destination))` pairs in canonical order.
    pub transitions: Vec<(String, (String, String))>,

    #[serde(default)]
    pub history: Vec<HistoryRecord>,

    #[serde(default)]
    pub datamodel: Map<String, Value>,
}

impl ChartDump {
    pub fn from_chart(chart: &StateChart) -> Self {
        Self {
            chart_id: chart.id().to_string(),
            name: chart.name().to_string(),
            current_state: chart.current_state().map(|s| s.name.clone()),
            initial_state: chart.initial_state().name.clone(),
            final_states: chart
                .final_states()
                .iter()
                .map(|s| s.name.clone())
                .collect(),
            states: chart.states().to_vec(),
            transitions: chart
                .transition_triples()
                .into_iter()
                .map(|(event, src, dst)| (event, (src, dst)))
                .collect(),
            history: chart.history().to_vec(),
            datamodel: chart.datamodel().clone(),
        }
    }

    /// Rebuilds the chart and checks the dump against it.
    pub fn into_chart(self) -> Result<StateChart, CoreError> {
        let mut chart =
            StateChart::assemble(self.name, self.states, self.datamodel).map_err(invalid)?;

        if chart.id() != self.chart_id {
            return Err(invalid(format!(
                "chart id mismatch: dump says {}, content hashes to {}",
                self.chart_id,
                chart.id()
            )));
        }

        if chart.initial_state().name != self.initial_state {
            return Err(invalid(format!(
                "initial state mismatch: dump says '{}', states declare '{}'",
                self.initial_state,
                chart.initial_state().name
            )));
        }

        let mut final_states = self.final_states;
        final_states.sort();
        let declared: Vec<String> = chart
            .final_states()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        if final_states != declared {
            return Err(invalid("final states do not match state definitions"));
        }

        let mut transitions: Vec<(String, String, String)> = self
            .transitions
            .into_iter()
            .map(|(event, (src, dst))| (event, src, dst))
            .collect();
        transitions.sort();
        if transitions != chart.transition_triples() {
            return Err(invalid("transition table does not match state event maps"));
        }

        if let Some(name) = self.current_state {
            let id = chart
                .index
                .get(&name)
                .copied()
                .ok_or_else(|| invalid(format!("current state '{}' is not declared", name)))?;
            chart.current = Some(id);
        }
        chart.history = self.history;

        Ok(chart)
    }
}

/// Encodes a chart in the given format.
pub fn encode(chart: &StateChart, format: Format) -> Result<Vec<u8>, CoreError> {
    let payload = serde_json::to_vec(&ChartDump::from_chart(chart))?;
    match format {
        Format::Json => Ok(payload),
        Format::Binary => encode_frame(&payload),
    }
}

/// Decodes a chart, detecting the format.
pub fn decode(data: &[u8]) -> Result<StateChart, CoreError> {
    let payload = match Format::detect(data) {
        Format::Binary => decode_frame(data)?,
        Format::Json => data,
    };
    let dump: ChartDump = serde_json::from_slice(payload).map_err(invalid)?;
    dump.into_chart()
}

fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, CoreError> {
    let payload_len = payload.len() as u32;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(invalid(format!(
            "dump too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u16(FORMAT_VERSION);
    buf.put_u32(payload_len);
    buf.put_u32(crc32c::crc32c(payload));
    buf.put_slice(payload);

    Ok(buf.to_vec())
}

fn decode_frame(data: &[u8]) -> Result<&[u8], CoreError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(invalid(format!(
            "truncated frame: {} bytes, header needs {}",
            data.len(),
            FRAME_HEADER_SIZE
        )));
    }

    let mut buf = data;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(invalid(format!("invalid magic bytes: {:?}", magic)));
    }

    let version = buf.get_u16();
    if version != FORMAT_VERSION {
        return Err(invalid(format!("unsupported dump version: {}", version)));
    }

    let payload_len = buf.get_u32() as usize;
    let crc_expected = buf.get_u32();
    if buf.len() != payload_len {
        return Err(invalid(format!(
            "payload length mismatch: header says {}, frame carries {}",
            payload_len,
            buf.len()
        )));
    }

    let crc_actual = crc32c::crc32c(buf);
    if crc_actual != crc_expected {
        return Err(invalid(format!(
            "CRC mismatch: expected {:#x}, got {:#x}",
            crc_expected, crc_actual
        )));
    }

    Ok(buf)
}

fn invalid(reason: impl ToString) -> CoreError {
    CoreError::InvalidModel {
        reason: reason.to_string(),
    }
}
