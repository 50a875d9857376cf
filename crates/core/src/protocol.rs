// crates/core/src/protocol.rs
//! Inbound message envelope decoding.
//!
//! Every job engine speaks the same `{ "type": …, "data": … }` envelope but
//! the engines disagree on spelling (`complete` vs `completed`, `initializing`
//! vs `running`, empty-string timestamps). All of that is normalised here so
//! the state machine only ever sees [`InboundMessage`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{JobKind, Row};

/// Normalised value of a `status` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusValue {
    Running,
    Paused,
    Completed,
    Idle,
    Stopped,
    Failed,
    /// A status string no engine is known to send. Ignored by the state machine.
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: StatusValue,
    pub started_at: Option<DateTime<Utc>>,
}

/// A decoded inbound protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Status(StatusUpdate),
    Progress { percent: u8 },
    NewRow(Row),
    Complete,
    Error { message: String },
    Log { message: String },
    /// Reply to the backlog request sent on connect.
    Logs { lines: Vec<String> },
    Unknown { kind: String },
}

impl InboundMessage {
    /// Short name used in log fields.
    pub fn type_name(&self) -> &str {
        match self {
            InboundMessage::Status(_) => "status",
            InboundMessage::Progress { .. } => "progress",
            InboundMessage::NewRow(_) => "new_row",
            InboundMessage::Complete => "complete",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Log { .. } => "log",
            InboundMessage::Logs { .. } => "logs",
            InboundMessage::Unknown { kind } => kind,
        }
    }
}

/// "Job … not found" errors mean the backend forgot the job; local state
/// for it is stale.
pub fn is_not_found(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame from a job stream.
pub fn decode(kind: JobKind, text: &str) -> Result<InboundMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedJson { message: e.to_string() })?;
    adapt(kind, envelope)
}

fn adapt(kind: JobKind, envelope: Envelope) -> Result<InboundMessage, ProtocolError> {
    let Envelope { kind: msg_type, data } = envelope;
    match msg_type.as_str() {
        "status" => {
            let raw = data
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::missing(&msg_type, "status"))?;
            Ok(InboundMessage::Status(StatusUpdate {
                status: status_value(kind, raw),
                started_at: parse_timestamp(data.get("started_at")),
            }))
        }
        "progress" => {
            let value = data
                .get("progress")
                .ok_or_else(|| ProtocolError::missing(&msg_type, "progress"))?;
            let percent = value.as_f64().ok_or_else(|| {
                ProtocolError::invalid(&msg_type, "progress", format!("not a number: {value}"))
            })?;
            Ok(InboundMessage::Progress {
                percent: percent.round().clamp(0.0, 100.0) as u8,
            })
        }
        "new_row" => match data {
            Value::Object(mut map) => map
                .remove("row")
                .map(InboundMessage::NewRow)
                .ok_or_else(|| ProtocolError::missing(&msg_type, "row")),
            _ => Err(ProtocolError::missing(&msg_type, "row")),
        },
        "complete" | "completed" => Ok(InboundMessage::Complete),
        "error" => Ok(InboundMessage::Error {
            message: message_field(&data).unwrap_or_else(|| "unknown error".to_string()),
        }),
        "log" => Ok(InboundMessage::Log {
            message: message_field(&data).unwrap_or_default(),
        }),
        "logs" => {
            let lines = data
                .get("logs")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(InboundMessage::Logs { lines })
        }
        _ => Ok(InboundMessage::Unknown { kind: msg_type }),
    }
}

fn status_value(kind: JobKind, raw: &str) -> StatusValue {
    match raw {
        "running" | "initializing" => StatusValue::Running,
        "paused" => StatusValue::Paused,
        "completed" | "complete" => StatusValue::Completed,
        "idle" => StatusValue::Idle,
        "stopped" => StatusValue::Stopped,
        "error" | "failed" => StatusValue::Failed,
        // The credential generator reports model warm-up separately.
        "training" | "loading" if kind == JobKind::CredGen => StatusValue::Running,
        other => StatusValue::Other(other.to_string()),
    }
}

fn message_field(data: &Value) -> Option<String> {
    match data {
        Value::String(s) => Some(s.clone()),
        _ => data.get("message").and_then(Value::as_str).map(str::to_string),
    }
}

/// Engines send RFC 3339, naive ISO-8601 (assumed UTC) or an empty string.
fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
