use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::{Member, Watermark};

/// Shape of a watch notification record. One batch only ever holds one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    KeyPrefix,
    Event,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyPrefix => "key prefix",
            Self::Event => "event",
        }
    }

    fn payload_field(self) -> &'static str {
        match self {
            Self::KeyPrefix => "Value",
            Self::Event => "Payload",
        }
    }

    fn source_field(self) -> &'static str {
        match self {
            Self::KeyPrefix => "Key",
            Self::Event => "Name",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Nothing,
    Records(Vec<Value>),
}

#[derive(Debug)]
pub enum DecodeError {
    NotAnObject,
    UnknownShape,
    KindMismatch { expected: RecordKind },
    PayloadNotString { field: &'static str },
    Base64(base64::DecodeError),
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "record is not a JSON object"),
            Self::UnknownShape => write!(f, "record is neither a key prefix value nor an event"),
            Self::KindMismatch { expected } => {
                write!(f, "record does not match batch kind: expected {}", expected.as_str())
            }
            Self::PayloadNotString { field } => write!(f, "{field} is not a string"),
            Self::Base64(e) => write!(f, "base64 error: {e}"),
            Self::Json(e) => write!(f, "payload json error: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Base64(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<base64::DecodeError> for DecodeError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Base64(value)
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub kind: RecordKind,
    pub source_group: Option<String>,
    pub roster: Vec<Member>,
    pub watermark: Watermark,
}

#[derive(Debug, Deserialize)]
struct RosterPayload {
    members: Vec<Member>,
}

/// Interprets the document a watch handler receives on stdin.
pub fn parse_incoming(input: &[u8]) -> Incoming {
    if input.iter().all(u8::is_ascii_whitespace) {
        debug!("empty input, nothing to do");
        return Incoming::Nothing;
    }

    let value: Value = match serde_json::from_slice(input) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to parse incoming notification");
            return Incoming::Nothing;
        }
    };

    match value {
        Value::Null => {
            debug!("null notification, nothing to do");
            Incoming::Nothing
        }
        Value::Array(records) if records.is_empty() => {
            debug!("empty notification batch, nothing to do");
            Incoming::Nothing
        }
        Value::Array(records) => Incoming::Records(records),
        other => {
            debug!(kind = json_kind(&other), "ignoring notification that is not a batch");
            Incoming::Nothing
        }
    }
}

/// Decodes every record of a batch, dropping (and logging) the ones that fail.
pub fn normalize(records: &[Value]) -> Vec<DecodedRecord> {
    let mut kind = None::<RecordKind>;
    let mut out = Vec::with_capacity(records.len());

    for (idx, raw) in records.iter().enumerate() {
        match decode_record(raw, &mut kind) {
            Ok(record) => {
                debug!(
                    record = idx,
                    kind = record.kind.as_str(),
                    source_group = record.source_group.as_deref().unwrap_or(""),
                    members = record.roster.len(),
                    modify_index = record.watermark.modify_index,
                    "decoded notification record"
                );
                out.push(record);
            }
            Err(e) => warn!(record = idx, error = %e, "dropping notification record"),
        }
    }

    out
}

fn decode_record(raw: &Value, kind: &mut Option<RecordKind>) -> Result<DecodedRecord, DecodeError> {
    let obj = raw.as_object().ok_or(DecodeError::NotAnObject)?;

    let record_kind = match *kind {
        Some(expected) => {
            if !obj.contains_key(expected.payload_field()) {
                return Err(DecodeError::KindMismatch { expected });
            }
            expected
        }
        None => {
            let detected = if obj.contains_key(RecordKind::KeyPrefix.payload_field()) {
                RecordKind::KeyPrefix
            } else if obj.contains_key(RecordKind::Event.payload_field()) {
                RecordKind::Event
            } else {
                return Err(DecodeError::UnknownShape);
            };
            *kind = Some(detected);
            detected
        }
    };

    let index = |name: &str| obj.get(name).and_then(Value::as_i64).unwrap_or(0);
    let watermark = Watermark::candidate(
        index("CreateIndex"),
        index("ModifyIndex"),
        index("LockIndex"),
    );

    let field = record_kind.payload_field();
    let payload = obj
        .get(field)
        .and_then(Value::as_str)
        .ok_or(DecodeError::PayloadNotString { field })?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    let decoded: RosterPayload = serde_json::from_slice(&bytes)?;

    let source_group = obj
        .get(record_kind.source_field())
        .and_then(Value::as_str)
        .and_then(group_tag);

    let mut roster = decoded.members;
    if let Some(tag) = &source_group {
        for member in roster.iter_mut() {
            if !member.groups.contains(tag) {
                member.groups.push(tag.clone());
            }
        }
    }

    Ok(DecodedRecord {
        kind: record_kind,
        source_group,
        roster,
        watermark,
    })
}

fn group_tag(key: &str) -> Option<String> {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
pub(crate) fn encode_payload(payload: &Value) -> String {
    base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(payload).unwrap())
}
