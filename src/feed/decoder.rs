//! Classifies one feed line as an event, a terminal marker, a heartbeat or
//! malformed input.

use crate::error::DecodeError;
use crate::types::{ChangeEvent, ChangeRecord, Revision, Sequence};
use serde_json::{Map, Value};

/// Result of decoding a single line. Never an `Err`: malformed input is a
/// value the caller decides what to do with.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedLine {
    /// Whitespace-only line (heartbeat).
    Blank,
    Record(ChangeRecord),
    Malformed(DecodeError),
}

/// Decode one line of a change feed.
pub fn decode_line(line: &str) -> DecodedLine {
    if line.trim().is_empty() {
        return DecodedLine::Blank;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return DecodedLine::Malformed(DecodeError::InvalidJson(e.to_string())),
    };

    let Value::Object(object) = value else {
        return DecodedLine::Malformed(DecodeError::NotAnObject);
    };

    match decode_object(&object) {
        Ok(record) => DecodedLine::Record(record),
        Err(e) => DecodedLine::Malformed(e),
    }
}

fn decode_object(object: &Map<String, Value>) -> Result<ChangeRecord, DecodeError> {
    if !object.contains_key("id") {
        if let Some(last_seq) = object.get("last_seq") {
            let last_sequence = sequence_field("last_seq", last_seq)?;
            return Ok(ChangeRecord::Terminal { last_sequence });
        }
    }

    let document_id = match object.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(_) => return Err(invalid("id", "expected a string")),
        None => return Err(DecodeError::MissingField("id")),
    };

    let sequence = match object.get("seq") {
        Some(seq) => sequence_field("seq", seq)?,
        None => return Err(DecodeError::MissingField("seq")),
    };

    let revisions = match object.get("changes") {
        Some(Value::Array(changes)) => decode_revisions(changes)?,
        Some(_) => return Err(invalid("changes", "expected an array")),
        None => return Err(DecodeError::MissingField("changes")),
    };

    let deleted = match object.get("deleted") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(deleted)) => *deleted,
        Some(_) => return Err(invalid("deleted", "expected a boolean")),
    };

    Ok(ChangeRecord::Event(ChangeEvent {
        sequence,
        document_id,
        revisions,
        deleted,
    }))
}

fn decode_revisions(changes: &[Value]) -> Result<Vec<Revision>, DecodeError> {
    if changes.is_empty() {
        return Err(invalid("changes", "at least one revision is required"));
    }
    changes
        .iter()
        .map(|change| match change.get("rev") {
            Some(Value::String(rev)) => Ok(Revision::new(rev.clone())),
            Some(_) => Err(invalid("changes", "`rev` must be a string")),
            None => Err(invalid("changes", "entry without `rev`")),
        })
        .collect()
}

fn sequence_field(field: &'static str, value: &Value) -> Result<Sequence, DecodeError> {
    Sequence::from_json(value).ok_or_else(|| invalid(field, "expected an integer-like sequence"))
}

fn invalid(field: &'static str, reason: &str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}
