//! Field extraction for inbound JSON events.
//!
//! Producers are not all equally strict: ids may arrive as integers or
//! numeric strings, timestamps as epoch seconds or ISO-8601 strings. These
//! helpers accept every form we have seen on the wire and reject everything
//! else with a [`ValidationError`].

use blinkwatch_pipeline::{SessionId, SessionStatus};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Blink ends before it starts ({start} > {end})")]
    NegativeDuration { start: f64, end: f64 },
}

impl ValidationError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// A point in time as sent by a producer.
///
/// Epoch seconds are kept as-is so differences between two epoch timestamps
/// are exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventTime {
    Epoch(f64),
    Calendar(DateTime<Utc>),
}

impl EventTime {
    pub fn as_epoch_seconds(&self) -> f64 {
        match self {
            EventTime::Epoch(seconds) => *seconds,
            EventTime::Calendar(at) => {
                at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) / 1e9
            }
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            EventTime::Calendar(at) => Some(*at),
            EventTime::Epoch(seconds) => {
                let whole = seconds.floor();
                let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
                Utc.timestamp_opt(whole as i64, nanos).single()
            }
        }
    }
}

/// Parse a message payload into a JSON object
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ValidationError::Malformed(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
        Err(e) => Err(ValidationError::Malformed(e.to_string())),
    }
}

fn required<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a Value, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

/// `session_id` as an integer or a string holding one
pub fn session_id(object: &Map<String, Value>) -> Result<SessionId, ValidationError> {
    const FIELD: &str = "session_id";
    match required(object, FIELD)? {
        Value::Number(n) => n
            .as_i64()
            .map(SessionId::new)
            .ok_or_else(|| ValidationError::invalid(FIELD, format!("{} is not an integer", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(SessionId::new)
            .map_err(|_| ValidationError::invalid(FIELD, format!("'{}' is not an integer", s))),
        other => Err(ValidationError::invalid(FIELD, type_name(other))),
    }
}

pub fn string(object: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match required(object, field)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) => Err(ValidationError::invalid(field, "empty string")),
        other => Err(ValidationError::invalid(field, type_name(other))),
    }
}

/// A finite number, or a string holding one
pub fn finite_number(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<f64, ValidationError> {
    let value = match required(object, field)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ValidationError::invalid(field, "not representable as f64"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ValidationError::invalid(field, format!("'{}' is not a number", s)))?,
        other => return Err(ValidationError::invalid(field, type_name(other))),
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::invalid(field, "not a finite number"))
    }
}

/// Epoch seconds or an ISO-8601 string; naive datetimes are taken as UTC
pub fn timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<EventTime, ValidationError> {
    match required(object, field)? {
        Value::Number(n) => match n.as_f64() {
            Some(seconds) if seconds.is_finite() => Ok(EventTime::Epoch(seconds)),
            _ => Err(ValidationError::invalid(field, "not a finite number")),
        },
        Value::String(s) => parse_calendar(s)
            .map(EventTime::Calendar)
            .ok_or_else(|| {
                ValidationError::invalid(field, format!("'{}' is not an ISO-8601 timestamp", s))
            }),
        other => Err(ValidationError::invalid(field, type_name(other))),
    }
}

/// Like [`timestamp`] but a missing or null field is `None`
pub fn optional_timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<EventTime>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => timestamp(object, field).map(Some),
    }
}

/// Like [`finite_number`] but a missing or null field is `None`
pub fn optional_number(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => finite_number(object, field).map(Some),
    }
}

pub fn status(object: &Map<String, Value>) -> Result<SessionStatus, ValidationError> {
    const FIELD: &str = "status";
    string(object, FIELD)?
        .parse()
        .map_err(|reason: String| ValidationError::invalid(FIELD, reason))
}

fn parse_calendar(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
