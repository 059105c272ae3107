//! Interaction events
//!
//! Activities report interactions as a type string plus a loosely structured
//! payload. This module validates that payload and turns it into a typed
//! [`Event`]. Unknown event types are kept as [`EventPayload::Other`]: they are
//! stored and counted but never feed domain scoring.
//!
//! Outcomes come from the event type alone: `success` and `error` events drive
//! accuracy, fatigue and scoring. An `isCorrect` flag on an attempt is kept
//! with the event for the stored log but does not count as an outcome, so an
//! activity that reports both never double counts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TelemetryError;
use crate::sanitize::bound_map;
use crate::types::Difficulty;

/// Upper bound for a plausible response time (10 minutes)
pub const MAX_RESPONSE_TIME_MS: f64 = 600_000.0;

/// Keys consumed by the typed payloads; everything else lands in `extra`
const KNOWN_KEYS: [&str; 10] = [
    "type",
    "timestamp",
    "responseTime",
    "response_time",
    "isCorrect",
    "is_correct",
    "errorType",
    "error_type",
    "difficulty",
    "round",
];

/// Payload shared by attempt and success events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    /// Activity-declared correctness; stored only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyChangePayload {
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericPayload {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherPayload {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Event payload keyed by event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Attempt(ResponsePayload),
    Success(ResponsePayload),
    Error(ErrorPayload),
    DifficultyChange(DifficultyChangePayload),
    AdaptiveUpdate(GenericPayload),
    RoundGeneration(RoundPayload),
    Other(OtherPayload),
}

/// A validated interaction event. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(timestamp: i64, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    /// Wire name of the event type
    pub fn type_name(&self) -> &str {
        match &self.payload {
            EventPayload::Attempt(_) => "attempt",
            EventPayload::Success(_) => "success",
            EventPayload::Error(_) => "error",
            EventPayload::DifficultyChange(_) => "difficulty_change",
            EventPayload::AdaptiveUpdate(_) => "adaptive_update",
            EventPayload::RoundGeneration(_) => "round_generation",
            EventPayload::Other(other) => &other.event_type,
        }
    }

    pub fn is_attempt(&self) -> bool {
        matches!(self.payload, EventPayload::Attempt(_))
    }

    /// `Some(true)` for success, `Some(false)` for error, `None` otherwise
    pub fn outcome(&self) -> Option<bool> {
        match self.payload {
            EventPayload::Success(_) => Some(true),
            EventPayload::Error(_) => Some(false),
            _ => None,
        }
    }

    pub fn response_time_ms(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::Attempt(p) | EventPayload::Success(p) => p.response_time_ms,
            EventPayload::Error(p) => p.response_time_ms,
            EventPayload::Other(p) => p.response_time_ms,
            _ => None,
        }
    }
}

/// Validate a raw interaction and build a typed event.
///
/// `timestamp` is required and must be a positive millisecond epoch. Optional
/// fields are type-checked and bounded; unrecognised fields are kept in
/// `extra` after depth-bounding.
pub fn parse_event(
    event_type: &str,
    payload: &Map<String, Value>,
    max_depth: usize,
) -> Result<Event, TelemetryError> {
    let event_type = event_type.trim();
    if event_type.is_empty() {
        return Err(TelemetryError::MissingField("type".to_string()));
    }

    let timestamp = read_timestamp(payload)?;
    let response_time_ms = read_response_time(payload)?;
    let is_correct = read_bool(payload, &["isCorrect", "is_correct"])?;
    let error_type = read_string(payload, &["errorType", "error_type"])?;
    let difficulty = read_difficulty(payload)?;
    let extra = bound_map(&collect_extra(payload), max_depth);

    let payload = match event_type.to_ascii_lowercase().as_str() {
        "attempt" => EventPayload::Attempt(ResponsePayload {
            response_time_ms,
            is_correct,
            difficulty,
            extra,
        }),
        "success" => EventPayload::Success(ResponsePayload {
            response_time_ms,
            is_correct,
            difficulty,
            extra,
        }),
        "error" => EventPayload::Error(ErrorPayload {
            response_time_ms,
            error_type,
            difficulty,
            extra,
        }),
        "difficulty_change" => EventPayload::DifficultyChange(DifficultyChangePayload {
            difficulty: difficulty.ok_or_else(|| {
                TelemetryError::MissingField("difficulty".to_string())
            })?,
            extra,
        }),
        "adaptive_update" => EventPayload::AdaptiveUpdate(GenericPayload { extra }),
        "round_generation" => EventPayload::RoundGeneration(RoundPayload {
            round: read_round(payload)?,
            difficulty,
            extra,
        }),
        _ => EventPayload::Other(OtherPayload {
            event_type: event_type.to_string(),
            response_time_ms,
            extra,
        }),
    };

    Ok(Event { timestamp, payload })
}

fn lookup<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find(|v| !v.is_null())
}

fn read_timestamp(payload: &Map<String, Value>) -> Result<i64, TelemetryError> {
    let value = lookup(payload, &["timestamp"])
        .ok_or_else(|| TelemetryError::MissingField("timestamp".to_string()))?;

    let timestamp = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        _ => None,
    }
    .ok_or_else(|| {
        TelemetryError::Validation(format!("timestamp must be a millisecond epoch, got {value}"))
    })?;

    if timestamp <= 0 {
        return Err(TelemetryError::Validation(format!(
            "timestamp must be positive, got {timestamp}"
        )));
    }
    Ok(timestamp)
}

fn read_response_time(payload: &Map<String, Value>) -> Result<Option<f64>, TelemetryError> {
    let Some(value) = lookup(payload, &["responseTime", "response_time"]) else {
        return Ok(None);
    };
    let ms = value
        .as_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| TelemetryError::Validation(format!("responseTime must be a number, got {value}")))?;

    if !(0.0..=MAX_RESPONSE_TIME_MS).contains(&ms) {
        return Err(TelemetryError::Validation(format!(
            "responseTime {ms} outside [0, {MAX_RESPONSE_TIME_MS}]"
        )));
    }
    Ok(Some(ms))
}

fn read_bool(payload: &Map<String, Value>, keys: &[&str]) -> Result<Option<bool>, TelemetryError> {
    match lookup(payload, keys) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(TelemetryError::Validation(format!(
            "{} must be a boolean, got {other}",
            keys[0]
        ))),
    }
}

fn read_string(
    payload: &Map<String, Value>,
    keys: &[&str],
) -> Result<Option<String>, TelemetryError> {
    match lookup(payload, keys) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(TelemetryError::Validation(format!(
            "{} must be a string, got {other}",
            keys[0]
        ))),
    }
}

fn read_difficulty(payload: &Map<String, Value>) -> Result<Option<Difficulty>, TelemetryError> {
    match read_string(payload, &["difficulty"])? {
        None => Ok(None),
        Some(raw) => Difficulty::parse(&raw).map(Some).ok_or_else(|| {
            TelemetryError::Validation(format!("difficulty must be easy, medium or hard, got {raw}"))
        }),
    }
}

fn read_round(payload: &Map<String, Value>) -> Result<Option<u32>, TelemetryError> {
    match lookup(payload, &["round"]) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                TelemetryError::Validation(format!("round must be a non-negative integer, got {value}"))
            }),
    }
}

fn collect_extra(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
