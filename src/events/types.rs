//! Core event types
//!
//! - `HealthEvent`: one immutable, timestamped observation
//! - `EventType`: the kind of observation (meal, symptom, sleep, ...)
//! - `CharacteristicValue`: the closed set of scalar kinds an event may carry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open map of characteristic name → scalar value
pub type Characteristics = BTreeMap<String, CharacteristicValue>;

/// A single health event from the user's append-only log
///
/// Events are never mutated or deleted once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthEvent {
    /// Unique identifier (deduplication key)
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Kind of observation
    pub event_type: EventType,
    /// When the event happened (UTC)
    pub occurred_at: DateTime<Utc>,
    /// Free-form characteristics (food, severity, quantity, ...)
    #[serde(default)]
    pub characteristics: Characteristics,
    /// Where the event came from (chat, photo, import, ...)
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

impl HealthEvent {
    /// Create an event with a generated ID and the default source
    pub fn new(user_id: impl Into<String>, event_type: EventType, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            event_type,
            occurred_at,
            characteristics: Characteristics::new(),
            source: default_source(),
        }
    }

    /// Builder method: set the ID
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder method: add a characteristic
    pub fn with(mut self, key: impl Into<String>, value: impl Into<CharacteristicValue>) -> Self {
        self.characteristics.insert(key.into(), value.into());
        self
    }

    /// Builder method: set the source
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Get a characteristic by name
    pub fn characteristic(&self, key: &str) -> Option<&CharacteristicValue> {
        self.characteristics.get(key)
    }

    /// Get a numeric characteristic by name
    pub fn number(&self, key: &str) -> Option<f64> {
        self.characteristic(key).and_then(CharacteristicValue::as_number)
    }
}

/// Kind of health event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Meal,
    Symptom,
    Sleep,
    Exercise,
    Mood,
    ReminderCompletion,
    /// Any event type not modelled explicitly
    Other(String),
}

impl EventType {
    /// Canonical snake_case name
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Meal => "meal",
            EventType::Symptom => "symptom",
            EventType::Sleep => "sleep",
            EventType::Exercise => "exercise",
            EventType::Mood => "mood",
            EventType::ReminderCompletion => "reminder_completion",
            EventType::Other(name) => name,
        }
    }

    /// Whether events of this type may act as triggers
    pub fn can_trigger(&self) -> bool {
        !matches!(self, EventType::Symptom)
    }

    /// Whether events of this type may act as outcomes
    pub fn can_be_outcome(&self) -> bool {
        matches!(self, EventType::Symptom | EventType::Mood | EventType::Sleep)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from(value.as_str())
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "meal" => EventType::Meal,
            "symptom" => EventType::Symptom,
            "sleep" => EventType::Sleep,
            "exercise" => EventType::Exercise,
            "mood" => EventType::Mood,
            "reminder_completion" => EventType::ReminderCompletion,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value of an event characteristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacteristicValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CharacteristicValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CharacteristicValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CharacteristicValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Infer a value from raw text (CSV cells, CLI arguments)
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "true" | "yes" => return CharacteristicValue::Bool(true),
            "false" | "no" => return CharacteristicValue::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => CharacteristicValue::Number(n),
            _ => CharacteristicValue::Text(trimmed.to_string()),
        }
    }
}

impl From<&str> for CharacteristicValue {
    fn from(value: &str) -> Self {
        CharacteristicValue::Text(value.to_string())
    }
}

impl From<String> for CharacteristicValue {
    fn from(value: String) -> Self {
        CharacteristicValue::Text(value)
    }
}

impl From<f64> for CharacteristicValue {
    fn from(value: f64) -> Self {
        CharacteristicValue::Number(value)
    }
}

impl From<i64> for CharacteristicValue {
    fn from(value: i64) -> Self {
        CharacteristicValue::Number(value as f64)
    }
}

impl From<bool> for CharacteristicValue {
    fn from(value: bool) -> Self {
        CharacteristicValue::Bool(value)
    }
}
