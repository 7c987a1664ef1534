//! Event Grouper
//!
//! Normalizes raw events into comparable classes so that near-identical
//! observations ("Pasta ", "pasta", 200g vs 205g) count as the same thing.
//!
//! - Text characteristics are trimmed, case-folded and whitespace-collapsed
//! - Numeric characteristics fall into logarithmic tolerance bands (10% wide)
//! - Each class gets a stable `group_key` (xxHash64 of the canonical form)
//!
//! Events missing a characteristic that their type's grouping requires are
//! left out of the candidate pool; that is never an error.
//!
//! # Example
//! ```ignore
//! let grouper = EventGrouper::new(GroupingConfig::default());
//! let timeline = EventTimeline::build(&events, &grouper, chrono_tz::UTC);
//! let pasta_times = timeline.times(&pasta_key);
//! ```

use crate::events::types::{CharacteristicValue, EventType, HealthEvent};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hasher;

/// Characteristic names that carry an outcome's severity
const SEVERITY_KEYS: [&str; 2] = ["severity", "intensity"];

/// Grouping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Identity characteristics per event type name
    #[serde(default = "default_identity_keys")]
    pub identity_keys: BTreeMap<String, Vec<String>>,

    /// Identity characteristics for event types not listed above
    #[serde(default = "default_fallback_keys")]
    pub fallback_keys: Vec<String>,

    /// Relative width of numeric tolerance bands (0.10 = 10%)
    #[serde(default = "default_numeric_tolerance")]
    pub numeric_tolerance: f64,
}

fn default_identity_keys() -> BTreeMap<String, Vec<String>> {
    [
        ("meal", "food"),
        ("symptom", "name"),
        ("mood", "mood"),
        ("sleep", "quality"),
        ("exercise", "activity"),
        ("reminder_completion", "reminder"),
    ]
    .into_iter()
    .map(|(event_type, key)| (event_type.to_string(), vec![key.to_string()]))
    .collect()
}

fn default_fallback_keys() -> Vec<String> {
    vec!["name".to_string()]
}

fn default_numeric_tolerance() -> f64 {
    0.10
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            identity_keys: default_identity_keys(),
            fallback_keys: default_fallback_keys(),
            numeric_tolerance: default_numeric_tolerance(),
        }
    }
}

/// Stable identifier of an event class
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub String);

impl GroupKey {
    /// Hash a canonical class description into a key
    pub fn from_canonical(canonical: &str) -> Self {
        GroupKey(format!("{:016x}", stable_hash(canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// xxHash64 with a fixed seed, stable across processes and releases
pub fn stable_hash(input: &str) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(input.as_bytes());
    hasher.finish()
}

/// A normalized class of comparable events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventClass {
    pub key: GroupKey,
    pub event_type: EventType,
    /// Human-readable name ("pasta", "tiredness")
    pub label: String,
    /// Normalized identity characteristics
    pub attributes: BTreeMap<String, String>,
}

/// Normalizes and buckets events into classes
#[derive(Debug, Clone)]
pub struct EventGrouper {
    config: GroupingConfig,
}

impl Default for EventGrouper {
    fn default() -> Self {
        Self::new(GroupingConfig::default())
    }
}

impl EventGrouper {
    pub fn new(config: GroupingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    /// Identity characteristics required for an event type
    pub fn identity_keys(&self, event_type: &EventType) -> &[String] {
        self.config
            .identity_keys
            .get(event_type.as_str())
            .unwrap_or(&self.config.fallback_keys)
    }

    /// Classify an event, or `None` if it lacks a required characteristic
    pub fn classify(&self, event: &HealthEvent) -> Option<EventClass> {
        let keys = self.identity_keys(&event.event_type);
        if keys.is_empty() {
            return None;
        }

        let mut attributes = BTreeMap::new();
        let mut labels = Vec::with_capacity(keys.len());
        let mut canonical = String::from(event.event_type.as_str());

        for key in keys {
            let value = event.characteristic(key)?;
            let (canonical_value, label) = self.normalize_value(value)?;
            canonical.push('|');
            canonical.push_str(key);
            canonical.push('=');
            canonical.push_str(&canonical_value);
            labels.push(label.clone());
            attributes.insert(key.clone(), label);
        }

        Some(EventClass {
            key: GroupKey::from_canonical(&canonical),
            event_type: event.event_type.clone(),
            label: labels.join(" "),
            attributes,
        })
    }

    /// Normalize a value into (canonical form, display label)
    fn normalize_value(&self, value: &CharacteristicValue) -> Option<(String, String)> {
        match value {
            CharacteristicValue::Text(text) => {
                let normalized = normalize_text(text);
                if normalized.is_empty() {
                    None
                } else {
                    Some((format!("s:{}", normalized), normalized))
                }
            }
            CharacteristicValue::Bool(flag) => Some((format!("b:{}", flag), flag.to_string())),
            CharacteristicValue::Number(number) => {
                let (band, representative) = bucket_number(*number, self.config.numeric_tolerance)?;
                Some((format!("n:{}", band), format_number(representative)))
            }
        }
    }
}

/// Trim, case-fold and collapse inner whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Map a number onto its logarithmic tolerance band
///
/// Returns the band identifier and the band's representative value.
/// Zero is its own band; the sign is kept.
pub fn bucket_number(value: f64, tolerance: f64) -> Option<(String, f64)> {
    if !value.is_finite() {
        return None;
    }
    if value == 0.0 {
        return Some(("0".to_string(), 0.0));
    }

    let step = (1.0 + tolerance.max(1e-6)).ln();
    let index = (value.abs().ln() / step).round() as i64;
    let representative = (index as f64 * step).exp().copysign(value);
    let sign = if value < 0.0 { "-" } else { "+" };

    Some((format!("{}{}", sign, index), representative))
}

fn format_number(value: f64) -> String {
    if (value - value.round()).abs() < 0.05 {
        format!("{:.0}", value.round())
    } else {
        format!("{:.1}", value)
    }
}

/// A classified event on the user's timeline
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub occurred_at: DateTime<Utc>,
    /// Wall-clock time in the user's timezone
    pub local: NaiveDateTime,
    pub key: GroupKey,
    /// Severity/intensity characteristic if present
    pub severity: Option<f64>,
}

/// Immutable, classified snapshot of a user's events
///
/// Shared read-only between detectors; nothing in it is mutated after
/// `build`.
#[derive(Debug, Clone)]
pub struct EventTimeline {
    entries: Vec<TimelineEntry>,
    classes: BTreeMap<GroupKey, EventClass>,
    occurrences: HashMap<GroupKey, Vec<DateTime<Utc>>>,
    tz: Tz,
}

impl EventTimeline {
    /// Classify events and order them by time
    pub fn build(events: &[HealthEvent], grouper: &EventGrouper, tz: Tz) -> Self {
        let mut entries = Vec::with_capacity(events.len());
        let mut classes = BTreeMap::new();
        let mut excluded = 0usize;

        for event in events {
            let Some(class) = grouper.classify(event) else {
                excluded += 1;
                continue;
            };

            entries.push(TimelineEntry {
                occurred_at: event.occurred_at,
                local: event.occurred_at.with_timezone(&tz).naive_local(),
                key: class.key.clone(),
                severity: SEVERITY_KEYS.iter().find_map(|k| event.number(k)),
            });
            classes.entry(class.key.clone()).or_insert(class);
        }

        if excluded > 0 {
            tracing::debug!(excluded, "Events without grouping characteristics left out");
        }

        entries.sort_by_key(|e| e.occurred_at);

        let mut occurrences: HashMap<GroupKey, Vec<DateTime<Utc>>> = HashMap::new();
        for entry in &entries {
            occurrences
                .entry(entry.key.clone())
                .or_default()
                .push(entry.occurred_at);
        }

        Self {
            entries,
            classes,
            occurrences,
            tz,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn classes(&self) -> &BTreeMap<GroupKey, EventClass> {
        &self.classes
    }

    pub fn class(&self, key: &GroupKey) -> Option<&EventClass> {
        self.classes.get(key)
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Sorted occurrence times of a class
    pub fn times(&self, key: &GroupKey) -> &[DateTime<Utc>] {
        self.occurrences.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, key: &GroupKey) -> usize {
        self.times(key).len()
    }

    /// Classes that can act as triggers, in key order
    pub fn trigger_classes(&self) -> impl Iterator<Item = &EventClass> {
        self.classes.values().filter(|c| c.event_type.can_trigger())
    }

    /// Classes that can act as outcomes, in key order
    pub fn outcome_classes(&self) -> impl Iterator<Item = &EventClass> {
        self.classes.values().filter(|c| c.event_type.can_be_outcome())
    }

    /// First and last event time
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.entries.first()?.occurred_at, self.entries.last()?.occurred_at))
    }

    /// Local calendar date of an instant
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    /// Every local date from the first to the last event, inclusive
    pub fn dates(&self) -> Vec<NaiveDate> {
        let Some((first, last)) = self.span() else {
            return Vec::new();
        };
        let first = self.local_date(first);
        let last = self.local_date(last);
        first.iter_days().take_while(|d| *d <= last).collect()
    }

    /// Number of local days covered (at least 1 when non-empty)
    pub fn span_days(&self) -> f64 {
        self.dates().len().max(1) as f64
    }

    /// Hours covered by the timeline (at least 1)
    pub fn span_hours(&self) -> f64 {
        self.span()
            .map(|(first, last)| (last - first).num_minutes() as f64 / 60.0)
            .unwrap_or(0.0)
            .max(1.0)
    }

    /// Local dates on which a class occurs
    pub fn dates_of(&self, key: &GroupKey) -> BTreeSet<NaiveDate> {
        self.times(key).iter().map(|t| self.local_date(*t)).collect()
    }

    /// Mean severity of a class on a 0-10 scale, if it carries one
    pub fn mean_severity(&self, key: &GroupKey) -> Option<f64> {
        let values: Vec<f64> = self
            .entries
            .iter()
            .filter(|e| &e.key == key)
            .filter_map(|e| e.severity)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .collect();

        if values.is_empty() {
            return None;
        }

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        // 1-5 scales are stretched onto 0-10
        let scaled = if max <= 5.0 { mean * 2.0 } else { mean };
        Some(scaled.clamp(0.0, 10.0))
    }

    /// Resolve a local wall-clock time to UTC; DST gaps roll forward
    pub fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(time);
        (0..3).find_map(|shift| {
            self.tz
                .from_local_datetime(&(naive + Duration::hours(shift)))
                .earliest()
                .map(|t| t.with_timezone(&Utc))
        })
    }

    /// UTC instant at which a local date ends (next local midnight)
    pub fn end_of_local_day(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let next = date.succ_opt()?;
        self.local_to_utc(next, NaiveTime::from_hms_opt(0, 0, 0)?)
    }
}
