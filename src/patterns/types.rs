//! Pattern data model
//!
//! - `PatternRule`: the immutable description of a discovered relationship
//! - `PatternCandidate`: detector output, not yet persisted
//! - `DiscoveredPattern`: the stored record with mutable confidence/evidence
//! - `Evidence`: lifetime counters plus a bounded recent history

use crate::events::{EventClass, EventType, GroupKey};
use crate::patterns::confidence::bayesian_confidence;
use crate::patterns::impact::ImpactScorer;
use crate::patterns::insight::render_insight;
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Which detector produced a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    TemporalCorrelation,
    MultiFactor,
    Sequence,
    Cyclical,
    SemanticCluster,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::TemporalCorrelation => "temporal_correlation",
            PatternType::MultiFactor => "multi_factor",
            PatternType::Sequence => "sequence",
            PatternType::Cyclical => "cyclical",
            PatternType::SemanticCluster => "semantic_cluster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "temporal_correlation" => Some(PatternType::TemporalCorrelation),
            "multi_factor" => Some(PatternType::MultiFactor),
            "sequence" => Some(PatternType::Sequence),
            "cyclical" => Some(PatternType::Cyclical),
            "semantic_cluster" => Some(PatternType::SemanticCluster),
            _ => None,
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an event class inside a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassRef {
    pub group_key: GroupKey,
    pub event_type: EventType,
    pub label: String,
}

impl From<&EventClass> for ClassRef {
    fn from(class: &EventClass) -> Self {
        Self {
            group_key: class.key.clone(),
            event_type: class.event_type.clone(),
            label: class.label.clone(),
        }
    }
}

/// Calendar position of a cyclical pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "cycle", rename_all = "snake_case")]
pub enum CalendarSlot {
    Weekday { weekday: Weekday },
    DayOfMonth { day: u32 },
}

impl fmt::Display for CalendarSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarSlot::Weekday { weekday } => f.write_str(weekday_name(*weekday)),
            CalendarSlot::DayOfMonth { day } => write!(f, "day {} of the month", day),
        }
    }
}

/// Full English weekday name
pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// What sets a pattern off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// A single event class
    Event { class: ClassRef },
    /// Several classes on the same local day
    CoOccurring { factors: Vec<ClassRef> },
    /// An ordered chain of classes
    Chain { steps: Vec<ClassRef> },
    /// A recurring calendar position
    Calendar { slot: CalendarSlot },
    /// Semantically similar classes treated as one
    Cluster { name: String, members: Vec<ClassRef> },
}

impl TriggerSpec {
    /// Event classes the trigger consists of
    pub fn classes(&self) -> Vec<&ClassRef> {
        match self {
            TriggerSpec::Event { class } => vec![class],
            TriggerSpec::CoOccurring { factors } => factors.iter().collect(),
            TriggerSpec::Chain { steps } => steps.iter().collect(),
            TriggerSpec::Calendar { .. } => Vec::new(),
            TriggerSpec::Cluster { members, .. } => members.iter().collect(),
        }
    }

    /// Human-readable trigger description
    pub fn describe(&self) -> String {
        match self {
            TriggerSpec::Event { class } => class.label.clone(),
            TriggerSpec::CoOccurring { factors } => join_labels(factors, " + "),
            TriggerSpec::Chain { steps } => join_labels(steps, " → "),
            TriggerSpec::Calendar { slot } => slot.to_string(),
            TriggerSpec::Cluster { name, .. } => name.clone(),
        }
    }
}

fn join_labels(classes: &[ClassRef], separator: &str) -> String {
    classes
        .iter()
        .map(|c| c.label.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Time window relating trigger and outcome
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeWindow {
    /// Outcome between `min_hours` and `max_hours` after the trigger
    Hours { min_hours: f64, max_hours: f64 },
    /// Outcome on the same local day
    SameDay,
    /// Each step follows the previous within `max_gap_hours`
    Gap { max_gap_hours: f64 },
    /// Outcome on the calendar slot's date
    CalendarDay,
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::Hours {
                min_hours,
                max_hours,
            } => write!(f, "{}–{}h", trim_float(*min_hours), trim_float(*max_hours)),
            TimeWindow::SameDay => f.write_str("same day"),
            TimeWindow::Gap { max_gap_hours } => {
                write!(f, "≤{}h between steps", trim_float(*max_gap_hours))
            }
            TimeWindow::CalendarDay => f.write_str("calendar day"),
        }
    }
}

pub(crate) fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Statistics captured when the pattern was detected
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleStatistics {
    pub p_value: f64,
    /// Test statistic (chi-square) where applicable
    pub statistic: Option<f64>,
    /// Supporting occurrences
    pub occurrences: u64,
    /// Opportunities for the pattern to show (trigger occurrences, joint days, cycles)
    pub trials: u64,
    /// Outcome rate when triggered
    pub trigger_rate: f64,
    /// Outcome rate without the trigger (or chance rate)
    pub baseline_rate: f64,
    /// Wilson interval around `trigger_rate`
    pub rate_interval: (f64, f64),
    pub effect_size: Option<f64>,
    pub required_sample_size: Option<u64>,
    /// Cyclical hit rate
    pub recurrence_rate: Option<f64>,
    /// Typical local hour of the outcome (cyclical)
    pub typical_hour: Option<u32>,
    /// Correlation between factor count and outcome (multi-factor)
    pub dose_response_r: Option<f64>,
    /// Mean outcome severity on a 0-10 scale
    pub outcome_severity: Option<f64>,
    /// Length of the analysed history in days
    pub period_days: f64,
}

/// Immutable description of a discovered relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern_type: PatternType,
    pub trigger: TriggerSpec,
    pub outcome: ClassRef,
    pub window: TimeWindow,
    pub statistics: RuleStatistics,
}

#[derive(Serialize)]
struct RuleIdentity<'a> {
    pattern_type: PatternType,
    trigger: &'a TriggerSpec,
    outcome: &'a GroupKey,
    window: &'a TimeWindow,
}

impl PatternRule {
    /// Stable hash of the rule's identity (type, trigger, outcome, window)
    ///
    /// The statistics snapshot is excluded so a rediscovered rule keeps
    /// its hash.
    pub fn rule_hash(&self) -> String {
        let identity = RuleIdentity {
            pattern_type: self.pattern_type,
            trigger: &self.trigger,
            outcome: &self.outcome.group_key,
            window: &self.window,
        };
        let canonical = serde_json::to_string(&identity).unwrap_or_else(|_| format!("{:?}", self));
        format!("{:016x}", crate::events::stable_hash(&canonical))
    }

    /// Key identifying the trigger/outcome pair regardless of window
    pub fn pair_key(&self) -> String {
        let trigger = serde_json::to_string(&self.trigger).unwrap_or_default();
        format!("{}|{}|{}", self.pattern_type, trigger, self.outcome.group_key)
    }

    /// How far back events must reach to evaluate an observation
    pub fn lookback_hours(&self) -> f64 {
        match self.window {
            TimeWindow::Hours { max_hours, .. } => max_hours,
            TimeWindow::SameDay | TimeWindow::CalendarDay => 48.0,
            TimeWindow::Gap { max_gap_hours } => {
                let steps = match &self.trigger {
                    TriggerSpec::Chain { steps } => steps.len(),
                    _ => 1,
                };
                max_gap_hours * steps as f64
            }
        }
    }
}

/// Classification of one new observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// The pattern held
    Positive,
    /// The trigger occurred but the outcome did not
    Negative,
    /// Ambiguous observation
    Neutral,
}

/// One recorded observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub kind: EvidenceKind,
    pub observed_at: DateTime<Utc>,
    pub detail: String,
}

/// Evidence accumulated for a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    /// Most recent observations, oldest first
    pub history: VecDeque<EvidenceEntry>,
    /// Observations closing at or before this instant have been counted
    pub last_evaluated_at: DateTime<Utc>,
}

impl Evidence {
    /// Evidence seeded from detection counts
    pub fn seeded(positive: u64, negative: u64, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            positive,
            negative,
            neutral: 0,
            history: VecDeque::new(),
            last_evaluated_at: evaluated_at,
        }
    }

    /// Record an observation, keeping at most `capacity` history entries
    pub fn record(&mut self, entry: EvidenceEntry, capacity: usize) {
        match entry.kind {
            EvidenceKind::Positive => self.positive += 1,
            EvidenceKind::Negative => self.negative += 1,
            EvidenceKind::Neutral => self.neutral += 1,
        }
        self.history.push_back(entry);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    pub fn total(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    /// Merge evidence written concurrently for the same rule
    ///
    /// Counters take the maximum, histories are unioned by time, and the
    /// evaluation watermark advances to the later of the two. Merging is
    /// idempotent and order-independent.
    pub fn merge(&mut self, other: &Evidence) {
        self.positive = self.positive.max(other.positive);
        self.negative = self.negative.max(other.negative);
        self.neutral = self.neutral.max(other.neutral);

        let capacity = self.history.len().max(other.history.len());
        let mut combined: Vec<EvidenceEntry> = self.history.iter().cloned().collect();
        for entry in &other.history {
            if !combined.contains(entry) {
                combined.push(entry.clone());
            }
        }
        combined.sort_by_key(|e| e.observed_at);
        let skip = combined.len().saturating_sub(capacity);
        self.history = combined.into_iter().skip(skip).collect();

        self.last_evaluated_at = self.last_evaluated_at.max(other.last_evaluated_at);
    }
}

/// A detector's output before scoring and persistence
#[derive(Debug, Clone, PartialEq)]
pub struct PatternCandidate {
    pub rule: PatternRule,
    /// Initial positive evidence (occurrences)
    pub positive: u64,
    /// Initial negative evidence (trigger without outcome)
    pub negative: u64,
}

impl PatternCandidate {
    pub fn p_value(&self) -> f64 {
        self.rule.statistics.p_value
    }

    pub fn occurrences(&self) -> u64 {
        self.rule.statistics.occurrences
    }
}

/// A persisted pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPattern {
    pub id: String,
    pub user_id: String,
    pub pattern_type: PatternType,
    pub pattern_rule: PatternRule,
    /// Hash of the rule identity; unique per user
    pub rule_hash: String,
    /// Bayesian-smoothed confidence in [0, 1]
    pub confidence: f64,
    pub occurrences: u64,
    /// Composite ranking in [0, 100]
    pub impact_score: f64,
    pub evidence: Evidence,
    pub actionable_insight: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

impl DiscoveredPattern {
    /// Materialize a candidate as a new, active pattern
    ///
    /// Confidence starts from the candidate's initial evidence and the
    /// impact score from its p-value.
    pub fn from_candidate(
        user_id: &str,
        candidate: PatternCandidate,
        now: DateTime<Utc>,
        prior_strength: f64,
    ) -> Self {
        let rule = candidate.rule;
        let evidence = Evidence::seeded(candidate.positive, candidate.negative, now);
        let confidence = bayesian_confidence(evidence.positive, evidence.negative, prior_strength);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            pattern_type: rule.pattern_type,
            rule_hash: rule.rule_hash(),
            confidence,
            occurrences: rule.statistics.occurrences,
            impact_score: ImpactScorer::new().score_rule(&rule),
            actionable_insight: render_insight(&rule),
            pattern_rule: rule,
            evidence,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn class(label: &str, event_type: EventType) -> ClassRef {
        ClassRef {
            group_key: GroupKey::from_canonical(label),
            event_type,
            label: label.to_string(),
        }
    }

    fn rule(window: TimeWindow, p_value: f64) -> PatternRule {
        PatternRule {
            pattern_type: PatternType::TemporalCorrelation,
            trigger: TriggerSpec::Event {
                class: class("pasta", EventType::Meal),
            },
            outcome: class("tiredness", EventType::Symptom),
            window,
            statistics: RuleStatistics {
                p_value,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_rule_hash_ignores_statistics() {
        let window = TimeWindow::Hours {
            min_hours: 2.0,
            max_hours: 4.0,
        };
        assert_eq!(rule(window, 0.01).rule_hash(), rule(window, 0.001).rule_hash());
    }

    #[test]
    fn test_rule_hash_depends_on_window() {
        let a = rule(
            TimeWindow::Hours {
                min_hours: 2.0,
                max_hours: 4.0,
            },
            0.01,
        );
        let b = rule(
            TimeWindow::Hours {
                min_hours: 4.0,
                max_hours: 8.0,
            },
            0.01,
        );
        assert_ne!(a.rule_hash(), b.rule_hash());
        assert_eq!(a.pair_key(), b.pair_key());
    }

    #[test]
    fn test_evidence_history_is_bounded() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut evidence = Evidence::seeded(5, 1, t0);
        for i in 0..30 {
            evidence.record(
                EvidenceEntry {
                    kind: EvidenceKind::Positive,
                    observed_at: t0 + chrono::Duration::hours(i),
                    detail: format!("obs {}", i),
                },
                20,
            );
        }
        assert_eq!(evidence.positive, 35);
        assert_eq!(evidence.history.len(), 20);
        assert_eq!(evidence.history.front().map(|e| e.detail.as_str()), Some("obs 10"));
    }

    #[test]
    fn test_evidence_merge_is_idempotent() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = Evidence::seeded(10, 2, t0);
        let mut b = Evidence::seeded(12, 1, t0 + chrono::Duration::days(1));
        b.record(
            EvidenceEntry {
                kind: EvidenceKind::Neutral,
                observed_at: t0,
                detail: "x".to_string(),
            },
            20,
        );

        a.merge(&b);
        let once = a.clone();
        a.merge(&b);

        assert_eq!(a, once);
        assert_eq!(a.positive, 12);
        assert_eq!(a.negative, 2);
        assert_eq!(a.neutral, 1);
        assert_eq!(a.last_evaluated_at, t0 + chrono::Duration::days(1));
    }

    #[test]
    fn test_calendar_slot_display() {
        let slot = CalendarSlot::Weekday {
            weekday: Weekday::Tue,
        };
        assert_eq!(slot.to_string(), "Tuesday");
        assert_eq!(
            CalendarSlot::DayOfMonth { day: 15 }.to_string(),
            "day 15 of the month"
        );
    }
}
