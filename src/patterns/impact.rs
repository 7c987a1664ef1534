//! Impact Scorer
//!
//! Ranks patterns on a 0-100 scale from four 0-10 terms:
//!
//! ```text
//! impact = severity*2.0 + frequency*1.5 + confidence*3.0 + actionability*3.5
//! ```
//!
//! The weights sum to 10, so the weighted sum is already on 0-100.

use crate::events::EventType;
use crate::patterns::types::{ClassRef, DiscoveredPattern, PatternRule, TriggerSpec};

const SEVERITY_WEIGHT: f64 = 2.0;
const FREQUENCY_WEIGHT: f64 = 1.5;
const CONFIDENCE_WEIGHT: f64 = 3.0;
const ACTIONABILITY_WEIGHT: f64 = 3.5;

/// Severity used when the outcome carries none
pub const DEFAULT_SEVERITY: f64 = 5.0;

/// Upper bound on the confidence term before scaling
const CONFIDENCE_CAP: f64 = 0.99;

/// Computes impact scores
#[derive(Debug, Clone, Copy, Default)]
pub struct ImpactScorer;

impl ImpactScorer {
    pub fn new() -> Self {
        Self
    }

    /// Weighted sum of 0-10 terms, clamped to [0, 100]
    pub fn score(&self, severity: f64, frequency: f64, confidence: f64, actionability: f64) -> f64 {
        let total = clamp_term(severity) * SEVERITY_WEIGHT
            + clamp_term(frequency) * FREQUENCY_WEIGHT
            + clamp_term(confidence) * CONFIDENCE_WEIGHT
            + clamp_term(actionability) * ACTIONABILITY_WEIGHT;
        total.clamp(0.0, 100.0)
    }

    /// Score a freshly detected rule; confidence derives from its p-value
    pub fn score_rule(&self, rule: &PatternRule) -> f64 {
        let p_value = rule.statistics.p_value;
        let confidence = if p_value.is_finite() {
            (1.0 - p_value).clamp(0.0, CONFIDENCE_CAP) * 10.0
        } else {
            0.0
        };
        self.score_with_confidence(rule, confidence)
    }

    /// Rescore a stored pattern from its maintained confidence
    pub fn rescore(&self, pattern: &DiscoveredPattern) -> f64 {
        let confidence = pattern.confidence.clamp(0.0, CONFIDENCE_CAP) * 10.0;
        self.score_with_confidence(&pattern.pattern_rule, confidence)
    }

    fn score_with_confidence(&self, rule: &PatternRule, confidence: f64) -> f64 {
        let stats = &rule.statistics;
        let severity = stats.outcome_severity.unwrap_or(DEFAULT_SEVERITY);
        let frequency = frequency_term(stats.occurrences, stats.period_days);
        self.score(severity, frequency, confidence, actionability(&rule.trigger))
    }
}

/// Occurrences per week relative to one per day, on 0-10
pub fn frequency_term(occurrences: u64, period_days: f64) -> f64 {
    let weeks = (period_days / 7.0).max(1.0 / 7.0);
    let per_week = occurrences as f64 / weeks;
    (per_week / 7.0 * 10.0).min(10.0)
}

/// How much direct control the user has over a trigger, on 0-10
pub fn actionability(trigger: &TriggerSpec) -> f64 {
    if let TriggerSpec::Calendar { .. } = trigger {
        return 6.0;
    }
    trigger
        .classes()
        .into_iter()
        .map(class_actionability)
        .fold(None, |best: Option<f64>, score| Some(best.map_or(score, |b| b.max(score))))
        .unwrap_or(5.0)
}

fn class_actionability(class: &ClassRef) -> f64 {
    if class.label.contains("stress") {
        return 2.0;
    }
    match class.event_type {
        EventType::Meal => 9.0,
        EventType::Exercise => 8.0,
        EventType::Sleep | EventType::ReminderCompletion => 7.0,
        EventType::Mood => 4.0,
        EventType::Symptom | EventType::Other(_) => 5.0,
    }
}

fn clamp_term(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 10.0)
    } else {
        0.0
    }
}
