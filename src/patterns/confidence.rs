//! Confidence Maintainer
//!
//! Keeps stored patterns honest. Each run classifies the observations that
//! closed since the pattern was last evaluated as positive, negative or
//! neutral, then updates confidence with a Beta prior:
//!
//! ```text
//! confidence = (positive + α) / (positive + negative + 2α)
//! ```
//!
//! Patterns whose confidence falls below the archive threshold are
//! archived. `Evidence::last_evaluated_at` is the watermark that makes
//! every observation count exactly once across runs.

use crate::detectors::{any_between, hours, merged_times, sequence};
use crate::events::{EventGrouper, EventTimeline, HealthEvent};
use crate::patterns::impact::ImpactScorer;
use crate::patterns::types::{
    CalendarSlot, DiscoveredPattern, EvidenceEntry, EvidenceKind, PatternRule, TimeWindow,
    TriggerSpec,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Confidence maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Beta prior strength α
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,

    /// Patterns below this confidence are archived
    #[serde(default = "default_archive_threshold")]
    pub archive_threshold: f64,

    /// Evidence history entries kept per pattern
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_prior_strength() -> f64 {
    2.0
}

fn default_archive_threshold() -> f64 {
    0.5
}

fn default_history_size() -> usize {
    20
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            prior_strength: default_prior_strength(),
            archive_threshold: default_archive_threshold(),
            history_size: default_history_size(),
        }
    }
}

/// Bayesian-smoothed confidence from evidence counts
///
/// Without any evidence this is 0.5; it approaches but never reaches 0 or 1.
pub fn bayesian_confidence(positive: u64, negative: u64, prior_strength: f64) -> f64 {
    let alpha = if prior_strength.is_finite() && prior_strength > 0.0 {
        prior_strength
    } else {
        default_prior_strength()
    };
    (positive as f64 + alpha) / (positive as f64 + negative as f64 + 2.0 * alpha)
}

/// What one maintenance pass changed
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceUpdate {
    pub observations: usize,
    pub previous_confidence: f64,
    pub confidence: f64,
    /// The pattern crossed the archive threshold in this pass
    pub archived: bool,
}

/// Updates stored patterns from newly observed events
#[derive(Debug, Clone)]
pub struct ConfidenceMaintainer {
    config: ConfidenceConfig,
    grouper: EventGrouper,
    scorer: ImpactScorer,
}

impl ConfidenceMaintainer {
    pub fn new(config: ConfidenceConfig, grouper: EventGrouper) -> Self {
        Self {
            config,
            grouper,
            scorer: ImpactScorer::new(),
        }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Classify observations among `new_events` that closed in
    /// `(last_evaluated_at, now]`
    ///
    /// `new_events` should reach back far enough to cover the pattern's
    /// lookback before the watermark.
    pub fn evaluate_against_new_events(
        &self,
        pattern: &DiscoveredPattern,
        new_events: &[HealthEvent],
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Vec<EvidenceEntry> {
        let timeline = EventTimeline::build(new_events, &self.grouper, tz);
        self.evaluate_timeline(pattern, &timeline, now)
    }

    /// Same as [`Self::evaluate_against_new_events`] over a prepared timeline
    pub fn evaluate_timeline(
        &self,
        pattern: &DiscoveredPattern,
        timeline: &EventTimeline,
        now: DateTime<Utc>,
    ) -> Vec<EvidenceEntry> {
        let since = pattern.evidence.last_evaluated_at;
        if now <= since {
            return Vec::new();
        }
        let window = ObservationWindow { since, now };
        let rule = &pattern.pattern_rule;

        match (&rule.trigger, rule.window) {
            (
                TriggerSpec::Event { .. } | TriggerSpec::Cluster { .. },
                TimeWindow::Hours {
                    min_hours,
                    max_hours,
                },
            ) => evaluate_hour_window(rule, timeline, window, min_hours, max_hours),
            (TriggerSpec::CoOccurring { factors }, _) => {
                evaluate_same_day(rule, factors.len(), timeline, window)
            }
            (TriggerSpec::Chain { .. }, TimeWindow::Gap { max_gap_hours }) => {
                evaluate_chain(rule, timeline, window, max_gap_hours)
            }
            (TriggerSpec::Calendar { slot }, _) => evaluate_calendar(rule, *slot, timeline, window),
            _ => {
                tracing::debug!(
                    pattern_id = %pattern.id,
                    pattern_type = %pattern.pattern_type,
                    "Rule shape not evaluable, skipping"
                );
                Vec::new()
            }
        }
    }

    /// Record observations, recompute confidence and impact, archive if needed
    ///
    /// Returns `None` and leaves the pattern untouched when there is nothing
    /// to record, so reruns without new events change nothing.
    pub fn apply(
        &self,
        pattern: &mut DiscoveredPattern,
        entries: Vec<EvidenceEntry>,
        now: DateTime<Utc>,
    ) -> Option<MaintenanceUpdate> {
        if entries.is_empty() {
            return None;
        }

        let previous_confidence = pattern.confidence;
        let observations = entries.len();
        for entry in entries {
            pattern.evidence.record(entry, self.config.history_size);
        }
        pattern.evidence.last_evaluated_at = now;

        pattern.confidence = bayesian_confidence(
            pattern.evidence.positive,
            pattern.evidence.negative,
            self.config.prior_strength,
        );
        pattern.impact_score = self.scorer.rescore(pattern);
        pattern.updated_at = now;

        let archived = !pattern.archived && pattern.confidence < self.config.archive_threshold;
        if archived {
            pattern.archived = true;
            tracing::info!(
                pattern_id = %pattern.id,
                user_id = %pattern.user_id,
                confidence = pattern.confidence,
                "Pattern archived"
            );
        }

        Some(MaintenanceUpdate {
            observations,
            previous_confidence,
            confidence: pattern.confidence,
            archived,
        })
    }

    /// Evaluate and apply in one step, returning the updated copy
    pub fn maintain(
        &self,
        pattern: &DiscoveredPattern,
        timeline: &EventTimeline,
        now: DateTime<Utc>,
    ) -> Option<(DiscoveredPattern, MaintenanceUpdate)> {
        let entries = self.evaluate_timeline(pattern, timeline, now);
        let mut updated = pattern.clone();
        let update = self.apply(&mut updated, entries, now)?;
        Some((updated, update))
    }
}

#[derive(Debug, Clone, Copy)]
struct ObservationWindow {
    since: DateTime<Utc>,
    now: DateTime<Utc>,
}

impl ObservationWindow {
    fn closes(&self, at: DateTime<Utc>) -> bool {
        at > self.since && at <= self.now
    }

    /// Local dates that may have ended inside the window
    fn dates(&self, timeline: &EventTimeline) -> Vec<NaiveDate> {
        let first = timeline.local_date(self.since);
        let last = timeline.local_date(self.now);
        first.iter_days().take_while(|d| *d <= last).collect()
    }
}

fn entry(kind: EvidenceKind, observed_at: DateTime<Utc>, detail: String) -> EvidenceEntry {
    EvidenceEntry {
        kind,
        observed_at,
        detail,
    }
}

fn evaluate_hour_window(
    rule: &PatternRule,
    timeline: &EventTimeline,
    window: ObservationWindow,
    min_hours: f64,
    max_hours: f64,
) -> Vec<EvidenceEntry> {
    let triggers = merged_times(timeline, &rule.trigger.classes());
    let outcomes = timeline.times(&rule.outcome.group_key);
    let (from, to) = (hours(min_hours), hours(max_hours));

    triggers
        .iter()
        .filter(|t| window.closes(**t + to))
        .map(|t| {
            if any_between(outcomes, *t + from, *t + to) {
                entry(EvidenceKind::Positive, *t, format!("{} within {}", rule.outcome.label, rule.window))
            } else if from > chrono::Duration::zero() && any_between(outcomes, *t, *t + from) {
                // Too early still means the window itself stayed empty
                entry(
                    EvidenceKind::Negative,
                    *t,
                    format!("{} only before {}", rule.outcome.label, rule.window),
                )
            } else {
                entry(EvidenceKind::Negative, *t, format!("no {} within {}", rule.outcome.label, rule.window))
            }
        })
        .collect()
}

fn evaluate_same_day(
    rule: &PatternRule,
    factor_count: usize,
    timeline: &EventTimeline,
    window: ObservationWindow,
) -> Vec<EvidenceEntry> {
    let factor_days: Vec<BTreeSet<NaiveDate>> = rule
        .trigger
        .classes()
        .iter()
        .map(|c| timeline.dates_of(&c.group_key))
        .collect();
    let outcome_days = timeline.dates_of(&rule.outcome.group_key);

    let mut entries = Vec::new();
    for date in window.dates(timeline) {
        let Some(end) = timeline.end_of_local_day(date) else {
            continue;
        };
        if !window.closes(end) {
            continue;
        }

        let present = factor_days.iter().filter(|days| days.contains(&date)).count();
        let outcome = outcome_days.contains(&date);
        if present == factor_count {
            let (kind, detail) = if outcome {
                (EvidenceKind::Positive, format!("all factors and {} on {}", rule.outcome.label, date))
            } else {
                (EvidenceKind::Negative, format!("all factors, no {} on {}", rule.outcome.label, date))
            };
            entries.push(entry(kind, end, detail));
        } else if present > 0 && outcome {
            entries.push(entry(
                EvidenceKind::Neutral,
                end,
                format!("{} of {} factors and {} on {}", present, factor_count, rule.outcome.label, date),
            ));
        }
    }
    entries
}

fn evaluate_chain(
    rule: &PatternRule,
    timeline: &EventTimeline,
    window: ObservationWindow,
    max_gap_hours: f64,
) -> Vec<EvidenceEntry> {
    let mut keys: Vec<_> = rule
        .trigger
        .classes()
        .into_iter()
        .map(|c| c.group_key.clone())
        .collect();
    keys.push(rule.outcome.group_key.clone());

    let Some((first, rest)) = keys.split_first() else {
        return Vec::new();
    };
    let gap = hours(max_gap_hours);
    let span = gap * rest.len() as i32;
    let step_times: Vec<&[DateTime<Utc>]> = rest.iter().map(|k| timeline.times(k)).collect();

    timeline
        .times(first)
        .iter()
        .filter(|t| window.closes(**t + span))
        .map(|t| {
            let reached = sequence::chain_progress(&step_times, *t, gap);
            let kind = if reached == rest.len() {
                EvidenceKind::Positive
            } else if reached >= 1 {
                EvidenceKind::Negative
            } else {
                EvidenceKind::Neutral
            };
            entry(kind, *t, format!("{} of {} steps", reached + 1, keys.len()))
        })
        .collect()
}

fn evaluate_calendar(
    rule: &PatternRule,
    slot: CalendarSlot,
    timeline: &EventTimeline,
    window: ObservationWindow,
) -> Vec<EvidenceEntry> {
    let class_days = timeline.dates_of(&rule.outcome.group_key);

    let mut entries = Vec::new();
    for date in window.dates(timeline) {
        let Some(end) = timeline.end_of_local_day(date) else {
            continue;
        };
        if !window.closes(end) {
            continue;
        }

        let present = class_days.contains(&date);
        if slot.matches(date) {
            let (kind, detail) = if present {
                (EvidenceKind::Positive, format!("{} on {}", rule.outcome.label, date))
            } else {
                (EvidenceKind::Negative, format!("no {} on {}", rule.outcome.label, date))
            };
            entries.push(entry(kind, end, detail));
        } else if present {
            entries.push(entry(
                EvidenceKind::Neutral,
                end,
                format!("{} off-cycle on {}", rule.outcome.label, date),
            ));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::*;
    use crate::patterns::types::{ClassRef, Evidence, PatternCandidate, PatternType, RuleStatistics};
    use chrono::Weekday;

    fn class(grouper: &EventGrouper, event: &HealthEvent) -> ClassRef {
        ClassRef::from(&grouper.classify(event).unwrap())
    }

    fn pasta_pattern(grouper: &EventGrouper, created: DateTime<Utc>) -> DiscoveredPattern {
        let candidate = PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::TemporalCorrelation,
                trigger: TriggerSpec::Event {
                    class: class(grouper, &meal("u1", "pasta", created)),
                },
                outcome: class(grouper, &symptom("u1", "tiredness", created)),
                window: TimeWindow::Hours {
                    min_hours: 2.0,
                    max_hours: 4.0,
                },
                statistics: RuleStatistics {
                    p_value: 0.001,
                    occurrences: 18,
                    trials: 20,
                    period_days: 90.0,
                    ..Default::default()
                },
            },
            positive: 18,
            negative: 2,
        };
        DiscoveredPattern::from_candidate("u1", candidate, created, 2.0)
    }

    fn maintainer() -> ConfidenceMaintainer {
        ConfidenceMaintainer::new(ConfidenceConfig::default(), EventGrouper::default())
    }

    #[test]
    fn test_bayesian_confidence() {
        assert_eq!(bayesian_confidence(0, 0, 2.0), 0.5);
        assert!((bayesian_confidence(18, 2, 2.0) - 20.0 / 24.0).abs() < 1e-12);
        // A broken prior falls back to the default strength
        assert_eq!(bayesian_confidence(0, 0, f64::NAN), 0.5);
    }

    #[test]
    fn test_positive_evidence_is_monotonic() {
        let mut previous = bayesian_confidence(3, 5, 2.0);
        for positive in 4..200 {
            let next = bayesian_confidence(positive, 5, 2.0);
            assert!(next > previous);
            assert!(next < 1.0);
            previous = next;
        }
    }

    #[test]
    fn test_hour_window_classification() {
        let grouper = EventGrouper::default();
        let pattern = pasta_pattern(&grouper, at(90, 0, 0));
        let events = vec![
            meal("u1", "pasta", at(91, 12, 0)),
            symptom("u1", "tiredness", at(91, 15, 0)),
            meal("u1", "pasta", at(92, 12, 0)),
            meal("u1", "pasta", at(93, 12, 0)),
            symptom("u1", "tiredness", at(93, 13, 0)),
            // Window closes after `now`
            meal("u1", "pasta", at(94, 22, 0)),
        ];

        let entries =
            maintainer().evaluate_against_new_events(&pattern, &events, chrono_tz::UTC, at(95, 0, 0));
        let kinds: Vec<EvidenceKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EvidenceKind::Positive, EvidenceKind::Negative, EvidenceKind::Negative]
        );
        assert!(entries[2].detail.contains("only before"));
    }

    #[test]
    fn test_early_outcomes_erode_a_stale_window() {
        let grouper = EventGrouper::default();
        let maintainer = maintainer();
        let mut pattern = pasta_pattern(&grouper, at(90, 0, 0));

        // Tiredness now follows pasta after one hour, never inside 2-4h
        let mut events = Vec::new();
        for day in 91..131 {
            events.push(meal("u1", "pasta", at(day, 12, 0)));
            events.push(symptom("u1", "tiredness", at(day, 13, 0)));
        }

        let entries =
            maintainer.evaluate_against_new_events(&pattern, &events, chrono_tz::UTC, at(131, 0, 0));
        assert_eq!(entries.len(), 40);
        assert!(entries.iter().all(|e| e.kind == EvidenceKind::Negative));

        let update = maintainer.apply(&mut pattern, entries, at(131, 0, 0)).unwrap();
        assert_eq!(pattern.evidence.negative, 42);
        assert!(update.archived);
    }

    #[test]
    fn test_observations_count_once() {
        let grouper = EventGrouper::default();
        let maintainer = maintainer();
        let pattern = pasta_pattern(&grouper, at(90, 0, 0));
        let events = vec![
            meal("u1", "pasta", at(91, 12, 0)),
            symptom("u1", "tiredness", at(91, 15, 0)),
        ];
        let timeline = EventTimeline::build(&events, &grouper, chrono_tz::UTC);

        let (updated, update) = maintainer.maintain(&pattern, &timeline, at(92, 0, 0)).unwrap();
        assert_eq!(update.observations, 1);
        assert_eq!(updated.evidence.positive, 19);
        assert!(updated.confidence > pattern.confidence);

        // Same events, later run: nothing new closed
        assert!(maintainer.maintain(&updated, &timeline, at(93, 0, 0)).is_none());
    }

    #[test]
    fn test_negative_evidence_archives() {
        let grouper = EventGrouper::default();
        let maintainer = maintainer();
        let mut pattern = pasta_pattern(&grouper, at(90, 0, 0));

        let events: Vec<_> = (91..130).map(|day| meal("u1", "pasta", at(day, 12, 0))).collect();
        let entries =
            maintainer.evaluate_against_new_events(&pattern, &events, chrono_tz::UTC, at(131, 0, 0));
        assert_eq!(entries.len(), 39);

        let update = maintainer.apply(&mut pattern, entries, at(131, 0, 0)).unwrap();
        assert!(update.archived);
        assert!(pattern.archived);
        assert!(pattern.confidence < 0.5);
        assert_eq!(pattern.evidence.history.len(), 20);
        assert_eq!(pattern.evidence.negative, 41);
    }

    #[test]
    fn test_calendar_evaluation() {
        let grouper = EventGrouper::default();
        let craving = class(&grouper, &symptom("u1", "craving", at(0, 0, 0)));
        let pattern = DiscoveredPattern {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            pattern_type: PatternType::Cyclical,
            pattern_rule: PatternRule {
                pattern_type: PatternType::Cyclical,
                trigger: TriggerSpec::Calendar {
                    slot: CalendarSlot::Weekday {
                        weekday: Weekday::Tue,
                    },
                },
                outcome: craving,
                window: TimeWindow::CalendarDay,
                statistics: RuleStatistics::default(),
            },
            rule_hash: "h".to_string(),
            confidence: 0.8,
            occurrences: 8,
            impact_score: 50.0,
            evidence: Evidence::seeded(8, 0, at(56, 0, 0)),
            actionable_insight: String::new(),
            created_at: at(56, 0, 0),
            updated_at: at(56, 0, 0),
            archived: false,
        };

        // Tuesday day 57 hit, Tuesday day 64 missed, Thursday day 59 off-cycle
        let events = vec![
            symptom("u1", "craving", at(57, 15, 0)),
            symptom("u1", "craving", at(59, 15, 0)),
        ];
        let entries = maintainer().evaluate_against_new_events(
            &pattern,
            &events,
            chrono_tz::UTC,
            at(65, 0, 0),
        );
        let kinds: Vec<EvidenceKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EvidenceKind::Positive, EvidenceKind::Neutral, EvidenceKind::Negative]
        );
    }

    #[test]
    fn test_chain_evaluation() {
        let grouper = EventGrouper::default();
        let coffee = class(&grouper, &meal("u1", "coffee", at(0, 0, 0)));
        let run = class(&grouper, &exercise("u1", "run", at(0, 0, 0)));
        let pain = class(&grouper, &symptom("u1", "knee pain", at(0, 0, 0)));
        let candidate = PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::Sequence,
                trigger: TriggerSpec::Chain {
                    steps: vec![coffee, run],
                },
                outcome: pain,
                window: TimeWindow::Gap { max_gap_hours: 6.0 },
                statistics: RuleStatistics::default(),
            },
            positive: 10,
            negative: 1,
        };
        let pattern = DiscoveredPattern::from_candidate("u1", candidate, at(10, 0, 0), 2.0);

        let events = vec![
            meal("u1", "coffee", at(11, 7, 0)),
            exercise("u1", "run", at(11, 8, 0)),
            symptom("u1", "knee pain", at(11, 10, 0)),
            meal("u1", "coffee", at(12, 7, 0)),
            exercise("u1", "run", at(12, 8, 0)),
            meal("u1", "coffee", at(13, 7, 0)),
        ];
        let entries =
            maintainer().evaluate_against_new_events(&pattern, &events, chrono_tz::UTC, at(14, 0, 0));
        let kinds: Vec<EvidenceKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EvidenceKind::Positive, EvidenceKind::Negative, EvidenceKind::Neutral]
        );
    }


    #[test]
    fn test_same_day_evaluation() {
        let grouper = EventGrouper::default();
        let coffee = class(&grouper, &meal("u1", "coffee", at(0, 0, 0)));
        let stressed = class(&grouper, &mood("u1", "stressed", at(0, 0, 0)));
        let headache = class(&grouper, &symptom("u1", "headache", at(0, 0, 0)));
        let candidate = PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::MultiFactor,
                trigger: TriggerSpec::CoOccurring {
                    factors: vec![coffee, stressed],
                },
                outcome: headache,
                window: TimeWindow::SameDay,
                statistics: RuleStatistics::default(),
            },
            positive: 10,
            negative: 0,
        };
        let pattern = DiscoveredPattern::from_candidate("u1", candidate, at(20, 0, 0), 2.0);

        let events = vec![
            meal("u1", "coffee", at(20, 8, 0)),
            mood("u1", "stressed", at(20, 10, 0)),
            symptom("u1", "headache", at(20, 16, 0)),
            meal("u1", "coffee", at(21, 8, 0)),
            mood("u1", "stressed", at(21, 10, 0)),
            meal("u1", "coffee", at(22, 8, 0)),
            symptom("u1", "headache", at(22, 16, 0)),
            // Day 23 has not ended yet
            meal("u1", "coffee", at(23, 8, 0)),
            mood("u1", "stressed", at(23, 9, 0)),
        ];
        let entries = maintainer().evaluate_against_new_events(
            &pattern,
            &events,
            chrono_tz::UTC,
            at(23, 12, 0),
        );
        let kinds: Vec<EvidenceKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EvidenceKind::Positive, EvidenceKind::Negative, EvidenceKind::Neutral]
        );
    }
}
