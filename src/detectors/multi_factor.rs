//! Multi-Factor Analyzer
//!
//! Extends the temporal test to combinations of 2-4 trigger classes seen on
//! the same local day. Each analysed day is one row:
//!
//! ```text
//!                   outcome that day   no outcome
//! all factors             a                b
//! any other day           c                d
//! ```
//!
//! Only the most frequent trigger classes are combined, and a combination
//! is only extended while its joint support stays above the occurrence
//! threshold. A combination must beat every one of its single factors, so
//! a lone strong trigger does not spawn a family of redundant combinations.

use crate::detectors::{cohort_effect, PatternDetector};
use crate::events::{EventClass, EventTimeline};
use crate::patterns::{
    ClassRef, PatternCandidate, PatternRule, PatternType, RuleStatistics, TimeWindow, TriggerSpec,
};
use crate::stats::{self, SignificanceGate};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Multi-factor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiFactorConfig {
    /// Largest combination size
    #[serde(default = "default_max_factors")]
    pub max_factors: usize,

    /// How many of the most frequent trigger classes are combined
    #[serde(default = "default_max_factor_candidates")]
    pub max_factor_candidates: usize,
}

fn default_max_factors() -> usize {
    4
}

fn default_max_factor_candidates() -> usize {
    12
}

impl Default for MultiFactorConfig {
    fn default() -> Self {
        Self {
            max_factors: default_max_factors(),
            max_factor_candidates: default_max_factor_candidates(),
        }
    }
}

/// Finds same-day factor combinations that precede an outcome
#[derive(Debug, Clone)]
pub struct MultiFactorDetector {
    config: MultiFactorConfig,
    gate: SignificanceGate,
}

struct Factor<'a> {
    class: &'a EventClass,
    days: BTreeSet<NaiveDate>,
}

impl MultiFactorDetector {
    pub fn new(config: MultiFactorConfig, gate: SignificanceGate) -> Self {
        Self { config, gate }
    }

    /// Combinations of size >= 2 whose joint day count clears the threshold
    fn supported_combinations(&self, factors: &[Factor<'_>]) -> Vec<(Vec<usize>, BTreeSet<NaiveDate>)> {
        let mut combos = Vec::new();
        for (i, factor) in factors.iter().enumerate() {
            self.extend_combination(factors, vec![i], factor.days.clone(), &mut combos);
        }
        combos
    }

    fn extend_combination(
        &self,
        factors: &[Factor<'_>],
        members: Vec<usize>,
        joint: BTreeSet<NaiveDate>,
        out: &mut Vec<(Vec<usize>, BTreeSet<NaiveDate>)>,
    ) {
        if members.len() >= self.config.max_factors.max(2) {
            return;
        }
        let last = members.last().copied().unwrap_or(0);
        for next in (last + 1)..factors.len() {
            let narrowed: BTreeSet<NaiveDate> =
                joint.intersection(&factors[next].days).copied().collect();
            if (narrowed.len() as u64) < self.gate.min_occurrences {
                continue;
            }
            let mut extended = members.clone();
            extended.push(next);
            out.push((extended.clone(), narrowed.clone()));
            self.extend_combination(factors, extended, narrowed, out);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        timeline: &EventTimeline,
        dates: &[NaiveDate],
        factors: &[Factor<'_>],
        combo: &[usize],
        joint_days: &BTreeSet<NaiveDate>,
        outcome: &EventClass,
        outcome_days: &BTreeSet<NaiveDate>,
    ) -> Option<PatternCandidate> {
        let joint = joint_days.len() as u64;
        let joint_hits = joint_days.intersection(outcome_days).count() as u64;
        let others = dates.len() as u64 - joint;
        let other_hits = outcome_days.len() as u64 - joint_hits;
        if others == 0 || joint == 0 {
            return None;
        }

        let joint_rate = joint_hits as f64 / joint as f64;
        let baseline_rate = other_hits as f64 / others as f64;
        if joint_rate <= baseline_rate {
            return None;
        }

        // The combination has to add something over each single factor
        let beats_singles = combo.iter().all(|&i| {
            let days = &factors[i].days;
            let hits = days.intersection(outcome_days).count();
            joint_rate > hits as f64 / days.len().max(1) as f64
        });
        if !beats_singles {
            return None;
        }

        let table = [
            [joint_hits as f64, (joint - joint_hits) as f64],
            [other_hits as f64, (others - other_hits) as f64],
        ];
        let test = match stats::chi_square_test(&table) {
            Ok(test) => test,
            Err(e) => {
                tracing::debug!(error = %e, outcome = %outcome.label, "Chi-square failed");
                return None;
            }
        };
        if !self.gate.passes(test.p_value, joint_hits) {
            return None;
        }

        // Dose-response: more factors present, more likely the outcome
        let present: Vec<f64> = dates
            .iter()
            .map(|d| combo.iter().filter(|&&i| factors[i].days.contains(d)).count() as f64)
            .collect();
        let occurred: Vec<f64> = dates
            .iter()
            .map(|d| if outcome_days.contains(d) { 1.0 } else { 0.0 })
            .collect();
        let dose_response_r = stats::pearson_correlation(&present, &occurred)
            .ok()
            .map(|c| c.r);

        let (effect_size, required_sample_size) =
            cohort_effect(joint_hits, joint, other_hits, others, &self.gate);

        let mut members: Vec<ClassRef> = combo.iter().map(|&i| ClassRef::from(factors[i].class)).collect();
        members.sort_by(|a, b| a.group_key.cmp(&b.group_key));

        Some(PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::MultiFactor,
                trigger: TriggerSpec::CoOccurring { factors: members },
                outcome: ClassRef::from(outcome),
                window: TimeWindow::SameDay,
                statistics: RuleStatistics {
                    p_value: test.p_value,
                    statistic: Some(test.statistic),
                    occurrences: joint_hits,
                    trials: joint,
                    trigger_rate: joint_rate,
                    baseline_rate,
                    rate_interval: stats::confidence_interval(joint_hits, joint, 1.96),
                    effect_size,
                    required_sample_size,
                    dose_response_r,
                    outcome_severity: timeline.mean_severity(&outcome.key),
                    period_days: timeline.span_days(),
                    ..Default::default()
                },
            },
            positive: joint_hits,
            negative: joint - joint_hits,
        })
    }
}

impl PatternDetector for MultiFactorDetector {
    fn name(&self) -> &'static str {
        "multi_factor"
    }

    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate> {
        // Only days that are over by `until`
        let dates: Vec<NaiveDate> = timeline
            .dates()
            .into_iter()
            .filter(|d| timeline.end_of_local_day(*d).is_some_and(|end| end <= until))
            .collect();
        let analysed: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        if dates.len() < 2 {
            return Vec::new();
        }

        let days_of = |class: &EventClass| -> BTreeSet<NaiveDate> {
            timeline
                .dates_of(&class.key)
                .intersection(&analysed)
                .copied()
                .collect()
        };

        let mut factors: Vec<Factor<'_>> = timeline
            .trigger_classes()
            .map(|class| Factor {
                class,
                days: days_of(class),
            })
            .filter(|f| f.days.len() as u64 >= self.gate.min_occurrences)
            .collect();
        factors.sort_by(|a, b| {
            b.days
                .len()
                .cmp(&a.days.len())
                .then_with(|| a.class.key.cmp(&b.class.key))
        });
        factors.truncate(self.config.max_factor_candidates);
        if factors.len() < 2 {
            return Vec::new();
        }

        let outcomes: Vec<(&EventClass, BTreeSet<NaiveDate>)> = timeline
            .outcome_classes()
            .map(|class| (class, days_of(class)))
            .filter(|(_, days)| !days.is_empty())
            .collect();

        let combos = self.supported_combinations(&factors);
        tracing::debug!(
            factors = factors.len(),
            combinations = combos.len(),
            "Multi-factor combinations built"
        );

        let mut candidates = Vec::new();
        for (combo, joint_days) in &combos {
            for (outcome, outcome_days) in &outcomes {
                if combo.iter().any(|&i| factors[i].class.key == outcome.key) {
                    continue;
                }
                if let Some(candidate) = self.evaluate(
                    timeline,
                    &dates,
                    &factors,
                    combo,
                    joint_days,
                    outcome,
                    outcome_days,
                ) {
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::*;
    use crate::events::EventGrouper;

    fn detector() -> MultiFactorDetector {
        MultiFactorDetector::new(MultiFactorConfig::default(), SignificanceGate::default())
    }

    /// Coffee on even days, stress every third day, headache only when both
    fn coffee_stress_events() -> Vec<crate::events::HealthEvent> {
        let mut events = Vec::new();
        for day in 0..60 {
            if day % 2 == 0 {
                events.push(meal("u1", "coffee", at(day, 8, 0)));
            }
            if day % 3 == 0 {
                events.push(mood("u1", "stressed", at(day, 10, 0)));
            }
            if day % 6 == 0 {
                events.push(symptom("u1", "headache", at(day, 16, 0)));
            }
        }
        events
    }

    #[test]
    fn test_joint_factors_detected() {
        let timeline =
            EventTimeline::build(&coffee_stress_events(), &EventGrouper::default(), chrono_tz::UTC);
        let candidates = detector().detect(&timeline, at(61, 0, 0));

        assert_eq!(candidates.len(), 1);
        let rule = &candidates[0].rule;
        assert_eq!(rule.outcome.label, "headache");
        assert_eq!(rule.window, TimeWindow::SameDay);

        let labels: BTreeSet<&str> = rule.trigger.classes().into_iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, BTreeSet::from(["coffee", "stressed"]));
        assert_eq!(rule.statistics.occurrences, 10);
        assert_eq!(rule.statistics.trigger_rate, 1.0);
        assert!(rule.statistics.p_value < 0.05);
        assert!(rule.statistics.dose_response_r.is_some_and(|r| r > 0.0));
    }

    #[test]
    fn test_single_factor_explains_outcome() {
        let mut events = Vec::new();
        for day in 0..60 {
            if day % 2 == 0 {
                events.push(meal("u1", "coffee", at(day, 8, 0)));
                // Headache follows every coffee, stressed or not
                events.push(symptom("u1", "headache", at(day, 16, 0)));
            }
            if day % 3 == 0 {
                events.push(mood("u1", "stressed", at(day, 10, 0)));
            }
        }
        let timeline = EventTimeline::build(&events, &EventGrouper::default(), chrono_tz::UTC);
        assert!(detector().detect(&timeline, at(61, 0, 0)).is_empty());
    }

    #[test]
    fn test_factor_order_does_not_change_identity() {
        let timeline =
            EventTimeline::build(&coffee_stress_events(), &EventGrouper::default(), chrono_tz::UTC);
        let first = detector().detect(&timeline, at(61, 0, 0));
        let second = detector().detect(&timeline, at(62, 0, 0));
        assert_eq!(first[0].rule.rule_hash(), second[0].rule.rule_hash());
    }
}
