//! Temporal Correlation Detector
//!
//! For every (trigger class, outcome class) pair and every configured hour
//! window `[min, max]`, compares how often the outcome follows a trigger
//! inside the window against a baseline of trigger-free days, using a 2×2
//! chi-square test:
//!
//! ```text
//!                 outcome in window   no outcome
//! after trigger         a                 b
//! baseline day          c                 d
//! ```
//!
//! Baseline windows are anchored at the trigger's median local time of day
//! on days without any trigger occurrence. Per pair, the window with the
//! lowest p-value wins.

use crate::detectors::{any_between, cohort_effect, hours, PatternDetector};
use crate::events::{EventClass, EventTimeline};
use crate::patterns::{
    ClassRef, PatternCandidate, PatternRule, PatternType, RuleStatistics, TimeWindow, TriggerSpec,
};
use crate::stats::{self, SignificanceGate};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Temporal detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Hour windows `[min, max]` scanned after each trigger
    #[serde(default = "default_windows")]
    pub windows: Vec<[f64; 2]>,
}

fn default_windows() -> Vec<[f64; 2]> {
    vec![[0.0, 2.0], [2.0, 4.0], [4.0, 8.0], [8.0, 24.0]]
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
        }
    }
}

/// Finds trigger → outcome correlations within hour windows
#[derive(Debug, Clone)]
pub struct TemporalCorrelationDetector {
    config: TemporalConfig,
    gate: SignificanceGate,
}

/// Hit/trial counts for one side of the contingency table
#[derive(Debug, Clone, Copy, Default)]
struct WindowCounts {
    hits: u64,
    trials: u64,
}

impl WindowCounts {
    fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.hits as f64 / self.trials as f64
        }
    }
}

impl TemporalCorrelationDetector {
    pub fn new(config: TemporalConfig, gate: SignificanceGate) -> Self {
        Self { config, gate }
    }

    /// Test one trigger against one outcome over every window
    ///
    /// `trigger_times` must be sorted. Returns the best window's candidate
    /// if any window clears the gate.
    pub(crate) fn evaluate_trigger(
        &self,
        timeline: &EventTimeline,
        pattern_type: PatternType,
        trigger: &TriggerSpec,
        trigger_times: &[DateTime<Utc>],
        outcome: &EventClass,
        until: DateTime<Utc>,
    ) -> Option<PatternCandidate> {
        let outcome_times = timeline.times(&outcome.key);
        if trigger_times.is_empty() || outcome_times.is_empty() {
            return None;
        }

        let trigger_dates: BTreeSet<NaiveDate> =
            trigger_times.iter().map(|t| timeline.local_date(*t)).collect();
        let anchor = median_time_of_day(timeline, trigger_times)?;
        let baseline_starts: Vec<DateTime<Utc>> = timeline
            .dates()
            .into_iter()
            .filter(|d| !trigger_dates.contains(d))
            .filter_map(|d| timeline.local_to_utc(d, anchor))
            .collect();

        let mut best: Option<PatternCandidate> = None;

        for &[min_hours, max_hours] in &self.config.windows {
            if !(min_hours >= 0.0 && max_hours > min_hours) {
                tracing::debug!(min_hours, max_hours, "Skipping malformed window");
                continue;
            }
            let (from, to) = (hours(min_hours), hours(max_hours));

            let triggered = count_windows(trigger_times, outcome_times, from, to, until);
            let baseline = count_windows(&baseline_starts, outcome_times, from, to, until);
            if triggered.trials == 0 || baseline.trials == 0 {
                continue;
            }
            if triggered.rate() <= baseline.rate() {
                continue;
            }

            let table = [
                [triggered.hits as f64, (triggered.trials - triggered.hits) as f64],
                [baseline.hits as f64, (baseline.trials - baseline.hits) as f64],
            ];
            let test = match stats::chi_square_test(&table) {
                Ok(test) => test,
                Err(e) => {
                    tracing::debug!(error = %e, trigger = %trigger.describe(), "Chi-square failed");
                    continue;
                }
            };

            if !self.gate.passes(test.p_value, triggered.hits) {
                continue;
            }

            let (effect_size, required_sample_size) = cohort_effect(
                triggered.hits,
                triggered.trials,
                baseline.hits,
                baseline.trials,
                &self.gate,
            );

            let candidate = PatternCandidate {
                rule: PatternRule {
                    pattern_type,
                    trigger: trigger.clone(),
                    outcome: ClassRef::from(outcome),
                    window: TimeWindow::Hours {
                        min_hours,
                        max_hours,
                    },
                    statistics: RuleStatistics {
                        p_value: test.p_value,
                        statistic: Some(test.statistic),
                        occurrences: triggered.hits,
                        trials: triggered.trials,
                        trigger_rate: triggered.rate(),
                        baseline_rate: baseline.rate(),
                        rate_interval: stats::confidence_interval(
                            triggered.hits,
                            triggered.trials,
                            1.96,
                        ),
                        effect_size,
                        required_sample_size,
                        outcome_severity: timeline.mean_severity(&outcome.key),
                        period_days: timeline.span_days(),
                        ..Default::default()
                    },
                },
                positive: triggered.hits,
                negative: triggered.trials - triggered.hits,
            };

            if best
                .as_ref()
                .map_or(true, |b| candidate.p_value() < b.p_value())
            {
                best = Some(candidate);
            }
        }

        best
    }
}

impl PatternDetector for TemporalCorrelationDetector {
    fn name(&self) -> &'static str {
        "temporal_correlation"
    }

    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate> {
        let mut candidates = Vec::new();

        for trigger in timeline.trigger_classes() {
            let trigger_times = timeline.times(&trigger.key);
            if (trigger_times.len() as u64) < self.gate.min_occurrences {
                continue;
            }
            let spec = TriggerSpec::Event {
                class: ClassRef::from(trigger),
            };

            for outcome in timeline.outcome_classes() {
                if outcome.key == trigger.key {
                    continue;
                }
                if let Some(candidate) = self.evaluate_trigger(
                    timeline,
                    PatternType::TemporalCorrelation,
                    &spec,
                    trigger_times,
                    outcome,
                    until,
                ) {
                    tracing::debug!(
                        trigger = %trigger.label,
                        outcome = %outcome.label,
                        p_value = candidate.p_value(),
                        occurrences = candidate.occurrences(),
                        "Temporal correlation found"
                    );
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }
}

/// Count start points followed by an outcome in `[start + from, start + to]`
///
/// Windows still open at `until` are not counted.
fn count_windows(
    starts: &[DateTime<Utc>],
    outcomes: &[DateTime<Utc>],
    from: Duration,
    to: Duration,
    until: DateTime<Utc>,
) -> WindowCounts {
    let mut counts = WindowCounts::default();
    for start in starts {
        if *start + to > until {
            continue;
        }
        counts.trials += 1;
        if any_between(outcomes, *start + from, *start + to) {
            counts.hits += 1;
        }
    }
    counts
}

/// Median local wall-clock time of the given instants
fn median_time_of_day(timeline: &EventTimeline, times: &[DateTime<Utc>]) -> Option<NaiveTime> {
    let tz = timeline.tz();
    let mut seconds: Vec<u32> = times
        .iter()
        .map(|t| t.with_timezone(&tz).time().num_seconds_from_midnight())
        .collect();
    seconds.sort_unstable();
    let median = *seconds.get(seconds.len() / 2)?;
    NaiveTime::from_num_seconds_from_midnight_opt(median, 0)
}
