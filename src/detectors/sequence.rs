//! Sequence Detector
//!
//! Mines recurring ordered chains of distinct event classes (A → B → C),
//! where each step follows the previous one within `max_gap_hours`.
//!
//! A chain's support is the number of start-class occurrences that go on to
//! complete it. Support is tested against chance with a one-sided binomial
//! test: if the later classes occurred independently at their average
//! hourly rates, each step would show up within the gap with probability
//! `1 - exp(-rate * gap)`.

use crate::detectors::{hours, times_after, PatternDetector};
use crate::events::{EventTimeline, GroupKey};
use crate::patterns::{
    ClassRef, PatternCandidate, PatternRule, PatternType, RuleStatistics, TimeWindow, TriggerSpec,
};
use crate::stats::{self, SignificanceGate};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sequence detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Shortest chain length (classes)
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Longest chain length (classes)
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Largest allowed gap between consecutive steps
    #[serde(default = "default_max_gap_hours")]
    pub max_gap_hours: f64,
}

fn default_min_length() -> usize {
    3
}

fn default_max_length() -> usize {
    4
}

fn default_max_gap_hours() -> f64 {
    6.0
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_length: default_max_length(),
            max_gap_hours: default_max_gap_hours(),
        }
    }
}

/// Finds recurring ordered chains of events
#[derive(Debug, Clone)]
pub struct SequenceDetector {
    config: SequenceConfig,
    gate: SignificanceGate,
}

/// How a chain played out across its start occurrences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ChainCounts {
    /// Start occurrences whose chain could be observed completely
    pub starts: u64,
    /// Starts that reached at least the second step
    pub prefixes: u64,
    /// Starts that completed the chain
    pub completions: u64,
}

impl SequenceDetector {
    pub fn new(config: SequenceConfig, gate: SignificanceGate) -> Self {
        Self { config, gate }
    }

    fn gap(&self) -> Duration {
        hours(self.config.max_gap_hours)
    }

    /// Every chain signature that occurs at least once
    fn signatures(&self, timeline: &EventTimeline) -> BTreeSet<Vec<GroupKey>> {
        let entries = timeline.entries();
        let mut found = BTreeSet::new();
        let mut path = Vec::with_capacity(self.config.max_length);

        for start in 0..entries.len() {
            path.push(entries[start].key.clone());
            self.walk(timeline, start, &mut path, &mut found);
            path.pop();
        }

        found
    }

    fn walk(
        &self,
        timeline: &EventTimeline,
        index: usize,
        path: &mut Vec<GroupKey>,
        found: &mut BTreeSet<Vec<GroupKey>>,
    ) {
        if path.len() >= self.config.min_length {
            found.insert(path.clone());
        }
        if path.len() >= self.config.max_length {
            return;
        }

        let entries = timeline.entries();
        let at = entries[index].occurred_at;
        let limit = at + self.gap();

        for next in (index + 1)..entries.len() {
            let entry = &entries[next];
            if entry.occurred_at > limit {
                break;
            }
            if entry.occurred_at == at || path.contains(&entry.key) {
                continue;
            }
            path.push(entry.key.clone());
            self.walk(timeline, next, path, found);
            path.pop();
        }
    }

    fn evaluate(
        &self,
        timeline: &EventTimeline,
        signature: &[GroupKey],
        until: DateTime<Utc>,
    ) -> Option<PatternCandidate> {
        let counts = count_chains(timeline, signature, self.gap(), until);
        if counts.completions < self.gate.min_occurrences || counts.starts == 0 {
            return None;
        }

        let span_hours = timeline.span_hours();
        let chance: f64 = signature[1..]
            .iter()
            .map(|key| {
                let rate = timeline.count(key) as f64 / span_hours;
                1.0 - (-rate * self.config.max_gap_hours).exp()
            })
            .product();

        let support_rate = counts.completions as f64 / counts.starts as f64;
        if support_rate <= chance {
            return None;
        }

        let p_value = match stats::binomial_upper_tail(counts.completions, counts.starts, chance) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "Binomial test failed");
                return None;
            }
        };
        if !self.gate.passes(p_value, counts.completions) {
            return None;
        }

        let classes: Vec<ClassRef> = signature
            .iter()
            .map(|key| timeline.class(key).map(ClassRef::from))
            .collect::<Option<_>>()?;
        let (steps, outcome) = classes.split_at(classes.len() - 1);

        Some(PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::Sequence,
                trigger: TriggerSpec::Chain {
                    steps: steps.to_vec(),
                },
                outcome: outcome[0].clone(),
                window: TimeWindow::Gap {
                    max_gap_hours: self.config.max_gap_hours,
                },
                statistics: RuleStatistics {
                    p_value,
                    occurrences: counts.completions,
                    trials: counts.starts,
                    trigger_rate: support_rate,
                    baseline_rate: chance,
                    rate_interval: stats::confidence_interval(
                        counts.completions,
                        counts.starts,
                        1.96,
                    ),
                    outcome_severity: signature
                        .last()
                        .and_then(|key| timeline.mean_severity(key)),
                    period_days: timeline.span_days(),
                    ..Default::default()
                },
            },
            positive: counts.completions,
            negative: counts.prefixes - counts.completions,
        })
    }
}

impl PatternDetector for SequenceDetector {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate> {
        if self.config.min_length < 2 || self.config.max_length < self.config.min_length {
            tracing::warn!(
                min_length = self.config.min_length,
                max_length = self.config.max_length,
                "Invalid sequence lengths, skipping"
            );
            return Vec::new();
        }

        let signatures = self.signatures(timeline);
        tracing::debug!(signatures = signatures.len(), "Sequence signatures collected");

        signatures
            .iter()
            .filter(|signature| {
                signature
                    .first()
                    .is_some_and(|start| timeline.count(start) as u64 >= self.gate.min_occurrences)
            })
            .filter_map(|signature| self.evaluate(timeline, signature, until))
            .collect()
    }
}

/// Count chain starts, two-step prefixes and completions
///
/// Starts whose chain could still be in progress at `until` are skipped.
pub(crate) fn count_chains(
    timeline: &EventTimeline,
    signature: &[GroupKey],
    gap: Duration,
    until: DateTime<Utc>,
) -> ChainCounts {
    let mut counts = ChainCounts::default();
    let Some((first, rest)) = signature.split_first() else {
        return counts;
    };
    let step_times: Vec<&[DateTime<Utc>]> = rest.iter().map(|key| timeline.times(key)).collect();
    let span = gap * rest.len() as i32;

    for start in timeline.times(first) {
        if *start + span > until {
            continue;
        }
        counts.starts += 1;
        let reached = chain_progress(&step_times, *start, gap);
        if reached >= 1 {
            counts.prefixes += 1;
        }
        if reached == rest.len() {
            counts.completions += 1;
        }
    }

    counts
}

/// How many of the remaining steps can be chained after `from`
///
/// Each step must occur strictly after the previous one and within `gap`.
pub(crate) fn chain_progress(steps: &[&[DateTime<Utc>]], from: DateTime<Utc>, gap: Duration) -> usize {
    let Some((first, rest)) = steps.split_first() else {
        return 0;
    };

    let mut best = 0;
    for next in times_after(first, from, from + gap) {
        let reached = 1 + chain_progress(rest, *next, gap);
        if reached == steps.len() {
            return reached;
        }
        best = best.max(reached);
    }
    best
}
