//! Pattern Detectors
//!
//! Each detector is a pure pass over an immutable [`EventTimeline`] that
//! returns candidates which already cleared the significance gate:
//!
//! - [`TemporalCorrelationDetector`]: trigger → outcome within an hour window
//! - [`MultiFactorDetector`]: 2-4 factors on the same day → outcome
//! - [`SequenceDetector`]: recurring ordered chains A → B → C
//! - [`CyclicalDetector`]: weekday / day-of-month recurrences
//! - [`SemanticClusterDetector`]: similar triggers merged (needs an embedder)
//!
//! Observations whose evaluation window is still open at `until` are left
//! out so that confidence maintenance can count them later, exactly once.

pub mod cyclical;
pub mod multi_factor;
pub mod semantic;
pub mod sequence;
pub mod temporal;

pub use cyclical::{CyclicalConfig, CyclicalDetector};
pub use multi_factor::{MultiFactorConfig, MultiFactorDetector};
pub use semantic::{SemanticClusterDetector, SemanticConfig, TriggerEmbedder};
pub use sequence::{SequenceConfig, SequenceDetector};
pub use temporal::{TemporalConfig, TemporalCorrelationDetector};

use crate::config::MiningConfig;
use crate::events::EventTimeline;
use crate::patterns::{ClassRef, PatternCandidate};
use crate::stats::{self, SignificanceGate};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// A pattern detection algorithm
pub trait PatternDetector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Find significant candidates among observations closed by `until`
    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate>;
}

/// Build the detector set described by the mining configuration
///
/// Without an embedder the semantic detector reports nothing.
pub fn default_detectors(
    config: &MiningConfig,
    embedder: Option<Arc<dyn TriggerEmbedder>>,
) -> Vec<Arc<dyn PatternDetector>> {
    let gate = config.significance_gate();
    let detectors: Vec<Arc<dyn PatternDetector>> = vec![
        Arc::new(TemporalCorrelationDetector::new(config.temporal.clone(), gate)),
        Arc::new(MultiFactorDetector::new(config.multi_factor.clone(), gate)),
        Arc::new(SequenceDetector::new(config.sequence.clone(), gate)),
        Arc::new(CyclicalDetector::new(config.cyclical.clone(), gate)),
        Arc::new(SemanticClusterDetector::new(
            config.semantic.clone(),
            TemporalCorrelationDetector::new(config.temporal.clone(), gate),
            embedder,
        )),
    ];
    detectors
}

/// Keep the lowest p-value candidate per trigger/outcome pair
///
/// Candidates of the same pair that differ only in their window collapse
/// into one. The result is ordered by pair key.
pub fn dedupe_by_lowest_p(candidates: Vec<PatternCandidate>) -> Vec<PatternCandidate> {
    let mut best: HashMap<String, PatternCandidate> = HashMap::new();
    for candidate in candidates {
        let key = candidate.rule.pair_key();
        match best.get(&key) {
            Some(existing) if existing.p_value() <= candidate.p_value() => {}
            _ => {
                best.insert(key, candidate);
            }
        }
    }

    let mut kept: Vec<(String, PatternCandidate)> = best.into_iter().collect();
    kept.sort_by(|a, b| a.0.cmp(&b.0));
    kept.into_iter().map(|(_, c)| c).collect()
}

/// Fractional hours as a duration (millisecond precision)
pub(crate) fn hours(value: f64) -> Duration {
    Duration::milliseconds((value * 3_600_000.0).round() as i64)
}

/// Whether any of the sorted `times` falls in `[from, to]`
pub(crate) fn any_between(times: &[DateTime<Utc>], from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    let start = times.partition_point(|t| *t < from);
    times.get(start).is_some_and(|t| *t <= to)
}

/// Sorted `times` that fall in `(after, to]`
pub(crate) fn times_after(
    times: &[DateTime<Utc>],
    after: DateTime<Utc>,
    to: DateTime<Utc>,
) -> &[DateTime<Utc>] {
    let start = times.partition_point(|t| *t <= after);
    let end = times.partition_point(|t| *t <= to);
    &times[start..end.max(start)]
}

/// Union of the occurrence times of several classes, sorted
pub(crate) fn merged_times(timeline: &EventTimeline, classes: &[&ClassRef]) -> Vec<DateTime<Utc>> {
    let mut times: Vec<DateTime<Utc>> = classes
        .iter()
        .flat_map(|c| timeline.times(&c.group_key).iter().copied())
        .collect();
    times.sort();
    times.dedup();
    times
}

/// Cohen's d between two hit/miss cohorts and the per-group sample size
/// needed to detect it
pub(crate) fn cohort_effect(
    hits_a: u64,
    total_a: u64,
    hits_b: u64,
    total_b: u64,
    gate: &SignificanceGate,
) -> (Option<f64>, Option<u64>) {
    let indicators = |hits: u64, total: u64| -> Vec<f64> {
        (0..total).map(|i| if i < hits { 1.0 } else { 0.0 }).collect()
    };

    let effect = stats::cohens_d(&indicators(hits_a, total_a), &indicators(hits_b, total_b)).ok();
    let sample_size = effect.and_then(|d| stats::minimum_sample_size(d, 0.8, gate.alpha).ok());
    (effect, sample_size)
}
