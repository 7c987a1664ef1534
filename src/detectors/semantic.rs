//! Semantic Clustering
//!
//! Merges trigger classes whose labels mean nearly the same thing
//! ("pasta", "rice") into one cluster and tests the cluster with the
//! temporal machinery. Similarity comes from a pluggable
//! [`TriggerEmbedder`]; without one the detector finds nothing and the
//! other detectors are unaffected.

use crate::detectors::{merged_times, PatternDetector, TemporalCorrelationDetector};
use crate::events::{EventTimeline, EventType};
use crate::patterns::{ClassRef, PatternCandidate, PatternType, TriggerSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Turns a trigger label into an embedding vector
pub trait TriggerEmbedder: Send + Sync {
    /// `None` when the label cannot be embedded
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Semantic clustering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    /// Minimum cosine similarity for two labels to merge
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

fn default_similarity_threshold() -> f64 {
    0.85
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Tests clusters of semantically similar triggers
pub struct SemanticClusterDetector {
    config: SemanticConfig,
    temporal: TemporalCorrelationDetector,
    embedder: Option<Arc<dyn TriggerEmbedder>>,
}

impl SemanticClusterDetector {
    pub fn new(
        config: SemanticConfig,
        temporal: TemporalCorrelationDetector,
        embedder: Option<Arc<dyn TriggerEmbedder>>,
    ) -> Self {
        Self {
            config,
            temporal,
            embedder,
        }
    }

    /// Clusters of two or more trigger classes, per event type
    fn clusters(&self, timeline: &EventTimeline, embedder: &dyn TriggerEmbedder) -> Vec<Vec<ClassRef>> {
        let mut by_type: BTreeMap<EventType, Vec<(ClassRef, Vec<f32>)>> = BTreeMap::new();
        for class in timeline.trigger_classes() {
            if let Some(vector) = embedder.embed(&class.label) {
                by_type
                    .entry(class.event_type.clone())
                    .or_default()
                    .push((ClassRef::from(class), vector));
            }
        }

        let mut clusters = Vec::new();
        for members in by_type.values() {
            let mut parent: Vec<usize> = (0..members.len()).collect();
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    let similar = cosine_similarity(&members[i].1, &members[j].1)
                        .is_some_and(|s| s >= self.config.similarity_threshold);
                    if similar {
                        let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                        parent[a.max(b)] = a.min(b);
                    }
                }
            }

            let mut groups: BTreeMap<usize, Vec<ClassRef>> = BTreeMap::new();
            for i in 0..members.len() {
                let root = find(&mut parent, i);
                groups.entry(root).or_default().push(members[i].0.clone());
            }
            clusters.extend(groups.into_values().filter(|g| g.len() >= 2).map(|mut group| {
                group.sort_by(|a, b| a.group_key.cmp(&b.group_key));
                group
            }));
        }
        clusters
    }
}

impl PatternDetector for SemanticClusterDetector {
    fn name(&self) -> &'static str {
        "semantic_cluster"
    }

    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        for members in self.clusters(timeline, embedder) {
            let mut labels: Vec<&str> = members.iter().map(|m| m.label.as_str()).collect();
            labels.sort_unstable();
            let name = labels.join("/");

            let refs: Vec<&ClassRef> = members.iter().collect();
            let times = merged_times(timeline, &refs);
            let spec = TriggerSpec::Cluster {
                name: name.clone(),
                members: members.clone(),
            };

            for outcome in timeline.outcome_classes() {
                if members.iter().any(|m| m.group_key == outcome.key) {
                    continue;
                }
                if let Some(candidate) = self.temporal.evaluate_trigger(
                    timeline,
                    PatternType::SemanticCluster,
                    &spec,
                    &times,
                    outcome,
                    until,
                ) {
                    tracing::debug!(
                        cluster = %name,
                        outcome = %outcome.label,
                        p_value = candidate.p_value(),
                        "Semantic cluster correlation found"
                    );
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    parent[i] = root;
    root
}

/// Cosine similarity; `None` for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}
