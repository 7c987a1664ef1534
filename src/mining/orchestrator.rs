//! Pattern Mining Orchestrator
//!
//! One job per user:
//!
//! ```text
//! fetch events → detectors (parallel) → dedupe → score → upsert new
//!              → confidence maintenance of existing patterns → summary
//! ```
//!
//! A trigger/outcome pair keeps one active window across runs: a new
//! window replaces the stored one only with a lower p-value, or after the
//! stored one is archived.
//!
//! A failed job is logged with its user ID and retried; it never affects
//! other users. All writes go through the idempotent `upsert_pattern`, so a
//! retried or repeated run cannot duplicate patterns.

use crate::config::MiningConfig;
use crate::detectors::{default_detectors, dedupe_by_lowest_p, PatternDetector, TriggerEmbedder};
use crate::events::{EventGrouper, EventTimeline};
use crate::mining::retry::{retry_with_backoff, RetryPolicy};
use crate::patterns::{
    bayesian_confidence, ConfidenceMaintainer, DiscoveredPattern, MaintenanceUpdate,
    PatternCandidate,
};
use crate::storage::{
    EventSource, PatternStore, StorageError, UpsertOutcome, UserDirectory,
};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Errors that abort one user's job
#[derive(Error, Debug)]
pub enum MiningError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job for user {user_id} failed: {message}")]
    Job { user_id: String, message: String },

    #[error("Invalid timezone '{timezone}': {reason}")]
    Timezone { timezone: String, reason: String },
}

/// Outcome of one user's mining job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub user_id: String,
    pub patterns_created: usize,
    pub patterns_updated: usize,
    pub patterns_archived: usize,
    pub duration_ms: u64,
    /// One entry per failed attempt
    pub errors: Vec<String>,
    /// The last attempt ran to the end
    pub completed: bool,
}

impl JobSummary {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            patterns_created: 0,
            patterns_updated: 0,
            patterns_archived: 0,
            duration_ms: 0,
            errors: Vec::new(),
            completed: false,
        }
    }
}

/// Runs the nightly pipeline for a single user
pub struct PatternMiner {
    config: MiningConfig,
    events: Arc<dyn EventSource>,
    patterns: Arc<dyn PatternStore>,
    users: Arc<dyn UserDirectory>,
    detectors: Vec<Arc<dyn PatternDetector>>,
    grouper: EventGrouper,
    maintainer: ConfidenceMaintainer,
    retry: RetryPolicy,
    job_retries: u32,
}

impl PatternMiner {
    pub fn new(
        config: MiningConfig,
        events: Arc<dyn EventSource>,
        patterns: Arc<dyn PatternStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        let grouper = EventGrouper::new(config.grouping.clone());
        let maintainer = ConfidenceMaintainer::new(config.confidence.clone(), grouper.clone());
        let detectors = default_detectors(&config, None);

        Self {
            config,
            events,
            patterns,
            users,
            detectors,
            grouper,
            maintainer,
            retry: RetryPolicy::default(),
            job_retries: 1,
        }
    }

    /// Miner over a single store that provides events, patterns and users
    pub fn with_store<S>(config: MiningConfig, store: Arc<S>) -> Self
    where
        S: EventSource + PatternStore + UserDirectory + 'static,
    {
        Self::new(config, store.clone(), store.clone(), store)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Extra attempts after a failed job
    pub fn with_job_retries(mut self, job_retries: u32) -> Self {
        self.job_retries = job_retries;
        self
    }

    /// Enable semantic clustering with the given embedder
    pub fn with_embedder(mut self, embedder: Arc<dyn TriggerEmbedder>) -> Self {
        self.detectors = default_detectors(&self.config, Some(embedder));
        self
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Mine one user's patterns as of now
    pub async fn run_pattern_mining(&self, user_id: &str) -> JobSummary {
        self.run_pattern_mining_at(user_id, Utc::now()).await
    }

    /// Mine one user's patterns as of `now`
    ///
    /// Never fails: errors end up in the summary.
    pub async fn run_pattern_mining_at(&self, user_id: &str, now: DateTime<Utc>) -> JobSummary {
        let started = Instant::now();
        let mut summary = JobSummary::new(user_id);

        let attempts = self.job_retries + 1;
        for attempt in 1..=attempts {
            match self.run_job(user_id, now, &mut summary).await {
                Ok(()) => {
                    summary.completed = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        attempt,
                        attempts,
                        error = %e,
                        "Pattern mining job failed"
                    );
                    summary.errors.push(format!("attempt {}: {}", attempt, e));
                }
            }
        }

        let recorded = retry_with_backoff(&self.retry, "record_run", || {
            self.users.record_run(user_id, now)
        })
        .await;
        if let Err(e) = recorded {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record run");
            summary.errors.push(format!("record run: {}", e));
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            user_id = %user_id,
            created = summary.patterns_created,
            updated = summary.patterns_updated,
            archived = summary.patterns_archived,
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms,
            "Pattern mining job finished"
        );
        summary
    }

    async fn run_job(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        summary: &mut JobSummary,
    ) -> Result<(), MiningError> {
        let profile = retry_with_backoff(&self.retry, "get_user", || self.users.get_user(user_id))
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", user_id)))?;
        let tz = profile
            .timezone
            .parse::<Tz>()
            .map_err(|e| MiningError::Timezone {
                timezone: profile.timezone.clone(),
                reason: e.to_string(),
            })?;

        let since = now - Duration::days(i64::from(self.config.analysis_days));
        let events = retry_with_backoff(&self.retry, "events_between", || {
            self.events.events_between(user_id, since, now)
        })
        .await?;
        let existing = retry_with_backoff(&self.retry, "get_active_patterns", || {
            self.patterns.get_active_patterns(user_id)
        })
        .await?;

        tracing::debug!(
            user_id = %user_id,
            events = events.len(),
            existing = existing.len(),
            "Mining user events"
        );

        let timeline = Arc::new(EventTimeline::build(&events, &self.grouper, tz));

        // Maintenance is computed before discovery so that a rule retired
        // tonight does not block a stronger window for the same pair.
        let maintained: Vec<(DiscoveredPattern, MaintenanceUpdate)> = existing
            .iter()
            .filter_map(|p| self.maintainer.maintain(p, &timeline, now))
            .collect();
        let retiring: HashSet<&str> = maintained
            .iter()
            .filter(|(_, update)| update.archived)
            .map(|(p, _)| p.id.as_str())
            .collect();

        let known: HashSet<&str> = existing.iter().map(|p| p.rule_hash.as_str()).collect();
        let rivals: HashMap<String, &DiscoveredPattern> = existing
            .iter()
            .filter(|p| !retiring.contains(p.id.as_str()))
            .map(|p| (p.pattern_rule.pair_key(), p))
            .collect();
        let mut superseded: HashSet<String> = HashSet::new();

        for candidate in self.detect(user_id, timeline.clone(), now).await? {
            if known.contains(candidate.rule.rule_hash().as_str()) {
                continue;
            }

            let rival = rivals.get(&candidate.rule.pair_key()).copied();
            if let Some(stored) = rival {
                if candidate.p_value() >= stored.pattern_rule.statistics.p_value {
                    tracing::debug!(
                        user_id = %user_id,
                        pattern_id = %stored.id,
                        window = %candidate.rule.window,
                        p_value = candidate.p_value(),
                        "Stored window is stronger, candidate skipped"
                    );
                    continue;
                }
            }

            let Some(pattern) = self.materialize(user_id, candidate, now) else {
                continue;
            };
            if let UpsertOutcome::Created(_) = self.upsert(&pattern).await? {
                summary.patterns_created += 1;
                tracing::info!(
                    user_id = %user_id,
                    pattern_id = %pattern.id,
                    pattern_type = %pattern.pattern_type,
                    confidence = pattern.confidence,
                    impact = pattern.impact_score,
                    "Pattern discovered"
                );

                if let Some(stored) = rival {
                    let mut retired = maintained
                        .iter()
                        .find(|(p, _)| p.id == stored.id)
                        .map_or_else(|| stored.clone(), |(p, _)| p.clone());
                    retired.archived = true;
                    retired.updated_at = now;
                    if let UpsertOutcome::Updated(_) = self.upsert(&retired).await? {
                        summary.patterns_updated += 1;
                        summary.patterns_archived += 1;
                    }
                    superseded.insert(stored.id.clone());
                    tracing::info!(
                        user_id = %user_id,
                        pattern_id = %stored.id,
                        replaced_by = %pattern.id,
                        "Pattern superseded by a stronger window"
                    );
                }
            }
        }

        for (updated, update) in maintained {
            if superseded.contains(&updated.id) {
                continue;
            }
            if let UpsertOutcome::Updated(_) = self.upsert(&updated).await? {
                summary.patterns_updated += 1;
                if update.archived {
                    summary.patterns_archived += 1;
                }
                tracing::debug!(
                    user_id = %user_id,
                    pattern_id = %updated.id,
                    observations = update.observations,
                    previous = update.previous_confidence,
                    confidence = update.confidence,
                    "Pattern confidence updated"
                );
            }
        }

        Ok(())
    }

    /// Run every detector on its own blocking thread over the shared snapshot
    async fn detect(
        &self,
        user_id: &str,
        timeline: Arc<EventTimeline>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PatternCandidate>, MiningError> {
        if timeline.is_empty() {
            return Ok(Vec::new());
        }

        let tasks = self.detectors.iter().cloned().map(|detector| {
            let timeline = timeline.clone();
            tokio::task::spawn_blocking(move || {
                let found = detector.detect(&timeline, now);
                (detector.name(), found)
            })
        });

        let mut candidates = Vec::new();
        for result in join_all(tasks).await {
            match result {
                Ok((name, found)) => {
                    tracing::debug!(
                        user_id = %user_id,
                        detector = name,
                        candidates = found.len(),
                        "Detector finished"
                    );
                    candidates.extend(found);
                }
                Err(e) => {
                    return Err(MiningError::Job {
                        user_id: user_id.to_string(),
                        message: format!("detector task failed: {}", e),
                    });
                }
            }
        }

        Ok(dedupe_by_lowest_p(candidates))
    }

    /// Score a candidate; `None` when it would be archived on arrival
    fn materialize(
        &self,
        user_id: &str,
        candidate: PatternCandidate,
        now: DateTime<Utc>,
    ) -> Option<DiscoveredPattern> {
        let confidence = self.maintainer.config();
        let initial = bayesian_confidence(
            candidate.positive,
            candidate.negative,
            confidence.prior_strength,
        );
        if initial < confidence.archive_threshold {
            tracing::debug!(
                user_id = %user_id,
                trigger = %candidate.rule.trigger.describe(),
                outcome = %candidate.rule.outcome.label,
                initial,
                "Candidate below archive threshold, skipped"
            );
            return None;
        }
        Some(DiscoveredPattern::from_candidate(
            user_id,
            candidate,
            now,
            confidence.prior_strength,
        ))
    }

    async fn upsert(&self, pattern: &DiscoveredPattern) -> Result<UpsertOutcome, MiningError> {
        let outcome = retry_with_backoff(&self.retry, "upsert_pattern", || {
            self.patterns.upsert_pattern(pattern)
        })
        .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::*;
    use crate::events::HealthEvent;
    use crate::patterns::{PatternType, TimeWindow};
    use crate::storage::{SqliteStore, StorageResult, UserProfile};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn store_with_user(user_id: &str, timezone: &str) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert_user(&UserProfile::new(user_id, timezone))
            .await
            .unwrap();
        store
    }

    fn miner(store: Arc<SqliteStore>) -> PatternMiner {
        PatternMiner::with_store(MiningConfig::default(), store).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn test_pasta_scenario_end_to_end() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();

        let summary = miner(store.clone()).run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(summary.completed);
        assert!(summary.errors.is_empty());
        assert!(summary.patterns_created >= 1);

        let active = store.get_active_patterns("u1").await.unwrap();
        assert_eq!(active.len(), summary.patterns_created);

        let temporal: Vec<_> = active
            .iter()
            .filter(|p| p.pattern_type == PatternType::TemporalCorrelation)
            .collect();
        assert_eq!(temporal.len(), 1);
        let pattern = temporal[0];
        assert_eq!(pattern.occurrences, 18);
        assert!(pattern.pattern_rule.statistics.p_value < 0.05);
        assert!(pattern.actionable_insight.contains("pasta"));
        assert!(pattern.actionable_insight.contains("tiredness"));
        assert!(pattern.confidence > 0.5 && pattern.confidence < 1.0);

        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.last_run_at, Some(at(90, 0, 0)));
    }

    #[tokio::test]
    async fn test_user_without_events() {
        let store = store_with_user("empty", "Europe/Berlin").await;

        let summary = miner(store).run_pattern_mining_at("empty", at(90, 0, 0)).await;
        assert!(summary.completed);
        assert!(summary.errors.is_empty());
        assert_eq!(summary.patterns_created, 0);
        assert_eq!(summary.patterns_updated, 0);
        assert_eq!(summary.patterns_archived, 0);
    }

    #[tokio::test]
    async fn test_rerun_without_new_events_is_idempotent() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        let miner = miner(store.clone());

        let first = miner.run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(first.patterns_created >= 1);
        let before = store.get_active_patterns("u1").await.unwrap();

        let second = miner.run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(second.completed);
        assert_eq!(second.patterns_created, 0);
        assert_eq!(second.patterns_updated, 0);

        let after = store.get_active_patterns("u1").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_failing_pattern_is_archived() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        let miner = miner(store.clone());
        miner.run_pattern_mining_at("u1", at(90, 0, 0)).await;

        // Twenty more pasta lunches, never followed by tiredness
        let lunches: Vec<HealthEvent> = (91..111).map(|day| meal("u1", "pasta", at(day, 12, 0))).collect();
        store.append_events(&lunches).await.unwrap();

        let summary = miner.run_pattern_mining_at("u1", at(111, 0, 0)).await;
        assert!(summary.completed);
        assert!(summary.patterns_archived >= 1);
        assert!(summary.patterns_updated >= summary.patterns_archived);

        let active = store.get_active_patterns("u1").await.unwrap();
        assert!(!active.iter().any(|p| p.pattern_type == PatternType::TemporalCorrelation
            && p.pattern_rule.outcome.label == "tiredness"));
    }

    fn active_tiredness_windows(active: &[DiscoveredPattern]) -> Vec<TimeWindow> {
        active
            .iter()
            .filter(|p| p.pattern_type == PatternType::TemporalCorrelation
                && p.pattern_rule.outcome.label == "tiredness")
            .map(|p| p.pattern_rule.window)
            .collect()
    }

    /// The pasta pattern mined at day 90, moved to a 4-8 h window
    async fn stored_rival(p_value: f64) -> DiscoveredPattern {
        let scratch = store_with_user("u1", "UTC").await;
        scratch
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        miner(scratch.clone()).run_pattern_mining_at("u1", at(90, 0, 0)).await;

        let mut rival = scratch
            .get_active_patterns("u1")
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.pattern_type == PatternType::TemporalCorrelation)
            .unwrap();
        rival.pattern_rule.window = TimeWindow::Hours { min_hours: 4.0, max_hours: 8.0 };
        rival.pattern_rule.statistics.p_value = p_value;
        rival.rule_hash = rival.pattern_rule.rule_hash();
        rival.id = "stored-window".to_string();
        rival
    }

    #[tokio::test]
    async fn test_shifted_window_replaces_stale_pattern() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        let miner = miner(store.clone());
        miner.run_pattern_mining_at("u1", at(90, 0, 0)).await;

        // Forty more lunches, now with tiredness one hour later
        let mut events = Vec::new();
        for day in 91..131 {
            events.push(meal("u1", "pasta", at(day, 12, 0)));
            events.push(symptom("u1", "tiredness", at(day, 13, 0)).with("severity", 6.0));
        }
        store.append_events(&events).await.unwrap();

        let summary = miner.run_pattern_mining_at("u1", at(131, 0, 0)).await;
        assert!(summary.completed);
        assert!(summary.patterns_archived >= 1);

        let active = store.get_active_patterns("u1").await.unwrap();
        assert_eq!(
            active_tiredness_windows(&active),
            vec![TimeWindow::Hours { min_hours: 0.0, max_hours: 2.0 }]
        );
    }

    #[tokio::test]
    async fn test_weaker_window_does_not_duplicate_pair() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        let rival = stored_rival(1e-40).await;
        store.upsert_pattern(&rival).await.unwrap();

        let summary = miner(store.clone()).run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(summary.completed);

        let active = store.get_active_patterns("u1").await.unwrap();
        assert_eq!(active_tiredness_windows(&active), vec![rival.pattern_rule.window]);
        assert!(active.iter().any(|p| p.id == "stored-window"));
    }

    #[tokio::test]
    async fn test_stronger_window_supersedes_stored_pair() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();
        store.upsert_pattern(&stored_rival(0.04).await).await.unwrap();

        let summary = miner(store.clone()).run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(summary.completed);
        assert_eq!(summary.patterns_archived, 1);

        let active = store.get_active_patterns("u1").await.unwrap();
        assert_eq!(
            active_tiredness_windows(&active),
            vec![TimeWindow::Hours { min_hours: 2.0, max_hours: 4.0 }]
        );
        assert!(!active.iter().any(|p| p.id == "stored-window"));
    }

    /// Event source that fails a fixed number of times before delegating
    struct FlakyEvents {
        inner: Arc<SqliteStore>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EventSource for FlakyEvents {
        async fn events_between(
            &self,
            user_id: &str,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> StorageResult<Vec<HealthEvent>> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Serialization("corrupt row".to_string()));
            }
            self.inner.events_between(user_id, since, until).await
        }

        async fn append_events(&self, events: &[HealthEvent]) -> StorageResult<usize> {
            self.inner.append_events(events).await
        }
    }

    fn flaky_miner(store: Arc<SqliteStore>, failures: u32) -> PatternMiner {
        let events = Arc::new(FlakyEvents {
            inner: store.clone(),
            failures_left: AtomicU32::new(failures),
        });
        PatternMiner::new(MiningConfig::default(), events, store.clone(), store)
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_once() {
        let store = store_with_user("u1", "UTC").await;
        store
            .append_events(&pasta_tiredness_events("u1"))
            .await
            .unwrap();

        let summary = flaky_miner(store.clone(), 1)
            .run_pattern_mining_at("u1", at(90, 0, 0))
            .await;
        assert!(summary.completed);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.patterns_created >= 1);
    }

    #[tokio::test]
    async fn test_job_abandoned_after_retry() {
        let store = store_with_user("u1", "UTC").await;

        let summary = flaky_miner(store.clone(), 5)
            .run_pattern_mining_at("u1", at(90, 0, 0))
            .await;
        assert!(!summary.completed);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.patterns_created, 0);

        // The night is still recorded so the scheduler moves on
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.last_run_at, Some(at(90, 0, 0)));
    }

    #[tokio::test]
    async fn test_invalid_timezone_is_reported() {
        let store = store_with_user("u1", "Mars/Olympus_Mons").await;

        let summary = miner(store).run_pattern_mining_at("u1", at(90, 0, 0)).await;
        assert!(!summary.completed);
        assert!(summary.errors.iter().all(|e| e.contains("Mars/Olympus_Mons")));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let summary = miner(store).run_pattern_mining_at("ghost", at(90, 0, 0)).await;
        assert!(!summary.completed);
        // Two failed attempts plus the failed run bookkeeping
        assert_eq!(summary.errors.len(), 3);
    }

    #[test]
    fn test_default_detector_set() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let names = miner(store).detector_names();
        assert_eq!(
            names,
            vec!["temporal_correlation", "multi_factor", "sequence", "cyclical", "semantic_cluster"]
        );
    }
}
