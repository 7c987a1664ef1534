//! # Chronicle Pattern Mining
//!
//! Unsupervised discovery of behavioral health patterns from a personal,
//! append-only event log (meals, symptoms, sleep, mood, exercise).
//!
//! ## Features
//!
//! - **Statistical core**: chi-square, Pearson, Wilson intervals, Cohen's d, power analysis
//! - **Five detectors**: temporal correlation, multi-factor, sequence, cyclical, semantic clusters
//! - **Scoring**: 0-100 impact score and an actionable insight per pattern
//! - **Confidence maintenance**: Bayesian updates that archive patterns that stop holding
//! - **Nightly jobs**: one job per user at 03:00 local time on a bounded pool
//!
//! ## Modules
//!
//! - [`stats`]: hypothesis-testing primitives and the significance gate
//! - [`events`]: health events, grouping into classes, CSV import
//! - [`detectors`]: the pattern detection algorithms
//! - [`patterns`]: discovered patterns, impact, insights, confidence
//! - [`storage`]: persistence traits and the SQLite store
//! - [`mining`]: the per-user orchestrator and the nightly scheduler
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chronicle_patterns::config::MiningConfig;
//! use chronicle_patterns::mining::PatternMiner;
//! use chronicle_patterns::storage::{PatternStore, SqliteStore, UserDirectory, UserProfile};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteStore::open("./patterns.db")?);
//!     store.upsert_user(&UserProfile::new("user-1", "Europe/Berlin")).await?;
//!
//!     let miner = PatternMiner::with_store(MiningConfig::default(), store.clone());
//!     let summary = miner.run_pattern_mining("user-1").await;
//!     println!("{} new patterns", summary.patterns_created);
//!
//!     for pattern in store.get_active_patterns("user-1").await? {
//!         println!("{}", pattern.actionable_insight);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod detectors;
pub mod events;
pub mod logging;
pub mod mining;
pub mod patterns;
pub mod stats;
pub mod storage;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, LoggingConfig, MiningConfig, SchedulerConfig};

pub use events::{CharacteristicValue, EventGrouper, EventTimeline, EventType, HealthEvent};

pub use detectors::{PatternDetector, TriggerEmbedder};

pub use patterns::{
    ConfidenceMaintainer, DiscoveredPattern, ImpactScorer, PatternCandidate, PatternRule,
    PatternType,
};

pub use storage::{
    EventSource, PatternStore, SqliteStore, StorageError, StorageResult, UpsertOutcome,
    UserDirectory, UserProfile,
};

pub use mining::{JobSummary, MiningError, NightlyScheduler, PatternMiner};

pub use stats::{SignificanceGate, StatsError};
