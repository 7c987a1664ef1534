//! Pattern Persistence
//!
//! The miner talks to storage through three narrow traits:
//!
//! - **EventSource**: ordered, deduplicated health events per user
//! - **PatternStore**: discovered patterns, unique per `(user_id, rule_hash)`
//! - **UserDirectory**: users, their timezones and last nightly run
//!
//! [`SqliteStore`] implements all three on a single SQLite database.
//!
//! # Example
//!
//! ```rust,no_run
//! use chronicle_patterns::storage::{PatternStore, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::open("./chronicle-patterns.db")?;
//!     for pattern in store.get_active_patterns("user-1").await? {
//!         println!("{:.0} {}", pattern.impact_score, pattern.actionable_insight);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteStore;

use crate::events::HealthEvent;
use crate::patterns::DiscoveredPattern;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user known to the nightly scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// IANA timezone name, e.g. "Europe/Berlin"
    pub timezone: String,
    pub active: bool,
    /// When the last nightly job for this user finished
    pub last_run_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            timezone: timezone.into(),
            active: true,
            last_run_at: None,
        }
    }
}

/// What `upsert_pattern` did with the row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was inserted
    Created(String),
    /// The existing row changed
    Updated(String),
    /// Nothing was written (identical, stale or archived row)
    Unchanged(String),
}

impl UpsertOutcome {
    /// ID of the stored row
    pub fn pattern_id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) | UpsertOutcome::Unchanged(id) => id,
        }
    }
}

/// Read/append access to the health event log
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events of one user with `since <= occurred_at <= until`, oldest first
    async fn events_between(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StorageResult<Vec<HealthEvent>>;

    /// Append events, ignoring IDs already present; returns how many were new
    async fn append_events(&self, events: &[HealthEvent]) -> StorageResult<usize>;
}

/// Persistence of discovered patterns
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Atomically insert or merge a pattern on its `(user_id, rule_hash)` key
    ///
    /// Archived rows are never revived.
    async fn upsert_pattern(&self, pattern: &DiscoveredPattern) -> StorageResult<UpsertOutcome>;

    /// Non-archived patterns of a user, highest impact first
    async fn get_active_patterns(&self, user_id: &str) -> StorageResult<Vec<DiscoveredPattern>>;

    /// Any pattern by ID, archived or not
    async fn get_pattern(&self, pattern_id: &str) -> StorageResult<Option<DiscoveredPattern>>;

    async fn archive_pattern(&self, pattern_id: &str) -> StorageResult<()>;
}

/// Users and their nightly run bookkeeping
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn upsert_user(&self, profile: &UserProfile) -> StorageResult<()>;

    async fn get_user(&self, user_id: &str) -> StorageResult<Option<UserProfile>>;

    async fn list_active_users(&self) -> StorageResult<Vec<UserProfile>>;

    /// Remember that a nightly job for `user_id` finished at `at`
    async fn record_run(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_outcome_id() {
        assert_eq!(UpsertOutcome::Created("a".to_string()).pattern_id(), "a");
        assert_eq!(UpsertOutcome::Unchanged("b".to_string()).pattern_id(), "b");
    }

    #[test]
    fn test_new_profile_is_active() {
        let profile = UserProfile::new("u1", "UTC");
        assert!(profile.active);
        assert!(profile.last_run_at.is_none());
    }
}
