//! SQLite-backed store
//!
//! One database holds users, the append-only event log and discovered
//! patterns. The connection sits behind a mutex and every call runs on
//! tokio's blocking pool as a short statement or a single transaction.
//!
//! Event timestamps are stored as UTC milliseconds for range scans.
//! Pattern timestamps are RFC 3339 text and rule/evidence are JSON, so a
//! pattern reads back exactly as it was written.

use crate::events::{EventType, HealthEvent};
use crate::patterns::confidence::{bayesian_confidence, ConfidenceConfig};
use crate::patterns::{DiscoveredPattern, ImpactScorer, PatternType};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{EventSource, PatternStore, UpsertOutcome, UserDirectory, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id TEXT PRIMARY KEY,
    timezone TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    last_run_at INTEGER
);

CREATE TABLE IF NOT EXISTS health_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    occurred_at INTEGER NOT NULL,
    characteristics TEXT NOT NULL,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_health_events_user_time
    ON health_events(user_id, occurred_at);

CREATE TABLE IF NOT EXISTS discovered_patterns (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    rule_hash TEXT NOT NULL,
    pattern_rule TEXT NOT NULL,
    confidence REAL NOT NULL,
    occurrences INTEGER NOT NULL,
    impact_score REAL NOT NULL,
    evidence TEXT NOT NULL,
    actionable_insight TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    UNIQUE(user_id, rule_hash)
);

CREATE INDEX IF NOT EXISTS idx_discovered_patterns_active
    ON discovered_patterns(user_id, archived);
";

const PATTERN_COLUMNS: &str = "id, user_id, pattern_type, rule_hash, pattern_rule, confidence, \
     occurrences, impact_score, evidence, actionable_insight, created_at, updated_at, archived";

/// Users, events and patterns in one SQLite database
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    confidence: ConfidenceConfig,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %path.display(), "Pattern store opened");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            confidence: ConfidenceConfig::default(),
        }
    }

    /// Prior and archive threshold used when merging concurrent writes
    pub fn with_confidence(mut self, config: ConfidenceConfig) -> Self {
        self.confidence = config;
        self
    }

    /// Run `f` against the connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StorageError::Lock(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn try_upsert(
    conn: &mut Connection,
    pattern: &DiscoveredPattern,
    config: &ConfidenceConfig,
) -> StorageResult<UpsertOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing = tx
        .query_row(
            &format!(
                "SELECT {PATTERN_COLUMNS} FROM discovered_patterns \
                 WHERE user_id = ?1 AND rule_hash = ?2"
            ),
            params![pattern.user_id, pattern.rule_hash],
            PatternRow::from_row,
        )
        .optional()?
        .map(PatternRow::into_pattern)
        .transpose()?;

    let outcome = match existing {
        None => match insert_pattern(&tx, pattern) {
            Ok(()) => UpsertOutcome::Created(pattern.id.clone()),
            Err(StorageError::Database(e)) if is_unique_violation(&e) => {
                return Err(StorageError::PersistenceConflict {
                    user_id: pattern.user_id.clone(),
                    rule_hash: pattern.rule_hash.clone(),
                });
            }
            Err(e) => return Err(e),
        },
        Some(existing) => match merge_into(&existing, pattern, config) {
            Some(merged) => {
                update_pattern(&tx, &merged)?;
                UpsertOutcome::Updated(merged.id)
            }
            None => UpsertOutcome::Unchanged(existing.id),
        },
    };

    tx.commit()?;
    Ok(outcome)
}

/// Decide what to write when a row with the same rule already exists
///
/// Returns `None` when nothing should change: the row is archived, the
/// incoming copy is identical, or its evidence is older than what is stored.
/// A merge keeps the stored rule; confidence and impact follow the merged
/// evidence.
fn merge_into(
    existing: &DiscoveredPattern,
    incoming: &DiscoveredPattern,
    config: &ConfidenceConfig,
) -> Option<DiscoveredPattern> {
    if existing.archived {
        return None;
    }
    if incoming.evidence.last_evaluated_at < existing.evidence.last_evaluated_at {
        return None;
    }

    if existing.id == incoming.id {
        if existing == incoming {
            return None;
        }
        let mut updated = incoming.clone();
        updated.created_at = existing.created_at;
        return Some(updated);
    }

    // Another writer owns the row; fold newer evidence into it
    if incoming.evidence.last_evaluated_at == existing.evidence.last_evaluated_at {
        return None;
    }
    let mut merged = existing.clone();
    merged.evidence.merge(&incoming.evidence);
    merged.confidence = bayesian_confidence(
        merged.evidence.positive,
        merged.evidence.negative,
        config.prior_strength,
    );
    merged.impact_score = ImpactScorer::new().rescore(&merged);
    merged.archived = incoming.archived || merged.confidence < config.archive_threshold;
    merged.updated_at = existing.updated_at.max(incoming.updated_at);
    Some(merged)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn insert_pattern(conn: &Connection, pattern: &DiscoveredPattern) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO discovered_patterns ({PATTERN_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            pattern.id,
            pattern.user_id,
            pattern.pattern_type.as_str(),
            pattern.rule_hash,
            serde_json::to_string(&pattern.pattern_rule)?,
            pattern.confidence,
            pattern.occurrences as i64,
            pattern.impact_score,
            serde_json::to_string(&pattern.evidence)?,
            pattern.actionable_insight,
            format_time(pattern.created_at),
            format_time(pattern.updated_at),
            pattern.archived,
        ],
    )?;
    Ok(())
}

fn update_pattern(conn: &Connection, pattern: &DiscoveredPattern) -> StorageResult<()> {
    conn.execute(
        "UPDATE discovered_patterns
         SET pattern_rule = ?2, confidence = ?3, occurrences = ?4, impact_score = ?5,
             evidence = ?6, actionable_insight = ?7, updated_at = ?8, archived = ?9
         WHERE id = ?1",
        params![
            pattern.id,
            serde_json::to_string(&pattern.pattern_rule)?,
            pattern.confidence,
            pattern.occurrences as i64,
            pattern.impact_score,
            serde_json::to_string(&pattern.evidence)?,
            pattern.actionable_insight,
            format_time(pattern.updated_at),
            pattern.archived,
        ],
    )?;
    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp '{}': {}", raw, e)))
}

fn from_millis(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", ms)))
}

/// Raw column values, decoded outside the rusqlite row callback
struct PatternRow {
    id: String,
    user_id: String,
    pattern_type: String,
    rule_hash: String,
    pattern_rule: String,
    confidence: f64,
    occurrences: i64,
    impact_score: f64,
    evidence: String,
    actionable_insight: String,
    created_at: String,
    updated_at: String,
    archived: bool,
}

impl PatternRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            pattern_type: row.get(2)?,
            rule_hash: row.get(3)?,
            pattern_rule: row.get(4)?,
            confidence: row.get(5)?,
            occurrences: row.get(6)?,
            impact_score: row.get(7)?,
            evidence: row.get(8)?,
            actionable_insight: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            archived: row.get(12)?,
        })
    }

    fn into_pattern(self) -> StorageResult<DiscoveredPattern> {
        let pattern_type = PatternType::parse(&self.pattern_type).ok_or_else(|| {
            StorageError::Serialization(format!("unknown pattern type '{}'", self.pattern_type))
        })?;

        Ok(DiscoveredPattern {
            id: self.id,
            user_id: self.user_id,
            pattern_type,
            pattern_rule: serde_json::from_str(&self.pattern_rule)?,
            rule_hash: self.rule_hash,
            confidence: self.confidence,
            occurrences: self.occurrences.max(0) as u64,
            impact_score: self.impact_score,
            evidence: serde_json::from_str(&self.evidence)?,
            actionable_insight: self.actionable_insight,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            archived: self.archived,
        })
    }
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, bool, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_profile(raw: (String, String, bool, Option<i64>)) -> StorageResult<UserProfile> {
    let (user_id, timezone, active, last_run_at) = raw;
    Ok(UserProfile {
        user_id,
        timezone,
        active,
        last_run_at: last_run_at.map(from_millis).transpose()?,
    })
}

#[async_trait]
impl EventSource for SqliteStore {
    async fn events_between(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StorageResult<Vec<HealthEvent>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, event_type, occurred_at, characteristics, source
                 FROM health_events
                 WHERE user_id = ?1 AND occurred_at >= ?2 AND occurred_at <= ?3
                 ORDER BY occurred_at, id",
            )?;

            let rows = stmt
                .query_map(
                    params![user_id, since.timestamp_millis(), until.timestamp_millis()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, user_id, event_type, occurred_at, characteristics, source)| {
                    Ok(HealthEvent {
                        id,
                        user_id,
                        event_type: EventType::from(event_type),
                        occurred_at: from_millis(occurred_at)?,
                        characteristics: serde_json::from_str(&characteristics)?,
                        source,
                    })
                })
                .collect()
        })
        .await
    }

    async fn append_events(&self, events: &[HealthEvent]) -> StorageResult<usize> {
        let events = events.to_vec();
        let received = events.len();
        let inserted = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO health_events
                         (id, user_id, event_type, occurred_at, characteristics, source)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for event in &events {
                        inserted += stmt.execute(params![
                            event.id,
                            event.user_id,
                            event.event_type.as_str(),
                            event.occurred_at.timestamp_millis(),
                            serde_json::to_string(&event.characteristics)?,
                            event.source,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;

        tracing::debug!(received, inserted, "Events appended");
        Ok(inserted)
    }
}

#[async_trait]
impl PatternStore for SqliteStore {
    async fn upsert_pattern(&self, pattern: &DiscoveredPattern) -> StorageResult<UpsertOutcome> {
        let pattern = pattern.clone();
        let config = self.confidence.clone();
        self.blocking(move |conn| match try_upsert(conn, &pattern, &config) {
            Err(StorageError::PersistenceConflict { user_id, rule_hash }) => {
                tracing::warn!(
                    user_id = %user_id,
                    rule_hash = %rule_hash,
                    "Concurrent insert of the same rule, merging into existing row"
                );
                try_upsert(conn, &pattern, &config)
            }
            other => other,
        })
        .await
    }

    async fn get_active_patterns(&self, user_id: &str) -> StorageResult<Vec<DiscoveredPattern>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PATTERN_COLUMNS} FROM discovered_patterns
                 WHERE user_id = ?1 AND archived = 0
                 ORDER BY impact_score DESC, created_at, id"
            ))?;
            let rows = stmt
                .query_map(params![user_id], PatternRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter().map(PatternRow::into_pattern).collect()
        })
        .await
    }

    async fn get_pattern(&self, pattern_id: &str) -> StorageResult<Option<DiscoveredPattern>> {
        let pattern_id = pattern_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {PATTERN_COLUMNS} FROM discovered_patterns WHERE id = ?1"),
                params![pattern_id],
                PatternRow::from_row,
            )
            .optional()?
            .map(PatternRow::into_pattern)
            .transpose()
        })
        .await
    }

    async fn archive_pattern(&self, pattern_id: &str) -> StorageResult<()> {
        let pattern_id = pattern_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE discovered_patterns SET archived = 1, updated_at = ?2 WHERE id = ?1",
                params![pattern_id, format_time(Utc::now())],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("pattern {}", pattern_id)));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn upsert_user(&self, profile: &UserProfile) -> StorageResult<()> {
        let profile = profile.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, timezone, active, last_run_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     timezone = excluded.timezone,
                     active = excluded.active,
                     last_run_at = COALESCE(excluded.last_run_at, users.last_run_at)",
                params![
                    profile.user_id,
                    profile.timezone,
                    profile.active,
                    profile.last_run_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, user_id: &str) -> StorageResult<Option<UserProfile>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT user_id, timezone, active, last_run_at FROM users WHERE user_id = ?1",
                params![user_id],
                profile_from_row,
            )
            .optional()?
            .map(into_profile)
            .transpose()
        })
        .await
    }

    async fn list_active_users(&self) -> StorageResult<Vec<UserProfile>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, timezone, active, last_run_at FROM users
                 WHERE active = 1 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map([], profile_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter().map(into_profile).collect()
        })
        .await
    }

    async fn record_run(&self, user_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET last_run_at = ?2 WHERE user_id = ?1",
                params![user_id, at.timestamp_millis()],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("user {}", user_id)));
            }
            Ok(())
        })
        .await
    }
}
