//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::detectors::{
    CyclicalConfig, MultiFactorConfig, SemanticConfig, SequenceConfig, TemporalConfig,
};
use crate::events::GroupingConfig;
use crate::mining::RetryPolicy;
use crate::patterns::ConfidenceConfig;
use crate::stats::{SignificanceGate, DEFAULT_ALPHA, DEFAULT_MIN_OCCURRENCES};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub mining: MiningConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chronicle-patterns").join("patterns.db"))
        .unwrap_or_else(|| PathBuf::from("./chronicle-patterns.db"))
        .to_string_lossy()
        .to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Pattern mining configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    /// Days of history analysed per run
    #[serde(default = "default_analysis_days")]
    pub analysis_days: u32,

    /// Maximum p-value for a candidate to be accepted
    #[serde(default = "default_significance_level")]
    pub significance_level: f64,

    /// Minimum supporting occurrences for a candidate
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u64,

    #[serde(default)]
    pub grouping: GroupingConfig,

    #[serde(default)]
    pub temporal: TemporalConfig,

    #[serde(default)]
    pub multi_factor: MultiFactorConfig,

    #[serde(default)]
    pub sequence: SequenceConfig,

    #[serde(default)]
    pub cyclical: CyclicalConfig,

    #[serde(default)]
    pub semantic: SemanticConfig,

    #[serde(default)]
    pub confidence: ConfidenceConfig,
}

fn default_analysis_days() -> u32 {
    90
}

fn default_significance_level() -> f64 {
    DEFAULT_ALPHA
}

fn default_min_occurrences() -> u64 {
    DEFAULT_MIN_OCCURRENCES
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            analysis_days: default_analysis_days(),
            significance_level: default_significance_level(),
            min_occurrences: default_min_occurrences(),
            grouping: GroupingConfig::default(),
            temporal: TemporalConfig::default(),
            multi_factor: MultiFactorConfig::default(),
            sequence: SequenceConfig::default(),
            cyclical: CyclicalConfig::default(),
            semantic: SemanticConfig::default(),
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl MiningConfig {
    /// Acceptance rule shared by all detectors
    pub fn significance_gate(&self) -> SignificanceGate {
        SignificanceGate::new(self.significance_level, self.min_occurrences)
    }
}

/// Nightly scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Local hour (0-23) at which each user's job runs
    #[serde(default = "default_run_hour")]
    pub run_hour: u32,

    /// How often the scheduler looks for due users
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Upper bound on jobs running at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Extra attempts for a failed user job
    #[serde(default = "default_job_retries")]
    pub job_retries: u32,

    /// Backoff for storage reads and writes
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_run_hour() -> u32 {
    3
}

fn default_tick_interval() -> u64 {
    60
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_job_retries() -> u32 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            run_hour: default_run_hour(),
            tick_interval_secs: default_tick_interval(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_retries: default_job_retries(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chronicle-patterns").join("config.toml")),
            Some(PathBuf::from("/etc/chronicle-patterns/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Reject values the miner cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let alpha = self.mining.significance_level;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "mining.significance_level must be in (0, 1), got {}",
                alpha
            )));
        }
        if self.mining.analysis_days == 0 {
            return Err(ConfigError::Invalid(
                "mining.analysis_days must be at least 1".to_string(),
            ));
        }
        let threshold = self.mining.confidence.archive_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "mining.confidence.archive_threshold must be in [0, 1], got {}",
                threshold
            )));
        }
        if self.scheduler.run_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "scheduler.run_hour must be 0-23, got {}",
                self.scheduler.run_hour
            )));
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("CHRONICLE_DB_PATH") {
            self.storage.database_path = path;
        }

        if let Some(days) = lookup("CHRONICLE_ANALYSIS_DAYS").and_then(|v| v.parse().ok()) {
            self.mining.analysis_days = days;
        }

        if let Some(hour) = lookup("CHRONICLE_RUN_HOUR").and_then(|v| v.parse().ok()) {
            self.scheduler.run_hour = hour;
        }
        if let Some(jobs) = lookup("CHRONICLE_MAX_CONCURRENT_JOBS").and_then(|v| v.parse().ok()) {
            self.scheduler.max_concurrent_jobs = jobs;
        }

        if let Some(level) = lookup("CHRONICLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHRONICLE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chronicle Pattern Mining Configuration
#
# Environment variables override these settings:
# - CHRONICLE_DB_PATH
# - CHRONICLE_ANALYSIS_DAYS
# - CHRONICLE_RUN_HOUR
# - CHRONICLE_MAX_CONCURRENT_JOBS
# - CHRONICLE_LOG_LEVEL
# - CHRONICLE_LOG_FORMAT

[storage]
# SQLite database holding users, events and patterns
database_path = "~/.local/share/chronicle-patterns/patterns.db"

[mining]
# Days of history analysed per nightly run
analysis_days = 90

# A candidate needs p < significance_level ...
significance_level = 0.05

# ... and at least this many supporting occurrences
min_occurrences = 10

[mining.grouping]
# Relative width of numeric tolerance bands (0.10 = 10%)
numeric_tolerance = 0.10

# Characteristics for event types not listed below
fallback_keys = ["name"]

[mining.grouping.identity_keys]
# Characteristics that identify "the same" event, per event type
meal = ["food"]
symptom = ["name"]
mood = ["mood"]
sleep = ["quality"]
exercise = ["activity"]
reminder_completion = ["reminder"]

[mining.temporal]
# Hour windows tested after each trigger, [min, max]
windows = [[0.0, 2.0], [2.0, 4.0], [4.0, 8.0], [8.0, 24.0]]

[mining.multi_factor]
# Largest factor combination tested on the same day
max_factors = 4

# Most frequent trigger classes considered as factors
max_factor_candidates = 12

[mining.sequence]
# Chain length range (events)
min_length = 3
max_length = 4

# Longest gap between consecutive chain steps (hours)
max_gap_hours = 6.0

[mining.cyclical]
# Share of weekdays/days-of-month the event must appear on
min_recurrence_rate = 0.75

# Minimum number of cycles observed
min_cycles = 6

# Also look for day-of-month recurrences
include_day_of_month = false

[mining.semantic]
# Cosine similarity needed to merge two trigger labels
similarity_threshold = 0.85

[mining.confidence]
# Beta prior strength for confidence updates
prior_strength = 2.0

# Patterns below this confidence are archived
archive_threshold = 0.5

# Evidence history entries kept per pattern
history_size = 20

[scheduler]
# Run nightly jobs from the daemon
enabled = true

# Local hour at which each user's job runs
run_hour = 3

# How often to look for due users (seconds)
tick_interval_secs = 60

# Upper bound on jobs running at once
max_concurrent_jobs = 4

# Extra attempts for a failed user job
job_retries = 1

[scheduler.retry]
# Attempts for storage reads and writes
max_attempts = 3

# First backoff delay (ms), multiplied after every failure
base_delay_ms = 200
multiplier = 2.0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/chronicle-patterns/patterns.log"
"#
    .to_string()
}
