//! Nightly Pattern Mining
//!
//! - **orchestrator**: the per-user job (`PatternMiner::run_pattern_mining`)
//! - **scheduler**: runs due users at their local night on a bounded pool
//! - **retry**: bounded exponential backoff for storage I/O

pub mod orchestrator;
pub mod retry;
pub mod scheduler;

pub use orchestrator::{JobSummary, MiningError, PatternMiner};
pub use retry::{retry_with_backoff, RetryPolicy, Retryable};
pub use scheduler::{is_due, scheduled_slot, JobState, NightlyScheduler};
