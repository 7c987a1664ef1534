//! Discovered Patterns
//!
//! Everything that happens to a pattern after a detector proposes it:
//!
//! - **types**: rules, evidence, candidates and the stored pattern record
//! - **impact**: the 0-100 impact score
//! - **insight**: human-readable, actionable insight text
//! - **confidence**: Bayesian evidence updates and archival

pub mod confidence;
pub mod impact;
pub mod insight;
pub mod types;

pub use confidence::{bayesian_confidence, ConfidenceConfig, ConfidenceMaintainer, MaintenanceUpdate};
pub use impact::ImpactScorer;
pub use insight::{generate_actionable_insight, render_insight};
pub use types::{
    weekday_name, CalendarSlot, ClassRef, DiscoveredPattern, Evidence, EvidenceEntry,
    EvidenceKind, PatternCandidate, PatternRule, PatternType, RuleStatistics, TimeWindow,
    TriggerSpec,
};
