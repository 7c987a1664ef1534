//! Health Events
//!
//! The append-only event stream the miner consumes:
//!
//! - **types**: `HealthEvent`, `EventType`, `CharacteristicValue`
//! - **grouping**: Event Grouper (normalization, tolerance bands, group keys)
//!   and the classified `EventTimeline` shared by all detectors
//! - **csv_import**: bulk import of events from CSV files

pub mod csv_import;
pub mod grouping;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use csv_import::{CsvImportResult, EventCsvImporter, ImportError};
pub use grouping::{
    bucket_number, normalize_text, stable_hash, EventClass, EventGrouper, EventTimeline,
    GroupKey, GroupingConfig, TimelineEntry,
};
pub use types::{CharacteristicValue, Characteristics, EventType, HealthEvent};
