//! CSV Import
//!
//! Bulk import of health events from CSV files.
//!
//! Expected layout: a header row with `occurred_at` and `event_type`
//! columns, optional `id` and `source` columns, and any number of extra
//! columns that become characteristics. Cell types are inferred
//! (number, bool, text); empty cells are skipped.
//!
//! ```text
//! occurred_at,event_type,food,name,severity
//! 2024-01-15 12:00:00,meal,pasta,,
//! 2024-01-15 15:10:00,symptom,,tiredness,6
//! ```

use crate::events::types::{CharacteristicValue, EventType, HealthEvent};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::path::Path;
use thiserror::Error;

/// Errors raised while importing events
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Result of a CSV import operation
#[derive(Debug)]
pub struct CsvImportResult {
    pub events: Vec<HealthEvent>,
    pub rows_processed: usize,
    pub rows_failed: usize,
    pub errors: Vec<String>,
}

/// CSV importer for one user's events
pub struct EventCsvImporter {
    user_id: String,
    /// Timezone used for timestamps without an offset
    timezone: Tz,
    timestamp_column: String,
    type_column: String,
    id_column: String,
    source_column: String,
    default_source: String,
}

impl EventCsvImporter {
    /// Create an importer with default column names
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            timezone: Tz::UTC,
            timestamp_column: "occurred_at".to_string(),
            type_column: "event_type".to_string(),
            id_column: "id".to_string(),
            source_column: "source".to_string(),
            default_source: "import".to_string(),
        }
    }

    /// Interpret naive timestamps in this timezone
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Set the timestamp column name
    pub fn with_timestamp_column(mut self, column: &str) -> Self {
        self.timestamp_column = column.to_string();
        self
    }

    /// Set the event type column name
    pub fn with_type_column(mut self, column: &str) -> Self {
        self.type_column = column.to_string();
        self
    }

    /// Import events from a CSV file
    pub fn import(&self, path: &Path) -> Result<CsvImportResult, ImportError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        self.import_from(reader)
    }

    /// Import events from a CSV string (useful for testing)
    pub fn import_str(&self, csv_data: &str) -> Result<CsvImportResult, ImportError> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(csv_data.as_bytes());
        self.import_from(reader)
    }

    fn import_from<R: std::io::Read>(
        &self,
        mut reader: csv::Reader<R>,
    ) -> Result<CsvImportResult, ImportError> {
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        let column = |name: &str| headers.iter().position(|h| h == name);
        let timestamp_idx = column(&self.timestamp_column).ok_or_else(|| {
            ImportError::Parse(format!("missing '{}' column", self.timestamp_column))
        })?;
        let type_idx = column(&self.type_column)
            .ok_or_else(|| ImportError::Parse(format!("missing '{}' column", self.type_column)))?;
        let id_idx = column(&self.id_column);
        let source_idx = column(&self.source_column);

        let mut events = Vec::new();
        let mut rows_processed = 0;
        let mut rows_failed = 0;
        let mut errors = Vec::new();

        for (line_num, result) in reader.records().enumerate() {
            let actual_line = line_num + 2;

            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    errors.push(format!("Line {}: {}", actual_line, e));
                    rows_failed += 1;
                    continue;
                }
            };

            let occurred_at = match record
                .get(timestamp_idx)
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                Some(raw) => match self.parse_timestamp(raw) {
                    Ok(ts) => ts,
                    Err(e) => {
                        errors.push(format!("Line {}: {}", actual_line, e));
                        rows_failed += 1;
                        continue;
                    }
                },
                None => {
                    errors.push(format!("Line {}: missing timestamp", actual_line));
                    rows_failed += 1;
                    continue;
                }
            };

            let event_type = match record.get(type_idx).map(str::trim).filter(|s| !s.is_empty()) {
                Some(raw) => EventType::from(raw),
                None => {
                    errors.push(format!("Line {}: missing event type", actual_line));
                    rows_failed += 1;
                    continue;
                }
            };

            let mut event = HealthEvent::new(self.user_id.clone(), event_type, occurred_at)
                .source(self.default_source.clone());

            for (idx, value) in record.iter().enumerate() {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                if Some(idx) == id_idx {
                    event.id = value.to_string();
                } else if Some(idx) == source_idx {
                    event.source = value.to_string();
                } else if idx != timestamp_idx && idx != type_idx {
                    if let Some(name) = headers.get(idx) {
                        event
                            .characteristics
                            .insert(name.clone(), CharacteristicValue::infer(value));
                    }
                }
            }

            events.push(event);
            rows_processed += 1;
        }

        // Truncate errors if too many
        if errors.len() > 100 {
            let total = errors.len();
            errors.truncate(100);
            errors.push(format!("... and {} more errors", total - 100));
        }

        events.sort_by_key(|e| e.occurred_at);

        Ok(CsvImportResult {
            events,
            rows_processed,
            rows_failed,
            errors,
        })
    }

    /// Parse a timestamp; naive values are read in the importer's timezone
    fn parse_timestamp(&self, raw: &str) -> Result<DateTime<Utc>, ImportError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }

        if let Ok(millis) = raw.parse::<i64>() {
            if let Some(dt) = DateTime::from_timestamp_millis(millis) {
                return Ok(dt);
            }
        }

        let formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
        for fmt in formats {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return self.localize(naive, raw);
            }
        }

        for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
                if let Some(noon) = date.and_hms_opt(12, 0, 0) {
                    return self.localize(noon, raw);
                }
            }
        }

        Err(ImportError::Parse(format!("Could not parse timestamp: {}", raw)))
    }

    fn localize(&self, naive: NaiveDateTime, raw: &str) -> Result<DateTime<Utc>, ImportError> {
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ImportError::Parse(format!("Nonexistent local time: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_csv_import() {
        let csv_data = "occurred_at,event_type,food,name,severity
2024-01-15 12:00:00,meal,Pasta,,
2024-01-15 15:10:00,symptom,,tiredness,6
2024-01-16T08:00:00Z,mood,,,";

        let result = EventCsvImporter::new("u1").import_str(csv_data).unwrap();

        assert_eq!(result.rows_processed, 3);
        assert_eq!(result.rows_failed, 0);
        assert_eq!(result.events.len(), 3);

        let meal = &result.events[0];
        assert_eq!(meal.event_type, EventType::Meal);
        assert_eq!(
            meal.characteristic("food"),
            Some(&CharacteristicValue::Text("Pasta".to_string()))
        );
        assert_eq!(meal.source, "import");

        let symptom = &result.events[1];
        assert_eq!(symptom.number("severity"), Some(6.0));
        assert!(symptom.characteristic("food").is_none());
    }

    #[test]
    fn test_naive_timestamps_use_timezone() {
        let csv_data = "occurred_at,event_type,food
2024-01-15 12:00:00,meal,pasta";

        let result = EventCsvImporter::new("u1")
            .with_timezone(chrono_tz::America::New_York)
            .import_str(csv_data)
            .unwrap();

        // Noon in New York (EST) is 17:00 UTC
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 17, 0, 0).unwrap();
        assert_eq!(result.events[0].occurred_at, expected);
    }

    #[test]
    fn test_bad_rows_are_reported() {
        let csv_data = "occurred_at,event_type,id,food
not-a-date,meal,e1,pasta
2024-01-15 12:00:00,,e2,pasta
2024-01-15 12:00:00,meal,e3,pasta";

        let result = EventCsvImporter::new("u1").import_str(csv_data).unwrap();
        assert_eq!(result.rows_processed, 1);
        assert_eq!(result.rows_failed, 2);
        assert_eq!(result.events[0].id, "e3");
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_missing_required_column() {
        let err = EventCsvImporter::new("u1")
            .import_str("timestamp,food\n2024-01-15,pasta")
            .unwrap_err();
        assert!(matches!(err, ImportError::Parse(_)));
    }
}
