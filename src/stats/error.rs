//! Statistical core error types

use thiserror::Error;

/// Errors raised by the hypothesis-testing primitives
///
/// Both variants are recoverable at the detector level: the offending
/// candidate is skipped and mining continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    /// Too few samples for the requested test
    #[error("Insufficient data: need at least {needed} samples, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// Degenerate input (NaN, zero variance, malformed table)
    #[error("Statistical computation failed: {0}")]
    Computation(String),
}

/// Result type alias for statistical operations
pub type StatsResult<T> = Result<T, StatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StatsError::InsufficientData { needed: 3, got: 2 };
        assert_eq!(
            err.to_string(),
            "Insufficient data: need at least 3 samples, got 2"
        );

        let err = StatsError::Computation("zero variance".to_string());
        assert_eq!(
            err.to_string(),
            "Statistical computation failed: zero variance"
        );
    }
}
