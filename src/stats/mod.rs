//! Statistical Core
//!
//! Pure, side-effect-free hypothesis-testing primitives shared by every
//! pattern detector:
//!
//! - **chi_square_test**: categorical association on an r×c contingency table
//! - **pearson_correlation**: linear association with a t-test p-value
//! - **confidence_interval**: Wilson score interval for a proportion
//! - **cohens_d**: standardized mean difference (pooled SD)
//! - **minimum_sample_size**: two-sample power analysis
//! - **binomial_upper_tail**: exact recurrence-vs-chance test
//!
//! The [`SignificanceGate`] bundles the acceptance rule every detector uses:
//! `p < 0.05` and at least 10 occurrences.

mod error;

pub use error::{StatsError, StatsResult};

use serde::{Deserialize, Serialize};
use statrs::distribution::{
    Binomial, ChiSquared, ContinuousCDF, DiscreteCDF, Normal, StudentsT,
};

/// Pseudo-count added to every cell when a table contains a zero
pub const CHI_SQUARE_SMOOTHING: f64 = 0.5;

/// Default significance level
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Default minimum number of supporting occurrences
pub const DEFAULT_MIN_OCCURRENCES: u64 = 10;

/// Outcome of a test statistic computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub statistic: f64,
    /// Always within [0, 1]
    pub p_value: f64,
}

/// Pearson correlation with its significance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    /// Correlation coefficient (-1 to 1)
    pub r: f64,
    pub p_value: f64,
    pub sample_size: usize,
}

/// Acceptance rule shared by all detectors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignificanceGate {
    /// Candidates need `p_value < alpha`
    pub alpha: f64,
    /// Candidates need at least this many supporting occurrences
    pub min_occurrences: u64,
}

impl Default for SignificanceGate {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            min_occurrences: DEFAULT_MIN_OCCURRENCES,
        }
    }
}

impl SignificanceGate {
    pub fn new(alpha: f64, min_occurrences: u64) -> Self {
        Self {
            alpha,
            min_occurrences,
        }
    }

    /// Check whether a candidate clears the gate
    pub fn passes(&self, p_value: f64, occurrences: u64) -> bool {
        p_value.is_finite() && p_value < self.alpha && occurrences >= self.min_occurrences
    }

    /// Check only the p-value half of the gate
    pub fn is_significant(&self, p_value: f64) -> bool {
        p_value.is_finite() && p_value < self.alpha
    }
}

/// Pearson chi-square test of independence
///
/// Accepts any r×c table with r, c >= 2. If any observed cell is zero,
/// [`CHI_SQUARE_SMOOTHING`] is added to every cell first so that no
/// expected count can be zero.
pub fn chi_square_test<R: AsRef<[f64]>>(table: &[R]) -> StatsResult<TestResult> {
    let rows = table.len();
    if rows < 2 {
        return Err(StatsError::Computation(format!(
            "contingency table needs at least 2 rows, got {}",
            rows
        )));
    }

    let cols = table[0].as_ref().len();
    if cols < 2 {
        return Err(StatsError::Computation(format!(
            "contingency table needs at least 2 columns, got {}",
            cols
        )));
    }

    let mut cells = Vec::with_capacity(rows);
    for row in table {
        let row = row.as_ref();
        if row.len() != cols {
            return Err(StatsError::Computation(
                "contingency table rows have different lengths".to_string(),
            ));
        }
        if row.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(StatsError::Computation(
                "contingency table cells must be finite and non-negative".to_string(),
            ));
        }
        cells.push(row.to_vec());
    }

    if cells.iter().flatten().any(|v| *v == 0.0) {
        for value in cells.iter_mut().flatten() {
            *value += CHI_SQUARE_SMOOTHING;
        }
    }

    let row_totals: Vec<f64> = cells.iter().map(|r| r.iter().sum()).collect();
    let col_totals: Vec<f64> = (0..cols)
        .map(|j| cells.iter().map(|r| r[j]).sum())
        .collect();
    let grand_total: f64 = row_totals.iter().sum();

    let mut statistic = 0.0;
    for (i, row) in cells.iter().enumerate() {
        for (j, observed) in row.iter().enumerate() {
            let expected = row_totals[i] * col_totals[j] / grand_total;
            statistic += (observed - expected).powi(2) / expected;
        }
    }

    if !statistic.is_finite() {
        return Err(StatsError::Computation(
            "chi-square statistic is not finite".to_string(),
        ));
    }

    let df = ((rows - 1) * (cols - 1)) as f64;
    let p_value = chi_square_sf(statistic, df)?;

    Ok(TestResult { statistic, p_value })
}

/// Pearson correlation coefficient with a two-sided t-test p-value
///
/// Requires at least 3 paired samples.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> StatsResult<CorrelationResult> {
    if x.len() != y.len() {
        return Err(StatsError::Computation(format!(
            "series lengths differ: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    if x.len() < 3 {
        return Err(StatsError::InsufficientData {
            needed: 3,
            got: x.len(),
        });
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(StatsError::Computation(
            "series contain non-finite values".to_string(),
        ));
    }

    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return Err(StatsError::Computation("zero variance".to_string()));
    }

    let r = (cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0);
    let df = n - 2.0;

    let p_value = if (1.0 - r.abs()) < 1e-12 {
        0.0
    } else {
        let t = r * (df / (1.0 - r * r)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, df)
            .map_err(|e| StatsError::Computation(format!("t distribution: {}", e)))?;
        (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0)
    };

    Ok(CorrelationResult {
        r,
        p_value,
        sample_size: x.len(),
    })
}

/// Wilson score interval for a binomial proportion
///
/// `total == 0` yields `(0.0, 0.0)`. `successes` above `total` are
/// clamped to `total`.
pub fn confidence_interval(successes: u64, total: u64, z: f64) -> (f64, f64) {
    if total == 0 {
        return (0.0, 0.0);
    }

    let n = total as f64;
    let p = successes.min(total) as f64 / n;
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denominator;

    let lower = (center - margin).clamp(0.0, 1.0).min(p);
    let upper = (center + margin).clamp(0.0, 1.0).max(p);

    (lower, upper)
}

/// Cohen's d effect size using the pooled standard deviation
pub fn cohens_d(group_a: &[f64], group_b: &[f64]) -> StatsResult<f64> {
    let smaller = group_a.len().min(group_b.len());
    if smaller < 2 {
        return Err(StatsError::InsufficientData {
            needed: 2,
            got: smaller,
        });
    }

    let (mean_a, var_a) = mean_and_variance(group_a);
    let (mean_b, var_b) = mean_and_variance(group_b);

    let n_a = group_a.len() as f64;
    let n_b = group_b.len() as f64;
    let pooled = (((n_a - 1.0) * var_a + (n_b - 1.0) * var_b) / (n_a + n_b - 2.0)).sqrt();

    if !pooled.is_finite() || pooled == 0.0 {
        return Err(StatsError::Computation(
            "pooled standard deviation is zero".to_string(),
        ));
    }

    Ok((mean_a - mean_b) / pooled)
}

/// Per-group sample size needed to detect `effect_size` with a two-sided
/// two-sample test: `n = 2 * ((z(1 - alpha/2) + z(power)) / d)^2`
pub fn minimum_sample_size(effect_size: f64, power: f64, alpha: f64) -> StatsResult<u64> {
    if !effect_size.is_finite() || effect_size == 0.0 {
        return Err(StatsError::Computation(format!(
            "effect size must be finite and non-zero, got {}",
            effect_size
        )));
    }

    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(StatsError::Computation(format!(
            "alpha must be within (0, 1), got {}",
            alpha
        )));
    }
    if !(power > 0.0 && power < 1.0) {
        return Err(StatsError::Computation(format!(
            "power must be within (0, 1), got {}",
            power
        )));
    }

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| StatsError::Computation(format!("normal distribution: {}", e)))?;
    let z_alpha = normal.inverse_cdf(1.0 - alpha / 2.0);
    let z_power = normal.inverse_cdf(power);

    let n = 2.0 * ((z_alpha + z_power) / effect_size.abs()).powi(2);
    Ok(n.ceil() as u64)
}

/// Exact one-sided binomial test: P(X >= successes) for X ~ Bin(trials, p0)
pub fn binomial_upper_tail(successes: u64, trials: u64, p0: f64) -> StatsResult<f64> {
    if !(0.0..=1.0).contains(&p0) {
        return Err(StatsError::Computation(format!(
            "base probability must be within [0, 1], got {}",
            p0
        )));
    }
    if successes > trials {
        return Err(StatsError::Computation(format!(
            "successes ({}) exceed trials ({})",
            successes, trials
        )));
    }
    if successes == 0 {
        return Ok(1.0);
    }
    if p0 == 0.0 {
        return Ok(0.0);
    }
    if p0 == 1.0 {
        return Ok(1.0);
    }

    let dist = Binomial::new(p0, trials)
        .map_err(|e| StatsError::Computation(format!("binomial distribution: {}", e)))?;
    // sf(k - 1) = P(X > k - 1) = P(X >= k)
    Ok(dist.sf(successes - 1).clamp(0.0, 1.0))
}

/// Survival function of the chi-square distribution, P(X >= statistic)
pub fn chi_square_sf(statistic: f64, degrees_of_freedom: f64) -> StatsResult<f64> {
    if statistic <= 0.0 {
        return Ok(1.0);
    }
    let dist = ChiSquared::new(degrees_of_freedom)
        .map_err(|e| StatsError::Computation(format!("chi-square distribution: {}", e)))?;
    Ok(dist.sf(statistic).clamp(0.0, 1.0))
}

fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chi_square_known_table() {
        // Row totals 30/70, column totals 40/60 -> chi2 = 0.7937, p = 0.373
        let result = chi_square_test(&[[10.0, 20.0], [30.0, 40.0]]).unwrap();
        assert!((result.statistic - 0.793_650_8).abs() < 1e-4);
        assert!((result.p_value - 0.373).abs() < 0.01);
    }

    #[test]
    fn test_chi_square_zero_cells_never_fail() {
        let tables: Vec<[[f64; 2]; 2]> = vec![
            [[0.0, 0.0], [0.0, 0.0]],
            [[18.0, 2.0], [0.0, 70.0]],
            [[0.0, 5.0], [0.0, 5.0]],
            [[7.0, 0.0], [0.0, 0.0]],
        ];

        for table in tables {
            let result = chi_square_test(&table).unwrap();
            assert!(
                (0.0..=1.0).contains(&result.p_value),
                "p out of range for {:?}",
                table
            );
        }
    }

    #[test]
    fn test_chi_square_strong_association() {
        let result = chi_square_test(&[[18.0, 2.0], [0.0, 70.0]]).unwrap();
        assert!(result.p_value < 1e-6);
    }

    #[test]
    fn test_chi_square_rejects_malformed_tables() {
        assert!(matches!(
            chi_square_test(&[[1.0, 2.0]]),
            Err(StatsError::Computation(_))
        ));
        assert!(matches!(
            chi_square_test(&[vec![1.0, 2.0], vec![3.0]]),
            Err(StatsError::Computation(_))
        ));
        assert!(matches!(
            chi_square_test(&[[1.0, f64::NAN], [3.0, 4.0]]),
            Err(StatsError::Computation(_))
        ));
    }

    #[test]
    fn test_chi_square_rxc() {
        let result = chi_square_test(&[[10.0, 10.0, 10.0], [10.0, 10.0, 10.0]]).unwrap();
        assert!(result.statistic.abs() < 1e-12);
        assert!((result.p_value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_significance_boundary_is_consistent() {
        // df=1: 3.841 is the critical value for alpha = 0.05
        let gate = SignificanceGate::default();
        let just_below = chi_square_sf(3.80, 1.0).unwrap();
        let just_above = chi_square_sf(3.90, 1.0).unwrap();
        assert!(!gate.is_significant(just_below));
        assert!(gate.is_significant(just_above));
    }

    #[test]
    fn test_chi_square_sf_critical_values() {
        // df=1, 3.841 is the 5% critical value
        assert!((chi_square_sf(3.841_458_820_694_124, 1.0).unwrap() - 0.05).abs() < 1e-6);
        // df=2, 5.991 is the 5% critical value
        assert!((chi_square_sf(5.991_464_547_107_979, 2.0).unwrap() - 0.05).abs() < 1e-6);
        assert_eq!(chi_square_sf(0.0, 1.0).unwrap(), 1.0);
        assert!(chi_square_sf(1.0, 0.0).is_err());
    }

    #[test]
    fn test_gate_requires_both_conditions() {
        let gate = SignificanceGate::default();
        assert!(gate.passes(0.01, 10));
        assert!(!gate.passes(0.01, 9));
        assert!(!gate.passes(0.05, 50));
        assert!(!gate.passes(f64::NAN, 50));
    }

    #[test]
    fn test_pearson_perfect_positive() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let y = vec![2.0, 4.0, 6.0, 8.0, 10.0];
        let result = pearson_correlation(&x, &y).unwrap();
        assert!((result.r - 1.0).abs() < 1e-9);
        assert_eq!(result.p_value, 0.0);
    }

    #[test]
    fn test_pearson_perfect_negative() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let y = vec![10.0, 8.0, 6.0, 4.0, 2.0];
        let result = pearson_correlation(&x, &y).unwrap();
        assert!((result.r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_weak_correlation_not_significant() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let result = pearson_correlation(&x, &y).unwrap();
        assert!(result.r.abs() < 0.5);
        assert!(result.p_value > 0.05 && result.p_value <= 1.0);
    }

    #[test]
    fn test_pearson_known_p_value() {
        // r = 0.8 with n = 5: t = 2.309 on 3 df, two-sided p = 0.104
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let y = vec![2.0, 1.0, 4.0, 3.0, 5.0];
        let result = pearson_correlation(&x, &y).unwrap();
        assert!((result.r - 0.8).abs() < 1e-12);
        assert!((result.p_value - 0.104).abs() < 1e-3, "got {}", result.p_value);
    }

    #[test]
    fn test_pearson_requires_three_samples() {
        let err = pearson_correlation(&[1.0, 2.0], &[2.0, 3.0]).unwrap_err();
        assert_eq!(err, StatsError::InsufficientData { needed: 3, got: 2 });
    }

    #[test]
    fn test_pearson_zero_variance() {
        let err = pearson_correlation(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, StatsError::Computation(_)));
    }

    #[test]
    fn test_confidence_interval_contains_rate() {
        for total in 1..=40u64 {
            for successes in 0..=total {
                let (lower, upper) = confidence_interval(successes, total, 1.96);
                let rate = successes as f64 / total as f64;
                assert!(lower <= rate && rate <= upper, "{}/{}", successes, total);
                assert!((0.0..=1.0).contains(&lower) && (0.0..=1.0).contains(&upper));
            }
        }
    }

    #[test]
    fn test_confidence_interval_empty() {
        assert_eq!(confidence_interval(0, 0, 1.96), (0.0, 0.0));
    }

    #[test]
    fn test_cohens_d() {
        let a = vec![2.0, 4.0, 6.0];
        let b = vec![1.0, 3.0, 5.0];
        // Pooled SD = 2, mean difference = 1
        let d = cohens_d(&a, &b).unwrap();
        assert!((d - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cohens_d_degenerate() {
        assert!(matches!(
            cohens_d(&[1.0], &[1.0, 2.0]),
            Err(StatsError::InsufficientData { .. })
        ));
        assert!(matches!(
            cohens_d(&[1.0, 1.0], &[1.0, 1.0]),
            Err(StatsError::Computation(_))
        ));
    }

    #[test]
    fn test_minimum_sample_size() {
        // Medium effect, 80% power, alpha 0.05 -> ~63 per group (normal approximation)
        assert_eq!(minimum_sample_size(0.5, 0.8, 0.05).unwrap(), 63);
        // Larger effects need fewer samples
        assert!(minimum_sample_size(0.8, 0.8, 0.05).unwrap() < 63);
        assert!(minimum_sample_size(0.0, 0.8, 0.05).is_err());
        assert!(minimum_sample_size(0.5, 1.5, 0.05).is_err());
        assert!(minimum_sample_size(0.5, 0.8, 0.0).is_err());
    }

    #[test]
    fn test_binomial_upper_tail() {
        // 8 of 8 at p0 = 0.5 -> 1/256
        let p = binomial_upper_tail(8, 8, 0.5).unwrap();
        assert!((p - 1.0 / 256.0).abs() < 1e-9);

        // P(X >= 1) for Bin(3, 0.5) = 7/8
        let p = binomial_upper_tail(1, 3, 0.5).unwrap();
        assert!((p - 0.875).abs() < 1e-9);

        assert_eq!(binomial_upper_tail(0, 5, 0.3).unwrap(), 1.0);
        assert!(binomial_upper_tail(6, 5, 0.3).is_err());
    }
}
