//! Final statistics over record metric vectors

use serde::{Deserialize, Serialize};

/// Statistic names in export order
pub const STAT_KEYS: &[&str] = &[
    "count", "min", "max", "mean", "std", "p1", "p5", "p10", "p25", "p50", "p75", "p90", "p95",
    "p99",
];

/// Summary statistics for one record metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    /// Number of values
    pub count: usize,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    /// 1st percentile
    pub p1: f64,
    /// 5th percentile
    pub p5: f64,
    /// 10th percentile
    pub p10: f64,
    /// 25th percentile
    pub p25: f64,
    /// Median
    pub p50: f64,
    /// 75th percentile
    pub p75: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

impl MetricStats {
    /// Compute statistics from an unsorted slice of values
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let len = sorted.len();
        let mean = sorted.iter().sum::<f64>() / len as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len as f64;

        Self {
            count: len,
            min: sorted[0],
            max: sorted[len - 1],
            mean,
            std: variance.sqrt(),
            p1: percentile(&sorted, 0.01),
            p5: percentile(&sorted, 0.05),
            p10: percentile(&sorted, 0.10),
            p25: percentile(&sorted, 0.25),
            p50: percentile(&sorted, 0.50),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.90),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }

    /// Iterate `(stat name, value)` pairs in `STAT_KEYS` order
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("count", self.count as f64),
            ("min", self.min),
            ("max", self.max),
            ("mean", self.mean),
            ("std", self.std),
            ("p1", self.p1),
            ("p5", self.p5),
            ("p10", self.p10),
            ("p25", self.p25),
            ("p50", self.p50),
            ("p75", self.p75),
            ("p90", self.p90),
            ("p95", self.p95),
            ("p99", self.p99),
        ]
    }
}

/// Percentile via linear interpolation on a sorted slice.
///
/// `P_k = sorted[floor(i)] + frac * (sorted[ceil(i)] - sorted[floor(i)])`
/// with `i = k * (n - 1)`.
pub fn percentile(sorted: &[f64], k: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let idx = k * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;

    if upper >= sorted.len() {
        sorted[sorted.len() - 1]
    } else {
        sorted[lower] + frac * (sorted[upper] - sorted[lower])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_linear_interpolation() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let stats = MetricStats::from_values(&values);

        assert_eq!(stats.count, 10);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert!((stats.mean - 5.5).abs() < 1e-12);
        // numpy linear interpolation reference values
        assert!((stats.p50 - 5.5).abs() < 1e-9);
        assert!((stats.p90 - 9.1).abs() < 1e-9);
        assert!((stats.p99 - 9.91).abs() < 1e-9);
        assert!((stats.p25 - 3.25).abs() < 1e-9);
    }

    #[test]
    fn test_population_std() {
        let stats = MetricStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        // canonical population-stddev example
        assert!((stats.std - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_value() {
        let stats = MetricStats::from_values(&[42.0]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.p50, 42.0);
        assert_eq!(stats.p99, 42.0);
        assert_eq!(stats.std, 0.0);
    }

    #[test]
    fn test_empty_values() {
        let stats = MetricStats::from_values(&[]);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.min, 0.0);
    }

    #[test]
    fn test_unsorted_input() {
        let stats = MetricStats::from_values(&[9.0, 1.0, 5.0, 3.0, 7.0]);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.p50, 5.0);
    }

    #[test]
    fn test_entries_order_matches_stat_keys() {
        let stats = MetricStats::from_values(&[1.0, 2.0]);
        let names: Vec<&str> = stats.entries().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, STAT_KEYS);
    }
}
