//! Statistical foundation for survey analytics
//!
//! Pure, stateless computations over finite numeric samples: descriptive
//! statistics, percentiles, histogram binning, confidence intervals, and
//! time-series trend classification.

use crate::utils::{SurveyError, SurveyResult};
use serde::{Deserialize, Serialize};

/// Net percent change below this threshold classifies a series as stable
const STABLE_CHANGE_THRESHOLD_PCT: f64 = 10.0;

/// Descriptive statistics over a numeric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicStatistics {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    pub quartiles: Quartiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quartiles {
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

/// One equal-width histogram bin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub level: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
    pub margin_of_error: f64,
}

/// One chronologically ordered aggregate point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub bucket: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    #[serde(rename = "increasing")]
    Increasing,
    #[serde(rename = "decreasing")]
    Decreasing,
    #[serde(rename = "stable")]
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendResult {
    pub direction: TrendDirection,
    /// Net change from the first to the last value, in percent
    pub percent_change: f64,
    /// Ordinary least-squares slope over index-vs-value
    pub slope: f64,
    /// Pearson correlation over index-vs-value
    pub correlation: f64,
}

impl TrendResult {
    fn flat() -> Self {
        Self {
            direction: TrendDirection::Stable,
            percent_change: 0.0,
            slope: 0.0,
            correlation: 0.0,
        }
    }
}

/// Statistical utility functions for survey aggregates
pub struct StatsEngine;

impl StatsEngine {
    /// Compute descriptive statistics for a sample. An empty sample is a
    /// caller bug and raises rather than returning zeros.
    pub fn basic_statistics(values: &[f64]) -> SurveyResult<BasicStatistics> {
        if values.is_empty() {
            return Err(SurveyError::empty_dataset(
                "cannot compute statistics over an empty sample",
            ));
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let median = median_of(&sorted);
        let quartiles = quartiles_of(&sorted);

        Ok(BasicStatistics {
            mean,
            median,
            std_dev: variance.sqrt(),
            variance,
            min: sorted[0],
            max: sorted[n - 1],
            count: n as u64,
            quartiles,
        })
    }

    /// Percentile via linear interpolation between order statistics
    pub fn percentile(values: &[f64], p: f64) -> SurveyResult<f64> {
        if !(0.0..=100.0).contains(&p) {
            return Err(SurveyError::validation_error(format!(
                "percentile must be within [0, 100], got {}",
                p
            )));
        }
        if values.is_empty() {
            return Err(SurveyError::empty_dataset(
                "cannot compute a percentile over an empty sample",
            ));
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let rank = p / 100.0 * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Ok(sorted[lower]);
        }
        let weight = rank - lower as f64;
        Ok(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
    }

    /// Partition the value range into equal-width bins with count and
    /// percentage per bin. Empty input yields an empty sequence.
    pub fn distribution(values: &[f64], bins: usize) -> Vec<DistributionBin> {
        if values.is_empty() || bins == 0 {
            return Vec::new();
        }

        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let width = (max - min) / bins as f64;

        let mut counts = vec![0u64; bins];
        for value in values {
            let index = if width > 0.0 {
                (((value - min) / width) as usize).min(bins - 1)
            } else {
                // Degenerate range: every value lands in the first bin
                0
            };
            counts[index] += 1;
        }

        let total = values.len() as f64;
        counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| DistributionBin {
                lower: min + width * i as f64,
                upper: min + width * (i + 1) as f64,
                count,
                percentage: count as f64 / total * 100.0,
            })
            .collect()
    }

    /// Confidence interval for the sample mean at the 90, 95 or 99 percent
    /// level (normal approximation)
    pub fn confidence_interval(values: &[f64], level: f64) -> SurveyResult<ConfidenceInterval> {
        let z = match level {
            l if (l - 90.0).abs() < f64::EPSILON => 1.645,
            l if (l - 95.0).abs() < f64::EPSILON => 1.960,
            l if (l - 99.0).abs() < f64::EPSILON => 2.576,
            other => {
                return Err(SurveyError::validation_error(format!(
                    "unsupported confidence level: {} (expected 90, 95 or 99)",
                    other
                )))
            }
        };

        let stats = Self::basic_statistics(values)?;
        let margin = z * stats.std_dev / (stats.count as f64).sqrt();
        Ok(ConfidenceInterval {
            level,
            mean: stats.mean,
            lower: stats.mean - margin,
            upper: stats.mean + margin,
            margin_of_error: margin,
        })
    }

    /// Classify the direction of a chronologically sorted series.
    ///
    /// Fewer than two points is a flat result, never an error: there is
    /// nothing to regress over.
    pub fn trend_analysis(points: &[TrendPoint]) -> TrendResult {
        if points.len() < 2 {
            return TrendResult::flat();
        }

        let n = points.len() as f64;
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();

        let mean_x = (n - 1.0) / 2.0;
        let mean_y = values.iter().sum::<f64>() / n;

        let mut covariance = 0.0;
        let mut variance_x = 0.0;
        let mut variance_y = 0.0;
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - mean_x;
            let dy = y - mean_y;
            covariance += dx * dy;
            variance_x += dx * dx;
            variance_y += dy * dy;
        }

        let slope = if variance_x > 0.0 {
            covariance / variance_x
        } else {
            0.0
        };
        let denominator = (variance_x * variance_y).sqrt();
        let correlation = if denominator > 0.0 {
            covariance / denominator
        } else {
            0.0
        };

        let first = values[0];
        let last = values[values.len() - 1];
        let percent_change = if first.abs() > f64::EPSILON {
            (last - first) / first.abs() * 100.0
        } else if last.abs() > f64::EPSILON {
            // Growth from a zero baseline has no finite ratio; saturate past
            // the stability threshold in the direction of movement
            100.0 * (last - first).signum()
        } else {
            0.0
        };

        let direction = if percent_change.abs() < STABLE_CHANGE_THRESHOLD_PCT {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Increasing
        } else if slope < 0.0 {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        };

        TrendResult {
            direction,
            percent_change,
            slope,
            correlation,
        }
    }
}

fn median_of(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Median-of-halves quartiles: an even-length sample splits evenly, an
/// odd-length sample excludes the middle element from both halves
fn quartiles_of(sorted: &[f64]) -> Quartiles {
    let n = sorted.len();
    let half = n / 2;
    let lower = &sorted[..half];
    let upper = &sorted[n - half..];

    let q1 = if lower.is_empty() {
        sorted[0]
    } else {
        median_of(lower)
    };
    let q3 = if upper.is_empty() {
        sorted[n - 1]
    } else {
        median_of(upper)
    };

    Quartiles {
        q1,
        q2: median_of(sorted),
        q3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;

    fn points(values: &[f64]) -> Vec<TrendPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TrendPoint {
                bucket: format!("2026-07-{:02}", i + 1),
                value: *v,
            })
            .collect()
    }

    #[test]
    fn test_basic_statistics_one_through_ten() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let stats = StatsEngine::basic_statistics(&values).unwrap();
        assert!((stats.mean - 5.5).abs() < 1e-9);
        assert!((stats.median - 5.5).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 10.0);
        assert_eq!(stats.count, 10);
        assert!((stats.quartiles.q1 - 3.0).abs() < 1e-9);
        assert!((stats.quartiles.q3 - 8.0).abs() < 1e-9);
        assert!((stats.variance - 8.25).abs() < 1e-9);
        assert!((stats.std_dev - 8.25f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_basic_statistics_empty_sample_raises() {
        let err = StatsEngine::basic_statistics(&[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EmptyDataset);
    }

    #[test]
    fn test_quartiles_odd_length_excludes_middle() {
        let stats = StatsEngine::basic_statistics(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.quartiles.q1, 1.5); // median of [1, 2]
        assert_eq!(stats.quartiles.q3, 4.5); // median of [4, 5]
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(StatsEngine::percentile(&values, 0.0).unwrap(), 1.0);
        assert_eq!(StatsEngine::percentile(&values, 100.0).unwrap(), 4.0);
        assert!((StatsEngine::percentile(&values, 50.0).unwrap() - 2.5).abs() < 1e-9);
        assert!((StatsEngine::percentile(&values, 25.0).unwrap() - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_rejects_out_of_range() {
        assert!(StatsEngine::percentile(&[1.0], -0.1).is_err());
        assert!(StatsEngine::percentile(&[1.0], 100.1).is_err());
        assert_eq!(
            StatsEngine::percentile(&[], 50.0).unwrap_err().kind,
            ErrorKind::EmptyDataset
        );
    }

    #[test]
    fn test_distribution_equal_width_bins() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let bins = StatsEngine::distribution(&values, 5);
        assert_eq!(bins.len(), 5);
        for bin in &bins {
            assert_eq!(bin.count, 2);
            assert!((bin.percentage - 20.0).abs() < 1e-9);
        }
        assert_eq!(bins[0].lower, 1.0);
        assert_eq!(bins[4].upper, 10.0);
    }

    #[test]
    fn test_distribution_empty_and_degenerate_inputs() {
        assert!(StatsEngine::distribution(&[], 5).is_empty());
        assert!(StatsEngine::distribution(&[1.0, 2.0], 0).is_empty());

        // All-identical values collapse into the first bin
        let bins = StatsEngine::distribution(&[4.0, 4.0, 4.0], 3);
        assert_eq!(bins[0].count, 3);
        assert_eq!(bins[1].count, 0);
    }

    #[test]
    fn test_confidence_interval_ninety_five() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let ci = StatsEngine::confidence_interval(&values, 95.0).unwrap();
        assert!((ci.mean - 5.5).abs() < 1e-9);
        let expected_margin = 1.960 * 8.25f64.sqrt() / 10f64.sqrt();
        assert!((ci.margin_of_error - expected_margin).abs() < 1e-9);
        assert!(ci.lower < ci.mean && ci.mean < ci.upper);

        assert!(StatsEngine::confidence_interval(&values, 80.0).is_err());
        assert_eq!(
            StatsEngine::confidence_interval(&[], 95.0).unwrap_err().kind,
            ErrorKind::EmptyDataset
        );
    }

    #[test]
    fn test_trend_monotonic_increase_classifies_increasing() {
        let result = StatsEngine::trend_analysis(&points(&[10.0, 12.0, 15.0, 20.0]));
        assert_eq!(result.direction, TrendDirection::Increasing);
        assert!((result.percent_change - 100.0).abs() < 1e-9);
        assert!(result.slope > 0.0);
        assert!(result.correlation > 0.95);
    }

    #[test]
    fn test_trend_decline_classifies_decreasing() {
        let result = StatsEngine::trend_analysis(&points(&[20.0, 15.0, 12.0, 10.0]));
        assert_eq!(result.direction, TrendDirection::Decreasing);
        assert!(result.slope < 0.0);
    }

    #[test]
    fn test_trend_small_variation_is_stable_regardless_of_slope() {
        let result = StatsEngine::trend_analysis(&points(&[100.0, 100.5, 99.8, 100.2]));
        assert_eq!(result.direction, TrendDirection::Stable);
        assert!(result.percent_change.abs() < 1.0);
    }

    #[test]
    fn test_trend_fewer_than_two_points_is_flat() {
        let single = StatsEngine::trend_analysis(&points(&[42.0]));
        assert_eq!(single.direction, TrendDirection::Stable);
        assert_eq!(single.slope, 0.0);
        assert_eq!(single.correlation, 0.0);
        assert_eq!(single.percent_change, 0.0);

        let none = StatsEngine::trend_analysis(&[]);
        assert_eq!(none.direction, TrendDirection::Stable);
    }

    #[test]
    fn test_trend_linear_series_has_unit_correlation() {
        let result = StatsEngine::trend_analysis(&points(&[2.0, 4.0, 6.0, 8.0, 10.0]));
        assert!((result.correlation - 1.0).abs() < 1e-9);
        assert!((result.slope - 2.0).abs() < 1e-9);
    }
}
