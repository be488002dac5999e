//! Robust location and dispersion estimators
//!
//! Percentiles use linear interpolation between closest ranks, so results
//! match the usual "linear" definition: `rank = p/100 * (n - 1)`.
//!
//! The summary estimators average symmetric percentile pairs around the
//! median; `distance` is the half-width (in percentile points) of the outer
//! pair. All functions return `None` for an empty sample.

use serde::{Deserialize, Serialize};

/// Default half-width for the summary estimators
pub const DEFAULT_DISTANCE: f64 = 25.0;

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Several percentiles of one sample (single sort)
pub fn percentiles(values: &[f64], ps: &[f64]) -> Option<Vec<f64>> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted(values);
    Some(ps.iter().map(|&p| percentile_of_sorted(&sorted, p)).collect())
}

pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    percentiles(values, &[p]).map(|v| v[0])
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Arithmetic mean
///
/// Residuals around the first value are summed by trueno in f32 and the
/// pivot is added back in f64, so nanosecond-scale inputs keep their
/// precision.
pub fn mean(values: &[f64]) -> Option<f64> {
    let (&pivot, _) = values.split_first()?;
    let residuals: Vec<f32> = values.iter().map(|v| (v - pivot) as f32).collect();
    let sum = trueno::Vector::from_slice(&residuals).sum().ok()?;
    Some(pivot + f64::from(sum) / values.len() as f64)
}

/// Standard deviation with divisor `n`
pub fn population_stddev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let squared: Vec<f32> = values.iter().map(|v| ((v - m) * (v - m)) as f32).collect();
    let ss = trueno::Vector::from_slice(&squared).sum().ok()?;
    Some((f64::from(ss) / values.len() as f64).sqrt())
}

/// Median absolute deviation
pub fn mad(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Mean of the `50 - distance` and `50 + distance` percentiles
pub fn midsummary(values: &[f64], distance: f64) -> Option<f64> {
    let p = percentiles(values, &[50.0 - distance, 50.0 + distance])?;
    Some((p[0] + p[1]) / 2.0)
}

/// Average of the midsummary and the median
pub fn trimean(values: &[f64], distance: f64) -> Option<f64> {
    let p = percentiles(values, &[50.0 - distance, 50.0, 50.0 + distance])?;
    Some(((p[0] + p[2]) / 2.0 + p[1]) / 2.0)
}

/// Mean of four percentiles: the outer pair at `distance` and an inner pair
/// halfway to the median
pub fn quadsummary(values: &[f64], distance: f64) -> Option<f64> {
    let left1 = 50.0 - distance;
    let left2 = (left1 + 50.0) / 2.0;
    let right1 = 50.0 + distance;
    let right2 = (right1 + 50.0) / 2.0;
    let p = percentiles(values, &[left1, left2, right2, right1])?;
    Some(p.iter().sum::<f64>() / 4.0)
}

/// Mean of seven percentiles including the median
pub fn septasummary(values: &[f64], distance: f64) -> Option<f64> {
    let p = percentiles(values, &outer_six_with_median(distance))?;
    Some(p.iter().sum::<f64>() / 7.0)
}

/// Weighted mean of six percentiles (weights 1:4:1 on each side)
pub fn ubersummary(values: &[f64], distance: f64) -> Option<f64> {
    let left2 = 50.0 - distance;
    let left3 = 50.0 - distance / 2.0;
    let left1 = left2 / 2.0;
    let right2 = 50.0 + distance;
    let right3 = 50.0 + distance / 2.0;
    let right1 = (right2 + 100.0) / 2.0;
    let p = percentiles(values, &[left1, left2, left3, right3, right2, right1])?;
    Some((p[0] + p[1] * 4.0 + p[2] + p[3] + p[4] * 4.0 + p[5]) / 12.0)
}

fn outer_six_with_median(distance: f64) -> [f64; 7] {
    let left2 = 50.0 - distance;
    let right2 = 50.0 + distance;
    [
        left2 / 2.0,
        left2,
        50.0 - distance / 2.0,
        50.0,
        50.0 + distance / 2.0,
        right2,
        (right2 + 100.0) / 2.0,
    ]
}

/// Selectable central estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RobustEstimator {
    Median,
    Midsummary { distance: f64 },
    Trimean { distance: f64 },
    Quadsummary { distance: f64 },
    Septasummary { distance: f64 },
    Ubersummary { distance: f64 },
}

impl Default for RobustEstimator {
    /// Mean of the 37.5 / 43.75 / 56.25 / 62.5 percentiles
    fn default() -> Self {
        RobustEstimator::Quadsummary { distance: 12.5 }
    }
}

impl RobustEstimator {
    pub fn estimate(&self, values: &[f64]) -> Option<f64> {
        match *self {
            RobustEstimator::Median => median(values),
            RobustEstimator::Midsummary { distance } => midsummary(values, distance),
            RobustEstimator::Trimean { distance } => trimean(values, distance),
            RobustEstimator::Quadsummary { distance } => quadsummary(values, distance),
            RobustEstimator::Septasummary { distance } => septasummary(values, distance),
            RobustEstimator::Ubersummary { distance } => ubersummary(values, distance),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let distance = match *self {
            RobustEstimator::Median => return Ok(()),
            RobustEstimator::Midsummary { distance }
            | RobustEstimator::Trimean { distance }
            | RobustEstimator::Quadsummary { distance }
            | RobustEstimator::Septasummary { distance }
            | RobustEstimator::Ubersummary { distance } => distance,
        };
        if !(0.0..=50.0).contains(&distance) {
            return Err(format!("estimator distance must be in [0, 50], got {}", distance));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert!(close(percentile(&v, 50.0).unwrap(), 2.5));
        assert!(close(percentile(&v, 0.0).unwrap(), 1.0));
        assert!(close(percentile(&v, 100.0).unwrap(), 4.0));
        assert!(close(percentile(&v, 25.0).unwrap(), 1.75));
    }

    #[test]
    fn test_percentile_unsorted_input() {
        let v = [9.0, 1.0, 5.0, 3.0, 7.0];
        assert!(close(median(&v).unwrap(), 5.0));
    }

    #[test]
    fn test_empty_sample_returns_none() {
        assert!(median(&[]).is_none());
        assert!(mad(&[]).is_none());
        assert!(quadsummary(&[], 25.0).is_none());
        assert!(RobustEstimator::default().estimate(&[]).is_none());
    }

    #[test]
    fn test_mad() {
        // median 3, deviations [2,1,0,1,6] -> median 1
        let v = [1.0, 2.0, 3.0, 4.0, 9.0];
        assert!(close(mad(&v).unwrap(), 1.0));
    }

    #[test]
    fn test_summaries_of_symmetric_sample_equal_median() {
        let v: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        for est in [
            RobustEstimator::Median,
            RobustEstimator::Midsummary { distance: 25.0 },
            RobustEstimator::Trimean { distance: 25.0 },
            RobustEstimator::Quadsummary { distance: 25.0 },
            RobustEstimator::Septasummary { distance: 25.0 },
            RobustEstimator::Ubersummary { distance: 25.0 },
        ] {
            assert!(close(est.estimate(&v).unwrap(), 50.0), "{:?}", est);
        }
    }

    #[test]
    fn test_default_quadsummary_points() {
        // 0..=80: percentile p maps to value 0.8 * p
        let v: Vec<f64> = (0..=80).map(|i| i as f64).collect();
        let expected = (37.5 + 43.75 + 56.25 + 62.5) * 0.8 / 4.0;
        assert!(close(RobustEstimator::default().estimate(&v).unwrap(), expected));
    }

    #[test]
    fn test_robust_to_outliers() {
        let mut v = vec![10.0; 99];
        v.push(1e9);
        assert!(close(quadsummary(&v, 12.5).unwrap(), 10.0));
        assert!(close(mad(&v).unwrap(), 0.0));
    }

    #[test]
    fn test_population_stddev() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(close(population_stddev(&v).unwrap(), 2.0));
    }

    #[test]
    fn test_mean_keeps_nanosecond_precision() {
        let v = [1e15, 1e15 + 1.0, 1e15 + 2.0, 1e15 + 3.0];
        assert_eq!(mean(&v).unwrap(), 1e15 + 1.5);
        assert_eq!(population_stddev(&[7.0; 5]).unwrap(), 0.0);
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn test_invalid_distance() {
        assert!(RobustEstimator::Midsummary { distance: 60.0 }
            .validate()
            .is_err());
        assert!(RobustEstimator::Median.validate().is_ok());
    }
}
