//! Unusual test-case detection
//!
//! The unusual case is the label whose central RTT estimate sits furthest
//! from the estimate over all `train`/`test` probes. Its delta is measured
//! against the pooled remaining cases, so the sign says whether the oracle
//! makes that case slower (`greater`) or faster.

use crate::error::{NanownError, Result};
use crate::estimators::RobustEstimator;
use crate::store::{AnalysisSource, MeasurementStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detected unusual case and its signed distance from the other cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnusualCase {
    pub test_case: String,
    /// Estimate of this case minus the estimate of all others, nanoseconds
    pub delta: f64,
    pub greater: bool,
}

fn estimate(estimator: &RobustEstimator, values: &[f64]) -> Result<f64> {
    estimator
        .estimate(values)
        .ok_or(NanownError::EmptySample("unusual case detection"))
}

/// Pick the unusual case from per-case RTT samples
///
/// With exactly two cases a negative delta is flipped onto the other label,
/// so the reported case is always the slower one.
///
/// # Errors
///
/// `TooFewTestCases` when fewer than two cases have data.
pub fn find_unusual_case(
    by_case: &BTreeMap<String, Vec<f64>>,
    estimator: &RobustEstimator,
) -> Result<UnusualCase> {
    let cases: Vec<(&String, &Vec<f64>)> = by_case.iter().filter(|(_, v)| !v.is_empty()).collect();
    if cases.len() < 2 {
        return Err(NanownError::TooFewTestCases(cases.len()));
    }

    let all: Vec<f64> = cases.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    let global = estimate(estimator, &all)?;

    // ties go to the label that sorts last
    let mut best: Option<(f64, usize, f64)> = None;
    for (i, (_, values)) in cases.iter().enumerate() {
        let est = estimate(estimator, values)?;
        let distance = (est - global).abs();
        if best.map_or(true, |(d, _, _)| distance >= d) {
            best = Some((distance, i, est));
        }
    }
    let (_, index, case_estimate) = best.ok_or(NanownError::TooFewTestCases(0))?;

    let remaining: Vec<f64> = cases
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .flat_map(|(_, (_, v))| v.iter().copied())
        .collect();
    let mut delta = case_estimate - estimate(estimator, &remaining)?;
    let mut test_case = cases[index].0.clone();

    if cases.len() == 2 && delta < 0.0 {
        test_case = cases[1 - index].0.clone();
        delta = -delta;
    }

    Ok(UnusualCase {
        test_case,
        delta,
        greater: delta > 0.0,
    })
}

/// Detect the unusual case from analyses already in the store
pub fn detect_unusual_case(
    store: &MeasurementStore,
    source: AnalysisSource,
    estimator: &RobustEstimator,
) -> Result<UnusualCase> {
    let by_case = store.packet_rtts_by_case(source)?;
    find_unusual_case(&by_case, estimator)
}

/// Detect from canonical analyses and record the result in the meta row
pub fn record_unusual_case(
    store: &mut MeasurementStore,
    estimator: &RobustEstimator,
) -> Result<UnusualCase> {
    let unusual = detect_unusual_case(store, AnalysisSource::Canonical, estimator)?;
    store.set_unusual_case(&unusual.test_case, unusual.greater)?;
    tracing::info!(
        unusual_case = %unusual.test_case,
        delta = unusual.delta,
        greater = unusual.greater,
        "unusual case recorded"
    );
    Ok(unusual)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cases(entries: &[(&str, Vec<f64>)]) -> BTreeMap<String, Vec<f64>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn around(center: f64) -> Vec<f64> {
        (0..41).map(|i| center + (i as f64 - 20.0)).collect()
    }

    #[test]
    fn test_shifted_case_found() {
        let by_case = cases(&[
            ("a", around(1_000.0)),
            ("b", around(1_000.0)),
            ("c", around(1_500.0)),
        ]);
        let u = find_unusual_case(&by_case, &RobustEstimator::default()).unwrap();
        assert_eq!(u.test_case, "c");
        assert!((u.delta - 500.0).abs() < 1e-9);
        assert!(u.greater);
    }

    #[test]
    fn test_faster_case_with_three_cases_not_greater() {
        let by_case = cases(&[
            ("a", around(1_000.0)),
            ("b", around(700.0)),
            ("c", around(1_000.0)),
        ]);
        let u = find_unusual_case(&by_case, &RobustEstimator::default()).unwrap();
        assert_eq!(u.test_case, "b");
        assert!(u.delta < 0.0);
        assert!(!u.greater);
    }

    #[test]
    fn test_two_cases_negative_delta_swaps_label() {
        let by_case = cases(&[("fast", around(1_000.0)), ("slow", around(1_100.0))]);
        let u = find_unusual_case(&by_case, &RobustEstimator::Median).unwrap();
        assert_eq!(u.test_case, "slow");
        assert!((u.delta - 100.0).abs() < 1e-9);
        assert!(u.greater);
    }

    #[test]
    fn test_equidistant_cases_pick_last_label() {
        let by_case = cases(&[("a", vec![0.0; 5]), ("b", vec![10.0; 5]), ("c", vec![20.0; 5])]);
        let u = find_unusual_case(&by_case, &RobustEstimator::default()).unwrap();
        assert_eq!(u.test_case, "c");
        assert_eq!(u.delta, 15.0);
        assert!(u.greater);
    }

    #[test]
    fn test_single_case_is_error() {
        let by_case = cases(&[("only", around(5.0)), ("empty", Vec::new())]);
        assert!(matches!(
            find_unusual_case(&by_case, &RobustEstimator::default()),
            Err(NanownError::TooFewTestCases(1))
        ));
    }
}
