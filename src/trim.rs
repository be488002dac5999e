//! Trim optimization
//!
//! Every probe is reduced under every `(sent_trimmed, rcvd_trimmed)` pair in
//! `[0, num_sent) × [0, num_rcvd)`, where the bounds are the most common
//! payload-segment counts. Each pair is scored by the robust delta between the
//! unusual case and the others and by the MAD of the per-sample differences.
//!
//! Deeper trims are accepted greedily, first on the sent side and then on the
//! received side, while the delta keeps its sign and stays within
//! `delta_margin` of the untrimmed delta and the dispersion keeps falling.
//! The chosen pair becomes the canonical analysis for every probe.

use crate::config::TrimConfig;
use crate::error::{NanownError, Result};
use crate::estimators;
use crate::rtt::analyze_packets;
use crate::store::{AnalysisSource, MeasurementStore, Packet, TrimAnalysis};
use crate::unusual::{detect_unusual_case, UnusualCase};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Score of one trim setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimEvaluation {
    pub sent_trimmed: u32,
    pub rcvd_trimmed: u32,
    /// Robust center of the per-sample differences (NaN without data)
    pub delta: f64,
    /// Median absolute deviation of the same differences (NaN without data)
    pub dispersion: f64,
}

/// Outcome of one optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimSelection {
    pub sent_trimmed: u32,
    pub rcvd_trimmed: u32,
    pub num_sent: usize,
    pub num_rcvd: usize,
    pub unusual_case: UnusualCase,
    /// Row-major over `sent_trimmed`, then `rcvd_trimmed`
    pub evaluations: Vec<TrimEvaluation>,
    /// Canonical analyses written by the commit
    pub committed: usize,
    /// Probes without enough packets for the untrimmed reduction
    pub skipped: usize,
}

impl TrimSelection {
    pub fn evaluation(&self, sent_trimmed: u32, rcvd_trimmed: u32) -> Option<&TrimEvaluation> {
        self.evaluations
            .iter()
            .find(|e| e.sent_trimmed == sent_trimmed && e.rcvd_trimmed == rcvd_trimmed)
    }
}

/// Most frequent value; ties go to the smaller value
pub fn mode(values: &[usize]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(value, count)| (count, Reverse(value)))
        .map(|(value, _)| value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Keep,
    Stop,
    Ambiguous,
}

fn judge(reference: f64, current_dispersion: f64, candidate: &TrimEvaluation, margin: f64) -> Step {
    if !candidate.delta.is_finite() || !candidate.dispersion.is_finite() || current_dispersion == 0.0 {
        return Step::Ambiguous;
    }
    let same_sign = candidate.delta.signum() == reference.signum() && candidate.delta != 0.0;
    let within_margin = (candidate.delta - reference).abs() <= margin * reference.abs();
    if same_sign && within_margin && candidate.dispersion < current_dispersion {
        Step::Keep
    } else {
        Step::Stop
    }
}

/// Sweeps trim settings and commits the best one
pub struct TrimOptimizer<'a> {
    store: &'a mut MeasurementStore,
    config: &'a TrimConfig,
}

impl<'a> TrimOptimizer<'a> {
    pub fn new(store: &'a mut MeasurementStore, config: &'a TrimConfig) -> Self {
        Self { store, config }
    }

    /// Run the full sweep and commit the selected setting
    ///
    /// # Errors
    ///
    /// `NoProbes` for an empty store, `MissingTimestampPrecision` when the
    /// precision measurement was never recorded, `EmptySample` when no probe
    /// has analyzable packets, `TooFewTestCases` from unusual-case detection.
    pub fn optimize(self) -> Result<TrimSelection> {
        let probe_ids = self.store.probe_ids()?;
        if probe_ids.is_empty() {
            return Err(NanownError::NoProbes("optimize trim"));
        }
        let precision = self.store.timestamp_precision()?;

        let mut probes: Vec<(i64, Vec<Packet>)> = Vec::with_capacity(probe_ids.len());
        for id in probe_ids {
            probes.push((id, self.store.packets_for_probe(id)?));
        }

        self.store.clear_trim_analyses()?;

        // untrimmed pass sizes the search space
        let mut sent_counts = Vec::with_capacity(probes.len());
        let mut rcvd_counts = Vec::with_capacity(probes.len());
        let mut rows = Vec::with_capacity(probes.len());
        let mut skipped = 0;
        for (id, packets) in &probes {
            match analyze_packets(*id, packets, precision, 0, 0) {
                Ok(reduction) => {
                    sent_counts.push(reduction.num_sent);
                    rcvd_counts.push(reduction.num_rcvd);
                    rows.push(TrimAnalysis {
                        probe_id: *id,
                        estimate: reduction.estimate,
                    });
                }
                Err(e) if e.is_per_probe() => {
                    tracing::warn!(probe_id = id, error = %e, "probe skipped");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.store.add_trim_analyses(&rows)?;

        let num_sent = mode(&sent_counts).ok_or(NanownError::EmptySample("trim optimization"))?;
        let num_rcvd = mode(&rcvd_counts).ok_or(NanownError::EmptySample("trim optimization"))?;
        tracing::info!(num_sent, num_rcvd, skipped, "trim search space");

        for s in 0..num_sent as u32 {
            for r in 0..num_rcvd as u32 {
                if s == 0 && r == 0 {
                    continue;
                }
                let rows: Vec<TrimAnalysis> = probes
                    .iter()
                    .filter_map(|(id, packets)| {
                        analyze_packets(*id, packets, precision, s, r)
                            .ok()
                            .map(|reduction| TrimAnalysis {
                                probe_id: *id,
                                estimate: reduction.estimate,
                            })
                    })
                    .collect();
                self.store.add_trim_analyses(&rows)?;
            }
        }

        let unusual = detect_unusual_case(
            self.store,
            AnalysisSource::Trim {
                sent_trimmed: 0,
                rcvd_trimmed: 0,
            },
            &self.config.estimator,
        )?;
        tracing::info!(
            unusual_case = %unusual.test_case,
            delta = unusual.delta,
            "unusual case for trim evaluation"
        );

        let mut evaluations = Vec::with_capacity(num_sent * num_rcvd);
        for s in 0..num_sent as u32 {
            for r in 0..num_rcvd as u32 {
                evaluations.push(self.evaluate(&unusual.test_case, s, r)?);
            }
        }
        let (sent_trimmed, rcvd_trimmed) = self.select(&evaluations, num_sent, num_rcvd);
        let committed = self.store.commit_trim_selection(sent_trimmed, rcvd_trimmed)?;
        tracing::info!(
            sent_trimmed,
            rcvd_trimmed,
            committed,
            "trim selection committed"
        );

        Ok(TrimSelection {
            sent_trimmed,
            rcvd_trimmed,
            num_sent,
            num_rcvd,
            unusual_case: unusual,
            evaluations,
            committed,
            skipped,
        })
    }

    fn evaluate(&self, unusual_case: &str, s: u32, r: u32) -> Result<TrimEvaluation> {
        let diffs = self.store.packet_rtt_differences(
            unusual_case,
            AnalysisSource::Trim {
                sent_trimmed: s,
                rcvd_trimmed: r,
            },
        )?;
        let evaluation = TrimEvaluation {
            sent_trimmed: s,
            rcvd_trimmed: r,
            delta: self.config.estimator.estimate(&diffs).unwrap_or(f64::NAN),
            dispersion: estimators::mad(&diffs).unwrap_or(f64::NAN),
        };
        tracing::debug!(
            sent_trimmed = s,
            rcvd_trimmed = r,
            delta = evaluation.delta,
            dispersion = evaluation.dispersion,
            samples = diffs.len(),
            "trim evaluated"
        );
        Ok(evaluation)
    }

    fn select(&self, evaluations: &[TrimEvaluation], num_sent: usize, num_rcvd: usize) -> (u32, u32) {
        let at = |s: u32, r: u32| evaluations[s as usize * num_rcvd + r as usize];
        let untrimmed = at(0, 0);
        let reference = untrimmed.delta;
        if !reference.is_finite()
            || reference == 0.0
            || !untrimmed.dispersion.is_finite()
            || untrimmed.dispersion == 0.0
        {
            tracing::warn!(
                delta = reference,
                dispersion = untrimmed.dispersion,
                "untrimmed evaluation is ambiguous; keeping (0, 0)"
            );
            return (0, 0);
        }
        let margin = self.config.delta_margin;

        let mut best_sent = 0;
        let mut dispersion = untrimmed.dispersion;
        for s in 1..num_sent as u32 {
            let candidate = at(s, 0);
            match judge(reference, dispersion, &candidate, margin) {
                Step::Keep => {
                    best_sent = s;
                    dispersion = candidate.dispersion;
                }
                Step::Stop => break,
                Step::Ambiguous => {
                    tracing::warn!(sent_trimmed = s, "ambiguous trim comparison; sent sweep stopped");
                    break;
                }
            }
        }

        let mut best_rcvd = 0;
        for r in 1..num_rcvd as u32 {
            let candidate = at(best_sent, r);
            match judge(reference, dispersion, &candidate, margin) {
                Step::Keep => {
                    best_rcvd = r;
                    dispersion = candidate.dispersion;
                }
                Step::Stop => break,
                Step::Ambiguous => {
                    tracing::warn!(
                        sent_trimmed = best_sent,
                        rcvd_trimmed = r,
                        "ambiguous trim comparison; received sweep stopped"
                    );
                    break;
                }
            }
        }

        (best_sent, best_rcvd)
    }
}

/// Run the trim optimizer over every stored probe
pub fn optimize_trim(store: &mut MeasurementStore, config: &TrimConfig) -> Result<TrimSelection> {
    TrimOptimizer::new(store, config).optimize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(delta: f64, dispersion: f64) -> TrimEvaluation {
        TrimEvaluation {
            sent_trimmed: 1,
            rcvd_trimmed: 0,
            delta,
            dispersion,
        }
    }

    #[test]
    fn test_mode_ties_resolve_to_smaller() {
        assert_eq!(mode(&[3, 3, 2, 2, 5]), Some(2));
        assert_eq!(mode(&[4, 4, 4, 1]), Some(4));
        assert_eq!(mode(&[]), None);
    }

    #[test]
    fn test_judge_keeps_improving_depth() {
        assert_eq!(judge(100.0, 50.0, &eval(110.0, 40.0), 0.15), Step::Keep);
    }

    #[test]
    fn test_judge_stops_on_drift_sign_or_dispersion() {
        // outside 15% margin
        assert_eq!(judge(100.0, 50.0, &eval(120.0, 10.0), 0.15), Step::Stop);
        // sign flip
        assert_eq!(judge(-5.0, 50.0, &eval(0.5, 10.0), 1.0), Step::Stop);
        // dispersion must strictly fall
        assert_eq!(judge(100.0, 50.0, &eval(100.0, 50.0), 0.15), Step::Stop);
    }

    #[test]
    fn test_judge_flags_non_finite() {
        assert_eq!(judge(100.0, 50.0, &eval(f64::NAN, 1.0), 0.15), Step::Ambiguous);
        assert_eq!(judge(100.0, 50.0, &eval(100.0, f64::INFINITY), 0.15), Step::Ambiguous);
    }

    #[test]
    fn test_judge_flags_zero_dispersion() {
        // nothing can fall strictly below zero
        assert_eq!(judge(100.0, 0.0, &eval(100.0, 0.0), 0.15), Step::Ambiguous);
        assert_eq!(judge(100.0, 0.0, &eval(105.0, 3.0), 0.15), Step::Ambiguous);
    }

    #[test]
    fn test_zero_untrimmed_dispersion_keeps_untrimmed() {
        let mut store = MeasurementStore::open_in_memory(None).unwrap();
        let config = TrimConfig::default();
        let optimizer = TrimOptimizer::new(&mut store, &config);
        let mut evaluations = Vec::new();
        for s in 0..3 {
            let mut e = eval(100.0, 0.0);
            e.sent_trimmed = s;
            evaluations.push(e);
        }
        assert_eq!(optimizer.select(&evaluations, 3, 1), (0, 0));

        // depth 1 reaches zero dispersion, so depth 2 cannot be compared
        evaluations[0].dispersion = 20.0;
        evaluations[2].dispersion = 5.0;
        assert_eq!(optimizer.select(&evaluations, 3, 1), (1, 0));
    }

    #[test]
    fn test_empty_store_rejected() {
        let mut store = MeasurementStore::open_in_memory(None).unwrap();
        let err = optimize_trim(&mut store, &TrimConfig::default()).unwrap_err();
        assert!(matches!(err, NanownError::NoProbes(_)));
    }
}
