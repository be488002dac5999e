// One-dimensional Kalman smoother over per-sample differences
//
// The state is the difference itself with no process motion (Q = 0). The
// initial state is the quadsummary of the trial and the measurement noise is
// the trial's standard deviation, so only the decision threshold is trained.

use super::{invalid_params, packet_differences, Classifier, ClassifierParams, TrainedClassifier, Verdict};
use crate::error::{NanownError, Result};
use crate::estimators::{self, DEFAULT_DISTANCE};
use crate::store::{Observation, ProbeType};
use crate::trainer::{Objective, TrainingSession};

const INITIAL_VARIANCE: f64 = 10.0;

/// Smallest measurement noise; keeps the gain finite for constant input
const MIN_NOISE: f64 = 1e-9;

/// Scalar Kalman filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanFilter1D {
    /// State estimate
    pub x: f64,
    /// Estimate variance
    pub p: f64,
    /// Measurement noise
    pub r: f64,
    /// Process noise
    pub q: f64,
}

impl KalmanFilter1D {
    pub fn new(x0: f64, p: f64, r: f64, q: f64) -> Self {
        Self { x: x0, p, r, q }
    }

    pub fn predict(&mut self, movement: f64) {
        self.x += movement;
        self.p += self.q;
    }

    pub fn update(&mut self, z: f64) {
        self.x = (self.p * z + self.x * self.r) / (self.p + self.r);
        self.p = 1.0 / (1.0 / self.p + 1.0 / self.r);
    }
}

/// Filtered estimates after each observation
pub fn kfilter(observations: &[f64]) -> Option<Vec<f64>> {
    let x0 = estimators::quadsummary(observations, DEFAULT_DISTANCE)?;
    let r = estimators::population_stddev(observations)?.max(MIN_NOISE);
    let mut kf = KalmanFilter1D::new(x0, INITIAL_VARIANCE, r, 0.0);

    let mut estimates = Vec::with_capacity(observations.len());
    for &z in observations {
        kf.predict(0.0);
        kf.update(z);
        estimates.push(kf.x);
    }
    Some(estimates)
}

fn final_estimate(diffs: &[f64]) -> Option<f64> {
    kfilter(diffs)?.last().copied()
}

/// Threshold test on the final Kalman estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct KalmanClassifier;

impl Classifier for KalmanClassifier {
    fn name(&self) -> &str {
        "kalman"
    }

    fn test(&self, params: &ClassifierParams, greater: bool, samples: &[Observation]) -> Result<Verdict> {
        let ClassifierParams::Threshold { threshold } = *params else {
            return Err(invalid_params(self.name(), params));
        };
        let m = final_estimate(&packet_differences(samples))
            .ok_or(NanownError::EmptySample("kalman test"))?;
        Ok(Verdict::from_threshold(m, threshold, greater))
    }

    fn train(&self, session: &mut TrainingSession<'_>) -> Result<TrainedClassifier> {
        let trials = session.coarse_trials();
        let population = session.population(ProbeType::Train)?;
        let threshold = final_estimate(&packet_differences(&population))
            .ok_or(NanownError::EmptySample("kalman training"))?
            / 2.0;

        let candidates = (90..=110)
            .map(|t| {
                let th = threshold * t as f64 / 100.0;
                (th, ClassifierParams::Threshold { threshold: th })
            })
            .collect();
        let best = session
            .run_stage(candidates, trials, Objective::Balance)?
            .into_iter()
            .next()
            .ok_or(NanownError::EmptySample("kalman threshold search"))?;

        Ok(TrainedClassifier {
            params: best.params,
            rates: best.rates,
            num_trials: trials,
        })
    }
}
