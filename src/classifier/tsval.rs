// Weighted mean of TCP-timestamp-derived differences
//
// Each sample's tsval difference is weighted by the square of its combined
// packet RTT, normalized by the mean weight.

use super::{invalid_params, Classifier, ClassifierParams, TrainedClassifier, Verdict};
use crate::error::{NanownError, Result};
use crate::store::{Observation, ProbeType};
use crate::trainer::{Objective, TrainingSession};

/// Weighted mean of `unusual_tsval - other_tsval`
///
/// Samples without tsval values are skipped.
///
/// # Errors
///
/// `MissingTsval` when no sample carries tsval values.
pub fn tsvalwmean(samples: &[Observation]) -> Result<f64> {
    let pairs: Vec<(f64, f64)> = samples
        .iter()
        .filter_map(|s| {
            let diff = s.tsval_difference()?;
            let weight = (s.unusual_packet + s.other_packet).powi(2);
            Some((weight, diff))
        })
        .collect();
    if pairs.is_empty() {
        return Err(NanownError::MissingTsval);
    }

    let n = pairs.len() as f64;
    let normalizer = pairs.iter().map(|(w, _)| w).sum::<f64>() / n;
    if normalizer == 0.0 {
        return Ok(pairs.iter().map(|(_, d)| d).sum::<f64>() / n);
    }
    Ok(pairs.iter().map(|(w, d)| w * d / normalizer).sum::<f64>() / n)
}

/// Threshold test on [`tsvalwmean`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TsvalClassifier;

impl Classifier for TsvalClassifier {
    fn name(&self) -> &str {
        "tsvalwmean"
    }

    fn test(&self, params: &ClassifierParams, greater: bool, samples: &[Observation]) -> Result<Verdict> {
        let ClassifierParams::Threshold { threshold } = *params else {
            return Err(invalid_params(self.name(), params));
        };
        Ok(Verdict::from_threshold(tsvalwmean(samples)?, threshold, greater))
    }

    fn train(&self, session: &mut TrainingSession<'_>) -> Result<TrainedClassifier> {
        let trials = session.coarse_trials();
        let train = tsvalwmean(&session.population(ProbeType::Train)?)?;
        let null = tsvalwmean(&session.population(ProbeType::TrainNull)?)?;
        let threshold = (train + null) / 2.0;

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
            .ok_or(NanownError::EmptySample("tsvalwmean threshold search"))?;

        Ok(TrainedClassifier {
            params: best.params,
            rates: best.rates,
            num_trials: trials,
        })
    }
}
