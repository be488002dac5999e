// Robust-summary threshold tests
//
// Per-sample differences (unusual minus the mean of the other cases) are
// reduced with one of the summary estimators and compared to a threshold in
// the expected direction.

use super::{invalid_params, packet_differences, Classifier, ClassifierParams, TrainedClassifier, Verdict};
use crate::error::{NanownError, Result};
use crate::estimators::{self, DEFAULT_DISTANCE};
use crate::store::{Observation, ProbeType};
use crate::trainer::{Objective, TrainingSession};

/// Which summary estimator reduces the differences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStatistic {
    Midsummary,
    Trimean,
    Quadsummary,
    Septasummary,
    Ubersummary,
}

impl SummaryStatistic {
    pub fn name(self) -> &'static str {
        match self {
            SummaryStatistic::Midsummary => "midsummary",
            SummaryStatistic::Trimean => "trimean",
            SummaryStatistic::Quadsummary => "quadsummary",
            SummaryStatistic::Septasummary => "septasummary",
            SummaryStatistic::Ubersummary => "ubersummary",
        }
    }

    pub fn apply(self, values: &[f64], distance: f64) -> Option<f64> {
        match self {
            SummaryStatistic::Midsummary => estimators::midsummary(values, distance),
            SummaryStatistic::Trimean => estimators::trimean(values, distance),
            SummaryStatistic::Quadsummary => estimators::quadsummary(values, distance),
            SummaryStatistic::Septasummary => estimators::septasummary(values, distance),
            SummaryStatistic::Ubersummary => estimators::ubersummary(values, distance),
        }
    }
}

/// Threshold test on a summary of per-sample differences
#[derive(Debug, Clone, Copy)]
pub struct SummaryClassifier {
    statistic: SummaryStatistic,
}

fn summary_params(distance: f64, threshold: f64) -> ClassifierParams {
    ClassifierParams::Summary {
        distance,
        threshold,
    }
}

impl SummaryClassifier {
    pub fn new(statistic: SummaryStatistic) -> Self {
        Self { statistic }
    }
}

impl Classifier for SummaryClassifier {
    fn name(&self) -> &str {
        self.statistic.name()
    }

    fn test(&self, params: &ClassifierParams, greater: bool, samples: &[Observation]) -> Result<Verdict> {
        let ClassifierParams::Summary {
            distance,
            threshold,
        } = *params
        else {
            return Err(invalid_params(self.name(), params));
        };
        let diffs = packet_differences(samples);
        let m = self
            .statistic
            .apply(&diffs, distance)
            .ok_or(NanownError::EmptySample("summary test"))?;
        Ok(Verdict::from_threshold(m, threshold, greater))
    }

    /// Starts from half the statistic over the full `train` population, then
    /// alternates distance sweeps (mean error) with threshold sweeps (balance)
    fn train(&self, session: &mut TrainingSession<'_>) -> Result<TrainedClassifier> {
        let coarse = session.coarse_trials();
        let fine = session.fine_trials();

        let population = session.population(ProbeType::Train)?;
        let threshold = self
            .statistic
            .apply(&packet_differences(&population), DEFAULT_DISTANCE)
            .ok_or(NanownError::EmptySample("summary training"))?
            / 2.0;

        let candidates = (1..50)
            .map(|d| (d as f64, summary_params(d as f64, threshold)))
            .collect();
        let ranked = session.run_stage(candidates, coarse, Objective::MeanError)?;
        let good_distance = ranked.first().map_or(DEFAULT_DISTANCE, |s| s.key);

        let candidates = (80..122)
            .step_by(2)
            .map(|t| {
                let th = threshold * t as f64 / 100.0;
                (th, summary_params(good_distance, th))
            })
            .collect();
        let ranked = session.run_stage(candidates, coarse, Objective::Balance)?;
        let good_threshold = ranked.first().map_or(threshold, |s| s.key);

        let candidates = (-4..=4)
            .map(|step| good_distance + step as f64)
            .filter(|d| (0.0..=50.0).contains(d))
            .map(|d| (d, summary_params(d, good_threshold)))
            .collect();
        let ranked = session.run_stage(candidates, fine, Objective::MeanError)?;
        let best_distance = ranked.first().map_or(good_distance, |s| s.key);

        let candidates = (90..=110)
            .map(|t| {
                let th = good_threshold * t as f64 / 100.0;
                (th, summary_params(best_distance, th))
            })
            .collect();
        let best = session
            .run_stage(candidates, fine, Objective::Balance)?
            .into_iter()
            .next()
            .ok_or(NanownError::EmptySample("summary threshold search"))?;

        Ok(TrainedClassifier {
            params: best.params,
            rates: best.rates,
            num_trials: fine,
        })
    }
}
