// Dual-percentile box test
//
// The unusual case and the rest each get an interval [p_low, p_high]. Disjoint
// intervals mean a difference is present; which one sits higher decides
// whether it matches the expected direction.

use super::{invalid_params, Classifier, ClassifierParams, TrainedClassifier, Verdict};
use crate::error::{NanownError, Result};
use crate::estimators::percentiles;
use crate::store::Observation;
use crate::trainer::{rank, ErrorRates, Objective, Scored, TrainingSession};

/// Percentile-interval overlap classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxTest;

fn rounded(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn box_params(low: f64, width: f64) -> ClassifierParams {
    ClassifierParams::Box {
        high: rounded(low + width),
        low: rounded(low),
    }
}

impl Classifier for BoxTest {
    fn name(&self) -> &str {
        "boxtest"
    }

    fn test(&self, params: &ClassifierParams, greater: bool, samples: &[Observation]) -> Result<Verdict> {
        let ClassifierParams::Box { high, low } = *params else {
            return Err(invalid_params(self.name(), params));
        };

        let unusual: Vec<f64> = samples.iter().map(|s| s.unusual_packet).collect();
        let rest: Vec<f64> = samples.iter().map(|s| s.other_packet).collect();
        let u = percentiles(&unusual, &[high, low]).ok_or(NanownError::EmptySample("boxtest"))?;
        let r = percentiles(&rest, &[high, low]).ok_or(NanownError::EmptySample("boxtest"))?;
        let (unusual_high, unusual_low) = (u[0], u[1]);
        let (rest_high, rest_low) = (r[0], r[1]);

        if unusual_high < rest_low {
            return Ok(if greater { Verdict::Reversed } else { Verdict::Present });
        }
        if rest_high < unusual_low {
            return Ok(if greater { Verdict::Present } else { Verdict::Reversed });
        }
        Ok(Verdict::Absent)
    }

    /// Four stages: coarse lows at width 1, widths averaged over the five best
    /// lows (balance), fine lows at that width, then fine widths (balance)
    fn train(&self, session: &mut TrainingSession<'_>) -> Result<TrainedClassifier> {
        let cases = session.test_case_count();
        if cases > 2 {
            return Err(NanownError::TooManyTestCases(cases));
        }
        let coarse = session.coarse_trials();
        let fine = session.fine_trials();

        let candidates = (0..50)
            .map(|low| (low as f64, box_params(low as f64, 1.0)))
            .collect();
        let ranked = session.run_stage(candidates, coarse, Objective::MeanError)?;
        let lows: Vec<f64> = ranked.iter().take(5).map(|s| s.key).collect();

        let mut per_width = Vec::new();
        for width in (1..=12).map(|w| w as f64 * 0.5) {
            let candidates: Vec<ClassifierParams> = lows.iter().map(|&low| box_params(low, width)).collect();
            let rates = session.error_rates(&candidates, coarse)?;
            if let Some(mean) = ErrorRates::average(&rates) {
                per_width.push(Scored {
                    key: width,
                    params: box_params(lows[0], width),
                    rates: mean,
                });
            }
        }
        let good_width = rank(per_width, Objective::Balance)
            .first()
            .map_or(1.0, |s| s.key);

        let candidates = lows
            .iter()
            .map(|&low| (low, box_params(low, good_width)))
            .collect();
        let ranked = session.run_stage(candidates, fine, Objective::MeanError)?;
        let best_low = ranked.first().map_or(0.0, |s| s.key);

        let candidates = (-14..15)
            .map(|step| rounded(good_width + step as f64 * 0.05))
            .filter(|&width| width > 0.0)
            .map(|width| (width, box_params(best_low, width)))
            .collect();
        let best = session
            .run_stage(candidates, fine, Objective::Balance)?
            .into_iter()
            .next()
            .ok_or(NanownError::EmptySample("boxtest width search"))?;

        Ok(TrainedClassifier {
            params: best.params,
            rates: best.rates,
            num_trials: fine,
        })
    }
}
