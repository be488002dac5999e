// Timing-difference classifiers
//
// Every classifier pairs a test routine, which turns one bootstrap trial into
// a three-way verdict, with a train routine, which searches the classifier's
// hyperparameters through a TrainingSession. The set of built-in classifiers
// is fixed (ClassifierKind); anything implementing the trait can be trained by
// the same engine.

mod boxtest;
mod kalman;
mod summary;
mod tsval;


pub use boxtest::BoxTest;
pub use kalman::{kfilter, KalmanClassifier, KalmanFilter1D};
pub use summary::{SummaryClassifier, SummaryStatistic};
pub use tsval::{tsvalwmean, TsvalClassifier};

use crate::error::{NanownError, Result};
use crate::store::Observation;
use crate::trainer::{ErrorRates, TrainingSession};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Built-in classifier set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[serde(rename = "boxtest")]
    BoxTest,
    Midsummary,
    Trimean,
    Quadsummary,
    Septasummary,
    Ubersummary,
    Kalman,
    #[serde(rename = "tsvalwmean")]
    TsvalWeightedMean,
}

impl ClassifierKind {
    pub const ALL: [ClassifierKind; 8] = [
        ClassifierKind::BoxTest,
        ClassifierKind::Midsummary,
        ClassifierKind::Trimean,
        ClassifierKind::Quadsummary,
        ClassifierKind::Septasummary,
        ClassifierKind::Ubersummary,
        ClassifierKind::Kalman,
        ClassifierKind::TsvalWeightedMean,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ClassifierKind::BoxTest => "boxtest",
            ClassifierKind::Midsummary => "midsummary",
            ClassifierKind::Trimean => "trimean",
            ClassifierKind::Quadsummary => "quadsummary",
            ClassifierKind::Septasummary => "septasummary",
            ClassifierKind::Ubersummary => "ubersummary",
            ClassifierKind::Kalman => "kalman",
            ClassifierKind::TsvalWeightedMean => "tsvalwmean",
        }
    }

    /// Instantiate the classifier behind this kind
    pub fn classifier(self) -> Arc<dyn Classifier> {
        match self {
            ClassifierKind::BoxTest => Arc::new(BoxTest),
            ClassifierKind::Midsummary => Arc::new(SummaryClassifier::new(SummaryStatistic::Midsummary)),
            ClassifierKind::Trimean => Arc::new(SummaryClassifier::new(SummaryStatistic::Trimean)),
            ClassifierKind::Quadsummary => Arc::new(SummaryClassifier::new(SummaryStatistic::Quadsummary)),
            ClassifierKind::Septasummary => {
                Arc::new(SummaryClassifier::new(SummaryStatistic::Septasummary))
            }
            ClassifierKind::Ubersummary => Arc::new(SummaryClassifier::new(SummaryStatistic::Ubersummary)),
            ClassifierKind::Kalman => Arc::new(KalmanClassifier),
            ClassifierKind::TsvalWeightedMean => Arc::new(TsvalClassifier),
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClassifierKind {
    type Err = NanownError;

    fn from_str(s: &str) -> Result<Self> {
        ClassifierKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| NanownError::UnknownClassifier(s.to_string()))
    }
}

/// Outcome of testing one trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// Difference present, opposite to the expected direction
    Reversed = -1,
    Absent = 0,
    /// Difference present in the expected direction
    Present = 1,
}

impl Verdict {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    /// One-sided threshold decision shared by the scalar classifiers
    pub fn from_threshold(statistic: f64, threshold: f64, greater: bool) -> Self {
        let present = if greater {
            statistic > threshold
        } else {
            statistic < threshold
        };
        if present {
            Verdict::Present
        } else {
            Verdict::Absent
        }
    }
}

/// Hyperparameters of one classifier configuration
///
/// Serialized as a JSON object with its keys in sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassifierParams {
    /// Percentile pair of the box test, `low < high`
    Box { high: f64, low: f64 },
    Summary { distance: f64, threshold: f64 },
    Threshold { threshold: f64 },
}

impl ClassifierParams {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn threshold(&self) -> Option<f64> {
        match *self {
            ClassifierParams::Summary { threshold, .. } | ClassifierParams::Threshold { threshold } => {
                Some(threshold)
            }
            ClassifierParams::Box { .. } => None,
        }
    }
}

impl fmt::Display for ClassifierParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Best configuration found by a train routine
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedClassifier {
    pub params: ClassifierParams,
    pub rates: ErrorRates,
    /// Trials per population used for the final ranking
    pub num_trials: usize,
}

/// A statistical test with its own hyperparameter search
pub trait Classifier: Send + Sync {
    /// Name persisted with classifier results
    fn name(&self) -> &str;

    /// Decide one trial
    fn test(&self, params: &ClassifierParams, greater: bool, samples: &[Observation]) -> Result<Verdict>;

    /// Search hyperparameters using bootstrap trials
    fn train(&self, session: &mut TrainingSession<'_>) -> Result<TrainedClassifier>;
}

pub(crate) fn invalid_params(classifier: &str, params: &ClassifierParams) -> NanownError {
    NanownError::InvalidParams {
        classifier: classifier.to_string(),
        params: params.to_string(),
    }
}

pub(crate) fn packet_differences(samples: &[Observation]) -> Vec<f64> {
    samples.iter().map(Observation::packet_difference).collect()
}
