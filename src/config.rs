//! Configuration for association, trim optimization, and classifier training
//!
//! Loaded from TOML; every section and field is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! [association]
//! window_multiplier = 100.0
//!
//! [trim]
//! delta_margin = 0.15
//! estimator = { kind = "quadsummary", distance = 12.5 }
//!
//! [training]
//! workers = 4
//! seed = 42
//! classifiers = ["boxtest", "quadsummary"]
//! ```

use crate::classifier::ClassifierKind;
use crate::error::{NanownError, Result};
use crate::estimators::RobustEstimator;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Packet association settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssociationConfig {
    /// Association window = `window_multiplier` × mean(userspace_rtt)
    pub window_multiplier: f64,

    /// Feed lines inserted per transaction
    pub insert_batch_size: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            window_multiplier: 100.0,
            insert_batch_size: 10_000,
        }
    }
}

/// Trim optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrimConfig {
    /// Maximum relative drift of a trimmed delta from the untrimmed delta
    ///
    /// Default: 0.15 (15%)
    pub delta_margin: f64,

    /// Central estimator used for deltas and unusual-case detection
    pub estimator: RobustEstimator,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            delta_margin: 0.15,
            estimator: RobustEstimator::default(),
        }
    }
}

/// Bootstrap training settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Worker threads (each with its own store connection)
    pub workers: usize,

    /// Trials per candidate in coarse sweeps
    pub coarse_trials: usize,

    /// Trials per candidate in refinement sweeps
    pub fine_trials: usize,

    /// Seed for resampling offsets; None draws from OS entropy
    pub seed: Option<u64>,

    /// Classifiers trained by `train` when none are named explicitly
    pub classifiers: Vec<ClassifierKind>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            coarse_trials: 200,
            fine_trials: 500,
            seed: None,
            classifiers: vec![
                ClassifierKind::BoxTest,
                ClassifierKind::Midsummary,
                ClassifierKind::Ubersummary,
                ClassifierKind::Quadsummary,
                ClassifierKind::TsvalWeightedMean,
            ],
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NanownConfig {
    pub association: AssociationConfig,
    pub trim: TrimConfig,
    pub training: TrainingConfig,
}

impl NanownConfig {
    /// Small trial counts for smoke runs and tests
    pub fn quick() -> Self {
        Self {
            training: TrainingConfig {
                coarse_trials: 20,
                fine_trials: 40,
                ..TrainingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: NanownConfig = toml::from_str(content)?;
        config.validate().map_err(NanownError::Config)?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let multiplier = self.association.window_multiplier;
        if multiplier.is_nan() || multiplier <= 0.0 {
            return Err(format!(
                "association.window_multiplier must be positive, got {}",
                self.association.window_multiplier
            ));
        }

        if self.association.insert_batch_size == 0 {
            return Err("association.insert_batch_size must be >= 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.trim.delta_margin) {
            return Err(format!(
                "trim.delta_margin must be in [0, 1], got {}",
                self.trim.delta_margin
            ));
        }

        self.trim.estimator.validate()?;

        if self.training.workers == 0 {
            return Err("training.workers must be >= 1".to_string());
        }

        if self.training.coarse_trials == 0 || self.training.fine_trials == 0 {
            return Err(format!(
                "training trial counts must be >= 1, got coarse={} fine={}",
                self.training.coarse_trials, self.training.fine_trials
            ));
        }

        Ok(())
    }
}
