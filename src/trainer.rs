//! Bootstrap classifier training
//!
//! A trial draws one resampled subseries of `num_observations` samples from
//! the `train` (effect expected) or `train_null` (no effect) population and
//! applies a classifier to it. Over many trials:
//!
//! - false negatives = `train` trials whose verdict is not [`Verdict::Present`]
//! - false positives = `train_null` trials whose verdict is not [`Verdict::Absent`]
//!
//! both as percentages. Each classifier's train routine submits staged grid
//! sweeps through a [`TrainingSession`]; the session fans candidates out over
//! a [`WorkerPool`] whose workers each hold their own store handle.
//!
//! # Example
//!
//! ```no_run
//! use nanown::classifier::ClassifierKind;
//! use nanown::config::NanownConfig;
//! use nanown::store::MeasurementStore;
//! use nanown::trainer::BootstrapTrainer;
//!
//! # fn main() -> nanown::error::Result<()> {
//! let config = NanownConfig::default();
//! let mut store = MeasurementStore::open("./probes.db", config.training.seed)?;
//! let mut trainer = BootstrapTrainer::new(&mut store, config.training.clone());
//! let result = trainer.train_kind(ClassifierKind::Quadsummary, 50)?;
//! println!("{} fp={} fn={}", result.params, result.false_positives, result.false_negatives);
//! # Ok(())
//! # }
//! ```

use crate::classifier::{Classifier, ClassifierKind, ClassifierParams, TrainedClassifier, Verdict};
use crate::config::TrainingConfig;
use crate::error::{NanownError, Result};
use crate::store::{ClassifierResult, MeasurementStore, Observation, ProbeType};
use crate::worker_pool::{JobFn, WorkerPool};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// False-positive / false-negative percentages of one configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorRates {
    pub false_positives: f64,
    pub false_negatives: f64,
}

impl ErrorRates {
    pub fn mean_error(&self) -> f64 {
        (self.false_positives + self.false_negatives) / 2.0
    }

    pub fn imbalance(&self) -> f64 {
        (self.false_positives - self.false_negatives).abs()
    }

    /// Component-wise mean; None for an empty slice
    pub fn average(rates: &[ErrorRates]) -> Option<ErrorRates> {
        if rates.is_empty() {
            return None;
        }
        let n = rates.len() as f64;
        Some(ErrorRates {
            false_positives: rates.iter().map(|r| r.false_positives).sum::<f64>() / n,
            false_negatives: rates.iter().map(|r| r.false_negatives).sum::<f64>() / n,
        })
    }
}

/// Ranking criterion of a search stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// `(fp + fn) / 2`, ascending
    MeanError,
    /// `|fp - fn|`, ascending
    Balance,
}

impl Objective {
    pub fn score(self, rates: &ErrorRates) -> f64 {
        match self {
            Objective::MeanError => rates.mean_error(),
            Objective::Balance => rates.imbalance(),
        }
    }
}

/// One evaluated candidate, keyed the way its stage enumerated it
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<K> {
    pub key: K,
    pub params: ClassifierParams,
    pub rates: ErrorRates,
}

/// Sort by objective ascending; equal scores keep submission order
pub fn rank<K>(mut scored: Vec<Scored<K>>, objective: Objective) -> Vec<Scored<K>> {
    scored.sort_by(|a, b| objective.score(&a.rates).total_cmp(&objective.score(&b.rates)));
    scored
}

/// Fixed inputs of one training run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSetup {
    pub unusual_case: String,
    pub greater: bool,
    pub num_observations: usize,
}

/// Verdict counts of a classifier applied to `test` trials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictTally {
    pub present: usize,
    pub absent: usize,
    pub reversed: usize,
}

impl VerdictTally {
    pub fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Present => self.present += 1,
            Verdict::Absent => self.absent += 1,
            Verdict::Reversed => self.reversed += 1,
        }
    }

    pub fn trials(&self) -> usize {
        self.present + self.absent + self.reversed
    }
}

/// Full populations used for initial-guess fits, cached per
/// `(probe type, unusual case)` until invalidated
#[derive(Debug, Default)]
pub struct ModelCache {
    populations: HashMap<(ProbeType, String), Arc<Vec<Observation>>>,
}

impl ModelCache {
    pub fn population(
        &mut self,
        store: &mut MeasurementStore,
        probe_type: ProbeType,
        unusual_case: &str,
    ) -> Result<Arc<Vec<Observation>>> {
        let key = (probe_type, unusual_case.to_string());
        if let Some(population) = self.populations.get(&key) {
            return Ok(Arc::clone(population));
        }
        let population = Arc::new(store.full_population(probe_type, unusual_case)?);
        self.populations.insert(key, Arc::clone(&population));
        Ok(population)
    }

    pub fn invalidate(&mut self) {
        self.populations.clear();
    }
}

#[derive(Debug, Clone)]
struct TrialJob {
    params: ClassifierParams,
    num_trials: usize,
}

/// Apply one configuration to `num_trials` trials of each training population
fn run_trials(
    store: &mut MeasurementStore,
    classifier: &dyn Classifier,
    setup: &TrainingSetup,
    params: &ClassifierParams,
    num_trials: usize,
) -> Result<ErrorRates> {
    let size = Some(setup.num_observations);

    let mut missed = 0usize;
    for _ in 0..num_trials {
        let samples = store.subseries(ProbeType::Train, &setup.unusual_case, size, None)?;
        if classifier.test(params, setup.greater, &samples)? != Verdict::Present {
            missed += 1;
        }
    }

    let mut spurious = 0usize;
    for _ in 0..num_trials {
        let samples = store.subseries(ProbeType::TrainNull, &setup.unusual_case, size, None)?;
        if classifier.test(params, setup.greater, &samples)? != Verdict::Absent {
            spurious += 1;
        }
    }

    let trials = num_trials.max(1) as f64;
    Ok(ErrorRates {
        false_positives: 100.0 * spurious as f64 / trials,
        false_negatives: 100.0 * missed as f64 / trials,
    })
}

/// Handle given to a classifier's train routine
pub struct TrainingSession<'s> {
    setup: TrainingSetup,
    pool: WorkerPool<TrialJob, ErrorRates>,
    store: &'s mut MeasurementStore,
    cache: &'s mut ModelCache,
    coarse_trials: usize,
    fine_trials: usize,
    test_cases: usize,
}

impl<'s> TrainingSession<'s> {
    pub fn coarse_trials(&self) -> usize {
        self.coarse_trials
    }

    pub fn fine_trials(&self) -> usize {
        self.fine_trials
    }

    /// Distinct test-case labels in the store
    pub fn test_case_count(&self) -> usize {
        self.test_cases
    }

    /// Whole population of one probe type for the current unusual case
    pub fn population(&mut self, probe_type: ProbeType) -> Result<Arc<Vec<Observation>>> {
        self.cache
            .population(self.store, probe_type, &self.setup.unusual_case)
    }

    /// Error rates of each configuration, in submission order
    pub fn error_rates(&self, candidates: &[ClassifierParams], num_trials: usize) -> Result<Vec<ErrorRates>> {
        let jobs = candidates
            .iter()
            .map(|params| TrialJob {
                params: *params,
                num_trials,
            })
            .collect();
        self.pool.map(jobs)
    }

    /// Evaluate keyed candidates and rank them
    pub fn run_stage<K>(
        &self,
        candidates: Vec<(K, ClassifierParams)>,
        num_trials: usize,
        objective: Objective,
    ) -> Result<Vec<Scored<K>>> {
        let params: Vec<ClassifierParams> = candidates.iter().map(|(_, p)| *p).collect();
        let rates = self.error_rates(&params, num_trials)?;
        let scored: Vec<Scored<K>> = candidates
            .into_iter()
            .zip(rates)
            .map(|((key, params), rates)| Scored { key, params, rates })
            .collect();
        let ranked = rank(scored, objective);
        if let Some(best) = ranked.first() {
            tracing::debug!(
                candidates = ranked.len(),
                num_trials,
                ?objective,
                best = %best.params,
                fp = best.rates.false_positives,
                fn_ = best.rates.false_negatives,
                "stage ranked"
            );
        }
        Ok(ranked)
    }
}

/// Drives classifier training and evaluation against one store
pub struct BootstrapTrainer<'a> {
    store: &'a mut MeasurementStore,
    config: TrainingConfig,
    cache: ModelCache,
}

impl<'a> BootstrapTrainer<'a> {
    pub fn new(store: &'a mut MeasurementStore, config: TrainingConfig) -> Self {
        Self {
            store,
            config,
            cache: ModelCache::default(),
        }
    }

    /// Recorded unusual case plus the requested trial size
    ///
    /// # Errors
    ///
    /// `MissingUnusualCase` when the analysis step has not recorded one.
    pub fn setup(&self, num_observations: usize) -> Result<TrainingSetup> {
        let (unusual_case, greater) = self
            .store
            .unusual_case()?
            .ok_or(NanownError::MissingUnusualCase)?;
        Ok(TrainingSetup {
            unusual_case,
            greater,
            num_observations,
        })
    }

    fn worker_stores(&self) -> Result<Vec<MeasurementStore>> {
        (0..self.config.workers.max(1))
            .map(|i| {
                let seed = self.config.seed.map(|s| s.wrapping_add(i as u64));
                self.store.reopen(seed)
            })
            .collect()
    }

    /// Train one classifier and persist its best configuration
    ///
    /// # Errors
    ///
    /// `EmptyPopulation` when either training population is empty, plus
    /// whatever the classifier's search reports.
    pub fn train(
        &mut self,
        classifier: Arc<dyn Classifier>,
        num_observations: usize,
    ) -> Result<ClassifierResult> {
        let setup = self.setup(num_observations)?;

        // both populations must exist before any trial is dispatched
        self.cache
            .population(self.store, ProbeType::Train, &setup.unusual_case)?;
        self.cache
            .population(self.store, ProbeType::TrainNull, &setup.unusual_case)?;

        let test_cases = self.store.test_cases()?.len();
        let worker_classifier = Arc::clone(&classifier);
        let worker_setup = setup.clone();
        let work: JobFn<MeasurementStore, TrialJob, ErrorRates> =
            Arc::new(move |store: &mut MeasurementStore, job: TrialJob| {
                run_trials(
                    store,
                    worker_classifier.as_ref(),
                    &worker_setup,
                    &job.params,
                    job.num_trials,
                )
            });
        let pool = WorkerPool::new(self.worker_stores()?, work)?;

        tracing::info!(
            classifier = classifier.name(),
            unusual_case = %setup.unusual_case,
            num_observations,
            workers = pool.workers(),
            "training classifier"
        );

        let mut session = TrainingSession {
            setup,
            pool,
            store: &mut *self.store,
            cache: &mut self.cache,
            coarse_trials: self.config.coarse_trials,
            fine_trials: self.config.fine_trials,
            test_cases,
        };
        let trained = classifier.train(&mut session)?;
        drop(session);

        let result = ClassifierResult {
            classifier: classifier.name().to_string(),
            trial_type: ProbeType::Train,
            num_observations,
            num_trials: trained.num_trials,
            params: trained.params.to_json()?,
            false_positives: trained.rates.false_positives,
            false_negatives: trained.rates.false_negatives,
        };
        self.store.add_classifier_result(&result)?;

        tracing::info!(
            classifier = %result.classifier,
            params = %result.params,
            false_positives = result.false_positives,
            false_negatives = result.false_negatives,
            "classifier trained"
        );
        Ok(result)
    }

    pub fn train_kind(&mut self, kind: ClassifierKind, num_observations: usize) -> Result<ClassifierResult> {
        self.train(kind.classifier(), num_observations)
    }

    /// Train every configured classifier at every trial size
    ///
    /// A classifier whose training fails is logged and skipped.
    pub fn train_all(&mut self, observation_counts: &[usize]) -> Result<Vec<ClassifierResult>> {
        let kinds = self.config.classifiers.clone();
        let mut results = Vec::new();
        for &n in observation_counts {
            for kind in &kinds {
                match self.train_kind(*kind, n) {
                    Ok(result) => results.push(result),
                    Err(e @ (NanownError::Sql(_) | NanownError::MissingUnusualCase)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(classifier = %kind, num_observations = n, error = %e, "training failed");
                    }
                }
            }
        }
        Ok(results)
    }

    /// Apply a trained configuration to trials from the `test` population
    pub fn evaluate(
        &mut self,
        classifier: &dyn Classifier,
        params: &ClassifierParams,
        num_observations: usize,
        num_trials: usize,
    ) -> Result<VerdictTally> {
        let setup = self.setup(num_observations)?;
        let mut tally = VerdictTally::default();
        for _ in 0..num_trials {
            let samples = self.store.subseries(
                ProbeType::Test,
                &setup.unusual_case,
                Some(num_observations),
                None,
            )?;
            tally.record(classifier.test(params, setup.greater, &samples)?);
        }
        tracing::info!(
            classifier = classifier.name(),
            present = tally.present,
            absent = tally.absent,
            reversed = tally.reversed,
            "test population evaluated"
        );
        Ok(tally)
    }
}
