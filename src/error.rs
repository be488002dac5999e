//! Error types for the measurement pipeline
//!
//! Data-quality anomalies (duplicate, dropped, reordered, negative-RTT packets)
//! are never errors: they are encoded into the `suspect` flags of an analysis.
//! The variants here cover per-probe insufficiency, which callers recover from
//! locally, and structural/configuration problems, which should stop the run.

use thiserror::Error;

/// Errors produced by the nanown core
#[derive(Error, Debug)]
pub enum NanownError {
    #[error("probe {probe_id}: no {direction} payload segments to analyze")]
    InsufficientPackets {
        probe_id: i64,
        direction: &'static str,
    },

    #[error("timestamp precision has not been measured (meta row missing)")]
    MissingTimestampPrecision,

    #[error("no {probe_type} probes available for unusual case '{unusual_case}'")]
    EmptyPopulation {
        probe_type: String,
        unusual_case: String,
    },

    #[error("unusual case has not been recorded; run the analysis first")]
    MissingUnusualCase,

    #[error("no probes stored; cannot {0}")]
    NoProbes(&'static str),

    #[error("box test supports exactly two test cases, found {0}")]
    TooManyTestCases(usize),

    #[error("need at least two test cases to find an unusual case, found {0}")]
    TooFewTestCases(usize),

    #[error("empty sample passed to {0}")]
    EmptySample(&'static str),

    #[error("trial contains no tsval measurements")]
    MissingTsval,

    #[error("classifier '{classifier}' cannot use parameters {params}")]
    InvalidParams { classifier: String, params: String },

    #[error("unknown classifier: {0}")]
    UnknownClassifier(String),

    #[error("unknown probe type: {0}")]
    UnknownProbeType(String),

    #[error("worker pool lost result for job {0}")]
    MissingJobResult(usize),

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("statistics backend failed: {0}")]
    Statistics(String),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for nanown operations
pub type Result<T> = std::result::Result<T, NanownError>;

impl NanownError {
    /// True for errors that only invalidate a single probe's analysis
    pub fn is_per_probe(&self) -> bool {
        matches!(self, NanownError::InsufficientPackets { .. })
    }
}
