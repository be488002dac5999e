// Persisted entities of the measurement store

use crate::error::NanownError;
use crate::rtt::{RttEstimate, Suspect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Population a probe belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeType {
    /// Effect expected (unusual case vs the rest)
    Train,
    /// Control: no effect expected
    TrainNull,
    /// Held-out evaluation set
    Test,
}

impl ProbeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeType::Train => "train",
            ProbeType::TrainNull => "train_null",
            ProbeType::Test => "test",
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeType {
    type Err = NanownError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(ProbeType::Train),
            "train_null" => Ok(ProbeType::TrainNull),
            "test" => Ok(ProbeType::Test),
            other => Err(NanownError::UnknownProbeType(other.to_string())),
        }
    }
}

/// One timed request, as recorded by the prober
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub sample: i64,
    pub test_case: String,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    pub tc_order: i64,
    /// Send time, monotonic nanoseconds
    pub time_of_day: i64,
    pub local_port: u16,
    /// RTT observed by the application
    pub reported: i64,
    pub userspace_rtt: i64,
}

/// Association window of one stored probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeWindow {
    pub probe_id: i64,
    pub local_port: u16,
    pub time_of_day: i64,
    pub userspace_rtt: i64,
}

/// One line of the capture feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// 1 = sent by us, 0 = received
    pub sent: u8,
    pub observed: i64,
    #[serde(default)]
    pub tsval: i64,
    pub local_port: u16,
    pub payload_len: i64,
    pub tcpseq: i64,
    pub tcpack: i64,
}

/// One observed TCP segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub probe_id: Option<i64>,
    pub sent: bool,
    pub observed: i64,
    pub tsval: i64,
    pub payload_len: i64,
    pub tcpseq: i64,
    pub tcpack: i64,
}

impl Packet {
    pub fn from_record(record: &PacketRecord, probe_id: Option<i64>) -> Self {
        Self {
            probe_id,
            sent: record.sent == 1,
            observed: record.observed,
            tsval: record.tsval,
            payload_len: record.payload_len,
            tcpseq: record.tcpseq,
            tcpack: record.tcpack,
        }
    }
}

/// Canonical per-probe RTT
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub probe_id: i64,
    pub suspect: Suspect,
    pub packet_rtt: i64,
    pub tsval_rtt: Option<i64>,
}

/// Candidate per-probe RTT under one trim setting
#[derive(Debug, Clone, PartialEq)]
pub struct TrimAnalysis {
    pub probe_id: i64,
    pub estimate: RttEstimate,
}

/// Where per-probe RTTs are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisSource {
    Canonical,
    Trim { sent_trimmed: u32, rcvd_trimmed: u32 },
}

/// One training outcome for a classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResult {
    pub classifier: String,
    pub trial_type: ProbeType,
    pub num_observations: usize,
    pub num_trials: usize,
    /// JSON object with sorted keys
    pub params: String,
    /// Percent of null trials that reported an effect
    pub false_positives: f64,
    /// Percent of effect trials that missed it
    pub false_negatives: f64,
}

impl ClassifierResult {
    pub fn total_error(&self) -> f64 {
        self.false_positives + self.false_negatives
    }
}

/// Regression outputs of the timestamp-precision measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampPrecision {
    /// Mean nanoseconds per tsval tick
    pub mean: f64,
    pub stddev: Option<f64>,
    pub slopes: Vec<f64>,
}

/// Single-row store metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub tcpts: Option<TimestampPrecision>,
    pub unusual_case: Option<String>,
    pub greater: Option<bool>,
}
