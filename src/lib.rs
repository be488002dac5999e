//! Nanown - timing-oracle measurement reduction and classifier training
//!
//! This library turns raw probe records and a captured packet feed into
//! per-probe round-trip estimates, selects the trimming that best isolates
//! the timing difference between test cases, and trains statistical
//! classifiers that decide whether a difference is present in a small
//! number of observations.

pub mod associate;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod estimators;
pub mod rtt;
pub mod store;
pub mod tcpts;
pub mod trainer;
pub mod trim;
pub mod unusual;
pub mod worker_pool;
