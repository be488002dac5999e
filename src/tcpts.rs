//! TCP timestamp (tsval) clock precision
//!
//! Dedicated timestamp probes run on their own local ports. For each such
//! port, received segments carrying a tsval are regressed as
//! `observed = m * tsval + c`; the slope `m` is the remote clock's tick length
//! in capture nanoseconds. The mean slope is the scale factor the RTT reducer
//! applies to tsval differences.

use crate::error::{NanownError, Result};
use crate::store::{PacketRecord, TimestampPrecision};
use std::collections::HashMap;
use std::io::BufRead;

/// Ordinary least squares fit of `y = m x + c`, returning `(m, c)`
///
/// Values are centred before accumulating so large nanosecond timestamps do
/// not swamp the products. Returns None when `x` has no spread.
pub fn ols_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;

    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (xi, yi) in x[..n].iter().zip(&y[..n]) {
        let dx = xi - mean_x;
        sxy += dx * (yi - mean_y);
        sxx += dx * dx;
    }
    if sxx == 0.0 {
        return None;
    }
    let m = sxy / sxx;
    Some((m, mean_y - m * mean_x))
}

/// Mean and sample standard deviation of the slopes
///
/// Residuals around the first slope go through trueno's f32 kernels; the
/// offset is added back in f64.
fn summarize_slopes(slopes: &[f64]) -> Result<(f64, Option<f64>)> {
    let base = slopes[0];
    let residuals: Vec<f32> = slopes.iter().map(|s| (s - base) as f32).collect();
    let n = residuals.len() as f32;

    let sum = trueno::Vector::from_slice(&residuals)
        .sum()
        .map_err(|e| NanownError::Statistics(e.to_string()))?;
    let mean_residual = sum / n;
    let mean = base + f64::from(mean_residual);

    if residuals.len() < 2 {
        return Ok((mean, None));
    }
    let squared: Vec<f32> = residuals
        .iter()
        .map(|r| (r - mean_residual) * (r - mean_residual))
        .collect();
    let ss = trueno::Vector::from_slice(&squared)
        .sum()
        .map_err(|e| NanownError::Statistics(e.to_string()))?;
    let stddev = f64::from(ss / (n - 1.0)).sqrt();
    Ok((mean, Some(stddev)))
}

/// Estimate the remote timestamp clock's tick length from a capture feed
///
/// Only received segments (`sent == 0`) with a non-zero tsval on one of
/// `ports` count. A port is skipped (with a warning) when it has fewer than
/// two points or its tsval wraps between the first and last point.
/// Returns `Ok(None)` when no port qualifies. Malformed lines are skipped.
pub fn compute_timestamp_precision<R: BufRead>(
    reader: R,
    ports: &[u16],
) -> Result<Option<TimestampPrecision>> {
    let mut points: HashMap<u16, Vec<(f64, f64)>> =
        ports.iter().map(|&p| (p, Vec::new())).collect();
    let mut malformed = 0usize;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: PacketRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        if record.sent != 0 || record.tsval == 0 {
            continue;
        }
        if let Some(port_points) = points.get_mut(&record.local_port) {
            port_points.push((record.tsval as f64, record.observed as f64));
        }
    }

    if malformed > 0 {
        tracing::warn!(malformed, "malformed feed lines skipped");
    }

    let mut slopes = Vec::new();
    for port in ports {
        let Some(port_points) = points.get(port) else {
            continue;
        };
        if port_points.len() < 2 {
            tracing::warn!(port, points = port_points.len(), "inadequate tsval data points");
            continue;
        }
        if port_points[0].0 > port_points[port_points.len() - 1].0 {
            tracing::warn!(port, "tsval wrapped during measurement");
            continue;
        }
        let (x, y): (Vec<f64>, Vec<f64>) = port_points.iter().copied().unzip();
        match ols_regression(&x, &y) {
            Some((slope, _)) => slopes.push(slope),
            None => tracing::warn!(port, "tsval did not advance; no slope"),
        }
    }

    if slopes.is_empty() {
        return Ok(None);
    }

    let (mean, stddev) = summarize_slopes(&slopes)?;
    tracing::info!(mean, ?stddev, ports = slopes.len(), "timestamp precision measured");
    Ok(Some(TimestampPrecision {
        mean,
        stddev,
        slopes,
    }))
}
