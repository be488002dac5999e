//! Packet association: capture feed → probes
//!
//! Each captured segment is assigned to the probe that most plausibly
//! generated it: same local port, and observed inside
//! `[time_of_day, time_of_day + userspace_rtt + window_size)`. When several
//! windows match, the earliest-starting probe wins. Segments matching nothing
//! are stored unassociated (NULL probe id) and counted.
//!
//! `window_size` is `window_multiplier × mean(userspace_rtt)` over all probes.

use crate::config::AssociationConfig;
use crate::error::{NanownError, Result};
use crate::store::{MeasurementStore, Packet, PacketRecord, ProbeWindow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;

/// Outcome of loading one capture feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationReport {
    /// Slack added after each probe's userspace RTT, nanoseconds
    pub window_size: f64,
    pub inserted: usize,
    pub unassociated: usize,
    /// Feed lines that were not valid packet records
    pub malformed: usize,
}

/// Per-port probe windows sorted by start time
#[derive(Debug, Clone)]
pub struct ProbeIndex {
    by_port: HashMap<u16, PortWindows>,
    window_size: f64,
}

#[derive(Debug, Clone)]
struct PortWindows {
    windows: Vec<ProbeWindow>,
    /// Longest `userspace_rtt` on this port; bounds how far back a match can start
    max_userspace_rtt: i64,
}

impl ProbeIndex {
    pub fn new(windows: Vec<ProbeWindow>, window_size: f64) -> Self {
        let mut by_port: HashMap<u16, PortWindows> = HashMap::new();
        for w in windows {
            let entry = by_port.entry(w.local_port).or_insert_with(|| PortWindows {
                windows: Vec::new(),
                max_userspace_rtt: 0,
            });
            entry.max_userspace_rtt = entry.max_userspace_rtt.max(w.userspace_rtt);
            entry.windows.push(w);
        }
        for entry in by_port.values_mut() {
            entry
                .windows
                .sort_by_key(|w| (w.time_of_day, w.probe_id));
        }
        Self {
            by_port,
            window_size,
        }
    }

    /// Probe id owning a segment seen on `local_port` at `observed`
    pub fn lookup(&self, local_port: u16, observed: i64) -> Option<i64> {
        let port = self.by_port.get(&local_port)?;
        let end = port.windows.partition_point(|w| w.time_of_day <= observed);

        // skip windows that cannot reach `observed` even with the longest RTT
        let reach = port.max_userspace_rtt as f64 + self.window_size;
        let start = port.windows[..end]
            .partition_point(|w| ((observed - w.time_of_day) as f64) >= reach);

        port.windows[start..end]
            .iter()
            .find(|w| ((observed - w.time_of_day - w.userspace_rtt) as f64) < self.window_size)
            .map(|w| w.probe_id)
    }
}

/// Read a newline-delimited JSON packet feed and store every packet,
/// associated to its probe where possible
///
/// # Errors
///
/// `NoProbes` when the store holds no probes; SQL and I/O errors propagate.
pub fn associate_packets<R: BufRead>(
    store: &mut MeasurementStore,
    reader: R,
    config: &AssociationConfig,
) -> Result<AssociationReport> {
    let mean_rtt = store
        .mean_userspace_rtt()?
        .ok_or(NanownError::NoProbes("associate packets"))?;
    let window_size = config.window_multiplier * mean_rtt;
    let index = ProbeIndex::new(store.probe_windows()?, window_size);

    tracing::info!(window_size, "associating packets with probes");

    let batch_size = config.insert_batch_size.max(1);
    let mut batch: Vec<Packet> = Vec::with_capacity(batch_size);
    let mut report = AssociationReport {
        window_size,
        inserted: 0,
        unassociated: 0,
        malformed: 0,
    };

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: PacketRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(line = line_no + 1, error = %e, "skipping malformed feed line");
                report.malformed += 1;
                continue;
            }
        };

        let probe_id = index.lookup(record.local_port, record.observed);
        if probe_id.is_none() {
            report.unassociated += 1;
        }
        batch.push(Packet::from_record(&record, probe_id));

        if batch.len() >= batch_size {
            report.inserted += store.add_packets(&batch)?;
            batch.clear();
            tracing::debug!(inserted = report.inserted, "packet batch committed");
        }
    }

    if !batch.is_empty() {
        report.inserted += store.add_packets(&batch)?;
    }

    if report.unassociated > 0 {
        tracing::warn!(
            unassociated = report.unassociated,
            inserted = report.inserted,
            "packets matched no probe window"
        );
    }
    if report.malformed > 0 {
        tracing::warn!(malformed = report.malformed, "malformed feed lines skipped");
    }
    tracing::info!(
        inserted = report.inserted,
        unassociated = report.unassociated,
        "packet association complete"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(probe_id: i64, port: u16, start: i64, rtt: i64) -> ProbeWindow {
        ProbeWindow {
            probe_id,
            local_port: port,
            time_of_day: start,
            userspace_rtt: rtt,
        }
    }

    #[test]
    fn test_lookup_respects_window_bounds() {
        let index = ProbeIndex::new(vec![window(1, 80, 1_000, 100)], 50.0);
        assert_eq!(index.lookup(80, 999), None);
        assert_eq!(index.lookup(80, 1_000), Some(1));
        assert_eq!(index.lookup(80, 1_149), Some(1));
        // end of window is exclusive
        assert_eq!(index.lookup(80, 1_150), None);
        assert_eq!(index.lookup(81, 1_050), None);
    }

    #[test]
    fn test_overlapping_windows_prefer_earliest_start() {
        let index = ProbeIndex::new(
            vec![window(2, 80, 1_100, 100), window(1, 80, 1_000, 500)],
            0.0,
        );
        assert_eq!(index.lookup(80, 1_150), Some(1));
        assert_eq!(index.lookup(80, 1_050), Some(1));
        // probe 1 window is [1000, 1500), probe 2 is [1100, 1200)
        assert_eq!(index.lookup(80, 1_600), None);
    }

    #[test]
    fn test_long_window_found_behind_short_ones() {
        let index = ProbeIndex::new(
            vec![
                window(1, 80, 0, 10_000),
                window(2, 80, 100, 10),
                window(3, 80, 200, 10),
            ],
            0.0,
        );
        assert_eq!(index.lookup(80, 5_000), Some(1));
        assert_eq!(index.lookup(80, 205), Some(1));
    }

    #[test]
    fn test_empty_store_is_usage_error() {
        let mut store = MeasurementStore::open_in_memory(None).unwrap();
        let err = associate_packets(&mut store, "".as_bytes(), &AssociationConfig::default())
            .unwrap_err();
        assert!(matches!(err, NanownError::NoProbes(_)));
    }
}
