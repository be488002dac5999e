// Shared fixtures for integration tests
//
// Builds probe records, TCP segments and canonical analyses directly, so the
// pipeline stages can be exercised without a live prober or capture.
#![allow(dead_code)]

use nanown::rtt::Suspect;
use nanown::store::{Analysis, MeasurementStore, Packet, PacketRecord, Probe, ProbeType};

pub const PORT_BASE: u16 = 20_000;

pub fn probe(sample: i64, test_case: &str, probe_type: ProbeType, time_of_day: i64, local_port: u16) -> Probe {
    Probe {
        sample,
        test_case: test_case.to_string(),
        probe_type,
        tc_order: 0,
        time_of_day,
        local_port,
        reported: 0,
        userspace_rtt: 50_000,
    }
}

pub fn segment(probe_id: i64, sent: bool, observed: i64, tcpseq: i64, tcpack: i64, payload_len: i64) -> Packet {
    Packet {
        probe_id: Some(probe_id),
        sent,
        observed,
        tsval: 0,
        payload_len,
        tcpseq,
        tcpack,
    }
}

pub fn feed_line(record: &PacketRecord) -> String {
    serde_json::to_string(record).unwrap()
}

/// Adds one probe per `(sample, case)` with a canonical analysis whose
/// packet RTT is `rtt(case_index, sample)`
///
/// Sample numbers start at `first_sample`; the returned value is the next
/// free sample number.
pub fn add_canonical<F>(
    store: &mut MeasurementStore,
    probe_type: ProbeType,
    cases: &[&str],
    first_sample: i64,
    samples: i64,
    rtt: F,
) -> i64
where
    F: Fn(usize, i64) -> i64,
{
    add_canonical_timed(store, probe_type, cases, first_sample, samples, |c, s| (rtt(c, s), None))
}

/// Like [`add_canonical`], with `timing` returning `(packet_rtt, tsval_rtt)`
pub fn add_canonical_timed<F>(
    store: &mut MeasurementStore,
    probe_type: ProbeType,
    cases: &[&str],
    first_sample: i64,
    samples: i64,
    timing: F,
) -> i64
where
    F: Fn(usize, i64) -> (i64, Option<i64>),
{
    let mut probes = Vec::new();
    let mut rtts = Vec::new();
    for sample in first_sample..first_sample + samples {
        for (c, case) in cases.iter().enumerate() {
            let mut p = probe(sample, case, probe_type, sample * 1_000_000, PORT_BASE);
            p.tc_order = c as i64;
            probes.push(p);
            rtts.push(timing(c, sample));
        }
    }
    let ids = store.add_probes(&probes).unwrap();
    let analyses: Vec<Analysis> = ids
        .into_iter()
        .zip(rtts)
        .map(|(probe_id, (packet_rtt, tsval_rtt))| Analysis {
            probe_id,
            suspect: Suspect::new(),
            packet_rtt,
            tsval_rtt,
        })
        .collect();
    store.add_analyses(&analyses).unwrap();
    first_sample + samples
}
