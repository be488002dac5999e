//! Property-based tests for the reduction and statistics core
//!
//! Core properties tested:
//! 1. Duplicate removal is idempotent and keeps the earliest copy
//! 2. RTT reduction never panics and flags dropped segments
//! 3. Robust estimators stay within the sample range
//! 4. Trim mode picks a most frequent value
//! 5. Probe window lookup agrees with a linear scan

use nanown::associate::ProbeIndex;
use nanown::estimators::{self, RobustEstimator};
use nanown::rtt::{analyze_packets, remove_duplicates, SuspectFlag};
use nanown::store::{Packet, ProbeWindow};
use nanown::trim::mode;
use proptest::prelude::*;

fn packet_strategy() -> impl Strategy<Value = Packet> {
    (any::<bool>(), 0i64..10_000, 0i64..4, 0i64..4, 0i64..3).prop_map(|(sent, observed, seq, ack, len)| Packet {
        probe_id: Some(1),
        sent,
        observed,
        tsval: 0,
        payload_len: len * 100,
        tcpseq: seq * 100,
        tcpack: ack * 100,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_dedup_is_idempotent(packets in prop::collection::vec(packet_strategy(), 0..40)) {
        let (once, _) = remove_duplicates(&packets);
        let (twice, flags) = remove_duplicates(&once);
        prop_assert_eq!(&once, &twice);
        prop_assert!(flags.is_empty());
    }

    #[test]
    fn prop_dedup_keeps_earliest(packets in prop::collection::vec(packet_strategy(), 0..40)) {
        let (kept, _) = remove_duplicates(&packets);
        for k in &kept {
            let earliest = packets
                .iter()
                .filter(|p| (p.sent, p.tcpseq, p.tcpack, p.payload_len) == (k.sent, k.tcpseq, k.tcpack, k.payload_len))
                .map(|p| p.observed)
                .min();
            prop_assert_eq!(Some(k.observed), earliest);
        }
    }

    #[test]
    fn prop_reduction_never_panics(
        packets in prop::collection::vec(packet_strategy(), 0..40),
        trim_sent in 0u32..6,
        trim_rcvd in 0u32..6,
    ) {
        if let Ok(reduction) = analyze_packets(1, &packets, Some(1.0), trim_sent, trim_rcvd) {
            let e = &reduction.estimate;
            prop_assert_eq!(e.sent_trimmed, trim_sent);
            if trim_sent as usize >= reduction.num_sent || trim_rcvd as usize >= reduction.num_rcvd {
                prop_assert!(e.suspect.contains(SuspectFlag::Dropped));
            }
            if e.packet_rtt < 0 {
                prop_assert!(e.suspect.contains(SuspectFlag::NegativeRtt));
            }
        }
    }

    #[test]
    fn prop_estimators_within_range(values in prop::collection::vec(-1e9f64..1e9, 1..60), distance in 0.0f64..50.0) {
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let tol = 1e-6 * (hi - lo).abs().max(1.0);
        for estimator in [
            RobustEstimator::Median,
            RobustEstimator::Midsummary { distance },
            RobustEstimator::Trimean { distance },
            RobustEstimator::Quadsummary { distance },
            RobustEstimator::Septasummary { distance },
            RobustEstimator::Ubersummary { distance },
        ] {
            let est = estimator.estimate(&values).unwrap();
            prop_assert!(est >= lo - tol && est <= hi + tol, "{:?} gave {} outside [{}, {}]", estimator, est, lo, hi);
        }
        prop_assert!(estimators::mad(&values).unwrap() >= 0.0);
    }

    #[test]
    fn prop_mode_is_most_frequent(values in prop::collection::vec(0usize..8, 1..50)) {
        let m = mode(&values).unwrap();
        let count = |v: usize| values.iter().filter(|&&x| x == v).count();
        let best = (0..8).map(count).max().unwrap();
        prop_assert_eq!(count(m), best);
        prop_assert!((0..m).all(|v| count(v) < best));
    }

    #[test]
    fn prop_lookup_matches_linear_scan(
        starts in prop::collection::vec((0i64..100_000, 1i64..5_000), 1..30),
        observed in 0i64..120_000,
    ) {
        let window_size = 2_000.0;
        let windows: Vec<ProbeWindow> = starts
            .iter()
            .enumerate()
            .map(|(i, &(time_of_day, userspace_rtt))| ProbeWindow {
                probe_id: i as i64,
                local_port: 9,
                time_of_day,
                userspace_rtt,
            })
            .collect();
        let expected = windows
            .iter()
            .filter(|w| {
                w.time_of_day <= observed
                    && ((observed - w.time_of_day - w.userspace_rtt) as f64) < window_size
            })
            .min_by_key(|w| (w.time_of_day, w.probe_id))
            .map(|w| w.probe_id);

        let index = ProbeIndex::new(windows, window_size);
        prop_assert_eq!(index.lookup(9, observed), expected);
        prop_assert_eq!(index.lookup(10, observed), None);
    }
}
