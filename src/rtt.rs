//! Per-probe RTT reduction
//!
//! Turns the packets associated with one probe into a single round-trip-time
//! estimate. The reference points are the `trim_sent`-th earliest sent payload
//! segment and the `trim_rcvd`-th latest received payload segment; trimming
//! deeper discards segments whose timing is dominated by scheduling noise.
//!
//! Anomalies never abort the reduction. They are recorded as compact flags:
//!
//! | flag | meaning                                        |
//! |------|------------------------------------------------|
//! | `s`  | duplicate sent segment removed                 |
//! | `r`  | duplicate received segment removed             |
//! | `d`  | trim depth exceeded the segments present       |
//! | `R`  | received segments arrived out of order         |
//! | `N`  | negative packet or tsval RTT                   |

use crate::error::{NanownError, Result};
use crate::store::Packet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One anomaly code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspectFlag {
    DuplicateSent,
    DuplicateReceived,
    Dropped,
    Reordered,
    NegativeRtt,
}

impl SuspectFlag {
    pub fn code(self) -> char {
        match self {
            SuspectFlag::DuplicateSent => 's',
            SuspectFlag::DuplicateReceived => 'r',
            SuspectFlag::Dropped => 'd',
            SuspectFlag::Reordered => 'R',
            SuspectFlag::NegativeRtt => 'N',
        }
    }
}

/// Ordered set of anomaly codes, stored as a short string (each code at most once)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect(String);

impl Suspect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, flag: SuspectFlag) {
        if !self.contains(flag) {
            self.0.push(flag.code());
        }
    }

    pub fn contains(&self, flag: SuspectFlag) -> bool {
        self.0.contains(flag.code())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// NULL in the store when nothing is suspect
    pub fn to_db(&self) -> Option<&str> {
        if self.0.is_empty() {
            None
        } else {
            Some(&self.0)
        }
    }

    pub fn from_db(value: Option<String>) -> Self {
        Suspect(value.unwrap_or_default())
    }
}

impl fmt::Display for Suspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RTT result for one probe under one trim setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttEstimate {
    pub packet_rtt: i64,
    pub tsval_rtt: Option<i64>,
    pub suspect: Suspect,
    pub sent_trimmed: u32,
    pub rcvd_trimmed: u32,
}

/// Reduction output plus the payload segment counts used to size the trim search
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReduction {
    pub estimate: RttEstimate,
    pub num_sent: usize,
    pub num_rcvd: usize,
}

type DedupKey = (bool, i64, i64, i64);

/// Remove duplicate segments, keeping the earliest-observed copy of each
/// (direction, seq, ack, payload length) tuple
pub fn remove_duplicates(packets: &[Packet]) -> (Vec<Packet>, Suspect) {
    let mut suspect = Suspect::new();
    let mut kept: Vec<Packet> = Vec::with_capacity(packets.len());
    let mut index: HashMap<DedupKey, usize> = HashMap::with_capacity(packets.len());

    for p in packets {
        let key = (p.sent, p.tcpseq, p.tcpack, p.payload_len);
        match index.get(&key) {
            Some(&i) => {
                suspect.push(if p.sent {
                    SuspectFlag::DuplicateSent
                } else {
                    SuspectFlag::DuplicateReceived
                });
                if p.observed < kept[i].observed {
                    kept[i] = p.clone();
                }
            }
            None => {
                index.insert(key, kept.len());
                kept.push(p.clone());
            }
        }
    }

    (kept, suspect)
}

fn by_time_then_seq(a: &&Packet, b: &&Packet) -> std::cmp::Ordering {
    (a.observed, a.tcpseq).cmp(&(b.observed, b.tcpseq))
}

/// Reduce one probe's packets to an RTT estimate
///
/// `timestamp_precision` is the nanoseconds-per-tsval-tick scale; without it
/// no tsval RTT is produced.
///
/// # Errors
///
/// `InsufficientPackets` when no sent or no received payload segment exists.
pub fn analyze_packets(
    probe_id: i64,
    packets: &[Packet],
    timestamp_precision: Option<f64>,
    trim_sent: u32,
    trim_rcvd: u32,
) -> Result<ProbeReduction> {
    let (packets, mut suspect) = remove_duplicates(packets);

    let mut sent: Vec<&Packet> = packets
        .iter()
        .filter(|p| p.sent && p.payload_len > 0)
        .collect();
    let mut rcvd: Vec<&Packet> = packets
        .iter()
        .filter(|p| !p.sent && p.payload_len > 0)
        .collect();
    sent.sort_by(by_time_then_seq);
    rcvd.sort_by(by_time_then_seq);

    if sent.is_empty() {
        return Err(NanownError::InsufficientPackets {
            probe_id,
            direction: "sent",
        });
    }
    if rcvd.is_empty() {
        return Err(NanownError::InsufficientPackets {
            probe_id,
            direction: "received",
        });
    }

    let trim_sent_idx = trim_sent as usize;
    let last_sent = match sent.get(trim_sent_idx) {
        Some(p) => *p,
        None => {
            suspect.push(SuspectFlag::Dropped);
            sent[sent.len() - 1]
        }
    };

    let trim_rcvd_idx = trim_rcvd as usize;
    let rcvd_idx = if trim_rcvd_idx < rcvd.len() {
        rcvd.len() - 1 - trim_rcvd_idx
    } else {
        suspect.push(SuspectFlag::Dropped);
        0
    };
    let last_rcvd = rcvd[rcvd_idx];

    let mut rcvd_by_seq = rcvd.clone();
    rcvd_by_seq.sort_by(|a, b| (a.tcpseq, a.observed).cmp(&(b.tcpseq, b.observed)));
    if rcvd_by_seq[rcvd_idx] != last_rcvd {
        suspect.push(SuspectFlag::Reordered);
    }

    let packet_rtt = last_rcvd.observed - last_sent.observed;

    let last_sent_ack = packets
        .iter()
        .filter(|p| !p.sent && p.payload_len + last_sent.tcpseq >= p.tcpack)
        .min_by_key(|p| p.observed);

    let tsval_rtt = match (timestamp_precision, last_sent_ack) {
        (Some(scale), Some(ack)) => {
            Some(((last_rcvd.tsval - ack.tsval) as f64 * scale).round() as i64)
        }
        _ => None,
    };

    if packet_rtt < 0 || tsval_rtt.is_some_and(|t| t < 0) {
        suspect.push(SuspectFlag::NegativeRtt);
    }

    Ok(ProbeReduction {
        estimate: RttEstimate {
            packet_rtt,
            tsval_rtt,
            suspect,
            sent_trimmed: trim_sent,
            rcvd_trimmed: trim_rcvd,
        },
        num_sent: sent.len(),
        num_rcvd: rcvd.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(sent: bool, observed: i64, seq: i64, ack: i64, len: i64, tsval: i64) -> Packet {
        Packet {
            probe_id: Some(1),
            sent,
            observed,
            tsval,
            payload_len: len,
            tcpseq: seq,
            tcpack: ack,
        }
    }

    /// Request split over two sent segments, ACK, then a two-segment response
    fn exchange() -> Vec<Packet> {
        vec![
            pkt(true, 1_000, 100, 500, 10, 1),
            pkt(true, 2_000, 110, 500, 10, 1),
            pkt(false, 2_500, 500, 120, 0, 7),
            pkt(false, 9_000, 500, 120, 100, 9),
            pkt(false, 9_500, 600, 120, 100, 10),
        ]
    }

    #[test]
    fn test_untrimmed_reduction() {
        let r = analyze_packets(1, &exchange(), Some(1_000.0), 0, 0).unwrap();
        assert_eq!(r.estimate.packet_rtt, 9_500 - 1_000);
        // bare ACK 120 lies past 100 + 0; first response segment (tsval 9) matches
        assert_eq!(r.estimate.tsval_rtt, Some(1_000));
        assert!(r.estimate.suspect.is_empty());
        assert_eq!((r.num_sent, r.num_rcvd), (2, 2));
    }

    #[test]
    fn test_tsval_rtt_uses_earliest_matching_ack() {
        let mut packets = exchange();
        packets.push(pkt(false, 2_200, 500, 100, 0, 5));
        let r = analyze_packets(1, &packets, Some(1_000.0), 0, 0).unwrap();
        assert_eq!(r.estimate.tsval_rtt, Some(5_000));
        assert_eq!(r.estimate.packet_rtt, 9_500 - 1_000);
    }

    #[test]
    fn test_tsval_rtt_absent_without_matching_ack() {
        let packets = vec![
            pkt(true, 1_000, 100, 500, 10, 1),
            pkt(false, 2_000, 500, 300, 50, 4),
        ];
        let r = analyze_packets(1, &packets, Some(1_000.0), 0, 0).unwrap();
        assert_eq!(r.estimate.tsval_rtt, None);
        assert_eq!(r.estimate.packet_rtt, 1_000);
    }

    #[test]
    fn test_trimmed_reduction() {
        let r = analyze_packets(1, &exchange(), None, 1, 1).unwrap();
        assert_eq!(r.estimate.packet_rtt, 9_000 - 2_000);
        assert_eq!(r.estimate.tsval_rtt, None);
        assert_eq!((r.estimate.sent_trimmed, r.estimate.rcvd_trimmed), (1, 1));
    }

    #[test]
    fn test_trim_beyond_segments_flags_dropped() {
        let r = analyze_packets(1, &exchange(), None, 5, 5).unwrap();
        assert!(r.estimate.suspect.contains(SuspectFlag::Dropped));
        // falls back to last sent and first received
        assert_eq!(r.estimate.packet_rtt, 9_000 - 2_000);
    }

    #[test]
    fn test_duplicate_sent_keeps_earliest() {
        let mut packets = exchange();
        packets.push(pkt(true, 500, 100, 500, 10, 1));
        let (deduped, suspect) = remove_duplicates(&packets);
        assert_eq!(deduped.len(), 5);
        assert!(suspect.contains(SuspectFlag::DuplicateSent));
        assert!(!suspect.contains(SuspectFlag::DuplicateReceived));
        assert!(deduped.iter().any(|p| p.sent && p.observed == 500));
        assert!(!deduped.iter().any(|p| p.sent && p.observed == 1_000));

        let r = analyze_packets(1, &packets, None, 0, 0).unwrap();
        assert_eq!(r.estimate.packet_rtt, 9_500 - 500);
        assert_eq!(r.estimate.suspect.as_str(), "s");
    }

    #[test]
    fn test_duplicate_received_flagged() {
        let mut packets = exchange();
        packets.push(pkt(false, 9_900, 600, 120, 100, 10));
        let r = analyze_packets(1, &packets, None, 0, 0).unwrap();
        assert!(r.estimate.suspect.contains(SuspectFlag::DuplicateReceived));
        assert_eq!(r.estimate.packet_rtt, 9_500 - 1_000);
    }

    #[test]
    fn test_reordering_flagged() {
        let mut packets = exchange();
        // later sequence number observed first
        packets[3].observed = 9_600;
        let r = analyze_packets(1, &packets, None, 0, 0).unwrap();
        assert!(r.estimate.suspect.contains(SuspectFlag::Reordered));
        assert_eq!(r.estimate.packet_rtt, 9_600 - 1_000);
    }

    #[test]
    fn test_negative_rtt_flagged() {
        let packets = vec![
            pkt(true, 5_000, 100, 500, 10, 1),
            pkt(false, 4_000, 500, 110, 50, 1),
        ];
        let r = analyze_packets(1, &packets, None, 0, 0).unwrap();
        assert_eq!(r.estimate.packet_rtt, -1_000);
        assert_eq!(r.estimate.suspect.as_str(), "N");
    }

    #[test]
    fn test_missing_direction_is_insufficient() {
        let only_sent = vec![pkt(true, 1, 1, 1, 10, 0)];
        let err = analyze_packets(3, &only_sent, None, 0, 0).unwrap_err();
        assert!(err.is_per_probe());

        // pure ACKs carry no payload
        let no_payload = vec![pkt(true, 1, 1, 1, 10, 0), pkt(false, 2, 1, 11, 0, 0)];
        assert!(analyze_packets(3, &no_payload, None, 0, 0).is_err());
    }

    #[test]
    fn test_suspect_db_roundtrip_of_empty() {
        let s = Suspect::new();
        assert_eq!(s.to_db(), None);
        assert_eq!(Suspect::from_db(None), s);
        let mut s = Suspect::new();
        s.push(SuspectFlag::Reordered);
        s.push(SuspectFlag::Reordered);
        assert_eq!(s.to_db(), Some("R"));
    }
}
