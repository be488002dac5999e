// Resampling cache for bootstrap trials
//
// The full population for a (probe type, unusual case) pair is loaded once.
// Alongside it a short sequence of random start offsets is drawn; each draw
// without an explicit offset takes the next offset round-robin and returns a
// contiguous window that wraps around the end of the population. Reusing the
// offset sequence trades perfect independence between trials for throughput.

use super::records::ProbeType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One sample's unusual-case metrics next to the mean of the other cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub sample: i64,
    pub unusual_packet: f64,
    pub other_packet: f64,
    pub unusual_tsval: Option<f64>,
    pub other_tsval: Option<f64>,
    pub unusual_reported: f64,
    pub other_reported: f64,
}

impl Observation {
    pub fn packet_difference(&self) -> f64 {
        self.unusual_packet - self.other_packet
    }

    pub fn tsval_difference(&self) -> Option<f64> {
        Some(self.unusual_tsval? - self.other_tsval?)
    }
}

pub(crate) type CacheKey = (ProbeType, String);

struct CachedPopulation {
    population: Vec<Observation>,
    offsets: Vec<usize>,
    cursor: usize,
}

pub(crate) struct SubseriesCache {
    entries: HashMap<CacheKey, CachedPopulation>,
    rng: StdRng,
}

impl SubseriesCache {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            entries: HashMap::new(),
            rng,
        }
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn population(&self, key: &CacheKey) -> Option<&[Observation]> {
        self.entries.get(key).map(|e| e.population.as_slice())
    }

    /// Cache a non-empty population and draw its offset sequence
    pub(crate) fn insert(&mut self, key: CacheKey, population: Vec<Observation>) {
        let len = population.len();
        let count = (len / 5).max(1);
        let offsets = (0..count).map(|_| self.rng.gen_range(0..len)).collect();
        self.entries.insert(
            key,
            CachedPopulation {
                population,
                offsets,
                cursor: 0,
            },
        );
    }

    /// Window of `size` observations (clamped to the population), starting at
    /// `offset` when it is in range, otherwise at the next cached offset
    pub(crate) fn window(
        &mut self,
        key: &CacheKey,
        size: Option<usize>,
        offset: Option<usize>,
    ) -> Option<Vec<Observation>> {
        let entry = self.entries.get_mut(key)?;
        let len = entry.population.len();
        if len == 0 {
            return Some(Vec::new());
        }

        let size = size.map_or(len, |s| s.min(len));
        let start = match offset {
            Some(o) if o < len => o,
            _ => {
                let o = entry.offsets[entry.cursor];
                entry.cursor = (entry.cursor + 1) % entry.offsets.len();
                o
            }
        };

        let mut out = Vec::with_capacity(size);
        let end = (start + size).min(len);
        out.extend_from_slice(&entry.population[start..end]);
        if out.len() < size {
            out.extend_from_slice(&entry.population[..size - out.len()]);
        }
        Some(out)
    }

    pub(crate) fn reset_offsets(&mut self) {
        for entry in self.entries.values_mut() {
            entry.cursor = 0;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
