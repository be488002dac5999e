//! Measurement store: SQLite persistence plus the bootstrap resampling cache
//!
//! The store owns every persisted entity (probes, packets, per-trim candidate
//! analyses, canonical analyses, classifier results, and the single meta row).
//! In-process caches (population sizes, subseries windows) are derived from it
//! and only change when explicitly reset or cleared.
//!
//! # Thread Safety
//!
//! A `MeasurementStore` wraps one `rusqlite::Connection`, which must not be
//! shared between threads. Concurrent readers each open their own handle on
//! the same database file (see [`MeasurementStore::reopen`]); the schema is
//! created once, by the first handle that finds it missing.
//!
//! # Example
//!
//! ```no_run
//! use nanown::store::{MeasurementStore, Probe, ProbeType};
//!
//! # fn main() -> nanown::error::Result<()> {
//! let mut store = MeasurementStore::open("./probes.db", None)?;
//! store.add_probes(&[Probe {
//!     sample: 0,
//!     test_case: "valid".to_string(),
//!     probe_type: ProbeType::Train,
//!     tc_order: 0,
//!     time_of_day: 1_000_000,
//!     local_port: 40_001,
//!     reported: 250_000,
//!     userspace_rtt: 260_000,
//! }])?;
//! assert_eq!(store.population_size(ProbeType::Train)?, 1);
//! # Ok(())
//! # }
//! ```

mod records;
mod schema;
mod subseries;

pub use records::{
    Analysis, AnalysisSource, ClassifierResult, Meta, Packet, PacketRecord, Probe, ProbeType,
    ProbeWindow, TimestampPrecision, TrimAnalysis,
};
pub use subseries::Observation;

use crate::error::{NanownError, Result};
use crate::rtt::Suspect;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use subseries::SubseriesCache;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Persistent entity store with a per-handle resampling cache
pub struct MeasurementStore {
    conn: Connection,
    path: Option<PathBuf>,
    population_sizes: HashMap<ProbeType, usize>,
    subseries: SubseriesCache,
}

impl MeasurementStore {
    /// Open (creating if needed) a store backed by a database file
    ///
    /// `seed` fixes the resampling offsets drawn by [`subseries`](Self::subseries).
    pub fn open(path: impl AsRef<Path>, seed: Option<u64>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn, Some(path.to_path_buf()), seed)
    }

    /// Private in-memory store (cannot be reopened by worker threads)
    pub fn open_in_memory(seed: Option<u64>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None, seed)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>, seed: Option<u64>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn,
            path,
            population_sizes: HashMap::new(),
            subseries: SubseriesCache::new(seed),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let exists: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'probes'",
            [],
            |row| row.get(0),
        )?;
        if exists == 0 {
            self.conn.execute_batch(schema::SCHEMA_V1)?;
        }
        Ok(())
    }

    /// Another handle on the same database file, with its own connection and caches
    pub fn reopen(&self, seed: Option<u64>) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path, seed),
            None => Err(NanownError::Config(
                "an in-memory store cannot be shared with worker threads".to_string(),
            )),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ------------------------------------------------------------------
    // Probes and packets
    // ------------------------------------------------------------------

    /// Insert probes in one transaction, returning their ids
    pub fn add_probes(&mut self, probes: &[Probe]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(probes.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO probes (sample, test_case, type, tc_order, time_of_day,
                                     local_port, reported, userspace_rtt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for p in probes {
                stmt.execute(params![
                    p.sample,
                    p.test_case,
                    p.probe_type.as_str(),
                    p.tc_order,
                    p.time_of_day,
                    p.local_port,
                    p.reported,
                    p.userspace_rtt
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        self.population_sizes.clear();
        Ok(ids)
    }

    pub fn count_probes(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM probes", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn probe_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM probes ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Association windows for every stored probe
    pub fn probe_windows(&self) -> Result<Vec<ProbeWindow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, local_port, time_of_day, userspace_rtt FROM probes")?;
        let windows = stmt
            .query_map([], |row| {
                Ok(ProbeWindow {
                    probe_id: row.get(0)?,
                    local_port: row.get(1)?,
                    time_of_day: row.get(2)?,
                    userspace_rtt: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(windows)
    }

    pub fn mean_userspace_rtt(&self) -> Result<Option<f64>> {
        Ok(self
            .conn
            .query_row("SELECT avg(userspace_rtt) FROM probes", [], |row| row.get(0))?)
    }

    /// Distinct test-case labels, sorted
    pub fn test_cases(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT test_case FROM probes ORDER BY test_case")?;
        let cases = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(cases)
    }

    /// Insert packets in one transaction
    pub fn add_packets(&mut self, packets: &[Packet]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO packets (probe_id, sent, observed, tsval, payload_len, tcpseq, tcpack)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for p in packets {
                stmt.execute(params![
                    p.probe_id,
                    p.sent,
                    p.observed,
                    p.tsval,
                    p.payload_len,
                    p.tcpseq,
                    p.tcpack
                ])?;
            }
        }
        tx.commit()?;
        Ok(packets.len())
    }

    pub fn packets_for_probe(&self, probe_id: i64) -> Result<Vec<Packet>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT probe_id, sent, observed, tsval, payload_len, tcpseq, tcpack
             FROM packets WHERE probe_id = ?1",
        )?;
        let packets = stmt
            .query_map([probe_id], |row| {
                Ok(Packet {
                    probe_id: row.get(0)?,
                    sent: row.get(1)?,
                    observed: row.get(2)?,
                    tsval: row.get(3)?,
                    payload_len: row.get(4)?,
                    tcpseq: row.get(5)?,
                    tcpack: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(packets)
    }

    pub fn count_unassociated_packets(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM packets WHERE probe_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ------------------------------------------------------------------
    // Analyses
    // ------------------------------------------------------------------

    pub fn clear_trim_analyses(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM trim_analysis", [])?;
        Ok(())
    }

    /// Insert candidate analyses in one transaction
    pub fn add_trim_analyses(&mut self, analyses: &[TrimAnalysis]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trim_analysis
                   (probe_id, suspect, packet_rtt, tsval_rtt, sent_trimmed, rcvd_trimmed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for a in analyses {
                let e = &a.estimate;
                stmt.execute(params![
                    a.probe_id,
                    e.suspect.to_db(),
                    e.packet_rtt,
                    e.tsval_rtt,
                    e.sent_trimmed,
                    e.rcvd_trimmed
                ])?;
            }
        }
        tx.commit()?;
        Ok(analyses.len())
    }

    /// Insert canonical analyses, skipping probes that already have one
    pub fn add_analyses(&mut self, analyses: &[Analysis]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO analysis (probe_id, suspect, packet_rtt, tsval_rtt)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for a in analyses {
                inserted += stmt.execute(params![
                    a.probe_id,
                    a.suspect.to_db(),
                    a.packet_rtt,
                    a.tsval_rtt
                ])?;
            }
        }
        tx.commit()?;
        self.subseries.clear();
        Ok(inserted)
    }

    /// Copy one trim setting's candidates into the canonical table
    /// (insert-if-absent), returning the number of new canonical rows
    pub fn commit_trim_selection(&mut self, sent_trimmed: u32, rcvd_trimmed: u32) -> Result<usize> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO analysis (probe_id, suspect, packet_rtt, tsval_rtt)
             SELECT probe_id, suspect, packet_rtt, tsval_rtt FROM trim_analysis
             WHERE sent_trimmed = ?1 AND rcvd_trimmed = ?2",
            params![sent_trimmed, rcvd_trimmed],
        )?;
        self.subseries.clear();
        Ok(inserted)
    }

    pub fn analyses(&self) -> Result<Vec<Analysis>> {
        let mut stmt = self.conn.prepare(
            "SELECT probe_id, suspect, packet_rtt, tsval_rtt FROM analysis ORDER BY probe_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Analysis {
                    probe_id: row.get(0)?,
                    suspect: Suspect::from_db(row.get(1)?),
                    packet_rtt: row.get(2)?,
                    tsval_rtt: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn source_sql(source: AnalysisSource, alias: &str) -> (&'static str, String) {
        match source {
            AnalysisSource::Canonical => ("analysis", "1 = 1".to_string()),
            AnalysisSource::Trim {
                sent_trimmed,
                rcvd_trimmed,
            } => (
                "trim_analysis",
                format!(
                    "{alias}.sent_trimmed = {sent_trimmed} AND {alias}.rcvd_trimmed = {rcvd_trimmed}"
                ),
            ),
        }
    }

    /// `packet_rtt` values of `train` and `test` probes, grouped by test case
    pub fn packet_rtts_by_case(&self, source: AnalysisSource) -> Result<BTreeMap<String, Vec<f64>>> {
        let (table, cond) = Self::source_sql(source, "x");
        let sql = format!(
            "SELECT p.test_case, x.packet_rtt FROM probes p JOIN {table} x ON x.probe_id = p.id
             WHERE p.type IN ('train', 'test') AND {cond}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let case: String = row.get(0)?;
            let rtt: i64 = row.get(1)?;
            out.entry(case).or_default().push(rtt as f64);
        }
        Ok(out)
    }

    /// Per-sample `unusual packet_rtt - mean(other cases' packet_rtt)` over
    /// `train` and `test` probes
    pub fn packet_rtt_differences(
        &self,
        unusual_case: &str,
        source: AnalysisSource,
    ) -> Result<Vec<f64>> {
        let (table, u_cond) = Self::source_sql(source, "ua");
        let (_, o_cond) = Self::source_sql(source, "oa");
        let sql = format!(
            "SELECT ua.packet_rtt - (
                 SELECT avg(oa.packet_rtt) FROM probes o JOIN {table} oa ON oa.probe_id = o.id
                 WHERE {o_cond} AND o.test_case != ?1 AND o.sample = u.sample AND o.type = u.type)
             FROM probes u JOIN {table} ua ON ua.probe_id = u.id
             WHERE {u_cond} AND u.test_case = ?1 AND u.type IN ('train', 'test')"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let diffs = stmt
            .query_map([unusual_case], |row| row.get::<_, Option<f64>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(diffs.into_iter().flatten().collect())
    }

    // ------------------------------------------------------------------
    // Resampling
    // ------------------------------------------------------------------

    /// Largest per-test-case probe count for a probe type (cached)
    pub fn population_size(&mut self, probe_type: ProbeType) -> Result<usize> {
        if let Some(&n) = self.population_sizes.get(&probe_type) {
            return Ok(n);
        }
        let n: Option<i64> = self.conn.query_row(
            "SELECT max(c) FROM (SELECT count(sample) c FROM probes WHERE type = ?1 GROUP BY test_case)",
            [probe_type.as_str()],
            |row| row.get(0),
        )?;
        let n = n.unwrap_or(0) as usize;
        self.population_sizes.insert(probe_type, n);
        Ok(n)
    }

    fn load_population(&self, probe_type: ProbeType, unusual_case: &str) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.sample, ua.packet_rtt, ua.tsval_rtt, u.reported,
                    (SELECT avg(a.packet_rtt) FROM probes o JOIN analysis a ON a.probe_id = o.id
                     WHERE o.test_case != ?1 AND o.type = ?2 AND o.sample = u.sample),
                    (SELECT avg(a.tsval_rtt) FROM probes o JOIN analysis a ON a.probe_id = o.id
                     WHERE o.test_case != ?1 AND o.type = ?2 AND o.sample = u.sample),
                    (SELECT avg(o.reported) FROM probes o JOIN analysis a ON a.probe_id = o.id
                     WHERE o.test_case != ?1 AND o.type = ?2 AND o.sample = u.sample)
             FROM probes u JOIN analysis ua ON ua.probe_id = u.id
             WHERE u.test_case = ?1 AND u.type = ?2
             ORDER BY u.sample",
        )?;
        let rows = stmt
            .query_map(params![unusual_case, probe_type.as_str()], |row| {
                let other_packet: Option<f64> = row.get(4)?;
                let other_reported: Option<f64> = row.get(6)?;
                Ok(match (other_packet, other_reported) {
                    (Some(other_packet), Some(other_reported)) => Some(Observation {
                        sample: row.get(0)?,
                        unusual_packet: row.get::<_, i64>(1)? as f64,
                        other_packet,
                        unusual_tsval: row.get::<_, Option<i64>>(2)?.map(|v| v as f64),
                        other_tsval: row.get(5)?,
                        unusual_reported: row.get::<_, i64>(3)? as f64,
                        other_reported,
                    }),
                    _ => None,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total = rows.len();
        let population: Vec<Observation> = rows.into_iter().flatten().collect();
        if population.len() < total {
            tracing::debug!(
                probe_type = %probe_type,
                unusual_case,
                skipped = total - population.len(),
                "samples without a comparison case left out of population"
            );
        }
        Ok(population)
    }

    /// A window of the cached population for `(probe_type, unusual_case)`
    ///
    /// `size` is clamped to the population; without a valid `offset` the next
    /// pre-drawn random offset is used and the window wraps around.
    ///
    /// # Errors
    ///
    /// `EmptyPopulation` when no sample of that type has both the unusual case
    /// and at least one other case analyzed.
    pub fn subseries(
        &mut self,
        probe_type: ProbeType,
        unusual_case: &str,
        size: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Observation>> {
        let key = (probe_type, unusual_case.to_string());
        if !self.subseries.contains(&key) {
            let population = self.load_population(probe_type, unusual_case)?;
            if population.is_empty() {
                return Err(NanownError::EmptyPopulation {
                    probe_type: probe_type.to_string(),
                    unusual_case: unusual_case.to_string(),
                });
            }
            self.subseries.insert(key.clone(), population);
        }
        self.subseries
            .window(&key, size, offset)
            .ok_or_else(|| NanownError::EmptyPopulation {
                probe_type: probe_type.to_string(),
                unusual_case: unusual_case.to_string(),
            })
    }

    /// The whole cached population, in sample order
    pub fn full_population(
        &mut self,
        probe_type: ProbeType,
        unusual_case: &str,
    ) -> Result<Vec<Observation>> {
        let key = (probe_type, unusual_case.to_string());
        self.subseries(probe_type, unusual_case, None, Some(0))?;
        Ok(self
            .subseries
            .population(&key)
            .map(<[Observation]>::to_vec)
            .unwrap_or_default())
    }

    /// Restart every cached offset sequence from its beginning
    pub fn reset_offsets(&mut self) {
        self.subseries.reset_offsets();
    }

    /// Forget cached populations (new offsets are drawn on next use)
    pub fn clear_cache(&mut self) {
        self.subseries.clear();
        self.population_sizes.clear();
    }

    // ------------------------------------------------------------------
    // Classifier results
    // ------------------------------------------------------------------

    pub fn add_classifier_result(&mut self, result: &ClassifierResult) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO classifier_results
               (classifier, trial_type, num_observations, num_trials, params,
                false_positives, false_negatives)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.classifier,
                result.trial_type.as_str(),
                result.num_observations as i64,
                result.num_trials as i64,
                result.params,
                result.false_positives,
                result.false_negatives
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Lowest total-error result for a configuration
    pub fn best_classifier_result(
        &self,
        classifier: &str,
        trial_type: ProbeType,
        num_observations: usize,
        params: Option<&str>,
    ) -> Result<Option<ClassifierResult>> {
        let row = self
            .conn
            .query_row(
                "SELECT classifier, trial_type, num_observations, num_trials, params,
                        false_positives, false_negatives
                 FROM classifier_results
                 WHERE classifier = ?1 AND trial_type = ?2 AND num_observations = ?3
                   AND (?4 IS NULL OR params = ?4)
                 ORDER BY false_positives + false_negatives
                 LIMIT 1",
                params![classifier, trial_type.as_str(), num_observations as i64, params],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(classifier, trial_type, n, trials, params, fp, fneg)| -> Result<ClassifierResult> {
            Ok(ClassifierResult {
                classifier,
                trial_type: trial_type.parse()?,
                num_observations: n as usize,
                num_trials: trials as usize,
                params,
                false_positives: fp,
                false_negatives: fneg,
            })
        })
        .transpose()
    }

    pub fn delete_classifier_results(
        &mut self,
        classifier: &str,
        trial_type: ProbeType,
        num_observations: Option<usize>,
    ) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM classifier_results
             WHERE classifier = ?1 AND trial_type = ?2
               AND (?3 IS NULL OR num_observations = ?3)",
            params![
                classifier,
                trial_type.as_str(),
                num_observations.map(|n| n as i64)
            ],
        )?)
    }

    // ------------------------------------------------------------------
    // Meta
    // ------------------------------------------------------------------

    pub fn meta(&self) -> Result<Option<Meta>> {
        let row = self
            .conn
            .query_row(
                "SELECT tcpts_mean, tcpts_stddev, tcpts_slopes, unusual_case, greater
                 FROM meta WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<bool>>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(mean, stddev, slopes, unusual_case, greater)| -> Result<Meta> {
            let tcpts = match mean {
                Some(mean) => Some(TimestampPrecision {
                    mean,
                    stddev,
                    slopes: match slopes {
                        Some(json) => serde_json::from_str(&json)?,
                        None => Vec::new(),
                    },
                }),
                None => None,
            };
            Ok(Meta {
                tcpts,
                unusual_case,
                greater,
            })
        })
        .transpose()
    }

    /// Record the timestamp-precision measurement (None: measured, unusable)
    pub fn set_timestamp_precision(&mut self, precision: Option<&TimestampPrecision>) -> Result<()> {
        let slopes = precision.map(|p| serde_json::to_string(&p.slopes)).transpose()?;
        self.conn.execute(
            "INSERT INTO meta (id, tcpts_mean, tcpts_stddev, tcpts_slopes) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET tcpts_mean = excluded.tcpts_mean,
                                           tcpts_stddev = excluded.tcpts_stddev,
                                           tcpts_slopes = excluded.tcpts_slopes",
            params![
                precision.map(|p| p.mean),
                precision.and_then(|p| p.stddev),
                slopes
            ],
        )?;
        Ok(())
    }

    /// Nanoseconds per tsval tick
    ///
    /// # Errors
    ///
    /// `MissingTimestampPrecision` when the measurement was never recorded.
    /// `Ok(None)` means it was recorded but produced no usable slope.
    pub fn timestamp_precision(&self) -> Result<Option<f64>> {
        match self.meta()? {
            Some(meta) => Ok(meta.tcpts.map(|t| t.mean)),
            None => Err(NanownError::MissingTimestampPrecision),
        }
    }

    pub fn set_unusual_case(&mut self, unusual_case: &str, greater: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (id, unusual_case, greater) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET unusual_case = excluded.unusual_case,
                                           greater = excluded.greater",
            params![unusual_case, greater],
        )?;
        Ok(())
    }

    /// Stored `(unusual_case, greater)`, if both are set
    pub fn unusual_case(&self) -> Result<Option<(String, bool)>> {
        Ok(self
            .meta()?
            .and_then(|m| Some((m.unusual_case?, m.greater?))))
    }
}
