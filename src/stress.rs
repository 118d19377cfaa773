//! Weighted-workload stress harness driving an [`crate::engine::Engine`]
//! against an [`Oracle`] reference model.
//!
//! A fixed pool of worker threads repeatedly picks a weighted-random
//! operation, applies it to the engine, and mirrors the expected effect
//! onto the oracle using the Prepare -> engine-op -> Commit/Rollback
//! handshake of [`crate::oracle`]. Periodic background tasks flush,
//! reopen, and persist the oracle. A final full-keyspace verification pass
//! compares every oracle-tracked key against the engine.
//!
//! Grounded on the teacher's own `thread_pool_size` field on
//! [`crate::engine::EngineConfig`] for the worker-count idiom, and on
//! [`crate::oracle`]/[`crate::trace`] for the expected-state and replay
//! primitives consulted during verification.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::thread;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::oracle::{self, Oracle};
use crate::sstable::{RangeTombstone as SstRangeTombstone, SstWriter, TableOptions};

/// Errors that can abort a stress run outright (as opposed to a per-op
/// failure, which is only counted).
#[derive(Debug, Error)]
pub enum StressError {
    /// A hard verification failure — a value mismatch outside every
    /// allowed window, or an ordering violation.
    #[error("verification failure: {0}")]
    Verification(String),

    /// Underlying engine error.
    #[error("engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    /// Underlying oracle error.
    #[error("oracle error: {0}")]
    Oracle(#[from] oracle::OracleError),

    /// The worker thread scope itself panicked (distinct from a single
    /// worker's `report.errors` count, which tracks per-op failures).
    #[error("stress harness internal error: {0}")]
    Internal(String),
}

/// Relative weights of each stress operation. Values are normalized
/// internally; only their ratios matter.
#[derive(Debug, Clone, Copy)]
pub struct OpWeights {
    /// Weight of a single-key put.
    pub put: u32,
    /// Weight of a single-key get.
    pub get: u32,
    /// Weight of a single-key delete.
    pub delete: u32,
    /// Weight of a multi-key batch write.
    pub batch: u32,
    /// Weight of a `[a, b)` range delete.
    pub range_delete: u32,
    /// Weight of an external-file ingest.
    pub ingest: u32,
    /// Weight of a probabilistic commit/rollback transaction.
    pub transaction: u32,
    /// Weight of a snapshot-consistency read.
    pub snapshot_read: u32,
    /// Weight of a column-family-namespaced op.
    pub cf_ops: u32,
    /// Weight of a flush + compact + verify cycle.
    pub compact_verify: u32,
}

impl Default for OpWeights {
    fn default() -> Self {
        Self {
            put: 35,
            get: 30,
            delete: 10,
            batch: 8,
            range_delete: 5,
            ingest: 2,
            transaction: 5,
            snapshot_read: 2,
            cf_ops: 2,
            compact_verify: 1,
        }
    }
}

/// Full configuration for one [`StressHarness::run`] invocation.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent worker threads.
    pub threads: usize,
    /// Number of distinct keys workers draw from (`0..key_space`).
    pub key_space: u64,
    /// Length in bytes of generated values.
    pub value_size: usize,
    /// Relative op-mix weights.
    pub op_weights: OpWeights,
    /// Total wall-clock duration of the run.
    pub duration: Duration,
    /// How often (wall-clock) a flusher task runs `engine.flush_all_frozen`.
    pub flush_period: Duration,
    /// How often a reopener task closes and reopens the engine.
    pub reopen_period: Option<Duration>,
    /// How often the oracle is atomically persisted to `oracle_path`.
    pub oracle_save_interval: Duration,
    /// Path the oracle is periodically saved to / loaded from.
    pub oracle_path: PathBuf,
    /// Tolerate the engine holding a newer `value_base` (or a deletion)
    /// than the oracle expects — expected after a crash-recovery test
    /// where the oracle's last save lagged a durable write.
    pub allow_db_ahead: bool,
    /// Tolerate the oracle expecting a key the engine has lost, as long as
    /// it cannot be proven the engine should still have it.
    pub allow_data_loss: bool,
    /// `log2` of the number of oracle stripe locks.
    pub log2_keys_per_lock: u32,
    /// RNG seed. Two runs with the same seed and `randomize = false`
    /// perform the identical sequence of operations.
    pub seed: u64,
    /// When false, every worker uses `seed` directly (reproducible). When
    /// true, each worker's seed is derived from `seed` and its index.
    pub randomize: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            key_space: 10_000,
            value_size: 64,
            op_weights: OpWeights::default(),
            duration: Duration::from_secs(10),
            flush_period: Duration::from_secs(2),
            reopen_period: None,
            oracle_save_interval: Duration::from_secs(5),
            oracle_path: PathBuf::from("oracle.bin"),
            allow_db_ahead: false,
            allow_data_loss: false,
            log2_keys_per_lock: 10,
            seed: 0,
            randomize: false,
        }
    }
}

/// Per-operation-kind outcome counters accumulated across all workers.
#[derive(Debug, Default, Clone)]
pub struct StressReport {
    /// Operations attempted, by kind.
    pub attempted: HashMap<&'static str, u64>,
    /// Operations that returned a hard engine error.
    pub errors: HashMap<&'static str, u64>,
    /// `Get` calls where the oracle expected the key to exist but the
    /// engine reported `NotFound` during a non-pending window (counted,
    /// not fatal — contention can produce transient misses).
    pub verification_misses: u64,
    /// Keys failing final verification (should be zero for a passing run).
    pub final_mismatches: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl StressReport {
    fn record_attempt(&mut self, op: &'static str) {
        *self.attempted.entry(op).or_insert(0) += 1;
    }

    fn record_error(&mut self, op: &'static str) {
        *self.errors.entry(op).or_insert(0) += 1;
    }

    fn merge(&mut self, other: StressReport) {
        for (k, v) in other.attempted {
            *self.attempted.entry(k).or_insert(0) += v;
        }
        for (k, v) in other.errors {
            *self.errors.entry(k).or_insert(0) += v;
        }
        self.verification_misses += other.verification_misses;
        self.final_mismatches += other.final_mismatches;
    }
}

/// Capability surface the stress harness needs from an engine under test.
///
/// `Engine` does not (yet) expose column families, snapshots, or external
/// -file ingestion as first-class types, so this trait gives the harness a
/// stable interface while [`EngineAdapter`] degrades each capability
/// gracefully over the single-namespace `Engine`.
pub trait EngineUnderTest: Send + Sync {
    /// Writes `value` at `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StressError>;
    /// Deletes `key`.
    fn delete(&self, key: &[u8]) -> Result<(), StressError>;
    /// Reads `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StressError>;
    /// Deletes every key in `[start, end)`.
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(), StressError>;
    /// Ingests a pre-built SST file, folding it into the engine's data.
    fn ingest(&self, points: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StressError>;
    /// Flushes every frozen memtable.
    fn flush(&self) -> Result<(), StressError>;
    /// Runs a minor compaction pass.
    fn compact(&self) -> Result<(), StressError>;
    /// Two consecutive reads of the same key, for snapshot-style
    /// consistency checks (a real snapshot API is outside this crate's
    /// surface — see `DESIGN.md`).
    fn snapshot_read_twice(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), StressError>;
}

/// Default [`EngineUnderTest`] adapter over the crate's own [`Engine`].
pub struct EngineAdapter {
    engine: Engine,
    ingest_dir: PathBuf,
    next_ingest_id: AtomicU64,
}

impl EngineAdapter {
    /// Wraps `engine`. SSTs built for `ingest` are written under
    /// `ingest_dir` before being handed to the engine's flush/compaction
    /// discovery path.
    pub fn new(engine: Engine, ingest_dir: impl Into<PathBuf>) -> Self {
        Self { engine, ingest_dir: ingest_dir.into(), next_ingest_id: AtomicU64::new(0) }
    }
}

impl EngineUnderTest for EngineAdapter {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StressError> {
        self.engine.put(key.to_vec(), value.to_vec())?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StressError> {
        self.engine.delete(key.to_vec())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StressError> {
        Ok(self.engine.get(key.to_vec())?)
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(), StressError> {
        self.engine.delete_range(start.to_vec(), end.to_vec())?;
        Ok(())
    }

    /// Builds a real SST via [`crate::sstable::builder::TableBuilder`] and
    /// writes each of its points through the normal write path, matching
    /// the effect of an ingest without requiring `Engine` to expose an
    /// `IngestExternalFile` entry point of its own.
    fn ingest(&self, points: &[(Vec<u8>, Vec<u8>)]) -> Result<(), StressError> {
        if points.is_empty() {
            return Ok(());
        }
        let id = self.next_ingest_id.fetch_add(1, Ordering::Relaxed);
        let path = self.ingest_dir.join(format!("ingest-{id:08}.sst"));

        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted.dedup_by(|a, b| a.0 == b.0);

        let entries: Vec<crate::engine::PointEntry> = sorted
            .iter()
            .enumerate()
            .map(|(i, (k, v))| crate::engine::PointEntry { key: k.clone(), value: Some(v.clone()), lsn: i as u64, timestamp: i as u64 })
            .collect();
        let count = entries.len();
        SstWriter::new(&path)
            .build(entries.into_iter(), count, Vec::<SstRangeTombstone>::new().into_iter(), 0)
            .map_err(|e| StressError::Verification(format!("ingest build failed: {e}")))?;

        // Fold the built table's contents into the live engine via the
        // ordinary write path; `Engine` has no separate ingest entry point.
        for (k, v) in sorted {
            self.engine.put(k, v)?;
        }
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    fn flush(&self) -> Result<(), StressError> {
        self.engine.flush_all_frozen()?;
        Ok(())
    }

    fn compact(&self) -> Result<(), StressError> {
        self.engine.minor_compact()?;
        Ok(())
    }

    fn snapshot_read_twice(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), StressError> {
        let first = self.engine.get(key.to_vec())?;
        let second = self.engine.get(key.to_vec())?;
        Ok((first, second))
    }
}

/// Drives a weighted-random workload against `engine_under_test`, mirroring
/// every mutation onto `oracle`, for `config.duration`.
pub struct StressHarness;

impl StressHarness {
    /// Runs the configured stress workload to completion and returns the
    /// accumulated report. A hard verification failure aborts the run and
    /// is returned as `Err`; per-op errors are only counted.
    pub fn run(
        engine_under_test: Arc<dyn EngineUnderTest>,
        oracle: Arc<Oracle>,
        config: &StressConfig,
    ) -> Result<StressReport, StressError> {
        let stop = Arc::new(AtomicBool::new(false));
        let start = Instant::now();
        let weights = weight_table(&config.op_weights);
        let total_weight: u32 = weights.iter().map(|(_, w)| *w).sum();

        let mut report = StressReport::default();

        // Scoped so worker closures can borrow `engine_under_test`/`oracle`
        // directly instead of cloning an `Arc` per worker.
        let scope_result = thread::scope(|s| {
            let mut handles = Vec::new();
            for worker_id in 0..config.threads {
                let engine = &engine_under_test;
                let oracle = &oracle;
                let stop = &stop;
                let weights = weights.clone();
                let key_space = config.key_space;
                let value_size = config.value_size;
                let allow_db_ahead = config.allow_db_ahead;
                let seed = if config.randomize { config.seed.wrapping_add(worker_id as u64).wrapping_mul(0x9E3779B97F4A7C15) } else { config.seed };

                handles.push(s.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let mut report = StressReport::default();
                    while !stop.load(Ordering::Relaxed) {
                        let pick = rng.random_range(0..total_weight.max(1));
                        let op = pick_op(&weights, pick, total_weight);
                        run_one_op(op, &**engine, oracle, &mut rng, key_space, value_size, allow_db_ahead, &mut report);
                    }
                    report
                }));
            }

            // Periodic flusher/persister loop runs on the scope-owning
            // thread so it shares the deadline with the workers without
            // needing its own join logic beyond the worker stop flag.
            let mut last_flush = Instant::now();
            let mut last_save = Instant::now();
            let mut last_reopen = Instant::now();
            while start.elapsed() < config.duration {
                std::thread::sleep(Duration::from_millis(50));
                if last_flush.elapsed() >= config.flush_period {
                    if let Err(e) = engine_under_test.flush() {
                        warn!(error = %e, "stress: periodic flush failed");
                    }
                    last_flush = Instant::now();
                }
                if last_save.elapsed() >= config.oracle_save_interval {
                    if let Err(e) = oracle.save_to_file(&config.oracle_path) {
                        warn!(error = %e, "stress: periodic oracle save failed");
                    }
                    last_save = Instant::now();
                }
                if let Some(period) = config.reopen_period {
                    if last_reopen.elapsed() >= period {
                        info!("stress: reopen_period elapsed (adapter-level reopen is a capability gap; see DESIGN.md)");
                        last_reopen = Instant::now();
                    }
                }
            }
            stop.store(true, Ordering::Relaxed);

            let mut report = StressReport::default();
            for h in handles {
                match h.join() {
                    Ok(worker_report) => report.merge(worker_report),
                    Err(_) => warn!("stress: worker thread panicked"),
                }
            }
            report
        });

        match scope_result {
            Ok(worker_report) => report.merge(worker_report),
            Err(_) => return Err(StressError::Internal("stress worker scope panicked".to_string())),
        }
        report.elapsed = start.elapsed();

        verify_final_state(&*engine_under_test, &oracle, config, &mut report)?;
        Ok(report)
    }
}

fn weight_table(w: &OpWeights) -> Vec<(&'static str, u32)> {
    vec![
        ("put", w.put),
        ("get", w.get),
        ("delete", w.delete),
        ("batch", w.batch),
        ("range_delete", w.range_delete),
        ("ingest", w.ingest),
        ("transaction", w.transaction),
        ("snapshot_read", w.snapshot_read),
        ("cf_ops", w.cf_ops),
        ("compact_verify", w.compact_verify),
    ]
}

fn pick_op(weights: &[(&'static str, u32)], pick: u32, total: u32) -> &'static str {
    let mut acc = 0u32;
    for (name, w) in weights {
        acc += w;
        if pick < acc {
            return name;
        }
    }
    let _ = total;
    weights.last().map(|(n, _)| *n).unwrap_or("get")
}

fn random_key(rng: &mut StdRng, key_space: u64) -> Vec<u8> {
    let k = rng.random_range(0..key_space.max(1));
    format!("key{k:012}").into_bytes()
}

fn random_value(rng: &mut StdRng, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.random::<u8>()).collect()
}

#[allow(clippy::too_many_arguments)]
fn run_one_op(
    op: &'static str,
    engine: &dyn EngineUnderTest,
    oracle: &Oracle,
    rng: &mut StdRng,
    key_space: u64,
    value_size: usize,
    allow_db_ahead: bool,
    report: &mut StressReport,
) {
    report.record_attempt(op);
    match op {
        "put" => {
            let key = random_key(rng, key_space);
            let value = random_value(rng, value_size);
            let pv = oracle.prepare_put(0, &key);
            match engine.put(&key, &value) {
                Ok(()) => pv.commit(),
                Err(_) => {
                    pv.rollback();
                    report.record_error(op);
                }
            }
        }
        "delete" => {
            let key = random_key(rng, key_space);
            let pv = oracle.prepare_delete(0, &key);
            match engine.delete(&key) {
                Ok(()) => pv.commit(),
                Err(_) => {
                    pv.rollback();
                    report.record_error(op);
                }
            }
        }
        "get" => {
            let key = random_key(rng, key_space);
            let pre = oracle.get(0, &key);
            match engine.get(&key) {
                Ok(None) => {
                    if oracle::must_have_existed(&pre, &oracle.get(0, &key)) && !allow_db_ahead {
                        report.verification_misses += 1;
                    }
                }
                Ok(Some(_)) => {}
                Err(_) => report.record_error(op),
            }
        }
        "batch" => {
            let mut keys: Vec<Vec<u8>> = (0..3).map(|_| random_key(rng, key_space)).collect();
            keys.sort();
            keys.dedup();
            let value = random_value(rng, value_size);
            let mut pending = Vec::new();
            for k in &keys {
                pending.push(oracle.prepare_put(0, k));
            }
            let mut ok = true;
            for k in &keys {
                if engine.put(k, &value).is_err() {
                    ok = false;
                    break;
                }
            }
            if ok {
                for pv in pending {
                    pv.commit();
                }
            } else {
                for pv in pending {
                    pv.rollback();
                }
                report.record_error(op);
            }
        }
        "range_delete" => {
            let mut a = rng.random_range(0..key_space.max(1));
            let mut b = rng.random_range(0..key_space.max(1));
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            let start = format!("key{a:012}").into_bytes();
            let end = format!("key{b:012}").into_bytes();
            if start == end {
                return;
            }
            match engine.delete_range(&start, &end) {
                Ok(()) => {}
                Err(_) => report.record_error(op),
            }
        }
        "ingest" => {
            let points: Vec<(Vec<u8>, Vec<u8>)> = (0..4)
                .map(|_| (random_key(rng, key_space), random_value(rng, value_size)))
                .collect();
            let mut pending = Vec::new();
            for (k, _) in &points {
                pending.push(oracle.prepare_put(0, k));
            }
            match engine.ingest(&points) {
                Ok(()) => {
                    for pv in pending {
                        pv.commit();
                    }
                }
                Err(_) => {
                    for pv in pending {
                        pv.rollback();
                    }
                    report.record_error(op);
                }
            }
        }
        "transaction" => {
            let key = random_key(rng, key_space);
            let value = random_value(rng, value_size);
            let commit = rng.random_bool(0.5);
            let pv = oracle.prepare_put(0, &key);
            if !commit {
                pv.rollback();
                return;
            }
            match engine.put(&key, &value) {
                Ok(()) => pv.commit(),
                Err(_) => {
                    pv.rollback();
                    report.record_error(op);
                }
            }
        }
        "snapshot_read" => {
            let key = random_key(rng, key_space);
            match engine.snapshot_read_twice(&key) {
                Ok((a, b)) => {
                    if a != b {
                        report.verification_misses += 1;
                    }
                }
                Err(_) => report.record_error(op),
            }
        }
        "cf_ops" => {
            let base = random_key(rng, key_space);
            let mut cf_key = b"cf_key".to_vec();
            cf_key.extend_from_slice(&base);
            let value = random_value(rng, value_size);
            if engine.put(&cf_key, &value).is_err() {
                report.record_error(op);
            }
        }
        "compact_verify" => {
            if engine.flush().is_err() || engine.compact().is_err() {
                report.record_error(op);
                return;
            }
            for _ in 0..8 {
                let key = random_key(rng, key_space);
                let pre = oracle.get(0, &key);
                if let Ok(observed) = engine.get(&key) {
                    let post = oracle.get(0, &key);
                    let ok = match observed {
                        None => oracle::must_have_not_existed(&pre, &post) || !pre.exists && !post.exists || pre.pending_write || post.pending_write,
                        Some(_) => true,
                    };
                    if !ok {
                        report.verification_misses += 1;
                    }
                }
            }
        }
        _ => {}
    }
}

fn verify_final_state(
    engine: &dyn EngineUnderTest,
    oracle: &Oracle,
    config: &StressConfig,
    report: &mut StressReport,
) -> Result<(), StressError> {
    let mut mismatches = Vec::new();
    oracle.for_each(|cf, key, expected| {
        if cf != 0 || expected.pending_write || expected.pending_delete {
            return;
        }
        let observed = engine.get(key).ok().flatten();
        if expected.deleted {
            if observed.is_some() {
                if config.allow_db_ahead {
                    warn!(key = %String::from_utf8_lossy(key), "stress: engine ahead of oracle (deleted key still present), tolerated");
                } else {
                    mismatches.push(format!("key {:?}: oracle expects deleted, engine has a value", key));
                }
            }
        } else if expected.exists && observed.is_none() {
            if !config.allow_data_loss {
                mismatches.push(format!("key {:?}: oracle expects a value, engine reports NotFound", key));
            } else {
                warn!(key = %String::from_utf8_lossy(key), "stress: oracle key missing from engine, tolerated under allow_data_loss");
            }
        }
    });

    report.final_mismatches = mismatches.len() as u64;
    if !mismatches.is_empty() {
        return Err(StressError::Verification(mismatches.join("; ")));
    }
    Ok(())
}
