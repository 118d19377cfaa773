//! CLI front-end for [`aeternusdb::stress`].
//!
//! Drives a weighted-random workload against a real `Engine` rooted at
//! `-db`, verifying every write against an `Oracle` reference model. Exits
//! `0` on a clean run, non-zero on any hard verification failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use aeternusdb::compaction::CompactionStrategyType;
use aeternusdb::engine::{Engine, EngineConfig};
use aeternusdb::oracle::Oracle;
use aeternusdb::stress::{EngineAdapter, EngineUnderTest, OpWeights, StressConfig, StressHarness};

/// Weighted stress test for the AeternusDB storage engine.
#[derive(Parser, Debug)]
#[command(name = "stress", version, about)]
struct Cli {
    /// Directory the engine is opened in (created if missing).
    #[arg(long, default_value = "./stress-db")]
    db: PathBuf,

    /// Run duration in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Number of distinct keys in the key space.
    #[arg(long, default_value_t = 10_000)]
    keys: u64,

    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Generated value size in bytes.
    #[arg(long = "value-size", default_value_t = 64)]
    value_size: usize,

    /// RNG seed.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Derive a distinct seed per worker instead of sharing `seed`.
    #[arg(long, default_value_t = false)]
    randomize: bool,

    /// Path the oracle's reference state is saved to / loaded from.
    #[arg(long = "expected-state", default_value = "./stress-db.oracle")]
    expected_state: PathBuf,

    /// Seconds between periodic oracle persistence.
    #[arg(long = "save-expected-interval", default_value_t = 5)]
    save_expected_interval: u64,

    /// Seconds between periodic memtable flushes.
    #[arg(long = "flush", default_value_t = 2)]
    flush: u64,

    /// `log2` of the number of oracle stripe locks.
    #[arg(long = "log2-keys-per-lock", default_value_t = 10)]
    log2_keys_per_lock: u32,

    /// Tolerate the engine holding newer state than the oracle expects.
    #[arg(long = "allow-db-ahead", default_value_t = false)]
    allow_db_ahead: bool,

    /// Tolerate the oracle expecting a key the engine has lost.
    #[arg(long = "allow-data-loss", default_value_t = false)]
    allow_data_loss: bool,

    /// Only run final verification against an existing oracle file and
    /// engine directory; perform no mutations.
    #[arg(long = "verify-only", default_value_t = false)]
    verify_only: bool,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("stress run failed: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let engine_config = EngineConfig {
        write_buffer_size: 4 * 1024 * 1024,
        compaction_strategy: CompactionStrategyType::Stcs,
        bucket_low: 0.5,
        bucket_high: 1.5,
        min_sstable_size: 50,
        min_threshold: 4,
        max_threshold: 32,
        tombstone_ratio_threshold: 0.3,
        tombstone_compaction_interval: 0,
        tombstone_bloom_fallback: true,
        tombstone_range_drop: true,
        thread_pool_size: cli.threads.max(1),
    };

    let engine = Engine::open(&cli.db, engine_config)?;
    let adapter: Arc<dyn EngineUnderTest> = Arc::new(EngineAdapter::new(engine, &cli.db));

    let oracle = if cli.expected_state.exists() {
        Arc::new(Oracle::load_from_file(&cli.expected_state)?)
    } else {
        Arc::new(Oracle::new(cli.log2_keys_per_lock))
    };

    let config = StressConfig {
        threads: cli.threads,
        key_space: cli.keys,
        value_size: cli.value_size,
        op_weights: OpWeights::default(),
        duration: if cli.verify_only { Duration::ZERO } else { Duration::from_secs(cli.duration) },
        flush_period: Duration::from_secs(cli.flush.max(1)),
        reopen_period: None,
        oracle_save_interval: Duration::from_secs(cli.save_expected_interval.max(1)),
        oracle_path: cli.expected_state.clone(),
        allow_db_ahead: cli.allow_db_ahead,
        allow_data_loss: cli.allow_data_loss,
        log2_keys_per_lock: cli.log2_keys_per_lock,
        seed: cli.seed,
        randomize: cli.randomize,
    };

    let report = StressHarness::run(adapter, Arc::clone(&oracle), &config)?;
    oracle.save_to_file(&cli.expected_state)?;

    println!("stress run complete in {:?}", report.elapsed);
    for (op, n) in &report.attempted {
        let errors = report.errors.get(op).copied().unwrap_or(0);
        println!("  {op:<16} attempted={n:<8} errors={errors}");
    }
    println!("verification_misses={}", report.verification_misses);
    println!("final_mismatches={}", report.final_mismatches);

    Ok(())
}
