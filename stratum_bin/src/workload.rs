//! Concurrent transaction workload over a single heap table.
//!
//! Each worker thread runs a fixed number of transactions. A transaction
//! reads a random set of pages under shared locks, upgrades one of them to an
//! exclusive lock and inserts a row. Overlapping upgrades produce genuine
//! deadlocks; the victim aborts and retries after a short random backoff.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use clap::Args;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use stratum::{Database, LockMode, PageId, Result, StratumError, TableId, TransactionId};
use tracing::{debug, info};

pub const TABLE_NAME: &str = "workload";

/// Width of an encoded [`Row`].
pub const ROW_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Args, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    pub threads: usize,
    /// Transactions each worker commits or gives up on.
    #[arg(long, default_value_t = 25)]
    pub transactions: usize,
    /// Pages the table is seeded with.
    #[arg(long, default_value_t = 8)]
    pub pages: u32,
    /// Pages read under shared locks per transaction.
    #[arg(long, default_value_t = 3)]
    pub reads: usize,
    /// Attempts after the first before a transaction is abandoned.
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transactions: 25,
            pages: 8,
            reads: 3,
            max_retries: 5,
            seed: 42,
        }
    }
}

/// The row every workload transaction inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Row {
    pub worker: u32,
    pub seq: u32,
    pub tx_id: TransactionId,
}

impl Row {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ROW_SIZE);
        buf.put_u32(self.worker);
        buf.put_u32(self.seq);
        buf.put_u64(self.tx_id.0);
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() != ROW_SIZE {
            return Err(StratumError::TupleSizeMismatch {
                expected: ROW_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            worker: data.get_u32(),
            seq: data.get_u32(),
            tx_id: TransactionId(data.get_u64()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub config: WorkloadConfig,
    pub commits: u64,
    /// Attempts rolled back, deadlocks included.
    pub aborts: u64,
    pub deadlocks: u64,
    /// Transactions abandoned after exhausting their retries.
    pub abandoned: u64,
    pub rows: usize,
    pub resident_pages: usize,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    aborts: AtomicU64,
    deadlocks: AtomicU64,
    abandoned: AtomicU64,
}

/// Registers the workload table under `data_dir` and grows it to at least
/// `pages` pages.
pub fn prepare(db: &Database, data_dir: &Path, pages: u32) -> Result<TableId> {
    let table_id = db.create_table(TABLE_NAME, data_dir.join("workload.tbl"), ROW_SIZE)?;
    let store = db.catalog().table_handle(table_id)?;
    while store.num_pages() < pages {
        store.allocate_page()?;
    }
    debug!(table_id, pages = store.num_pages(), "workload table prepared");
    Ok(table_id)
}

/// Runs the workload to completion and reports what happened.
pub fn run(db: &Database, table_id: TableId, config: &WorkloadConfig) -> Result<WorkloadReport> {
    if config.pages == 0 || config.reads == 0 || config.reads > config.pages as usize {
        return Err(StratumError::InvalidConfig(format!(
            "reads must be between 1 and pages ({}), got {}",
            config.pages, config.reads
        )));
    }

    let started_at = Utc::now();
    let start = Instant::now();
    let counters = Counters::default();

    thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|worker| {
                let counters = &counters;
                s.spawn(move || run_worker(db, table_id, config, worker as u32, counters))
            })
            .collect();
        workers
            .into_iter()
            .try_for_each(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
    })?;

    let rows = db
        .run_transaction(|pool, tx_id| pool.scan_table(tx_id, table_id))?
        .len();
    let report = WorkloadReport {
        started_at,
        elapsed_ms: start.elapsed().as_millis() as u64,
        config: config.clone(),
        commits: counters.commits.load(Ordering::Relaxed),
        aborts: counters.aborts.load(Ordering::Relaxed),
        deadlocks: counters.deadlocks.load(Ordering::Relaxed),
        abandoned: counters.abandoned.load(Ordering::Relaxed),
        rows,
        resident_pages: db.pool().cache_size(),
    };
    info!(
        commits = report.commits,
        aborts = report.aborts,
        deadlocks = report.deadlocks,
        elapsed_ms = report.elapsed_ms,
        "workload finished"
    );
    Ok(report)
}

fn run_worker(
    db: &Database,
    table_id: TableId,
    config: &WorkloadConfig,
    worker: u32,
    counters: &Counters,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(worker as u64));
    for seq in 0..config.transactions as u32 {
        let mut attempt = 0;
        loop {
            let outcome = db.run_transaction(|pool, tx_id| {
                let picked = sample(&mut rng, config.pages as usize, config.reads);
                let mut target = None;
                for page_no in picked.iter() {
                    let page_id = PageId::new(table_id, page_no as u32);
                    pool.get_page(tx_id, page_id, LockMode::Shared)?;
                    target = Some(page_id);
                }
                if let Some(page_id) = target {
                    pool.get_page(tx_id, page_id, LockMode::Exclusive)?;
                }
                let row = Row {
                    worker,
                    seq,
                    tx_id,
                };
                pool.insert_tuple(tx_id, table_id, &row.encode())
            });

            match outcome {
                Ok(_) => {
                    counters.commits.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(err) if err.is_transaction_abort() => {
                    counters.aborts.fetch_add(1, Ordering::Relaxed);
                    if err.is_deadlock() {
                        counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                    }
                    if attempt >= config.max_retries {
                        counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        debug!(worker, seq, error = %err, "transaction abandoned");
                        break;
                    }
                    attempt += 1;
                    thread::sleep(Duration::from_millis(rng.random_range(1..=10)));
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}
