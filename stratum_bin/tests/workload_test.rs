use std::collections::HashSet;

use serial_test::serial;
use stratum::{BufferPoolConfig, Database};
use stratum_bin::workload::{self, Row, WorkloadConfig};
use tempfile::{tempdir, TempDir};

/// Runs the workload; the returned directory keeps the table file alive.
fn run_workload(
    config: WorkloadConfig,
    capacity: usize,
) -> (Database, workload::WorkloadReport, TempDir) {
    let dir = tempdir().unwrap();
    let pool_config = BufferPoolConfig {
        page_size: 1024,
        capacity,
        lock_poll_interval_ms: 5,
    };
    let db = Database::new(pool_config).unwrap();
    let table = workload::prepare(&db, dir.path(), config.pages).unwrap();
    let report = workload::run(&db, table, &config).unwrap();
    (db, report, dir)
}

#[test]
#[serial]
fn test_workload_accounts_for_every_transaction() {
    let config = WorkloadConfig {
        threads: 6,
        transactions: 15,
        pages: 4,
        reads: 2,
        max_retries: 20,
        seed: 7,
    };
    let (db, report, _dir) = run_workload(config.clone(), 16);

    let attempted = (config.threads * config.transactions) as u64;
    assert_eq!(report.commits + report.abandoned, attempted);
    assert_eq!(report.rows as u64, report.commits);
    assert!(report.deadlocks <= report.aborts);
    assert!(report.resident_pages <= 16);
    assert_eq!(db.transactions().active_count(), 0);

    let table = db.catalog().table_id(workload::TABLE_NAME).unwrap();
    let rows = db
        .run_transaction(|pool, tx| pool.scan_table(tx, table))
        .unwrap();
    let keys: HashSet<(u32, u32)> = rows
        .iter()
        .map(|tuple| {
            let row = Row::decode(tuple.data()).unwrap();
            (row.worker, row.seq)
        })
        .collect();
    // A retried transaction never leaves a row from its aborted attempt
    assert_eq!(keys.len(), rows.len());
}

#[test]
#[serial]
fn test_single_worker_never_aborts() {
    let config = WorkloadConfig {
        threads: 1,
        transactions: 30,
        pages: 3,
        reads: 3,
        max_retries: 0,
        seed: 1,
    };
    let (_db, report, _dir) = run_workload(config, 8);
    assert_eq!(report.commits, 30);
    assert_eq!(report.aborts, 0);
    assert_eq!(report.rows, 30);
}

#[test]
fn test_report_serializes() {
    let (_db, report, _dir) = run_workload(
        WorkloadConfig {
            threads: 2,
            transactions: 2,
            ..Default::default()
        },
        8,
    );
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["config"]["threads"], 2);
    assert!(json["started_at"].is_string());
    assert!(json["commits"].is_u64());
}
