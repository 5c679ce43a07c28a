#![allow(dead_code)]

use std::path::PathBuf;

use stratum::{BufferPoolConfig, Database, PageId, TableId};
use tempfile::{tempdir, TempDir};

pub const TUPLE_SIZE: usize = 16;

/// A database with one heap table in a scratch directory. The directory
/// lives as long as the fixture.
pub struct TestDb {
    pub db: Database,
    pub table: TableId,
    pub table_path: PathBuf,
    _dir: TempDir,
}

impl TestDb {
    pub fn page(&self, page_no: u32) -> PageId {
        PageId::new(self.table, page_no)
    }

    /// Opens a second database over the same table file, as after a
    /// restart.
    pub fn reopen(&self, config: BufferPoolConfig) -> (Database, TableId) {
        let db = Database::new(config).unwrap();
        let table = db.create_table("t", &self.table_path, TUPLE_SIZE).unwrap();
        (db, table)
    }
}

pub fn config(capacity: usize, lock_poll_interval_ms: u64) -> BufferPoolConfig {
    BufferPoolConfig {
        page_size: 512,
        capacity,
        lock_poll_interval_ms,
    }
}

/// Sets up a table of `pages` empty pages.
pub fn setup(config: BufferPoolConfig, pages: u32) -> TestDb {
    let dir = tempdir().unwrap();
    let table_path = dir.path().join("t.tbl");
    let db = Database::new(config).unwrap();
    let table = db.create_table("t", &table_path, TUPLE_SIZE).unwrap();
    let store = db.catalog().table_handle(table).unwrap();
    for _ in 0..pages {
        store.allocate_page().unwrap();
    }
    TestDb {
        db,
        table,
        table_path,
        _dir: dir,
    }
}

pub fn row(byte: u8) -> [u8; TUPLE_SIZE] {
    [byte; TUPLE_SIZE]
}
