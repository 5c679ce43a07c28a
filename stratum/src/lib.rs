//! Storage core: a fixed-capacity page cache with two-phase page locking and
//! deadlock detection, plus the heap files and catalog it runs over.

pub mod buffer_pool;

pub mod catalog;

pub mod config;

pub mod database;

pub mod error;

pub mod lock_manager;

pub mod lru;

pub mod page;

pub mod pager;

pub mod transaction;

pub use buffer_pool::BufferPool;
pub use catalog::Catalog;
pub use config::BufferPoolConfig;
pub use database::Database;
pub use error::{Result, StratumError};
pub use lock_manager::{LockManager, LockMode, LockState};
pub use lru::LruCache;
pub use page::{Page, PageId, RecordId, TableId, TransactionId, Tuple};
pub use pager::{HeapFile, PageStore};
pub use transaction::TransactionManager;
