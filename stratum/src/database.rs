//! The storage context: catalog, buffer pool and transaction bookkeeping.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer_pool::BufferPool;
use crate::catalog::Catalog;
use crate::config::BufferPoolConfig;
use crate::error::Result;
use crate::page::{TableId, TransactionId};
use crate::pager::{HeapFile, PageStore};
use crate::transaction::TransactionManager;

/// Owns everything a transaction needs. Share it across threads by
/// reference or behind an `Arc`.
pub struct Database {
    catalog: Arc<Catalog>,
    pool: BufferPool,
    transactions: TransactionManager,
}

impl Database {
    pub fn new(config: BufferPoolConfig) -> Result<Self> {
        let catalog = Arc::new(Catalog::new());
        let pool = BufferPool::new(config, Arc::clone(&catalog))?;
        Ok(Self {
            catalog,
            pool,
            transactions: TransactionManager::new(),
        })
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Registers a heap table stored at `path`. An existing file is opened
    /// with its pages intact.
    pub fn create_table<P: AsRef<Path>>(
        &self,
        name: &str,
        path: P,
        tuple_size: usize,
    ) -> Result<TableId> {
        let page_size = self.pool.config().page_size;
        let table_id = self.catalog.register_with(name, |table_id| {
            let heap: Arc<dyn PageStore> =
                Arc::new(HeapFile::open(path.as_ref(), table_id, page_size, tuple_size)?);
            Ok(heap)
        })?;
        info!(table_id, name, path = ?path.as_ref(), tuple_size, "table ready");
        Ok(table_id)
    }

    pub fn begin(&self) -> TransactionId {
        self.transactions.begin()
    }

    pub fn commit(&self, tx_id: TransactionId) -> Result<()> {
        self.complete(tx_id, true)
    }

    pub fn abort(&self, tx_id: TransactionId) -> Result<()> {
        self.complete(tx_id, false)
    }

    fn complete(&self, tx_id: TransactionId, commit: bool) -> Result<()> {
        let result = self.pool.transaction_complete(tx_id, commit);
        self.transactions.end(tx_id, commit && result.is_ok());
        result
    }

    /// Runs `f` in a fresh transaction, committing on success and aborting
    /// on error. The error from `f` is returned unchanged; use
    /// [`StratumError::is_deadlock`](crate::error::StratumError::is_deadlock)
    /// to decide whether retrying makes sense.
    pub fn run_transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BufferPool, TransactionId) -> Result<R>,
    {
        let tx_id = self.begin();
        match f(&self.pool, tx_id) {
            Ok(value) => {
                self.commit(tx_id)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = self.abort(tx_id) {
                    warn!(%tx_id, error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }
}
