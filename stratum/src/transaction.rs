//! Transaction id allocation and bookkeeping of live transactions.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::page::TransactionId;

#[derive(Debug, Default)]
struct TransactionManagerState {
    next_transaction_id: AtomicU64,
    active_transactions: Mutex<BTreeSet<TransactionId>>,
}

/// Vends transaction ids and tracks which transactions are still running.
/// Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct TransactionManager {
    state: Arc<TransactionManagerState>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts numbering at `first`, e.g. to keep ids unique across restarts.
    pub fn starting_at(first: u64) -> Self {
        Self {
            state: Arc::new(TransactionManagerState {
                next_transaction_id: AtomicU64::new(first),
                active_transactions: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Begins a new transaction and returns its ID.
    pub fn begin(&self) -> TransactionId {
        let tx_id = TransactionId(self.state.next_transaction_id.fetch_add(1, Ordering::SeqCst));
        self.state.active_transactions.lock().insert(tx_id);
        debug!(%tx_id, "transaction started");
        tx_id
    }

    /// Marks `tx_id` finished. Returns `false` if it was not active.
    pub fn end(&self, tx_id: TransactionId, committed: bool) -> bool {
        let was_active = self.state.active_transactions.lock().remove(&tx_id);
        debug!(%tx_id, committed, was_active, "transaction finished");
        was_active
    }

    pub fn is_active(&self, tx_id: TransactionId) -> bool {
        self.state.active_transactions.lock().contains(&tx_id)
    }

    pub fn active_count(&self) -> usize {
        self.state.active_transactions.lock().len()
    }

    /// The oldest transaction still running.
    pub fn oldest_active(&self) -> Option<TransactionId> {
        self.state.active_transactions.lock().first().copied()
    }
}
