//! Manages page locks on behalf of transactions.
//!
//! The lock manager only decides whether a lock can be granted right now. A
//! request that cannot be granted registers the transaction as waiting on the
//! page and returns `false`; retrying, waiting and aborting on deadlock belong
//! to the caller (see [`BufferPool::get_page`](crate::buffer_pool::BufferPool::get_page)).

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::page::{PageId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One transaction's lock on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockState {
    pub tx_id: TransactionId,
    pub mode: LockMode,
}

/// Locks held on a single page. Unlocked pages have no entry in the table,
/// and a page can't be held Shared and Exclusive at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PageLock {
    Shared(BTreeSet<TransactionId>),
    Exclusive(TransactionId),
}

impl PageLock {
    fn shared(tx_id: TransactionId) -> Self {
        PageLock::Shared(BTreeSet::from([tx_id]))
    }

    fn mode_of(&self, tx_id: TransactionId) -> Option<LockMode> {
        match self {
            PageLock::Shared(holders) if holders.contains(&tx_id) => Some(LockMode::Shared),
            PageLock::Exclusive(owner) if *owner == tx_id => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    fn is_sole_holder(&self, tx_id: TransactionId) -> bool {
        match self {
            PageLock::Shared(holders) => holders.len() == 1 && holders.contains(&tx_id),
            PageLock::Exclusive(owner) => *owner == tx_id,
        }
    }

    fn holders(&self) -> Vec<TransactionId> {
        match self {
            PageLock::Shared(holders) => holders.iter().copied().collect(),
            PageLock::Exclusive(owner) => vec![*owner],
        }
    }

    fn states(&self) -> Vec<LockState> {
        match self {
            PageLock::Shared(holders) => holders
                .iter()
                .map(|&tx_id| LockState {
                    tx_id,
                    mode: LockMode::Shared,
                })
                .collect(),
            PageLock::Exclusive(owner) => vec![LockState {
                tx_id: *owner,
                mode: LockMode::Exclusive,
            }],
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<PageId, PageLock>,
    /// The single page each blocked transaction is waiting for.
    waiting: HashMap<TransactionId, PageId>,
    /// Bumped whenever a release frees at least one lock.
    release_epoch: u64,
}

impl LockTable {
    fn finish_request(
        &mut self,
        tx_id: TransactionId,
        page_id: PageId,
        mode: LockMode,
        granted: bool,
    ) -> bool {
        if granted {
            self.waiting.remove(&tx_id);
            trace!(%tx_id, %page_id, ?mode, "lock granted");
        } else {
            self.waiting.insert(tx_id, page_id);
            debug!(%tx_id, %page_id, ?mode, "lock busy, waiting");
        }
        granted
    }

    fn release(&mut self, tx_id: TransactionId, page_id: PageId) -> bool {
        let Some(lock) = self.locks.get_mut(&page_id) else {
            return false;
        };
        let (released, now_empty) = match lock {
            PageLock::Exclusive(owner) => {
                let released = *owner == tx_id;
                (released, released)
            }
            PageLock::Shared(holders) => {
                let released = holders.remove(&tx_id);
                (released, holders.is_empty())
            }
        };
        if now_empty {
            self.locks.remove(&page_id);
        }
        released
    }

    fn pages_locked_by(&self, tx_id: TransactionId) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.mode_of(tx_id).is_some())
            .map(|(page_id, _)| *page_id)
            .collect();
        pages.sort();
        pages
    }

    /// Number of distinct transactions holding or waiting for a lock.
    fn live_transactions(&self) -> usize {
        let mut live: HashSet<TransactionId> = self.waiting.keys().copied().collect();
        for lock in self.locks.values() {
            live.extend(lock.holders());
        }
        live.len()
    }

    fn detect_deadlock(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        let Some(lock) = self.locks.get(&page_id) else {
            return false;
        };
        let held: HashSet<PageId> = self.pages_locked_by(tx_id).into_iter().collect();
        if held.is_empty() {
            return false;
        }

        // Walk holders-waiting-on-holders starting from the holders of
        // `page_id`. `tx_id` itself is never followed: it may hold a shared
        // lock on an intermediate page, which is not a cycle through it.
        let bound = self.live_transactions();
        let mut visited = HashSet::new();
        let mut stack: Vec<TransactionId> = lock
            .holders()
            .into_iter()
            .filter(|holder| *holder != tx_id)
            .collect();

        while let Some(holder) = stack.pop() {
            if !visited.insert(holder) {
                continue;
            }
            if visited.len() > bound {
                break;
            }
            let Some(wanted) = self.waiting.get(&holder) else {
                continue;
            };
            if held.contains(wanted) {
                return true;
            }
            if let Some(next) = self.locks.get(wanted) {
                stack.extend(
                    next.holders()
                        .into_iter()
                        .filter(|h| *h != tx_id && !visited.contains(h)),
                );
            }
        }
        false
    }
}

/// Shared/exclusive page lock table with wait-for tracking.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a shared lock if `tx_id` already holds any lock on the page,
    /// the page is unlocked, or it is only held shared. Otherwise registers
    /// `tx_id` as waiting on the page and returns `false`.
    pub fn acquire_shared(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        let mut table = self.table.lock();
        let granted = match table.locks.entry(page_id) {
            Entry::Vacant(entry) => {
                entry.insert(PageLock::shared(tx_id));
                true
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                PageLock::Shared(holders) => {
                    holders.insert(tx_id);
                    true
                }
                PageLock::Exclusive(owner) => *owner == tx_id,
            },
        };
        table.finish_request(tx_id, page_id, LockMode::Shared, granted)
    }

    /// Grants an exclusive lock if `tx_id` already holds it, the page is
    /// unlocked, or `tx_id` is the only shared holder (upgraded in place).
    /// Otherwise registers `tx_id` as waiting on the page and returns `false`.
    pub fn acquire_exclusive(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        let mut table = self.table.lock();
        let granted = match table.locks.entry(page_id) {
            Entry::Vacant(entry) => {
                entry.insert(PageLock::Exclusive(tx_id));
                true
            }
            Entry::Occupied(mut entry) => {
                let lock = entry.get_mut();
                if lock.mode_of(tx_id) == Some(LockMode::Exclusive) {
                    true
                } else if lock.is_sole_holder(tx_id) {
                    *lock = PageLock::Exclusive(tx_id);
                    true
                } else {
                    false
                }
            }
        };
        table.finish_request(tx_id, page_id, LockMode::Exclusive, granted)
    }

    pub fn acquire(&self, tx_id: TransactionId, page_id: PageId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.acquire_shared(tx_id, page_id),
            LockMode::Exclusive => self.acquire_exclusive(tx_id, page_id),
        }
    }

    /// Releases whatever `tx_id` holds on `page_id`. Returns `false` if it
    /// held nothing.
    pub fn release(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        let mut table = self.table.lock();
        let released = table.release(tx_id, page_id);
        if released {
            table.release_epoch += 1;
            self.released.notify_all();
            trace!(%tx_id, %page_id, "lock released");
        }
        released
    }

    /// Releases every lock held by `tx_id` and forgets any wait it had.
    pub fn release_all(&self, tx_id: TransactionId) {
        let mut table = self.table.lock();
        table.waiting.remove(&tx_id);
        let pages = table.pages_locked_by(tx_id);
        for page_id in &pages {
            table.release(tx_id, *page_id);
        }
        if !pages.is_empty() {
            table.release_epoch += 1;
            self.released.notify_all();
        }
        debug!(%tx_id, released = pages.len(), "released all locks");
    }

    /// `tx_id`'s locks on `page_id`; at most one entry, since upgrades
    /// replace the shared lock in place.
    pub fn held_locks(&self, tx_id: TransactionId, page_id: PageId) -> Vec<LockState> {
        let table = self.table.lock();
        table
            .locks
            .get(&page_id)
            .and_then(|lock| lock.mode_of(tx_id))
            .map(|mode| LockState { tx_id, mode })
            .into_iter()
            .collect()
    }

    pub fn holds_lock(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        !self.held_locks(tx_id, page_id).is_empty()
    }

    /// Every lock currently held on `page_id`.
    pub fn holders(&self, page_id: PageId) -> Vec<LockState> {
        let table = self.table.lock();
        table
            .locks
            .get(&page_id)
            .map(PageLock::states)
            .unwrap_or_default()
    }

    pub fn pages_locked_by(&self, tx_id: TransactionId) -> Vec<PageId> {
        self.table.lock().pages_locked_by(tx_id)
    }

    pub fn waiting_on(&self, tx_id: TransactionId) -> Option<PageId> {
        self.table.lock().waiting.get(&tx_id).copied()
    }

    /// Drops the wait entry of a transaction that gave up waiting.
    pub fn cancel_wait(&self, tx_id: TransactionId) {
        self.table.lock().waiting.remove(&tx_id);
    }

    /// Whether granting `tx_id`'s pending request on `page_id` would close a
    /// cycle: some other holder of `page_id` is, directly or through a chain
    /// of holders waiting on holders, waiting for a page `tx_id` holds.
    pub fn detect_deadlock(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        self.table.lock().detect_deadlock(tx_id, page_id)
    }

    pub fn release_epoch(&self) -> u64 {
        self.table.lock().release_epoch
    }

    /// Blocks until some lock is released after `seen_epoch` was read, or
    /// `timeout` elapses. Returns whether a release happened.
    pub fn wait_for_release(&self, seen_epoch: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock();
        while table.release_epoch == seen_epoch {
            if self.released.wait_until(&mut table, deadline).timed_out() {
                return table.release_epoch != seen_epoch;
            }
        }
        true
    }
}
