//! Transactional page cache.
//!
//! Every page access goes through a lock held on behalf of a transaction:
//! the pool waits for the lock, aborting the request when waiting would
//! deadlock, and only then hands out the page. Resident pages live in an
//! [`LruCache`]; a full cache evicts its least recently used page that is
//! either clean or dirty but no longer locked by the transaction that dirtied
//! it. Pages dirtied by a running transaction stay resident until the
//! transaction completes: commit flushes them, abort reloads them from
//! storage.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::catalog::Catalog;
use crate::config::BufferPoolConfig;
use crate::error::{Result, StratumError};
use crate::lock_manager::{LockManager, LockMode};
use crate::lru::LruCache;
use crate::page::{Page, PageId, RecordId, TableId, TransactionId, Tuple};
use crate::pager::PageStore;

type PageCache = LruCache<PageId, Page>;

pub struct BufferPool {
    config: BufferPoolConfig,
    catalog: Arc<Catalog>,
    lock_manager: LockManager,
    cache: Mutex<PageCache>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, catalog: Arc<Catalog>) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
            StratumError::InvalidConfig("capacity must be at least one page".to_string())
        })?;
        debug!(capacity, page_size = config.page_size, "buffer pool created");
        Ok(Self {
            config,
            catalog,
            lock_manager: LockManager::new(),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    /// Number of resident pages.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.cache.lock().contains(&page_id)
    }

    /// Returns a copy of the page once `tx_id` holds `mode` on it.
    ///
    /// Blocks while another transaction holds a conflicting lock. Fails with
    /// [`StratumError::DeadlockDetected`] if the wait would never end; the
    /// caller must then abort `tx_id`.
    pub fn get_page(&self, tx_id: TransactionId, page_id: PageId, mode: LockMode) -> Result<Page> {
        self.with_page(tx_id, page_id, mode, Page::clone)
    }

    /// Runs `f` on the resident page after locking it for `tx_id`.
    pub fn with_page<R>(
        &self,
        tx_id: TransactionId,
        page_id: PageId,
        mode: LockMode,
        f: impl FnOnce(&Page) -> R,
    ) -> Result<R> {
        self.acquire_lock(tx_id, page_id, mode)?;
        let mut cache = self.cache.lock();
        let page = self.resident_page(&mut cache, page_id)?;
        Ok(f(page))
    }

    /// Runs `f` on the resident page under an exclusive lock and marks the
    /// page dirty by `tx_id`.
    pub fn with_page_mut<R>(
        &self,
        tx_id: TransactionId,
        page_id: PageId,
        f: impl FnOnce(&mut Page) -> R,
    ) -> Result<R> {
        self.acquire_lock(tx_id, page_id, LockMode::Exclusive)?;
        let mut cache = self.cache.lock();
        let page = self.resident_page(&mut cache, page_id)?;
        let out = f(page);
        page.mark_dirty(tx_id);
        Ok(out)
    }

    /// Adds `tuple` to the table on behalf of `tx_id` and returns where it
    /// was stored. Appends a page when every existing page is full.
    pub fn insert_tuple(
        &self,
        tx_id: TransactionId,
        table_id: TableId,
        tuple: &[u8],
    ) -> Result<RecordId> {
        let store = self.catalog.table_handle(table_id)?;
        if tuple.len() != store.tuple_size() {
            return Err(StratumError::TupleSizeMismatch {
                expected: store.tuple_size(),
                actual: tuple.len(),
            });
        }

        for page_no in 0..store.num_pages() {
            let page_id = PageId::new(table_id, page_no);
            let held_before = self.lock_manager.holds_lock(tx_id, page_id);
            if let Some(record_id) = self.try_insert(tx_id, store.as_ref(), page_id, tuple)? {
                return Ok(record_id);
            }
            if !held_before {
                self.lock_manager.release(tx_id, page_id);
            }
        }

        // Another transaction may fill a freshly appended page before we lock
        // it, so keep appending until the insert lands.
        loop {
            let page_id = store.allocate_page()?;
            if let Some(record_id) = self.try_insert(tx_id, store.as_ref(), page_id, tuple)? {
                return Ok(record_id);
            }
        }
    }

    fn try_insert(
        &self,
        tx_id: TransactionId,
        store: &dyn PageStore,
        page_id: PageId,
        tuple: &[u8],
    ) -> Result<Option<RecordId>> {
        self.acquire_lock(tx_id, page_id, LockMode::Exclusive)?;
        let mut cache = self.cache.lock();
        let page = self.resident_page(&mut cache, page_id)?;
        let Some(slot) = store.insert_into(page, tuple)? else {
            return Ok(None);
        };
        page.mark_dirty(tx_id);
        let record_id = RecordId::new(page_id, slot);
        trace!(%tx_id, %record_id, "inserted tuple");
        Ok(Some(record_id))
    }

    /// Removes the stored tuple on behalf of `tx_id`.
    pub fn delete_tuple(&self, tx_id: TransactionId, tuple: &Tuple) -> Result<()> {
        let record_id = tuple.record_id().ok_or(StratumError::MissingRecordId)?;
        let page_id = record_id.page_id;
        let store = self.catalog.table_handle(page_id.table_id)?;

        self.acquire_lock(tx_id, page_id, LockMode::Exclusive)?;
        let mut cache = self.cache.lock();
        let page = self.resident_page(&mut cache, page_id)?;
        store.delete_from(page, record_id.slot)?;
        page.mark_dirty(tx_id);
        trace!(%tx_id, %record_id, "deleted tuple");
        Ok(())
    }

    /// Live tuples of a table, read under shared locks on every page.
    pub fn scan_table(&self, tx_id: TransactionId, table_id: TableId) -> Result<Vec<Tuple>> {
        let store = self.catalog.table_handle(table_id)?;
        let mut tuples = Vec::new();
        for page_no in 0..store.num_pages() {
            let page_id = PageId::new(table_id, page_no);
            let page_tuples = self.with_page(tx_id, page_id, LockMode::Shared, |page| {
                store.tuples(page)
            })??;
            tuples.extend(page_tuples);
        }
        Ok(tuples)
    }

    /// Ends `tx_id`. On commit its dirty pages are written to storage; on
    /// abort they are reloaded from storage. Either way its locks are
    /// released afterwards.
    ///
    /// If a commit fails part-way, the pages not yet written are reverted
    /// before the locks go, so no other transaction observes them. The flush
    /// error is the one returned.
    pub fn transaction_complete(&self, tx_id: TransactionId, commit: bool) -> Result<()> {
        let result = if commit {
            self.flush_pages(tx_id).or_else(|err| {
                warn!(%tx_id, error = %err, "commit flush failed, reverting");
                if let Err(revert_err) = self.revert_pages(tx_id) {
                    warn!(%tx_id, error = %revert_err, "revert after failed commit failed");
                }
                Err(err)
            })
        } else {
            self.revert_pages(tx_id)
        };
        self.lock_manager.release_all(tx_id);
        debug!(%tx_id, commit, ok = result.is_ok(), "transaction complete");
        result
    }

    /// Writes every page dirtied by `tx_id` and marks it clean.
    pub fn flush_pages(&self, tx_id: TransactionId) -> Result<()> {
        let mut cache = self.cache.lock();
        for (_, page) in cache.iter_mut() {
            if page.dirtied_by() == Some(tx_id) {
                self.flush(page)?;
            }
        }
        Ok(())
    }

    /// Reloads every page dirtied by `tx_id`. A page that cannot be reloaded
    /// is dropped from the cache so its changes can neither be read nor
    /// evicted to storage; the first such error is returned once every page
    /// has been dealt with.
    fn revert_pages(&self, tx_id: TransactionId) -> Result<()> {
        let mut cache = self.cache.lock();
        let dirtied: Vec<PageId> = cache
            .iter()
            .filter(|(_, page)| page.dirtied_by() == Some(tx_id))
            .map(|(page_id, _)| *page_id)
            .collect();

        let mut first_err = None;
        for page_id in dirtied {
            match self.read_from_store(page_id) {
                Ok(fresh) => {
                    if let Some(page) = cache.peek_mut(&page_id) {
                        *page = fresh;
                    }
                    debug!(%tx_id, %page_id, "reverted page");
                }
                Err(err) => {
                    cache.remove(&page_id);
                    warn!(%tx_id, %page_id, error = %err, "reload failed, dropped page");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Writes the page if it is resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut cache = self.cache.lock();
        match cache.peek_mut(&page_id) {
            Some(page) if page.is_dirty() => self.flush(page),
            _ => Ok(()),
        }
    }

    /// Writes every dirty resident page, regardless of which transaction
    /// dirtied it. Breaks abort atomicity for running transactions; meant for
    /// shutdown and tests.
    pub fn flush_all_pages(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        for (_, page) in cache.iter_mut() {
            if page.is_dirty() {
                self.flush(page)?;
            }
        }
        Ok(())
    }

    /// Drops the page from the cache without writing it.
    pub fn discard_page(&self, page_id: PageId) {
        if self.cache.lock().remove(&page_id).is_some() {
            debug!(%page_id, "discarded page");
        }
    }

    /// Releases `tx_id`'s lock on the page before the transaction ends.
    pub fn release_page(&self, tx_id: TransactionId, page_id: PageId) -> Result<()> {
        if self.lock_manager.release(tx_id, page_id) {
            Ok(())
        } else {
            Err(StratumError::LockNotHeld { tx_id, page_id })
        }
    }

    pub fn holds_lock(&self, tx_id: TransactionId, page_id: PageId) -> bool {
        self.lock_manager.holds_lock(tx_id, page_id)
    }

    /// Blocks until `tx_id` holds `mode` on the page, or fails when the
    /// wait would deadlock. The release epoch is read before each attempt so
    /// a release racing with the attempt still wakes us.
    fn acquire_lock(&self, tx_id: TransactionId, page_id: PageId, mode: LockMode) -> Result<()> {
        loop {
            let epoch = self.lock_manager.release_epoch();
            if self.lock_manager.acquire(tx_id, page_id, mode) {
                return Ok(());
            }
            if self.lock_manager.detect_deadlock(tx_id, page_id) {
                self.lock_manager.cancel_wait(tx_id);
                warn!(%tx_id, %page_id, ?mode, "deadlock detected");
                return Err(StratumError::DeadlockDetected { tx_id, page_id });
            }
            self.lock_manager
                .wait_for_release(epoch, self.config.lock_poll_interval());
        }
    }

    /// The resident copy of the page, loaded from storage on a miss and
    /// marked most recently used.
    fn resident_page<'c>(&self, cache: &'c mut PageCache, page_id: PageId) -> Result<&'c mut Page> {
        if !cache.contains(&page_id) && cache.len() >= cache.capacity() {
            self.evict(cache)?;
        }
        let (page, evicted) =
            cache.get_or_try_insert_with(page_id, || self.read_from_store(page_id))?;
        if let Some(victim) = evicted {
            // Room was made above, so nothing should have been pushed out.
            // Persist it rather than lose a dirty page.
            if victim.is_dirty() {
                self.write_to_store(&victim)?;
            }
        }
        Ok(page)
    }

    /// Frees one slot, or fails with [`StratumError::CacheExhausted`] when
    /// every resident page is dirty and still locked by its dirtier.
    fn evict(&self, cache: &mut PageCache) -> Result<()> {
        let victim = cache.pop_lru_where(|page_id, page| match page.dirtied_by() {
            None => true,
            Some(dirtier) => !self.lock_manager.holds_lock(dirtier, *page_id),
        });
        let Some((page_id, page)) = victim else {
            let capacity = cache.capacity();
            warn!(capacity, "no evictable page");
            return Err(StratumError::CacheExhausted { capacity });
        };
        if page.is_dirty() {
            if let Err(err) = self.write_to_store(&page) {
                // Back at the LRU end it came from; the slot it left is free.
                if cache.push_lru(page_id, page).is_some() {
                    warn!(%page_id, "failed victim could not be restored");
                }
                warn!(%page_id, error = %err, "writing eviction victim failed");
                return Err(err);
            }
        }
        debug!(%page_id, dirty = page.is_dirty(), "evicted page");
        Ok(())
    }

    fn flush(&self, page: &mut Page) -> Result<()> {
        self.write_to_store(page)?;
        page.mark_clean();
        page.set_before_image();
        debug!(page_id = %page.id(), "flushed page");
        Ok(())
    }

    /// Loads a page, refusing stores whose page size differs from the pool's.
    fn read_from_store(&self, page_id: PageId) -> Result<Page> {
        let store = self.catalog.table_handle(page_id.table_id)?;
        if store.page_size() != self.config.page_size {
            return Err(StratumError::PageSizeMismatch {
                expected: self.config.page_size,
                actual: store.page_size(),
            });
        }
        store.read_page(page_id)
    }

    fn write_to_store(&self, page: &Page) -> Result<()> {
        self.catalog.table_handle(page.id().table_id)?.write_page(page)
    }
}
