//! Registry of tables and the stores that hold them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, StratumError};
use crate::page::TableId;
use crate::pager::PageStore;

struct TableEntry {
    name: String,
    store: Arc<dyn PageStore>,
}

#[derive(Default)]
struct CatalogState {
    tables: HashMap<TableId, TableEntry>,
    names: HashMap<String, TableId>,
}

/// Maps table ids and names to their page stores.
#[derive(Default)]
pub struct Catalog {
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `store` under `name`. Both the name and the store's table id
    /// must be unused.
    pub fn add_table(&self, store: Arc<dyn PageStore>, name: &str) -> Result<TableId> {
        let mut state = self.state.write();
        state.insert(store, name)
    }

    /// Assigns the next table id and registers the store `open` builds for
    /// it, all under one write lock, so concurrent registrations never
    /// contend for the same id. `open` is not called when `name` is taken.
    pub fn register_with<F>(&self, name: &str, open: F) -> Result<TableId>
    where
        F: FnOnce(TableId) -> Result<Arc<dyn PageStore>>,
    {
        let mut state = self.state.write();
        if state.names.contains_key(name) {
            return Err(StratumError::TableAlreadyExists(name.to_string()));
        }
        let store = open(state.next_table_id())?;
        state.insert(store, name)
    }

    pub fn table_handle(&self, table_id: TableId) -> Result<Arc<dyn PageStore>> {
        self.state
            .read()
            .tables
            .get(&table_id)
            .map(|entry| Arc::clone(&entry.store))
            .ok_or(StratumError::TableNotFound(table_id))
    }

    pub fn table_id(&self, name: &str) -> Result<TableId> {
        self.state
            .read()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| StratumError::TableNameNotFound(name.to_string()))
    }

    pub fn table_name(&self, table_id: TableId) -> Result<String> {
        self.state
            .read()
            .tables
            .get(&table_id)
            .map(|entry| entry.name.clone())
            .ok_or(StratumError::TableNotFound(table_id))
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self.state.read().tables.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The smallest table id greater than every registered one.
    pub fn next_table_id(&self) -> TableId {
        self.state.read().next_table_id()
    }
}

impl CatalogState {
    fn next_table_id(&self) -> TableId {
        self.tables.keys().max().map_or(0, |max| max + 1)
    }

    fn insert(&mut self, store: Arc<dyn PageStore>, name: &str) -> Result<TableId> {
        let table_id = store.table_id();
        if self.names.contains_key(name) || self.tables.contains_key(&table_id) {
            return Err(StratumError::TableAlreadyExists(name.to_string()));
        }
        self.names.insert(name.to_string(), table_id);
        self.tables.insert(
            table_id,
            TableEntry {
                name: name.to_string(),
                store,
            },
        );
        debug!(table_id, name, "registered table");
        Ok(table_id)
    }
}
