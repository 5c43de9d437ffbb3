//! StateStore: redb-backed state persistence for Stratus.
//!
//! Provides typed operations over applications, ledger records, and node
//! records. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use stratus_core::{Application, ApplicationDiff, LifecycleResult, epoch_secs};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(LEDGER).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or replace an application.
    pub fn put_application(&self, app: &Application) -> StateResult<()> {
        self.put(APPLICATIONS, &app.id, app)?;
        debug!(app_id = %app.id, "application stored");
        Ok(())
    }

    pub fn get_application(&self, app_id: &str) -> StateResult<Option<Application>> {
        self.get(APPLICATIONS, app_id)
    }

    pub fn list_applications(&self) -> StateResult<Vec<Application>> {
        self.scan(APPLICATIONS, "")
    }

    /// Delete an application, returning what was removed.
    pub fn delete_application(&self, app_id: &str) -> StateResult<Option<Application>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            let removed = table.remove(app_id).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(
                    serde_json::from_slice::<Application>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, existed = removed.is_some(), "application deleted");
        Ok(removed)
    }

    /// Load, change, and store one application under the write lock.
    ///
    /// The closure runs against a copy; if it returns an error nothing is
    /// written and the error is surfaced as [`StateError::Lifecycle`]. If the
    /// copy comes back unchanged nothing is written either. Returns `None`
    /// when the application does not exist.
    pub fn update_application<T, F>(
        &self,
        app_id: &str,
        change: F,
    ) -> StateResult<Option<(ApplicationDiff, T)>>
    where
        F: FnOnce(&mut Application) -> LifecycleResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            let before: Application = match table.get(app_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Ok(None),
            };

            let mut after = before.clone();
            let value = change(&mut after)?;

            if after != before {
                after.updated_at = epoch_secs();
                let bytes = serde_json::to_vec(&after).map_err(map_err!(Serialize))?;
                table
                    .insert(app_id, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            (ApplicationDiff::updated(before, after), value)
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(outcome))
    }

    // ── Ledger ─────────────────────────────────────────────────────

    /// Atomically create or refresh a ledger record.
    ///
    /// `merge` receives the current record (if any) and returns the new one.
    pub fn upsert_ledger_record<F>(&self, key: &str, merge: F) -> StateResult<LedgerRecord>
    where
        F: FnOnce(Option<LedgerRecord>) -> LedgerRecord,
    {
        self.upsert(LEDGER, key, merge)
    }

    pub fn get_ledger_record(&self, app_id: &str, index: u32) -> StateResult<Option<LedgerRecord>> {
        self.get(LEDGER, &LedgerRecord::key(app_id, index))
    }

    /// All ledger records for one application.
    pub fn list_ledger_for_app(&self, app_id: &str) -> StateResult<Vec<LedgerRecord>> {
        self.scan(LEDGER, &format!("{app_id}:"))
    }

    /// Every ledger record known to this store.
    pub fn list_ledger_records(&self) -> StateResult<Vec<LedgerRecord>> {
        self.scan(LEDGER, "")
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Atomically create or refresh a node record.
    pub fn upsert_node<F>(&self, node_id: &str, merge: F) -> StateResult<NodeRecord>
    where
        F: FnOnce(Option<NodeRecord>) -> NodeRecord,
    {
        self.upsert(NODES, node_id, merge)
    }

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeRecord>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<NodeRecord>> {
        self.scan(NODES, "")
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, def: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix: whole table).
    fn scan<T: DeserializeOwned>(&self, def: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn upsert<T, F>(&self, def: Table, key: &str, merge: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let merged = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let merged = merge(current);
            let bytes = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            merged
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(merged)
    }
}
