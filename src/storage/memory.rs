use super::{Table, TableSchema};
use crate::core::{DbError, Result, Row, SqlState};
use crate::interface::{DatabaseClient, Transaction};
use crate::transaction::TransactionState;
use async_trait::async_trait;
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;

/// Counters describing every transaction the database has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begun: u64,
    pub committed: u64,
    /// Rolled back explicitly or dropped while still open.
    pub rolled_back: u64,
    /// Refused at commit because of a conflicting concurrent commit.
    pub aborted: u64,
    /// Currently open.
    pub active: usize,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<HashMap<String, Table>>,
    /// Version of the latest commit.
    clock: AtomicU64,
    next_txn_id: AtomicU64,
    /// Open transactions and the snapshot each one reads at.
    active: Mutex<BTreeMap<u64, u64>>,
    counters: Counters,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, BTreeMap<u64, u64>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (u64, u64) {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut active = self.active();
        let snapshot = self.clock.load(Ordering::SeqCst);
        active.insert(id, snapshot);
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        (id, snapshot)
    }

    /// Allocate the next commit version and report the oldest snapshot any
    /// other open transaction still reads at.
    fn advance_clock(&self, committer: u64) -> (u64, u64) {
        let active = self.active();
        let version = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let oldest = active
            .iter()
            .filter(|(id, _)| **id != committer)
            .map(|(_, snapshot)| *snapshot)
            .min()
            .unwrap_or(version);
        (version, oldest)
    }

    fn finish(&self, id: u64, state: TransactionState, refused: bool) {
        self.active().remove(&id);
        let counter = match (state, refused) {
            (TransactionState::Committed, _) => &self.counters.committed,
            (_, true) => &self.counters.aborted,
            _ => &self.counters.rolled_back,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-process database with optimistic, serializable transactions.
///
/// Reads see the snapshot taken at `begin` plus the transaction's own
/// writes. Writes are buffered until commit. A transaction fails with
/// SQLSTATE `40001` when it writes a row committed after its snapshot, or
/// when at commit time any row it read or wrote, or any table it scanned,
/// changed since its snapshot. That makes write skew between two
/// concurrent transactions impossible: the second committer restarts.
///
/// Cloning yields another handle to the same database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    shared: Arc<Shared>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, name: &str, columns: &[&str]) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        if tables.contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }
        let schema = TableSchema::new(name, columns.iter().map(|c| c.to_string()).collect());
        tables.insert(name.to_string(), Table::new(schema));
        Ok(())
    }

    pub async fn drop_table(&self, name: &str) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        if tables.remove(name).is_none() {
            return Err(DbError::TableNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn table_names(&self) -> Vec<String> {
        let tables = self.shared.tables.read().await;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn schema(&self, table: &str) -> Result<TableSchema> {
        let tables = self.shared.tables.read().await;
        tables
            .get(table)
            .map(|t| t.schema().clone())
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))
    }

    /// Latest committed row for `key`, outside any transaction.
    pub async fn read_committed(&self, table: &str, key: i64) -> Result<Option<Row>> {
        let tables = self.shared.tables.read().await;
        let table = lookup(&tables, table)?;
        Ok(table.get(key, self.version()).cloned())
    }

    /// All committed rows of `table`, ordered by key.
    pub async fn scan_committed(&self, table: &str) -> Result<Vec<(i64, Row)>> {
        let tables = self.shared.tables.read().await;
        let table = lookup(&tables, table)?;
        Ok(table.scan(self.version()))
    }

    /// Version of the latest commit.
    pub fn version(&self) -> u64 {
        self.shared.clock.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.shared.counters;
        MemoryStats {
            begun: counters.begun.load(Ordering::SeqCst),
            committed: counters.committed.load(Ordering::SeqCst),
            rolled_back: counters.rolled_back.load(Ordering::SeqCst),
            aborted: counters.aborted.load(Ordering::SeqCst),
            active: self.shared.active().len(),
        }
    }
}

#[async_trait]
impl DatabaseClient for MemoryDb {
    type Transaction = MemoryTransaction;
    type Error = DbError;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let (id, snapshot) = self.shared.register();
        debug!("MemoryDb begin txn_{} at snapshot {}", id, snapshot);
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id,
            snapshot,
            state: TransactionState::Active,
            reads: HashSet::new(),
            scans: HashSet::new(),
            writes: BTreeMap::new(),
        })
    }
}

fn lookup<'a>(tables: &'a HashMap<String, Table>, name: &str) -> Result<&'a Table> {
    tables
        .get(name)
        .ok_or_else(|| DbError::TableNotFound(name.to_string()))
}

/// Transaction handle of a [`MemoryDb`].
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    snapshot: u64,
    state: TransactionState,
    reads: HashSet<(String, i64)>,
    scans: HashSet<String>,
    writes: BTreeMap<(String, i64), Option<Row>>,
}

impl MemoryTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Commit version this transaction reads at.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::TransactionClosed);
        }
        Ok(())
    }

    pub async fn read(&mut self, table: &str, key: i64) -> Result<Option<Row>> {
        self.ensure_active()?;
        let tables = self.shared.tables.read().await;
        let stored = lookup(&tables, table)?;
        self.reads.insert((table.to_string(), key));

        if let Some(pending) = self.writes.get(&(table.to_string(), key)) {
            return Ok(pending.clone());
        }
        Ok(stored.get(key, self.snapshot).cloned())
    }

    /// Every visible row of `table`, ordered by key, own writes included.
    pub async fn scan(&mut self, table: &str) -> Result<Vec<(i64, Row)>> {
        self.ensure_active()?;
        let tables = self.shared.tables.read().await;
        let stored = lookup(&tables, table)?;
        self.scans.insert(table.to_string());

        let mut rows: BTreeMap<i64, Row> = stored.scan(self.snapshot).into_iter().collect();
        for ((name, key), pending) in &self.writes {
            if name != table {
                continue;
            }
            match pending {
                Some(row) => rows.insert(*key, row.clone()),
                None => rows.remove(key),
            };
        }
        Ok(rows.into_iter().collect())
    }

    /// Insert or replace the row stored under `key`.
    pub async fn write(&mut self, table: &str, key: i64, row: Row) -> Result<()> {
        self.stage(table, key, Some(row)).await
    }

    /// Insert a row, failing with SQLSTATE `23505` if `key` is taken.
    pub async fn insert(&mut self, table: &str, key: i64, row: Row) -> Result<()> {
        if self.read(table, key).await?.is_some() {
            return Err(DbError::database(
                SqlState::UNIQUE_VIOLATION,
                format!("duplicate key {} in table '{}'", key, table),
            ));
        }
        self.stage(table, key, Some(row)).await
    }

    /// Read-modify-write of one row. Returns `false` when `key` does not exist.
    pub async fn update<F>(&mut self, table: &str, key: i64, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Row),
    {
        let Some(mut row) = self.read(table, key).await? else {
            return Ok(false);
        };
        f(&mut row);
        self.stage(table, key, Some(row)).await?;
        Ok(true)
    }

    /// Returns `false` when `key` does not exist.
    pub async fn delete(&mut self, table: &str, key: i64) -> Result<bool> {
        if self.read(table, key).await?.is_none() {
            return Ok(false);
        }
        self.stage(table, key, None).await?;
        Ok(true)
    }

    async fn stage(&mut self, table: &str, key: i64, row: Option<Row>) -> Result<()> {
        self.ensure_active()?;
        let tables = self.shared.tables.read().await;
        let stored = lookup(&tables, table)?;
        if let Some(row) = &row {
            stored.schema().validate_row(row)?;
        }
        if stored.latest_version(key).is_some_and(|v| v > self.snapshot) {
            return Err(DbError::serialization_failure(format!(
                "restart transaction: write conflict on {}/{} (txn_{})",
                table, key, self.id
            )));
        }
        self.writes.insert((table.to_string(), key), row);
        Ok(())
    }

    /// First reason this transaction may not commit, if any.
    fn find_conflict(&self, tables: &HashMap<String, Table>) -> Result<Option<String>> {
        for (name, key) in self.reads.iter().chain(self.writes.keys()) {
            let table = lookup(tables, name)?;
            if table.latest_version(*key).is_some_and(|v| v > self.snapshot) {
                return Ok(Some(format!("{}/{} changed since snapshot", name, key)));
            }
        }
        for name in &self.scans {
            if lookup(tables, name)?.last_modified() > self.snapshot {
                return Ok(Some(format!("table '{}' changed since scan", name)));
            }
        }
        Ok(None)
    }

    fn finish(&mut self, state: TransactionState, refused: bool) {
        self.state = state;
        self.shared.finish(self.id, state, refused);
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    type Error = DbError;

    async fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        if self.writes.is_empty() {
            self.finish(TransactionState::Committed, false);
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.write().await;
        let conflict = match self.find_conflict(&tables) {
            Ok(conflict) => conflict,
            Err(err) => {
                self.finish(TransactionState::Aborted, true);
                return Err(err);
            }
        };
        if let Some(reason) = conflict {
            self.finish(TransactionState::Aborted, true);
            debug!("MemoryDb refused commit of txn_{}: {}", self.id, reason);
            return Err(DbError::serialization_failure(format!(
                "restart transaction: {}",
                reason
            )));
        }

        let (version, oldest) = shared.advance_clock(self.id);
        let writes = std::mem::take(&mut self.writes);
        let mut touched = HashSet::new();
        for ((name, key), row) in writes {
            if let Some(table) = tables.get_mut(&name) {
                table.apply(key, row, version);
            }
            touched.insert(name);
        }
        for name in touched {
            if let Some(table) = tables.get_mut(&name) {
                table.vacuum(oldest);
            }
        }
        drop(tables);

        self.finish(TransactionState::Committed, false);
        debug!("MemoryDb committed txn_{} at version {}", self.id, version);
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.writes.clear();
        self.finish(TransactionState::Aborted, false);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.state.is_active() {
            debug!("MemoryDb txn_{} dropped while open, rolling back", self.id);
            self.finish(TransactionState::Aborted, false);
        }
    }
}
