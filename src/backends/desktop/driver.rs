//! Desktop engine driver
//!
//! The desktop engine is a file database with record-level locks visible to
//! every connection opening the same file. `SqliteDesktopDriver` keeps rows in
//! SQLite and record locks in a [`LockRegistry`] shared per database file, so
//! two connections in one process contend exactly like two workstations.

use crate::backends::sqlite::{self, ApplyMode, SqliteHandle};
use crate::core::command::source_table;
use crate::core::error::{codes, EngineError};
use crate::core::query_builder::UpdateBuilder;
use crate::core::session::RecordCursor;
use crate::core::table::DataTable;
use crate::core::value::DatabaseValue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

/// Connection holding a record lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub connection_id: u64,
    pub user: String,
}

type LockKey = (String, i64);

/// Record locks held on one database file
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<LockKey, LockOwner>>,
}

static REGISTRIES: LazyLock<Mutex<HashMap<PathBuf, Weak<LockRegistry>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn registry_key(path: &str) -> PathBuf {
    let path = Path::new(path);
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent().map(Path::canonicalize), path.file_name()) {
        (Some(Ok(parent)), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

fn lock_key(table: &str, record: i64) -> LockKey {
    (table.to_ascii_lowercase(), record)
}

impl LockRegistry {
    /// Registry shared by every driver opened on `path`
    pub fn for_database(path: &str) -> Arc<LockRegistry> {
        let key = registry_key(path);
        let mut registries = REGISTRIES.lock();
        registries.retain(|_, registry| registry.strong_count() > 0);

        if let Some(registry) = registries.get(&key).and_then(Weak::upgrade) {
            return registry;
        }
        let registry = Arc::new(LockRegistry::default());
        registries.insert(key, Arc::downgrade(&registry));
        registry
    }

    /// Lock a record; re-locking a record the owner already holds succeeds
    pub fn acquire(&self, table: &str, record: i64, owner: &LockOwner) -> Result<(), EngineError> {
        let mut locks = self.locks.lock();
        match locks.get(&lock_key(table, record)) {
            Some(holder) if holder.connection_id != owner.connection_id => {
                Err(lock_conflict(table, record, holder))
            }
            Some(_) => Ok(()),
            None => {
                locks.insert(lock_key(table, record), owner.clone());
                Ok(())
            }
        }
    }

    /// Release a record held by `owner`
    pub fn release(&self, table: &str, record: i64, owner: &LockOwner) {
        let mut locks = self.locks.lock();
        let key = lock_key(table, record);
        if locks
            .get(&key)
            .is_some_and(|holder| holder.connection_id == owner.connection_id)
        {
            locks.remove(&key);
        }
    }

    pub fn holder(&self, table: &str, record: i64) -> Option<LockOwner> {
        self.locks.lock().get(&lock_key(table, record)).cloned()
    }

    /// Fail when another connection holds the record
    pub fn check_write(&self, table: &str, record: i64, owner: &LockOwner) -> Result<(), EngineError> {
        match self.holder(table, record) {
            Some(holder) if holder.connection_id != owner.connection_id => {
                Err(lock_conflict(table, record, &holder))
            }
            _ => Ok(()),
        }
    }

    /// Release every record held by `owner`, returning how many were held
    pub fn release_owner(&self, owner: &LockOwner) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, holder| holder.connection_id != owner.connection_id);
        before - locks.len()
    }
}

fn lock_conflict(table: &str, record: i64, holder: &LockOwner) -> EngineError {
    EngineError::new(
        codes::LOCK_FAILED,
        format!("record {record} of {table} is locked by {}", holder.user),
    )
}

fn check_ansi(ansi: bool, value: &DatabaseValue) -> Result<(), EngineError> {
    match value {
        DatabaseValue::String(text) if ansi && !text.is_ascii() => Err(EngineError::new(
            codes::UNICODE_NOT_SUPPORTED,
            format!("'{text}' cannot be stored in an ANSI table"),
        )),
        _ => Ok(()),
    }
}

/// Blocking driver of the desktop engine
pub trait DesktopDriver: Send + Sync {
    /// Database file the driver opens
    fn path(&self) -> &str;

    fn open(&self) -> Result<(), EngineError>;

    /// Release the owner's record locks and close the file
    fn close(&self, owner: &LockOwner);

    fn is_open(&self) -> bool;

    /// Run a query; single-table queries carry record numbers
    fn query(&self, query: &str, params: &[DatabaseValue]) -> Result<DataTable, EngineError>;

    fn execute(&self, query: &str, params: &[DatabaseValue]) -> Result<u64, EngineError>;

    /// Apply changed rows, refusing records locked by other owners
    fn apply(&self, table: &DataTable, owner: &LockOwner) -> Result<Option<i64>, EngineError>;

    /// Open a navigable cursor whose record locks belong to `owner`
    fn open_cursor(
        &self,
        query: &str,
        params: &[DatabaseValue],
        owner: &LockOwner,
    ) -> Result<Box<dyn RecordCursor>, EngineError>;

    /// Users holding locks on the `table` records the query selects
    fn locking_users(&self, table: &str, query: &str, params: &[DatabaseValue]) -> Result<Vec<String>, EngineError>;
}

/// Desktop driver storing rows in SQLite
pub struct SqliteDesktopDriver {
    path: String,
    handle: SqliteHandle,
    registry: Arc<LockRegistry>,
    ansi_tables: bool,
}

impl SqliteDesktopDriver {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            registry: LockRegistry::for_database(&path),
            handle: Arc::new(Mutex::new(None)),
            path,
            ansi_tables: false,
        }
    }

    /// Reject text outside ASCII, as tables using an ANSI code page do
    #[must_use]
    pub fn with_ansi_tables(mut self, ansi: bool) -> Self {
        self.ansi_tables = ansi;
        self
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    fn check_params(&self, params: &[DatabaseValue]) -> Result<(), EngineError> {
        params.iter().try_for_each(|p| check_ansi(self.ansi_tables, p))
    }
}

impl DesktopDriver for SqliteDesktopDriver {
    fn path(&self) -> &str {
        &self.path
    }

    fn open(&self) -> Result<(), EngineError> {
        sqlite::with_connection(&self.handle, &self.path, |_| Ok(()))
    }

    fn close(&self, owner: &LockOwner) {
        let released = self.registry.release_owner(owner);
        if released > 0 {
            log::debug!("Released {released} record lock(s) held by {}", owner.user);
        }
        self.handle.lock().take();
    }

    fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    fn query(&self, query: &str, params: &[DatabaseValue]) -> Result<DataTable, EngineError> {
        self.check_params(params)?;
        sqlite::with_connection(&self.handle, &self.path, |conn| {
            match sqlite::with_record_numbers(query) {
                Some(numbered) => sqlite::fetch(conn, &numbered, params, source_table(query).as_deref()),
                None => sqlite::fetch(conn, query, params, None),
            }
        })
    }

    fn execute(&self, query: &str, params: &[DatabaseValue]) -> Result<u64, EngineError> {
        self.check_params(params)?;
        sqlite::with_connection(&self.handle, &self.path, |conn| sqlite::execute(conn, query, params))
    }

    fn apply(&self, table: &DataTable, owner: &LockOwner) -> Result<Option<i64>, EngineError> {
        for row in table.rows() {
            row.values()
                .iter()
                .try_for_each(|v| check_ansi(self.ansi_tables, v))?;
        }
        sqlite::with_connection(&self.handle, &self.path, |conn| {
            sqlite::apply_changes(conn, table, ApplyMode::Record, &|source, record| {
                self.registry.check_write(source, record, owner)
            })
        })
    }

    fn open_cursor(
        &self,
        query: &str,
        params: &[DatabaseValue],
        owner: &LockOwner,
    ) -> Result<Box<dyn RecordCursor>, EngineError> {
        self.check_params(params)?;
        let table = source_table(query)
            .filter(|_| sqlite::with_record_numbers(query).is_some())
            .ok_or_else(|| {
                EngineError::new(codes::GENERAL, "only single-table queries can be locked")
            })?;

        let (rows, sizes) = sqlite::with_connection(&self.handle, &self.path, |conn| {
            let numbered = sqlite::with_record_numbers(query).unwrap_or_else(|| query.to_string());
            let rows = sqlite::fetch(conn, &numbered, params, Some(&table))?;
            let sizes = sqlite::declared_sizes(conn, &table)?;
            Ok((rows, sizes))
        })?;

        Ok(Box::new(SqliteCursor {
            handle: Arc::clone(&self.handle),
            path: self.path.clone(),
            registry: Arc::clone(&self.registry),
            owner: owner.clone(),
            columns: rows.columns().iter().map(|c| c.name.clone()).collect(),
            rows: rows
                .rows()
                .iter()
                .filter_map(|r| Some((r.record()?, r.values().to_vec())))
                .collect(),
            table,
            position: -1,
            sizes,
            ansi: self.ansi_tables,
            pending: BTreeMap::new(),
            held: BTreeSet::new(),
            closed: false,
        }))
    }

    fn locking_users(&self, table: &str, query: &str, params: &[DatabaseValue]) -> Result<Vec<String>, EngineError> {
        let rows = self.query(query, params)?;
        let mut users: Vec<String> = Vec::new();
        for record in rows.rows().iter().filter_map(|r| r.record()) {
            if let Some(holder) = self.registry.holder(table, record) {
                if !users.contains(&holder.user) {
                    users.push(holder.user);
                }
            }
        }
        Ok(users)
    }
}

/// Navigable cursor over a materialized result set.
///
/// Field writes are buffered on the current record and written when the
/// cursor moves, the record is unlocked, the cursor is flushed or closed.
struct SqliteCursor {
    handle: SqliteHandle,
    path: String,
    registry: Arc<LockRegistry>,
    owner: LockOwner,
    table: String,
    columns: Vec<String>,
    rows: Vec<(i64, Vec<DatabaseValue>)>,
    position: isize,
    sizes: HashMap<String, usize>,
    ansi: bool,
    pending: BTreeMap<usize, DatabaseValue>,
    held: BTreeSet<i64>,
    closed: bool,
}

impl SqliteCursor {
    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::new(codes::INVALID_HANDLE, "cursor handle is no longer valid"))
        } else {
            Ok(())
        }
    }

    fn current(&self) -> Option<usize> {
        usize::try_from(self.position)
            .ok()
            .filter(|i| *i < self.rows.len())
    }

    fn current_record(&self) -> Result<i64, EngineError> {
        self.current()
            .map(|i| self.rows[i].0)
            .ok_or_else(|| EngineError::new(codes::INVALID_HANDLE, "cursor is not positioned on a record"))
    }

    fn write_pending(&mut self) -> Result<(), EngineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let index = self
            .current()
            .ok_or_else(|| EngineError::new(codes::INVALID_HANDLE, "pending write without a record"))?;
        let record = self.rows[index].0;
        self.registry.check_write(&self.table, record, &self.owner)?;

        let mut update = UpdateBuilder::new(self.table.as_str());
        for (column, value) in &self.pending {
            update = update.set(&self.columns[*column], value.clone());
        }
        let update = update.where_eq("rowid", record);
        sqlite::with_connection(&self.handle, &self.path, |conn| {
            sqlite::execute(conn, &update.build(), &update.params())
        })?;

        for (column, value) in std::mem::take(&mut self.pending) {
            self.rows[index].1[column] = value;
        }
        Ok(())
    }

    fn step(&mut self, delta: isize) -> Result<bool, EngineError> {
        self.check_open()?;
        self.write_pending()?;
        let next = self.position + delta;
        self.position = next.clamp(-1, self.rows.len() as isize);
        Ok(self.current().is_some())
    }
}

impl RecordCursor for SqliteCursor {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn read(&mut self) -> Result<bool, EngineError> {
        self.step(1)
    }

    fn read_previous(&mut self) -> Result<bool, EngineError> {
        self.step(-1)
    }

    fn is_bof(&self) -> bool {
        self.position < 0
    }

    fn record(&self) -> Option<i64> {
        self.current().map(|i| self.rows[i].0)
    }

    fn values(&self) -> Option<Vec<DatabaseValue>> {
        let index = self.current()?;
        let mut values = self.rows[index].1.clone();
        for (column, value) in &self.pending {
            values[*column] = value.clone();
        }
        Some(values)
    }

    fn lock_record(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        let record = self.current_record()?;
        self.registry.acquire(&self.table, record, &self.owner)?;
        self.held.insert(record);
        Ok(())
    }

    fn unlock_record(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        self.write_pending()?;
        let record = self.current_record()?;
        if self.held.remove(&record) {
            self.registry.release(&self.table, record, &self.owner);
        }
        Ok(())
    }

    fn set_value(&mut self, column: usize, value: DatabaseValue) -> Result<(), EngineError> {
        self.check_open()?;
        self.current_record()?;
        let name = self
            .columns
            .get(column)
            .ok_or_else(|| EngineError::new(codes::COLUMN_NOT_FOUND, format!("no column {column}")))?;
        check_ansi(self.ansi, &value)?;
        sqlite::check_size(&self.sizes, name, &value)?;
        self.pending.insert(column, value);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.check_open()?;
        self.write_pending()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.write_pending() {
            log::warn!("Discarding buffered writes on {}: {e}", self.table);
            self.pending.clear();
        }
        for record in std::mem::take(&mut self.held) {
            self.registry.release(&self.table, record, &self.owner);
        }
        self.closed = true;
    }
}

impl Drop for SqliteCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::locking;

    fn owner(id: u64, user: &str) -> LockOwner {
        LockOwner {
            connection_id: id,
            user: user.to_string(),
        }
    }

    fn database() -> Result<(tempfile::TempDir, String), EngineError> {
        let dir = tempfile::tempdir().map_err(|e| EngineError::new(codes::GENERAL, e.to_string()))?;
        let path = dir.path().join("desktop.db").to_string_lossy().to_string();
        let driver = SqliteDesktopDriver::new(path.as_str());
        driver.execute(
            "CREATE TABLE Customers (ID INTEGER PRIMARY KEY, Name VARCHAR(5), City TEXT)",
            &[],
        )?;
        driver.execute(
            "INSERT INTO Customers (ID, Name, City) VALUES (1, 'Ann', 'Oslo'), (2, 'Bob', 'Rome')",
            &[],
        )?;
        Ok((dir, path))
    }

    #[test]
    fn test_registry_is_shared_per_file() {
        let a = LockRegistry::for_database("/tmp/../tmp/shared-registry.db");
        let b = LockRegistry::for_database("/tmp/shared-registry.db");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_conflicts_name_the_holder() {
        let registry = LockRegistry::default();
        let alice = owner(1, "alice");
        let bob = owner(2, "bob");
        assert!(registry.acquire("Customers", 1, &alice).is_ok());
        assert!(registry.acquire("CUSTOMERS", 1, &alice).is_ok());

        let err = registry.acquire("customers", 1, &bob).unwrap_err();
        assert_eq!(err.code, codes::LOCK_FAILED);
        assert!(err.message.contains("alice"));

        registry.release("Customers", 1, &bob);
        assert!(registry.holder("Customers", 1).is_some());
        assert_eq!(registry.release_owner(&alice), 1);
        assert!(registry.check_write("Customers", 1, &bob).is_ok());
    }

    #[test]
    fn test_cursor_locks_and_releases() -> Result<(), EngineError> {
        let (_dir, path) = database()?;
        let alice_driver = SqliteDesktopDriver::new(path.as_str());
        let bob_driver = SqliteDesktopDriver::new(path.as_str());
        let alice = owner(10, "alice");
        let bob = owner(11, "bob");

        let query = "SELECT * FROM Customers WHERE ID = ?";
        let params = [DatabaseValue::Long(1)];
        let mut cursor = alice_driver.open_cursor(query, &params, &alice)?;
        let table = locking::lock_all(cursor.as_mut(), Some("Customers"))?;
        assert_eq!(table.len(), 1);

        let mut other = bob_driver.open_cursor(query, &params, &bob)?;
        let err = locking::lock_all(other.as_mut(), None).unwrap_err();
        assert_eq!(err.code, codes::LOCK_FAILED);
        assert_eq!(bob_driver.locking_users("Customers", query, &params)?, vec!["alice"]);

        locking::unlock_all(cursor.as_mut())?;
        assert!(bob_driver.locking_users("Customers", query, &params)?.is_empty());
        assert_eq!(cursor.read().unwrap_err().code, codes::INVALID_HANDLE);
        Ok(())
    }

    #[test]
    fn test_cursor_buffers_writes_until_flush() -> Result<(), EngineError> {
        let (_dir, path) = database()?;
        let driver = SqliteDesktopDriver::new(path.as_str());
        let alice = owner(20, "alice");
        let query = "SELECT * FROM Customers WHERE ID = 2";

        let mut cursor = driver.open_cursor(query, &[], &alice)?;
        locking::lock_all(cursor.as_mut(), Some("Customers"))?;
        assert!(cursor.read()?);
        cursor.set_value(2, "Pisa".into())?;
        assert_eq!(driver.query(query, &[])?.value(0, "City"), Some(&DatabaseValue::from("Rome")));

        let err = cursor.set_value(1, "Roberta".into()).unwrap_err();
        assert_eq!(err.code, codes::DATA_TRUNCATED);

        cursor.flush()?;
        assert_eq!(driver.query(query, &[])?.value(0, "City"), Some(&DatabaseValue::from("Pisa")));
        cursor.close();
        Ok(())
    }

    #[test]
    fn test_foreign_lock_blocks_apply() -> Result<(), EngineError> {
        let (_dir, path) = database()?;
        let alice_driver = SqliteDesktopDriver::new(path.as_str());
        let bob_driver = SqliteDesktopDriver::new(path.as_str());
        let alice = owner(30, "alice");
        let bob = owner(31, "bob");
        let query = "SELECT * FROM Customers WHERE ID = 1";

        let mut cursor = alice_driver.open_cursor(query, &[], &alice)?;
        locking::lock_all(cursor.as_mut(), Some("Customers"))?;

        let mut table = bob_driver.query(query, &[])?;
        if let Some(row) = table.row_mut(0) {
            row.set(2, "Bergen".into());
        }
        let err = bob_driver.apply(&table, &bob).unwrap_err();
        assert_eq!(err.code, codes::LOCK_FAILED);

        alice_driver.close(&alice);
        bob_driver.apply(&table, &bob)?;
        Ok(())
    }

    #[test]
    fn test_ansi_tables_reject_unicode() -> Result<(), EngineError> {
        let (_dir, path) = database()?;
        let driver = SqliteDesktopDriver::new(path.as_str()).with_ansi_tables(true);
        let err = driver
            .query("SELECT * FROM Customers WHERE Name = ?", &["Zoë".into()])
            .unwrap_err();
        assert_eq!(err.code, codes::UNICODE_NOT_SUPPORTED);
        Ok(())
    }
}
