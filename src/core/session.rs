//! Lock sessions
//!
//! A `DatabaseData` is created by `Connection::get_data_and_lock` and owns the
//! command, the rows it returned and, on engines with record locks, the live
//! cursor holding those locks.

use super::command::Command;
use super::error::EngineError;
use super::locking;
use super::table::DataTable;
use super::value::DatabaseValue;
use parking_lot::Mutex;
use std::sync::Arc;

/// Navigable cursor over an engine result set.
///
/// Calls block; connections run them on the blocking pool.
pub trait RecordCursor: Send {
    /// Column names, in row order
    fn columns(&self) -> Vec<String>;

    /// Move to the next row; false past the last row
    fn read(&mut self) -> Result<bool, EngineError>;

    /// Move to the previous row; false before the first row
    fn read_previous(&mut self) -> Result<bool, EngineError>;

    /// Whether the cursor is positioned before the first row
    fn is_bof(&self) -> bool;

    /// Physical record number of the current row
    fn record(&self) -> Option<i64>;

    /// Values of the current row
    fn values(&self) -> Option<Vec<DatabaseValue>>;

    /// Position on a physical record, returning false when it is not in the set
    fn seek(&mut self, record: i64) -> Result<bool, EngineError> {
        while self.read_previous()? {}
        while self.read()? {
            if self.record() == Some(record) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lock the current record
    fn lock_record(&mut self) -> Result<(), EngineError>;

    /// Release the lock on the current record
    fn unlock_record(&mut self) -> Result<(), EngineError>;

    /// Write a field of the current record
    fn set_value(&mut self, column: usize, value: DatabaseValue) -> Result<(), EngineError>;

    /// Write buffered field changes to storage
    fn flush(&mut self) -> Result<(), EngineError>;

    /// Release the cursor; later calls fail with an invalid-handle error
    fn close(&mut self);
}

/// Cursor shared between a session and the blocking tasks driving it
pub type SharedCursor = Arc<Mutex<Box<dyn RecordCursor>>>;

/// State of one locked query
pub struct DatabaseData {
    command: Command,
    table: DataTable,
    cursor: Option<SharedCursor>,
    is_locked: bool,
}

impl DatabaseData {
    /// Create a session over fetched rows; it is locked when rows were found
    pub fn new(command: Command, table: DataTable, cursor: Option<Box<dyn RecordCursor>>) -> Self {
        let is_locked = !table.is_empty();
        Self {
            command,
            table,
            cursor: cursor.map(|c| Arc::new(Mutex::new(c))),
            is_locked,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn query(&self) -> &str {
        self.command.query()
    }

    pub fn params(&self) -> &[DatabaseValue] {
        self.command.params()
    }

    /// Rows returned when the lock was taken
    pub fn table(&self) -> &DataTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut DataTable {
        &mut self.table
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    /// Whether a live cursor is still attached
    pub fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    /// Live cursor, if the session still holds one
    pub fn cursor(&self) -> Option<SharedCursor> {
        self.cursor.clone()
    }

    /// Detach the live cursor so it can be released
    pub fn take_cursor(&mut self) -> Option<SharedCursor> {
        self.cursor.take()
    }

    /// Record that every lock has been released
    pub fn mark_unlocked(&mut self) {
        self.cursor = None;
        self.is_locked = false;
    }
}

impl std::fmt::Debug for DatabaseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseData")
            .field("command", &self.command)
            .field("rows", &self.table.len())
            .field("has_cursor", &self.cursor.is_some())
            .field("is_locked", &self.is_locked)
            .finish()
    }
}

impl Drop for DatabaseData {
    fn drop(&mut self) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        log::warn!(
            "Releasing record locks held by a dropped session for query: {}",
            self.command.query()
        );

        let release = move || {
            let mut cursor = cursor.lock();
            if let Err(e) = locking::unlock_all(cursor.as_mut()) {
                log::warn!("Failed to release record locks on drop: {e}");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}
