//! Tabular results
//!
//! `DataTable` is the untyped intermediate between entity fields and engine
//! rows. Rows remember their original values and a change state so adapters
//! can generate the right statement for each of them.

use super::command::strip_non_ascii;
use super::error::{codes, describe_params, DatabaseError, EngineError, Result};
use super::session::RecordCursor;
use super::value::DatabaseValue;

/// Name of the hidden column carrying physical record numbers
pub const RECORD_COLUMN: &str = "__recno";

/// Column of a data table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataColumn {
    pub name: String,
    /// Value assigned by the engine on insert, never written
    pub auto_increment: bool,
}

/// Change state of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Unchanged,
    Added,
    Modified,
    Deleted,
}

/// A row of a data table
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    record: Option<i64>,
    original: Vec<DatabaseValue>,
    current: Vec<DatabaseValue>,
    state: RowState,
}

impl DataRow {
    /// Physical record number, when the row came from storage
    pub fn record(&self) -> Option<i64> {
        self.record
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    /// Current values, in column order
    pub fn values(&self) -> &[DatabaseValue] {
        &self.current
    }

    /// Values as loaded from storage
    pub fn original_values(&self) -> &[DatabaseValue] {
        &self.original
    }

    pub fn get(&self, index: usize) -> Option<&DatabaseValue> {
        self.current.get(index)
    }

    /// Set a value, marking an unchanged row modified when the value differs.
    ///
    /// Integers of either width compare by value.
    pub fn set(&mut self, index: usize, value: DatabaseValue) {
        if let Some(slot) = self.current.get_mut(index) {
            if !slot.same_value(&value) {
                *slot = value;
                if self.state == RowState::Unchanged {
                    self.state = RowState::Modified;
                }
            }
        }
    }

    /// Indexes of columns whose current value differs from the original
    pub fn changed_columns(&self) -> Vec<usize> {
        self.current
            .iter()
            .zip(&self.original)
            .enumerate()
            .filter(|(_, (current, original))| !current.same_value(original))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn delete(&mut self) {
        self.state = RowState::Deleted;
    }

    /// Discard pending changes
    pub fn reject_changes(&mut self) {
        self.current = self.original.clone();
        if self.state != RowState::Added {
            self.state = RowState::Unchanged;
        }
    }
}

/// Result of a query, with per-row change tracking
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    source: Option<String>,
    columns: Vec<DataColumn>,
    rows: Vec<DataRow>,
}

impl DataTable {
    /// Create an empty table with the given columns
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            source: None,
            columns: columns
                .into_iter()
                .map(|name| DataColumn {
                    name: name.into(),
                    auto_increment: false,
                })
                .collect(),
            rows: Vec::new(),
        }
    }

    /// Set the table the rows were read from
    #[must_use]
    pub fn with_source(mut self, table: impl Into<String>) -> Self {
        self.source = Some(table.into());
        self
    }

    /// Table the rows were read from
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn columns(&self) -> &[DataColumn] {
        &self.columns
    }

    /// Index of a column, compared case-insensitively
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Flag a column as engine-assigned; returns false if it does not exist
    pub fn mark_auto_increment(&mut self, name: &str) -> bool {
        match self.column_index(name) {
            Some(index) => {
                self.columns[index].auto_increment = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&DataRow> {
        self.rows.get(index)
    }

    pub fn row_mut(&mut self, index: usize) -> Option<&mut DataRow> {
        self.rows.get_mut(index)
    }

    /// Append a row read from storage
    pub fn load_row(&mut self, record: Option<i64>, values: Vec<DatabaseValue>) {
        self.rows.push(DataRow {
            record,
            original: values.clone(),
            current: values,
            state: RowState::Unchanged,
        });
    }

    /// A row of nulls sized for this table
    pub fn new_row(&self) -> Vec<DatabaseValue> {
        vec![DatabaseValue::Null; self.columns.len()]
    }

    /// Append a row to be inserted, returning its index
    pub fn add_row(&mut self, values: Vec<DatabaseValue>) -> usize {
        self.rows.push(DataRow {
            record: None,
            original: values.clone(),
            current: values,
            state: RowState::Added,
        });
        self.rows.len() - 1
    }

    /// Value of a column in a row
    pub fn value(&self, row: usize, column: &str) -> Option<&DatabaseValue> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }

    /// Set the value of a column in a row
    ///
    /// # Errors
    ///
    /// Returns an error if the column or the row does not exist
    pub fn set_value(&mut self, row: usize, column: &str, value: DatabaseValue) -> Result<()> {
        let index = self
            .column_index(column)
            .ok_or_else(|| DatabaseError::ColumnNotFound(column.to_string()))?;
        let row = self
            .rows
            .get_mut(row)
            .ok_or_else(|| DatabaseError::other(format!("Row {row} out of range")))?;
        row.set(index, value);
        Ok(())
    }

    /// Row holding a physical record
    pub fn find_record(&self, record: i64) -> Option<usize> {
        self.rows.iter().position(|r| r.record == Some(record))
    }

    /// Mark every row deleted
    pub fn delete_all(&mut self) {
        for row in &mut self.rows {
            row.delete();
        }
    }

    /// Whether any row has pending changes
    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(|r| r.state != RowState::Unchanged)
    }

    /// Make current values the new originals and drop deleted rows
    pub fn accept_changes(&mut self) {
        self.rows.retain(|r| r.state != RowState::Deleted);
        for row in &mut self.rows {
            row.original = row.current.clone();
            row.state = RowState::Unchanged;
        }
    }

    /// Copy with non-ASCII characters removed from pending text values
    pub fn sanitized(&self) -> DataTable {
        let mut copy = self.clone();
        for row in copy.rows.iter_mut().filter(|r| r.state != RowState::Unchanged) {
            for value in &mut row.current {
                if let DatabaseValue::String(s) = value {
                    *s = strip_non_ascii(s);
                }
            }
        }
        copy
    }

    /// Discard pending changes and added rows
    pub fn reject_changes(&mut self) {
        self.rows.retain(|r| r.state != RowState::Added);
        for row in &mut self.rows {
            row.reject_changes();
        }
    }
}

/// Cursor over rows already held in memory.
///
/// Used where the engine has no server-side cursor. It never locks.
pub struct MemoryCursor {
    table: DataTable,
    position: isize,
}

impl MemoryCursor {
    pub fn new(table: DataTable) -> Self {
        Self {
            table,
            position: -1,
        }
    }

    fn current_index(&self) -> Option<usize> {
        usize::try_from(self.position)
            .ok()
            .filter(|i| *i < self.table.len())
    }
}

impl RecordCursor for MemoryCursor {
    fn columns(&self) -> Vec<String> {
        self.table.columns().iter().map(|c| c.name.clone()).collect()
    }

    fn read(&mut self) -> std::result::Result<bool, EngineError> {
        if self.position < self.table.len() as isize {
            self.position += 1;
        }
        Ok(self.current_index().is_some())
    }

    fn read_previous(&mut self) -> std::result::Result<bool, EngineError> {
        if self.position >= 0 {
            self.position -= 1;
        }
        Ok(self.current_index().is_some())
    }

    fn is_bof(&self) -> bool {
        self.position < 0
    }

    fn record(&self) -> Option<i64> {
        self.current_index()
            .and_then(|i| self.table.row(i))
            .and_then(DataRow::record)
    }

    fn values(&self) -> Option<Vec<DatabaseValue>> {
        self.current_index()
            .and_then(|i| self.table.row(i))
            .map(|r| r.values().to_vec())
    }

    fn lock_record(&mut self) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    fn unlock_record(&mut self) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    fn set_value(
        &mut self,
        column: usize,
        value: DatabaseValue,
    ) -> std::result::Result<(), EngineError> {
        let index = self
            .current_index()
            .ok_or_else(|| EngineError::new(codes::INVALID_HANDLE, "cursor is not on a row"))?;
        if let Some(row) = self.table.row_mut(index) {
            row.set(column, value);
        }
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) {
        self.position = self.table.len() as isize;
    }
}

/// Forward-only reader over a cursor
pub struct DataReader {
    query: String,
    params: Vec<DatabaseValue>,
    columns: Vec<String>,
    cursor: Box<dyn RecordCursor>,
    current: Option<Vec<DatabaseValue>>,
}

impl DataReader {
    pub fn new(query: impl Into<String>, params: Vec<DatabaseValue>, cursor: Box<dyn RecordCursor>) -> Self {
        let columns = cursor
            .columns()
            .into_iter()
            .filter(|c| c != RECORD_COLUMN)
            .collect();
        Self {
            query: query.into(),
            params,
            columns,
            cursor,
            current: None,
        }
    }

    /// Advance to the next row; false once the rows are exhausted
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to fetch the row
    pub fn read(&mut self) -> Result<bool> {
        let found = self.cursor.read().map_err(|source| DatabaseError::Engine {
            query: self.query.clone(),
            params: describe_params(&self.params),
            source,
        })?;
        self.current = if found { self.cursor.values() } else { None };
        Ok(found)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    /// Value of a column in the current row
    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        let all = self.cursor.columns();
        let index = all.iter().position(|c| c.eq_ignore_ascii_case(column))?;
        self.current.as_ref()?.get(index)
    }
}

impl Drop for DataReader {
    fn drop(&mut self) {
        self.cursor.close();
    }
}
