//! SQLite plumbing shared by both engines
//!
//! Both engines keep their rows in SQLite through `rusqlite`. This module
//! maps SQLite failures onto native engine codes, converts values, fetches
//! tables with their physical record numbers and applies table changes.

use crate::core::command::find_keyword_from_end;
use crate::core::error::{codes, EngineError};
use crate::core::query_builder::{DeleteBuilder, InsertBuilder, UpdateBuilder};
use crate::core::table::{DataTable, RowState, RECORD_COLUMN};
use crate::core::value::{DatabaseValue, DATETIME_FORMAT, TIME_FORMAT};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily opened SQLite connection
pub type SqliteHandle = Arc<Mutex<Option<Connection>>>;

/// Map a SQLite failure onto a native engine code
pub(crate) fn map_error(err: rusqlite::Error) -> EngineError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let text = message.clone().unwrap_or_default();
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => codes::TABLE_LOCKED,
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => codes::DISCOVERY_FAILED,
                ErrorCode::ConstraintViolation
                    if text.contains("UNIQUE") || text.contains("PRIMARY KEY") =>
                {
                    codes::UNIQUE_KEY_VIOLATION
                }
                _ => classify_message(&text),
            }
        }
        other => classify_message(&other.to_string()),
    };
    EngineError::new(code, err.to_string())
}

fn classify_message(text: &str) -> u32 {
    let text = text.to_ascii_lowercase();
    if text.contains("no such table") {
        codes::TABLE_NOT_FOUND
    } else if text.contains("no such column") {
        codes::COLUMN_NOT_FOUND
    } else if text.contains("syntax error") || text.contains("incomplete input") {
        codes::SQL_PARSE
    } else if text.contains("no such function") || text.contains("wrong number of arguments") {
        codes::INVALID_FUNCTION
    } else if text.contains("order by term") {
        codes::INVALID_ORDER_BY
    } else if text.contains("integer overflow") {
        codes::NUMERIC_OVERFLOW
    } else {
        codes::GENERAL
    }
}

/// Open a database file
pub(crate) fn open(path: &str) -> Result<Connection, EngineError> {
    let conn = Connection::open(path).map_err(map_error)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")
        .map_err(map_error)?;
    Ok(conn)
}

/// Run `f` on the connection, opening it first if needed
pub(crate) fn with_connection<T>(
    handle: &SqliteHandle,
    path: &str,
    f: impl FnOnce(&Connection) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let mut guard = handle.lock();
    if guard.is_none() {
        *guard = Some(open(path)?);
        log::debug!("Opened database {path}");
    }
    match guard.as_ref() {
        Some(conn) => f(conn),
        None => Err(EngineError::new(codes::DISCOVERY_FAILED, "database is not open")),
    }
}

/// Convert DatabaseValue to rusqlite parameter
pub(crate) fn value_to_param(value: &DatabaseValue) -> Box<dyn rusqlite::ToSql> {
    match value {
        DatabaseValue::Null => Box::new(None::<i64>),
        DatabaseValue::Bool(v) => Box::new(*v),
        DatabaseValue::Int(v) => Box::new(*v),
        DatabaseValue::Long(v) => Box::new(*v),
        DatabaseValue::Double(v) => Box::new(*v),
        DatabaseValue::Decimal(v) => Box::new(v.to_string()),
        DatabaseValue::String(v) => Box::new(v.clone()),
        DatabaseValue::Bytes(v) => Box::new(v.clone()),
        DatabaseValue::DateTime(v) => Box::new(v.format(DATETIME_FORMAT).to_string()),
        DatabaseValue::Time(v) => Box::new(v.format(TIME_FORMAT).to_string()),
    }
}

/// Convert a stored SQLite value
pub(crate) fn value_from_ref(value: ValueRef<'_>) -> DatabaseValue {
    match value {
        ValueRef::Null => DatabaseValue::Null,
        ValueRef::Integer(v) => DatabaseValue::Long(v),
        ValueRef::Real(v) => DatabaseValue::Double(v),
        ValueRef::Text(v) => DatabaseValue::String(String::from_utf8_lossy(v).to_string()),
        ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
    }
}

/// Rewrite a single-table SELECT to also return physical record numbers.
///
/// Returns `None` for queries whose rows do not map to single records.
pub(crate) fn with_record_numbers(query: &str) -> Option<String> {
    let trimmed = query.trim_start();
    let lower = trimmed.to_ascii_lowercase();
    let mut words = lower.split_whitespace();
    if words.next() != Some("select") || words.next() == Some("distinct") {
        return None;
    }
    if ["join", "group", "union", "intersect", "except"]
        .iter()
        .any(|keyword| find_keyword_from_end(&lower, keyword).is_some())
    {
        return None;
    }
    let table = crate::core::command::source_table(trimmed)?;
    if table.starts_with('(') {
        return None;
    }
    Some(format!("SELECT rowid AS {RECORD_COLUMN},{}", &trimmed[6..]))
}

/// Run a query into a table; a leading record column becomes the row record
pub(crate) fn fetch(
    conn: &Connection,
    query: &str,
    params: &[DatabaseValue],
    source: Option<&str>,
) -> Result<DataTable, EngineError> {
    let mut stmt = conn.prepare(query).map_err(map_error)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let skip = usize::from(names.first().map(String::as_str) == Some(RECORD_COLUMN));

    let mut table = DataTable::new(names[skip..].iter().cloned());
    if let Some(source) = source {
        table = table.with_source(source);
    }

    let params: Vec<Box<dyn rusqlite::ToSql>> = params.iter().map(value_to_param).collect();
    let mut rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(map_error)?;
    while let Some(row) = rows.next().map_err(map_error)? {
        let record = if skip == 1 {
            row.get::<_, i64>(0).ok()
        } else {
            None
        };
        let mut values = Vec::with_capacity(names.len() - skip);
        for i in skip..names.len() {
            values.push(value_from_ref(row.get_ref(i).map_err(map_error)?));
        }
        table.load_row(record, values);
    }
    log::trace!("Fetched {} row(s): {query}", table.len());
    Ok(table)
}

/// Execute a statement, returning the rows affected
pub(crate) fn execute(conn: &Connection, query: &str, params: &[DatabaseValue]) -> Result<u64, EngineError> {
    log::trace!("Executing: {query}");
    let params: Vec<Box<dyn rusqlite::ToSql>> = params.iter().map(value_to_param).collect();
    let mut stmt = conn.prepare(query).map_err(map_error)?;
    let affected = stmt
        .execute(params_from_iter(params.iter()))
        .map_err(map_error)?;
    Ok(affected as u64)
}

/// Declared `CHAR(n)`/`VARCHAR(n)` sizes of a table, keyed by lowercase column
pub(crate) fn declared_sizes(conn: &Connection, table: &str) -> Result<HashMap<String, usize>, EngineError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\"")))
        .map_err(map_error)?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .map_err(map_error)?;

    let mut sizes = HashMap::new();
    for column in columns {
        let (name, declared) = column.map_err(map_error)?;
        if let Some(size) = parse_text_size(&declared) {
            sizes.insert(name.to_ascii_lowercase(), size);
        }
    }
    Ok(sizes)
}

fn parse_text_size(declared: &str) -> Option<usize> {
    let declared = declared.trim().to_ascii_lowercase();
    let (kind, rest) = declared.split_once('(')?;
    if !matches!(kind.trim(), "char" | "varchar" | "nchar" | "nvarchar" | "character") {
        return None;
    }
    rest.trim_end_matches(')').trim().parse().ok()
}

/// Fail with a truncation error when text exceeds its declared size
pub(crate) fn check_size(
    sizes: &HashMap<String, usize>,
    column: &str,
    value: &DatabaseValue,
) -> Result<(), EngineError> {
    if let (Some(size), DatabaseValue::String(text)) = (sizes.get(&column.to_ascii_lowercase()), value) {
        if text.chars().count() > *size {
            return Err(EngineError::truncated(column, *size, text.clone()));
        }
    }
    Ok(())
}

/// How changed rows are matched to stored records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    /// By record number; the caller guards against foreign record locks
    Record,
    /// By record number and every original value; a miss is a conflict
    Optimistic,
}

/// Apply the changed rows of a table to its source in one transaction.
///
/// `guard` is called with the record number of every row updated or deleted.
pub(crate) fn apply_changes(
    conn: &Connection,
    table: &DataTable,
    mode: ApplyMode,
    guard: &dyn Fn(&str, i64) -> Result<(), EngineError>,
) -> Result<Option<i64>, EngineError> {
    if !table.has_changes() {
        return Ok(None);
    }
    let tx = conn.unchecked_transaction().map_err(map_error)?;
    let inserted = apply_rows(&tx, table, mode, guard)?;
    tx.commit().map_err(map_error)?;
    Ok(inserted)
}

fn apply_rows(
    conn: &Connection,
    table: &DataTable,
    mode: ApplyMode,
    guard: &dyn Fn(&str, i64) -> Result<(), EngineError>,
) -> Result<Option<i64>, EngineError> {
    let source = table
        .source()
        .ok_or_else(|| EngineError::new(codes::GENERAL, "changes have no source table"))?;
    let sizes = declared_sizes(conn, source)?;
    let columns = table.columns();
    let mut inserted = None;

    for row in table.rows() {
        match row.state() {
            RowState::Unchanged => {}
            RowState::Added => {
                let mut insert = InsertBuilder::new(source);
                for (column, value) in columns.iter().zip(row.values()) {
                    if column.auto_increment {
                        continue;
                    }
                    check_size(&sizes, &column.name, value)?;
                    insert = insert.value(&column.name, value.clone());
                }
                execute(conn, &insert.build(), &insert.params())?;
                inserted = Some(conn.last_insert_rowid());
            }
            RowState::Modified => {
                let record = row
                    .record()
                    .ok_or_else(|| EngineError::new(codes::GENERAL, "modified row has no record"))?;
                guard(source, record)?;

                let changed = row.changed_columns();
                if changed.is_empty() {
                    continue;
                }
                let mut update = UpdateBuilder::new(source);
                for index in changed {
                    let value = &row.values()[index];
                    check_size(&sizes, &columns[index].name, value)?;
                    update = update.set(&columns[index].name, value.clone());
                }
                update = update.where_eq("rowid", record);
                if mode == ApplyMode::Optimistic {
                    for (column, original) in columns.iter().zip(row.original_values()) {
                        update = update.where_is(&column.name, original.clone());
                    }
                }
                if execute(conn, &update.build(), &update.params())? == 0 {
                    return Err(EngineError::new(
                        codes::ROW_VERSION_MISMATCH,
                        format!("record {record} of {source} was changed by another user"),
                    ));
                }
            }
            RowState::Deleted => {
                let Some(record) = row.record() else {
                    continue;
                };
                guard(source, record)?;

                let mut delete = DeleteBuilder::new(source).where_eq("rowid", record);
                if mode == ApplyMode::Optimistic {
                    for (column, original) in columns.iter().zip(row.original_values()) {
                        delete = delete.where_is(&column.name, original.clone());
                    }
                }
                let affected = execute(conn, &delete.build(), &delete.params())?;
                if affected == 0 && mode == ApplyMode::Optimistic {
                    return Err(EngineError::new(
                        codes::ROW_VERSION_MISMATCH,
                        format!("record {record} of {source} was changed by another user"),
                    ));
                }
            }
        }
    }

    Ok(inserted.filter(|_| columns.iter().any(|c| c.auto_increment)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Result<Connection, EngineError> {
        let conn = open(":memory:")?;
        conn.execute_batch(
            "CREATE TABLE Customers (ID INTEGER PRIMARY KEY, Name VARCHAR(5), Notes TEXT);
             INSERT INTO Customers (ID, Name, Notes) VALUES (1, 'Ann', NULL), (2, 'Bob', 'x');",
        )
        .map_err(map_error)?;
        Ok(conn)
    }

    #[test]
    fn test_record_number_rewrite() {
        assert_eq!(
            with_record_numbers("SELECT * FROM Customers WHERE ID = ?").as_deref(),
            Some("SELECT rowid AS __recno, * FROM Customers WHERE ID = ?")
        );
        assert_eq!(with_record_numbers("SELECT DISTINCT Name FROM Customers"), None);
        assert_eq!(
            with_record_numbers("SELECT * FROM A JOIN B ON A.ID = B.ID"),
            None
        );
        assert_eq!(with_record_numbers("UPDATE Customers SET Name = ''"), None);
    }

    #[test]
    fn test_fetch_splits_record_numbers() -> Result<(), EngineError> {
        let conn = memory()?;
        let table = fetch(
            &conn,
            "SELECT rowid AS __recno, * FROM Customers ORDER BY ID",
            &[],
            Some("Customers"),
        )?;
        assert_eq!(table.columns().len(), 3);
        assert_eq!(table.rows()[1].record(), Some(2));
        assert_eq!(table.value(0, "Notes"), Some(&DatabaseValue::Null));
        Ok(())
    }

    #[test]
    fn test_error_mapping() -> Result<(), EngineError> {
        let conn = memory()?;
        let code = |sql: &str| fetch(&conn, sql, &[], None).map(|_| ()).unwrap_err().code;
        assert_eq!(code("SELECT * FROM Missing"), codes::TABLE_NOT_FOUND);
        assert_eq!(code("SELECT Missing FROM Customers"), codes::COLUMN_NOT_FOUND);
        assert_eq!(code("SELEC * FROM Customers"), codes::SQL_PARSE);
        assert_eq!(code("SELECT nosuch(ID) FROM Customers"), codes::INVALID_FUNCTION);

        let err = execute(&conn, "INSERT INTO Customers (ID, Name) VALUES (1, 'Dup')", &[]).unwrap_err();
        assert_eq!(err.code, codes::UNIQUE_KEY_VIOLATION);

        let err = fetch(
            &conn,
            "SELECT * FROM Customers WHERE ID = abs(?)",
            &[DatabaseValue::Long(i64::MIN)],
            None,
        )
        .unwrap_err();
        assert_eq!(err.code, codes::NUMERIC_OVERFLOW);
        Ok(())
    }

    #[test]
    fn test_declared_sizes_are_enforced() -> Result<(), EngineError> {
        let conn = memory()?;
        let sizes = declared_sizes(&conn, "Customers")?;
        assert_eq!(sizes.get("name"), Some(&5));
        assert!(check_size(&sizes, "Name", &"Annie".into()).is_ok());
        let err = check_size(&sizes, "Name", &"Annabel".into()).unwrap_err();
        assert_eq!(err.code, codes::DATA_TRUNCATED);
        Ok(())
    }

    #[test]
    fn test_optimistic_apply_detects_conflict() -> Result<(), EngineError> {
        let conn = memory()?;
        let query = "SELECT rowid AS __recno, * FROM Customers WHERE ID = 1";
        let mut table = fetch(&conn, query, &[], Some("Customers"))?;
        execute(&conn, "UPDATE Customers SET Name = 'Anna' WHERE ID = 1", &[])?;

        if let Some(row) = table.row_mut(0) {
            row.set(1, "Ann2".into());
        }
        let err = apply_changes(&conn, &table, ApplyMode::Optimistic, &|_, _| Ok(())).unwrap_err();
        assert_eq!(err.code, codes::ROW_VERSION_MISMATCH);

        let mut fresh = fetch(&conn, query, &[], Some("Customers"))?;
        if let Some(row) = fresh.row_mut(0) {
            row.set(1, "Ann3".into());
        }
        apply_changes(&conn, &fresh, ApplyMode::Optimistic, &|_, _| Ok(()))?;
        let stored = fetch(&conn, query, &[], None)?;
        assert_eq!(stored.value(0, "Name"), Some(&DatabaseValue::from("Ann3")));
        Ok(())
    }

    #[test]
    fn test_insert_skips_auto_increment() -> Result<(), EngineError> {
        let conn = memory()?;
        let mut table = fetch(&conn, "SELECT * FROM Customers WHERE 0 = 1", &[], Some("Customers"))?;
        table.mark_auto_increment("ID");
        table.add_row(vec![DatabaseValue::Long(0), "Cy".into(), DatabaseValue::Null]);
        let id = apply_changes(&conn, &table, ApplyMode::Record, &|_, _| Ok(()))?;
        assert_eq!(id, Some(3));
        Ok(())
    }
}
