//! Record locking protocol
//!
//! Engine-agnostic steps run against a [`RecordCursor`]:
//!
//! - `lock_all` reads every row forward, locking each record as it is
//!   visited, then reads back to the first row so a consumer starts from the
//!   beginning.
//! - `unlock_all` walks backward releasing each record, then closes the
//!   cursor. Handles that are already invalid count as released.
//! - `write_rows` writes modified rows through the cursor. If a field write
//!   fails, the record is re-fetched and every field re-applied before the
//!   error is returned, so nothing half-written is persisted when the locks
//!   are later released.

use super::error::{codes, EngineError};
use super::session::RecordCursor;
use super::table::{DataTable, RowState};

/// Lock every record the cursor returns.
///
/// On failure the records locked so far are released and the cursor closed.
pub fn lock_all(cursor: &mut dyn RecordCursor, source: Option<&str>) -> Result<DataTable, EngineError> {
    let mut table = DataTable::new(cursor.columns());
    if let Some(source) = source {
        table = table.with_source(source);
    }

    if let Err(e) = lock_forward(cursor, &mut table) {
        if let Err(release) = release_backward(cursor) {
            log::warn!("Failed to release partial locks: {release}");
        }
        cursor.close();
        return Err(e);
    }

    while cursor.read_previous()? {}
    log::debug!("Locked {} record(s) from {:?}", table.len(), table.source());
    Ok(table)
}

fn lock_forward(cursor: &mut dyn RecordCursor, table: &mut DataTable) -> Result<(), EngineError> {
    while cursor.read()? {
        cursor.lock_record()?;
        table.load_row(cursor.record(), cursor.values().unwrap_or_default());
    }
    Ok(())
}

fn release_backward(cursor: &mut dyn RecordCursor) -> Result<(), EngineError> {
    while cursor.read_previous()? {
        cursor.unlock_record()?;
    }
    Ok(())
}

/// Release every record lock and close the cursor
pub fn unlock_all(cursor: &mut dyn RecordCursor) -> Result<(), EngineError> {
    let result = (|| {
        while cursor.read()? {}
        release_backward(cursor)
    })();
    cursor.close();

    match result {
        Err(e) if e.is_invalid_handle() => {
            log::debug!("Cursor already released: {e}");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(()) => {
            log::debug!("Released record locks");
            Ok(())
        }
    }
}

/// Write the modified rows of `table` through a locked cursor.
///
/// `refetch` re-runs the session's original query; it is only called to
/// restore a record after a failed write.
pub fn write_rows<F>(cursor: &mut dyn RecordCursor, table: &DataTable, refetch: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<DataTable, EngineError>,
{
    let mut refetch = Some(refetch);

    for row in table.rows() {
        match row.state() {
            RowState::Unchanged => continue,
            RowState::Modified => {}
            RowState::Added | RowState::Deleted => {
                return Err(EngineError::new(
                    codes::GENERAL,
                    "only modified rows can be written through a locked cursor",
                ));
            }
        }

        let record = row.record().ok_or_else(|| {
            EngineError::new(codes::INVALID_HANDLE, "row has no physical record")
        })?;
        if !cursor.seek(record)? {
            return Err(EngineError::new(
                codes::INVALID_HANDLE,
                format!("record {record} is not part of the locked set"),
            ));
        }

        for column in row.changed_columns() {
            let value = row.values()[column].clone();
            if let Err(e) = cursor.set_value(column, value) {
                if let Some(refetch) = refetch.take() {
                    if let Err(restore) = restore(cursor, record, refetch) {
                        log::warn!("Failed to restore record {record} after write error: {restore}");
                    }
                }
                return Err(e);
            }
        }
    }

    cursor.flush()
}

fn restore<F>(cursor: &mut dyn RecordCursor, record: i64, refetch: F) -> Result<(), EngineError>
where
    F: FnOnce() -> Result<DataTable, EngineError>,
{
    let fresh = refetch()?;
    let row = fresh
        .find_record(record)
        .and_then(|index| fresh.row(index))
        .ok_or_else(|| EngineError::new(codes::GENERAL, format!("record {record} vanished")))?;

    for (column, value) in row.values().iter().enumerate() {
        cursor.set_value(column, value.clone())?;
    }
    cursor.flush()?;
    log::debug!("Restored record {record} to its locked snapshot");
    Ok(())
}
