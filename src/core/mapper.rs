//! Conversion between entity fields and stored values
//!
//! Text is trimmed before storage and cut at the binding's truncation length.
//! Nulls become the type default on both write and read, except where a
//! binding is nullable or converts nulls. Default dates and times are stored
//! as NULL. Enums are stored as their integer value.

use super::command::strip_non_ascii;
use super::entity::Entity;
use super::error::{DatabaseError, Result};
use super::schema::{ColumnBinding, ColumnType, TableSchema};
use super::table::DataTable;
use super::value::DatabaseValue;
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

/// Field value requesting allocation from the `AutoNumbers` table
pub const AUTO_NUMBER_SENTINEL: i64 = -1;

/// In-memory default for a binding's type
pub fn default_value(binding: &ColumnBinding) -> DatabaseValue {
    if binding.is_nullable() {
        return DatabaseValue::Null;
    }
    match binding.column_type() {
        ColumnType::String | ColumnType::Char => DatabaseValue::String(String::new()),
        ColumnType::Bool => DatabaseValue::Bool(false),
        ColumnType::Int => DatabaseValue::Int(0),
        ColumnType::Long | ColumnType::Enum(_) => DatabaseValue::Long(0),
        ColumnType::Decimal => DatabaseValue::Decimal(Decimal::ZERO),
        ColumnType::Double => DatabaseValue::Double(0.0),
        ColumnType::Date | ColumnType::DateTime => DatabaseValue::DateTime(NaiveDateTime::default()),
        ColumnType::Time => DatabaseValue::Time(NaiveTime::default()),
        ColumnType::Bytes => DatabaseValue::Bytes(Vec::new()),
    }
}

/// Whether a field holds the custom auto-number sentinel
pub fn needs_auto_number(binding: &ColumnBinding, value: &DatabaseValue) -> bool {
    binding.custom_auto_number_type().is_some() && value.as_long() == Some(AUTO_NUMBER_SENTINEL)
}

fn enum_value(variants: &[(&str, i64)], text: &str) -> Option<i64> {
    let text = text.trim();
    variants
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(text))
        .map(|(_, value)| *value)
        .or_else(|| text.parse().ok())
}

/// Convert a field value into the value written to storage
///
/// # Errors
///
/// Returns `DataTruncation` for over-long text on a strict binding and
/// `TypeMismatch` when the value cannot be converted
pub fn value_for_storage(binding: &ColumnBinding, value: &DatabaseValue) -> Result<DatabaseValue> {
    if value.is_null() && (binding.converts_to_null() || binding.is_nullable()) {
        return Ok(DatabaseValue::Null);
    }
    let mismatch = |expected: &str| DatabaseError::type_mismatch(expected, value.type_name());

    let stored = match binding.column_type() {
        ColumnType::String | ColumnType::Char => {
            let text = match value {
                DatabaseValue::Null => String::new(),
                DatabaseValue::String(s) => s.trim().to_string(),
                other => other.as_string().trim().to_string(),
            };
            let mut text = if binding.is_ansi_text() {
                strip_non_ascii(&text)
            } else {
                text
            };
            if let Some(limit) = binding.truncate_length() {
                if text.chars().count() > limit {
                    if binding.is_strict_truncation() {
                        return Err(DatabaseError::truncation(binding.column_name(), limit, text));
                    }
                    text = text.chars().take(limit).collect();
                }
            }
            DatabaseValue::String(text)
        }
        ColumnType::Bool if value.is_null() => DatabaseValue::Bool(false),
        ColumnType::Bool => DatabaseValue::Bool(value.as_bool().ok_or_else(|| mismatch("bool"))?),
        ColumnType::Int if value.is_null() => DatabaseValue::Int(0),
        ColumnType::Int => DatabaseValue::Int(value.as_int().ok_or_else(|| mismatch("int"))?),
        ColumnType::Long if value.is_null() => DatabaseValue::Long(0),
        ColumnType::Long => DatabaseValue::Long(value.as_long().ok_or_else(|| mismatch("long"))?),
        ColumnType::Decimal if value.is_null() => DatabaseValue::Decimal(Decimal::ZERO),
        ColumnType::Decimal => {
            DatabaseValue::Decimal(value.as_decimal().ok_or_else(|| mismatch("decimal"))?)
        }
        ColumnType::Double if value.is_null() => DatabaseValue::Double(0.0),
        ColumnType::Double => {
            DatabaseValue::Double(value.as_double().ok_or_else(|| mismatch("double"))?)
        }
        ColumnType::Date | ColumnType::DateTime if value.is_null() => DatabaseValue::Null,
        ColumnType::Date | ColumnType::DateTime => {
            let moment = value.as_datetime().ok_or_else(|| mismatch("datetime"))?;
            if moment == NaiveDateTime::default() {
                DatabaseValue::Null
            } else if binding.column_type() == ColumnType::Date {
                DatabaseValue::DateTime(moment.date().and_time(NaiveTime::MIN))
            } else {
                DatabaseValue::DateTime(moment)
            }
        }
        ColumnType::Time if value.is_null() => DatabaseValue::Null,
        ColumnType::Time => {
            let time = value.as_time().ok_or_else(|| mismatch("time"))?;
            if time == NaiveTime::default() {
                DatabaseValue::Null
            } else {
                DatabaseValue::Time(time)
            }
        }
        ColumnType::Bytes => match value {
            DatabaseValue::Null => DatabaseValue::Bytes(Vec::new()),
            other => DatabaseValue::Bytes(other.as_bytes().ok_or_else(|| mismatch("bytes"))?.to_vec()),
        },
        ColumnType::Enum(_) if value.is_null() => DatabaseValue::Long(0),
        ColumnType::Enum(variants) => {
            let number = match value {
                DatabaseValue::String(name) => enum_value(variants, name),
                other => other.as_long(),
            };
            DatabaseValue::Long(number.ok_or_else(|| mismatch("enum"))?)
        }
    };
    Ok(stored)
}

/// Convert a stored value into the value assigned to a field
///
/// # Errors
///
/// Returns `TypeMismatch` when the stored value cannot be converted
pub fn value_for_field(binding: &ColumnBinding, stored: &DatabaseValue) -> Result<DatabaseValue> {
    if stored.is_null() {
        return Ok(default_value(binding));
    }
    let mismatch = |expected: &str| DatabaseError::type_mismatch(expected, stored.type_name());

    let value = match binding.column_type() {
        ColumnType::String => DatabaseValue::String(stored.as_string()),
        ColumnType::Char => DatabaseValue::String(stored.as_string().trim_end().to_string()),
        ColumnType::Bool => DatabaseValue::Bool(stored.as_bool().ok_or_else(|| mismatch("bool"))?),
        ColumnType::Int => DatabaseValue::Int(stored.as_int().ok_or_else(|| mismatch("int"))?),
        ColumnType::Long => DatabaseValue::Long(stored.as_long().ok_or_else(|| mismatch("long"))?),
        ColumnType::Decimal => {
            DatabaseValue::Decimal(stored.as_decimal().ok_or_else(|| mismatch("decimal"))?)
        }
        ColumnType::Double => {
            DatabaseValue::Double(stored.as_double().ok_or_else(|| mismatch("double"))?)
        }
        ColumnType::Date | ColumnType::DateTime => {
            DatabaseValue::DateTime(stored.as_datetime().ok_or_else(|| mismatch("datetime"))?)
        }
        ColumnType::Time => DatabaseValue::Time(stored.as_time().ok_or_else(|| mismatch("time"))?),
        ColumnType::Bytes => {
            DatabaseValue::Bytes(stored.as_bytes().ok_or_else(|| mismatch("bytes"))?.to_vec())
        }
        ColumnType::Enum(variants) => {
            let number = match stored {
                DatabaseValue::String(text) => enum_value(variants, text),
                other => other.as_long(),
            };
            DatabaseValue::Long(number.ok_or_else(|| mismatch("enum"))?)
        }
    };
    Ok(value)
}

/// Write an entity's saved fields into a row of `table`.
///
/// With `row` set the existing row is updated in place, otherwise a new row
/// is added. Returns the index of the row written.
///
/// # Errors
///
/// Returns `Configuration` if a bound column is missing from the table, or
/// any conversion error from [`value_for_storage`]
pub fn write_row<E: Entity>(
    entity: &E,
    schema: &TableSchema,
    table: &mut DataTable,
    row: Option<usize>,
) -> Result<usize> {
    let mut values = Vec::new();
    for binding in schema.columns().iter().filter(|b| b.saves_to_database()) {
        let index = table.column_index(binding.column_name()).ok_or_else(|| {
            DatabaseError::configuration(format!(
                "column {} of field {} not found in the result of {}",
                binding.column_name(),
                binding.field(),
                table.source().unwrap_or("<query>")
            ))
        })?;
        values.push((index, value_for_storage(binding, &entity.get(binding.field()))?));
    }

    match row.and_then(|index| table.row_mut(index).map(|r| (index, r))) {
        Some((index, existing)) => {
            for (column, value) in values {
                existing.set(column, value);
            }
            Ok(index)
        }
        None => {
            let mut fresh = table.new_row();
            for (column, value) in values {
                fresh[column] = value;
            }
            Ok(table.add_row(fresh))
        }
    }
}

/// Populate an entity's readable fields from a row of `table`
///
/// # Errors
///
/// Returns `Configuration` if a bound column is missing from the table, or
/// any conversion error from [`value_for_field`]
pub fn apply_row<E: Entity>(entity: &mut E, schema: &TableSchema, table: &DataTable, row: usize) -> Result<()> {
    let data = table
        .row(row)
        .ok_or_else(|| DatabaseError::other(format!("Row {row} out of range")))?;

    for binding in schema.columns().iter().filter(|b| b.reads_from_database()) {
        let index = table.column_index(binding.column_name()).ok_or_else(|| {
            DatabaseError::configuration(format!(
                "column {} of field {} not found in the result of {}",
                binding.column_name(),
                binding.field(),
                table.source().unwrap_or("<query>")
            ))
        })?;
        let stored = data.get(index).cloned().unwrap_or(DatabaseValue::Null);
        entity.set(binding.field(), value_for_field(binding, &stored)?)?;
    }
    Ok(())
}

/// Reset every bound field to its type default
///
/// # Errors
///
/// Returns any error raised by the entity's setter
pub fn apply_defaults<E: Entity>(entity: &mut E, schema: &TableSchema) -> Result<()> {
    for binding in schema.columns() {
        entity.set(binding.field(), default_value(binding))?;
    }
    Ok(())
}
