//! Entity schema descriptors
//!
//! Each entity type describes its table and column bindings once through
//! [`Entity::describe`](super::entity::Entity::describe). Descriptors are
//! cached per type for the lifetime of the process.

use super::database_types::DatabaseType;
use super::entity::Entity;
use super::error::{DatabaseError, Result};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Semantic type of a bound field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    /// Fixed-width text; trailing padding is dropped on read
    Char,
    Bool,
    Int,
    Long,
    Decimal,
    Double,
    /// Date without a meaningful time of day
    Date,
    DateTime,
    Time,
    Bytes,
    /// Enumeration stored as its integer value, with `(name, value)` pairs
    Enum(&'static [(&'static str, i64)]),
}

impl ColumnType {
    /// Whether values of this type are text
    pub fn is_text(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Char)
    }
}

/// Binding of an entity field to a table column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    field: &'static str,
    column: String,
    column_type: ColumnType,
    primary_key: bool,
    secondary_key: bool,
    read_from_database: bool,
    save_to_database: bool,
    auto_number: bool,
    custom_auto_number: Option<i32>,
    convert_to_null: bool,
    truncate_at: Option<usize>,
    strict_truncation: bool,
    nullable: bool,
    sql_string_data_type: Option<String>,
}

impl ColumnBinding {
    /// Bind `field` to a column of the same name
    pub fn new(field: &'static str, column_type: ColumnType) -> Self {
        Self {
            field,
            column: field.to_string(),
            column_type,
            primary_key: false,
            secondary_key: false,
            read_from_database: true,
            save_to_database: true,
            auto_number: false,
            custom_auto_number: None,
            convert_to_null: false,
            truncate_at: None,
            strict_truncation: false,
            nullable: false,
            sql_string_data_type: None,
        }
    }

    /// Use a column name different from the field name
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn secondary_key(mut self) -> Self {
        self.secondary_key = true;
        self
    }

    /// Never populate the field from storage
    #[must_use]
    pub fn write_only(mut self) -> Self {
        self.read_from_database = false;
        self
    }

    /// Never write the field to storage
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.save_to_database = false;
        self
    }

    /// Value assigned by the engine on insert
    #[must_use]
    pub fn auto_number(mut self) -> Self {
        self.auto_number = true;
        self
    }

    /// Value allocated from the `AutoNumbers` counter of `number_type`
    #[must_use]
    pub fn custom_auto_number(mut self, number_type: i32) -> Self {
        self.custom_auto_number = Some(number_type);
        self
    }

    /// Write NULL when the field is null instead of the type default
    #[must_use]
    pub fn convert_to_null(mut self) -> Self {
        self.convert_to_null = true;
        self
    }

    /// Silently cut stored text at `length` characters
    #[must_use]
    pub fn truncate_at(mut self, length: usize) -> Self {
        self.truncate_at = Some(length);
        self
    }

    /// Fail the update with `DataTruncation` instead of cutting text
    #[must_use]
    pub fn strict_truncation(mut self) -> Self {
        self.strict_truncation = true;
        self
    }

    /// Keep NULL as NULL in both directions
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// SQL type of a text column, e.g. `varchar` or `nvarchar`
    #[must_use]
    pub fn sql_string_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.sql_string_data_type = Some(data_type.into());
        self
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn column_name(&self) -> &str {
        &self.column
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_secondary_key(&self) -> bool {
        self.secondary_key
    }

    pub fn reads_from_database(&self) -> bool {
        self.read_from_database
    }

    pub fn saves_to_database(&self) -> bool {
        self.save_to_database
    }

    pub fn is_auto_number(&self) -> bool {
        self.auto_number
    }

    pub fn custom_auto_number_type(&self) -> Option<i32> {
        self.custom_auto_number
    }

    pub fn converts_to_null(&self) -> bool {
        self.convert_to_null
    }

    pub fn truncate_length(&self) -> Option<usize> {
        self.truncate_at
    }

    pub fn is_strict_truncation(&self) -> bool {
        self.strict_truncation
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Whether the column stores single-byte text only
    pub fn is_ansi_text(&self) -> bool {
        self.sql_string_data_type
            .as_deref()
            .map(|t| {
                let t = t.trim().to_ascii_lowercase();
                t.starts_with("char") || t.starts_with("varchar")
            })
            .unwrap_or(false)
    }
}

/// Table descriptor of an entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table: Option<String>,
    database_type: DatabaseType,
    is_detail: bool,
    columns: Vec<ColumnBinding>,
}

impl TableSchema {
    /// Describe a table on an engine
    pub fn new(table: impl Into<String>, database_type: DatabaseType) -> Self {
        Self {
            table: Some(table.into()),
            database_type,
            is_detail: false,
            columns: Vec::new(),
        }
    }

    /// Descriptor without a table; persistence operations fail with `NotSupported`
    pub fn unbound() -> Self {
        Self {
            table: None,
            database_type: DatabaseType::default(),
            is_detail: false,
            columns: Vec::new(),
        }
    }

    /// Mark the table as a detail of a parent entity
    #[must_use]
    pub fn detail(mut self) -> Self {
        self.is_detail = true;
        self
    }

    /// Add a column binding
    #[must_use]
    pub fn column(mut self, binding: ColumnBinding) -> Self {
        self.columns.push(binding);
        self
    }

    /// Name of the table
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the descriptor has no table
    pub fn table_name(&self) -> Result<&str> {
        self.table
            .as_deref()
            .ok_or_else(|| DatabaseError::not_supported("entity does not declare a table"))
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    pub fn is_detail(&self) -> bool {
        self.is_detail
    }

    /// Bindings in declaration order
    pub fn columns(&self) -> &[ColumnBinding] {
        &self.columns
    }

    /// Binding of a field; fields without one are not persisted
    pub fn binding(&self, field: &str) -> Option<&ColumnBinding> {
        self.columns.iter().find(|c| c.field == field)
    }

    /// Binding of a column, compared case-insensitively
    pub fn binding_for_column(&self, column: &str) -> Option<&ColumnBinding> {
        self.columns
            .iter()
            .find(|c| c.column.eq_ignore_ascii_case(column))
    }

    pub fn primary_keys(&self) -> Vec<&ColumnBinding> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn secondary_keys(&self) -> Vec<&ColumnBinding> {
        self.columns.iter().filter(|c| c.secondary_key).collect()
    }

    pub fn non_primary(&self) -> Vec<&ColumnBinding> {
        self.columns.iter().filter(|c| !c.primary_key).collect()
    }

    /// Engine-assigned column, if any
    pub fn auto_number(&self) -> Option<&ColumnBinding> {
        self.columns.iter().find(|c| c.auto_number)
    }

    pub fn custom_auto_numbers(&self) -> Vec<&ColumnBinding> {
        self.columns
            .iter()
            .filter(|c| c.custom_auto_number.is_some())
            .collect()
    }

    /// Check the descriptor for inconsistent bindings
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(DatabaseError::configuration(format!(
                "table {} declares no columns",
                self.table.as_deref().unwrap_or("<unbound>")
            )));
        }
        for (i, binding) in self.columns.iter().enumerate() {
            if self.columns[..i]
                .iter()
                .any(|c| c.field == binding.field || c.column.eq_ignore_ascii_case(&binding.column))
            {
                return Err(DatabaseError::configuration(format!(
                    "field {} or column {} is bound twice",
                    binding.field, binding.column
                )));
            }
        }
        if self.columns.iter().filter(|c| c.auto_number).count() > 1 {
            return Err(DatabaseError::configuration(
                "at most one column can be an engine auto-number",
            ));
        }
        Ok(())
    }
}

static SCHEMAS: LazyLock<RwLock<HashMap<TypeId, Arc<TableSchema>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Cached descriptor of an entity type
///
/// # Errors
///
/// Returns a `Configuration` error if the descriptor is inconsistent
pub fn schema_of<E: Entity>() -> Result<Arc<TableSchema>> {
    let id = TypeId::of::<E>();
    if let Some(schema) = SCHEMAS.read().get(&id) {
        return Ok(Arc::clone(schema));
    }

    let schema = E::describe();
    schema.validate()?;
    let mut schemas = SCHEMAS.write();
    Ok(Arc::clone(
        schemas.entry(id).or_insert_with(|| Arc::new(schema)),
    ))
}
