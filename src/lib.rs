//! # Rust Record Lock
//!
//! A record-locking persistence layer: plain structs are mapped to tables,
//! loaded with or without a lock on their rows, edited in memory and written
//! back, with updates and deletes cascading to their detail collections.
//!
//! Two engines are supported. The **desktop** engine locks records
//! pessimistically: a locked row cannot be locked or written by another
//! connection until it is released. The **server** engine has no record
//! locks and detects conflicting edits optimistically when writing.
//!
//! ## Features
//!
//! - **Entity Mapping**: Column bindings with trimming, truncation, null and
//!   default handling, enums and date/time values
//! - **Record Locks**: Lock, write through the lock, and release sessions
//! - **Master/Detail Cascades**: Detail rows removed from a collection are
//!   deleted when the parent is updated
//! - **Retry and Alerts**: Lock and connection failures are retried on a
//!   schedule and escalated to an alert sink
//! - **Async Support**: Async/await with Tokio; driver calls run on the
//!   blocking pool under the command timeout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_record_lock::prelude::*;
//!
//! #[derive(Default)]
//! struct Customer {
//!     id: i32,
//!     name: String,
//! }
//!
//! impl Entity for Customer {
//!     fn describe() -> TableSchema {
//!         TableSchema::new("Customers", DatabaseType::Desktop)
//!             .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key().auto_number())
//!             .column(ColumnBinding::new("name", ColumnType::String).column("Name").truncate_at(40))
//!     }
//!
//!     fn get(&self, field: &str) -> DatabaseValue {
//!         match field {
//!             "id" => self.id.into(),
//!             "name" => self.name.as_str().into(),
//!             _ => DatabaseValue::Null,
//!         }
//!     }
//!
//!     fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
//!         match field {
//!             "id" => self.id = value.take()?,
//!             "name" => self.name = value.take()?,
//!             _ => {}
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let context = open_context([DatabaseConfig::new(DatabaseType::Desktop, "shop.db")]).await?;
//!
//!     let mut customer = DatabaseTable::new(Customer { id: 7, ..Default::default() }, context)?;
//!     if customer.initialize(true).await? {
//!         customer.name = "Acme Ltd".to_string();
//!         customer.update().await?;
//!     } else {
//!         customer.unlock_without_updating().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Project Structure
//!
//! ```text
//! src/
//! ├── core/                  # Engine-independent types and traits
//! │   ├── connection.rs      # Connection trait and DataContext
//! │   ├── database_table.rs  # Entity façade
//! │   ├── detail.rs          # Detail collections
//! │   ├── mapper.rs          # Field/column conversion
//! │   ├── retry.rs           # Retry policy
//! │   └── ...
//! ├── backends/              # Engine implementations
//! │   ├── desktop/           # Record-locking engine
//! │   ├── server.rs          # Optimistic engine
//! │   └── sqlite.rs          # Shared SQLite plumbing
//! └── lib.rs
//! ```

/// Core record-locking types and traits
pub mod core;

/// Engine implementations
pub mod backends;

/// Prelude for convenient imports
///
/// ```rust
/// use rust_record_lock::prelude::*;
///
/// let config = DatabaseConfig::new(DatabaseType::Server, "orders.db");
/// assert!(!config.database_type.uses_record_locks());
/// ```
pub mod prelude {
    pub use crate::backends::{open_context, open_context_with_alerts};
    pub use crate::core::{
        Alert, AlertSink, ColumnBinding, ColumnType, Command, Connection, DataContext, DataTable,
        DatabaseConfig, DatabaseError, DatabaseTable, DatabaseType, DatabaseValue, DetailList,
        DetailMap, DetailMember, Entity, EntityState, Result, RetrySettings, TableSchema,
    };
}

// Re-export at root level for convenience
pub use backends::{open_context, open_context_with_alerts};
pub use core::{
    DataContext, DatabaseConfig, DatabaseError, DatabaseTable, DatabaseType, DatabaseValue,
    Entity, Result, TableSchema,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use prelude::*;

        let db_type = DatabaseType::default();
        assert_eq!(db_type, DatabaseType::Desktop);
        assert!(db_type.uses_record_locks());
        assert!(db_type.uses_global_connection());
    }

    #[test]
    fn test_value_conversions() {
        use prelude::*;

        let val: DatabaseValue = 42.into();
        assert_eq!(val.as_int(), Some(42));

        let val: DatabaseValue = "test".into();
        assert_eq!(val.as_string(), "test");

        let val: DatabaseValue = true.into();
        assert_eq!(val.as_bool(), Some(true));
    }
}
