//! Core record-locking persistence types and traits
//!
//! This module provides the building blocks shared by both engines: values,
//! in-memory tables, commands, the `Connection` trait, retry and alerting,
//! entity descriptors, the field mapper, and the `DatabaseTable` façade.

pub mod alert;
pub mod command;
pub mod config;
pub mod connection;
pub mod database_table;
pub mod database_types;
pub mod detail;
pub mod entity;
pub mod error;
pub mod locking;
pub mod mapper;
pub mod query_builder;
pub mod retry;
pub mod schema;
pub mod session;
pub mod table;
pub mod value;

// Re-export commonly used types
pub use alert::{Alert, AlertSink, LogAlertSink};
pub use command::Command;
pub use config::{DatabaseConfig, RetrySettings};
pub use connection::{Connection, ConnectionFactory, ConnectionSource, DataContext, Lease};
pub use database_table::{CascadeToken, DatabaseTable, EntityState};
pub use database_types::DatabaseType;
pub use detail::{DetailList, DetailMap, DetailMember, ParentRow};
pub use entity::Entity;
pub use error::{DatabaseError, EngineError, Result};
pub use query_builder::{DeleteBuilder, InsertBuilder, SelectBuilder, UpdateBuilder};
pub use retry::{ErrorClass, RetryPolicy};
pub use schema::{ColumnBinding, ColumnType, TableSchema};
pub use session::{DatabaseData, RecordCursor};
pub use table::{DataReader, DataRow, DataTable, RowState};
pub use value::DatabaseValue;
