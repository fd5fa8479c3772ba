//! Connection abstraction
//!
//! Defines the `Connection` trait implemented by each engine, and the
//! `DataContext` handing entities the connection for their engine.

use super::alert::Alert;
use super::command::Command;
use super::config::DatabaseConfig;
use super::database_types::DatabaseType;
use super::error::{DatabaseError, Result};
use super::query_builder::{InsertBuilder, SelectBuilder};
use super::session::DatabaseData;
use super::table::{DataReader, DataTable};
use super::value::DatabaseValue;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Table holding custom auto-number counters
pub const AUTO_NUMBER_TABLE: &str = "AutoNumbers";

/// Engine connection with record-lock primitives
#[async_trait]
pub trait Connection: Send + Sync {
    /// Engine this connection talks to
    fn database_type(&self) -> DatabaseType;

    /// Configuration the connection was created with
    fn config(&self) -> &DatabaseConfig;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Report an operational alert to the connection's sink
    fn alert(&self, alert: &Alert);

    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection, releasing any locks it still holds
    async fn close_connection(&self) -> Result<()>;

    /// Build a command, using the configured timeout unless one is given
    fn get_command(&self, query: &str, params: Vec<DatabaseValue>, timeout: Option<Duration>) -> Command {
        Command::new(query, params).with_timeout(timeout.unwrap_or_else(|| self.config().command_timeout()))
    }

    /// Run a query and return every row
    async fn get_data(&self, command: &Command) -> Result<DataTable>;

    /// Run a query and read the rows forward
    async fn get_data_reader(&self, command: &Command) -> Result<DataReader>;

    /// Apply the changed rows of `table`, selected by `command`.
    ///
    /// Returns the engine-assigned value of the last inserted row when the
    /// table has an auto-increment column.
    async fn update_data(&self, command: &Command, table: &mut DataTable) -> Result<Option<i64>>;

    /// Delete every row the command selects
    async fn delete_data(&self, command: &Command) -> Result<()> {
        let mut table = self.get_data(command).await?;
        table.delete_all();
        self.update_data(command, &mut table).await.map(|_| ())
    }

    /// Execute a statement, returning the rows affected
    async fn execute_command(&self, command: &Command) -> Result<u64>;

    /// Lock every row the command selects
    async fn get_data_and_lock(&self, command: &Command) -> Result<DatabaseData>;

    /// Release the session's locks without writing; a no-op when already released
    async fn unlock_without_updating(&self, session: &mut DatabaseData) -> Result<()>;

    /// Release the session's locks, then apply its changed rows
    async fn update_data_and_unlock(&self, session: &mut DatabaseData) -> Result<Option<i64>>;

    /// Write the session's modified rows while keeping the locks
    async fn update_locked_data(&self, session: &mut DatabaseData) -> Result<()>;

    /// Delete every locked row and release the session
    async fn delete_locked_data(&self, session: &mut DatabaseData) -> Result<()> {
        session.table_mut().delete_all();
        self.update_data_and_unlock(session).await.map(|_| ())
    }

    /// Allocate the next value of a custom auto-number counter.
    ///
    /// Locks the counter row, increments it, writes it through the lock and
    /// unlocks. A missing counter is inserted at 1 and then allocated through
    /// the same lock; when another connection inserts it first, the insert's
    /// key violation is ignored.
    async fn get_next_custom_auto_number(&self, number_type: i32) -> Result<i64> {
        let select = SelectBuilder::new(AUTO_NUMBER_TABLE).where_eq("NumberType", number_type);
        let command = self.get_command(&select.build(), select.params(), None);
        let mut created = false;

        loop {
            let mut session = self.get_data_and_lock(&command).await?;
            if !session.table().is_empty() {
                let next = session
                    .table()
                    .value(0, "NextNumber")
                    .and_then(DatabaseValue::as_long)
                    .unwrap_or(1);
                session
                    .table_mut()
                    .set_value(0, "NextNumber", DatabaseValue::Long(next + 1))?;

                let written = self.update_locked_data(&mut session).await;
                self.unlock_without_updating(&mut session).await?;
                written?;
                log::debug!("Allocated auto-number {next} of counter {number_type}");
                return Ok(next);
            }

            self.unlock_without_updating(&mut session).await?;
            if created {
                return Err(DatabaseError::other(format!(
                    "auto-number counter {number_type} is missing from {AUTO_NUMBER_TABLE}"
                )));
            }
            let insert = InsertBuilder::new(AUTO_NUMBER_TABLE)
                .value("NumberType", number_type)
                .value("NextNumber", 1i64);
            match self
                .execute_command(&self.get_command(&insert.build(), insert.params(), None))
                .await
            {
                Ok(_) => log::debug!("Created auto-number counter {number_type}"),
                Err(DatabaseError::KeyViolation { .. }) => {
                    log::debug!("Auto-number counter {number_type} was created by another connection");
                }
                Err(e) => return Err(e),
            }
            created = true;
        }
    }

    /// Users holding record locks on the rows `command` selects from `table`
    async fn get_locking_users(&self, table: &str, command: &Command) -> Result<Vec<String>>;
}

/// Opens per-operation connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new, connected connection
    async fn open(&self) -> Result<Arc<dyn Connection>>;
}

/// Where entities of one engine get their connection
#[derive(Clone)]
pub enum ConnectionSource {
    /// One process-wide connection, never closed by entities
    Global(Arc<dyn Connection>),
    /// A fresh connection per entity, closed when the entity is disposed
    PerOperation(Arc<dyn ConnectionFactory>),
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionSource::Global(c) => write!(f, "Global({})", c.database_type()),
            ConnectionSource::PerOperation(_) => write!(f, "PerOperation"),
        }
    }
}

/// Connection acquired from a source
pub struct Lease {
    pub connection: Arc<dyn Connection>,
    /// Whether the holder must close the connection
    pub owned: bool,
}

impl ConnectionSource {
    /// Get a connection from this source
    ///
    /// # Errors
    ///
    /// Returns an error if a per-operation connection cannot be opened
    pub async fn acquire(&self) -> Result<Lease> {
        match self {
            ConnectionSource::Global(connection) => Ok(Lease {
                connection: Arc::clone(connection),
                owned: false,
            }),
            ConnectionSource::PerOperation(factory) => Ok(Lease {
                connection: factory.open().await?,
                owned: true,
            }),
        }
    }
}

/// Connection sources by engine, handed to every entity
#[derive(Debug, Clone, Default)]
pub struct DataContext {
    sources: HashMap<DatabaseType, ConnectionSource>,
}

impl DataContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the source for an engine
    #[must_use]
    pub fn with_source(mut self, database_type: DatabaseType, source: ConnectionSource) -> Self {
        self.sources.insert(database_type, source);
        self
    }

    /// Source registered for an engine
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if no source is registered
    pub fn source(&self, database_type: DatabaseType) -> Result<&ConnectionSource> {
        self.sources.get(&database_type).ok_or_else(|| {
            DatabaseError::configuration(format!("no connection configured for the {database_type} engine"))
        })
    }

    /// Get a connection for an engine
    ///
    /// # Errors
    ///
    /// Returns an error if no source is registered or the connection fails to open
    pub async fn acquire(&self, database_type: DatabaseType) -> Result<Lease> {
        self.source(database_type)?.acquire().await
    }
}
