//! Server engine connection
//!
//! The server engine has no record locks. A lock session holds the fetched
//! rows, and writes are applied in a transaction guarded by the originally
//! read values, so a row changed by someone else fails the write with a
//! concurrency conflict instead of being overwritten.

use crate::backends::blocking::submit;
use crate::backends::sqlite::{self, ApplyMode, SqliteHandle};
use crate::core::alert::{Alert, AlertSink};
use crate::core::command::Command;
use crate::core::config::DatabaseConfig;
use crate::core::connection::{Connection, ConnectionFactory};
use crate::core::database_types::DatabaseType;
use crate::core::error::{EngineError, Result};
use crate::core::retry::RetryPolicy;
use crate::core::session::DatabaseData;
use crate::core::table::{DataReader, DataTable, MemoryCursor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct Target {
    handle: SqliteHandle,
    path: Arc<str>,
}

impl Target {
    fn with<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> std::result::Result<T, EngineError>) -> std::result::Result<T, EngineError> {
        sqlite::with_connection(&self.handle, &self.path, f)
    }
}

/// Connection to the server engine
pub struct ServerConnection {
    target: Target,
    config: DatabaseConfig,
    retry: RetryPolicy,
    connected: AtomicBool,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("path", &self.target.path)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            target: Target {
                handle: Arc::new(Mutex::new(None)),
                path: Arc::from(config.connection_string.as_str()),
            },
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// Report operational alerts to `alerts`
    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.retry = self.retry.with_alert_sink(alerts);
        self
    }
}

#[async_trait]
impl Connection for ServerConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Server
    }

    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn alert(&self, alert: &Alert) {
        self.retry.notify(alert);
    }

    async fn connect(&self) -> Result<()> {
        let command = self.get_command(&format!("CONNECT {}", self.target.path), Vec::new(), None);
        submit(&self.retry, &command, self.target.clone(), |target, _| target.with(|_| Ok(()))).await?;
        self.connected.store(true, Ordering::SeqCst);
        log::debug!("Connected to server database {}", self.target.path);
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.target.handle.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_data(&self, command: &Command) -> Result<DataTable> {
        submit(&self.retry, command, self.target.clone(), |target, cmd| {
            target.with(|conn| match sqlite::with_record_numbers(cmd.query()) {
                Some(numbered) => sqlite::fetch(conn, &numbered, cmd.params(), cmd.source_table().as_deref()),
                None => sqlite::fetch(conn, cmd.query(), cmd.params(), None),
            })
        })
        .await
    }

    async fn get_data_reader(&self, command: &Command) -> Result<DataReader> {
        let table = self.get_data(command).await?;
        Ok(DataReader::new(
            command.query(),
            command.params().to_vec(),
            Box::new(MemoryCursor::new(table)),
        ))
    }

    async fn update_data(&self, command: &Command, table: &mut DataTable) -> Result<Option<i64>> {
        if table.source().is_none() {
            if let Some(source) = command.source_table() {
                *table = std::mem::take(table).with_source(source);
            }
        }
        let snapshot = Arc::new(table.clone());

        let inserted = submit(&self.retry, command, self.target.clone(), move |target, cmd| {
            let rows = if cmd.is_sanitized() {
                snapshot.sanitized()
            } else {
                (*snapshot).clone()
            };
            target.with(|conn| sqlite::apply_changes(conn, &rows, ApplyMode::Optimistic, &|_, _| Ok(())))
        })
        .await?;
        table.accept_changes();
        Ok(inserted)
    }

    async fn execute_command(&self, command: &Command) -> Result<u64> {
        submit(&self.retry, command, self.target.clone(), |target, cmd| {
            target.with(|conn| sqlite::execute(conn, cmd.query(), cmd.params()))
        })
        .await
    }

    async fn get_data_and_lock(&self, command: &Command) -> Result<DatabaseData> {
        let table = self.get_data(command).await?;
        Ok(DatabaseData::new(command.clone(), table, None))
    }

    async fn unlock_without_updating(&self, session: &mut DatabaseData) -> Result<()> {
        session.mark_unlocked();
        Ok(())
    }

    async fn update_data_and_unlock(&self, session: &mut DatabaseData) -> Result<Option<i64>> {
        session.mark_unlocked();
        let command = session.command().clone();
        self.update_data(&command, session.table_mut()).await
    }

    async fn update_locked_data(&self, session: &mut DatabaseData) -> Result<()> {
        let command = session.command().clone();
        self.update_data(&command, session.table_mut()).await.map(|_| ())
    }

    async fn get_locking_users(&self, _table: &str, _command: &Command) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Opens a connected `ServerConnection` per operation
pub struct ServerConnectionFactory {
    config: DatabaseConfig,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl ServerConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, alerts: None }
    }

    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }
}

#[async_trait]
impl ConnectionFactory for ServerConnectionFactory {
    async fn open(&self) -> Result<Arc<dyn Connection>> {
        let mut connection = ServerConnection::new(self.config.clone());
        if let Some(alerts) = &self.alerts {
            connection = connection.with_alert_sink(Arc::clone(alerts));
        }
        connection.connect().await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::DatabaseError;
    use crate::core::value::DatabaseValue;

    async fn open(path: &str) -> Result<Arc<dyn Connection>> {
        ServerConnectionFactory::new(DatabaseConfig::new(DatabaseType::Server, path))
            .open()
            .await
    }

    #[tokio::test]
    async fn test_concurrent_edit_is_a_conflict() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| DatabaseError::other(e.to_string()))?;
        let path = dir.path().join("server.db").to_string_lossy().to_string();
        let first = open(&path).await?;
        let second = open(&path).await?;

        first
            .execute_command(&Command::new(
                "CREATE TABLE Accounts (ID INTEGER PRIMARY KEY, Balance INTEGER)",
                vec![],
            ))
            .await?;
        first
            .execute_command(&Command::new("INSERT INTO Accounts VALUES (1, 100)", vec![]))
            .await?;

        let command = Command::new("SELECT * FROM Accounts WHERE ID = ?", vec![DatabaseValue::Long(1)]);
        let mut mine = first.get_data_and_lock(&command).await?;
        let mut theirs = second.get_data_and_lock(&command).await?;
        assert!(mine.is_locked());
        assert!(second.get_locking_users("Accounts", &command).await?.is_empty());

        theirs.table_mut().set_value(0, "Balance", DatabaseValue::Long(50))?;
        second.update_data_and_unlock(&mut theirs).await?;

        mine.table_mut().set_value(0, "Balance", DatabaseValue::Long(150))?;
        let err = first.update_data_and_unlock(&mut mine).await.unwrap_err();
        assert!(matches!(err, DatabaseError::ConcurrencyConflict { .. }));
        assert!(err.is_lock_failure());

        first.close_connection().await?;
        assert!(!first.is_connected());
        Ok(())
    }
}
