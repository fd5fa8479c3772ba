//! Desktop engine connection
//!
//! Pessimistic locking: `get_data_and_lock` walks a cursor locking every
//! record, and the locks stay held until the session is unlocked, written
//! and unlocked, or dropped. Every driver call goes through the retry policy
//! on the blocking pool.

pub mod driver;

use crate::backends::blocking::{run_blocking, submit};
use crate::core::alert::{Alert, AlertSink};
use crate::core::command::Command;
use crate::core::config::DatabaseConfig;
use crate::core::connection::Connection;
use crate::core::database_types::DatabaseType;
use crate::core::error::{DatabaseError, Result};
use crate::core::locking;
use crate::core::retry::RetryPolicy;
use crate::core::session::{DatabaseData, RecordCursor};
use crate::core::table::{DataReader, DataTable, MemoryCursor};
use async_trait::async_trait;
use driver::{DesktopDriver, LockOwner, SqliteDesktopDriver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection to the desktop engine
pub struct DesktopConnection {
    driver: Arc<dyn DesktopDriver>,
    config: DatabaseConfig,
    retry: RetryPolicy,
    owner: LockOwner,
}

impl std::fmt::Debug for DesktopConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopConnection")
            .field("path", &self.driver.path())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl DesktopConnection {
    /// Create a connection over a SQLite-backed desktop driver
    pub fn new(config: DatabaseConfig) -> Self {
        let driver = SqliteDesktopDriver::new(config.connection_string.as_str());
        Self::with_driver(config, Arc::new(driver))
    }

    /// Create a connection over another driver
    pub fn with_driver(config: DatabaseConfig, driver: Arc<dyn DesktopDriver>) -> Self {
        let owner = LockOwner {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user: config.user.clone(),
        };
        Self {
            driver,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            owner,
        }
    }

    /// Report operational alerts to `alerts`
    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.retry = self.retry.with_alert_sink(alerts);
        self
    }

    /// Identity the connection's record locks are held under
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    async fn call<T, F>(&self, command: &Command, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn DesktopDriver>, Command) -> std::result::Result<T, crate::core::error::EngineError>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        submit(&self.retry, command, Arc::clone(&self.driver), call).await
    }

    fn ensure_source(command: &Command, table: &mut DataTable) {
        if table.source().is_none() {
            if let Some(source) = command.source_table() {
                *table = std::mem::take(table).with_source(source);
            }
        }
    }
}

#[async_trait]
impl Connection for DesktopConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Desktop
    }

    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn is_connected(&self) -> bool {
        self.driver.is_open()
    }

    fn alert(&self, alert: &Alert) {
        self.retry.notify(alert);
    }

    async fn connect(&self) -> Result<()> {
        let command = self.get_command(&format!("OPEN {}", self.driver.path()), Vec::new(), None);
        self.call(&command, |driver, _| driver.open()).await?;
        log::debug!("Connected to desktop database {} as {}", self.driver.path(), self.owner.user);
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        let driver = Arc::clone(&self.driver);
        let owner = self.owner.clone();
        run_blocking(self.config.command_timeout(), move || {
            driver.close(&owner);
            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::connection(e.to_string()))
    }

    async fn get_data(&self, command: &Command) -> Result<DataTable> {
        self.call(command, |driver, cmd| driver.query(cmd.query(), cmd.params()))
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
        Self::ensure_source(command, table);
        let snapshot = Arc::new(table.clone());
        let owner = self.owner.clone();

        let inserted = self
            .call(command, move |driver, cmd| {
                if cmd.is_sanitized() {
                    driver.apply(&snapshot.sanitized(), &owner)
                } else {
                    driver.apply(&snapshot, &owner)
                }
            })
            .await?;
        table.accept_changes();
        Ok(inserted)
    }

    async fn execute_command(&self, command: &Command) -> Result<u64> {
        self.call(command, |driver, cmd| driver.execute(cmd.query(), cmd.params()))
            .await
    }

    async fn get_data_and_lock(&self, command: &Command) -> Result<DatabaseData> {
        let owner = self.owner.clone();
        let (table, cursor) = self
            .call(command, move |driver, cmd| {
                let mut cursor = driver.open_cursor(cmd.query(), cmd.params(), &owner)?;
                let table = locking::lock_all(cursor.as_mut(), cmd.source_table().as_deref())?;
                if table.is_empty() {
                    cursor.close();
                    return Ok((table, None::<Box<dyn RecordCursor>>));
                }
                Ok((table, Some(cursor)))
            })
            .await?;
        Ok(DatabaseData::new(command.clone(), table, cursor))
    }

    async fn unlock_without_updating(&self, session: &mut DatabaseData) -> Result<()> {
        let Some(cursor) = session.take_cursor() else {
            session.mark_unlocked();
            return Ok(());
        };
        let released = self
            .call(session.command(), move |_, _| {
                let mut cursor = cursor.lock();
                locking::unlock_all(cursor.as_mut())
            })
            .await;
        session.mark_unlocked();
        released
    }

    async fn update_data_and_unlock(&self, session: &mut DatabaseData) -> Result<Option<i64>> {
        self.unlock_without_updating(session).await?;
        let command = session.command().clone();
        self.update_data(&command, session.table_mut()).await
    }

    async fn update_locked_data(&self, session: &mut DatabaseData) -> Result<()> {
        let Some(cursor) = session.cursor() else {
            let command = session.command().clone();
            return self.update_data(&command, session.table_mut()).await.map(|_| ());
        };
        let snapshot = Arc::new(session.table().clone());
        let original = session.command().clone();

        let written = self
            .call(session.command(), move |driver, cmd| {
                let rows = if cmd.is_sanitized() {
                    snapshot.sanitized()
                } else {
                    (*snapshot).clone()
                };
                let mut cursor = cursor.lock();
                locking::write_rows(cursor.as_mut(), &rows, || {
                    driver.query(original.query(), original.params())
                })
            })
            .await;

        match written {
            Ok(()) => {
                session.table_mut().accept_changes();
                Ok(())
            }
            Err(e) => {
                session.table_mut().reject_changes();
                Err(e)
            }
        }
    }

    async fn get_locking_users(&self, table: &str, command: &Command) -> Result<Vec<String>> {
        let table = table.to_string();
        self.call(command, move |driver, cmd| {
            driver.locking_users(&table, cmd.query(), cmd.params())
        })
        .await
    }
}
