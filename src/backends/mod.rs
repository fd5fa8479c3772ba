//! Database engine implementations
//!
//! This module contains the `Connection` implementations for the desktop
//! (record-locking) and server (optimistic) engines, and builds the
//! `DataContext` entities are handed.

pub(crate) mod blocking;
pub mod desktop;
pub mod server;
pub(crate) mod sqlite;

pub use desktop::driver::{DesktopDriver, LockOwner, LockRegistry, SqliteDesktopDriver};
pub use desktop::DesktopConnection;
pub use server::{ServerConnection, ServerConnectionFactory};

use crate::core::alert::{AlertSink, LogAlertSink};
use crate::core::config::DatabaseConfig;
use crate::core::connection::{Connection, ConnectionSource, DataContext};
use crate::core::database_types::DatabaseType;
use crate::core::error::Result;
use std::sync::Arc;

/// Build a context from one configuration per engine, logging alerts
///
/// # Errors
///
/// Returns an error if the global desktop connection cannot be opened
pub async fn open_context(configs: impl IntoIterator<Item = DatabaseConfig>) -> Result<DataContext> {
    open_context_with_alerts(configs, Arc::new(LogAlertSink)).await
}

/// Build a context from one configuration per engine.
///
/// The desktop engine gets one global, connected connection; the server
/// engine gets a factory opening a connection per operation.
///
/// # Errors
///
/// Returns an error if the global desktop connection cannot be opened
pub async fn open_context_with_alerts(
    configs: impl IntoIterator<Item = DatabaseConfig>,
    alerts: Arc<dyn AlertSink>,
) -> Result<DataContext> {
    let mut context = DataContext::new();
    for config in configs {
        let source = match config.database_type {
            DatabaseType::Desktop => {
                let connection = DesktopConnection::new(config.clone()).with_alert_sink(Arc::clone(&alerts));
                connection.connect().await?;
                ConnectionSource::Global(Arc::new(connection) as Arc<dyn Connection>)
            }
            DatabaseType::Server => ConnectionSource::PerOperation(Arc::new(
                ServerConnectionFactory::new(config.clone()).with_alert_sink(Arc::clone(&alerts)),
            )),
        };
        log::debug!("Registered {} engine at {}", config.database_type, config.connection_string);
        context = context.with_source(config.database_type, source);
    }
    Ok(context)
}
