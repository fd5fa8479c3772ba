//! Connection and retry configuration
//!
//! Configuration is an explicit value handed to each connection, never read
//! from global state. Both structs deserialize from JSON with every field
//! optional.

use super::database_types::DatabaseType;
use super::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for a single driver call (30 seconds)
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Retry counts and intervals applied to engine errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after a transient connection failure
    pub connection_failure_retries: u32,
    /// Sleep between connection retries
    pub connection_retry_interval_ms: u64,
    /// Retries after a lock conflict
    pub lock_retries: u32,
    /// Sleep between lock retries
    pub lock_retry_interval_ms: u64,
    /// Keep retrying lock conflicts until the other user releases the lock
    pub retry_forever_on_lock_failure: bool,
    /// Upper bound on lock attempts while waiting for a release
    pub max_lock_wait_attempts: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            connection_failure_retries: 5,
            connection_retry_interval_ms: 2_000,
            lock_retries: 10,
            lock_retry_interval_ms: 500,
            retry_forever_on_lock_failure: false,
            max_lock_wait_attempts: 1_000_000,
        }
    }
}

impl RetrySettings {
    /// Sleep between connection retries
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection_retry_interval_ms)
    }

    /// Sleep between lock retries
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    /// Set connection retry count and interval
    pub fn with_connection_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.connection_failure_retries = retries;
        self.connection_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set lock retry count and interval
    pub fn with_lock_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.lock_retries = retries;
        self.lock_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Wait for conflicting locks to be released instead of failing
    pub fn with_retry_forever_on_lock_failure(mut self, enabled: bool) -> Self {
        self.retry_forever_on_lock_failure = enabled;
        self
    }

    /// Bound the lock wait
    pub fn with_max_lock_wait_attempts(mut self, attempts: u64) -> Self {
        self.max_lock_wait_attempts = attempts;
        self
    }
}

/// Configuration for one database engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine the configuration targets
    pub database_type: DatabaseType,
    /// Path or connection string of the database
    pub connection_string: String,
    /// User name reported to other users holding conflicting locks
    pub user: String,
    /// Timeout for a single driver call
    pub command_timeout_ms: u64,
    /// Retry policy settings
    pub retry: RetrySettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::default(),
            connection_string: String::new(),
            user: "default".to_string(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            retry: RetrySettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// Create a configuration for an engine and connection string
    pub fn new(database_type: DatabaseType, connection_string: impl Into<String>) -> Self {
        Self {
            database_type,
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the user name
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry settings
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for a single driver call
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_fills_defaults() -> Result<()> {
        let config = DatabaseConfig::from_json(
            r#"{ "database_type": "server", "connection_string": "data.db", "retry": { "lock_retries": 3 } }"#,
        )?;
        assert_eq!(config.database_type, DatabaseType::Server);
        assert_eq!(config.connection_string, "data.db");
        assert_eq!(config.retry.lock_retries, 3);
        assert_eq!(config.retry.connection_failure_retries, 5);
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn test_builder_methods() {
        let config = DatabaseConfig::new(DatabaseType::Desktop, "shop.db")
            .with_user("alice")
            .with_command_timeout(Duration::from_secs(5))
            .with_retry(
                RetrySettings::default()
                    .with_lock_retries(2, Duration::from_millis(10))
                    .with_retry_forever_on_lock_failure(true),
            );
        assert_eq!(config.user, "alice");
        assert_eq!(config.command_timeout_ms, 5_000);
        assert_eq!(config.retry.lock_retry_interval(), Duration::from_millis(10));
        assert!(config.retry.retry_forever_on_lock_failure);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(DatabaseConfig::from_json("{ not json").is_err());
    }
}
