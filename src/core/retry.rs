//! Retry policy for engine errors
//!
//! Every driver call made by a connection goes through [`RetryPolicy::run`],
//! which classifies the engine's native error code and either retries,
//! rewrites and resubmits the command, or escalates to a typed
//! [`DatabaseError`] carrying the original query and parameters.

use super::alert::{Alert, AlertSink, LogAlertSink};
use super::command::Command;
use super::config::RetrySettings;
use super::error::{codes, describe_params, DatabaseError, EngineError, Result};
use std::future::Future;
use std::sync::Arc;

/// Classes of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network or server unavailable
    Transient,
    /// Record or table lock held by someone else
    LockHeld,
    /// Bad SQL or schema mismatch
    Malformed,
    /// Numeric overflow while evaluating a filter
    NumericOverflow,
    /// Unique key violated
    KeyViolation,
    /// Text outside the table's character set
    Unicode,
    /// Value larger than its column
    Truncation,
    /// Row changed since it was read
    Conflict,
    /// Handle already released
    InvalidHandle,
    /// Anything else
    Fatal,
}

impl ErrorClass {
    /// Classify a native engine error code
    pub fn of(code: u32) -> Self {
        match code {
            codes::COMMUNICATION_TIMEOUT
            | codes::CIRCUIT_RESET
            | codes::DISCOVERY_FAILED
            | codes::DESTINATION_UNAVAILABLE => ErrorClass::Transient,
            codes::LOCK_FAILED | codes::TABLE_LOCKED => ErrorClass::LockHeld,
            codes::SQL_PARSE
            | codes::COLUMN_NOT_FOUND
            | codes::TABLE_NOT_FOUND
            | codes::INVALID_ORDER_BY
            | codes::INVALID_FUNCTION => ErrorClass::Malformed,
            codes::NUMERIC_OVERFLOW => ErrorClass::NumericOverflow,
            codes::UNIQUE_KEY_VIOLATION => ErrorClass::KeyViolation,
            codes::UNICODE_NOT_SUPPORTED => ErrorClass::Unicode,
            codes::DATA_TRUNCATED => ErrorClass::Truncation,
            codes::ROW_VERSION_MISMATCH => ErrorClass::Conflict,
            codes::INVALID_HANDLE => ErrorClass::InvalidHandle,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Retry counts, intervals and the alert sink used by a connection
#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Create a policy that reports alerts to the log
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            alerts: Arc::new(LogAlertSink),
        }
    }

    /// Report alerts to another sink
    #[must_use]
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Report a failure detected outside a retried call
    pub fn notify(&self, alert: &Alert) {
        self.alerts.notify(alert);
    }

    /// Run `operation` for `command`, retrying per error class.
    ///
    /// The operation receives the command to submit, which differs from the
    /// original after an overflow or unicode rewrite.
    pub async fn run<T, F, Fut>(&self, command: &Command, mut operation: F) -> Result<T>
    where
        F: FnMut(Command) -> Fut,
        Fut: Future<Output = std::result::Result<T, EngineError>>,
    {
        let wait_for_release = command
            .wait_for_lock_release()
            .unwrap_or(self.settings.retry_forever_on_lock_failure);
        let mut current = command.clone();
        let mut connection_attempts: u32 = 0;
        let mut lock_attempts: u32 = 0;
        let mut total_lock_attempts: u64 = 0;
        let mut requeried = false;
        let mut sanitized = false;

        loop {
            log::trace!(
                "Submitting: {} {}",
                current.query(),
                describe_params(current.params())
            );
            let err = match operation(current.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match ErrorClass::of(err.code) {
                ErrorClass::Transient => {
                    connection_attempts += 1;
                    if connection_attempts > self.settings.connection_failure_retries {
                        self.alerts.notify(&Alert::ConnectionFailure {
                            query: command.query().to_string(),
                            params: describe_params(command.params()),
                            message: err.message.clone(),
                        });
                        return Err(DatabaseError::ConnectionFailure {
                            query: command.query().to_string(),
                            params: describe_params(command.params()),
                            attempts: connection_attempts,
                            source: err,
                        });
                    }
                    log::warn!(
                        "Connection failure (attempt {connection_attempts}): {err}; retrying in {:?}",
                        self.settings.connection_retry_interval()
                    );
                    tokio::time::sleep(self.settings.connection_retry_interval()).await;
                }
                ErrorClass::LockHeld => {
                    lock_attempts += 1;
                    total_lock_attempts += 1;
                    let exhausted = lock_attempts > self.settings.lock_retries;
                    if (exhausted && !wait_for_release)
                        || total_lock_attempts >= self.settings.max_lock_wait_attempts
                    {
                        return Err(DatabaseError::lock_failed(
                            command.query(),
                            command.params(),
                            total_lock_attempts,
                        ));
                    }
                    if exhausted {
                        log::debug!("Still waiting for lock release after {total_lock_attempts} attempt(s)");
                        lock_attempts = 0;
                    }
                    log::warn!(
                        "Lock conflict (attempt {total_lock_attempts}): {err}; retrying in {:?}",
                        self.settings.lock_retry_interval()
                    );
                    tokio::time::sleep(self.settings.lock_retry_interval()).await;
                }
                ErrorClass::NumericOverflow if !requeried => {
                    requeried = true;
                    self.alerts.notify(&Alert::NumericOverflow {
                        query: command.query().to_string(),
                        params: describe_params(command.params()),
                    });
                    log::warn!("Numeric overflow in filter; requerying as empty: {err}");
                    current = current.with_always_false_predicate();
                }
                ErrorClass::Unicode if !sanitized => {
                    sanitized = true;
                    log::warn!("Unicode rejected by engine; resubmitting with ASCII values: {err}");
                    current = current.sanitized();
                }
                ErrorClass::Truncation => {
                    if let Some(overflow) = &err.overflow {
                        self.alerts.notify(&Alert::DataTruncation {
                            column: overflow.column.clone(),
                            size: overflow.size,
                            value: overflow.value.clone(),
                            query: command.query().to_string(),
                        });
                    }
                    return Err(Self::escalate(command, err));
                }
                _ => return Err(Self::escalate(command, err)),
            }
        }
    }

    /// Map an engine error to the typed error surfaced to callers
    pub fn escalate(command: &Command, err: EngineError) -> DatabaseError {
        let query = command.query().to_string();
        let params = describe_params(command.params());

        match ErrorClass::of(err.code) {
            ErrorClass::Transient => DatabaseError::ConnectionFailure {
                query,
                params,
                attempts: 1,
                source: err,
            },
            ErrorClass::LockHeld => DatabaseError::LockFailed {
                query,
                params,
                attempts: 1,
            },
            ErrorClass::Malformed => DatabaseError::MalformedQuery {
                query,
                params,
                source: err,
            },
            ErrorClass::KeyViolation => DatabaseError::KeyViolation {
                query,
                params,
                source: err,
            },
            ErrorClass::Truncation => match err.overflow {
                Some(overflow) => {
                    DatabaseError::truncation(overflow.column, overflow.size, overflow.value)
                }
                None => DatabaseError::Engine {
                    query,
                    params,
                    source: err,
                },
            },
            ErrorClass::Conflict => DatabaseError::ConcurrencyConflict { query, params },
            ErrorClass::NumericOverflow
            | ErrorClass::Unicode
            | ErrorClass::InvalidHandle
            | ErrorClass::Fatal => DatabaseError::Engine {
                query,
                params,
                source: err,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::DatabaseValue;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Alert>>);

    impl AlertSink for RecordingSink {
        fn notify(&self, alert: &Alert) {
            self.0.lock().push(alert.clone());
        }
    }

    fn fast_settings() -> RetrySettings {
        RetrySettings::default()
            .with_connection_retries(2, Duration::from_millis(1))
            .with_lock_retries(2, Duration::from_millis(1))
    }

    fn command() -> Command {
        Command::new(
            "SELECT * FROM Orders WHERE ID = ?",
            vec![DatabaseValue::Long(9)],
        )
    }

    #[test]
    fn test_classification() {
        assert_eq!(ErrorClass::of(codes::CIRCUIT_RESET), ErrorClass::Transient);
        assert_eq!(ErrorClass::of(codes::TABLE_LOCKED), ErrorClass::LockHeld);
        assert_eq!(ErrorClass::of(codes::INVALID_ORDER_BY), ErrorClass::Malformed);
        assert_eq!(ErrorClass::of(codes::UNIQUE_KEY_VIOLATION), ErrorClass::KeyViolation);
        assert_eq!(ErrorClass::of(1), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_connection_failure_alerts_once() {
        let sink = Arc::new(RecordingSink::default());
        let policy = RetryPolicy::new(fast_settings()).with_alert_sink(sink.clone());
        let mut calls = 0;

        let result: Result<()> = policy
            .run(&command(), |_| {
                calls += 1;
                async { Err(EngineError::new(codes::DISCOVERY_FAILED, "no server")) }
            })
            .await;

        assert_eq!(calls, 3);
        let err = result.unwrap_err();
        assert!(matches!(err, DatabaseError::ConnectionFailure { attempts: 3, .. }));
        assert!(err.to_string().contains("SELECT * FROM Orders WHERE ID = ?"));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_retries_exhaust() {
        let policy = RetryPolicy::new(fast_settings());
        let mut calls = 0;
        let result: Result<()> = policy
            .run(&command(), |_| {
                calls += 1;
                async { Err(EngineError::new(codes::LOCK_FAILED, "held")) }
            })
            .await;
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(DatabaseError::LockFailed { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_wait_for_release_is_bounded() {
        let policy = RetryPolicy::new(fast_settings().with_max_lock_wait_attempts(7));
        let command = command().with_wait_for_lock_release(true);
        let mut calls = 0;
        let result: Result<()> = policy
            .run(&command, |_| {
                calls += 1;
                async { Err(EngineError::new(codes::LOCK_FAILED, "held")) }
            })
            .await;
        assert_eq!(calls, 7);
        assert!(matches!(result, Err(DatabaseError::LockFailed { attempts: 7, .. })));
    }

    #[tokio::test]
    async fn test_wait_for_release_succeeds_once_released() -> Result<()> {
        let policy = RetryPolicy::new(fast_settings().with_retry_forever_on_lock_failure(true));
        let mut calls = 0;
        let value = policy
            .run(&command(), |_| {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt > 10 {
                        Ok(attempt)
                    } else {
                        Err(EngineError::new(codes::LOCK_FAILED, "held"))
                    }
                }
            })
            .await?;
        assert_eq!(value, 11);
        Ok(())
    }

    #[tokio::test]
    async fn test_overflow_requeries_with_false_predicate() -> Result<()> {
        let sink = Arc::new(RecordingSink::default());
        let policy = RetryPolicy::new(fast_settings()).with_alert_sink(sink.clone());
        let mut seen = Vec::new();
        let rows = policy
            .run(&command(), |cmd| {
                seen.push(cmd.query().to_string());
                let overflow = cmd.params().len() == 1;
                async move {
                    if overflow {
                        Err(EngineError::new(codes::NUMERIC_OVERFLOW, "overflow"))
                    } else {
                        Ok(0usize)
                    }
                }
            })
            .await?;
        assert_eq!(rows, 0);
        assert_eq!(seen[1], "SELECT * FROM Orders WHERE 0 = 1");
        assert_eq!(sink.0.lock().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unicode_resubmits_once() {
        let policy = RetryPolicy::new(fast_settings());
        let mut calls = 0;
        let result: Result<()> = policy
            .run(&command(), |_| {
                calls += 1;
                async { Err(EngineError::new(codes::UNICODE_NOT_SUPPORTED, "ansi table")) }
            })
            .await;
        assert_eq!(calls, 2);
        assert!(matches!(result, Err(DatabaseError::Engine { .. })));
    }

    #[tokio::test]
    async fn test_fatal_classes_escalate_immediately() {
        let policy = RetryPolicy::new(fast_settings());
        for (code, check) in [
            (codes::SQL_PARSE, "Malformed"),
            (codes::UNIQUE_KEY_VIOLATION, "Key violation"),
            (codes::ROW_VERSION_MISMATCH, "Row changed"),
        ] {
            let mut calls = 0;
            let result: Result<()> = policy
                .run(&command(), |_| {
                    calls += 1;
                    async move { Err(EngineError::new(code, "boom")) }
                })
                .await;
            assert_eq!(calls, 1);
            let message = result.unwrap_err().to_string();
            assert!(message.contains(check), "{message}");
            assert!(message.contains("[9]"), "{message}");
        }
    }

    #[tokio::test]
    async fn test_truncation_carries_column_detail() {
        let sink = Arc::new(RecordingSink::default());
        let policy = RetryPolicy::new(fast_settings()).with_alert_sink(sink.clone());
        let result: Result<()> = policy
            .run(&command(), |_| async {
                Err(EngineError::truncated("Notes", 5, "abcdefgh"))
            })
            .await;
        assert!(matches!(
            result,
            Err(DatabaseError::DataTruncation { size: 5, .. })
        ));
        assert_eq!(sink.0.lock().len(), 1);
    }
}
