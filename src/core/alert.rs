//! Operational alerts
//!
//! Alerts are raised once per terminal failure, never per retry attempt.

use std::fmt;

/// A failure operators should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The engine stayed unreachable after every retry
    ConnectionFailure {
        query: String,
        params: String,
        message: String,
    },
    /// A value did not fit its column
    DataTruncation {
        column: String,
        size: usize,
        value: String,
        query: String,
    },
    /// A filter overflowed and was requeried as matching nothing
    NumericOverflow { query: String, params: String },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::ConnectionFailure {
                query,
                params,
                message,
            } => write!(f, "connection failure ({message}) running {query} with {params}"),
            Alert::DataTruncation {
                column,
                size,
                value,
                query,
            } => write!(
                f,
                "value '{value}' exceeds size {size} of column {column} running {query}"
            ),
            Alert::NumericOverflow { query, params } => {
                write!(f, "numeric overflow in {query} with {params}; requeried as empty")
            }
        }
    }
}

/// Receiver of operational alerts
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Sink that writes alerts to the error log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &Alert) {
        log::error!("ALERT: {alert}");
    }
}
