//! Error types for the persistence layer
//!
//! This module defines the errors surfaced to callers and the native errors
//! reported by database engine drivers.

use super::value::DatabaseValue;

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Native error codes reported by engine drivers.
///
/// The retry policy classifies errors by these codes, so every driver maps its
/// own failures onto this table.
pub mod codes {
    /// Lock on a record is held by another connection
    pub const LOCK_FAILED: u32 = 5035;
    /// Table-level lock held, or the storage is busy
    pub const TABLE_LOCKED: u32 = 5036;
    /// Cursor or statement handle no longer valid
    pub const INVALID_HANDLE: u32 = 5018;

    /// Communication with the server timed out
    pub const COMMUNICATION_TIMEOUT: u32 = 6610;
    /// Connection was reset while a request was in flight
    pub const CIRCUIT_RESET: u32 = 6611;
    /// The database server could not be discovered or opened
    pub const DISCOVERY_FAILED: u32 = 6420;
    /// The destination is unreachable
    pub const DESTINATION_UNAVAILABLE: u32 = 6097;

    /// SQL could not be parsed
    pub const SQL_PARSE: u32 = 2115;
    /// Column referenced by the query does not exist
    pub const COLUMN_NOT_FOUND: u32 = 2121;
    /// Numeric overflow while evaluating the query
    pub const NUMERIC_OVERFLOW: u32 = 2124;
    /// Invalid ORDER BY clause
    pub const INVALID_ORDER_BY: u32 = 2135;
    /// Invalid aggregate or scalar function
    pub const INVALID_FUNCTION: u32 = 2150;
    /// Table referenced by the query does not exist
    pub const TABLE_NOT_FOUND: u32 = 7041;

    /// Unique key violated by an insert or update
    pub const UNIQUE_KEY_VIOLATION: u32 = 7057;
    /// Value does not fit the column it is written to
    pub const DATA_TRUNCATED: u32 = 7029;
    /// Table cannot store characters outside its code page
    pub const UNICODE_NOT_SUPPORTED: u32 = 7213;
    /// Row changed since it was read (optimistic locking)
    pub const ROW_VERSION_MISMATCH: u32 = 7089;

    /// Any other engine failure
    pub const GENERAL: u32 = 7200;
}

/// Column, size and value of an engine-reported size violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOverflow {
    pub column: String,
    pub size: usize,
    pub value: String,
}

/// Error reported by a database engine driver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine error {code}: {message}")]
pub struct EngineError {
    pub code: u32,
    pub message: String,
    pub overflow: Option<ColumnOverflow>,
}

impl EngineError {
    /// Create an engine error with the given native code
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            overflow: None,
        }
    }

    /// Create a size violation error for a column
    pub fn truncated(column: impl Into<String>, size: usize, value: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            code: codes::DATA_TRUNCATED,
            message: format!("value too long for column {column} (size {size})"),
            overflow: Some(ColumnOverflow {
                column,
                size,
                value: value.into(),
            }),
        }
    }

    /// Whether the error reports a handle that was already released
    pub fn is_invalid_handle(&self) -> bool {
        self.code == codes::INVALID_HANDLE
    }
}

/// Error types for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Missing or inconsistent entity metadata
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation needs metadata the entity does not declare
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Business rule violated on update or delete
    #[error("Data requirement not met: {0}")]
    DataRequirement(String),

    /// Detail entity mutated outside its parent's cascade
    #[error("Detail access denied: {0}")]
    DetailAccess(String),

    /// Value does not fit its column
    #[error("Value for column {column} exceeds the column size of {size}: '{value}'")]
    DataTruncation {
        column: String,
        size: usize,
        value: String,
    },

    /// Record lock could not be secured
    #[error("Unable to secure lock after {attempts} attempt(s). Query: {query} Parameters: {params}")]
    LockFailed {
        query: String,
        params: String,
        attempts: u64,
    },

    /// Engine unreachable after every retry
    #[error("Connection failed after {attempts} attempt(s): {source}. Query: {query} Parameters: {params}")]
    ConnectionFailure {
        query: String,
        params: String,
        attempts: u32,
        #[source]
        source: EngineError,
    },

    /// Unique key violated
    #[error("Key violation: {source}. Query: {query} Parameters: {params}")]
    KeyViolation {
        query: String,
        params: String,
        #[source]
        source: EngineError,
    },

    /// Query rejected by the engine (bad SQL, unknown table or column)
    #[error("Malformed query: {source}. Query: {query} Parameters: {params}")]
    MalformedQuery {
        query: String,
        params: String,
        #[source]
        source: EngineError,
    },

    /// Row changed by another writer since it was read
    #[error("Row changed by another user. Query: {query} Parameters: {params}")]
    ConcurrencyConflict { query: String, params: String },

    /// Any other engine failure
    #[error("Engine failure: {source}. Query: {query} Parameters: {params}")]
    Engine {
        query: String,
        params: String,
        #[source]
        source: EngineError,
    },

    /// Entity used after dispose
    #[error("Entity for table {0} has been disposed")]
    Disposed(String),

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Column not found
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Connection error (generic)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Configuration parse error
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Configuration(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        DatabaseError::NotSupported(msg.into())
    }

    /// Create a data requirement error
    pub fn data_requirement<S: Into<String>>(msg: S) -> Self {
        DatabaseError::DataRequirement(msg.into())
    }

    /// Create a truncation error
    pub fn truncation(column: impl Into<String>, size: usize, value: impl Into<String>) -> Self {
        DatabaseError::DataTruncation {
            column: column.into(),
            size,
            value: value.into(),
        }
    }

    /// Create a lock failure error for a query
    pub fn lock_failed(query: &str, params: &[DatabaseValue], attempts: u64) -> Self {
        DatabaseError::LockFailed {
            query: query.to_string(),
            params: describe_params(params),
            attempts,
        }
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a new connection error (generic)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Other(msg.into())
    }

    /// Message suitable for showing to an end user
    pub fn friendly_message(&self) -> String {
        match self {
            DatabaseError::DataTruncation { column, size, .. } => format!(
                "The value entered for {column} is too long. It can be at most {size} characters."
            ),
            DatabaseError::LockFailed { .. } => {
                "This record is being edited by another user. Please try again later.".to_string()
            }
            DatabaseError::ConnectionFailure { .. } => {
                "The database could not be reached. Please try again later.".to_string()
            }
            DatabaseError::KeyViolation { .. } => {
                "A record with the same key already exists.".to_string()
            }
            DatabaseError::DataRequirement(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error is a lock conflict
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            DatabaseError::LockFailed { .. } | DatabaseError::ConcurrencyConflict { .. }
        )
    }
}

/// Render query parameters for diagnostics, e.g. `[1, 'abc', NULL]`
pub fn describe_params(params: &[DatabaseValue]) -> String {
    let rendered: Vec<String> = params
        .iter()
        .map(|value| match value {
            DatabaseValue::Null => "NULL".to_string(),
            DatabaseValue::String(s) => format!("'{s}'"),
            other => other.as_string(),
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DatabaseError::configuration("missing table");
        assert!(matches!(err, DatabaseError::Configuration(_)));

        let err = DatabaseError::truncation("Name", 10, "abcdefghijkl");
        assert!(matches!(err, DatabaseError::DataTruncation { size: 10, .. }));

        let err = DatabaseError::type_mismatch("i32", "String");
        assert!(matches!(err, DatabaseError::TypeMismatch { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::lock_failed(
            "SELECT * FROM Customers WHERE ID = ?",
            &[DatabaseValue::Long(7)],
            3,
        );
        assert_eq!(
            err.to_string(),
            "Unable to secure lock after 3 attempt(s). Query: SELECT * FROM Customers WHERE ID = ? Parameters: [7]"
        );

        let err = DatabaseError::type_mismatch("i64", "f64");
        assert_eq!(err.to_string(), "Type mismatch: expected i64, got f64");
    }

    #[test]
    fn test_friendly_truncation_message() {
        let err = DatabaseError::truncation("Notes", 5, "too long");
        assert_eq!(
            err.friendly_message(),
            "The value entered for Notes is too long. It can be at most 5 characters."
        );
    }

    #[test]
    fn test_describe_params() {
        let params = vec![
            DatabaseValue::Int(1),
            DatabaseValue::String("abc".to_string()),
            DatabaseValue::Null,
        ];
        assert_eq!(describe_params(&params), "[1, 'abc', NULL]");
        assert_eq!(describe_params(&[]), "[]");
    }

    #[test]
    fn test_engine_truncated_carries_overflow() {
        let err = EngineError::truncated("Notes", 5, "abcdefg");
        assert_eq!(err.code, codes::DATA_TRUNCATED);
        let overflow = err.overflow.expect("overflow detail");
        assert_eq!(overflow.column, "Notes");
        assert_eq!(overflow.size, 5);
    }
}
