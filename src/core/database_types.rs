//! Database engine definitions
//!
//! This module defines the engines an entity can target.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[derive(Default)]
pub enum DatabaseType {
    /// Legacy desktop engine with explicit record locks
    #[default]
    Desktop = 1,
    /// Server SQL engine with optimistic concurrency
    Server = 2,
}

impl DatabaseType {
    /// Convert database type to string representation
    pub fn to_str(&self) -> &'static str {
        match self {
            DatabaseType::Desktop => "desktop",
            DatabaseType::Server => "server",
        }
    }

    /// Whether the engine locks physical records
    pub fn uses_record_locks(&self) -> bool {
        matches!(self, DatabaseType::Desktop)
    }

    /// Whether entities share one process-wide connection for this engine
    pub fn uses_global_connection(&self) -> bool {
        matches!(self, DatabaseType::Desktop)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" | "legacy" | "local" => Ok(DatabaseType::Desktop),
            "server" | "sql" | "sqlserver" => Ok(DatabaseType::Server),
            _ => Err(format!("Invalid database type: '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_to_str() {
        assert_eq!(DatabaseType::Desktop.to_str(), "desktop");
        assert_eq!(DatabaseType::Server.to_str(), "server");
    }

    #[test]
    fn test_database_type_from_str() {
        assert_eq!(
            "desktop".parse::<DatabaseType>().ok(),
            Some(DatabaseType::Desktop)
        );
        assert_eq!(
            "Legacy".parse::<DatabaseType>().ok(),
            Some(DatabaseType::Desktop)
        );
        assert_eq!(
            "sql".parse::<DatabaseType>().ok(),
            Some(DatabaseType::Server)
        );
        assert_eq!("unknown".parse::<DatabaseType>().ok(), None);
    }

    #[test]
    fn test_engine_capabilities() {
        assert!(DatabaseType::Desktop.uses_record_locks());
        assert!(DatabaseType::Desktop.uses_global_connection());
        assert!(!DatabaseType::Server.uses_record_locks());
        assert!(!DatabaseType::Server.uses_global_connection());
    }
}
