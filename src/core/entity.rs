//! Entity contract
//!
//! An entity is a plain struct mapped to one table. It exposes its bound
//! fields by name, lists its detail collections, and can veto or hook into
//! persistence through the provided methods.

use super::detail::DetailMember;
use super::error::Result;
use super::schema::TableSchema;
use super::value::DatabaseValue;

/// A struct persisted to one table
pub trait Entity: Send + Sync + 'static {
    /// Table and column bindings; called once per type and cached
    fn describe() -> TableSchema;

    /// Current value of a bound field
    fn get(&self, field: &str) -> DatabaseValue;

    /// Assign a bound field from a converted value
    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()>;

    /// Detail collections, in cascade order
    fn detail_members(&mut self) -> Vec<&mut dyn DetailMember> {
        Vec::new()
    }

    /// Business rules checked before an update; `Err` carries the reason
    fn data_requirements_met_for_update(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Business rules checked before a delete; `Err` carries the reason
    fn data_requirements_met_for_delete(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Runs before the row is built for an update
    fn pre_update(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs after the row and every detail were written
    fn post_update(&mut self) -> Result<()> {
        Ok(())
    }
}
