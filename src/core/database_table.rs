//! Entity façade
//!
//! `DatabaseTable` wraps an entity and drives its persistence: it builds the
//! default query from the entity's key fields, loads (optionally locking)
//! the row, writes it back, and cascades updates and deletes to the
//! entity's detail collections.

use super::alert::Alert;
use super::command::Command;
use super::connection::{Connection, DataContext, Lease};
use super::detail::ParentRow;
use super::entity::Entity;
use super::error::{DatabaseError, Result};
use super::mapper;
use super::query_builder::SelectBuilder;
use super::schema::{schema_of, ColumnBinding, TableSchema};
use super::session::DatabaseData;
use super::table::DataTable;
use super::value::DatabaseValue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Permission to persist a detail element, only issued by a parent's cascade
#[derive(Debug, Clone, Copy)]
pub struct CascadeToken {
    _private: (),
}

impl CascadeToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

/// Lifecycle of a `DatabaseTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created, nothing loaded yet
    Unbound,
    /// Loaded or defaulted, no lock held
    Initialized,
    /// Holding the locks of its row
    Locked,
    /// Finished; every further operation fails
    Disposed,
}

/// Key fields used to find an entity's row.
///
/// The primary key is used unless the secondary key was requested or the
/// primary key is an auto-number with no value assigned yet; without a
/// secondary key every non-primary field is used.
fn key_bindings<'s, E: Entity>(schema: &'s TableSchema, entity: &E, use_secondary_key: bool) -> Vec<&'s ColumnBinding> {
    let primary = schema.primary_keys();
    let assigned = |binding: &ColumnBinding| {
        let generated = binding.is_auto_number() || binding.custom_auto_number_type().is_some();
        !generated || entity.get(binding.field()).as_long().is_some_and(|v| v > 0)
    };
    if !use_secondary_key && !primary.is_empty() && primary.iter().all(|b| assigned(b)) {
        return primary;
    }
    let secondary = schema.secondary_keys();
    if !secondary.is_empty() {
        return secondary;
    }
    schema.non_primary()
}

/// Write `entity` into `row` of `table`, alerting once when a strict binding
/// rejects a value
fn write_entity<E: Entity>(
    entity: &E,
    schema: &TableSchema,
    table: &mut DataTable,
    row: Option<usize>,
    connection: &dyn Connection,
    query: &str,
) -> Result<()> {
    let written = mapper::write_row(entity, schema, table, row);
    if let Err(DatabaseError::DataTruncation { column, size, value }) = &written {
        connection.alert(&Alert::DataTruncation {
            column: column.clone(),
            size: *size,
            value: value.clone(),
            query: query.to_string(),
        });
    }
    written.map(|_| ())
}

/// An entity bound to its table
pub struct DatabaseTable<E: Entity> {
    entity: E,
    schema: Arc<TableSchema>,
    context: DataContext,
    lease: Option<Lease>,
    session: Option<DatabaseData>,
    state: EntityState,
    exists_in_database: bool,
    use_secondary_key: bool,
    wait_for_lock_release: Option<bool>,
    populate_auto_number: bool,
    default_command: Option<Command>,
}

impl<E: Entity> std::fmt::Debug for DatabaseTable<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseTable")
            .field("table", &self.schema.table_name().unwrap_or("<unbound>"))
            .field("state", &self.state)
            .field("exists_in_database", &self.exists_in_database)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> DatabaseTable<E> {
    /// Bind an entity without touching the database
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the entity's descriptor is inconsistent
    pub fn new(entity: E, context: DataContext) -> Result<Self> {
        let mut table = Self {
            entity,
            schema: schema_of::<E>()?,
            context,
            lease: None,
            session: None,
            state: EntityState::Unbound,
            exists_in_database: false,
            use_secondary_key: false,
            wait_for_lock_release: None,
            populate_auto_number: true,
            default_command: None,
        };
        table.attach_details();
        Ok(table)
    }

    /// Bind an entity and load its row, optionally locking it
    ///
    /// # Errors
    ///
    /// Returns any error raised by [`DatabaseTable::initialize`]
    pub async fn load(entity: E, context: DataContext, lock: bool) -> Result<Self> {
        let mut table = Self::new(entity, context)?;
        table.initialize(lock).await?;
        Ok(table)
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub fn is_locked(&self) -> bool {
        self.session.as_ref().is_some_and(DatabaseData::is_locked)
    }

    /// Find the row by the secondary key instead of the primary key
    pub fn set_use_secondary_key(&mut self, use_secondary_key: bool) {
        self.use_secondary_key = use_secondary_key;
        self.default_command = None;
    }

    /// Override whether lock failures are retried until the lock is released
    pub fn set_retry_forever_on_lock_failure(&mut self, retry_forever: bool) {
        self.wait_for_lock_release = Some(retry_forever);
        self.default_command = None;
    }

    /// Control whether the next update allocates custom auto-numbers
    pub fn set_populate_auto_number(&mut self, populate: bool) {
        self.populate_auto_number = populate;
    }

    fn table_name(&self) -> String {
        self.schema.table_name().unwrap_or("<unbound>").to_string()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.state == EntityState::Disposed {
            return Err(DatabaseError::Disposed(self.table_name()));
        }
        Ok(())
    }

    fn reject_detail(&self, operation: &str) -> Result<()> {
        if self.schema.is_detail() {
            return Err(DatabaseError::DetailAccess(format!(
                "{} is a detail table; {operation} it through its parent",
                self.table_name()
            )));
        }
        Ok(())
    }

    async fn connection(&mut self) -> Result<Arc<dyn Connection>> {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => self.context.acquire(self.schema.database_type()).await?,
        };
        let connection = Arc::clone(&lease.connection);
        self.lease = Some(lease);
        Ok(connection)
    }

    fn parent_row(&self) -> ParentRow {
        self.schema
            .columns()
            .iter()
            .fold(ParentRow::new(), |row, binding| {
                row.with(binding.field(), self.entity.get(binding.field()))
            })
    }

    fn attach_details(&mut self) {
        let parent = self.parent_row();
        let context = self.context.clone();
        for member in self.entity.detail_members() {
            member.attach(&context, &parent);
        }
    }

    fn mark_auto_increment(&self, table: &mut DataTable) {
        if let Some(binding) = self.schema.auto_number() {
            table.mark_auto_increment(binding.column_name());
        }
    }

    /// Query selecting the entity's row by its key fields; cached until a
    /// key-affecting change
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` for an entity without a table, or a conversion
    /// error for a key value
    pub fn default_command(&mut self) -> Result<Command> {
        if let Some(command) = &self.default_command {
            return Ok(command.clone());
        }
        let schema = Arc::clone(&self.schema);
        let mut select = SelectBuilder::new(schema.table_name()?);
        for binding in key_bindings(&schema, &self.entity, self.use_secondary_key) {
            let value = mapper::value_for_storage(binding, &self.entity.get(binding.field()))?;
            select = if value.is_null() {
                select.where_null(binding.column_name())
            } else {
                select.where_eq(binding.column_name(), value)
            };
        }

        let mut command = Command::new(select.build(), select.params());
        if let Some(lease) = &self.lease {
            command = command.with_timeout(lease.connection.config().command_timeout());
        }
        if let Some(wait) = self.wait_for_lock_release {
            command = command.with_wait_for_lock_release(wait);
        }
        self.default_command = Some(command.clone());
        Ok(command)
    }

    /// Load the entity's row, locking it (and every detail row) when asked.
    ///
    /// Returns whether the row exists.
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after disposal, `LockFailed` when the row stays
    /// locked by someone else, or any connection error
    pub async fn initialize(&mut self, lock: bool) -> Result<bool> {
        self.ensure_usable()?;
        self.release_locks().await?;
        let connection = self.connection().await?;
        let command = self.default_command()?;

        let table = if lock {
            let session = connection.get_data_and_lock(&command).await?;
            let table = session.table().clone();
            if session.is_locked() {
                self.session = Some(session);
            }
            table
        } else {
            connection.get_data(&command).await?
        };

        self.state = if self.is_locked() {
            EntityState::Locked
        } else {
            EntityState::Initialized
        };
        self.exists_in_database = !table.is_empty();
        if self.exists_in_database {
            let schema = Arc::clone(&self.schema);
            mapper::apply_row(&mut self.entity, &schema, &table, 0)?;
        }
        self.attach_details();

        if lock && self.exists_in_database {
            if let Err(e) = self.lock_details().await {
                if let Err(release) = self.release_locks().await {
                    log::warn!("Failed to release {} after a detail lock failure: {release}", self.table_name());
                }
                return Err(e);
            }
        }
        log::debug!(
            "Initialized {} (exists: {}, locked: {})",
            self.table_name(),
            self.exists_in_database,
            self.is_locked()
        );
        Ok(self.exists_in_database)
    }

    /// Populate the entity from a row already fetched
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after disposal or any conversion error
    pub fn initialize_from_row(&mut self, table: &DataTable, row: usize) -> Result<()> {
        self.ensure_usable()?;
        let schema = Arc::clone(&self.schema);
        mapper::apply_row(&mut self.entity, &schema, table, row)?;
        self.exists_in_database = true;
        self.default_command = None;
        self.state = EntityState::Initialized;
        self.attach_details();
        Ok(())
    }

    /// Reset every bound field to its type default, as a new entity
    ///
    /// # Errors
    ///
    /// Returns `Disposed` after disposal or any error raised by a setter
    pub fn initialize_default(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let schema = Arc::clone(&self.schema);
        mapper::apply_defaults(&mut self.entity, &schema)?;
        self.exists_in_database = false;
        self.default_command = None;
        self.state = EntityState::Initialized;
        self.attach_details();
        Ok(())
    }

    /// Write the entity (inserting it when new), cascade to its details and
    /// dispose it
    ///
    /// # Errors
    ///
    /// Returns `DetailAccess` for a detail entity, `DataRequirement` when a
    /// business rule fails, or any mapping or connection error
    pub async fn update(&mut self) -> Result<()> {
        self.reject_detail("update")?;
        self.persist(false).await
    }

    /// Update as part of a parent's cascade; the element stays usable
    ///
    /// # Errors
    ///
    /// Same as [`DatabaseTable::update`], minus `DetailAccess`
    pub async fn update_in_cascade(&mut self, _token: CascadeToken) -> Result<()> {
        self.persist(true).await
    }

    async fn allocate_auto_numbers(&mut self, connection: &dyn Connection) -> Result<()> {
        if !self.populate_auto_number {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        for binding in schema.custom_auto_numbers() {
            if !mapper::needs_auto_number(binding, &self.entity.get(binding.field())) {
                continue;
            }
            let Some(number_type) = binding.custom_auto_number_type() else {
                continue;
            };
            let next = connection.get_next_custom_auto_number(number_type).await?;
            self.entity
                .set(binding.field(), mapper::value_for_field(binding, &DatabaseValue::Long(next))?)?;
            self.default_command = None;
            log::debug!("Assigned auto-number {next} to {}.{}", self.table_name(), binding.field());
        }
        Ok(())
    }

    async fn persist(&mut self, orchestrated: bool) -> Result<()> {
        self.ensure_usable()?;
        self.entity
            .data_requirements_met_for_update()
            .map_err(DatabaseError::DataRequirement)?;
        self.entity.pre_update()?;
        let connection = self.connection().await?;
        self.allocate_auto_numbers(connection.as_ref()).await?;

        let schema = Arc::clone(&self.schema);
        let inserted = match self.session.take() {
            Some(mut session) if self.exists_in_database && !session.table().is_empty() => {
                self.mark_auto_increment(session.table_mut());
                let query = session.query().to_string();
                let written = write_entity(
                    &self.entity,
                    &schema,
                    session.table_mut(),
                    Some(0),
                    connection.as_ref(),
                    &query,
                );
                if let Err(e) = written {
                    self.session = Some(session);
                    return Err(e);
                }
                let written = connection.update_data_and_unlock(&mut session).await;
                self.state = EntityState::Initialized;
                written?
            }
            held => {
                if let Some(mut session) = held {
                    connection.unlock_without_updating(&mut session).await?;
                    self.state = EntityState::Initialized;
                }
                let command = self.default_command()?;
                let mut table = connection.get_data(&command).await?;
                self.mark_auto_increment(&mut table);
                let row = (!table.is_empty()).then_some(0);
                write_entity(&self.entity, &schema, &mut table, row, connection.as_ref(), command.query())?;
                connection.update_data(&command, &mut table).await?
            }
        };

        if let (Some(id), Some(binding)) = (inserted, schema.auto_number()) {
            self.entity
                .set(binding.field(), mapper::value_for_field(binding, &DatabaseValue::Long(id))?)?;
        }
        self.exists_in_database = true;
        self.default_command = None;
        self.populate_auto_number = true;
        self.state = EntityState::Initialized;
        log::debug!("Updated {}", self.table_name());

        let parent = self.parent_row();
        let context = self.context.clone();
        let token = CascadeToken::new();
        for member in self.entity.detail_members() {
            member.attach(&context, &parent);
            member.update(&parent, token).await?;
        }

        if !orchestrated {
            self.entity.post_update()?;
            self.dispose().await?;
        }
        Ok(())
    }

    /// Write the entity's row through its held lock, keeping the lock.
    ///
    /// Runs the same pre-update hook and auto-number allocation as
    /// [`DatabaseTable::update`]; details are not cascaded.
    ///
    /// # Errors
    ///
    /// Returns an error if no lock is held, or the write fails; on a failed
    /// write the session's rows are restored and the lock stays held
    pub async fn save_locked(&mut self) -> Result<()> {
        self.reject_detail("save")?;
        self.ensure_usable()?;
        if !self.is_locked() {
            return Err(DatabaseError::other(format!("{} holds no record lock", self.table_name())));
        }
        self.entity
            .data_requirements_met_for_update()
            .map_err(DatabaseError::DataRequirement)?;
        self.entity.pre_update()?;
        let connection = self.connection().await?;
        self.allocate_auto_numbers(connection.as_ref()).await?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let query = session.query().to_string();
        write_entity(
            &self.entity,
            &self.schema,
            session.table_mut(),
            Some(0),
            connection.as_ref(),
            &query,
        )?;
        connection.update_locked_data(session).await?;
        self.populate_auto_number = true;
        Ok(())
    }

    /// Delete the entity's row, its detail rows first
    ///
    /// # Errors
    ///
    /// Returns `DetailAccess` for a detail entity, `DataRequirement` when a
    /// business rule fails, or any lock or connection error
    pub async fn delete(&mut self) -> Result<()> {
        self.reject_detail("delete")?;
        self.remove().await
    }

    /// Delete as part of a parent's cascade
    ///
    /// # Errors
    ///
    /// Same as [`DatabaseTable::delete`], minus `DetailAccess`
    pub async fn delete_in_cascade(&mut self, _token: CascadeToken) -> Result<()> {
        self.remove().await
    }

    async fn remove(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if !self.exists_in_database {
            return Ok(());
        }
        self.entity
            .data_requirements_met_for_delete()
            .map_err(DatabaseError::DataRequirement)?;
        let connection = self.connection().await?;

        if !self.is_locked() {
            let command = self.default_command()?;
            let session = connection.get_data_and_lock(&command).await?;
            if session.table().is_empty() {
                self.exists_in_database = false;
                self.state = EntityState::Initialized;
                return Ok(());
            }
            self.session = Some(session);
            self.state = EntityState::Locked;
        }

        let parent = self.parent_row();
        let context = self.context.clone();
        let token = CascadeToken::new();
        for member in self.entity.detail_members() {
            member.attach(&context, &parent);
            member.load_locked().await?;
            member.delete(token).await?;
        }

        if let Some(mut session) = self.session.take() {
            let deleted = connection.delete_locked_data(&mut session).await;
            self.state = EntityState::Initialized;
            deleted?;
        }
        self.exists_in_database = false;
        self.default_command = None;
        log::debug!("Deleted {}", self.table_name());
        Ok(())
    }

    async fn release_session(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            let connection = self.connection().await?;
            connection.unlock_without_updating(&mut session).await?;
            log::debug!("Unlocked {}", self.table_name());
        }
        if self.state == EntityState::Locked {
            self.state = EntityState::Initialized;
        }
        Ok(())
    }

    async fn lock_details(&mut self) -> Result<()> {
        for member in self.entity.detail_members() {
            member.load_locked().await?;
        }
        Ok(())
    }

    /// Release the row's lock and every detail's locks, unloading the details
    async fn release_locks(&mut self) -> Result<()> {
        let released = self.release_session().await;
        let mut details = Ok(());
        for member in self.entity.detail_members() {
            if let Err(e) = member.unlock_without_updating().await {
                log::warn!("Failed to unlock a detail collection: {e}");
                details = details.and(Err(e));
            }
        }
        released.and(details)
    }

    /// Release the row's and every detail's locks without writing, then dispose
    ///
    /// # Errors
    ///
    /// Returns the first release failure; every release is still attempted
    pub async fn unlock_without_updating(&mut self) -> Result<()> {
        if self.state == EntityState::Disposed {
            return Ok(());
        }
        let released = self.release_locks().await;
        let disposed = self.dispose().await;
        released.and(disposed)
    }

    /// Release the locks and connections of the entity and its loaded
    /// details; idempotent
    ///
    /// # Errors
    ///
    /// Returns the first failure releasing a lock or closing an owned connection
    pub async fn dispose(&mut self) -> Result<()> {
        if self.state == EntityState::Disposed {
            return Ok(());
        }
        let released = self.release_session().await;
        let mut details = Ok(());
        for member in self.entity.detail_members() {
            if let Err(e) = member.dispose().await {
                log::warn!("Failed to dispose a detail collection: {e}");
                details = details.and(Err(e));
            }
        }
        let closed = match self.lease.take() {
            Some(lease) if lease.owned => lease.connection.close_connection().await,
            _ => Ok(()),
        };
        self.state = EntityState::Disposed;
        released.and(details).and(closed)
    }

    /// Run the update business rules without persisting
    pub fn check_update_requirements(&self) -> std::result::Result<(), String> {
        self.entity.data_requirements_met_for_update()
    }

    /// Run the delete business rules without persisting
    pub fn check_delete_requirements(&self) -> std::result::Result<(), String> {
        self.entity.data_requirements_met_for_delete()
    }

    /// Whether `other` is a different entity with equal key values
    pub fn is_duplicate_of(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return false;
        }
        let keys = key_bindings(&self.schema, &self.entity, self.use_secondary_key);
        !keys.is_empty()
            && keys.iter().all(|binding| {
                self.entity
                    .get(binding.field())
                    .same_value(&other.entity.get(binding.field()))
            })
    }

    /// Users holding locks on the entity's row
    ///
    /// # Errors
    ///
    /// Returns any connection error
    pub async fn locking_users(&mut self) -> Result<Vec<String>> {
        self.ensure_usable()?;
        let connection = self.connection().await?;
        let command = self.default_command()?;
        let table_name = self.schema.table_name()?.to_string();
        connection.get_locking_users(&table_name, &command).await
    }
}

impl<E: Entity> Deref for DatabaseTable<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

impl<E: Entity> DerefMut for DatabaseTable<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.entity
    }
}

impl<E: Entity> Drop for DatabaseTable<E> {
    fn drop(&mut self) {
        if self.is_locked() {
            log::warn!("{} dropped while holding its record lock", self.table_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database_types::DatabaseType;
    use crate::core::schema::ColumnType;

    #[derive(Default)]
    struct Part {
        id: i32,
        code: String,
    }

    impl Entity for Part {
        fn describe() -> TableSchema {
            TableSchema::new("Parts", DatabaseType::Desktop)
                .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key().auto_number())
                .column(ColumnBinding::new("code", ColumnType::String).column("Code").secondary_key())
        }

        fn get(&self, field: &str) -> DatabaseValue {
            match field {
                "id" => self.id.into(),
                "code" => self.code.as_str().into(),
                _ => DatabaseValue::Null,
            }
        }

        fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
            match field {
                "id" => self.id = value.as_int().unwrap_or_default(),
                "code" => self.code = value.as_string(),
                _ => {}
            }
            Ok(())
        }
    }

    fn part(id: i32, code: &str) -> Result<DatabaseTable<Part>> {
        DatabaseTable::new(
            Part {
                id,
                code: code.to_string(),
            },
            DataContext::new(),
        )
    }

    #[test]
    fn test_default_command_uses_assigned_primary_key() -> Result<()> {
        let mut table = part(7, "AX-1")?;
        let command = table.default_command()?;
        assert_eq!(command.query(), "SELECT * FROM Parts WHERE ID = ?");
        assert_eq!(command.params(), &[DatabaseValue::Int(7)]);
        Ok(())
    }

    #[test]
    fn test_unassigned_auto_number_falls_back_to_secondary_key() -> Result<()> {
        let mut table = part(0, "AX-1")?;
        assert_eq!(table.default_command()?.query(), "SELECT * FROM Parts WHERE Code = ?");

        let mut table = part(7, "AX-1")?;
        table.set_use_secondary_key(true);
        assert_eq!(table.default_command()?.query(), "SELECT * FROM Parts WHERE Code = ?");
        Ok(())
    }

    #[test]
    fn test_duplicate_detection_never_matches_itself() -> Result<()> {
        let first = part(3, "a")?;
        let second = part(3, "b")?;
        let third = part(4, "a")?;
        assert!(first.is_duplicate_of(&second));
        assert!(!first.is_duplicate_of(&third));
        assert!(!first.is_duplicate_of(&first));
        Ok(())
    }

    #[tokio::test]
    async fn test_disposed_entity_rejects_operations() -> Result<()> {
        let mut table = part(1, "a")?;
        table.dispose().await?;
        table.dispose().await?;
        assert_eq!(table.state(), EntityState::Disposed);
        assert!(matches!(table.initialize(false).await, Err(DatabaseError::Disposed(_))));
        assert!(matches!(table.update().await, Err(DatabaseError::Disposed(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_engine_is_a_configuration_error() -> Result<()> {
        let mut table = part(1, "a")?;
        assert!(matches!(
            table.initialize(false).await,
            Err(DatabaseError::Configuration(_))
        ));
        Ok(())
    }
}
