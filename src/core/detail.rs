//! Detail collections
//!
//! A detail collection holds the child rows of a parent entity. Loaded
//! elements live in an arena; the rows present at load time form the
//! snapshot (an immutable prefix of the arena) and the live collection is a
//! set of arena slots. Snapshot rows missing from the live collection are
//! deleted when the parent cascades.

use super::connection::DataContext;
use super::database_table::{CascadeToken, DatabaseTable};
use super::entity::Entity;
use super::error::{DatabaseError, Result};
use super::mapper;
use super::query_builder::SelectBuilder;
use super::schema::schema_of;
use super::table::DataTable;
use super::value::DatabaseValue;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Field values of a parent entity, handed to its details
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParentRow {
    values: Vec<(&'static str, DatabaseValue)>,
}

impl ParentRow {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: &'static str, value: DatabaseValue) -> Self {
        self.values.push((field, value));
        self
    }

    pub fn get(&self, field: &str) -> Option<&DatabaseValue> {
        self.values
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, value)| value)
    }
}

/// Detail collection as seen by its parent's cascade
#[async_trait]
pub trait DetailMember: Send {
    /// Give the collection its context and the parent's current values
    fn attach(&mut self, context: &DataContext, parent: &ParentRow);

    fn is_loaded(&self) -> bool;

    /// Load the collection, locking every element
    async fn load_locked(&mut self) -> Result<()>;

    /// Update live elements, then delete removed ones
    async fn update(&mut self, parent: &ParentRow, token: CascadeToken) -> Result<()>;

    /// Delete live elements, then removed ones
    async fn delete(&mut self, token: CascadeToken) -> Result<()>;

    /// Release the locks of every element loaded, removed ones included, and
    /// unload the collection
    async fn unlock_without_updating(&mut self) -> Result<()>;

    /// Dispose every element, releasing its locks and connection; the
    /// elements stay readable
    async fn dispose(&mut self) -> Result<()>;
}

struct DetailArena<E: Entity + Default> {
    links: Vec<(&'static str, &'static str)>,
    elements: Vec<DatabaseTable<E>>,
    snapshot: usize,
    loaded: bool,
    context: Option<DataContext>,
    parent: ParentRow,
}

impl<E: Entity + Default> DetailArena<E> {
    fn new(links: &[(&'static str, &'static str)]) -> Self {
        Self {
            links: links.to_vec(),
            elements: Vec::new(),
            snapshot: 0,
            loaded: false,
            context: None,
            parent: ParentRow::default(),
        }
    }

    fn context(&self) -> Result<&DataContext> {
        self.context.as_ref().ok_or_else(|| {
            DatabaseError::configuration(format!(
                "detail collection of {} is not attached to a parent",
                std::any::type_name::<E>()
            ))
        })
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(DatabaseError::other(format!(
                "detail collection of {} is not loaded",
                std::any::type_name::<E>()
            )))
        }
    }

    /// Set an element's foreign-key fields from the parent
    fn link(
        links: &[(&'static str, &'static str)],
        element: &mut DatabaseTable<E>,
        parent: &ParentRow,
    ) -> Result<()> {
        let schema = std::sync::Arc::clone(element.schema());
        for (parent_field, detail_field) in links {
            let value = parent.get(parent_field).ok_or_else(|| {
                DatabaseError::configuration(format!("parent has no field {parent_field}"))
            })?;
            let binding = schema.binding(detail_field).ok_or_else(|| {
                DatabaseError::configuration(format!("detail field {detail_field} is not bound"))
            })?;
            element
                .entity_mut()
                .set(detail_field, mapper::value_for_field(binding, value)?)?;
        }
        Ok(())
    }

    async fn load(&mut self, lock: bool) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let context = self.context()?.clone();
        let schema = schema_of::<E>()?;
        let table_name = schema.table_name()?;
        if !schema.is_detail() {
            return Err(DatabaseError::configuration(format!(
                "{table_name} is loaded as a detail but is not declared as one"
            )));
        }

        let mut select = SelectBuilder::new(table_name);
        for (parent_field, detail_field) in &self.links {
            let binding = schema.binding(detail_field).ok_or_else(|| {
                DatabaseError::configuration(format!("detail field {detail_field} is not bound"))
            })?;
            let value = self.parent.get(parent_field).cloned().unwrap_or(DatabaseValue::Null);
            let stored = mapper::value_for_storage(binding, &mapper::value_for_field(binding, &value)?)?;
            select = if stored.is_null() {
                select.where_null(binding.column_name())
            } else {
                select.where_eq(binding.column_name(), stored)
            };
        }
        for key in schema.primary_keys() {
            select = select.order_by_asc(key.column_name());
        }

        let lease = context.acquire(schema.database_type()).await?;
        let command = lease.connection.get_command(&select.build(), select.params(), None);
        let rows = lease.connection.get_data(&command).await;
        if lease.owned {
            lease.connection.close_connection().await?;
        }
        let rows = rows?;

        let mut elements = Vec::with_capacity(rows.len());
        for index in 0..rows.len() {
            if let Err(e) = Self::load_element(&context, &rows, index, lock, &mut elements).await {
                for element in elements.iter_mut().rev() {
                    if let Err(release) = element.unlock_without_updating().await {
                        log::warn!("Failed to unlock {table_name} detail row: {release}");
                    }
                }
                return Err(e);
            }
        }
        self.elements = elements;
        self.snapshot = self.elements.len();
        self.loaded = true;
        log::debug!("Loaded {} {table_name} detail row(s)", self.snapshot);
        Ok(())
    }

    /// Bind row `index`, locking it when asked; the element is kept even when
    /// locking fails so its partial locks can be released
    async fn load_element(
        context: &DataContext,
        rows: &DataTable,
        index: usize,
        lock: bool,
        elements: &mut Vec<DatabaseTable<E>>,
    ) -> Result<()> {
        let mut element = DatabaseTable::new(E::default(), context.clone())?;
        element.initialize_from_row(rows, index)?;
        let locked = if lock {
            element.initialize(true).await.map(|_| ())
        } else {
            Ok(())
        };
        elements.push(element);
        locked
    }

    fn adopt(&mut self, entity: E) -> Result<usize> {
        self.ensure_loaded()?;
        let mut element = DatabaseTable::new(entity, self.context()?.clone())?;
        Self::link(&self.links, &mut element, &self.parent)?;
        self.elements.push(element);
        Ok(self.elements.len() - 1)
    }

    async fn update(&mut self, live: &[usize], parent: &ParentRow, token: CascadeToken) -> Result<()> {
        self.parent = parent.clone();
        for &slot in live {
            let element = &mut self.elements[slot];
            Self::link(&self.links, element, parent)?;
            element.update_in_cascade(token).await?;
        }
        self.delete_removed(live, token).await
    }

    async fn delete(&mut self, live: &[usize], token: CascadeToken) -> Result<()> {
        for &slot in live {
            self.elements[slot].delete_in_cascade(token).await?;
        }
        self.delete_removed(live, token).await
    }

    async fn delete_removed(&mut self, live: &[usize], token: CascadeToken) -> Result<()> {
        for slot in 0..self.snapshot {
            if live.contains(&slot) {
                continue;
            }
            let survives = live
                .iter()
                .any(|&other| self.elements[other].is_duplicate_of(&self.elements[slot]));
            if !survives {
                self.elements[slot].delete_in_cascade(token).await?;
            }
        }
        Ok(())
    }

    /// Release every snapshot element's locks, then forget the loaded rows
    async fn unlock(&mut self) -> Result<()> {
        let mut result = Ok(());
        for element in &mut self.elements[..self.snapshot] {
            if let Err(e) = element.unlock_without_updating().await {
                log::warn!("Failed to unlock detail row: {e}");
                result = result.and(Err(e));
            }
        }
        let disposed = self.dispose().await;
        self.elements.clear();
        self.snapshot = 0;
        self.loaded = false;
        result.and(disposed)
    }

    async fn dispose(&mut self) -> Result<()> {
        let mut result = Ok(());
        for element in &mut self.elements {
            if let Err(e) = element.dispose().await {
                log::warn!("Failed to dispose detail row: {e}");
                result = result.and(Err(e));
            }
        }
        result
    }
}

/// Ordered detail collection
pub struct DetailList<E: Entity + Default> {
    arena: DetailArena<E>,
    live: Vec<usize>,
}

impl<E: Entity + Default> DetailList<E> {
    /// Create a collection linked to its parent by `(parent field, detail field)` pairs
    pub fn new(links: &[(&'static str, &'static str)]) -> Self {
        Self {
            arena: DetailArena::new(links),
            live: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.arena.loaded
    }

    /// Load the rows on first access
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the collection is not attached or
    /// the element type is not a detail table
    pub async fn load(&mut self) -> Result<&mut Self> {
        if !self.arena.loaded {
            self.arena.load(false).await?;
            self.live = (0..self.arena.snapshot).collect();
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&E> {
        let slot = *self.live.get(index)?;
        Some(self.arena.elements[slot].entity())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut E> {
        let slot = *self.live.get(index)?;
        Some(self.arena.elements[slot].entity_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.live.iter().map(|&slot| self.arena.elements[slot].entity())
    }

    /// Append a new element, linked to the parent
    ///
    /// # Errors
    ///
    /// Returns an error if the collection has not been loaded
    pub fn push(&mut self, entity: E) -> Result<()> {
        let slot = self.arena.adopt(entity)?;
        self.live.push(slot);
        Ok(())
    }

    /// Remove an element; it is deleted when the parent is updated
    pub fn remove(&mut self, index: usize) -> bool {
        if index < self.live.len() {
            self.live.remove(index);
            true
        } else {
            false
        }
    }

    /// Keep only the elements for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&E) -> bool) {
        let elements = &self.arena.elements;
        self.live.retain(|&slot| keep(elements[slot].entity()));
    }
}

#[async_trait]
impl<E: Entity + Default> DetailMember for DetailList<E> {
    fn attach(&mut self, context: &DataContext, parent: &ParentRow) {
        self.arena.context = Some(context.clone());
        self.arena.parent = parent.clone();
    }

    fn is_loaded(&self) -> bool {
        self.arena.loaded
    }

    async fn load_locked(&mut self) -> Result<()> {
        if !self.arena.loaded {
            self.arena.load(true).await?;
            self.live = (0..self.arena.snapshot).collect();
        }
        Ok(())
    }

    async fn update(&mut self, parent: &ParentRow, token: CascadeToken) -> Result<()> {
        if !self.arena.loaded {
            return Ok(());
        }
        self.arena.update(&self.live, parent, token).await
    }

    async fn delete(&mut self, token: CascadeToken) -> Result<()> {
        self.arena.delete(&self.live, token).await
    }

    async fn unlock_without_updating(&mut self) -> Result<()> {
        self.live.clear();
        self.arena.unlock().await
    }

    async fn dispose(&mut self) -> Result<()> {
        self.arena.dispose().await
    }
}

/// Keyed detail collection
pub struct DetailMap<K, E: Entity + Default> {
    arena: DetailArena<E>,
    live: BTreeMap<K, usize>,
    key_of: fn(&E) -> K,
}

impl<K, E> DetailMap<K, E>
where
    K: Ord + Clone + Send + Sync + 'static,
    E: Entity + Default,
{
    /// Create a collection keyed by `key_of`, linked like [`DetailList::new`]
    pub fn new(links: &[(&'static str, &'static str)], key_of: fn(&E) -> K) -> Self {
        Self {
            arena: DetailArena::new(links),
            live: BTreeMap::new(),
            key_of,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.arena.loaded
    }

    fn index_snapshot(&mut self) {
        self.live = (0..self.arena.snapshot)
            .map(|slot| ((self.key_of)(self.arena.elements[slot].entity()), slot))
            .collect();
    }

    /// Load the rows on first access
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error if the collection is not attached or
    /// the element type is not a detail table
    pub async fn load(&mut self) -> Result<&mut Self> {
        if !self.arena.loaded {
            self.arena.load(false).await?;
            self.index_snapshot();
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&E> {
        let slot = *self.live.get(key)?;
        Some(self.arena.elements[slot].entity())
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut E> {
        let slot = *self.live.get(key)?;
        Some(self.arena.elements[slot].entity_mut())
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.live.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &E)> + '_ {
        self.live
            .iter()
            .map(|(key, &slot)| (key, self.arena.elements[slot].entity()))
    }

    /// Insert an element under its key, replacing any element with that key
    ///
    /// # Errors
    ///
    /// Returns an error if the collection has not been loaded
    pub fn insert(&mut self, entity: E) -> Result<()> {
        let key = (self.key_of)(&entity);
        let slot = self.arena.adopt(entity)?;
        self.live.insert(key, slot);
        Ok(())
    }

    /// Remove an element; it is deleted when the parent is updated
    pub fn remove(&mut self, key: &K) -> bool {
        self.live.remove(key).is_some()
    }

    fn live_slots(&self) -> Vec<usize> {
        self.live.values().copied().collect()
    }
}

#[async_trait]
impl<K, E> DetailMember for DetailMap<K, E>
where
    K: Ord + Clone + Send + Sync + 'static,
    E: Entity + Default,
{
    fn attach(&mut self, context: &DataContext, parent: &ParentRow) {
        self.arena.context = Some(context.clone());
        self.arena.parent = parent.clone();
    }

    fn is_loaded(&self) -> bool {
        self.arena.loaded
    }

    async fn load_locked(&mut self) -> Result<()> {
        if !self.arena.loaded {
            self.arena.load(true).await?;
            self.index_snapshot();
        }
        Ok(())
    }

    async fn update(&mut self, parent: &ParentRow, token: CascadeToken) -> Result<()> {
        if !self.arena.loaded {
            return Ok(());
        }
        let live = self.live_slots();
        self.arena.update(&live, parent, token).await
    }

    async fn delete(&mut self, token: CascadeToken) -> Result<()> {
        let live = self.live_slots();
        self.arena.delete(&live, token).await
    }

    async fn unlock_without_updating(&mut self) -> Result<()> {
        self.live.clear();
        self.arena.unlock().await
    }

    async fn dispose(&mut self) -> Result<()> {
        self.arena.dispose().await
    }
}
