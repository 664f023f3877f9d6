//! Domain objects encapsulating mapped rows.
//!
//! An [`Instance`] owns at most one [`Row`] and binds the thread's
//! [`Connection`] only while one of its contexts is open. Every attribute
//! access, save, delete or reload opens such a context, so a row that was
//! detached in the meantime is transparently re-attached.
//!
//! Types embed an [`InstanceBase`] and implement the required accessors;
//! everything else has a default that subclasses override where needed.

mod context;
mod factory;
mod iterator;

pub use context::InstanceContext;
pub use factory::{InstanceConstructor, InstanceFactory};
pub use iterator::InstanceIterator;

use crate::connection::Connection;
use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use crate::registry::Registry;
use crate::sort::SortDefinition;
use pasdb_session::{Query, Row, RowState, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

/// State shared by every instance type.
pub struct InstanceBase {
    registry: Registry,
    row: Option<Row>,
    connection: Option<Rc<Connection>>,
    context_depth: usize,
    wrapped_transaction: bool,
    default_sort_definition: Option<SortDefinition>,
    sort_definitions: HashMap<String, SortDefinition>,
}

impl InstanceBase {
    /// Creates the base for an instance of `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Type`] if `row` belongs to a different entity.
    pub fn new(
        registry: &Registry,
        descriptor: &EntityDescriptor,
        row: Option<Row>,
    ) -> DbResult<Self> {
        if let Some(row) = &row {
            if !descriptor.owns(row, registry.table_prefix()) {
                return Err(DbError::type_error(format!(
                    "Given database row of '{}' is not an instance of {}",
                    row.entity(),
                    descriptor.class_name
                )));
            }
        }
        Ok(Self {
            registry: registry.clone(),
            row,
            connection: None,
            context_depth: 0,
            wrapped_transaction: false,
            default_sort_definition: None,
            sort_definitions: HashMap::new(),
        })
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the encapsulated row, if loaded.
    #[must_use]
    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }

    /// Replaces the encapsulated row.
    pub fn set_row(&mut self, row: Option<Row>) {
        self.row = row;
    }

    /// Returns the connection bound while a context is open.
    #[must_use]
    pub fn connection(&self) -> Option<&Rc<Connection>> {
        self.connection.as_ref()
    }

    /// Returns the bound connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] outside of an instance context.
    pub fn bound_connection(&self) -> DbResult<Rc<Connection>> {
        self.connection
            .clone()
            .ok_or_else(|| DbError::io("Database instance is not bound to a connection"))
    }

    /// Returns the number of open instance contexts.
    #[must_use]
    pub fn context_depth(&self) -> usize {
        self.context_depth
    }

    /// Returns true if this instance began the transaction it runs in.
    #[must_use]
    pub fn is_transaction_wrapped(&self) -> bool {
        self.wrapped_transaction
    }
}

impl fmt::Debug for InstanceBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceBase")
            .field("row", &self.row.as_ref().map(Row::entity))
            .field("context_depth", &self.context_depth)
            .field("wrapped_transaction", &self.wrapped_transaction)
            .finish_non_exhaustive()
    }
}

/// A domain object encapsulating one mapped row.
pub trait Instance: Any {
    /// Returns the shared state.
    fn base(&self) -> &InstanceBase;

    /// Returns the shared state mutably.
    fn base_mut(&mut self) -> &mut InstanceBase;

    /// Returns the descriptor of the encapsulated entity.
    fn descriptor(&self) -> EntityDescriptor;

    /// Returns `self` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns `self` mutably for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Returns the instance class name.
    fn class_name(&self) -> &'static str {
        let descriptor = self.descriptor();
        descriptor.instance_class.unwrap_or(descriptor.class_name)
    }

    /// Returns true if the instance can load its row by identity.
    fn is_reloadable(&self) -> bool {
        false
    }

    /// Fills generated columns of a freshly created row.
    fn initialize_row(&self, _row: &Row) {}

    /// Reloads the row through `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] if there is no persisted row to reload.
    fn reload_row(&mut self, connection: &Connection) -> DbResult<()> {
        match self.base().row() {
            Some(row) if row.has_identity() && connection.contains(row) => {
                Ok(connection.refresh(row)?)
            }
            _ => Err(DbError::io(format!(
                "{} instance is not reloadable",
                self.class_name()
            ))),
        }
    }

    /// Resolves an attribute the row does not map.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the default returns `NULL`.
    fn get_unknown_data_attribute(&self, _name: &str) -> DbResult<Value> {
        Ok(Value::Null)
    }

    /// Sets one attribute. Mapped columns are written to the row.
    ///
    /// # Errors
    ///
    /// Returns the error of [`Instance::set_unknown_data_attribute`] for
    /// attributes the row does not map.
    fn set_data_attribute(&mut self, name: &str, value: Value) -> DbResult<()> {
        if let Some(row) = self.base().row().filter(|row| row.has_column(name)).cloned() {
            row.set(name, value);
            return Ok(());
        }
        self.set_unknown_data_attribute(name, value)
    }

    /// Sets an attribute the row does not map.
    ///
    /// # Errors
    ///
    /// The default returns [`DbError::NotImplemented`].
    fn set_unknown_data_attribute(&mut self, name: &str, _value: Value) -> DbResult<()> {
        Err(DbError::not_implemented(format!(
            "{} does not support the attribute '{name}'",
            self.class_name()
        )))
    }

    /// Writes changes of a known instance. The default does nothing since
    /// attached rows are flushed automatically.
    ///
    /// # Errors
    ///
    /// Implementations may fail.
    fn update(&mut self) -> DbResult<()> {
        Ok(())
    }

    /// Adds a new row to the session.
    ///
    /// # Errors
    ///
    /// Returns an error outside of an instance context or if the session
    /// refuses the row.
    fn insert(&mut self) -> DbResult<()> {
        let connection = self.base().bound_connection()?;
        if let Some(row) = self.base().row() {
            if row.state() == RowState::Transient {
                connection.add(row)?;
            }
        }
        Ok(())
    }

    /// Returns the sort definition used when none was set.
    fn default_sort_definition(&self, _context: Option<&str>) -> SortDefinition {
        SortDefinition::new()
    }

    /// Opens an instance context. Prefer [`InstanceContext::enter`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection context cannot be entered or the
    /// row cannot be loaded.
    fn enter(&mut self) -> DbResult<()> {
        context::enter(self)
    }

    /// Closes an instance context opened by [`Instance::enter`].
    fn exit(&mut self, failed: bool) {
        context::exit(self, failed);
    }

    /// Returns true if the row has a persisted identity.
    fn is_known(&self) -> bool {
        self.base().row().is_some_and(Row::has_identity)
    }

    /// Returns true if the entity maps the attribute.
    fn is_data_attribute_defined(&self, name: &str) -> bool {
        self.descriptor().has_column(name)
    }

    /// Returns one attribute value.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    fn get_data_attribute(&mut self, name: &str) -> DbResult<Value> {
        let context = InstanceContext::enter(self)?;
        let value = match context.base().row().and_then(|row| row.get(name)) {
            Some(value) => value,
            None => context.get_unknown_data_attribute(name)?,
        };
        context.finish();
        Ok(value)
    }

    /// Returns the values of the given attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    fn get_data_attributes(&mut self, names: &[&str]) -> DbResult<BTreeMap<String, Value>> {
        let context = InstanceContext::enter(self)?;
        let mut values = BTreeMap::new();
        for name in names {
            let value = match context.base().row().and_then(|row| row.get(name)) {
                Some(value) => value,
                None => context.get_unknown_data_attribute(name)?,
            };
            values.insert((*name).to_string(), value);
        }
        context.finish();
        Ok(values)
    }

    /// Returns true if every given attribute is `NULL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    fn is_data_attribute_none(&mut self, names: &[&str]) -> DbResult<bool> {
        Ok(self
            .get_data_attributes(names)?
            .values()
            .all(Value::is_null))
    }

    /// Sets several attributes in one context.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Instance::set_data_attribute`]; the
    /// context is then exited as failed.
    fn set_data_attributes(&mut self, attributes: &[(&str, Value)]) -> DbResult<()> {
        let mut context = InstanceContext::enter(self)?;
        for (name, value) in attributes {
            context.set_data_attribute(name, value.clone())?;
        }
        context.finish();
        Ok(())
    }

    /// Inserts or updates the instance.
    ///
    /// Begins a transaction if none is open; it is committed when the
    /// outermost instance context exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered or the write fails.
    fn save(&mut self) -> DbResult<()> {
        let mut context = InstanceContext::enter(self)?;
        context::ensure_transaction(&mut *context)?;
        if context.is_known() {
            context.update()?;
        } else {
            context.insert()?;
        }
        context.finish();
        Ok(())
    }

    /// Deletes the instance's row.
    ///
    /// Returns false if the instance was never persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered or the session
    /// refuses the deletion.
    fn delete(&mut self) -> DbResult<bool> {
        let mut context = InstanceContext::enter(self)?;
        let Some(row) = context.base().row().filter(|row| row.has_identity()).cloned() else {
            context.finish();
            return Ok(false);
        };
        context::ensure_transaction(&mut *context)?;
        context.base().bound_connection()?.delete(&row)?;
        context.base_mut().set_row(None);
        context.finish();
        Ok(true)
    }

    /// Reloads the row from storage.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] if there is nothing to reload.
    fn reload(&mut self) -> DbResult<()> {
        let loaded_on_entry = self.base().row().is_none() && self.is_reloadable();
        let mut context = InstanceContext::enter(self)?;
        if !loaded_on_entry {
            let connection = context.base().bound_connection()?;
            context.reload_row(&connection)?;
        }
        context.finish();
        Ok(())
    }

    /// Stores a sort definition for `context`, or as default if `None`.
    fn set_sort_definition(&mut self, definition: SortDefinition, context: Option<&str>) {
        let base = self.base_mut();
        match context {
            Some(context) => {
                base.sort_definitions.insert(context.to_string(), definition);
            }
            None => base.default_sort_definition = Some(definition),
        }
    }

    /// Applies the sort definition for `context` to `query`.
    ///
    /// Falls back to the default definition, then to
    /// [`Instance::default_sort_definition`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if the definition names unknown attributes.
    fn apply_db_sort_definition(&self, query: Query, context: Option<&str>) -> DbResult<Query> {
        let base = self.base();
        let definition = context
            .and_then(|context| base.sort_definitions.get(context))
            .or(base.default_sort_definition.as_ref())
            .cloned()
            .unwrap_or_else(|| self.default_sort_definition(context));
        definition.apply(&self.descriptor(), query)
    }
}

impl dyn Instance {
    /// Downcasts to a concrete instance type.
    #[must_use]
    pub fn downcast_ref<T: Instance>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    /// Downcasts mutably to a concrete instance type.
    pub fn downcast_mut<T: Instance>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}
