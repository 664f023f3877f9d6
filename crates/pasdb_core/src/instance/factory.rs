//! Instance class registration and polymorphic construction.

use super::Instance;
use crate::error::{DbError, DbResult};
use crate::registry::Registry;
use parking_lot::RwLock;
use pasdb_session::Row;
use std::collections::BTreeMap;
use std::fmt;

/// Creates an instance, optionally encapsulating an existing row.
pub type InstanceConstructor = fn(&Registry, Option<Row>) -> DbResult<Box<dyn Instance>>;

/// Maps instance class names to their constructors.
#[derive(Default)]
pub struct InstanceFactory {
    constructors: RwLock<BTreeMap<&'static str, InstanceConstructor>>,
}

impl InstanceFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor, replacing any previous one.
    pub fn register(&self, class_name: &'static str, constructor: InstanceConstructor) {
        self.constructors.write().insert(class_name, constructor);
    }

    /// Returns true if `class_name` is registered.
    #[must_use]
    pub fn is_registered(&self, class_name: &str) -> bool {
        self.constructors.read().contains_key(class_name)
    }

    /// Returns the constructor of `class_name`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NothingMatched`] if the class is unknown.
    pub fn get_class(&self, class_name: &str) -> DbResult<InstanceConstructor> {
        self.constructors
            .read()
            .get(class_name)
            .copied()
            .ok_or_else(|| {
                DbError::nothing_matched(format!("Database class '{class_name}' is not supported"))
            })
    }

    /// Constructs an instance of `class_name`.
    ///
    /// If `row` belongs to an entity whose registered instance class differs
    /// from `class_name`, that class is constructed instead.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NothingMatched`] if the class is unknown, or the
    /// constructor's error.
    pub fn construct(
        &self,
        registry: &Registry,
        class_name: &str,
        row: Option<Row>,
    ) -> DbResult<Box<dyn Instance>> {
        let specific = row
            .as_ref()
            .and_then(|row| registry.entity_for_table(&row.entity()))
            .and_then(|descriptor| descriptor.instance_class)
            .filter(|specific| *specific != class_name && self.is_registered(specific));
        let constructor = self.get_class(specific.unwrap_or(class_name))?;
        constructor(registry, row)
    }
}

impl fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("classes", &self.constructors.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
