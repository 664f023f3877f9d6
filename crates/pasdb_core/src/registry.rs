//! Process-wide database registry.

use crate::connection::Connection;
use crate::descriptor::EntityDescriptor;
use crate::error::DbResult;
use crate::instance::InstanceFactory;
use crate::lock::{LockStats, SerializationLock};
use crate::settings::{ResolvedSettings, Settings};
use crate::{key_store, schema};
use parking_lot::{Mutex, RwLock};
use pasdb_session::{create_engine, Engine, SessionResult};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type EngineFactory = Box<dyn Fn(&ResolvedSettings) -> SessionResult<Arc<dyn Engine>> + Send + Sync>;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

struct RegistryInner {
    id: u64,
    settings: ResolvedSettings,
    engine_factory: EngineFactory,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    lock: SerializationLock,
    entities: RwLock<BTreeMap<&'static str, EntityDescriptor>>,
    instances: InstanceFactory,
}

/// Shared state of one configured database.
///
/// A registry owns the immutable settings, the lazily created engine, the
/// serialization lock and the entity and instance class maps. Clones are
/// cheap and refer to the same registry. Each thread gets its own
/// [`Connection`] per registry.
///
/// # Example
///
/// ```rust
/// use pasdb_core::{Registry, Settings};
///
/// let registry = Registry::open(Settings::new().url("memory:")).unwrap();
/// let connection = registry.connection().unwrap();
/// assert_eq!(connection.transaction_depth(), 0);
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Opens a registry whose engine is resolved from the settings URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DbError::Configuration`] if the settings are invalid.
    pub fn open(settings: Settings) -> DbResult<Self> {
        let resolved = settings.resolve()?;
        Ok(Self::build(
            resolved,
            Box::new(|settings: &ResolvedSettings| create_engine(&settings.url)),
        ))
    }

    /// Opens a registry using the given engine.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DbError::Configuration`] if the settings are invalid.
    pub fn with_engine(settings: Settings, engine: Arc<dyn Engine>) -> DbResult<Self> {
        let resolved = settings.resolve()?;
        Ok(Self::build(
            resolved,
            Box::new(move |_: &ResolvedSettings| Ok(Arc::clone(&engine))),
        ))
    }

    fn build(settings: ResolvedSettings, engine_factory: EngineFactory) -> Self {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                settings,
                engine_factory,
                engine: Mutex::new(None),
                lock: SerializationLock::new(),
                entities: RwLock::new(BTreeMap::new()),
                instances: InstanceFactory::new(),
            }),
        };
        schema::register(&registry);
        key_store::register(&registry);
        registry
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the settings in effect.
    #[must_use]
    pub fn settings(&self) -> &ResolvedSettings {
        &self.inner.settings
    }

    /// Returns the table prefix.
    #[must_use]
    pub fn table_prefix(&self) -> &str {
        &self.inner.settings.table_prefix
    }

    /// Returns the backend name.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        &self.inner.settings.backend_name
    }

    /// Returns true if connection contexts are serialized across threads.
    #[must_use]
    pub fn is_serialized(&self) -> bool {
        self.inner.settings.serialized
    }

    /// Returns the engine, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created.
    pub fn engine(&self) -> DbResult<Arc<dyn Engine>> {
        let mut slot = self.inner.engine.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }
        let engine = (self.inner.engine_factory)(&self.inner.settings)?;
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    /// Returns the calling thread's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created.
    pub fn connection(&self) -> DbResult<Rc<Connection>> {
        Connection::get_instance(self)
    }

    pub(crate) fn serialization_lock(&self) -> &SerializationLock {
        &self.inner.lock
    }

    /// Returns serialization lock usage counters.
    #[must_use]
    pub fn lock_stats(&self) -> LockStats {
        self.inner.lock.stats()
    }

    /// Registers an entity descriptor under its class name.
    pub fn register_entity(&self, descriptor: EntityDescriptor) {
        self.inner
            .entities
            .write()
            .insert(descriptor.class_name, descriptor);
    }

    /// Returns the descriptor registered for a class name.
    #[must_use]
    pub fn entity(&self, class_name: &str) -> Option<EntityDescriptor> {
        self.inner.entities.read().get(class_name).copied()
    }

    /// Returns the descriptor whose prefixed table name is `table`.
    #[must_use]
    pub fn entity_for_table(&self, table: &str) -> Option<EntityDescriptor> {
        let prefix = self.table_prefix();
        self.inner
            .entities
            .read()
            .values()
            .find(|descriptor| descriptor.table_name(prefix) == table)
            .copied()
    }

    /// Returns all registered descriptors ordered by class name.
    #[must_use]
    pub fn entities(&self) -> Vec<EntityDescriptor> {
        self.inner.entities.read().values().copied().collect()
    }

    /// Returns the instance class factory.
    #[must_use]
    pub fn instances(&self) -> &InstanceFactory {
        &self.inner.instances
    }

    /// Drops the calling thread's cached connection handle.
    ///
    /// Handles still held elsewhere stay valid; the next
    /// [`Registry::connection`] call on this thread creates a new connection.
    pub fn shutdown(&self) {
        Connection::forget(self.id());
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.settings.backend_name)
            .field("serialized", &self.inner.settings.serialized)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use pasdb_session::MemoryEngine;

    #[test]
    fn open_requires_url() {
        assert!(matches!(
            Registry::open(Settings::new()),
            Err(DbError::Configuration { .. })
        ));
    }

    #[test]
    fn engine_is_created_once() {
        let registry = Registry::open(Settings::new().url("memory:")).unwrap();
        let first = registry.engine().unwrap();
        let second = registry.engine().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unsupported_backend_fails_on_first_use() {
        let registry = Registry::open(Settings::new().url("oracle://db/x")).unwrap();
        assert_eq!(registry.backend_name(), "oracle");
        assert!(matches!(registry.engine(), Err(DbError::Session(_))));
    }

    #[test]
    fn builtin_entities_are_registered() {
        let engine = MemoryEngine::new();
        let registry =
            Registry::with_engine(Settings::new().url("memory:"), Arc::new(engine)).unwrap();
        let names: Vec<_> = registry.entities().iter().map(|d| d.class_name).collect();
        assert_eq!(names, vec!["KeyStore", "SchemaVersion"]);
        assert_eq!(
            registry.entity_for_table("pas_schema_version").map(|d| d.class_name),
            Some("SchemaVersion")
        );
        assert!(registry.instances().get_class("Schema").is_ok());
    }
}
