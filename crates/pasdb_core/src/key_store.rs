//! Database backed key-value store with validity windows.

use crate::connection::Connection;
use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use crate::instance::{Instance, InstanceBase};
use crate::registry::Registry;
use crate::unix_time;
use pasdb_session::{Comparison, Filter, Row, RowState, Value};
use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use std::any::Any;
use tracing::debug;

/// Entity of key store entries.
pub const KEY_STORE: EntityDescriptor = EntityDescriptor {
    class_name: "KeyStore",
    table: "key_store",
    primary_key: "id",
    columns: &["id", "key", "value", "validity_start_time", "validity_end_time"],
    schema_version: Some(1),
    instance_class: Some("KeyStore"),
};

/// One key store entry.
///
/// `value` holds a JSON object. Validity times are unix seconds; 0 leaves
/// the window open on that side.
#[derive(Debug)]
pub struct KeyStore {
    base: InstanceBase,
    id: Option<String>,
}

impl KeyStore {
    /// Creates a new, unsaved entry.
    ///
    /// # Errors
    ///
    /// Infallible for a fresh entry; kept fallible for symmetry with
    /// [`KeyStore::from_row`].
    pub fn new(registry: &Registry) -> DbResult<Self> {
        Self::build(registry, None)
    }

    /// Encapsulates an existing `key_store` row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Type`] if the row belongs to another entity.
    pub fn from_row(registry: &Registry, row: Row) -> DbResult<Self> {
        Self::build(registry, Some(row))
    }

    /// Creates an entry that loads its row by id on first use.
    ///
    /// # Errors
    ///
    /// Infallible; kept fallible for symmetry with [`KeyStore::from_row`].
    pub fn with_id(registry: &Registry, id: &str) -> DbResult<Self> {
        let mut entry = Self::build(registry, None)?;
        entry.id = Some(id.to_string());
        Ok(entry)
    }

    fn build(registry: &Registry, row: Option<Row>) -> DbResult<Self> {
        let id = row
            .as_ref()
            .and_then(|row| row.get("id"))
            .and_then(|id| id.as_str().map(str::to_string));
        Ok(Self {
            base: InstanceBase::new(registry, &KEY_STORE, row)?,
            id,
        })
    }

    fn construct(registry: &Registry, row: Option<Row>) -> DbResult<Box<dyn Instance>> {
        Ok(Box::new(Self::build(registry, row)?))
    }

    /// Returns the id once known.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Loads a valid entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NothingMatched`] if no valid entry has this id.
    pub fn load_id(registry: &Registry, id: &str) -> DbResult<Self> {
        Self::load(
            registry,
            |connection| connection.get(&KEY_STORE, &Value::from(id)),
            || format!("KeyStore ID '{id}' not found"),
        )
    }

    /// Loads a valid entry by key.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NothingMatched`] if no valid entry has this key.
    pub fn load_key(registry: &Registry, key: &str) -> DbResult<Self> {
        let query = KEY_STORE
            .query(registry.table_prefix())
            .filter(Filter::eq("key", key))
            .limit(1);
        Self::load(
            registry,
            |connection| Ok(connection.query(&query)?.into_iter().next()),
            || format!("KeyStore key '{key}' not found"),
        )
    }

    fn load(
        registry: &Registry,
        lookup: impl FnOnce(&Connection) -> DbResult<Option<Row>>,
        missing: impl FnOnce() -> String,
    ) -> DbResult<Self> {
        let connection = Connection::get_instance(registry)?;
        let found = connection.scope(|connection| -> DbResult<Option<Self>> {
            if !registry.settings().auto_maintenance && rand::thread_rng().gen_range(0..3) == 0 {
                delete_expired(connection)?;
            }
            let Some(row) = lookup(connection.as_ref())? else {
                return Ok(None);
            };
            let mut entry = Self::from_row(registry, row)?;
            Ok(entry.is_valid()?.then_some(entry))
        })?;
        found.ok_or_else(|| DbError::nothing_matched(missing()))
    }

    /// Returns true if the validity window contains the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn is_valid(&mut self) -> DbResult<bool> {
        let values = self.get_data_attributes(&["validity_start_time", "validity_end_time"])?;
        let time = |name: &str| values.get(name).and_then(Value::as_i64).unwrap_or_default();
        let (start, end) = (time("validity_start_time"), time("validity_end_time"));
        let now = unix_time();
        Ok((start == 0 || start < now) && (end == 0 || end >= now))
    }

    /// Returns the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn key(&mut self) -> DbResult<Option<String>> {
        Ok(self
            .get_data_attribute("key")?
            .as_str()
            .map(str::to_string))
    }

    /// Sets the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn set_key(&mut self, key: &str) -> DbResult<()> {
        self.set_data_attributes(&[("key", Value::from(key))])
    }

    /// Returns the stored JSON object; empty if no value is set.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if the stored value is not a JSON object.
    pub fn value_dict(&mut self) -> DbResult<Map<String, JsonValue>> {
        let value = self.get_data_attribute("value")?;
        let Some(text) = value.as_str() else {
            return Ok(Map::new());
        };
        match serde_json::from_str(text) {
            Ok(JsonValue::Object(map)) => Ok(map),
            _ => Err(DbError::value(
                "Value of the KeyStore does not contain the expected data format",
            )),
        }
    }

    /// Replaces the stored JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn set_value_dict(&mut self, data: &Map<String, JsonValue>) -> DbResult<()> {
        let json = serde_json::to_string(data)?;
        self.set_data_attributes(&[("value", Value::from(json))])
    }

    /// Sets the validity window in unix seconds; 0 leaves a side open.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be entered.
    pub fn set_validity(&mut self, start: i64, end: i64) -> DbResult<()> {
        self.set_data_attributes(&[
            ("validity_start_time", Value::from(start)),
            ("validity_end_time", Value::from(end)),
        ])
    }
}

fn delete_expired(connection: &Connection) -> DbResult<()> {
    let prefix = connection.table_prefix();
    let query = KEY_STORE
        .query(prefix)
        .filter(Filter::compare("validity_end_time", Comparison::Gt, 0_i64))
        .filter(Filter::compare(
            "validity_end_time",
            Comparison::Lt,
            unix_time(),
        ));
    let deleted = connection.delete_matching(&query)?;
    if deleted > 0 {
        debug!(rows = deleted, "deleted expired key store entries");
        connection.optimize_random(&KEY_STORE.table_name(prefix))?;
    }
    Ok(())
}

impl Instance for KeyStore {
    fn base(&self) -> &InstanceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut InstanceBase {
        &mut self.base
    }

    fn descriptor(&self) -> EntityDescriptor {
        KEY_STORE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn is_reloadable(&self) -> bool {
        self.id.is_some()
    }

    fn initialize_row(&self, row: &Row) {
        row.set("id", uuid::Uuid::new_v4().simple().to_string());
        row.set("validity_start_time", 0_i64);
        row.set("validity_end_time", 0_i64);
    }

    fn reload_row(&mut self, connection: &Connection) -> DbResult<()> {
        if let Some(row) = self.base.row() {
            if row.has_identity() && connection.contains(row) {
                return Ok(connection.refresh(row)?);
            }
        }
        let Some(id) = self.id.clone() else {
            return Err(DbError::io("KeyStore instance is not reloadable"));
        };
        let row = connection
            .get(&KEY_STORE, &Value::from(id.as_str()))?
            .ok_or_else(|| DbError::nothing_matched(format!("KeyStore ID '{id}' not found")))?;
        self.base.set_row(Some(row));
        Ok(())
    }

    fn insert(&mut self) -> DbResult<()> {
        let connection = self.base.bound_connection()?;
        if let Some(row) = self.base.row() {
            if row.state() == RowState::Transient {
                connection.add(row)?;
            }
            self.id = row.get("id").and_then(|id| id.as_str().map(str::to_string));
        }
        Ok(())
    }
}

pub(crate) fn register(registry: &Registry) {
    registry.register_entity(KEY_STORE);
    registry.instances().register("KeyStore", KeyStore::construct);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use pasdb_session::MemoryEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> (Registry, MemoryEngine) {
        let engine = MemoryEngine::new();
        let registry =
            Registry::with_engine(Settings::new().url("memory:"), Arc::new(engine.clone()))
                .unwrap();
        (registry, engine)
    }

    fn stored(registry: &Registry, key: &str, start: i64, end: i64) -> String {
        let mut entry = KeyStore::new(registry).unwrap();
        entry.set_key(key).unwrap();
        entry.set_validity(start, end).unwrap();
        entry.save().unwrap();
        entry.id().unwrap().to_string()
    }

    #[test]
    fn missing_key_is_nothing_matched() {
        let (registry, _) = registry();
        let err = KeyStore::load_key(&registry, "missing").unwrap_err();
        assert!(matches!(err, DbError::NothingMatched { .. }));
        assert_eq!(err.to_string(), "KeyStore key 'missing' not found");
    }

    #[test]
    fn saved_entry_loads_by_key_and_id() {
        let (registry, engine) = registry();
        let id = stored(&registry, "token", 0, 0);
        assert_eq!(id.len(), 32);
        assert_eq!(engine.row_count("pas_key_store"), 1);

        let mut by_key = KeyStore::load_key(&registry, "token").unwrap();
        assert_eq!(by_key.id(), Some(id.as_str()));
        assert_eq!(by_key.key().unwrap().as_deref(), Some("token"));

        let mut by_id = KeyStore::load_id(&registry, &id).unwrap();
        assert_eq!(by_id.key().unwrap().as_deref(), Some("token"));
    }

    #[test]
    fn expired_entry_is_not_loaded() {
        let (registry, _) = registry();
        let now = unix_time();
        stored(&registry, "old", 0, now - 100);
        stored(&registry, "later", now + 100, 0);
        stored(&registry, "window", now - 100, now + 100);

        for key in ["old", "later"] {
            assert!(KeyStore::load_key(&registry, key)
                .unwrap_err()
                .is_nothing_matched());
        }
        assert!(KeyStore::load_key(&registry, "window").is_ok());
    }

    #[test]
    fn value_dict_round_trips_objects() {
        let (registry, _) = registry();
        let mut entry = KeyStore::new(&registry).unwrap();
        assert!(entry.value_dict().unwrap().is_empty());

        let data = json!({"user": "ada", "level": 3});
        let map = data.as_object().unwrap().clone();
        entry.set_key("session").unwrap();
        entry.set_value_dict(&map).unwrap();
        entry.save().unwrap();

        let mut loaded = KeyStore::load_key(&registry, "session").unwrap();
        assert_eq!(loaded.value_dict().unwrap(), map);

        loaded.set_data_attributes(&[("value", Value::from("[1, 2]"))]).unwrap();
        assert!(matches!(loaded.value_dict(), Err(DbError::Value { .. })));
    }

    #[test]
    fn entry_with_id_reloads_lazily() {
        let (registry, _) = registry();
        let id = stored(&registry, "lazy", 0, 0);

        let mut entry = KeyStore::with_id(&registry, &id).unwrap();
        assert!(entry.is_reloadable());
        assert!(entry.base().row().is_none());
        assert_eq!(entry.key().unwrap().as_deref(), Some("lazy"));
        assert!(entry.is_known());

        let mut unknown = KeyStore::with_id(&registry, "0000").unwrap();
        assert!(unknown.key().unwrap_err().is_nothing_matched());
    }

    #[test]
    fn unknown_attribute_cannot_be_set() {
        let (registry, _) = registry();
        let mut entry = KeyStore::new(&registry).unwrap();
        assert!(matches!(
            entry.set_data_attributes(&[("colour", Value::from("red"))]),
            Err(DbError::NotImplemented { .. })
        ));
        assert_eq!(entry.get_data_attribute("colour").unwrap(), Value::Null);
        assert!(!entry.is_data_attribute_defined("colour"));
        assert!(entry.is_data_attribute_none(&["value"]).unwrap());
    }

    #[test]
    fn delete_removes_the_row() {
        let (registry, engine) = registry();
        stored(&registry, "gone", 0, 0);
        let mut entry = KeyStore::load_key(&registry, "gone").unwrap();
        assert!(entry.delete().unwrap());
        assert_eq!(engine.row_count("pas_key_store"), 0);

        let mut fresh = KeyStore::new(&registry).unwrap();
        assert!(!fresh.delete().unwrap());
    }
}
