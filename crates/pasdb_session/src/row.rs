//! Mapped rows and their life-cycle state.

use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Life-cycle state of a [`Row`] relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// Not associated with any session and never persisted.
    Transient,
    /// Added to a session but not yet flushed.
    Pending,
    /// Flushed or loaded, and attached to a session.
    Persistent,
    /// Marked for deletion in the current transaction.
    Deleted,
    /// Persisted once, but no longer attached to a session.
    Detached,
}

#[derive(Debug)]
struct RowData {
    entity: String,
    primary_key: String,
    fields: BTreeMap<String, Value>,
    state: RowState,
    identity: Option<String>,
    session: Option<u64>,
}

/// A shared handle to one mapped row.
///
/// Clones refer to the same row; a session's identity map hands out the same
/// handle for the same stored row, so changes made through one clone are seen
/// by every other.
#[derive(Debug, Clone)]
pub struct Row {
    inner: Arc<Mutex<RowData>>,
}

impl Row {
    /// Creates a transient row with every column set to `NULL`.
    #[must_use]
    pub fn new(entity: &str, primary_key: &str, columns: &[&str]) -> Self {
        let fields = columns
            .iter()
            .map(|column| ((*column).to_string(), Value::Null))
            .collect();
        Self::from_parts(entity, primary_key, fields, RowState::Transient, None, None)
    }

    pub(crate) fn from_parts(
        entity: &str,
        primary_key: &str,
        fields: BTreeMap<String, Value>,
        state: RowState,
        identity: Option<String>,
        session: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RowData {
                entity: entity.to_string(),
                primary_key: primary_key.to_string(),
                fields,
                state,
                identity,
                session,
            })),
        }
    }

    /// Returns the entity (table) name.
    #[must_use]
    pub fn entity(&self) -> String {
        self.inner.lock().entity.clone()
    }

    /// Returns the primary key column name.
    #[must_use]
    pub fn primary_key(&self) -> String {
        self.inner.lock().primary_key.clone()
    }

    /// Returns the current value of the primary key column.
    #[must_use]
    pub fn key_value(&self) -> Value {
        let data = self.inner.lock();
        data.fields.get(&data.primary_key).cloned().unwrap_or_default()
    }

    /// Returns a column value, or `None` if the row has no such column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Value> {
        self.inner.lock().fields.get(column).cloned()
    }

    /// Returns true if the row maps the given column.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.inner.lock().fields.contains_key(column)
    }

    /// Sets a column value.
    pub fn set(&self, column: &str, value: impl Into<Value>) {
        self.inner.lock().fields.insert(column.to_string(), value.into());
    }

    /// Returns a copy of all column values.
    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.inner.lock().fields.clone()
    }

    /// Returns the life-cycle state.
    #[must_use]
    pub fn state(&self) -> RowState {
        self.inner.lock().state
    }

    /// Returns the persisted identity key, if any.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.inner.lock().identity.clone()
    }

    /// Returns true if the row carries a persisted identity.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        self.inner.lock().identity.is_some()
    }

    /// Returns the id of the session the row is attached to.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.inner.lock().session
    }

    /// Returns true if both handles refer to the same row.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn attach(&self, state: RowState, session: u64) {
        let mut data = self.inner.lock();
        data.state = state;
        data.session = Some(session);
    }

    /// Drops the session association, keeping the identity if there is one.
    pub(crate) fn detach(&self) {
        let mut data = self.inner.lock();
        data.session = None;
        data.state = if data.identity.is_some() {
            RowState::Detached
        } else {
            RowState::Transient
        };
    }

    /// Forgets identity and session; the row may be inserted again.
    pub(crate) fn make_transient(&self) {
        let mut data = self.inner.lock();
        data.session = None;
        data.identity = None;
        data.state = RowState::Transient;
    }

    pub(crate) fn set_identity(&self, identity: String) {
        self.inner.lock().identity = Some(identity);
    }

    pub(crate) fn replace_fields(&self, fields: BTreeMap<String, Value>) {
        self.inner.lock().fields = fields;
    }
}

/// Renders a primary key value as an identity key.
///
/// `NULL` keys have no identity.
#[must_use]
pub fn identity_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
