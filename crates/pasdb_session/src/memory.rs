//! In-memory engine, optionally persisted to a JSON file.

use crate::error::{SessionError, SessionResult};
use crate::query::Query;
use crate::row::{identity_key, Row, RowState};
use crate::session::{Engine, PendingCounts, Session};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    primary_key: String,
    rows: BTreeMap<String, Record>,
}

type Tables = BTreeMap<String, Table>;

/// Committed state; this is what gets written to disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    tables: Tables,
    statements: Vec<String>,
    next_key: i64,
}

/// Engine statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
struct EngineStats {
    sessions_opened: AtomicU64,
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    savepoints_opened: AtomicU64,
    subtransactions_opened: AtomicU64,
    statements_executed: AtomicU64,
}

/// A point-in-time copy of the engine statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sessions opened through [`Engine::connect`].
    pub sessions_opened: u64,
    /// Outer transactions started.
    pub transactions_started: u64,
    /// Outer transactions committed to the store.
    pub transactions_committed: u64,
    /// Outer transactions rolled back.
    pub transactions_rolled_back: u64,
    /// Savepoints opened.
    pub savepoints_opened: u64,
    /// Subtransaction markers opened.
    pub subtransactions_opened: u64,
    /// Raw statements executed, committed or not.
    pub statements_executed: u64,
}

impl EngineStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            savepoints_opened: self.savepoints_opened.load(Ordering::Relaxed),
            subtransactions_opened: self.subtransactions_opened.load(Ordering::Relaxed),
            statements_executed: self.statements_executed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    store: RwLock<Store>,
    path: Option<PathBuf>,
    stats: EngineStats,
    next_session: AtomicU64,
    next_key: AtomicI64,
    generation: AtomicU64,
    fail_next_commit: AtomicBool,
    fail_next_connect: AtomicBool,
    rejected: Mutex<Vec<String>>,
}

impl Shared {
    fn persist(&self, store: &Store) -> SessionResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let temp_path = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(store)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// An engine keeping all tables in memory.
///
/// Sessions work on a private copy of the committed tables; an outer commit
/// writes their changes back. Clones share the same tables, so tests can keep
/// a handle for inspection while a registry owns another.
///
/// # Example
///
/// ```rust
/// use pasdb_session::{Engine, MemoryEngine, Row, Session};
///
/// let engine = MemoryEngine::new();
/// let mut session = engine.connect().unwrap();
/// let row = Row::new("pas_note", "id", &["id", "text"]);
/// row.set("text", "hello");
/// session.add(&row).unwrap();
/// session.commit().unwrap();
/// assert_eq!(engine.row_count("pas_note"), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
    backend_name: String,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an empty, ephemeral engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_key: AtomicI64::new(1),
                ..Shared::default()
            }),
            backend_name: "memory".to_string(),
        }
    }

    /// Opens an engine persisted as JSON at `path`.
    ///
    /// The file is created on the first commit if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or decoded.
    pub fn open_file(path: &Path) -> SessionResult<Self> {
        let store = if path.exists() {
            serde_json::from_slice::<Store>(&fs::read(path)?)?
        } else {
            Store::default()
        };
        let next_key = store.next_key.max(1);
        Ok(Self {
            shared: Arc::new(Shared {
                store: RwLock::new(store),
                path: Some(path.to_path_buf()),
                next_key: AtomicI64::new(next_key),
                ..Shared::default()
            }),
            backend_name: "json".to_string(),
        })
    }

    /// Returns a snapshot of the engine statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns all committed raw statements in execution order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.shared.store.read().statements.clone()
    }

    /// Returns the committed rows of an entity, ordered by identity.
    #[must_use]
    pub fn rows(&self, entity: &str) -> Vec<BTreeMap<String, Value>> {
        self.shared
            .store
            .read()
            .tables
            .get(entity)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of committed rows of an entity.
    #[must_use]
    pub fn row_count(&self, entity: &str) -> usize {
        self.shared
            .store
            .read()
            .tables
            .get(entity)
            .map_or(0, |table| table.rows.len())
    }

    /// Makes the next outer commit of any session fail.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Makes the next `connect` fail.
    pub fn fail_next_connect(&self) {
        self.shared.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Makes `execute` reject every statement containing `pattern`.
    pub fn reject_statements_containing(&self, pattern: &str) {
        self.shared.rejected.lock().push(pattern.to_string());
    }

    /// Marks the connections of all existing sessions as closed.
    pub fn invalidate_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Engine for MemoryEngine {
    fn backend_name(&self) -> &str {
        &self.backend_name
    }

    fn connect(&self) -> SessionResult<Box<dyn Session>> {
        if self.shared.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Backend("connection refused".to_string()));
        }
        self.shared.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            id: self.shared.next_session.fetch_add(1, Ordering::SeqCst) + 1,
            generation: self.shared.generation.load(Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
            tx: None,
            frames: Vec::new(),
            identity_map: HashMap::new(),
            new: Vec::new(),
            deleted: Vec::new(),
            active: true,
            closed: false,
        }))
    }
}

/// Working state of an open outer transaction.
#[derive(Debug, Clone, Default)]
struct Working {
    tables: Tables,
    changes: BTreeMap<(String, String), Option<(String, Record)>>,
    statements: Vec<String>,
}

impl Working {
    fn put(&mut self, entity: &str, primary_key: &str, key: &str, record: Record) {
        let table = self.tables.entry(entity.to_string()).or_insert_with(|| Table {
            primary_key: primary_key.to_string(),
            rows: BTreeMap::new(),
        });
        table.rows.insert(key.to_string(), record.clone());
        self.changes.insert(
            (entity.to_string(), key.to_string()),
            Some((primary_key.to_string(), record)),
        );
    }

    fn remove(&mut self, entity: &str, key: &str) {
        if let Some(table) = self.tables.get_mut(entity) {
            table.rows.remove(key);
        }
        self.changes
            .insert((entity.to_string(), key.to_string()), None);
    }

    fn record(&self, entity: &str, key: &str) -> Option<&Record> {
        self.tables.get(entity)?.rows.get(key)
    }
}

#[derive(Debug)]
enum Frame {
    Savepoint(Working),
    Subtransaction,
}

/// A session of a [`MemoryEngine`].
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    generation: u64,
    shared: Arc<Shared>,
    tx: Option<Working>,
    frames: Vec<Frame>,
    identity_map: HashMap<(String, String), Row>,
    new: Vec<Row>,
    deleted: Vec<Row>,
    active: bool,
    closed: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> SessionResult<()> {
        if self.is_connection_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn ensure_active(&self) -> SessionResult<()> {
        self.ensure_open()?;
        if !self.active {
            return Err(SessionError::Inactive);
        }
        Ok(())
    }

    fn working(&mut self) -> &mut Working {
        if self.tx.is_none() {
            self.shared
                .stats
                .transactions_started
                .fetch_add(1, Ordering::Relaxed);
            self.tx = Some(Working {
                tables: self.shared.store.read().tables.clone(),
                ..Working::default()
            });
        }
        self.tx.get_or_insert_with(Working::default)
    }

    fn stored_record(&self, entity: &str, key: &str) -> Option<Record> {
        match &self.tx {
            Some(working) => working.record(entity, key).cloned(),
            None => self
                .shared
                .store
                .read()
                .tables
                .get(entity)
                .and_then(|table| table.rows.get(key).cloned()),
        }
    }

    /// Brings attached rows back in line with the current view after a rollback.
    fn reconcile_rows(&mut self) {
        let keys: Vec<_> = self.identity_map.keys().cloned().collect();
        for (entity, key) in keys {
            match self.stored_record(&entity, &key) {
                Some(record) => {
                    if let Some(row) = self.identity_map.get(&(entity, key)) {
                        row.replace_fields(record);
                        row.attach(RowState::Persistent, self.id);
                    }
                }
                None => {
                    if let Some(row) = self.identity_map.remove(&(entity, key)) {
                        row.make_transient();
                    }
                }
            }
        }
    }

    fn discard_unflushed(&mut self) {
        for row in mem::take(&mut self.new) {
            row.make_transient();
        }
        for row in mem::take(&mut self.deleted) {
            row.attach(RowState::Persistent, self.id);
        }
    }

    fn commit_outer(&mut self) -> SessionResult<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(SessionError::backend("commit failed"));
        }
        let Some(working) = self.tx.take() else {
            return Ok(());
        };

        let mut store = self.shared.store.write();
        for ((entity, key), change) in working.changes {
            match change {
                Some((primary_key, record)) => {
                    store
                        .tables
                        .entry(entity)
                        .or_insert_with(|| Table {
                            primary_key,
                            rows: BTreeMap::new(),
                        })
                        .rows
                        .insert(key, record);
                }
                None => {
                    if let Some(table) = store.tables.get_mut(&entity) {
                        table.rows.remove(&key);
                    }
                }
            }
        }
        store.statements.extend(working.statements);
        store.next_key = self.shared.next_key.load(Ordering::SeqCst);
        self.shared
            .stats
            .transactions_committed
            .fetch_add(1, Ordering::Relaxed);
        debug!(session = self.id, "committed transaction");
        self.shared.persist(&store)
    }

    fn rollback_outer(&mut self) {
        if self.tx.take().is_some() {
            self.shared
                .stats
                .transactions_rolled_back
                .fetch_add(1, Ordering::Relaxed);
            debug!(session = self.id, "rolled back transaction");
        }
        self.frames.clear();
        self.active = true;
        self.discard_unflushed();
        self.reconcile_rows();
    }

    fn is_dirty(&self, entity: &str, key: &str, row: &Row) -> bool {
        row.state() == RowState::Persistent
            && self
                .stored_record(entity, key)
                .map_or(true, |record| record != row.fields())
    }
}

impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    fn begin(&mut self, nested: bool) -> SessionResult<()> {
        self.ensure_active()?;
        if self.tx.is_none() {
            self.working();
            return Ok(());
        }
        if nested {
            self.flush()?;
            let snapshot = self.working().clone();
            self.frames.push(Frame::Savepoint(snapshot));
            self.shared
                .stats
                .savepoints_opened
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames.push(Frame::Subtransaction);
            self.shared
                .stats
                .subtransactions_opened
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn commit(&mut self) -> SessionResult<()> {
        self.ensure_active()?;
        self.flush()?;
        if self.frames.pop().is_some() {
            return Ok(());
        }
        self.commit_outer()
    }

    fn rollback(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        match self.frames.pop() {
            Some(Frame::Savepoint(snapshot)) => {
                self.tx = Some(snapshot);
                self.discard_unflushed();
                self.reconcile_rows();
            }
            Some(Frame::Subtransaction) => self.active = false,
            None => self.rollback_outer(),
        }
        Ok(())
    }

    fn flush(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        if self.new.is_empty() && self.deleted.is_empty() && self.identity_map.is_empty() {
            return Ok(());
        }
        let id = self.id;
        let pending = mem::take(&mut self.new);

        // Resolve keys first so a conflict leaves every pending row in place.
        let mut inserts: Vec<(String, String, String, Row)> = Vec::with_capacity(pending.len());
        let mut conflict = None;
        for row in &pending {
            if row.state() != RowState::Pending {
                continue;
            }
            let entity = row.entity();
            let primary_key = row.primary_key();
            let key = match identity_key(&row.key_value()) {
                Some(key) => key,
                None => {
                    let next = self.shared.next_key.fetch_add(1, Ordering::SeqCst);
                    row.set(&primary_key, next);
                    next.to_string()
                }
            };
            let taken = self.stored_record(&entity, &key).is_some()
                || inserts.iter().any(|(e, _, k, _)| *e == entity && *k == key);
            if taken {
                conflict = Some(format!("duplicate primary key '{key}' for {entity}"));
                break;
            }
            inserts.push((entity, primary_key, key, row.clone()));
        }
        if let Some(message) = conflict {
            self.new = pending;
            return Err(SessionError::Integrity(message));
        }

        let deleted = mem::take(&mut self.deleted);
        let dirty: Vec<_> = self
            .identity_map
            .iter()
            .filter(|((entity, key), row)| self.is_dirty(entity, key, row))
            .map(|(entry, row)| (entry.clone(), row.clone()))
            .collect();
        if inserts.is_empty() && dirty.is_empty() && deleted.is_empty() {
            return Ok(());
        }

        let working = self.working();
        for (entity, primary_key, key, row) in &inserts {
            working.put(entity, primary_key, key, row.fields());
        }
        for ((entity, key), row) in &dirty {
            working.put(entity, &row.primary_key(), key, row.fields());
        }
        for row in &deleted {
            if let Some(key) = row.identity() {
                working.remove(&row.entity(), &key);
            }
        }

        for (entity, _, key, row) in inserts {
            row.set_identity(key.clone());
            row.attach(RowState::Persistent, id);
            self.identity_map.insert((entity, key), row);
        }
        for row in deleted {
            if let Some(key) = row.identity() {
                self.identity_map.remove(&(row.entity(), key));
            }
            row.make_transient();
        }
        Ok(())
    }

    fn query(&mut self, query: &Query) -> SessionResult<Vec<Row>> {
        self.ensure_active()?;
        self.flush()?;
        let id = self.id;
        let working = self.working();
        let Some(table) = working.tables.get(query.entity()) else {
            return Ok(Vec::new());
        };
        let primary_key = table.primary_key.clone();
        let mut matched: Vec<(String, Record)> = table
            .rows
            .iter()
            .filter(|(_, record)| query.matches(record))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect();
        query.sort(&mut matched, |(_, record)| record);
        if let Some(limit) = query.row_limit() {
            matched.truncate(limit);
        }

        let entity = query.entity().to_string();
        let rows = matched
            .into_iter()
            .map(|(key, record)| {
                self.identity_map
                    .entry((entity.clone(), key.clone()))
                    .or_insert_with(|| {
                        Row::from_parts(
                            &entity,
                            &primary_key,
                            record,
                            RowState::Persistent,
                            Some(key),
                            Some(id),
                        )
                    })
                    .clone()
            })
            .collect();
        Ok(rows)
    }

    fn delete_matching(&mut self, query: &Query) -> SessionResult<usize> {
        self.ensure_active()?;
        self.flush()?;
        let entity = query.entity().to_string();
        let working = self.working();
        let keys: Vec<String> = working
            .tables
            .get(&entity)
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter(|(_, record)| query.matches(record))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        for key in &keys {
            working.remove(&entity, key);
        }
        for key in &keys {
            if let Some(row) = self.identity_map.remove(&(entity.clone(), key.clone())) {
                row.make_transient();
            }
        }
        Ok(keys.len())
    }

    fn add(&mut self, row: &Row) -> SessionResult<()> {
        self.ensure_active()?;
        let attached_here = row.session_id() == Some(self.id);
        match row.state() {
            RowState::Pending | RowState::Persistent if attached_here => Ok(()),
            RowState::Deleted if attached_here => Err(SessionError::invalid_request(
                "row is marked for deletion",
            )),
            _ if row.has_identity() => {
                let key = (row.entity(), row.identity().unwrap_or_default());
                if let Some(existing) = self.identity_map.get(&key) {
                    if !existing.ptr_eq(row) {
                        return Err(SessionError::invalid_request(format!(
                            "another row with identity '{}' is already attached",
                            key.1
                        )));
                    }
                }
                self.working();
                row.attach(RowState::Persistent, self.id);
                self.identity_map.insert(key, row.clone());
                Ok(())
            }
            _ => {
                self.working();
                row.attach(RowState::Pending, self.id);
                self.new.push(row.clone());
                Ok(())
            }
        }
    }

    fn delete(&mut self, row: &Row) -> SessionResult<()> {
        self.ensure_active()?;
        let attached_here = row.session_id() == Some(self.id);
        match row.state() {
            RowState::Pending if attached_here => {
                self.new.retain(|pending| !pending.ptr_eq(row));
                row.make_transient();
                Ok(())
            }
            RowState::Persistent if attached_here => {
                self.working();
                row.attach(RowState::Deleted, self.id);
                self.deleted.push(row.clone());
                Ok(())
            }
            RowState::Deleted if attached_here => Ok(()),
            _ if row.has_identity() => {
                let merged = self.merge(row, true)?;
                self.delete(&merged)
            }
            _ => Err(SessionError::invalid_request("row is not persisted")),
        }
    }

    fn merge(&mut self, row: &Row, load: bool) -> SessionResult<Row> {
        self.ensure_active()?;
        let Some(key) = row.identity() else {
            return Err(SessionError::invalid_request(
                "cannot merge a row without identity",
            ));
        };
        let entity = row.entity();
        if let Some(existing) = self.identity_map.get(&(entity.clone(), key.clone())) {
            if !existing.ptr_eq(row) {
                existing.replace_fields(row.fields());
            }
            return Ok(existing.clone());
        }

        self.working();
        if load && self.stored_record(&entity, &key).is_none() {
            // Gone from storage; insert it again under the same key.
            row.make_transient();
            row.attach(RowState::Pending, self.id);
            self.new.push(row.clone());
            return Ok(row.clone());
        }
        row.attach(RowState::Persistent, self.id);
        self.identity_map.insert((entity, key), row.clone());
        Ok(row.clone())
    }

    fn refresh(&mut self, row: &Row) -> SessionResult<()> {
        self.ensure_active()?;
        if !self.contains(row) {
            return Err(SessionError::invalid_request("row is not attached"));
        }
        let entity = row.entity();
        let Some(key) = row.identity() else {
            return Err(SessionError::invalid_request("row has not been flushed"));
        };
        self.working();
        match self.stored_record(&entity, &key) {
            Some(record) => {
                row.replace_fields(record);
                Ok(())
            }
            None => Err(SessionError::NotFound { entity, key }),
        }
    }

    fn contains(&self, row: &Row) -> bool {
        row.session_id() == Some(self.id)
            && matches!(
                row.state(),
                RowState::Pending | RowState::Persistent | RowState::Deleted
            )
    }

    fn execute(&mut self, statement: &str) -> SessionResult<u64> {
        self.ensure_active()?;
        let rejected = self
            .shared
            .rejected
            .lock()
            .iter()
            .any(|pattern| statement.contains(pattern.as_str()));
        if rejected {
            return Err(SessionError::backend(format!(
                "statement rejected: {statement}"
            )));
        }
        self.working().statements.push(statement.to_string());
        self.shared
            .stats
            .statements_executed
            .fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }

    fn expunge_all(&mut self) {
        for row in mem::take(&mut self.new) {
            row.make_transient();
        }
        self.deleted.clear();
        for (_, row) in self.identity_map.drain() {
            row.detach();
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.rollback_outer();
            self.expunge_all();
            self.closed = true;
        }
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn is_active(&self) -> bool {
        !self.closed && self.active
    }

    fn is_connection_closed(&self) -> bool {
        self.closed || self.generation != self.shared.generation.load(Ordering::SeqCst)
    }

    fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            dirty: self
                .identity_map
                .iter()
                .filter(|((entity, key), row)| self.is_dirty(entity, key, row))
                .count(),
            deleted: self.deleted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;

    fn note(text: &str) -> Row {
        let row = Row::new("pas_note", "id", &["id", "text"]);
        row.set("text", text);
        row
    }

    #[test]
    fn commit_makes_rows_visible_to_other_sessions() {
        let engine = MemoryEngine::new();
        let mut writer = engine.connect().unwrap();
        writer.add(&note("a")).unwrap();

        let mut reader = engine.connect().unwrap();
        assert!(reader.query(&Query::new("pas_note")).unwrap().is_empty());

        writer.commit().unwrap();
        reader.rollback().unwrap();
        assert_eq!(reader.query(&Query::new("pas_note")).unwrap().len(), 1);
        assert_eq!(engine.stats().transactions_committed, 1);
    }

    #[test]
    fn flush_assigns_identity() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        let row = note("a");
        session.add(&row).unwrap();
        assert_eq!(row.state(), RowState::Pending);

        session.flush().unwrap();
        assert_eq!(row.state(), RowState::Persistent);
        assert!(row.has_identity());
        assert_eq!(row.key_value(), Value::Integer(1));
    }

    #[test]
    fn query_uses_identity_map() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        let row = note("a");
        session.add(&row).unwrap();

        let found = session.query(&Query::new("pas_note")).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ptr_eq(&row));
    }

    #[test]
    fn savepoint_rollback_restores_snapshot() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        session.add(&note("kept")).unwrap();
        session.begin(true).unwrap();
        let discarded = note("discarded");
        session.add(&discarded).unwrap();
        session.flush().unwrap();

        session.rollback().unwrap();
        assert_eq!(discarded.state(), RowState::Transient);
        session.commit().unwrap();

        let rows = engine.rows("pas_note");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], Value::Text("kept".into()));
        assert_eq!(engine.stats().savepoints_opened, 1);
    }

    #[test]
    fn subtransaction_rollback_deactivates_session() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        session.begin(false).unwrap();
        assert!(session.in_transaction());
        session.begin(false).unwrap();
        session.rollback().unwrap();
        assert!(!session.is_active());
        assert!(matches!(session.commit(), Err(SessionError::Inactive)));

        session.rollback().unwrap();
        assert!(session.is_active());
    }

    #[test]
    fn injected_commit_failure_keeps_transaction() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        session.add(&note("a")).unwrap();
        engine.fail_next_commit();

        assert!(session.commit().is_err());
        session.rollback().unwrap();
        assert_eq!(engine.row_count("pas_note"), 0);
        assert_eq!(engine.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn statements_are_transactional() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        session.execute("CREATE TABLE a").unwrap();
        session.rollback().unwrap();
        session.execute("CREATE TABLE b").unwrap();
        session.commit().unwrap();
        assert_eq!(engine.statements(), vec!["CREATE TABLE b".to_string()]);
    }

    #[test]
    fn rejected_statement_fails() {
        let engine = MemoryEngine::new();
        engine.reject_statements_containing("DROP");
        let mut session = engine.connect().unwrap();
        assert!(matches!(
            session.execute("DROP TABLE x"),
            Err(SessionError::Backend(_))
        ));
    }

    #[test]
    fn delete_and_delete_matching() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        for text in ["a", "b", "c"] {
            session.add(&note(text)).unwrap();
        }
        session.commit().unwrap();

        let rows = session
            .query(&Query::new("pas_note").filter(Filter::eq("text", "a")))
            .unwrap();
        session.delete(&rows[0]).unwrap();
        let removed = session
            .delete_matching(&Query::new("pas_note").filter(Filter::eq("text", "b")))
            .unwrap();
        assert_eq!(removed, 1);
        session.commit().unwrap();
        assert_eq!(engine.row_count("pas_note"), 1);
    }

    #[test]
    fn merge_reattaches_detached_row() {
        let engine = MemoryEngine::new();
        let mut first = engine.connect().unwrap();
        let row = note("a");
        first.add(&row).unwrap();
        first.commit().unwrap();
        first.close();
        assert_eq!(row.state(), RowState::Detached);

        let mut second = engine.connect().unwrap();
        assert!(!second.contains(&row));
        let merged = second.merge(&row, true).unwrap();
        assert!(second.contains(&merged));
        merged.set("text", "b");
        second.commit().unwrap();
        assert_eq!(engine.rows("pas_note")[0]["text"], Value::Text("b".into()));
    }

    #[test]
    fn failed_connect_is_one_shot() {
        let engine = MemoryEngine::new();
        engine.fail_next_connect();
        assert!(matches!(engine.connect(), Err(SessionError::Backend(_))));
        assert!(engine.connect().is_ok());
        assert_eq!(engine.stats().sessions_opened, 1);
    }

    #[test]
    fn invalidated_connection_reports_closed() {
        let engine = MemoryEngine::new();
        let session = engine.connect().unwrap();
        assert!(!session.is_connection_closed());
        engine.invalidate_connections();
        assert!(session.is_connection_closed());
    }

    #[test]
    fn duplicate_key_is_an_integrity_error() {
        let engine = MemoryEngine::new();
        let mut session = engine.connect().unwrap();
        let first = note("a");
        first.set("id", "k");
        let second = note("b");
        second.set("id", "k");
        session.add(&first).unwrap();
        session.add(&second).unwrap();
        assert!(matches!(session.flush(), Err(SessionError::Integrity(_))));
        assert_eq!(session.pending_counts().new, 2);
    }

    #[test]
    fn file_engine_persists_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        {
            let engine = MemoryEngine::open_file(&path).unwrap();
            let mut session = engine.connect().unwrap();
            session.add(&note("a")).unwrap();
            session.commit().unwrap();
        }
        let engine = MemoryEngine::open_file(&path).unwrap();
        assert_eq!(engine.row_count("pas_note"), 1);
        assert_eq!(engine.backend_name(), "json");
    }
}
