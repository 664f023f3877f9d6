//! Per-thread connection proxy with reentrant transactions.
//!
//! A [`Connection`] wraps one session for one thread and tracks two
//! independent counters:
//!
//! - the *context depth*: how many connection contexts are open. The
//!   outermost entry acquires the serialization lock and ensures a live
//!   session; the outermost exit commits or rolls back and releases the lock.
//! - the *transaction depth*: how many explicit [`Connection::begin`] calls are
//!   open. The first begin starts the real transaction, deeper ones open
//!   savepoints or subtransactions.

use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use crate::registry::Registry;
use pasdb_session::{PendingCounts, Query, Row, Session, SessionError, SessionResult, Value};
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use std::thread;
use tracing::{debug, error, warn};

thread_local! {
    static CONNECTIONS: RefCell<HashMap<u64, Weak<Connection>>> = RefCell::new(HashMap::new());
}

/// The calling thread's connection to a [`Registry`].
///
/// Obtained through [`Connection::get_instance`]; repeated calls on the same
/// thread return the same connection while any handle to it is alive.
pub struct Connection {
    registry: Registry,
    session: RefCell<Option<Box<dyn Session>>>,
    transaction_depth: Cell<usize>,
    context_depth: Cell<usize>,
    holds_lock: Cell<bool>,
}

impl Connection {
    /// Returns the calling thread's connection, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry's engine cannot be created.
    pub fn get_instance(registry: &Registry) -> DbResult<Rc<Self>> {
        let id = registry.id();
        let cached = CONNECTIONS.with(|connections| {
            connections.borrow().get(&id).and_then(Weak::upgrade)
        });
        if let Some(connection) = cached {
            return Ok(connection);
        }

        registry.engine()?;
        let connection = Rc::new(Self {
            registry: registry.clone(),
            session: RefCell::new(None),
            transaction_depth: Cell::new(0),
            context_depth: Cell::new(0),
            holds_lock: Cell::new(false),
        });
        CONNECTIONS.with(|connections| {
            connections
                .borrow_mut()
                .insert(id, Rc::downgrade(&connection));
        });
        if registry.settings().threaded_debug {
            debug!(thread = ?thread::current().id(), "created database connection");
        }
        Ok(connection)
    }

    pub(crate) fn forget(registry_id: u64) {
        let _ = CONNECTIONS.try_with(|connections| connections.borrow_mut().remove(&registry_id));
    }

    /// Enters a connection context, returning a guard that exits it.
    ///
    /// Call [`ConnectionContext::finish`] on success; dropping the guard
    /// without finishing exits the context as failed and rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockTimeout`] if the serialization lock is not free
    /// in time, or an error if no session can be opened. A nested entry fails
    /// with [`SessionError::Closed`] if the session died since the outermost
    /// entry.
    pub fn enter(self: &Rc<Self>) -> DbResult<ConnectionContext> {
        self.enter_context()?;
        Ok(ConnectionContext {
            connection: Rc::clone(self),
            finished: false,
        })
    }

    /// Runs `f` inside a connection context.
    ///
    /// The context commits if `f` returns `Ok` and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error of entering the context or of `f`.
    pub fn scope<T, E>(
        self: &Rc<Self>,
        f: impl FnOnce(&Rc<Connection>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let context = self.enter()?;
        let result = f(self);
        if result.is_ok() {
            context.finish();
        }
        result
    }

    /// Wraps `f` so that every call runs inside a connection context.
    pub fn wrap_callable<A, T, F>(registry: &Registry, f: F) -> impl Fn(A) -> DbResult<T>
    where
        F: Fn(&Rc<Connection>, A) -> DbResult<T>,
    {
        let registry = registry.clone();
        move |args| {
            let connection = Connection::get_instance(&registry)?;
            connection.scope(|connection| f(connection, args))
        }
    }

    pub(crate) fn enter_context(&self) -> DbResult<()> {
        let outermost = self.context_depth.get() == 0;
        if outermost && self.registry.is_serialized() {
            let timeout = self.registry.settings().lock_timeout;
            self.registry.serialization_lock().acquire(timeout)?;
            self.holds_lock.set(true);
            if self.registry.settings().threaded_debug {
                debug!(thread = ?thread::current().id(), "acquired database lock");
            }
        }

        if outermost {
            if let Err(err) = self.ensure_session() {
                self.release_lock();
                return Err(err);
            }
        } else if !self.has_live_session() {
            error!(
                depth = self.context_depth.get(),
                "database session lost inside an open connection context"
            );
            return Err(SessionError::Closed.into());
        }
        self.context_depth.set(self.context_depth.get() + 1);
        Ok(())
    }

    fn has_live_session(&self) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|session| !session.is_connection_closed())
    }

    pub(crate) fn exit_context(&self, failed: bool) {
        let depth = self.context_depth.get();
        if depth == 0 {
            warn!("connection context exited more often than entered");
            return;
        }
        self.context_depth.set(depth - 1);
        if depth > 1 {
            return;
        }

        let open = self.transaction_depth.get();
        let result = match self.session.borrow_mut().as_mut() {
            None => Ok(()),
            Some(session) if session.is_connection_closed() => {
                debug!("connection closed before context exit");
                Ok(())
            }
            Some(session) if open > 0 => {
                warn!(
                    transactions = open,
                    "connection context closed with open transactions, rolling back"
                );
                (0..open).try_for_each(|_| session.rollback())
            }
            Some(session) if !failed && session.is_active() => session.commit(),
            Some(session) => session.rollback(),
        };

        if let Err(err) = result {
            error!(error = %err, "failed to finish connection context");
            if let Some(session) = self.session.borrow_mut().as_mut() {
                if let Err(err) = session.rollback() {
                    error!(error = %err, "rollback after failed context exit failed");
                }
            }
        }

        self.transaction_depth.set(0);
        self.release_lock();
    }

    fn ensure_session(&self) -> DbResult<()> {
        let mut slot = self.session.borrow_mut();
        if let Some(session) = slot.as_mut() {
            if session.is_active() && !session.is_connection_closed() {
                return Ok(());
            }
            debug!(session = session.id(), "replacing inactive database session");
            session.expunge_all();
            session.close();
            *slot = None;
            if self.transaction_depth.replace(0) > 0 {
                warn!("transactions of the replaced session were lost");
            }
        }
        let engine = self.registry.engine()?;
        *slot = Some(engine.connect()?);
        Ok(())
    }

    fn release_lock(&self) {
        if self.holds_lock.replace(false) {
            self.registry.serialization_lock().release();
            if self.registry.settings().threaded_debug {
                debug!(thread = ?thread::current().id(), "released database lock");
            }
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut dyn Session) -> SessionResult<T>) -> DbResult<T> {
        if self.session.borrow().is_none() {
            self.ensure_session()?;
        }
        let mut slot = self.session.borrow_mut();
        let session = slot
            .as_mut()
            .ok_or_else(|| DbError::io("database session is not available"))?;
        Ok(f(session.as_mut())?)
    }

    fn delegate<T>(&self, f: impl FnOnce(&mut dyn Session) -> SessionResult<T>) -> DbResult<T> {
        if self.context_depth.get() == 0 {
            debug!("database session used outside of a connection context");
        }
        self.with_session(f)
    }

    /// Begins a transaction.
    ///
    /// The first level starts the real transaction (or adopts one the session
    /// already began); deeper levels open a savepoint or a subtransaction
    /// depending on the `use_native_nested` setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the session refuses to begin.
    pub fn begin(&self) -> DbResult<()> {
        let depth = self.transaction_depth.get();
        let nested = self.registry.settings().use_native_nested;
        self.with_session(|session| {
            if depth == 0 {
                if session.in_transaction() {
                    Ok(())
                } else {
                    session.begin(false)
                }
            } else {
                session.begin(nested)
            }
        })?;
        self.transaction_depth.set(depth + 1);
        debug!(depth = depth + 1, "transaction started");
        Ok(())
    }

    /// Commits the innermost transaction level.
    ///
    /// The real commit happens when the depth drops from 1 to 0. Does
    /// nothing if no transaction is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails to commit; the depth is then
    /// left unchanged.
    pub fn commit(&self) -> DbResult<()> {
        let depth = self.transaction_depth.get();
        if depth == 0 {
            return Ok(());
        }
        self.with_session(|session| session.commit())?;
        self.transaction_depth.set(depth - 1);
        debug!(depth = depth - 1, "transaction committed");
        Ok(())
    }

    /// Rolls back the innermost transaction level.
    ///
    /// With savepoints only the innermost level is undone. With
    /// subtransactions every level is unwound and the depth drops to 0. Does
    /// nothing if no transaction is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails to roll back.
    pub fn rollback(&self) -> DbResult<()> {
        let depth = self.transaction_depth.get();
        if depth == 0 {
            return Ok(());
        }
        if depth > 1 && !self.registry.settings().use_native_nested {
            self.with_session(|session| (0..depth).try_for_each(|_| session.rollback()))?;
            self.transaction_depth.set(0);
        } else {
            self.with_session(|session| session.rollback())?;
            self.transaction_depth.set(depth - 1);
        }
        debug!(depth = self.transaction_depth.get(), "transaction rolled back");
        Ok(())
    }

    /// Returns the number of open transaction levels.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth.get()
    }

    /// Returns the number of open connection contexts.
    #[must_use]
    pub fn context_depth(&self) -> usize {
        self.context_depth.get()
    }

    /// Returns the registry this connection belongs to.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the table prefix.
    #[must_use]
    pub fn table_prefix(&self) -> &str {
        self.registry.table_prefix()
    }

    /// Returns the backend name.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.registry.backend_name()
    }

    /// Escapes `LIKE` wildcards so that `value` matches literally.
    ///
    /// Uses `\` as escape character, which all supported backends accept.
    #[must_use]
    pub fn escape_like_condition(value: &str) -> String {
        value.replace('%', "\\%").replace('_', "\\_")
    }

    /// Runs backend maintenance on a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to optimize.
    pub fn optimize(&self, table: &str) -> DbResult<()> {
        debug!(table, backend = self.backend_name(), "optimize requested");
        Ok(())
    }

    /// Calls [`Connection::optimize`] with a probability of 1/10.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimization runs and fails.
    pub fn optimize_random(&self, table: &str) -> DbResult<()> {
        if rand::thread_rng().gen_range(0..10) == 0 {
            self.optimize(table)
        } else {
            Ok(())
        }
    }

    /// Runs a query.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails.
    pub fn query(&self, query: &Query) -> DbResult<Vec<Row>> {
        self.delegate(|session| session.query(query))
    }

    /// Looks up a row of `descriptor` by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails.
    pub fn get(&self, descriptor: &EntityDescriptor, key: &Value) -> DbResult<Option<Row>> {
        let table = descriptor.table_name(self.table_prefix());
        self.delegate(|session| session.get(&table, descriptor.primary_key, key))
    }

    /// Deletes all rows matching `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session fails.
    pub fn delete_matching(&self, query: &Query) -> DbResult<usize> {
        self.delegate(|session| session.delete_matching(query))
    }

    /// Adds a row to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session refuses the row.
    pub fn add(&self, row: &Row) -> DbResult<()> {
        self.delegate(|session| session.add(row))
    }

    /// Marks a row for deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the row was never persisted.
    pub fn delete(&self, row: &Row) -> DbResult<()> {
        self.delegate(|session| session.delete(row))
    }

    /// Attaches a detached row and returns the attached handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the row has no identity.
    pub fn merge(&self, row: &Row, load: bool) -> DbResult<Row> {
        self.delegate(|session| session.merge(row, load))
    }

    /// Reloads an attached row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row no longer exists.
    pub fn refresh(&self, row: &Row) -> DbResult<()> {
        self.delegate(|session| session.refresh(row))
    }

    /// Returns true if `row` is attached to this connection's session.
    #[must_use]
    pub fn contains(&self, row: &Row) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|session| session.contains(row))
    }

    /// Executes a raw statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the statement.
    pub fn execute(&self, statement: &str) -> DbResult<u64> {
        self.delegate(|session| session.execute(statement))
    }

    /// Flushes pending changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a constraint is violated.
    pub fn flush(&self) -> DbResult<()> {
        self.delegate(|session| session.flush())
    }

    /// Returns the rows the session still has to write.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        self.session
            .borrow()
            .as_ref()
            .map(|session| session.pending_counts())
            .unwrap_or_default()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.get_mut().take() {
            let pending = session.pending_counts();
            if pending.new > 0 {
                warn!(rows = pending.new, "database session dropped with unsaved new rows");
            }
            if pending.dirty > 0 {
                warn!(rows = pending.dirty, "database session dropped with unsaved changes");
            }
            if pending.deleted > 0 {
                warn!(rows = pending.deleted, "database session dropped with unsaved deletions");
            }
            session.expunge_all();
            session.close();
        }
        self.release_lock();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transaction_depth", &self.transaction_depth.get())
            .field("context_depth", &self.context_depth.get())
            .field("holds_lock", &self.holds_lock.get())
            .finish_non_exhaustive()
    }
}

/// Guard of an open connection context.
///
/// Dereferences to the [`Connection`].
#[must_use = "dropping the guard exits the connection context as failed"]
#[derive(Debug)]
pub struct ConnectionContext {
    connection: Rc<Connection>,
    finished: bool,
}

impl ConnectionContext {
    /// Exits the context cleanly, committing if no transaction is left open.
    pub fn finish(mut self) {
        self.finished = true;
        self.connection.exit_context(false);
    }

    /// Returns the connection handle.
    #[must_use]
    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }
}

impl Deref for ConnectionContext {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        if !self.finished {
            self.connection.exit_context(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use pasdb_session::{Filter, MemoryEngine};
    use std::sync::Arc;

    fn registry(settings: Settings) -> (Registry, MemoryEngine) {
        let engine = MemoryEngine::new();
        let registry =
            Registry::with_engine(settings.url("memory:"), Arc::new(engine.clone())).unwrap();
        (registry, engine)
    }

    fn note(text: &str) -> Row {
        let row = Row::new("pas_note", "id", &["id", "text"]);
        row.set("text", text);
        row
    }

    #[test]
    fn same_thread_gets_same_connection() {
        let (registry, _) = registry(Settings::new());
        let first = Connection::get_instance(&registry).unwrap();
        let second = Connection::get_instance(&registry).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn dropped_connection_is_recreated() {
        let (registry, _) = registry(Settings::new());
        let first = Connection::get_instance(&registry).unwrap();
        let weak = Rc::downgrade(&first);
        drop(first);
        assert!(weak.upgrade().is_none());
        let second = Connection::get_instance(&registry).unwrap();
        assert_eq!(second.context_depth(), 0);
    }

    #[test]
    fn clean_context_exit_commits() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let context = connection.enter().unwrap();
        context.add(&note("a")).unwrap();
        context.finish();

        assert_eq!(engine.row_count("pas_note"), 1);
        assert_eq!(connection.context_depth(), 0);
    }

    #[test]
    fn dropped_context_rolls_back() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        {
            let context = connection.enter().unwrap();
            context.add(&note("a")).unwrap();
        }
        assert_eq!(engine.row_count("pas_note"), 0);
        assert_eq!(connection.context_depth(), 0);
    }

    #[test]
    fn scope_rolls_back_on_error() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let result: DbResult<()> = connection.scope(|connection| {
            connection.add(&note("a"))?;
            Err(DbError::value("boom"))
        });
        assert!(result.is_err());
        assert_eq!(engine.row_count("pas_note"), 0);
    }

    #[test]
    fn nested_begin_uses_savepoints() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let context = connection.enter().unwrap();
        connection.begin().unwrap();
        connection.add(&note("outer")).unwrap();
        connection.begin().unwrap();
        connection.add(&note("inner")).unwrap();
        assert_eq!(connection.transaction_depth(), 2);

        connection.rollback().unwrap();
        assert_eq!(connection.transaction_depth(), 1);
        connection.commit().unwrap();
        assert_eq!(connection.transaction_depth(), 0);
        context.finish();

        let rows = engine.rows("pas_note");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["text"], Value::Text("outer".into()));
        assert_eq!(engine.stats().savepoints_opened, 1);
        assert_eq!(engine.stats().transactions_committed, 1);
    }

    #[test]
    fn subtransaction_rollback_unwinds_everything() {
        let (registry, engine) = registry(Settings::new().use_native_nested(false));
        let connection = registry.connection().unwrap();
        let context = connection.enter().unwrap();
        connection.begin().unwrap();
        connection.add(&note("outer")).unwrap();
        connection.begin().unwrap();
        connection.begin().unwrap();

        connection.rollback().unwrap();
        assert_eq!(connection.transaction_depth(), 0);
        context.finish();

        assert_eq!(engine.row_count("pas_note"), 0);
        assert_eq!(engine.stats().subtransactions_opened, 2);
    }

    #[test]
    fn commit_and_rollback_at_depth_zero_are_no_ops() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        connection.commit().unwrap();
        connection.rollback().unwrap();
        assert_eq!(connection.transaction_depth(), 0);
        assert_eq!(engine.stats().transactions_committed, 0);
    }

    #[test]
    fn open_transactions_are_rolled_back_at_context_exit() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let context = connection.enter().unwrap();
        connection.begin().unwrap();
        connection.add(&note("left open")).unwrap();
        context.finish();

        assert_eq!(connection.transaction_depth(), 0);
        assert_eq!(engine.row_count("pas_note"), 0);
    }

    #[test]
    fn failed_commit_at_exit_is_logged_not_raised() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let context = connection.enter().unwrap();
        connection.add(&note("a")).unwrap();
        engine.fail_next_commit();
        context.finish();

        assert_eq!(engine.row_count("pas_note"), 0);
        assert_eq!(engine.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn invalidated_session_is_replaced_on_entry() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        connection.enter().unwrap().finish();
        engine.invalidate_connections();
        connection.enter().unwrap().finish();
        assert_eq!(engine.stats().sessions_opened, 2);
    }

    #[test]
    fn nested_entry_refuses_replaced_session() {
        let (registry, engine) = registry(Settings::new());
        let connection = registry.connection().unwrap();
        let outer = connection.enter().unwrap();
        connection.begin().unwrap();
        engine.invalidate_connections();

        let err = connection.enter().unwrap_err();
        assert!(matches!(err, DbError::Session(SessionError::Closed)));
        assert_eq!(connection.context_depth(), 1);
        assert_eq!(connection.transaction_depth(), 1);
        assert_eq!(engine.stats().sessions_opened, 1);
        drop(outer);

        assert_eq!(connection.context_depth(), 0);
        connection.enter().unwrap().finish();
        assert_eq!(engine.stats().sessions_opened, 2);
    }

    #[test]
    fn failed_connect_releases_lock() {
        let (registry, engine) = registry(Settings::new().threaded(false));
        let connection = registry.connection().unwrap();
        engine.fail_next_connect();
        assert!(connection.enter().is_err());
        assert_eq!(connection.context_depth(), 0);

        let stats = registry.lock_stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert!(!registry.serialization_lock().is_locked());
    }

    #[test]
    fn serialized_contexts_pair_lock_operations() {
        let (registry, _) = registry(Settings::new().threaded(false));
        let connection = registry.connection().unwrap();
        {
            let outer = connection.enter().unwrap();
            let inner = connection.enter().unwrap();
            inner.finish();
            outer.finish();
        }
        let stats = registry.lock_stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn escape_like_condition() {
        assert_eq!(Connection::escape_like_condition("100%_x"), "100\\%\\_x");
        let pattern = format!("{}%", Connection::escape_like_condition("a_"));
        assert!(pasdb_session::like_matches("a_bc", &pattern, true));
        assert!(!pasdb_session::like_matches("axbc", &pattern, true));
    }

    #[test]
    fn wrap_callable_runs_in_context() {
        let (registry, engine) = registry(Settings::new());
        let insert = Connection::wrap_callable(&registry, |connection, text: &str| {
            assert_eq!(connection.context_depth(), 1);
            connection.add(&note(text))
        });
        insert("a").unwrap();
        insert("b").unwrap();
        assert_eq!(engine.row_count("pas_note"), 2);

        let connection = registry.connection().unwrap();
        let found = connection
            .scope(|c| c.query(&Query::new("pas_note").filter(Filter::eq("text", "b"))))
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
