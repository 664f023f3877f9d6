//! Session and engine traits.

use crate::error::SessionResult;
use crate::query::{Filter, Query};
use crate::row::Row;
use crate::value::Value;

/// Number of rows a session still has to write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Rows added but never flushed.
    pub new: usize,
    /// Attached rows whose values differ from the working set.
    pub dirty: usize,
    /// Rows marked for deletion but not flushed.
    pub deleted: usize,
}

impl PendingCounts {
    /// Returns true if nothing is pending.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

/// A unit-of-work session over one database connection.
///
/// A session autobegins its outer transaction on first use. Further calls to
/// [`Session::begin`] open nested frames which are closed again by
/// [`Session::commit`] or [`Session::rollback`], innermost first.
///
/// # Invariants
///
/// - `query` returns the same [`Row`] handle for the same stored row while
///   the row stays attached
/// - pending changes are flushed before a query runs
/// - rolling back a subtransaction frame leaves the session inactive until
///   the outer transaction is rolled back
///
/// # Implementors
///
/// - [`super::MemorySession`]
pub trait Session: Send {
    /// Returns the id of this session, unique per engine.
    fn id(&self) -> u64;

    /// Begins a transaction.
    ///
    /// Starts the outer transaction if none is open. Otherwise opens a
    /// savepoint if `nested` is set, or a subtransaction marker if not.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed or inactive.
    fn begin(&mut self, nested: bool) -> SessionResult<()>;

    /// Commits the innermost open frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the commit fails, or the session is
    /// inactive.
    fn commit(&mut self) -> SessionResult<()>;

    /// Rolls back the innermost open frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed.
    fn rollback(&mut self) -> SessionResult<()>;

    /// Writes pending changes into the transaction's working set.
    ///
    /// # Errors
    ///
    /// Returns an error if a constraint is violated.
    fn flush(&mut self) -> SessionResult<()>;

    /// Runs a query.
    ///
    /// # Errors
    ///
    /// Returns an error if the autoflush fails or the session is closed.
    fn query(&mut self, query: &Query) -> SessionResult<Vec<Row>>;

    /// Deletes all rows matching the query and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the autoflush fails or the session is closed.
    fn delete_matching(&mut self, query: &Query) -> SessionResult<usize>;

    /// Adds a row to the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the row was deleted in this session.
    fn add(&mut self, row: &Row) -> SessionResult<()>;

    /// Marks an attached row for deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if the row was never persisted.
    fn delete(&mut self, row: &Row) -> SessionResult<()>;

    /// Attaches a detached row, returning the attached handle.
    ///
    /// If the session already holds a row with the same identity, the values
    /// of `row` are copied onto it and that handle is returned. With `load`
    /// set, the stored values are read first.
    ///
    /// # Errors
    ///
    /// Returns an error if the row has no identity.
    fn merge(&mut self, row: &Row, load: bool) -> SessionResult<Row>;

    /// Reloads an attached row from the working set.
    ///
    /// # Errors
    ///
    /// Returns an error if the row no longer exists.
    fn refresh(&mut self, row: &Row) -> SessionResult<()>;

    /// Returns true if the row is attached to this session.
    fn contains(&self, row: &Row) -> bool;

    /// Executes a raw statement inside the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the statement.
    fn execute(&mut self, statement: &str) -> SessionResult<u64>;

    /// Detaches every row held by the session.
    fn expunge_all(&mut self);

    /// Rolls back any open transaction and closes the session.
    fn close(&mut self);

    /// Returns true while an outer transaction is open.
    fn in_transaction(&self) -> bool;

    /// Returns false once closed, or after a subtransaction rollback.
    fn is_active(&self) -> bool;

    /// Returns true if the underlying connection is closed or invalidated.
    fn is_connection_closed(&self) -> bool;

    /// Returns the number of rows that still need to be written.
    fn pending_counts(&self) -> PendingCounts;

    /// Looks up a row by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn get(&mut self, entity: &str, primary_key: &str, key: &Value) -> SessionResult<Option<Row>> {
        let query = Query::new(entity)
            .filter(Filter::eq(primary_key, key.clone()))
            .limit(1);
        Ok(self.query(&query)?.into_iter().next())
    }
}

/// A factory for sessions sharing one database.
pub trait Engine: Send + Sync {
    /// Returns the backend name, e.g. `memory`.
    fn backend_name(&self) -> &str;

    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be established.
    fn connect(&self) -> SessionResult<Box<dyn Session>>;
}
