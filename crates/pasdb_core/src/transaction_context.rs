//! Scoped transactions spanning a connection context.

use crate::connection::Connection;
use crate::error::DbResult;
use crate::registry::Registry;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{error, warn};

/// A reentrant transaction scope.
///
/// The first [`TransactionContext::enter`] opens a connection context and
/// begins a transaction; nested entries only count. The matching final
/// [`TransactionContext::exit`] commits, or rolls back if the scope failed,
/// and then leaves the connection context.
#[derive(Debug)]
pub struct TransactionContext {
    registry: Registry,
    connection: Option<Rc<Connection>>,
    depth: usize,
}

impl TransactionContext {
    /// Creates an unentered context.
    #[must_use]
    pub fn new(registry: &Registry) -> Self {
        Self {
            registry: registry.clone(),
            connection: None,
            depth: 0,
        }
    }

    /// Enters the context, returning the bound connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection context cannot be entered or the
    /// transaction cannot begin. Nothing stays open in that case.
    pub fn enter(&mut self) -> DbResult<Rc<Connection>> {
        if let Some(connection) = &self.connection {
            self.depth += 1;
            return Ok(Rc::clone(connection));
        }

        let connection = Connection::get_instance(&self.registry)?;
        connection.enter_context()?;
        if let Err(err) = connection.begin() {
            connection.exit_context(true);
            return Err(err);
        }
        self.connection = Some(Rc::clone(&connection));
        self.depth = 1;
        Ok(connection)
    }

    /// Exits the context.
    ///
    /// Only the final exit finishes the transaction. Failures while
    /// committing are logged and followed by a rollback; they are not
    /// returned.
    pub fn exit(&mut self, failed: bool) {
        if self.depth == 0 {
            warn!("transaction context exited without being entered");
            return;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return;
        }
        let Some(connection) = self.connection.take() else {
            return;
        };

        if failed {
            if let Err(err) = connection.rollback() {
                error!(error = %err, "failed to roll back transaction context");
            }
        } else if let Err(err) = connection.commit() {
            error!(error = %err, "failed to commit transaction context");
            if let Err(err) = connection.rollback() {
                error!(error = %err, "failed to roll back transaction context");
            }
        }
        connection.exit_context(failed);
    }

    /// Returns the number of open entries.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the connection while the context is entered.
    #[must_use]
    pub fn connection(&self) -> Option<&Rc<Connection>> {
        self.connection.as_ref()
    }

    /// Enters the context, returning a guard that exits it.
    ///
    /// # Errors
    ///
    /// Returns the error of [`TransactionContext::enter`].
    pub fn scope(&mut self) -> DbResult<TransactionScope<'_>> {
        let connection = self.enter()?;
        Ok(TransactionScope {
            context: self,
            connection,
            finished: false,
        })
    }

    /// Runs `f` in a fresh transaction context.
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the error of entering the context or of `f`.
    pub fn run<T, E>(registry: &Registry, f: impl FnOnce(&Rc<Connection>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<crate::DbError>,
    {
        let mut context = Self::new(registry);
        let scope = context.scope()?;
        let result = f(&scope.connection);
        if result.is_ok() {
            scope.finish();
        }
        result
    }

    /// Wraps `f` so that every call runs in its own transaction context.
    pub fn wrap_callable<A, T, F>(registry: &Registry, f: F) -> impl Fn(A) -> DbResult<T>
    where
        F: Fn(&Rc<Connection>, A) -> DbResult<T>,
    {
        let registry = registry.clone();
        move |args| Self::run(&registry, |connection| f(connection, args))
    }
}

/// Guard of one [`TransactionContext`] entry.
#[must_use = "dropping the guard rolls the transaction back"]
#[derive(Debug)]
pub struct TransactionScope<'a> {
    context: &'a mut TransactionContext,
    connection: Rc<Connection>,
    finished: bool,
}

impl TransactionScope<'_> {
    /// Exits the entry successfully.
    pub fn finish(mut self) {
        self.finished = true;
        self.context.exit(false);
    }

    /// Returns the bound connection.
    #[must_use]
    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }
}

impl Deref for TransactionScope<'_> {
    type Target = TransactionContext;

    fn deref(&self) -> &TransactionContext {
        self.context
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut TransactionContext {
        self.context
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.context.exit(true);
        }
    }
}
