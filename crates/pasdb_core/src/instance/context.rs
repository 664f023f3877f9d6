//! Entering and leaving instance contexts.

use super::Instance;
use crate::connection::Connection;
use crate::error::DbResult;
use pasdb_session::RowState;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use tracing::{error, warn};

/// Guard for an open instance context.
///
/// Finish the guard on success; dropping it unfinished exits the context as
/// failed, rolling back a transaction the instance began itself.
///
/// # Example
///
/// ```rust,ignore
/// let mut context = InstanceContext::enter(&mut key_store)?;
/// context.set_data_attribute("key", "token".into())?;
/// context.finish();
/// ```
pub struct InstanceContext<'a, I: Instance + ?Sized> {
    instance: &'a mut I,
    finished: bool,
}

impl<'a, I: Instance + ?Sized> InstanceContext<'a, I> {
    /// Opens a context on `instance`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection context cannot be entered or the
    /// row cannot be loaded.
    pub fn enter(instance: &'a mut I) -> DbResult<Self> {
        instance.enter()?;
        Ok(Self {
            instance,
            finished: false,
        })
    }

    /// Exits the context successfully.
    pub fn finish(mut self) {
        self.finished = true;
        self.instance.exit(false);
    }
}

impl<I: Instance + ?Sized> Deref for InstanceContext<'_, I> {
    type Target = I;

    fn deref(&self) -> &I {
        self.instance
    }
}

impl<I: Instance + ?Sized> DerefMut for InstanceContext<'_, I> {
    fn deref_mut(&mut self) -> &mut I {
        self.instance
    }
}

impl<I: Instance + ?Sized> Drop for InstanceContext<'_, I> {
    fn drop(&mut self) {
        if !self.finished {
            self.instance.exit(true);
        }
    }
}

pub(super) fn enter<I: Instance + ?Sized>(instance: &mut I) -> DbResult<()> {
    let mut entered = None;
    if instance.base().context_depth == 0 {
        let connection = Connection::get_instance(instance.base().registry())?;
        connection.enter_context()?;
        instance.base_mut().connection = Some(Rc::clone(&connection));
        entered = Some(connection);
    }
    instance.base_mut().context_depth += 1;

    if let Err(err) = attach_row(instance) {
        let base = instance.base_mut();
        base.context_depth -= 1;
        if let Some(connection) = entered {
            base.connection = None;
            connection.exit_context(true);
        }
        return Err(err);
    }
    Ok(())
}

fn attach_row<I: Instance + ?Sized>(instance: &mut I) -> DbResult<()> {
    let connection = instance.base().bound_connection()?;
    let Some(row) = instance.base().row().cloned() else {
        if instance.is_reloadable() {
            return instance.reload_row(&connection);
        }
        let row = instance
            .descriptor()
            .new_row(instance.base().registry().table_prefix());
        instance.initialize_row(&row);
        instance.base_mut().row = Some(row);
        return Ok(());
    };

    if connection.contains(&row) {
        return Ok(());
    }
    if row.has_identity() {
        let merged = connection.merge(&row, true)?;
        instance.base_mut().row = Some(merged);
    } else if row.state() == RowState::Detached {
        connection.add(&row)?;
    }
    Ok(())
}

pub(super) fn exit<I: Instance + ?Sized>(instance: &mut I, failed: bool) {
    let class_name = instance.class_name();
    let base = instance.base_mut();
    if base.context_depth == 0 {
        warn!(class = class_name, "instance context exited without being entered");
        return;
    }
    base.context_depth -= 1;
    if base.context_depth > 0 {
        return;
    }
    let Some(connection) = base.connection.take() else {
        return;
    };

    if std::mem::take(&mut base.wrapped_transaction) {
        let result = if failed {
            connection.rollback()
        } else {
            connection.commit()
        };
        if let Err(err) = result {
            error!(class = class_name, error = %err, "failed to finish instance transaction");
            if !failed && connection.transaction_depth() > 0 {
                if let Err(err) = connection.rollback() {
                    error!(class = class_name, error = %err, "failed to roll back instance transaction");
                }
            }
        }
    }
    connection.exit_context(failed);
}

/// Begins a transaction owned by `instance` unless one is already open.
pub(super) fn ensure_transaction<I: Instance + ?Sized>(instance: &mut I) -> DbResult<()> {
    let connection = instance.base().bound_connection()?;
    if connection.transaction_depth() == 0 {
        connection.begin()?;
        instance.base_mut().wrapped_transaction = true;
    }
    Ok(())
}
