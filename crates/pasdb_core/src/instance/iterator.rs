//! Iteration over query results as instances.

use super::Instance;
use crate::connection::Connection;
use crate::error::DbResult;
use crate::registry::Registry;
use pasdb_session::{Query, Row};
use std::fmt;

/// Yields one instance per result row.
///
/// Rows are buffered when the iterator is created; instances are
/// constructed lazily through the registry's [`super::InstanceFactory`].
pub struct InstanceIterator {
    registry: Registry,
    class_name: String,
    rows: std::vec::IntoIter<Row>,
}

impl InstanceIterator {
    /// Creates an iterator over already loaded rows.
    #[must_use]
    pub fn new(registry: &Registry, class_name: &str, rows: Vec<Row>) -> Self {
        Self {
            registry: registry.clone(),
            class_name: class_name.to_string(),
            rows: rows.into_iter(),
        }
    }

    /// Runs `query` in a connection context and iterates its rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn query(registry: &Registry, class_name: &str, query: &Query) -> DbResult<Self> {
        let connection = Connection::get_instance(registry)?;
        let rows = connection.scope(|connection| connection.query(query))?;
        Ok(Self::new(registry, class_name, rows))
    }
}

impl Iterator for InstanceIterator {
    type Item = DbResult<Box<dyn Instance>>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        Some(
            self.registry
                .instances()
                .construct(&self.registry, &self.class_name, Some(row)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for InstanceIterator {}

impl fmt::Debug for InstanceIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceIterator")
            .field("class_name", &self.class_name)
            .field("remaining", &self.rows.len())
            .finish()
    }
}
