//! Static descriptions of mapped entity classes.

use crate::error::{DbError, DbResult};
use pasdb_session::{Query, Row};

/// Describes one mapped entity class.
///
/// Descriptors are `'static` data, usually declared as constants next to the
/// instance type that encapsulates the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
    /// Class name; also the schema script directory name.
    pub class_name: &'static str,
    /// Table name without prefix.
    pub table: &'static str,
    /// Primary key column.
    pub primary_key: &'static str,
    /// All mapped columns, including the primary key.
    pub columns: &'static [&'static str],
    /// Schema version expected by the code, if the class is versioned.
    pub schema_version: Option<u64>,
    /// Name of the instance class encapsulating rows of this entity.
    pub instance_class: Option<&'static str>,
}

impl EntityDescriptor {
    /// Returns the prefixed table name used in sessions.
    #[must_use]
    pub fn table_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.table)
    }

    /// Returns true if the class maps the given attribute.
    #[must_use]
    pub fn has_column(&self, attribute: &str) -> bool {
        self.columns.contains(&attribute)
    }

    /// Resolves an attribute name to its column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if the attribute is not defined.
    pub fn get_db_column(&self, attribute: &str) -> DbResult<&'static str> {
        self.columns
            .iter()
            .copied()
            .find(|column| *column == attribute)
            .ok_or_else(|| {
                DbError::value(format!(
                    "Database entity attribute '{attribute}' is not defined for {}",
                    self.class_name
                ))
            })
    }

    /// Creates a transient row with every column set to `NULL`.
    #[must_use]
    pub fn new_row(&self, prefix: &str) -> Row {
        Row::new(&self.table_name(prefix), self.primary_key, self.columns)
    }

    /// Returns a query over all rows of this entity.
    #[must_use]
    pub fn query(&self, prefix: &str) -> Query {
        Query::new(self.table_name(prefix))
    }

    /// Returns true if `row` belongs to this entity.
    #[must_use]
    pub fn owns(&self, row: &Row, prefix: &str) -> bool {
        row.entity() == self.table_name(prefix)
    }
}
