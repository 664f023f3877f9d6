//! Ordered sort definitions on entity attributes.

use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use pasdb_session::{Order, Query};

/// Direction of one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

impl SortDirection {
    /// Resolves a numeric direction code (`1` = ascending, `2` = descending).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] for any other code.
    pub fn from_code(code: u8) -> DbResult<Self> {
        match code {
            1 => Ok(Self::Ascending),
            2 => Ok(Self::Descending),
            _ => Err(DbError::value("Sort definition given is not supported")),
        }
    }

    fn order(self) -> Order {
        match self {
            Self::Ascending => Order::Ascending,
            Self::Descending => Order::Descending,
        }
    }
}

/// An ordered list of `(attribute, direction)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortDefinition {
    keys: Vec<(String, SortDirection)>,
}

impl SortDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a definition from `(attribute, direction code)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if a direction code is invalid.
    pub fn from_tuples<'a>(tuples: impl IntoIterator<Item = (&'a str, u8)>) -> DbResult<Self> {
        let mut definition = Self::new();
        for (attribute, code) in tuples {
            definition.append(attribute, SortDirection::from_code(code)?);
        }
        Ok(definition)
    }

    /// Adds a key with the lowest priority.
    pub fn append(&mut self, attribute: &str, direction: SortDirection) -> &mut Self {
        self.keys.push((attribute.to_string(), direction));
        self
    }

    /// Adds a key with the highest priority.
    pub fn prepend(&mut self, attribute: &str, direction: SortDirection) -> &mut Self {
        self.keys.insert(0, (attribute.to_string(), direction));
        self
    }

    /// Removes every key.
    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Returns true if no key is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the keys in priority order.
    #[must_use]
    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.keys
    }

    /// Appends the order clauses to `query`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if an attribute is not defined for the
    /// entity.
    pub fn apply(&self, descriptor: &EntityDescriptor, query: Query) -> DbResult<Query> {
        self.keys.iter().try_fold(query, |query, (attribute, direction)| {
            let column = descriptor.get_db_column(attribute)?;
            Ok(query.order_by(column, direction.order()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: EntityDescriptor = EntityDescriptor {
        class_name: "Item",
        table: "item",
        primary_key: "id",
        columns: &["id", "name", "price"],
        schema_version: None,
        instance_class: None,
    };

    #[test]
    fn direction_codes() {
        assert_eq!(SortDirection::from_code(1).unwrap(), SortDirection::Ascending);
        assert_eq!(SortDirection::from_code(2).unwrap(), SortDirection::Descending);
        assert!(SortDirection::from_code(0).is_err());
        assert!(SortDefinition::from_tuples([("name", 9)]).is_err());
    }

    #[test]
    fn prepend_takes_priority() {
        let mut definition = SortDefinition::from_tuples([("name", 1)]).unwrap();
        definition.prepend("price", SortDirection::Descending);
        let query = definition.apply(&ITEM, ITEM.query("pas")).unwrap();
        assert_eq!(
            query.order(),
            &[
                ("price".to_string(), Order::Descending),
                ("name".to_string(), Order::Ascending),
            ]
        );
    }

    #[test]
    fn unknown_attribute_fails() {
        let mut definition = SortDefinition::new();
        definition.append("colour", SortDirection::Ascending);
        assert!(matches!(
            definition.apply(&ITEM, ITEM.query("pas")),
            Err(DbError::Value { .. })
        ));
        definition.clear();
        assert!(definition.is_empty());
    }
}
