//! Declarative, backend independent filter conditions.

use crate::descriptor::EntityDescriptor;
use crate::error::{DbError, DbResult};
use pasdb_session::{Comparison, Filter, Query, Value};

/// How the conditions of one definition are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concatenation {
    /// Every condition must match.
    And,
    /// At least one condition must match.
    #[default]
    Or,
}

impl Concatenation {
    /// Resolves a numeric concatenation code (`1` = AND, `2` = OR).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] for any other code.
    pub fn from_code(code: u8) -> DbResult<Self> {
        match code {
            1 => Ok(Self::And),
            2 => Ok(Self::Or),
            _ => Err(DbError::value("Given condition concatenation is invalid")),
        }
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::And => 1,
            Self::Or => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Compare {
        attribute: String,
        op: Comparison,
        value: Value,
    },
    Like {
        attribute: String,
        pattern: String,
        case_sensitive: bool,
        negated: bool,
    },
    InList {
        attribute: String,
        values: Vec<Value>,
        negated: bool,
    },
    Sub(ConditionDefinition),
}

/// A tree of conditions on entity attributes.
///
/// Attributes are resolved to columns when the definition is compiled, so
/// one definition can be built before the entity is known.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionDefinition {
    concatenation: Concatenation,
    conditions: Vec<Condition>,
}

impl ConditionDefinition {
    /// Creates an empty definition with the given concatenation.
    #[must_use]
    pub fn new(concatenation: Concatenation) -> Self {
        Self {
            concatenation,
            conditions: Vec::new(),
        }
    }

    /// Returns the concatenation.
    #[must_use]
    pub fn concatenation(&self) -> Concatenation {
        self.concatenation
    }

    /// Changes the concatenation.
    pub fn set_concatenation(&mut self, concatenation: Concatenation) {
        self.concatenation = concatenation;
    }

    /// Returns the number of conditions, counting a sub-condition once.
    #[must_use]
    pub fn conditions_count(&self) -> usize {
        self.conditions.len()
    }

    /// Removes every condition.
    pub fn clear(&mut self) {
        self.conditions.clear();
    }

    fn push_compare(&mut self, attribute: &str, op: Comparison, value: Value) -> &mut Self {
        self.conditions.push(Condition::Compare {
            attribute: attribute.to_string(),
            op,
            value,
        });
        self
    }

    fn push_like(
        &mut self,
        attribute: &str,
        pattern: &str,
        case_sensitive: bool,
        negated: bool,
    ) -> &mut Self {
        self.conditions.push(Condition::Like {
            attribute: attribute.to_string(),
            pattern: pattern.to_string(),
            case_sensitive,
            negated,
        });
        self
    }

    fn push_in_list(&mut self, attribute: &str, values: Vec<Value>, negated: bool) -> &mut Self {
        if !values.is_empty() {
            self.conditions.push(Condition::InList {
                attribute: attribute.to_string(),
                values,
                negated,
            });
        }
        self
    }

    /// Matches rows whose attribute equals `value`. `NULL` tests `IS NULL`.
    pub fn add_exact_match_condition(&mut self, attribute: &str, value: impl Into<Value>) -> &mut Self {
        self.push_compare(attribute, Comparison::Eq, value.into())
    }

    /// Matches rows whose attribute differs from `value`.
    pub fn add_exact_no_match_condition(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_compare(attribute, Comparison::Ne, value.into())
    }

    /// Case sensitive `LIKE` with `\` as escape character.
    pub fn add_case_sensitive_match_condition(&mut self, attribute: &str, pattern: &str) -> &mut Self {
        self.push_like(attribute, pattern, true, false)
    }

    /// Case sensitive `NOT LIKE`.
    pub fn add_case_sensitive_no_match_condition(
        &mut self,
        attribute: &str,
        pattern: &str,
    ) -> &mut Self {
        self.push_like(attribute, pattern, true, true)
    }

    /// Case insensitive `LIKE`.
    pub fn add_case_insensitive_match_condition(
        &mut self,
        attribute: &str,
        pattern: &str,
    ) -> &mut Self {
        self.push_like(attribute, pattern, false, false)
    }

    /// Case insensitive `NOT LIKE`.
    pub fn add_case_insensitive_no_match_condition(
        &mut self,
        attribute: &str,
        pattern: &str,
    ) -> &mut Self {
        self.push_like(attribute, pattern, false, true)
    }

    /// Matches rows whose attribute is greater than `value`.
    pub fn add_greater_than_match_condition(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_compare(attribute, Comparison::Gt, value.into())
    }

    /// Matches rows whose attribute is greater than or equal to `value`.
    pub fn add_greater_than_or_equal_match_condition(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_compare(attribute, Comparison::Ge, value.into())
    }

    /// Matches rows whose attribute is less than `value`.
    pub fn add_less_than_match_condition(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_compare(attribute, Comparison::Lt, value.into())
    }

    /// Matches rows whose attribute is less than or equal to `value`.
    pub fn add_less_than_or_equal_match_condition(
        &mut self,
        attribute: &str,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push_compare(attribute, Comparison::Le, value.into())
    }

    /// Matches rows whose attribute is one of `values`. Ignored if empty.
    pub fn add_in_list_match_condition<V: Into<Value>>(
        &mut self,
        attribute: &str,
        values: impl IntoIterator<Item = V>,
    ) -> &mut Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push_in_list(attribute, values, false)
    }

    /// Matches rows whose attribute is none of `values`. Ignored if empty.
    pub fn add_not_in_list_match_condition<V: Into<Value>>(
        &mut self,
        attribute: &str,
        values: impl IntoIterator<Item = V>,
    ) -> &mut Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push_in_list(attribute, values, true)
    }

    /// Nests another definition. Ignored if it has no conditions.
    pub fn add_sub_condition(&mut self, definition: ConditionDefinition) -> &mut Self {
        if definition.conditions_count() > 0 {
            self.conditions.push(Condition::Sub(definition));
        }
        self
    }

    /// Compiles the definition into a native filter.
    ///
    /// Returns `None` if there is nothing to filter on.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Value`] if an attribute is not defined for the
    /// entity.
    pub fn compile(&self, descriptor: &EntityDescriptor) -> DbResult<Option<Filter>> {
        let mut clauses = Vec::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            if let Some(clause) = compile_condition(condition, descriptor)? {
                clauses.push(clause);
            }
        }

        Ok(match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(match self.concatenation {
                Concatenation::And => Filter::And(clauses),
                Concatenation::Or => Filter::Or(clauses),
            }),
        })
    }

    /// Adds the compiled conditions to `query`.
    ///
    /// # Errors
    ///
    /// Returns the error of [`ConditionDefinition::compile`].
    pub fn apply(&self, descriptor: &EntityDescriptor, query: Query) -> DbResult<Query> {
        Ok(match self.compile(descriptor)? {
            Some(filter) => query.filter(filter),
            None => query,
        })
    }
}

fn compile_condition(
    condition: &Condition,
    descriptor: &EntityDescriptor,
) -> DbResult<Option<Filter>> {
    let filter = match condition {
        Condition::Sub(definition) => return definition.compile(descriptor),
        Condition::Compare {
            attribute,
            op,
            value,
        } => {
            let column = descriptor.get_db_column(attribute)?.to_string();
            match (op, value) {
                (Comparison::Eq, Value::Null) => Filter::IsNull {
                    column,
                    negated: false,
                },
                (Comparison::Ne, Value::Null) => Filter::IsNull {
                    column,
                    negated: true,
                },
                _ => Filter::Compare {
                    column,
                    op: *op,
                    value: value.clone(),
                },
            }
        }
        Condition::Like {
            attribute,
            pattern,
            case_sensitive,
            negated,
        } => Filter::Like {
            column: descriptor.get_db_column(attribute)?.to_string(),
            pattern: pattern.clone(),
            case_sensitive: *case_sensitive,
            negated: *negated,
        },
        Condition::InList {
            attribute,
            values,
            negated,
        } => Filter::InList {
            column: descriptor.get_db_column(attribute)?.to_string(),
            values: values.clone(),
            negated: *negated,
        },
    };
    Ok(Some(filter))
}
