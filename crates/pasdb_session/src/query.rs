//! Native filter expressions and queries.

use crate::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sort order of a query column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Comparison operator of a [`Filter::Compare`] clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// A filter expression over column values.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Compares a column with a value.
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: Comparison,
        /// Right-hand side.
        value: Value,
    },
    /// SQL `LIKE` with `\` as escape character.
    Like {
        /// Column name.
        column: String,
        /// Pattern using `%` and `_` wildcards.
        pattern: String,
        /// Whether letter case must match.
        case_sensitive: bool,
        /// `NOT LIKE` if set.
        negated: bool,
    },
    /// `IN (...)` membership.
    InList {
        /// Column name.
        column: String,
        /// Candidate values.
        values: Vec<Value>,
        /// `NOT IN` if set.
        negated: bool,
    },
    /// `IS NULL` test.
    IsNull {
        /// Column name.
        column: String,
        /// `IS NOT NULL` if set.
        negated: bool,
    },
    /// All clauses must match.
    And(Vec<Filter>),
    /// At least one clause must match.
    Or(Vec<Filter>),
}

impl Filter {
    /// Shorthand for an equality comparison.
    #[must_use]
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Eq, value)
    }

    /// Builds a comparison clause.
    #[must_use]
    pub fn compare(column: &str, op: Comparison, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    /// Combines two filters with `AND`, flattening nested conjunctions.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), right) => {
                left.push(right);
                Self::And(left)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Evaluates the filter against a set of column values.
    ///
    /// Comparisons involving `NULL` or unknown columns do not match, as in SQL.
    #[must_use]
    pub fn matches(&self, fields: &BTreeMap<String, Value>) -> bool {
        match self {
            Self::Compare { column, op, value } => {
                let Some(ordering) = fields.get(column).and_then(|v| v.compare(value)) else {
                    return false;
                };
                match op {
                    Comparison::Eq => ordering == Ordering::Equal,
                    Comparison::Ne => ordering != Ordering::Equal,
                    Comparison::Lt => ordering == Ordering::Less,
                    Comparison::Le => ordering != Ordering::Greater,
                    Comparison::Gt => ordering == Ordering::Greater,
                    Comparison::Ge => ordering != Ordering::Less,
                }
            }
            Self::Like {
                column,
                pattern,
                case_sensitive,
                negated,
            } => match fields.get(column) {
                Some(Value::Text(text)) => like_matches(text, pattern, *case_sensitive) != *negated,
                _ => false,
            },
            Self::InList {
                column,
                values,
                negated,
            } => match fields.get(column) {
                Some(Value::Null) | None => false,
                Some(current) => values.iter().any(|v| current.sql_eq(v)) != *negated,
            },
            Self::IsNull { column, negated } => {
                fields.get(column).map_or(true, Value::is_null) != *negated
            }
            Self::And(filters) => filters.iter().all(|f| f.matches(fields)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(fields)),
        }
    }
}

/// A query against one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    entity: String,
    filter: Option<Filter>,
    order: Vec<(String, Order)>,
    limit: Option<usize>,
}

impl Query {
    /// Creates a query returning every row of the entity.
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: None,
            order: Vec::new(),
            limit: None,
        }
    }

    /// Adds a filter; multiple calls are combined with `AND`.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Appends an order clause.
    #[must_use]
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order.push((column.to_string(), order));
        self
    }

    /// Limits the number of returned rows.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Returns the combined filter.
    #[must_use]
    pub fn filter_expr(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// Returns the order clauses.
    #[must_use]
    pub fn order(&self) -> &[(String, Order)] {
        &self.order
    }

    /// Returns the row limit.
    #[must_use]
    pub const fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Returns true if the filter matches the given values.
    #[must_use]
    pub fn matches(&self, fields: &BTreeMap<String, Value>) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(fields))
    }

    /// Sorts matching rows by the order clauses. `NULL` sorts first.
    pub fn sort<T>(&self, rows: &mut [T], fields: impl Fn(&T) -> &BTreeMap<String, Value>) {
        if self.order.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            let (a, b) = (fields(a), fields(b));
            for (column, order) in &self.order {
                let left = a.get(column).unwrap_or(&Value::Null);
                let right = b.get(column).unwrap_or(&Value::Null);
                let ordering = match (left.is_null(), right.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    _ => left.compare(right).unwrap_or(Ordering::Equal),
                };
                let ordering = match order {
                    Order::Ascending => ordering,
                    Order::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LikeToken {
    Any,
    One,
    Literal(char),
}

fn tokenize_like(pattern: &str, case_sensitive: bool) -> Vec<LikeToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        let token = match c {
            '\\' => match chars.next() {
                Some(escaped) => LikeToken::Literal(escaped),
                None => LikeToken::Literal('\\'),
            },
            '%' => LikeToken::Any,
            '_' => LikeToken::One,
            other => LikeToken::Literal(other),
        };
        tokens.push(match token {
            LikeToken::Literal(c) if !case_sensitive => {
                LikeToken::Literal(c.to_lowercase().next().unwrap_or(c))
            }
            token => token,
        });
    }
    tokens
}

/// Matches `text` against a SQL `LIKE` pattern with `\` as escape character.
#[must_use]
pub fn like_matches(text: &str, pattern: &str, case_sensitive: bool) -> bool {
    let tokens = tokenize_like(pattern, case_sensitive);
    let text: Vec<char> = if case_sensitive {
        text.chars().collect()
    } else {
        text.chars()
            .map(|c| c.to_lowercase().next().unwrap_or(c))
            .collect()
    };

    // reachable[j]: tokens[..i] can match text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in &tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            LikeToken::Any => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= reachable[j];
                    next[j] = seen;
                }
            }
            LikeToken::One => {
                for j in 1..=text.len() {
                    next[j] = reachable[j - 1];
                }
            }
            LikeToken::Literal(c) => {
                for j in 1..=text.len() {
                    next[j] = reachable[j - 1] && text[j - 1] == *c;
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn like_wildcards() {
        assert!(like_matches("hello", "h%o", true));
        assert!(like_matches("hello", "h_llo", true));
        assert!(!like_matches("hello", "h_lo", true));
        assert!(like_matches("", "%", true));
    }

    #[test]
    fn like_escape_makes_wildcards_literal() {
        assert!(like_matches("100%", "100\\%", true));
        assert!(!like_matches("1000", "100\\%", true));
        assert!(like_matches("a_b", "a\\_b", true));
        assert!(!like_matches("axb", "a\\_b", true));
    }

    #[test]
    fn like_case_insensitive() {
        assert!(like_matches("Hello", "hello", false));
        assert!(!like_matches("Hello", "hello", true));
    }

    #[test]
    fn compare_and_in_list() {
        let row = fields(&[("version", Value::Integer(3)), ("name", Value::Null)]);
        assert!(Filter::compare("version", Comparison::Gt, 2_i64).matches(&row));
        assert!(!Filter::compare("version", Comparison::Lt, 3_i64).matches(&row));
        assert!(!Filter::eq("name", Value::Null).matches(&row));

        let in_list = Filter::InList {
            column: "version".into(),
            values: vec![Value::Integer(1), Value::Integer(3)],
            negated: false,
        };
        assert!(in_list.matches(&row));
        let not_in = Filter::InList {
            column: "version".into(),
            values: vec![Value::Integer(1)],
            negated: true,
        };
        assert!(not_in.matches(&row));
    }

    #[test]
    fn query_filters_combine_with_and() {
        let query = Query::new("t")
            .filter(Filter::eq("a", 1_i64))
            .filter(Filter::eq("b", 2_i64));
        assert!(matches!(query.filter_expr(), Some(Filter::And(v)) if v.len() == 2));
        assert!(query.matches(&fields(&[("a", 1_i64.into()), ("b", 2_i64.into())])));
        assert!(!query.matches(&fields(&[("a", 1_i64.into()), ("b", 3_i64.into())])));
    }

    #[test]
    fn sort_orders_by_columns() {
        let query = Query::new("t")
            .order_by("a", Order::Descending)
            .order_by("b", Order::Ascending);
        let mut rows = vec![
            fields(&[("a", 1_i64.into()), ("b", 2_i64.into())]),
            fields(&[("a", 2_i64.into()), ("b", 9_i64.into())]),
            fields(&[("a", 1_i64.into()), ("b", 1_i64.into())]),
        ];
        query.sort(&mut rows, |r| r);
        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r["a"].as_i64().unwrap(), r["b"].as_i64().unwrap()))
            .collect();
        assert_eq!(keys, vec![(2, 9), (1, 1), (1, 2)]);
    }
}
