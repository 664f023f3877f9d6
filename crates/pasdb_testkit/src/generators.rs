//! Property-based test generators using proptest.
//!
//! Provides strategies for nesting depths, transaction operation sequences,
//! schema upgrade plans and script contents.

use proptest::prelude::*;
use std::collections::BTreeSet;

/// Strategy for generating transaction nesting depths.
pub fn depth_strategy() -> impl Strategy<Value = usize> {
    1usize..8
}

/// Strategy for generating valid instance class names.
pub fn class_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z0-9]{0,15}").expect("Invalid regex")
}

/// Strategy for generating single statements without separators.
pub fn statement_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("INSERT INTO __db_prefix__[a-z]{1,8} VALUES \\([0-9]{1,4}\\)")
        .expect("Invalid regex")
}

/// Transaction call made on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOp {
    /// `begin()`
    Begin,
    /// `commit()`
    Commit,
    /// `rollback()`
    Rollback,
}

/// Strategy for generating transaction calls.
pub fn transaction_op_strategy() -> impl Strategy<Value = TransactionOp> {
    prop_oneof![
        3 => Just(TransactionOp::Begin),
        2 => Just(TransactionOp::Commit),
        1 => Just(TransactionOp::Rollback),
    ]
}

/// Strategy for generating a sequence of transaction calls.
pub fn transaction_ops_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<TransactionOp>> {
    prop::collection::vec(transaction_op_strategy(), min_ops..max_ops)
}

/// Returns the transaction depth a connection must report after `ops`.
///
/// Commits and rollbacks at depth 0 do nothing. Without native nesting a
/// rollback unwinds every level.
#[must_use]
pub fn expected_depth(ops: &[TransactionOp], use_native_nested: bool) -> usize {
    ops.iter().fold(0, |depth, op| match op {
        TransactionOp::Begin => depth + 1,
        TransactionOp::Commit => depth.saturating_sub(1),
        TransactionOp::Rollback if use_native_nested => depth.saturating_sub(1),
        TransactionOp::Rollback => 0,
    })
}

/// Recorded version, declared version and script files of one schema.
#[derive(Debug, Clone)]
pub struct SchemaPlan {
    /// Version recorded before the upgrade, at least 1.
    pub current: u64,
    /// Version declared by the entity.
    pub target: u64,
    /// Versions with a `schema_<n>.sql` file.
    pub scripts: BTreeSet<u64>,
}

impl SchemaPlan {
    /// Returns the script versions an upgrade must apply, in order.
    #[must_use]
    pub fn pending(&self) -> Vec<u64> {
        if self.current >= self.target {
            return Vec::new();
        }
        self.scripts
            .range(self.current + 1..=self.target)
            .copied()
            .collect()
    }
}

/// Strategy for generating schema upgrade plans.
pub fn schema_plan_strategy() -> impl Strategy<Value = SchemaPlan> {
    (1u64..6, 0u64..8, prop::collection::btree_set(2u64..16, 0..8)).prop_map(
        |(current, ahead, scripts)| SchemaPlan {
            current,
            target: current + ahead,
            scripts,
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
