//! # pasdb Testkit
//!
//! Test utilities for pasdb.
//!
//! This crate provides:
//! - Registry fixtures over an inspectable in-memory engine
//! - Schema script directory writers
//! - Property-based test generators using proptest
//! - Stress helpers for concurrent connection contexts
//!
//! ## Usage
//!
//! ```rust
//! use pasdb_testkit::prelude::*;
//!
//! with_test_registry(|test| {
//!     let connection = test.connection();
//!     connection.begin().unwrap();
//!     connection.commit().unwrap();
//!     assert_eq!(connection.transaction_depth(), 0);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
