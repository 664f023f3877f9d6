//! CLI command implementations.

pub mod schema;
