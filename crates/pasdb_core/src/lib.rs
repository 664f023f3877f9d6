//! # pasdb Core
//!
//! Connection and transaction coordination on top of a unit-of-work session.
//!
//! This crate provides:
//! - [`Registry`]: settings, engine, serialization lock and class maps
//! - [`Connection`]: the per-thread session proxy with reentrant contexts
//!   and nested transactions
//! - [`TransactionContext`]: scoped, reentrant transactions
//! - [`Instance`]: domain objects encapsulating one mapped row
//! - [`ConditionDefinition`] and [`SortDefinition`]: declarative filters
//! - [`Schema`]: versioned schema upgrades
//! - [`KeyStore`]: a key-value store built on the above
//!
//! ## Example
//!
//! ```rust
//! use pasdb_core::{Instance, KeyStore, Registry, Settings};
//!
//! let registry = Registry::open(Settings::new().url("memory:")).unwrap();
//!
//! let mut entry = KeyStore::new(&registry).unwrap();
//! entry.set_key("greeting").unwrap();
//! entry.save().unwrap();
//!
//! let mut loaded = KeyStore::load_key(&registry, "greeting").unwrap();
//! assert_eq!(loaded.key().unwrap().as_deref(), Some("greeting"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod condition;
mod connection;
mod descriptor;
mod error;
mod instance;
mod key_store;
mod lock;
mod registry;
mod schema;
mod settings;
mod sort;
mod transaction_context;

pub use condition::{Concatenation, ConditionDefinition};
pub use connection::{Connection, ConnectionContext};
pub use descriptor::EntityDescriptor;
pub use error::{DbError, DbResult};
pub use instance::{
    Instance, InstanceBase, InstanceConstructor, InstanceContext, InstanceFactory,
    InstanceIterator,
};
pub use key_store::{KeyStore, KEY_STORE};
pub use lock::{LockStats, SerializationLock};
pub use registry::Registry;
pub use schema::{
    parse_dependencies, split_statements, Schema, SchemaDependency, SchemaOutcome,
    SchemaUpgrade, DB_PREFIX_PLACEHOLDER, SCHEMA_VERSION,
};
pub use settings::{ResolvedSettings, Settings, PATH_BASE_PLACEHOLDER, SETTINGS_FILE};
pub use sort::{SortDefinition, SortDirection};
pub use transaction_context::{TransactionContext, TransactionScope};

pub use pasdb_session as session;

/// Current unix time in seconds.
pub(crate) fn unix_time() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
