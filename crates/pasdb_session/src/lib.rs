//! # pasdb Session
//!
//! The session capability boundary for pasdb.
//!
//! Everything above this crate talks to storage through the [`Session`] and
//! [`Engine`] traits: rows are [`Row`] handles with an ORM-style life-cycle,
//! queries are [`Query`] values carrying a [`Filter`] tree.
//!
//! ## Available Engines
//!
//! - [`MemoryEngine`] - in-memory tables, optionally persisted as JSON
//!
//! ## Example
//!
//! ```rust
//! use pasdb_session::{create_engine, Filter, Query, Row};
//!
//! let engine = create_engine("memory:").unwrap();
//! let mut session = engine.connect().unwrap();
//!
//! let row = Row::new("pas_key_store", "id", &["id", "key"]);
//! row.set("key", "session");
//! session.add(&row).unwrap();
//!
//! let found = session
//!     .query(&Query::new("pas_key_store").filter(Filter::eq("key", "session")))
//!     .unwrap();
//! assert!(found[0].ptr_eq(&row));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod memory;
mod query;
mod row;
mod session;
mod value;

pub use engine::{backend_name, create_engine};
pub use error::{SessionError, SessionResult};
pub use memory::{MemoryEngine, MemorySession, StatsSnapshot};
pub use query::{like_matches, Comparison, Filter, Order, Query};
pub use row::{identity_key, Row, RowState};
pub use session::{Engine, PendingCounts, Session};
pub use value::Value;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
