//! # Hibernia Storage
//!
//! Statement execution backends for Hibernia.
//!
//! This crate is the boundary between the unit-of-work engine and the
//! database. The engine hands a backend fully-bound [`Statement`]
//! descriptors and receives affected-row counts back; it never sees SQL
//! dialects or driver details.
//!
//! ## Design Principles
//!
//! - Backends hand out [`Connection`]s; one session owns one connection
//! - Statements are structured data with a rendered SQL text used as the
//!   batching key
//! - Constraint violations and connectivity failures are reported, never
//!   retried
//! - Backends must be `Send + Sync` so a session factory can share them
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Tables in memory with primary and foreign key
//!   enforcement and per-connection transactions
//!
//! ## Example
//!
//! ```rust
//! use hibernia_codec::{Identifier, Value};
//! use hibernia_storage::{ColumnValue, InMemoryBackend, Statement, StorageBackend};
//!
//! let backend = InMemoryBackend::new();
//! let mut conn = backend.connect().unwrap();
//! conn.execute(&Statement::Insert {
//!     table: "Person".into(),
//!     id: Identifier::from(1),
//!     version: None,
//!     columns: vec![("name".into(), ColumnValue::Basic(Value::from("Ada")))],
//! })
//! .unwrap();
//! conn.commit().unwrap();
//! assert_eq!(backend.row_count("Person"), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod statement;

pub use backend::{Connection, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::{BackendStats, InMemoryBackend, InMemoryConnection};
pub use statement::{ColumnValue, Row, Statement, StatementKind};
