//! # Hibernia Testkit
//!
//! Test utilities for Hibernia.
//!
//! This crate provides:
//! - Fixture metamodels (the six-entity scenario graph, a lazy cached
//!   catalog, a level chain) and factory helpers
//! - Seeding helpers that write committed rows directly
//! - A backend wrapper that runs a hook between a load and the cache put
//! - Property-based test generators using proptest
//!
//! Cross-crate integration tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hibernia_testkit::prelude::*;
//!
//! #[test]
//! fn scenario_persists() {
//!     let factory = factory(scenario_metamodel(), InMemoryBackend::new());
//!     let mut session = factory.open_session().unwrap();
//!     let graph = ScenarioGraph::build(&mut session, 1).unwrap();
//!     session.persist(graph.b).unwrap();
//!     session.commit().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use hibernia_storage::InMemoryBackend;
}

pub use fixtures::*;
pub use generators::*;
