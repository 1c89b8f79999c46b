//! # Hibernia Core
//!
//! Unit-of-work engine for Hibernia.
//!
//! This crate provides:
//! - A metamodel describing entities, associations and cascades
//! - Sessions holding a persistence context (identity map, entity entries,
//!   collection entries, proxies)
//! - Dirty checking against load-time snapshots
//! - An action queue that orders inserts and deletes by foreign keys and
//!   batches statements at flush
//! - Lazy proxies and collections, including detached access
//! - Second-level cache coordination through `hibernia_cache`
//!
//! Entities are stored in a session arena and addressed by [`InstanceId`];
//! associations are [`Reference`]s to instances or proxies in that arena.
//!
//! ```no_run
//! use hibernia_core::{CascadeStyle, EntityDescriptor, Metamodel, SessionFactory};
//! use hibernia_storage::InMemoryBackend;
//!
//! # fn main() -> hibernia_core::CoreResult<()> {
//! let metamodel = Metamodel::builder()
//!     .entity(EntityDescriptor::builder("Author").basic("name").build())
//!     .entity(
//!         EntityDescriptor::builder("Book")
//!             .basic("title")
//!             .many_to_one("author", "Author", false, CascadeStyle::ALL)
//!             .build(),
//!     )
//!     .build()?;
//! let factory = SessionFactory::builder(metamodel, InMemoryBackend::new()).build()?;
//!
//! let mut session = factory.open_session()?;
//! let author = session.new_instance("Author")?;
//! session.set(author, "name", "Le Guin")?;
//! let book = session.new_instance("Book")?;
//! session.set(book, "title", "The Dispossessed")?;
//! session.set(book, "author", author)?;
//! session.persist(book)?;
//! session.commit()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod cascade;
mod config;
mod context;
mod error;
mod instance;
mod metadata;
mod proxy;
mod session;
mod sort;
mod stats;
mod types;

pub use action::{
    Action, ActionKind, ActionQueue, AfterCompletionQueue, CollectionRecreateAction,
    CollectionRemoveAction, CollectionUpdateAction, Completion, EntityDeleteAction,
    EntityInsertAction, EntityUpdateAction, QueuedActions,
};
pub use cascade::CascadeWalk;
pub use config::Config;
pub use context::{
    find_dirty, requires_update, CollectionEntry, EntityEntry, PersistenceContext,
    ReferenceIdentity,
};
pub use error::{CoreError, CoreResult};
pub use instance::{Element, EntityInstance, PersistentCollection, PropertyValue, Reference};
pub use metadata::{
    CascadeOp, CascadeStyle, EntityDescriptor, EntityDescriptorBuilder, Metamodel,
    MetamodelBuilder, Property, PropertyKind,
};
pub use proxy::{EntitySnapshot, LazyInitializer, ProxyState, ProxyTarget, SerializedProxy};
pub use session::{
    ExecutedAction, FlushSummary, Session, SessionFactory, SessionFactoryBuilder,
    SessionFactoryRegistry,
};
pub use sort::{Graph, SortError, VertexId};
pub use stats::{Statistics, StatisticsSnapshot};
pub use types::{
    CollectionId, CollectionKey, EntityKey, InstanceId, LockMode, ProxyId, SessionId, Status,
};

pub use hibernia_cache::AccessType;
pub use hibernia_codec::{Identifier, Value};
