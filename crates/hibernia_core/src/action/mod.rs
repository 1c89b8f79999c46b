//! Pending writes and their execution order.
//!
//! Every state change a session makes is recorded as an [`Action`] and
//! held in the [`ActionQueue`] until flush. Actions capture the state to
//! write in terms of the session arena; binding references to foreign key
//! values happens when the action executes, after the referenced rows have
//! been inserted.

mod completion;
mod queue;

pub use completion::{AfterCompletionQueue, Completion};
pub use queue::{ActionQueue, QueuedActions};

use crate::instance::{Element, PropertyValue, Reference};
use crate::metadata::EntityDescriptor;
use crate::types::{CollectionId, CollectionKey, EntityKey, InstanceId};
use hibernia_codec::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// The kind of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Row insert.
    EntityInsert,
    /// Row update.
    EntityUpdate,
    /// Row delete.
    EntityDelete,
    /// Insert of every row of a collection.
    CollectionRecreate,
    /// Insert and delete of individual collection rows.
    CollectionUpdate,
    /// Delete of every row of a collection.
    CollectionRemove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EntityInsert => "insert",
            Self::EntityUpdate => "update",
            Self::EntityDelete => "delete",
            Self::CollectionRecreate => "collection-recreate",
            Self::CollectionUpdate => "collection-update",
            Self::CollectionRemove => "collection-remove",
        };
        f.write_str(s)
    }
}

/// Inserts a new row.
#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    /// The inserted instance.
    pub instance: InstanceId,
    /// Its key.
    pub key: EntityKey,
    /// Initial version.
    pub version: Option<Value>,
    /// Property values to insert.
    pub state: Vec<PropertyValue>,
    /// Entity mapping.
    pub descriptor: Arc<EntityDescriptor>,
}

impl EntityInsertAction {
    /// Returns the instances among `pending` this insert references through
    /// non-nullable foreign keys, in property order.
    #[must_use]
    pub fn dependencies(&self, pending: &HashSet<InstanceId>) -> Vec<InstanceId> {
        non_nullable_references(&self.descriptor, &self.state)
            .filter(|target| *target != self.instance && pending.contains(target))
            .collect()
    }
}

/// Updates an existing row.
#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    /// The updated instance.
    pub instance: InstanceId,
    /// Its key.
    pub key: EntityKey,
    /// Current property values.
    pub state: Vec<PropertyValue>,
    /// Property values as of load or last flush.
    pub previous_state: Vec<PropertyValue>,
    /// Indices of the changed properties.
    pub dirty: Vec<usize>,
    /// Version the row must have.
    pub previous_version: Option<Value>,
    /// Version to write.
    pub next_version: Option<Value>,
    /// Entity mapping.
    pub descriptor: Arc<EntityDescriptor>,
}

/// Deletes a row.
#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    /// The deleted instance.
    pub instance: InstanceId,
    /// Its key.
    pub key: EntityKey,
    /// Version the row must have.
    pub version: Option<Value>,
    /// Property values when deletion was scheduled.
    pub state: Vec<PropertyValue>,
    /// Entity mapping.
    pub descriptor: Arc<EntityDescriptor>,
}

impl EntityDeleteAction {
    /// Returns the instances this row references through non-nullable
    /// foreign keys.
    pub fn references(&self) -> impl Iterator<Item = InstanceId> + '_ {
        non_nullable_references(&self.descriptor, &self.state)
            .filter(move |target| *target != self.instance)
    }
}

/// Inserts every element of a collection.
#[derive(Debug, Clone)]
pub struct CollectionRecreateAction {
    /// The collection.
    pub collection: CollectionId,
    /// Role and owner the rows are written under.
    pub key: CollectionKey,
    /// Elements to insert.
    pub elements: Vec<Element>,
}

/// Inserts and deletes individual collection rows.
#[derive(Debug, Clone)]
pub struct CollectionUpdateAction {
    /// The collection.
    pub collection: CollectionId,
    /// Role and owner of the rows.
    pub key: CollectionKey,
    /// Elements added since the snapshot.
    pub added: Vec<Element>,
    /// Elements removed since the snapshot.
    pub removed: Vec<Element>,
}

/// Deletes every row of a collection.
#[derive(Debug, Clone)]
pub struct CollectionRemoveAction {
    /// The collection, unless it was dereferenced.
    pub collection: Option<CollectionId>,
    /// Role and owner of the rows.
    pub key: CollectionKey,
}

/// A pending write.
#[derive(Debug, Clone)]
pub enum Action {
    /// See [`EntityInsertAction`].
    EntityInsert(EntityInsertAction),
    /// See [`EntityUpdateAction`].
    EntityUpdate(EntityUpdateAction),
    /// See [`EntityDeleteAction`].
    EntityDelete(EntityDeleteAction),
    /// See [`CollectionRecreateAction`].
    CollectionRecreate(CollectionRecreateAction),
    /// See [`CollectionUpdateAction`].
    CollectionUpdate(CollectionUpdateAction),
    /// See [`CollectionRemoveAction`].
    CollectionRemove(CollectionRemoveAction),
}

impl Action {
    /// Returns the action kind.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::EntityInsert(_) => ActionKind::EntityInsert,
            Self::EntityUpdate(_) => ActionKind::EntityUpdate,
            Self::EntityDelete(_) => ActionKind::EntityDelete,
            Self::CollectionRecreate(_) => ActionKind::CollectionRecreate,
            Self::CollectionUpdate(_) => ActionKind::CollectionUpdate,
            Self::CollectionRemove(_) => ActionKind::CollectionRemove,
        }
    }
}

fn non_nullable_references<'a>(
    descriptor: &'a EntityDescriptor,
    state: &'a [PropertyValue],
) -> impl Iterator<Item = InstanceId> + 'a {
    descriptor
        .properties()
        .iter()
        .zip(state)
        .filter_map(|(property, value)| match (property.reference_target(), value) {
            (Some((_, false)), PropertyValue::Reference(Some(Reference::Instance(target)))) => {
                Some(*target)
            }
            _ => None,
        })
}
