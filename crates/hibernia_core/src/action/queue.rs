//! The action queue.

use super::{
    Action, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction,
};
use crate::error::{CoreError, CoreResult};
use crate::sort::{Graph, SortError};
use crate::types::InstanceId;
use std::collections::{HashMap, HashSet};
use std::mem;
use tracing::debug;

/// Pending actions, one sub-queue per kind.
///
/// Within a sub-queue actions keep the order they were added in until
/// [`prepare_actions`](Self::prepare_actions) reorders inserts and deletes
/// to satisfy foreign keys.
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<EntityInsertAction>,
    updates: Vec<EntityUpdateAction>,
    deletions: Vec<EntityDeleteAction>,
    collection_creations: Vec<CollectionRecreateAction>,
    collection_updates: Vec<CollectionUpdateAction>,
    collection_removals: Vec<CollectionRemoveAction>,
}

/// The content of an [`ActionQueue`], taken for execution.
///
/// Fields are listed in execution order.
#[derive(Debug, Default)]
pub struct QueuedActions {
    /// Row inserts.
    pub insertions: Vec<EntityInsertAction>,
    /// Row updates.
    pub updates: Vec<EntityUpdateAction>,
    /// Collection removals.
    pub collection_removals: Vec<CollectionRemoveAction>,
    /// Collection row changes.
    pub collection_updates: Vec<CollectionUpdateAction>,
    /// Collection recreations.
    pub collection_creations: Vec<CollectionRecreateAction>,
    /// Row deletes.
    pub deletions: Vec<EntityDeleteAction>,
}

impl QueuedActions {
    /// Returns the total number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insertions.len()
            + self.updates.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_creations.len()
            + self.deletions.len()
    }

    /// Returns true if there is nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActionQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action to the sub-queue of its kind.
    pub fn add_action(&mut self, action: Action) {
        match action {
            Action::EntityInsert(a) => self.insertions.push(a),
            Action::EntityUpdate(a) => self.updates.push(a),
            Action::EntityDelete(a) => self.deletions.push(a),
            Action::CollectionRecreate(a) => self.collection_creations.push(a),
            Action::CollectionUpdate(a) => self.collection_updates.push(a),
            Action::CollectionRemove(a) => self.collection_removals.push(a),
        }
    }

    /// Returns the queued inserts.
    #[must_use]
    pub fn insertions(&self) -> &[EntityInsertAction] {
        &self.insertions
    }

    /// Returns the queued updates.
    #[must_use]
    pub fn updates(&self) -> &[EntityUpdateAction] {
        &self.updates
    }

    /// Returns the queued deletes.
    #[must_use]
    pub fn deletions(&self) -> &[EntityDeleteAction] {
        &self.deletions
    }

    /// Returns the queued collection recreations.
    #[must_use]
    pub fn collection_creations(&self) -> &[CollectionRecreateAction] {
        &self.collection_creations
    }

    /// Returns the queued collection updates.
    #[must_use]
    pub fn collection_updates(&self) -> &[CollectionUpdateAction] {
        &self.collection_updates
    }

    /// Returns the queued collection removals.
    #[must_use]
    pub fn collection_removals(&self) -> &[CollectionRemoveAction] {
        &self.collection_removals
    }

    /// Returns the queued insert of `instance`.
    pub(crate) fn insertion_mut(&mut self, instance: InstanceId) -> Option<&mut EntityInsertAction> {
        self.insertions.iter_mut().find(|a| a.instance == instance)
    }

    /// Returns whether an insert of `instance` is queued.
    #[must_use]
    pub fn has_insertion(&self, instance: InstanceId) -> bool {
        self.insertions.iter().any(|a| a.instance == instance)
    }

    /// Drops the queued insert of `instance`.
    pub fn remove_insertion(&mut self, instance: InstanceId) -> Option<EntityInsertAction> {
        let pos = self.insertions.iter().position(|a| a.instance == instance)?;
        Some(self.insertions.remove(pos))
    }

    /// Drops the queued delete of `instance`, for an instance persisted
    /// again after removal.
    pub fn unschedule_deletion(&mut self, instance: InstanceId) -> Option<EntityDeleteAction> {
        let pos = self.deletions.iter().position(|a| a.instance == instance)?;
        Some(self.deletions.remove(pos))
    }

    /// Returns whether any action is queued.
    #[must_use]
    pub fn has_any_queued_actions(&self) -> bool {
        self.len() > 0
    }

    /// Returns the number of queued actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.insertions.len()
            + self.updates.len()
            + self.deletions.len()
            + self.collection_creations.len()
            + self.collection_updates.len()
            + self.collection_removals.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued action.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Finalizes the execution order.
    ///
    /// Inserts are topologically sorted when a non-nullable dependency is
    /// queued at or after its dependent, or whenever `order_inserts` is set;
    /// with `order_inserts` they are then grouped by entity name. Deletes
    /// are ordered so that referencing rows go first. With `order_updates`,
    /// updates are ordered by entity key.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DependencyCycle` if pending inserts or deletes
    /// reference each other in a cycle of non-nullable foreign keys.
    pub fn prepare_actions(&mut self, order_inserts: bool, order_updates: bool) -> CoreResult<()> {
        self.sort_insertions(order_inserts)?;
        self.sort_deletions()?;
        if order_updates {
            self.updates.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(())
    }

    /// Takes the queued actions, leaving the queue empty.
    pub fn take(&mut self) -> QueuedActions {
        QueuedActions {
            insertions: mem::take(&mut self.insertions),
            updates: mem::take(&mut self.updates),
            collection_removals: mem::take(&mut self.collection_removals),
            collection_updates: mem::take(&mut self.collection_updates),
            collection_creations: mem::take(&mut self.collection_creations),
            deletions: mem::take(&mut self.deletions),
        }
    }

    fn sort_insertions(&mut self, order_inserts: bool) -> CoreResult<()> {
        let pending: HashSet<InstanceId> = self.insertions.iter().map(|a| a.instance).collect();
        let position: HashMap<InstanceId, usize> = self
            .insertions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.instance, i))
            .collect();
        let dependencies: Vec<Vec<usize>> = self
            .insertions
            .iter()
            .map(|a| {
                a.dependencies(&pending)
                    .iter()
                    .filter_map(|d| position.get(d).copied())
                    .collect()
            })
            .collect();

        let out_of_order = dependencies
            .iter()
            .enumerate()
            .any(|(i, deps)| deps.iter().any(|&d| d >= i));
        if !out_of_order && !order_inserts {
            return Ok(());
        }

        let mut graph = Graph::new();
        let vertices: Vec<_> = (0..self.insertions.len())
            .map(|i| graph.add_vertex(i))
            .collect();
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                graph.add_edge(vertices[i], vertices[d]);
            }
        }
        let mut order = graph
            .sort()
            .map_err(|e| self.cycle_error(e, |i, q| q.insertions[i].key.to_string()))?;
        if order_inserts {
            order = self.group_by_entity(&order, &dependencies);
        }
        debug!(inserts = order.len(), "reordered pending inserts");
        self.insertions = permute(mem::take(&mut self.insertions), &order);
        Ok(())
    }

    /// Regroups a dependency-respecting order so that inserts of the same
    /// entity run next to each other where foreign keys allow it.
    fn group_by_entity(&self, order: &[usize], dependencies: &[Vec<usize>]) -> Vec<usize> {
        let mut remaining: Vec<usize> = order.to_vec();
        let mut emitted: HashSet<usize> = HashSet::new();
        let mut result = Vec::with_capacity(order.len());
        while let Some(&first) = remaining.first() {
            let name = self.insertions[first].key.entity_name().to_string();
            loop {
                let before = result.len();
                remaining.retain(|&i| {
                    let ready = self.insertions[i].key.entity_name() == name
                        && dependencies[i].iter().all(|d| emitted.contains(d));
                    if ready {
                        emitted.insert(i);
                        result.push(i);
                    }
                    !ready
                });
                if result.len() == before {
                    break;
                }
            }
        }
        result
    }

    fn sort_deletions(&mut self) -> CoreResult<()> {
        let position: HashMap<InstanceId, usize> = self
            .deletions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.instance, i))
            .collect();
        // referenced -> referencers
        let mut referencers: Vec<Vec<usize>> = vec![Vec::new(); self.deletions.len()];
        let mut out_of_order = false;
        for (i, action) in self.deletions.iter().enumerate() {
            for target in action.references() {
                if let Some(&t) = position.get(&target) {
                    referencers[t].push(i);
                    out_of_order |= t < i;
                }
            }
        }
        if !out_of_order {
            return Ok(());
        }

        let mut graph = Graph::new();
        let vertices: Vec<_> = (0..self.deletions.len())
            .map(|i| graph.add_vertex(i))
            .collect();
        for (t, list) in referencers.iter().enumerate() {
            for &r in list {
                graph.add_edge(vertices[t], vertices[r]);
            }
        }
        let order = graph
            .sort()
            .map_err(|e| self.cycle_error(e, |i, q| q.deletions[i].key.to_string()))?;
        debug!(deletes = order.len(), "reordered pending deletes");
        self.deletions = permute(mem::take(&mut self.deletions), &order);
        Ok(())
    }

    fn cycle_error(
        &self,
        error: SortError<usize>,
        describe: impl Fn(usize, &Self) -> String,
    ) -> CoreError {
        let SortError::Cycle(members) = error;
        CoreError::DependencyCycle {
            entities: members.into_iter().map(|i| describe(i, self)).collect(),
        }
    }
}

fn permute<T>(items: Vec<T>, order: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PropertyValue;
    use crate::metadata::{CascadeStyle, EntityDescriptor};
    use crate::types::{CollectionKey, EntityKey};
    use hibernia_codec::Identifier;
    use std::sync::Arc;

    fn descriptor(name: &str, refs: &[(&str, bool)]) -> Arc<EntityDescriptor> {
        let mut b = EntityDescriptor::builder(name);
        for (prop, nullable) in refs {
            b = b.many_to_one(*prop, "X", *nullable, CascadeStyle::NONE);
        }
        Arc::new(b.build())
    }

    fn insert(name: &str, instance: usize, refs: &[(&str, bool, Option<usize>)]) -> Action {
        let d = descriptor(
            name,
            &refs.iter().map(|(p, n, _)| (*p, *n)).collect::<Vec<_>>(),
        );
        Action::EntityInsert(EntityInsertAction {
            instance: InstanceId(instance),
            key: EntityKey::new(name, Identifier::from(instance as i64), None),
            version: None,
            state: refs
                .iter()
                .map(|(_, _, t)| PropertyValue::Reference(t.map(|t| InstanceId(t).into())))
                .collect(),
            descriptor: d,
        })
    }

    fn delete(name: &str, instance: usize, refs: &[Option<usize>]) -> Action {
        let d = descriptor(
            name,
            &refs.iter().enumerate().map(|_| ("r", false)).collect::<Vec<_>>(),
        );
        Action::EntityDelete(EntityDeleteAction {
            instance: InstanceId(instance),
            key: EntityKey::new(name, Identifier::from(instance as i64), None),
            version: None,
            state: refs
                .iter()
                .map(|t| PropertyValue::Reference(t.map(|t| InstanceId(t).into())))
                .collect(),
            descriptor: d,
        })
    }

    fn insert_order(queue: &ActionQueue) -> Vec<usize> {
        queue.insertions().iter().map(|a| a.instance.0).collect()
    }

    #[test]
    fn satisfied_order_is_kept() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("C", 0, &[]));
        queue.add_action(insert("B", 1, &[("c", false, Some(0))]));
        queue.prepare_actions(false, false).unwrap();
        assert_eq!(insert_order(&queue), vec![0, 1]);
    }

    #[test]
    fn forward_references_are_sorted() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("B", 0, &[("c", false, Some(1)), ("d", false, Some(2))]));
        queue.add_action(insert("C", 1, &[]));
        queue.add_action(insert("D", 2, &[("e", false, Some(3))]));
        queue.add_action(insert("E", 3, &[]));
        queue.prepare_actions(false, false).unwrap();
        assert_eq!(insert_order(&queue), vec![1, 3, 2, 0]);
    }

    #[test]
    fn nullable_references_do_not_constrain() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("B", 0, &[("g", true, Some(1))]));
        queue.add_action(insert("G", 1, &[]));
        queue.prepare_actions(false, false).unwrap();
        assert_eq!(insert_order(&queue), vec![0, 1]);
    }

    #[test]
    fn two_cycle_is_rejected() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("A", 0, &[("b", false, Some(1))]));
        queue.add_action(insert("B", 1, &[("a", false, Some(0))]));
        let err = queue.prepare_actions(false, false).unwrap_err();
        match err {
            CoreError::DependencyCycle { entities } => {
                assert_eq!(entities, vec!["[A#0]".to_string(), "[B#1]".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn ordering_inserts_groups_entities() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("P", 0, &[]));
        queue.add_action(insert("Q", 1, &[("p", false, Some(0))]));
        queue.add_action(insert("P", 2, &[]));
        queue.add_action(insert("Q", 3, &[("p", false, Some(2))]));
        queue.prepare_actions(true, false).unwrap();
        assert_eq!(insert_order(&queue), vec![0, 2, 1, 3]);
    }

    #[test]
    fn grouping_never_breaks_dependencies() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("P", 0, &[]));
        queue.add_action(insert("Q", 1, &[("p", false, Some(0))]));
        queue.add_action(insert("P", 2, &[("q", false, Some(1))]));
        queue.prepare_actions(true, false).unwrap();
        assert_eq!(insert_order(&queue), vec![0, 1, 2]);
    }

    #[test]
    fn referencing_rows_are_deleted_first() {
        let mut queue = ActionQueue::new();
        queue.add_action(delete("C", 0, &[]));
        queue.add_action(delete("B", 1, &[Some(0)]));
        queue.prepare_actions(false, false).unwrap();
        let order: Vec<_> = queue.deletions().iter().map(|a| a.instance.0).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn unscheduling_and_removal() {
        let mut queue = ActionQueue::new();
        queue.add_action(insert("C", 0, &[]));
        queue.add_action(delete("B", 1, &[]));
        queue.add_action(Action::CollectionRemove(CollectionRemoveAction {
            collection: None,
            key: CollectionKey::new("B.tags", Identifier::from(1)),
        }));
        assert_eq!(queue.len(), 3);
        assert!(queue.has_insertion(InstanceId(0)));
        assert!(queue.unschedule_deletion(InstanceId(1)).is_some());
        assert!(queue.remove_insertion(InstanceId(0)).is_some());
        assert!(queue.has_any_queued_actions());
        let taken = queue.take();
        assert_eq!(taken.collection_removals.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn updates_ordered_by_key_on_request() {
        let mut queue = ActionQueue::new();
        for (name, id) in [("B", 2), ("A", 9), ("B", 1)] {
            queue.add_action(Action::EntityUpdate(EntityUpdateAction {
                instance: InstanceId(id),
                key: EntityKey::new(name, Identifier::from(id as i64), None),
                state: vec![],
                previous_state: vec![],
                dirty: vec![],
                previous_version: None,
                next_version: None,
                descriptor: descriptor(name, &[]),
            }));
        }
        queue.prepare_actions(false, true).unwrap();
        let keys: Vec<_> = queue.updates().iter().map(|u| u.key.to_string()).collect();
        assert_eq!(keys, vec!["[A#9]", "[B#1]", "[B#2]"]);
    }
}
