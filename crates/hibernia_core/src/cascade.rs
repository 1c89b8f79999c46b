//! Cascade traversal.
//!
//! Cascades follow association edges depth-first in property order. The
//! visited set is keyed by arena index, so reference cycles terminate and
//! two distinct instances with equal state are both visited.

use crate::instance::{Element, PersistentCollection, PropertyValue, Reference};
use crate::metadata::{CascadeOp, EntityDescriptor};
use crate::proxy::LazyInitializer;
use crate::types::InstanceId;
use std::collections::HashSet;

/// A depth-first walk over instances reached by one cascade.
#[derive(Debug, Default)]
pub struct CascadeWalk {
    stack: Vec<InstanceId>,
    visited: HashSet<InstanceId>,
}

impl CascadeWalk {
    /// Starts a walk at `root`.
    #[must_use]
    pub fn new(root: InstanceId) -> Self {
        Self {
            stack: vec![root],
            visited: HashSet::new(),
        }
    }

    /// Returns the next unvisited instance and marks it visited.
    pub fn next_instance(&mut self) -> Option<InstanceId> {
        while let Some(next) = self.stack.pop() {
            if self.visited.insert(next) {
                return Some(next);
            }
        }
        None
    }

    /// Schedules the children of the instance last returned. The first
    /// child is visited first.
    pub fn push_children(&mut self, children: Vec<InstanceId>) {
        self.stack.extend(
            children
                .into_iter()
                .rev()
                .filter(|c| !self.visited.contains(c)),
        );
    }

    /// Returns whether `instance` has been visited.
    #[must_use]
    pub fn visited(&self, instance: InstanceId) -> bool {
        self.visited.contains(&instance)
    }
}

/// Returns the instances `op` cascades to from an instance with `values`.
///
/// Uninitialized proxies and uninitialized collections are not traversed;
/// an initialized proxy contributes the instance it delegates to.
pub(crate) fn cascade_targets(
    descriptor: &EntityDescriptor,
    values: &[PropertyValue],
    op: CascadeOp,
    proxies: &[LazyInitializer],
    collections: &[PersistentCollection],
) -> Vec<InstanceId> {
    let resolve = |r: Reference| match r {
        Reference::Instance(i) => Some(i),
        Reference::Proxy(p) => proxies.get(p.0).and_then(LazyInitializer::attached_instance),
    };
    let mut targets = Vec::new();
    for (property, value) in descriptor.properties().iter().zip(values) {
        if !property.cascade().applies(op) {
            continue;
        }
        match value {
            PropertyValue::Reference(Some(r)) => targets.extend(resolve(*r)),
            PropertyValue::Collection(Some(c)) => {
                let Some(collection) = collections.get(c.0) else {
                    continue;
                };
                if !collection.is_initialized() {
                    continue;
                }
                targets.extend(collection.elements().iter().filter_map(|e| match e {
                    Element::Entity(r) => resolve(*r),
                    Element::Basic(_) => None,
                }));
            }
            _ => {}
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CascadeStyle;
    use crate::types::{ProxyId, SessionId};
    use hibernia_codec::Identifier;
    use uuid::Uuid;

    #[test]
    fn walk_is_depth_first_in_property_order() {
        // B -> C, D, G; D -> E, F; F -> G
        let children = |i: usize| -> Vec<InstanceId> {
            match i {
                0 => vec![InstanceId(1), InstanceId(2), InstanceId(5)],
                2 => vec![InstanceId(3), InstanceId(4)],
                4 => vec![InstanceId(5)],
                _ => vec![],
            }
        };
        let mut walk = CascadeWalk::new(InstanceId(0));
        let mut order = Vec::new();
        while let Some(next) = walk.next_instance() {
            order.push(next.0);
            walk.push_children(children(next.0));
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn cycles_terminate() {
        let mut walk = CascadeWalk::new(InstanceId(0));
        let mut count = 0;
        while let Some(next) = walk.next_instance() {
            count += 1;
            let other = InstanceId(1 - next.0);
            walk.push_children(vec![other, next]);
        }
        assert_eq!(count, 2);
        assert!(walk.visited(InstanceId(1)));
    }

    #[test]
    fn targets_follow_cascade_style_and_skip_uninitialized() {
        let descriptor = EntityDescriptor::builder("B")
            .many_to_one("c", "C", false, CascadeStyle::ALL)
            .many_to_one("d", "D", false, CascadeStyle::NONE)
            .many_to_one("p", "P", true, CascadeStyle::ALL)
            .one_to_many("items", "I", CascadeStyle::PERSIST_MERGE)
            .build();
        let proxies = vec![LazyInitializer::new(
            "P",
            "id",
            Identifier::from(1),
            SessionId(1),
            Uuid::nil(),
            "test",
            false,
        )];
        let mut items = PersistentCollection::new("B.items", InstanceId(0));
        items.push(Element::Entity(Reference::Instance(InstanceId(7))));
        let values = vec![
            PropertyValue::from(InstanceId(1)),
            PropertyValue::from(InstanceId(2)),
            PropertyValue::from(ProxyId(0)),
            PropertyValue::Collection(Some(crate::types::CollectionId(0))),
        ];

        let persist = cascade_targets(&descriptor, &values, CascadeOp::Persist, &proxies, &[items.clone()]);
        assert_eq!(persist, vec![InstanceId(1), InstanceId(7)]);

        let remove = cascade_targets(&descriptor, &values, CascadeOp::Remove, &proxies, &[items]);
        assert_eq!(remove, vec![InstanceId(1)]);

        let lazy = PersistentCollection::uninitialized("B.items", InstanceId(0));
        let none = cascade_targets(&descriptor, &values, CascadeOp::Merge, &proxies, &[lazy]);
        assert_eq!(none, vec![InstanceId(1)]);
    }
}
