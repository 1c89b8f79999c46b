//! Dirty checking.

use crate::instance::{PropertyValue, Reference};
use crate::metadata::EntityDescriptor;
use crate::types::InstanceId;
use hibernia_codec::Identifier;

/// What a reference points to, for comparison purposes.
///
/// A proxy and the instance it stands for resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferenceIdentity {
    /// A persistent entity.
    Key(String, Identifier),
    /// An instance with no identity yet.
    Transient(InstanceId),
}

/// Returns the indices of properties whose current value differs from the
/// snapshot.
///
/// Scalars compare by value, references by the identity `resolve` assigns
/// them, collections by handle.
pub fn find_dirty<F>(
    descriptor: &EntityDescriptor,
    loaded: &[PropertyValue],
    current: &[PropertyValue],
    resolve: F,
) -> Vec<usize>
where
    F: Fn(Reference) -> ReferenceIdentity,
{
    let same_ref = |a: Option<Reference>, b: Option<Reference>| match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b || resolve(a) == resolve(b),
        _ => false,
    };
    (0..descriptor.properties().len())
        .filter(|&i| match (loaded.get(i), current.get(i)) {
            (Some(PropertyValue::Basic(a)), Some(PropertyValue::Basic(b))) => a != b,
            (Some(PropertyValue::Reference(a)), Some(PropertyValue::Reference(b))) => {
                !same_ref(*a, *b)
            }
            (Some(PropertyValue::Collection(a)), Some(PropertyValue::Collection(b))) => a != b,
            _ => true,
        })
        .collect()
}

/// Returns whether dirty properties require an update statement.
///
/// Replacing only a collection handle changes no column of the owner, but a
/// versioned owner still gets its version incremented.
#[must_use]
pub fn requires_update(descriptor: &EntityDescriptor, dirty: &[usize]) -> bool {
    if descriptor.is_versioned() {
        return !dirty.is_empty();
    }
    dirty
        .iter()
        .any(|&i| descriptor.property(i).is_some_and(|p| !p.is_collection()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::CascadeStyle;
    use crate::types::{CollectionId, ProxyId};

    fn descriptor(versioned: bool) -> EntityDescriptor {
        let b = EntityDescriptor::builder("B")
            .basic("name")
            .many_to_one("c", "C", false, CascadeStyle::NONE)
            .element_collection("tags");
        if versioned {
            b.versioned().build()
        } else {
            b.build()
        }
    }

    fn state(name: &str, c: Reference, tags: usize) -> Vec<PropertyValue> {
        vec![
            PropertyValue::from(name),
            PropertyValue::from(c),
            PropertyValue::Collection(Some(CollectionId(tags))),
        ]
    }

    fn resolve(r: Reference) -> ReferenceIdentity {
        match r {
            Reference::Instance(InstanceId(7)) | Reference::Proxy(ProxyId(1)) => {
                ReferenceIdentity::Key("C".into(), Identifier::from(3))
            }
            Reference::Instance(i) => ReferenceIdentity::Transient(i),
            Reference::Proxy(_) => ReferenceIdentity::Key("C".into(), Identifier::from(99)),
        }
    }

    #[test]
    fn unchanged_state_is_clean() {
        let d = descriptor(false);
        let s = state("a", Reference::Instance(InstanceId(7)), 0);
        assert!(find_dirty(&d, &s, &s, resolve).is_empty());
    }

    #[test]
    fn scalar_change_is_reported() {
        let d = descriptor(false);
        let loaded = state("a", Reference::Instance(InstanceId(7)), 0);
        let current = state("b", Reference::Instance(InstanceId(7)), 0);
        assert_eq!(find_dirty(&d, &loaded, &current, resolve), vec![0]);
    }

    #[test]
    fn proxy_and_instance_of_the_same_row_are_equal() {
        let d = descriptor(false);
        let loaded = state("a", Reference::Proxy(ProxyId(1)), 0);
        let current = state("a", Reference::Instance(InstanceId(7)), 0);
        assert!(find_dirty(&d, &loaded, &current, resolve).is_empty());

        let other = state("a", Reference::Instance(InstanceId(8)), 0);
        assert_eq!(find_dirty(&d, &loaded, &other, resolve), vec![1]);
    }

    #[test]
    fn collection_handles_compare_by_identity() {
        let loaded = state("a", Reference::Instance(InstanceId(7)), 0);
        let current = state("a", Reference::Instance(InstanceId(7)), 1);
        let plain = descriptor(false);
        let dirty = find_dirty(&plain, &loaded, &current, resolve);
        assert_eq!(dirty, vec![2]);
        assert!(!requires_update(&plain, &dirty));
        assert!(requires_update(&descriptor(true), &dirty));
    }

    #[test]
    fn null_reference_differs_from_any_reference() {
        let d = descriptor(false);
        let mut loaded = state("a", Reference::Instance(InstanceId(7)), 0);
        let current = loaded.clone();
        loaded[1] = PropertyValue::Reference(None);
        assert_eq!(find_dirty(&d, &loaded, &current, resolve), vec![1]);
        assert!(requires_update(&d, &[1]));
    }
}
