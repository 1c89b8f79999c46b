//! Entity instances and persistent collections held in a session arena.

use crate::types::{CollectionId, InstanceId, ProxyId};
use hibernia_codec::{Identifier, Value};

/// A reference to an entity: a real instance or a proxy standing in for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reference {
    /// An instance in the session arena.
    Instance(InstanceId),
    /// A proxy in the session arena.
    Proxy(ProxyId),
}

impl From<InstanceId> for Reference {
    fn from(id: InstanceId) -> Self {
        Self::Instance(id)
    }
}

impl From<ProxyId> for Reference {
    fn from(id: ProxyId) -> Self {
        Self::Proxy(id)
    }
}

/// The value of one mapped property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// A scalar.
    Basic(Value),
    /// A many-to-one association; `None` is a null reference.
    Reference(Option<Reference>),
    /// A collection handle; `None` is a null collection.
    Collection(Option<CollectionId>),
}

impl PropertyValue {
    /// Returns the scalar, if this is one.
    #[must_use]
    pub const fn as_basic(&self) -> Option<&Value> {
        match self {
            Self::Basic(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the reference, if this is a non-null association.
    #[must_use]
    pub const fn as_reference(&self) -> Option<Reference> {
        match self {
            Self::Reference(r) => *r,
            _ => None,
        }
    }

    /// Returns the collection handle, if any.
    #[must_use]
    pub const fn as_collection(&self) -> Option<CollectionId> {
        match self {
            Self::Collection(c) => *c,
            _ => None,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        Self::Basic(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Basic(Value::from(v))
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Basic(Value::Integer(v))
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Basic(Value::from(v))
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Basic(Value::Bool(v))
    }
}

impl From<Reference> for PropertyValue {
    fn from(r: Reference) -> Self {
        Self::Reference(Some(r))
    }
}

impl From<InstanceId> for PropertyValue {
    fn from(id: InstanceId) -> Self {
        Self::Reference(Some(Reference::Instance(id)))
    }
}

impl From<ProxyId> for PropertyValue {
    fn from(id: ProxyId) -> Self {
        Self::Reference(Some(Reference::Proxy(id)))
    }
}

/// A collection element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Element {
    /// A scalar element.
    Basic(Value),
    /// An entity element.
    Entity(Reference),
}

impl From<Value> for Element {
    fn from(v: Value) -> Self {
        Self::Basic(v)
    }
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Self::Basic(Value::from(v))
    }
}

impl From<Reference> for Element {
    fn from(r: Reference) -> Self {
        Self::Entity(r)
    }
}

impl From<InstanceId> for Element {
    fn from(id: InstanceId) -> Self {
        Self::Entity(Reference::Instance(id))
    }
}

/// An entity instance.
///
/// Instances are plain state; whether one is managed is decided by the
/// persistence context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInstance {
    entity_name: String,
    id: Option<Identifier>,
    version: Option<Value>,
    values: Vec<PropertyValue>,
    associated: bool,
}

impl EntityInstance {
    pub(crate) fn new(entity_name: impl Into<String>, values: Vec<PropertyValue>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: None,
            version: None,
            values,
            associated: false,
        }
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the identifier, if assigned.
    #[must_use]
    pub const fn id(&self) -> Option<&Identifier> {
        self.id.as_ref()
    }

    /// Returns the version, for versioned entities.
    #[must_use]
    pub const fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Returns the property values in mapping order.
    #[must_use]
    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }

    pub(crate) fn set_id(&mut self, id: Option<Identifier>) {
        self.id = id;
    }

    pub(crate) fn set_version(&mut self, version: Option<Value>) {
        self.version = version;
    }

    pub(crate) fn values_mut(&mut self) -> &mut Vec<PropertyValue> {
        &mut self.values
    }

    /// Returns whether the instance was ever persistent: loaded, or
    /// scheduled for insertion. Such an instance is detached rather than
    /// transient once it leaves the persistence context.
    #[must_use]
    pub const fn was_associated(&self) -> bool {
        self.associated
    }

    pub(crate) fn mark_associated(&mut self) {
        self.associated = true;
    }
}

/// A collection owned by one entity property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCollection {
    role: String,
    owner: InstanceId,
    elements: Vec<Element>,
    initialized: bool,
}

impl PersistentCollection {
    /// Creates an initialized, empty collection.
    pub(crate) fn new(role: impl Into<String>, owner: InstanceId) -> Self {
        Self {
            role: role.into(),
            owner,
            elements: Vec::new(),
            initialized: true,
        }
    }

    /// Creates a collection whose elements are loaded on first access.
    pub(crate) fn uninitialized(role: impl Into<String>, owner: InstanceId) -> Self {
        Self {
            initialized: false,
            ..Self::new(role, owner)
        }
    }

    /// Returns the collection role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the owning instance.
    #[must_use]
    pub const fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Returns whether the elements are loaded.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns the elements. Empty while uninitialized.
    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub(crate) fn initialize(&mut self, elements: Vec<Element>) {
        self.elements = elements;
        self.initialized = true;
    }

    pub(crate) fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    pub(crate) fn remove(&mut self, element: &Element) -> bool {
        match self.elements.iter().position(|e| e == element) {
            Some(pos) => {
                self.elements.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_owner(&mut self, owner: InstanceId) {
        self.owner = owner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_value_conversions() {
        assert_eq!(
            PropertyValue::from("x"),
            PropertyValue::Basic(Value::from("x"))
        );
        let r = PropertyValue::from(InstanceId(3));
        assert_eq!(r.as_reference(), Some(Reference::Instance(InstanceId(3))));
        assert!(r.as_basic().is_none());
        assert_eq!(PropertyValue::Collection(None).as_collection(), None);
    }

    #[test]
    fn collection_lifecycle() {
        let mut c = PersistentCollection::uninitialized("B.tags", InstanceId(0));
        assert!(!c.is_initialized());
        c.initialize(vec![Element::Basic(Value::from("a"))]);
        assert!(c.is_initialized());
        c.push(Element::Basic(Value::from("b")));
        assert!(c.remove(&Element::Basic(Value::from("a"))));
        assert!(!c.remove(&Element::Basic(Value::from("zzz"))));
        assert_eq!(c.elements(), &[Element::Basic(Value::from("b"))]);
    }
}
