//! Entity mapping metadata.
//!
//! The metamodel is built programmatically: each [`EntityDescriptor`]
//! lists its properties in mapping order, and that order is the order of
//! every state snapshot, statement column list and cache entry.
//!
//! ```rust
//! use hibernia_core::{CascadeStyle, EntityDescriptor, Metamodel};
//!
//! let metamodel = Metamodel::builder()
//!     .entity(EntityDescriptor::builder("Author").basic("name").build())
//!     .entity(
//!         EntityDescriptor::builder("Book")
//!             .basic("title")
//!             .many_to_one("author", "Author", false, CascadeStyle::ALL)
//!             .versioned()
//!             .build(),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let book = metamodel.descriptor("Book").unwrap();
//! assert_eq!(book.property_index("author").unwrap(), 1);
//! ```

use crate::error::{CoreError, CoreResult};
use hibernia_cache::AccessType;
use std::collections::HashMap;
use std::sync::Arc;

/// An operation that can cascade along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    /// Make transient instances persistent.
    Persist,
    /// Copy detached state onto managed instances.
    Merge,
    /// Schedule deletion.
    Remove,
    /// Reload state from the database.
    Refresh,
    /// Acquire a lock.
    Lock,
}

/// Which operations cascade along an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeStyle {
    /// Cascade persist.
    pub persist: bool,
    /// Cascade merge.
    pub merge: bool,
    /// Cascade remove.
    pub remove: bool,
    /// Cascade refresh.
    pub refresh: bool,
    /// Cascade lock.
    pub lock: bool,
}

impl CascadeStyle {
    /// No cascades.
    pub const NONE: Self = Self {
        persist: false,
        merge: false,
        remove: false,
        refresh: false,
        lock: false,
    };

    /// Every cascade.
    pub const ALL: Self = Self {
        persist: true,
        merge: true,
        remove: true,
        refresh: true,
        lock: true,
    };

    /// Persist and merge only.
    pub const PERSIST_MERGE: Self = Self {
        persist: true,
        merge: true,
        remove: false,
        refresh: false,
        lock: false,
    };

    /// Returns whether `op` cascades.
    #[must_use]
    pub const fn applies(self, op: CascadeOp) -> bool {
        match op {
            CascadeOp::Persist => self.persist,
            CascadeOp::Merge => self.merge,
            CascadeOp::Remove => self.remove,
            CascadeOp::Refresh => self.refresh,
            CascadeOp::Lock => self.lock,
        }
    }
}

/// How a property is mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// A scalar column.
    Basic,
    /// A foreign key to another entity.
    ManyToOne {
        /// Referenced entity name.
        target: String,
        /// Whether the foreign key column accepts `NULL`.
        nullable: bool,
        /// Cascaded operations.
        cascade: CascadeStyle,
    },
    /// A collection stored in its own table.
    Collection {
        /// Collection role, `Owner.property`.
        role: String,
        /// Element entity name, or `None` for scalar elements.
        element: Option<String>,
        /// Cascaded operations to entity elements.
        cascade: CascadeStyle,
    },
}

/// A mapped property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    name: String,
    kind: PropertyKind,
}

impl Property {
    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the mapping kind.
    #[must_use]
    pub const fn kind(&self) -> &PropertyKind {
        &self.kind
    }

    /// Returns the cascade style of an association, or `NONE`.
    #[must_use]
    pub const fn cascade(&self) -> CascadeStyle {
        match &self.kind {
            PropertyKind::Basic => CascadeStyle::NONE,
            PropertyKind::ManyToOne { cascade, .. } | PropertyKind::Collection { cascade, .. } => {
                *cascade
            }
        }
    }

    /// Returns true for collection properties.
    #[must_use]
    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection { .. })
    }

    /// Returns the target of a many-to-one and its nullability.
    #[must_use]
    pub fn reference_target(&self) -> Option<(&str, bool)> {
        match &self.kind {
            PropertyKind::ManyToOne {
                target, nullable, ..
            } => Some((target, *nullable)),
            _ => None,
        }
    }
}

/// Mapping of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    name: String,
    identifier_name: String,
    properties: Vec<Property>,
    versioned: bool,
    cache: Option<AccessType>,
    mutable: bool,
    lazy: bool,
}

impl EntityDescriptor {
    /// Starts a descriptor for `name`.
    pub fn builder(name: impl Into<String>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            descriptor: Self {
                name: name.into(),
                identifier_name: "id".into(),
                properties: Vec::new(),
                versioned: false,
                cache: None,
                mutable: true,
                lazy: false,
            },
        }
    }

    /// Returns the entity name; also the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the identifier property name.
    #[must_use]
    pub fn identifier_name(&self) -> &str {
        &self.identifier_name
    }

    /// Returns the properties in mapping order.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Returns the property at `index`.
    #[must_use]
    pub fn property(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }

    /// Returns the index of the named property.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownProperty` if no such property is mapped.
    pub fn property_index(&self, name: &str) -> CoreResult<usize> {
        self.properties
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| CoreError::unknown_property(&self.name, name))
    }

    /// Returns whether the entity carries a version column.
    #[must_use]
    pub const fn is_versioned(&self) -> bool {
        self.versioned
    }

    /// Returns the cache access type, if the entity is cached.
    #[must_use]
    pub const fn cache_access(&self) -> Option<AccessType> {
        self.cache
    }

    /// Returns whether instances may be updated.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Returns whether references to the entity are proxied.
    #[must_use]
    pub const fn is_lazy(&self) -> bool {
        self.lazy
    }
}

/// Builder for [`EntityDescriptor`].
#[derive(Debug, Clone)]
pub struct EntityDescriptorBuilder {
    descriptor: EntityDescriptor,
}

impl EntityDescriptorBuilder {
    /// Names the identifier property.
    #[must_use]
    pub fn identifier(mut self, name: impl Into<String>) -> Self {
        self.descriptor.identifier_name = name.into();
        self
    }

    /// Adds a scalar property.
    #[must_use]
    pub fn basic(self, name: impl Into<String>) -> Self {
        self.property(name, PropertyKind::Basic)
    }

    /// Adds a many-to-one association.
    #[must_use]
    pub fn many_to_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        nullable: bool,
        cascade: CascadeStyle,
    ) -> Self {
        self.property(
            name,
            PropertyKind::ManyToOne {
                target: target.into(),
                nullable,
                cascade,
            },
        )
    }

    /// Adds a collection of entity references.
    #[must_use]
    pub fn one_to_many(
        self,
        name: impl Into<String>,
        element: impl Into<String>,
        cascade: CascadeStyle,
    ) -> Self {
        let name = name.into();
        let role = format!("{}.{name}", self.descriptor.name);
        self.property(
            name,
            PropertyKind::Collection {
                role,
                element: Some(element.into()),
                cascade,
            },
        )
    }

    /// Adds a collection of scalars.
    #[must_use]
    pub fn element_collection(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let role = format!("{}.{name}", self.descriptor.name);
        self.property(
            name,
            PropertyKind::Collection {
                role,
                element: None,
                cascade: CascadeStyle::NONE,
            },
        )
    }

    /// Adds a version column.
    #[must_use]
    pub fn versioned(mut self) -> Self {
        self.descriptor.versioned = true;
        self
    }

    /// Caches the entity in a region named after it.
    #[must_use]
    pub fn cached(mut self, access: AccessType) -> Self {
        self.descriptor.cache = Some(access);
        self
    }

    /// Marks the entity immutable.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.descriptor.mutable = false;
        self
    }

    /// Proxies references to the entity instead of loading them.
    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.descriptor.lazy = lazy;
        self
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> EntityDescriptor {
        self.descriptor
    }

    fn property(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.descriptor.properties.push(Property {
            name: name.into(),
            kind,
        });
        self
    }
}

/// The set of mapped entities.
#[derive(Debug, Clone, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityDescriptor>>,
    order: Vec<String>,
}

impl Metamodel {
    /// Starts an empty metamodel.
    #[must_use]
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder {
            descriptors: Vec::new(),
        }
    }

    /// Returns the descriptor of `name`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownEntity` if the name is not mapped.
    pub fn descriptor(&self, name: &str) -> CoreResult<&Arc<EntityDescriptor>> {
        self.entities.get(name).ok_or_else(|| CoreError::UnknownEntity {
            name: name.to_string(),
        })
    }

    /// Returns the descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.order.iter().filter_map(|n| self.entities.get(n))
    }

    /// Returns the number of mapped entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if no entity is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builder for [`Metamodel`].
#[derive(Debug, Clone)]
pub struct MetamodelBuilder {
    descriptors: Vec<EntityDescriptor>,
}

impl MetamodelBuilder {
    /// Adds an entity.
    #[must_use]
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validates and finishes the metamodel.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity is mapped twice, a property name
    /// repeats, or an association targets an unmapped entity.
    pub fn build(self) -> CoreResult<Metamodel> {
        let mut metamodel = Metamodel::default();
        for descriptor in self.descriptors {
            if metamodel.entities.contains_key(&descriptor.name) {
                return Err(CoreError::invalid_operation(format!(
                    "entity {} is mapped twice",
                    descriptor.name
                )));
            }
            for (i, p) in descriptor.properties.iter().enumerate() {
                if p.name == descriptor.identifier_name
                    || descriptor.properties[..i].iter().any(|q| q.name == p.name)
                {
                    return Err(CoreError::property_value(
                        &descriptor.name,
                        &p.name,
                        "property is mapped twice",
                    ));
                }
            }
            metamodel.order.push(descriptor.name.clone());
            metamodel
                .entities
                .insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        for descriptor in metamodel.entities.values() {
            for p in &descriptor.properties {
                let target = match &p.kind {
                    PropertyKind::Basic => None,
                    PropertyKind::ManyToOne { target, .. } => Some(target),
                    PropertyKind::Collection { element, .. } => element.as_ref(),
                };
                if let Some(target) = target {
                    metamodel.descriptor(target)?;
                }
            }
        }
        Ok(metamodel)
    }
}
