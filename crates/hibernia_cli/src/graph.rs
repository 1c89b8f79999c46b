//! Graph documents: a mapping plus a set of transient instances, read from
//! JSON.
//!
//! ```json
//! {
//!   "entities": [
//!     { "name": "Author", "versioned": true, "properties": [
//!       { "kind": "basic", "name": "name" },
//!       { "kind": "element_collection", "name": "tags" }
//!     ] },
//!     { "name": "Book", "properties": [
//!       { "kind": "basic", "name": "title" },
//!       { "kind": "many_to_one", "name": "author", "target": "Author",
//!         "cascade": "persist_merge" }
//!     ] }
//!   ],
//!   "instances": [
//!     { "handle": "tehanu", "entity": "Book", "id": 1,
//!       "values": { "title": "Tehanu", "author": { "ref": "ursula" } } },
//!     { "handle": "ursula", "entity": "Author", "id": 1,
//!       "values": { "name": "Ursula", "tags": ["fantasy"] } }
//!   ],
//!   "persist": ["tehanu"]
//! }
//! ```
//!
//! Scalars map to values, `{ "ref": handle }` to a reference and arrays to
//! collection elements. An empty `persist` list persists every instance.

use hibernia_codec::{Identifier, Value};
use hibernia_core::{
    CascadeStyle, CoreError, Element, EntityDescriptor, InstanceId, Metamodel, Session,
};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors raised while building a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The document is not valid JSON or does not match the format.
    #[error("invalid graph document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Two instances share a handle.
    #[error("duplicate handle: {0}")]
    DuplicateHandle(String),

    /// A reference or persist entry names a handle that does not exist.
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    /// A JSON value has no counterpart in the value model.
    #[error("unsupported value for {property}: {value}")]
    UnsupportedValue {
        /// Property being assigned.
        property: String,
        /// Offending JSON.
        value: Json,
    },

    /// The engine rejected the mapping or an assignment.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for graph building.
pub type GraphResult<T> = Result<T, GraphError>;

/// Cascade presets accepted in documents.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeSpec {
    /// No cascades.
    #[default]
    None,
    /// Persist and merge.
    PersistMerge,
    /// Every operation.
    All,
}

impl From<CascadeSpec> for CascadeStyle {
    fn from(spec: CascadeSpec) -> Self {
        match spec {
            CascadeSpec::None => CascadeStyle::NONE,
            CascadeSpec::PersistMerge => CascadeStyle::PERSIST_MERGE,
            CascadeSpec::All => CascadeStyle::ALL,
        }
    }
}

/// A mapped property.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertySpec {
    /// Scalar column.
    Basic {
        /// Property name.
        name: String,
    },
    /// Foreign key.
    ManyToOne {
        /// Property name.
        name: String,
        /// Referenced entity.
        target: String,
        /// Whether the column accepts `NULL`.
        #[serde(default)]
        nullable: bool,
        /// Cascaded operations.
        #[serde(default)]
        cascade: CascadeSpec,
    },
    /// Collection of entities.
    OneToMany {
        /// Property name.
        name: String,
        /// Element entity.
        element: String,
        /// Cascaded operations.
        #[serde(default)]
        cascade: CascadeSpec,
    },
    /// Collection of scalars.
    ElementCollection {
        /// Property name.
        name: String,
    },
}

/// A mapped entity.
#[derive(Debug, Clone, Deserialize)]
pub struct EntitySpec {
    /// Entity name.
    pub name: String,
    /// Properties in mapping order.
    pub properties: Vec<PropertySpec>,
    /// Whether the entity carries a version.
    #[serde(default)]
    pub versioned: bool,
}

/// A transient instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    /// Name used by references inside the document.
    pub handle: String,
    /// Entity name.
    pub entity: String,
    /// Assigned identifier.
    pub id: IdSpec,
    /// Property values by name.
    #[serde(default)]
    pub values: BTreeMap<String, Json>,
}

/// An identifier in a document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdSpec {
    /// Numeric identifier.
    Long(i64),
    /// Text identifier.
    Text(String),
}

impl From<IdSpec> for Identifier {
    fn from(id: IdSpec) -> Self {
        match id {
            IdSpec::Long(v) => Identifier::Long(v),
            IdSpec::Text(s) => Identifier::Text(s),
        }
    }
}

/// A parsed graph document.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphDocument {
    /// The mapping.
    pub entities: Vec<EntitySpec>,
    /// Instances to create.
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
    /// Handles to persist, in order.
    #[serde(default)]
    pub persist: Vec<String>,
}

impl GraphDocument {
    /// Parses a document.
    pub fn parse(json: &str) -> GraphResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds the metamodel described by the document.
    pub fn metamodel(&self) -> GraphResult<Metamodel> {
        let mut builder = Metamodel::builder();
        for entity in &self.entities {
            let mut descriptor = EntityDescriptor::builder(entity.name.as_str());
            for property in &entity.properties {
                descriptor = match property {
                    PropertySpec::Basic { name } => descriptor.basic(name.as_str()),
                    PropertySpec::ManyToOne {
                        name,
                        target,
                        nullable,
                        cascade,
                    } => descriptor.many_to_one(
                        name.as_str(),
                        target.as_str(),
                        *nullable,
                        (*cascade).into(),
                    ),
                    PropertySpec::OneToMany {
                        name,
                        element,
                        cascade,
                    } => descriptor.one_to_many(name.as_str(), element.as_str(), (*cascade).into()),
                    PropertySpec::ElementCollection { name } => {
                        descriptor.element_collection(name.as_str())
                    }
                };
            }
            if entity.versioned {
                descriptor = descriptor.versioned();
            }
            builder = builder.entity(descriptor.build());
        }
        Ok(builder.build()?)
    }

    /// Creates the instances in `session` and persists the requested ones.
    ///
    /// Instances are created before any reference is assigned, so documents
    /// may reference handles declared later.
    pub fn persist_into(&self, session: &mut Session) -> GraphResult<HashMap<String, InstanceId>> {
        let mut handles = HashMap::with_capacity(self.instances.len());
        for spec in &self.instances {
            let instance = session.new_instance(&spec.entity)?;
            session.set_identifier(instance, Identifier::from(spec.id.clone()))?;
            if handles.insert(spec.handle.clone(), instance).is_some() {
                return Err(GraphError::DuplicateHandle(spec.handle.clone()));
            }
        }

        for spec in &self.instances {
            let instance = handles[&spec.handle];
            for (property, json) in &spec.values {
                assign(session, &handles, instance, property, json)?;
            }
        }

        let order: Vec<&String> = if self.persist.is_empty() {
            self.instances.iter().map(|i| &i.handle).collect()
        } else {
            self.persist.iter().collect()
        };
        for handle in order {
            let instance = lookup(&handles, handle)?;
            session.persist(instance)?;
        }
        Ok(handles)
    }
}

fn lookup(handles: &HashMap<String, InstanceId>, handle: &str) -> GraphResult<InstanceId> {
    handles
        .get(handle)
        .copied()
        .ok_or_else(|| GraphError::UnknownHandle(handle.to_string()))
}

fn handle_of(json: &Json) -> Option<&str> {
    json.as_object()
        .filter(|o| o.len() == 1)
        .and_then(|o| o.get("ref"))
        .and_then(Json::as_str)
}

fn scalar(property: &str, json: &Json) -> GraphResult<Value> {
    let unsupported = || GraphError::UnsupportedValue {
        property: property.to_string(),
        value: json.clone(),
    };
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => n.as_i64().map(Value::Integer).ok_or_else(unsupported),
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Array(_) | Json::Object(_) => Err(unsupported()),
    }
}

fn assign(
    session: &mut Session,
    handles: &HashMap<String, InstanceId>,
    instance: InstanceId,
    property: &str,
    json: &Json,
) -> GraphResult<()> {
    if let Some(handle) = handle_of(json) {
        session.set(instance, property, lookup(handles, handle)?)?;
        return Ok(());
    }
    let Json::Array(items) = json else {
        session.set(instance, property, scalar(property, json)?)?;
        return Ok(());
    };
    let collection = session.get(instance, property)?.as_collection().ok_or_else(|| {
        GraphError::UnsupportedValue {
            property: property.to_string(),
            value: json.clone(),
        }
    })?;
    for item in items {
        let element = match handle_of(item) {
            Some(handle) => Element::from(lookup(handles, handle)?),
            None => Element::from(scalar(property, item)?),
        };
        session.add_element(collection, element)?;
    }
    Ok(())
}

