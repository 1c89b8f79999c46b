//! Collection entries.

use crate::instance::Element;
use crate::types::CollectionKey;

/// Bookkeeping for one persistent collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    role: String,
    loaded_key: Option<CollectionKey>,
    snapshot: Vec<Element>,
    initialized: bool,
    fresh: bool,
    reached: bool,
}

impl CollectionEntry {
    /// Entry for a collection loaded (or about to be loaded) from the
    /// database.
    #[must_use]
    pub fn loaded(key: CollectionKey) -> Self {
        Self {
            role: key.role().to_string(),
            loaded_key: Some(key),
            snapshot: Vec::new(),
            initialized: false,
            fresh: false,
            reached: false,
        }
    }

    /// Entry for a collection instantiated in this session.
    #[must_use]
    pub fn fresh(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            loaded_key: None,
            snapshot: Vec::new(),
            initialized: true,
            fresh: true,
            reached: false,
        }
    }

    /// Returns the collection role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the key the collection's rows are stored under, if any.
    #[must_use]
    pub const fn loaded_key(&self) -> Option<&CollectionKey> {
        self.loaded_key.as_ref()
    }

    /// Returns the elements as of load or last flush.
    #[must_use]
    pub fn snapshot(&self) -> &[Element] {
        &self.snapshot
    }

    /// Returns whether the elements were loaded.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns whether the collection was instantiated in this session.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub(crate) const fn is_reached(&self) -> bool {
        self.reached
    }

    pub(crate) fn set_reached(&mut self, reached: bool) {
        self.reached = reached;
    }

    /// Records loaded elements.
    pub(crate) fn post_initialize(&mut self, elements: Vec<Element>) {
        self.snapshot = elements;
        self.initialized = true;
    }

    /// Records that the rows under `key` now match `elements`.
    pub(crate) fn post_flush(&mut self, key: Option<CollectionKey>, elements: Vec<Element>) {
        self.loaded_key = key;
        self.snapshot = elements;
        self.fresh = false;
    }

    /// Returns the elements added and removed relative to the snapshot.
    #[must_use]
    pub fn diff(&self, current: &[Element]) -> (Vec<Element>, Vec<Element>) {
        let mut remaining: Vec<&Element> = self.snapshot.iter().collect();
        let mut added = Vec::new();
        for element in current {
            match remaining.iter().position(|e| *e == element) {
                Some(pos) => {
                    remaining.remove(pos);
                }
                None => added.push(element.clone()),
            }
        }
        let removed = remaining.into_iter().cloned().collect();
        (added, removed)
    }
}
