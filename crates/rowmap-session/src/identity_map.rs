//! Identity Map: one in-memory instance per stored row, per session.
//!
//! The map is keyed by `(entity type name, primary key)` and stores the
//! shared `EntityRef` itself, so looking up the same row twice hands back
//! clones of the same `Arc`:
//!
//! ```
//! use rowmap_core::{EntityId, EntityInstance, EntityType};
//! use rowmap_session::{IdentityMap, ObjectKey};
//! use std::sync::Arc;
//!
//! static COURSE: EntityType = EntityType::new("Course", "CourseDetails");
//!
//! let mut map = IdentityMap::new();
//! let key = ObjectKey::new("Course", EntityId(10001));
//! let first = map.insert(key, EntityInstance::new(&COURSE).into_ref());
//! let again = map.insert(key, EntityInstance::new(&COURSE).into_ref());
//! assert!(Arc::ptr_eq(&first, &again));
//! ```

use rowmap_core::{EntityId, EntityRef};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a stored row: entity type and primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub entity: &'static str,
    pub id: EntityId,
}

impl ObjectKey {
    pub const fn new(entity: &'static str, id: EntityId) -> Self {
        Self { entity, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identity Map for tracking unique entity instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, EntityRef>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under `key`.
    ///
    /// If the key is already mapped the existing instance wins and is
    /// returned; `entity` is discarded.
    pub fn insert(&mut self, key: ObjectKey, entity: EntityRef) -> EntityRef {
        Arc::clone(self.entries.entry(key).or_insert(entity))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<EntityRef> {
        self.entries.get(key).map(Arc::clone)
    }

    /// Is this exact instance the one mapped under `key`?
    pub fn is_managed(&self, key: &ObjectKey, entity: &EntityRef) -> bool {
        self.entries
            .get(key)
            .is_some_and(|mapped| Arc::ptr_eq(mapped, entity))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mapped instances, ordered by key for deterministic iteration.
    pub fn entries(&self) -> Vec<(ObjectKey, EntityRef)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("IdentityMap").field("keys", &keys).finish()
    }
}
