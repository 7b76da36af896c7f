//! Unit of Work pattern implementation for rowmap sessions.
//!
//! The Unit of Work records at most one pending operation per entity
//! instance. Later registrations merge with earlier ones:
//!
//! | pending  | then      | result                          |
//! |----------|-----------|---------------------------------|
//! | INSERT   | dirty     | INSERT (flushes latest values)  |
//! | INSERT   | deleted   | nothing (both cancel)           |
//! | UPDATE   | deleted   | DELETE                          |
//! | DELETE   | dirty     | DELETE (dirty ignored)          |
//!
//! Instances are identified by pointer, not by key, so unsaved instances
//! can be tracked before the store assigns their keys.

use crate::identity_map::{IdentityMap, ObjectKey};
use rowmap_core::{EntityRef, EntityType, Error, Result, StateErrorKind, read_entity};
use std::collections::HashMap;
use std::sync::Arc;

/// Pointer identity of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey(usize);

impl InstanceKey {
    pub fn of(entity: &EntityRef) -> Self {
        Self(Arc::as_ptr(entity).cast::<()>() as usize)
    }
}

/// Kind of pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Insert,
    Update,
    Delete,
}

/// A pending operation on one instance.
#[derive(Clone)]
pub struct PendingOp {
    pub kind: PendingKind,
    pub entity_type: &'static EntityType,
    pub entity: EntityRef,
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("kind", &self.kind)
            .field("entity_type", &self.entity_type.name)
            .field("id", &read_entity(&self.entity).id())
            .finish()
    }
}

/// Counts of pending operations by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

/// What a registration did to the pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// A new operation was queued.
    Queued(PendingKind),
    /// An existing operation absorbed the registration.
    Merged(PendingKind),
    /// A pending INSERT and the DELETE cancelled out.
    Cancelled,
    /// Nothing to do.
    Ignored,
}

/// Tracks pending inserts, updates and deletes for one session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    order: Vec<InstanceKey>,
    ops: HashMap<InstanceKey, PendingOp>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&mut self, kind: PendingKind, entity: &EntityRef) -> Registered {
        let entity_type = read_entity(entity).entity_type();
        let key = InstanceKey::of(entity);
        if self.ops.contains_key(&key) {
            if let Some(op) = self.ops.get_mut(&key) {
                op.kind = kind;
            }
        } else {
            self.order.push(key);
            self.ops.insert(
                key,
                PendingOp {
                    kind,
                    entity_type,
                    entity: Arc::clone(entity),
                },
            );
        }
        Registered::Queued(kind)
    }

    /// Queue an INSERT for an unsaved instance.
    pub fn register_new(&mut self, entity: &EntityRef) -> Result<Registered> {
        let (ty, id) = {
            let guard = read_entity(entity);
            (guard.entity_type(), guard.id())
        };
        if let Some(id) = id {
            return Err(Error::state(
                StateErrorKind::AlreadyPersisted,
                ty.name,
                format!("instance already has key {}", id),
            ));
        }
        match self.kind_of(entity) {
            Some(PendingKind::Insert) => Ok(Registered::Merged(PendingKind::Insert)),
            _ => {
                tracing::trace!(entity = ty.name, "Queued INSERT");
                Ok(self.queue(PendingKind::Insert, entity))
            }
        }
    }

    /// Queue an UPDATE for a tracked instance.
    ///
    /// Instances with a pending INSERT need nothing more; the insert writes
    /// current values. Instances pending deletion stay deleted.
    pub fn register_dirty(
        &mut self,
        entity: &EntityRef,
        identity: &IdentityMap,
    ) -> Result<Registered> {
        match self.kind_of(entity) {
            Some(PendingKind::Insert) => return Ok(Registered::Merged(PendingKind::Insert)),
            Some(PendingKind::Update) => return Ok(Registered::Merged(PendingKind::Update)),
            Some(PendingKind::Delete) => {
                tracing::debug!("Ignoring dirty registration of an instance pending deletion");
                return Ok(Registered::Ignored);
            }
            None => {}
        }

        let (ty, id) = {
            let guard = read_entity(entity);
            (guard.entity_type(), guard.id())
        };
        let tracked = id.is_some_and(|id| identity.is_managed(&ObjectKey::new(ty.name, id), entity));
        if !tracked {
            return Err(Error::state(
                StateErrorKind::NotTracked,
                ty.name,
                "instance is not tracked by this session",
            ));
        }
        tracing::trace!(entity = ty.name, ?id, "Queued UPDATE");
        Ok(self.queue(PendingKind::Update, entity))
    }

    /// Queue a DELETE. The instance stays readable in memory.
    pub fn register_deleted(&mut self, entity: &EntityRef) -> Result<Registered> {
        let (ty, id) = {
            let guard = read_entity(entity);
            (guard.entity_type(), guard.id())
        };
        match self.kind_of(entity) {
            Some(PendingKind::Insert) => {
                self.forget(entity);
                tracing::debug!(entity = ty.name, "INSERT and DELETE cancelled out");
                Ok(Registered::Cancelled)
            }
            Some(PendingKind::Delete) => Ok(Registered::Merged(PendingKind::Delete)),
            Some(PendingKind::Update) | None => {
                if id.is_none() {
                    tracing::debug!(entity = ty.name, "Ignoring delete of an unsaved instance");
                    return Ok(Registered::Ignored);
                }
                tracing::trace!(entity = ty.name, ?id, "Queued DELETE");
                Ok(self.queue(PendingKind::Delete, entity))
            }
        }
    }

    pub fn kind_of(&self, entity: &EntityRef) -> Option<PendingKind> {
        self.ops.get(&InstanceKey::of(entity)).map(|op| op.kind)
    }

    pub fn is_pending_delete(&self, entity: &EntityRef) -> bool {
        self.kind_of(entity) == Some(PendingKind::Delete)
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.ops.contains_key(&InstanceKey::of(entity))
    }

    fn forget(&mut self, entity: &EntityRef) {
        let key = InstanceKey::of(entity);
        if self.ops.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
    }

    /// Pending operations in registration order.
    pub fn ops(&self) -> impl Iterator<Item = &PendingOp> {
        self.order.iter().filter_map(|k| self.ops.get(k))
    }

    /// Pending operations of one kind, in registration order.
    pub fn ops_of(&self, kind: PendingKind) -> Vec<PendingOp> {
        self.ops().filter(|op| op.kind == kind).cloned().collect()
    }

    pub fn counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for op in self.ops.values() {
            match op.kind {
                PendingKind::Insert => counts.inserts += 1,
                PendingKind::Update => counts.updates += 1,
                PendingKind::Delete => counts.deletes += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every pending operation without touching the store.
    pub fn clear(&mut self) {
        self.order.clear();
        self.ops.clear();
    }
}
