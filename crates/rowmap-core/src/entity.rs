//! Entity instances and shared entity handles.
//!
//! An [`EntityInstance`] is the in-memory object for one row: scalar field
//! values plus one [`Lazy`] per relationship. Sessions hand out
//! [`EntityRef`]s (`Arc<RwLock<EntityInstance>>`) so that every holder of
//! the same identity observes the same object.
//!
//! Relationship traversal goes through the [`Related`] trait on
//! `EntityRef`, which resolves lazies without holding the instance lock
//! while the session loads targets.

use crate::error::{Error, Result, StateErrorKind, TypeError};
use crate::lazy::{Access, Lazy, LazyLoader, LazySource, Resolved, multiplicity_error, run_loader};
use crate::row::{FromValue, Row};
use crate::schema::{EntityType, Multiplicity, OwningSide};
use crate::value::{EntityId, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Shared handle to a session-managed entity instance.
pub type EntityRef = Arc<RwLock<EntityInstance>>;

/// Read-lock an entity, recovering from poisoning.
pub fn read_entity(entity: &EntityRef) -> RwLockReadGuard<'_, EntityInstance> {
    entity.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock an entity, recovering from poisoning.
pub fn write_entity(entity: &EntityRef) -> RwLockWriteGuard<'_, EntityInstance> {
    entity.write().unwrap_or_else(PoisonError::into_inner)
}

/// Primary key of an entity, if assigned.
pub fn entity_id(entity: &EntityRef) -> Option<EntityId> {
    read_entity(entity).id()
}

/// The value a foreign key column will be written with.
#[derive(Clone)]
pub enum ForeignKey {
    /// Known key (or NULL).
    Id(Option<EntityId>),
    /// Key of an instance that may not be persisted yet.
    Target(EntityRef),
}

impl ForeignKey {
    /// Current key, reading the target's lock if needed.
    pub fn current_id(&self) -> Option<EntityId> {
        match self {
            ForeignKey::Id(id) => *id,
            ForeignKey::Target(target) => entity_id(target),
        }
    }
}

/// The in-memory object for one stored row.
#[derive(Clone)]
pub struct EntityInstance {
    entity_type: &'static EntityType,
    id: Option<EntityId>,
    values: BTreeMap<&'static str, Value>,
    relations: BTreeMap<&'static str, Lazy>,
}

impl EntityInstance {
    /// A fresh, unkeyed instance with NULL fields and empty relationships.
    pub fn new(entity_type: &'static EntityType) -> Self {
        Self {
            entity_type,
            id: None,
            values: entity_type
                .columns
                .iter()
                .map(|c| (c.name, Value::Null))
                .collect(),
            relations: entity_type
                .relationships
                .iter()
                .map(|r| (r.name, Lazy::empty(r)))
                .collect(),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> EntityRef {
        Arc::new(RwLock::new(self))
    }

    /// Materialize an instance from a stored row.
    ///
    /// Relationships start unresolved and load through `loader` on first
    /// access; NULL foreign keys resolve immediately to nothing.
    pub fn from_row(
        entity_type: &'static EntityType,
        row: &Row,
        loader: &Weak<dyn LazyLoader>,
    ) -> Result<Self> {
        let id = row
            .get(entity_type.primary_key)
            .and_then(Value::as_entity_id)
            .ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "EntityId",
                    actual: format!("{:?}", row.get(entity_type.primary_key)),
                    column: Some(entity_type.primary_key.to_string()),
                })
            })?;

        let values = entity_type
            .columns
            .iter()
            .map(|c| (c.name, row.get(c.column_name).cloned().unwrap_or(Value::Null)))
            .collect();

        let relations = entity_type
            .relationships
            .iter()
            .map(|rel| {
                let lazy = match rel.owning_side() {
                    OwningSide::Local => {
                        let fk = rel
                            .local_key
                            .and_then(|col| row.get(col))
                            .and_then(Value::as_entity_id);
                        match fk {
                            Some(key) => Lazy::unresolved(rel, LazySource::Key(key), loader.clone()),
                            None => Lazy::empty(rel),
                        }
                    }
                    OwningSide::Remote => match rel.remote_key {
                        Some(column) => Lazy::unresolved(
                            rel,
                            LazySource::Column { column, owner: id },
                            loader.clone(),
                        ),
                        None => Lazy::empty(rel),
                    },
                    OwningSide::LinkTable => match rel.link_table {
                        Some(link) => Lazy::unresolved(
                            rel,
                            LazySource::Link { link, owner: id },
                            loader.clone(),
                        ),
                        None => Lazy::empty(rel),
                    },
                };
                (rel.name, lazy)
            })
            .collect();

        Ok(Self {
            entity_type,
            id: Some(id),
            values,
            relations,
        })
    }

    pub fn entity_type(&self) -> &'static EntityType {
        self.entity_type
    }

    pub fn id(&self) -> Option<EntityId> {
        self.id
    }

    /// Record the store-assigned key. Keys never change once assigned.
    pub fn assign_id(&mut self, id: EntityId) -> Result<()> {
        match self.id {
            None => {
                self.id = Some(id);
                Ok(())
            }
            Some(current) if current == id => Ok(()),
            Some(current) => Err(Error::state(
                StateErrorKind::KeyImmutable,
                self.entity_type.name,
                format!("key {} cannot change to {}", current, id),
            )),
        }
    }

    pub fn get(&self, field: &str) -> Result<&Value> {
        self.values
            .get(field)
            .ok_or_else(|| self.unknown_field(field))
    }

    pub fn get_as<T: FromValue>(&self, field: &str) -> Result<T> {
        T::from_value(self.get(field)?).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(field.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        if !self.values.contains_key(field) {
            return Err(self.unknown_field(field));
        }
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value.into();
        }
        Ok(())
    }

    fn unknown_field(&self, field: &str) -> Error {
        Error::state(
            StateErrorKind::UnknownField,
            self.entity_type.name,
            format!("no scalar field '{}'", field),
        )
    }

    /// Scalar values keyed by field name.
    pub fn values(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn relation(&self, name: &str) -> Result<&Lazy> {
        self.relations
            .get(name)
            .ok_or_else(|| self.unknown_relationship(name))
    }

    pub fn relation_mut(&mut self, name: &str) -> Result<&mut Lazy> {
        let entity = self.entity_type.name;
        self.relations.get_mut(name).ok_or_else(|| {
            Error::state(
                StateErrorKind::UnknownRelationship,
                entity,
                format!("no relationship '{}'", name),
            )
        })
    }

    fn unknown_relationship(&self, name: &str) -> Error {
        Error::state(
            StateErrorKind::UnknownRelationship,
            self.entity_type.name,
            format!("no relationship '{}'", name),
        )
    }

    pub fn relations(&self) -> impl Iterator<Item = &Lazy> {
        self.relations.values()
    }

    /// Primary key (if assigned) and scalar columns, keyed by column name.
    pub fn scalar_row(&self) -> Row {
        let mut row = Row::default();
        if let Some(id) = self.id {
            row.set(self.entity_type.primary_key, id.into());
        }
        for col in self.entity_type.columns {
            let value = self.values.get(col.name).cloned().unwrap_or(Value::Null);
            row.set(col.column_name, value);
        }
        row
    }

    /// Foreign key columns this instance writes, with their current sources.
    pub fn foreign_keys(&self) -> Vec<(&'static str, ForeignKey)> {
        self.relations
            .values()
            .filter_map(|lazy| {
                let column = lazy.relationship().local_key?;
                let fk = match lazy.resolved() {
                    Some(Resolved::One(Some(target))) => ForeignKey::Target(Arc::clone(target)),
                    Some(_) => ForeignKey::Id(None),
                    None => ForeignKey::Id(lazy.pending_key()),
                };
                Some((column, fk))
            })
            .collect()
    }

    /// Overwrite scalar values from another instance of the same type.
    pub fn copy_scalars_from(&mut self, other: &EntityInstance) {
        if std::ptr::eq(self.entity_type, other.entity_type) {
            self.values.clone_from(&other.values);
        }
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.entity_type.name)
            .field("id", &self.id)
            .field("values", &self.values)
            .field("relations", &self.relations)
            .finish()
    }
}

/// Full row for an entity: key, scalars and foreign keys.
///
/// Foreign keys of unsaved targets come out NULL.
pub fn snapshot(entity: &EntityRef) -> Row {
    let (mut row, fks) = {
        let guard = read_entity(entity);
        (guard.scalar_row(), guard.foreign_keys())
    };
    for (column, fk) in fks {
        row.set(column, fk.current_id().into());
    }
    row
}

/// Resolve a relationship, loading it through its session if needed.
///
/// The instance lock is released while the loader runs.
pub fn resolve(entity: &EntityRef, relationship: &str) -> Result<Resolved> {
    let (info, source, loader) = {
        let guard = read_entity(entity);
        let lazy = guard.relation(relationship)?;
        match lazy.access() {
            Access::Ready(resolved) => return Ok(resolved),
            Access::Load(source, loader) => (lazy.relationship(), source, loader),
        }
    };
    let loaded = run_loader(info, &source, &loader)?;
    let ids = loaded.iter().filter_map(entity_id).collect();
    let mut guard = write_entity(entity);
    Ok(guard.relation_mut(relationship)?.settle(loaded, ids))
}

/// Relationship navigation and mutation on shared entity handles.
///
/// Bidirectional relationships are not synchronized automatically: adding a
/// review to a course's `reviews` does not set the review's `course`. Only
/// the side that owns the foreign key or link row is written on flush.
pub trait Related {
    /// Target of a to-one relationship.
    fn one(&self, relationship: &str) -> Result<Option<EntityRef>>;

    /// Members of a to-many relationship.
    fn many(&self, relationship: &str) -> Result<Vec<EntityRef>>;

    /// Point a to-one relationship at `target` (or clear it).
    fn set_one(&self, relationship: &str, target: Option<&EntityRef>) -> Result<()>;

    /// Add `target` to a to-many relationship; no-op if already a member.
    fn add_to(&self, relationship: &str, target: &EntityRef) -> Result<()>;

    /// Remove `target` from a to-many relationship. Returns whether it was a member.
    fn remove_from(&self, relationship: &str, target: &EntityRef) -> Result<bool>;
}

impl Related for EntityRef {
    fn one(&self, relationship: &str) -> Result<Option<EntityRef>> {
        match resolve(self, relationship)? {
            Resolved::One(target) => Ok(target),
            Resolved::Many(_) => {
                let info = read_entity(self).relation(relationship)?.relationship();
                Err(multiplicity_error(info, Multiplicity::Many))
            }
        }
    }

    fn many(&self, relationship: &str) -> Result<Vec<EntityRef>> {
        match resolve(self, relationship)? {
            Resolved::Many(members) => Ok(members),
            Resolved::One(_) => {
                let info = read_entity(self).relation(relationship)?.relationship();
                Err(multiplicity_error(info, Multiplicity::One))
            }
        }
    }

    fn set_one(&self, relationship: &str, target: Option<&EntityRef>) -> Result<()> {
        let mut guard = write_entity(self);
        guard
            .relation_mut(relationship)?
            .assign(Resolved::One(target.cloned()))
    }

    fn add_to(&self, relationship: &str, target: &EntityRef) -> Result<()> {
        resolve(self, relationship)?;
        let mut guard = write_entity(self);
        let members = guard.relation_mut(relationship)?.many_mut()?;
        if !members.iter().any(|m| Arc::ptr_eq(m, target)) {
            members.push(Arc::clone(target));
        }
        Ok(())
    }

    fn remove_from(&self, relationship: &str, target: &EntityRef) -> Result<bool> {
        resolve(self, relationship)?;
        let mut guard = write_entity(self);
        let members = guard.relation_mut(relationship)?.many_mut()?;
        let before = members.len();
        members.retain(|m| !Arc::ptr_eq(m, target));
        Ok(members.len() != before)
    }
}
