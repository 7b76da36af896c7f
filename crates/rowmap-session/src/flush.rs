//! Flush ordering and execution for rowmap sessions.
//!
//! A commit turns the unit of work into a [`FlushPlan`] and runs it against
//! the row store in this order:
//!
//! 1. INSERT, parents first (an instance referenced through a foreign key is
//!    inserted before the instance holding the key)
//! 2. fix-up UPDATEs for foreign keys deferred to break insert cycles
//! 3. UPDATE, in registration order
//! 4. link table inserts and deletes
//! 5. UPDATEs nulling foreign keys to break delete cycles
//! 6. DELETE, children first
//!
//! Ties keep registration order. The first failing write aborts the flush;
//! the error lists every write already applied.

use crate::unit_of_work::{InstanceKey, PendingKind, PendingOp, UnitOfWork};
use rowmap_cache::SecondLevelCache;
use rowmap_core::{
    AppliedOp, EntityId, EntityRef, EntityType, Error, FlushError, ForeignKey, LinkTableInfo,
    OpKind, Resolved, Result, Row, RowStore, StateErrorKind, StoreError, StoreErrorKind, Value,
    WriteStatus, entity_id, read_entity, resolve, snapshot, write_entity,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One write in a flush plan.
pub enum FlushStep {
    /// INSERT with `deferred` foreign keys written NULL.
    Insert {
        entity: EntityRef,
        entity_type: &'static EntityType,
        deferred: Vec<&'static str>,
    },
    /// UPDATE writing foreign keys deferred by an insert.
    FixUp {
        entity: EntityRef,
        entity_type: &'static EntityType,
        columns: Vec<&'static str>,
    },
    Update {
        entity: EntityRef,
        entity_type: &'static EntityType,
    },
    Link {
        link: LinkTableInfo,
        entity_type: &'static EntityType,
        owner: EntityRef,
        target: EntityRef,
    },
    Unlink {
        link: LinkTableInfo,
        entity_type: &'static EntityType,
        owner: EntityId,
        target: EntityId,
    },
    /// UPDATE nulling foreign keys before a cyclic delete.
    Detach {
        entity: EntityRef,
        entity_type: &'static EntityType,
        columns: Vec<&'static str>,
    },
    Delete {
        entity: EntityRef,
        entity_type: &'static EntityType,
    },
}

impl FlushStep {
    pub fn entity_type(&self) -> &'static EntityType {
        match self {
            FlushStep::Insert { entity_type, .. }
            | FlushStep::FixUp { entity_type, .. }
            | FlushStep::Update { entity_type, .. }
            | FlushStep::Link { entity_type, .. }
            | FlushStep::Unlink { entity_type, .. }
            | FlushStep::Detach { entity_type, .. }
            | FlushStep::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn op_kind(&self) -> OpKind {
        match self {
            FlushStep::Insert { .. } => OpKind::Insert,
            FlushStep::FixUp { .. } | FlushStep::Update { .. } | FlushStep::Detach { .. } => {
                OpKind::Update
            }
            FlushStep::Link { .. } => OpKind::Link,
            FlushStep::Unlink { .. } => OpKind::Unlink,
            FlushStep::Delete { .. } => OpKind::Delete,
        }
    }

    /// Key of the row this step writes (the owner, for link steps).
    fn subject_id(&self) -> Option<EntityId> {
        match self {
            FlushStep::Insert { entity, .. }
            | FlushStep::FixUp { entity, .. }
            | FlushStep::Update { entity, .. }
            | FlushStep::Detach { entity, .. }
            | FlushStep::Delete { entity, .. } => entity_id(entity),
            FlushStep::Link { owner, .. } => entity_id(owner),
            FlushStep::Unlink { owner, .. } => Some(*owner),
        }
    }

    fn describe(&self) -> AppliedOp {
        AppliedOp {
            kind: self.op_kind(),
            entity: self.entity_type().name,
            id: self.subject_id(),
        }
    }
}

impl fmt::Debug for FlushStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlushStep::Insert { deferred, .. } if !deferred.is_empty() => "Insert(deferred)",
            FlushStep::Insert { .. } => "Insert",
            FlushStep::FixUp { .. } => "FixUp",
            FlushStep::Update { .. } => "Update",
            FlushStep::Link { .. } => "Link",
            FlushStep::Unlink { .. } => "Unlink",
            FlushStep::Detach { .. } => "Detach",
            FlushStep::Delete { .. } => "Delete",
        };
        write!(f, "{}({}", label, self.entity_type().name)?;
        match self.subject_id() {
            Some(id) => write!(f, "#{})", id),
            None => f.write_str("#<new>)"),
        }
    }
}

/// Counts of writes performed by one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub soft_deleted: usize,
    pub linked: usize,
    pub unlinked: usize,
    /// Operations added by cascade expansion.
    pub cascaded: usize,
}

impl FlushSummary {
    /// Row and link writes, excluding cascade bookkeeping.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.soft_deleted + self.linked + self.unlinked
    }
}

/// Options that change how individual writes are judged.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    /// Treat a DELETE of a missing row as a failure instead of a no-op.
    pub delete_missing_is_error: bool,
}

/// A row written by a flush and the cache version drawn just before the
/// store write.
#[derive(Debug, Clone)]
pub struct Written {
    pub entity: EntityRef,
    pub version: u64,
}

/// What a successful flush wrote.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub summary: FlushSummary,
    pub applied: Vec<AppliedOp>,
    /// Rows inserted or updated, in write order.
    pub written: Vec<Written>,
    /// Rows deleted or soft-deleted.
    pub removed: Vec<(&'static str, EntityId)>,
}

/// An ordered list of writes for one commit.
#[derive(Debug, Default)]
pub struct FlushPlan {
    steps: Vec<FlushStep>,
    /// Owning link relationships whose stored links change with this plan.
    link_owners: Vec<(EntityRef, &'static str)>,
}

/// An ordering constraint: `before` is written before `after`.
///
/// `holder` owns `column`; nulling that column removes the constraint.
#[derive(Debug, Clone, Copy)]
struct Dep {
    before: usize,
    after: usize,
    holder: usize,
    column: &'static str,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[FlushStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Order the pending operations of `uow` into a plan.
    ///
    /// `live` lists managed instances; their owning many-to-many fields are
    /// diffed against stored links. Owners pending deletion have their link
    /// fields resolved here, which may load through the session.
    ///
    /// Fails with [`StateErrorKind::TransientReference`] if a written
    /// foreign key or link points at an unsaved instance that is not being
    /// inserted.
    #[tracing::instrument(level = "debug", skip_all, fields(pending = uow.len()))]
    pub fn build(uow: &UnitOfWork, live: &[EntityRef]) -> Result<Self> {
        let mut plan = Self::new();
        let inserts = uow.ops_of(PendingKind::Insert);
        let updates = uow.ops_of(PendingKind::Update);
        let deletes = uow.ops_of(PendingKind::Delete);

        let insert_index: HashMap<InstanceKey, usize> = inserts
            .iter()
            .enumerate()
            .map(|(i, op)| (InstanceKey::of(&op.entity), i))
            .collect();

        // Inserts, parents first.
        let mut deferred: Vec<Vec<&'static str>> = vec![Vec::new(); inserts.len()];
        let mut deps = Vec::new();
        for (i, op) in inserts.iter().enumerate() {
            let foreign_keys = read_entity(&op.entity).foreign_keys();
            for (column, fk) in foreign_keys {
                let ForeignKey::Target(target) = fk else {
                    continue;
                };
                match insert_index.get(&InstanceKey::of(&target)) {
                    Some(&j) if j == i => deferred[i].push(column),
                    Some(&j) => deps.push(Dep {
                        before: j,
                        after: i,
                        holder: i,
                        column,
                    }),
                    None => ensure_persisted(op.entity_type, column, &target)?,
                }
            }
        }
        let (order, broken) = topological_order(inserts.len(), &deps);
        for dep in broken {
            tracing::debug!(
                entity = inserts[dep.holder].entity_type.name,
                column = dep.column,
                "Deferring foreign key to break an insert cycle"
            );
            deferred[dep.holder].push(dep.column);
        }
        for &i in &order {
            plan.steps.push(FlushStep::Insert {
                entity: Arc::clone(&inserts[i].entity),
                entity_type: inserts[i].entity_type,
                deferred: deferred[i].clone(),
            });
        }
        for &i in &order {
            if !deferred[i].is_empty() {
                plan.steps.push(FlushStep::FixUp {
                    entity: Arc::clone(&inserts[i].entity),
                    entity_type: inserts[i].entity_type,
                    columns: deferred[i].clone(),
                });
            }
        }

        for op in &updates {
            let foreign_keys = read_entity(&op.entity).foreign_keys();
            for (column, fk) in foreign_keys {
                if let ForeignKey::Target(target) = fk {
                    if !insert_index.contains_key(&InstanceKey::of(&target)) {
                        ensure_persisted(op.entity_type, column, &target)?;
                    }
                }
            }
            plan.steps.push(FlushStep::Update {
                entity: Arc::clone(&op.entity),
                entity_type: op.entity_type,
            });
        }

        plan.plan_links(uow, live, &insert_index)?;
        plan.plan_link_removals(&deletes)?;

        // Deletes, children first. Only physical deletes constrain order.
        let delete_index: HashMap<(&'static str, EntityId), usize> = deletes
            .iter()
            .enumerate()
            .filter_map(|(i, op)| Some(((op.entity_type.name, entity_id(&op.entity)?), i)))
            .collect();
        let mut deps = Vec::new();
        for (i, op) in deletes.iter().enumerate() {
            let foreign_keys = read_entity(&op.entity).foreign_keys();
            for (column, fk) in foreign_keys {
                let Some(rel) = op.entity_type.relationship_by_local_key(column) else {
                    continue;
                };
                let Some(target_id) = fk.current_id() else {
                    continue;
                };
                let Some(&j) = delete_index.get(&(rel.target, target_id)) else {
                    continue;
                };
                if j != i && !deletes[j].entity_type.is_soft_deletable() {
                    deps.push(Dep {
                        before: i,
                        after: j,
                        holder: i,
                        column,
                    });
                }
            }
        }
        let (order, broken) = topological_order(deletes.len(), &deps);
        let mut detach: Vec<Vec<&'static str>> = vec![Vec::new(); deletes.len()];
        for dep in broken {
            detach[dep.holder].push(dep.column);
        }
        for (i, columns) in detach.into_iter().enumerate() {
            if !columns.is_empty() {
                tracing::debug!(
                    entity = deletes[i].entity_type.name,
                    ?columns,
                    "Nulling foreign keys to break a delete cycle"
                );
                plan.steps.push(FlushStep::Detach {
                    entity: Arc::clone(&deletes[i].entity),
                    entity_type: deletes[i].entity_type,
                    columns,
                });
            }
        }
        for i in order {
            plan.steps.push(FlushStep::Delete {
                entity: Arc::clone(&deletes[i].entity),
                entity_type: deletes[i].entity_type,
            });
        }

        tracing::debug!(steps = plan.steps.len(), "Flush plan built");
        Ok(plan)
    }

    /// Link and unlink steps for owning many-to-many fields of live instances.
    fn plan_links(
        &mut self,
        uow: &UnitOfWork,
        live: &[EntityRef],
        insert_index: &HashMap<InstanceKey, usize>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let owners = live
            .iter()
            .chain(uow.ops().filter(|op| op.kind != PendingKind::Delete).map(|op| &op.entity));

        for owner in owners {
            if !seen.insert(InstanceKey::of(owner)) || uow.is_pending_delete(owner) {
                continue;
            }
            let (ty, owner_id, fields) = {
                let guard = read_entity(owner);
                let fields: Vec<_> = guard
                    .relations()
                    .filter(|lazy| lazy.relationship().writes_association())
                    .filter_map(|lazy| {
                        let link = lazy.relationship().link_table?;
                        let Resolved::Many(members) = lazy.resolved()? else {
                            return None;
                        };
                        let stored = lazy.loaded_links().map(<[EntityId]>::to_vec).unwrap_or_default();
                        Some((lazy.relationship().name, link, members.clone(), stored))
                    })
                    .collect();
                (guard.entity_type(), guard.id(), fields)
            };

            for (field, link, members, stored) in fields {
                let mut current = HashSet::new();
                let mut changed = false;
                for target in members {
                    match entity_id(&target) {
                        Some(id) => {
                            current.insert(id);
                            if stored.contains(&id) {
                                continue;
                            }
                        }
                        None if insert_index.contains_key(&InstanceKey::of(&target)) => {}
                        None => return Err(transient(ty, field)),
                    }
                    changed = true;
                    self.steps.push(FlushStep::Link {
                        link,
                        entity_type: ty,
                        owner: Arc::clone(owner),
                        target,
                    });
                }
                if let Some(owner_id) = owner_id {
                    for &gone in stored.iter().filter(|id| !current.contains(*id)) {
                        changed = true;
                        self.steps.push(FlushStep::Unlink {
                            link,
                            entity_type: ty,
                            owner: owner_id,
                            target: gone,
                        });
                    }
                }
                if changed {
                    self.link_owners.push((Arc::clone(owner), field));
                }
            }
        }
        Ok(())
    }

    /// Unlink every stored link of instances being deleted.
    fn plan_link_removals(&mut self, deletes: &[PendingOp]) -> Result<()> {
        let mut seen = HashSet::new();
        for op in deletes {
            // A soft-deleted row keeps its links.
            if op.entity_type.is_soft_deletable() {
                continue;
            }
            let Some(owner_id) = entity_id(&op.entity) else {
                continue;
            };
            for rel in op.entity_type.relationships {
                let Some(link) = rel.link_table else {
                    continue;
                };
                resolve(&op.entity, rel.name)?;
                let stored: Vec<EntityId> = read_entity(&op.entity)
                    .relation(rel.name)?
                    .loaded_links()
                    .map(<[EntityId]>::to_vec)
                    .unwrap_or_default();
                for target in stored {
                    // Both sides of a link can be deleted in one commit.
                    let row = if link.local_column <= link.remote_column {
                        (link.table_name, owner_id, target)
                    } else {
                        (link.table_name, target, owner_id)
                    };
                    if seen.insert(row) {
                        self.steps.push(FlushStep::Unlink {
                            link,
                            entity_type: op.entity_type,
                            owner: owner_id,
                            target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every step against `store`, stopping at the first failure.
    pub fn execute(&self, store: &dyn RowStore, options: FlushOptions) -> Result<FlushOutcome> {
        self.execute_versioned(store, options, None)
    }

    /// Like [`FlushPlan::execute`], stamping each row write with a version
    /// drawn from `versions` immediately before the write reaches the store.
    #[tracing::instrument(level = "debug", skip_all, fields(steps = self.steps.len()))]
    pub fn execute_versioned(
        &self,
        store: &dyn RowStore,
        options: FlushOptions,
        versions: Option<&SecondLevelCache>,
    ) -> Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        for step in &self.steps {
            if let Err(source) = apply(step, store, options, versions, &mut outcome) {
                let failed = step.describe();
                tracing::warn!(
                    %failed,
                    applied = outcome.applied.len(),
                    error = %source,
                    "Flush aborted"
                );
                return Err(Error::Flush(FlushError {
                    applied: outcome.applied,
                    failed,
                    source: Box::new(source),
                }));
            }
            outcome.applied.push(step.describe());
        }
        self.record_links();
        Ok(outcome)
    }

    /// Remember the now-stored links of every changed link field.
    fn record_links(&self) {
        for (owner, field) in &self.link_owners {
            let members = match read_entity(owner).relation(field).map(|l| l.resolved().cloned()) {
                Ok(Some(resolved)) => resolved.refs(),
                _ => continue,
            };
            let ids = members.iter().filter_map(entity_id).collect();
            if let Ok(lazy) = write_entity(owner).relation_mut(field) {
                lazy.set_loaded_links(ids);
            }
        }
    }
}

fn apply(
    step: &FlushStep,
    store: &dyn RowStore,
    options: FlushOptions,
    versions: Option<&SecondLevelCache>,
    outcome: &mut FlushOutcome,
) -> Result<()> {
    match step {
        FlushStep::Insert {
            entity,
            entity_type,
            deferred,
        } => {
            stamp_insert(entity, entity_type)?;
            let mut row = snapshot(entity);
            for column in deferred {
                row.set(column, Value::Null);
            }
            let version = versions.map_or(0, SecondLevelCache::next_version);
            let id = store.insert(entity_type, &row)?;
            outcome.summary.inserted += 1;
            outcome.written.push(Written {
                entity: Arc::clone(entity),
                version,
            });
            if let Err(err) = write_entity(entity).assign_id(id) {
                // The row is stored; report it as applied with its key.
                outcome.applied.push(AppliedOp {
                    kind: OpKind::Insert,
                    entity: entity_type.name,
                    id: Some(id),
                });
                return Err(err);
            }
            tracing::trace!(entity = entity_type.name, %id, "Inserted");
        }
        FlushStep::FixUp {
            entity,
            entity_type,
            columns,
        } => {
            let full = snapshot(entity);
            let row = Row::from_pairs(
                columns
                    .iter()
                    .map(|c| (*c, full.get(c).cloned().unwrap_or(Value::Null))),
            );
            update_existing(store, entity_type, entity, &row)?;
        }
        FlushStep::Update {
            entity,
            entity_type,
        } => {
            if let Some(column) = entity_type.updated_timestamp {
                set_column(entity, entity_type, column, Value::now())?;
            }
            let row = snapshot(entity);
            let version = versions.map_or(0, SecondLevelCache::next_version);
            update_existing(store, entity_type, entity, &row)?;
            outcome.summary.updated += 1;
            outcome.written.push(Written {
                entity: Arc::clone(entity),
                version,
            });
        }
        FlushStep::Link {
            link,
            entity_type,
            owner,
            target,
        } => {
            let (Some(owner_id), Some(target_id)) = (entity_id(owner), entity_id(target)) else {
                return Err(transient(entity_type, link.table_name));
            };
            store.insert_link(link, owner_id, target_id)?;
            outcome.summary.linked += 1;
        }
        FlushStep::Unlink {
            link,
            owner,
            target,
            ..
        } => {
            match store.delete_link(link, *owner, *target)? {
                WriteStatus::Applied => outcome.summary.unlinked += 1,
                WriteStatus::NotFound => tracing::warn!(
                    table = link.table_name,
                    %owner,
                    %target,
                    "Link row to delete was already gone"
                ),
            }
        }
        FlushStep::Detach {
            entity,
            entity_type,
            columns,
        } => {
            let Some(id) = entity_id(entity) else {
                return Ok(());
            };
            let row = Row::from_pairs(columns.iter().map(|c| (*c, Value::Null)));
            if store.update(entity_type, id, &row)? == WriteStatus::NotFound {
                tracing::warn!(entity = entity_type.name, %id, "Row to detach was already gone");
            }
        }
        FlushStep::Delete {
            entity,
            entity_type,
        } => {
            let Some(id) = entity_id(entity) else {
                return Ok(());
            };
            match store.delete(entity_type, id)? {
                WriteStatus::Applied => {}
                WriteStatus::NotFound if options.delete_missing_is_error => {
                    return Err(row_missing(entity_type, id));
                }
                WriteStatus::NotFound => {
                    tracing::warn!(entity = entity_type.name, %id, "Row to delete was already gone");
                    outcome.removed.push((entity_type.name, id));
                    return Ok(());
                }
            }
            if let Some(flag) = entity_type.soft_delete {
                set_column(entity, entity_type, flag, Value::Bool(true))?;
                outcome.summary.soft_deleted += 1;
            } else {
                outcome.summary.deleted += 1;
            }
            outcome.removed.push((entity_type.name, id));
        }
    }
    Ok(())
}

/// Fill timestamp columns and default the soft-delete flag before INSERT.
fn stamp_insert(entity: &EntityRef, entity_type: &'static EntityType) -> Result<()> {
    let now = Value::now();
    if let Some(column) = entity_type.created_timestamp {
        set_column(entity, entity_type, column, now.clone())?;
    }
    if let Some(column) = entity_type.updated_timestamp {
        set_column(entity, entity_type, column, now)?;
    }
    if let Some(flag) = entity_type.soft_delete {
        let field = field_name(entity_type, flag)?;
        let mut guard = write_entity(entity);
        if guard.get(field)?.is_null() {
            guard.set(field, Value::Bool(false))?;
        }
    }
    Ok(())
}

fn set_column(
    entity: &EntityRef,
    entity_type: &'static EntityType,
    column: &str,
    value: Value,
) -> Result<()> {
    let field = field_name(entity_type, column)?;
    write_entity(entity).set(field, value)
}

fn field_name(entity_type: &'static EntityType, column: &str) -> Result<&'static str> {
    entity_type
        .column_by_name(column)
        .map(|c| c.name)
        .ok_or_else(|| {
            Error::state(
                StateErrorKind::UnknownField,
                entity_type.name,
                format!("no column '{}'", column),
            )
        })
}

fn update_existing(
    store: &dyn RowStore,
    entity_type: &'static EntityType,
    entity: &EntityRef,
    row: &Row,
) -> Result<()> {
    let Some(id) = entity_id(entity) else {
        return Err(transient(entity_type, entity_type.primary_key));
    };
    match store.update(entity_type, id, row)? {
        WriteStatus::Applied => Ok(()),
        WriteStatus::NotFound => Err(row_missing(entity_type, id)),
    }
}

fn row_missing(entity_type: &EntityType, id: EntityId) -> Error {
    Error::Store(StoreError {
        kind: StoreErrorKind::RowMissing,
        table: Some(entity_type.table.to_string()),
        message: format!("no {} row with key {}", entity_type.name, id),
        source: None,
    })
}

fn transient(entity_type: &'static EntityType, via: &str) -> Error {
    Error::state(
        StateErrorKind::TransientReference,
        entity_type.name,
        format!("'{}' references an unsaved instance that is not being saved", via),
    )
}

fn ensure_persisted(entity_type: &'static EntityType, column: &str, target: &EntityRef) -> Result<()> {
    if entity_id(target).is_some() {
        Ok(())
    } else {
        Err(transient(entity_type, column))
    }
}

/// Kahn's algorithm over `deps`, lowest index first among ready nodes.
///
/// When every remaining node waits on another, the lowest-index node that
/// holds a constraint has all its held constraints removed. Returns the
/// order and the removed constraints.
fn topological_order(count: usize, deps: &[Dep]) -> (Vec<usize>, Vec<Dep>) {
    let mut active = vec![true; deps.len()];
    let mut waiting = vec![0usize; count];
    for dep in deps {
        waiting[dep.after] += 1;
    }
    let mut done = vec![false; count];
    let mut order = Vec::with_capacity(count);
    let mut broken = Vec::new();

    while order.len() < count {
        if let Some(node) = (0..count).find(|&i| !done[i] && waiting[i] == 0) {
            done[node] = true;
            order.push(node);
            for (k, dep) in deps.iter().enumerate() {
                if active[k] && dep.before == node {
                    active[k] = false;
                    waiting[dep.after] -= 1;
                }
            }
            continue;
        }

        let victim = (0..count).find(|&i| {
            !done[i]
                && deps
                    .iter()
                    .enumerate()
                    .any(|(k, dep)| active[k] && dep.holder == i)
        });
        let Some(victim) = victim else {
            order.extend((0..count).filter(|&i| !done[i]));
            break;
        };
        for (k, dep) in deps.iter().enumerate() {
            if active[k] && dep.holder == victim {
                active[k] = false;
                waiting[dep.after] -= 1;
                broken.push(*dep);
            }
        }
    }
    (order, broken)
}
