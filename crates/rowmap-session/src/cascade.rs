//! Cascade expansion of the pending set at commit.
//!
//! Save cascades start from every live or pending instance and follow
//! resolved relationship fields whose policy cascades saves: every unsaved
//! target reached this way gets an INSERT. Delete
//! cascades follow `SaveAndDelete` fields from every pending DELETE,
//! loading the targets if needed, and queue a DELETE for each target that
//! no other live instance still references.
//!
//! Both walks are breadth-first with a visited set keyed by instance
//! identity, so graphs with cycles (a course and its reviews pointing at
//! each other) terminate with each instance queued at most once. A step
//! counter bounds the walk; when it trips, expansion stops with a warning
//! and the commit carries on with what was queued so far.

use crate::unit_of_work::{InstanceKey, PendingKind, Registered, UnitOfWork};
use rowmap_core::{EntityRef, Result, entity_id, read_entity, resolve};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// What a cascade pass added to the pending set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// INSERTs added by save cascades.
    pub saved: usize,
    /// DELETEs added by delete cascades (including cancelled inserts).
    pub deleted: usize,
    /// Instances visited.
    pub steps: usize,
    pub guard_tripped: bool,
}

impl CascadeReport {
    fn step(&mut self, limit: usize) -> bool {
        self.steps += 1;
        if self.steps > limit {
            if !self.guard_tripped {
                tracing::warn!(limit, "Cascade step limit reached; stopping expansion");
            }
            self.guard_tripped = true;
            return false;
        }
        true
    }
}

/// Expands a unit of work along cascading relationships.
#[derive(Debug, Clone, Copy)]
pub struct CascadeResolver {
    step_limit: usize,
}

impl CascadeResolver {
    pub fn new(step_limit: usize) -> Self {
        Self { step_limit }
    }

    /// Run save then delete cascades over `uow`.
    ///
    /// `live` lists the instances the session tracks. They seed the save
    /// walk and decide whether a delete-cascade target is still referenced.
    #[tracing::instrument(level = "debug", skip_all, fields(pending = uow.len()))]
    pub fn expand(&self, uow: &mut UnitOfWork, live: &[EntityRef]) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();
        self.cascade_saves(uow, live, &mut report)?;
        if !report.guard_tripped {
            self.cascade_deletes(uow, live, &mut report)?;
        }
        tracing::debug!(
            saved = report.saved,
            deleted = report.deleted,
            steps = report.steps,
            "Cascade expansion complete"
        );
        Ok(report)
    }

    fn cascade_saves(
        &self,
        uow: &mut UnitOfWork,
        live: &[EntityRef],
        report: &mut CascadeReport,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<EntityRef> = uow
            .ops()
            .filter(|op| op.kind != PendingKind::Delete)
            .map(|op| Arc::clone(&op.entity))
            .chain(live.iter().filter(|e| !uow.is_pending_delete(e)).cloned())
            .collect();

        while let Some(entity) = queue.pop_front() {
            if !visited.insert(InstanceKey::of(&entity)) {
                continue;
            }
            if !report.step(self.step_limit) {
                return Ok(());
            }
            for target in save_targets(&entity) {
                if uow.is_pending_delete(&target) {
                    continue;
                }
                if entity_id(&target).is_none() && !uow.contains(&target) {
                    uow.register_new(&target)?;
                    report.saved += 1;
                }
                if !visited.contains(&InstanceKey::of(&target)) {
                    queue.push_back(target);
                }
            }
        }
        Ok(())
    }

    fn cascade_deletes(
        &self,
        uow: &mut UnitOfWork,
        live: &[EntityRef],
        report: &mut CascadeReport,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<EntityRef> = uow
            .ops()
            .filter(|op| op.kind == PendingKind::Delete)
            .map(|op| Arc::clone(&op.entity))
            .collect();

        while let Some(owner) = queue.pop_front() {
            if !visited.insert(InstanceKey::of(&owner)) {
                continue;
            }
            if !report.step(self.step_limit) {
                return Ok(());
            }
            let ty = read_entity(&owner).entity_type();
            for rel in ty.relationships.iter().filter(|r| r.cascade.cascades_delete()) {
                for target in resolve(&owner, rel.name)?.refs() {
                    if uow.is_pending_delete(&target) {
                        continue;
                    }
                    if referenced_elsewhere(&target, &owner, live, uow) {
                        tracing::debug!(
                            relationship = rel.name,
                            "Delete cascade skipped a target that is still referenced"
                        );
                        continue;
                    }
                    match uow.register_deleted(&target)? {
                        Registered::Queued(_) => {
                            report.deleted += 1;
                            queue.push_back(target);
                        }
                        Registered::Cancelled => report.deleted += 1,
                        Registered::Merged(_) | Registered::Ignored => {}
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolved targets of relationships that cascade saves.
fn save_targets(entity: &EntityRef) -> Vec<EntityRef> {
    let guard = read_entity(entity);
    guard
        .relations()
        .filter(|lazy| lazy.relationship().cascade.cascades_save())
        .filter_map(|lazy| lazy.resolved())
        .flat_map(|resolved| resolved.refs())
        .collect()
}

/// Does any live instance other than `owner` still point at `target`?
fn referenced_elsewhere(
    target: &EntityRef,
    owner: &EntityRef,
    live: &[EntityRef],
    uow: &UnitOfWork,
) -> bool {
    let (target_type, target_id) = {
        let guard = read_entity(target);
        (guard.entity_type().name, guard.id())
    };
    let pending = uow
        .ops()
        .filter(|op| op.kind != PendingKind::Delete)
        .map(|op| &op.entity);

    live.iter().chain(pending).any(|candidate| {
        if Arc::ptr_eq(candidate, owner)
            || Arc::ptr_eq(candidate, target)
            || uow.is_pending_delete(candidate)
        {
            return false;
        }
        let guard = read_entity(candidate);
        guard.relations().any(|lazy| match lazy.resolved() {
            Some(resolved) => resolved.refs().iter().any(|r| Arc::ptr_eq(r, target)),
            None => {
                lazy.relationship().target == target_type
                    && target_id.is_some()
                    && lazy.pending_key() == target_id
            }
        })
    })
}
