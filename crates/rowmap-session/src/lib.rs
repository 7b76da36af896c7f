//! Session and Unit of Work for rowmap.
//!
//! `rowmap-session` is the **unit-of-work layer**. A [`Session`] is one
//! logical transaction: it owns an identity map, a unit of work and a set of
//! load-time snapshots, and turns them into ordered row-store writes at
//! commit.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per `(type, key)` per session.
//! - **Lazy loading**: the session is the [`LazyLoader`] behind every
//!   unresolved relationship of the instances it hands out.
//! - **Unit of work**: inserts, updates and deletes are deferred to commit,
//!   expanded along cascading relationships and flushed in dependency order.
//! - **Soft delete**: reads and deletes go through [`SoftDeleteFilter`].
//! - **Second-level cache**: an optional shared [`SecondLevelCache`] is read
//!   on identity-map misses and refreshed after a successful commit.
//!
//! # Example
//!
//! ```
//! use rowmap_core::{ColumnInfo, EntityType, Schema, SqlType, read_entity};
//! use rowmap_memory::MemoryStore;
//! use rowmap_session::SessionFactory;
//! use std::sync::Arc;
//!
//! static COURSE: EntityType = EntityType::new("Course", "CourseDetails")
//!     .columns(&[ColumnInfo::new("name", "courseName", SqlType::Text)]);
//!
//! let schema = Arc::new(Schema::builder().register(&COURSE).build().unwrap());
//! let factory = SessionFactory::new(schema, Arc::new(MemoryStore::new()));
//!
//! let mut session = factory.open();
//! let course = session.new_entity("Course").unwrap().with("name", "JPA").unwrap().into_ref();
//! session.save(&course).unwrap();
//! session.commit().unwrap();
//!
//! let id = read_entity(&course).id().unwrap();
//! let session = factory.open();
//! assert!(session.find("Course", id).unwrap().is_some());
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod flush;
pub mod identity_map;
pub mod soft_delete;
pub mod unit_of_work;

pub use cascade::{CascadeReport, CascadeResolver};
pub use change_tracker::ChangeTracker;
pub use flush::{FlushOptions, FlushOutcome, FlushPlan, FlushStep, FlushSummary, Written};
pub use identity_map::{IdentityMap, ObjectKey};
pub use soft_delete::{SoftDeleteFilter, is_soft_deleted, soft_delete_row};
pub use unit_of_work::{
    InstanceKey, PendingCounts, PendingKind, PendingOp, Registered, UnitOfWork,
};

use rowmap_cache::{PutOutcome, SecondLevelCache};
use rowmap_core::{
    EntityId, EntityInstance, EntityRef, EntityType, Error, ForeignKey, LazyLoader, LazySource,
    Result, Row, RowStore, Schema, SessionPhase, StateErrorKind, Value, entity_id, read_entity,
    snapshot, write_entity,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Read through the second-level cache on identity-map misses.
    pub use_second_level_cache: bool,
    /// Store committed rows in the cache (otherwise just invalidate them).
    pub refresh_cache_on_commit: bool,
    /// Maximum instances visited by cascade expansion per commit.
    pub cascade_step_limit: usize,
    /// Fail the commit when a DELETE finds no row.
    pub delete_missing_is_error: bool,
    /// Compare managed instances against their load-time snapshots at
    /// commit and flush the changed ones without an explicit `save`.
    pub auto_dirty_check: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_second_level_cache: true,
            refresh_cache_on_commit: true,
            cascade_step_limit: 10_000,
            delete_missing_is_error: false,
            auto_dirty_check: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn use_second_level_cache(mut self, value: bool) -> Self {
        self.use_second_level_cache = value;
        self
    }

    #[must_use]
    pub fn refresh_cache_on_commit(mut self, value: bool) -> Self {
        self.refresh_cache_on_commit = value;
        self
    }

    #[must_use]
    pub fn cascade_step_limit(mut self, limit: usize) -> Self {
        self.cascade_step_limit = limit;
        self
    }

    #[must_use]
    pub fn delete_missing_is_error(mut self, value: bool) -> Self {
        self.delete_missing_is_error = value;
        self
    }

    #[must_use]
    pub fn auto_dirty_check(mut self, value: bool) -> Self {
        self.auto_dirty_check = value;
        self
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Opens sessions over one schema, row store and optional shared cache.
#[derive(Clone)]
pub struct SessionFactory {
    schema: Arc<Schema>,
    store: Arc<dyn RowStore>,
    cache: Option<Arc<SecondLevelCache>>,
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new(schema: Arc<Schema>, store: Arc<dyn RowStore>) -> Self {
        Self {
            schema,
            store,
            cache: None,
            config: SessionConfig::default(),
        }
    }

    /// Share `cache` between every session this factory opens.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<SecondLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn cache(&self) -> Option<&Arc<SecondLevelCache>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Begin a new session.
    pub fn open(&self) -> Session {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new_cyclic(|self_ref| SessionShared {
            id,
            inner: Mutex::new(SessionInner::default()),
            self_ref: self_ref.clone(),
            schema: Arc::clone(&self.schema),
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            config: self.config.clone(),
        });
        tracing::debug!(session = id, "Session opened");
        Session { shared }
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entity_types", &self.schema.len())
            .field("cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug)]
struct SessionInner {
    phase: SessionPhase,
    identity: IdentityMap,
    uow: UnitOfWork,
    tracker: ChangeTracker,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Open,
            identity: IdentityMap::new(),
            uow: UnitOfWork::new(),
            tracker: ChangeTracker::new(),
        }
    }
}

impl SessionInner {
    fn end(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.identity.clear();
        self.uow.clear();
        self.tracker.clear_all();
    }
}

/// Session state shared with the lazy references it hands out.
///
/// Instances hold only a `Weak` to this, so dropping the [`Session`] drops
/// it and later lazy loads fail with `SessionClosed(Dropped)`.
struct SessionShared {
    id: u64,
    inner: Mutex<SessionInner>,
    self_ref: Weak<SessionShared>,
    schema: Arc<Schema>,
    store: Arc<dyn RowStore>,
    cache: Option<Arc<SecondLevelCache>>,
    config: SessionConfig,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let inner = self.lock();
        if inner.phase == SessionPhase::Open {
            Ok(inner)
        } else {
            Err(Error::SessionClosed(inner.phase))
        }
    }

    fn loader(&self) -> Weak<dyn LazyLoader> {
        self.self_ref.clone()
    }

    /// The cache, if this type should use it.
    fn cache_for(&self, entity_type: &EntityType) -> Option<&SecondLevelCache> {
        if entity_type.cacheable && self.config.use_second_level_cache {
            self.cache.as_deref()
        } else {
            None
        }
    }

    /// Identity map, then cache, then store.
    ///
    /// Instances pending deletion read as absent unless `include_deleted`.
    fn lookup(
        &self,
        entity_type: &'static EntityType,
        id: EntityId,
        include_deleted: bool,
    ) -> Result<Option<EntityRef>> {
        let key = ObjectKey::new(entity_type.name, id);
        {
            let inner = self.lock_open()?;
            if let Some(found) = inner.identity.get(&key) {
                if !include_deleted && inner.uow.is_pending_delete(&found) {
                    tracing::debug!(%key, "Instance is pending deletion");
                    return Ok(None);
                }
                tracing::debug!(%key, "Identity map hit");
                return Ok(Some(found));
            }
        }

        let cached = self.cache_for(entity_type).and_then(|cache| {
            let entry = cache.get(entity_type.name, id);
            tracing::debug!(%key, hit = entry.is_some(), "Second-level cache lookup");
            entry
        });
        let row = match cached {
            Some(entry) => entry.row.clone(),
            None => match self.fetch_row(entity_type, id)? {
                Some(row) => row,
                None => {
                    tracing::debug!(%key, "No stored row");
                    return Ok(None);
                }
            },
        };
        self.register_row(entity_type, &row).map(Some)
    }

    /// Read one row through the soft-delete filter, caching it on the way.
    fn fetch_row(&self, entity_type: &'static EntityType, id: EntityId) -> Result<Option<Row>> {
        let cache = self.cache_for(entity_type);
        let stamp = cache.map(SecondLevelCache::next_version);
        let row = SoftDeleteFilter::new(self.store.as_ref()).fetch_row(entity_type, id)?;
        if let (Some(cache), Some(stamp), Some(row)) = (cache, stamp, &row) {
            self.cache_put(cache, entity_type, id, row.clone(), stamp);
        }
        Ok(row)
    }

    fn cache_put(
        &self,
        cache: &SecondLevelCache,
        entity_type: &'static EntityType,
        id: EntityId,
        row: Row,
        version: u64,
    ) -> PutOutcome {
        let outcome = cache.put(entity_type.name, id, row, version);
        if outcome == PutOutcome::Stale {
            tracing::debug!(
                entity = entity_type.name,
                %id,
                version,
                "Discarded stale second-level cache write"
            );
        }
        outcome
    }

    /// Materialize `row` unless its identity is already mapped.
    fn register_row(&self, entity_type: &'static EntityType, row: &Row) -> Result<EntityRef> {
        let instance = EntityInstance::from_row(entity_type, row, &self.loader())?;
        let Some(id) = instance.id() else {
            return Err(Error::state(
                StateErrorKind::NotTracked,
                entity_type.name,
                "loaded row has no key",
            ));
        };
        let key = ObjectKey::new(entity_type.name, id);
        let mut inner = self.lock_open()?;
        if let Some(existing) = inner.identity.get(&key) {
            return Ok(existing);
        }
        let entity = inner.identity.insert(key, instance.into_ref());
        inner.tracker.snapshot(key, snapshot(&entity));
        Ok(entity)
    }
}

impl LazyLoader for SessionShared {
    #[tracing::instrument(level = "debug", skip(self, source), fields(session = self.id))]
    fn load(&self, target: &'static str, source: &LazySource) -> Result<Vec<EntityRef>> {
        drop(self.lock_open()?);
        let entity_type = self.schema.entity(target)?;
        match source {
            LazySource::Key(id) => Ok(self.lookup(entity_type, *id, true)?.into_iter().collect()),
            LazySource::Column { column, owner } => {
                let cache = self.cache_for(entity_type);
                let stamp = cache.map(SecondLevelCache::next_version);
                let rows = SoftDeleteFilter::new(self.store.as_ref()).fetch_many(
                    entity_type,
                    column,
                    &Value::from(*owner),
                )?;
                let mut loaded = Vec::with_capacity(rows.len());
                for row in &rows {
                    let entity = self.register_row(entity_type, row)?;
                    if let (Some(cache), Some(stamp), Some(id)) = (cache, stamp, entity_id(&entity)) {
                        self.cache_put(cache, entity_type, id, row.clone(), stamp);
                    }
                    loaded.push(entity);
                }
                Ok(loaded)
            }
            LazySource::Link { link, owner } => {
                let ids = self.store.fetch_links(link, *owner)?;
                let mut loaded = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entity) = self.lookup(entity_type, id, true)? {
                        loaded.push(entity);
                    }
                }
                Ok(loaded)
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// One logical transaction over the row store.
///
/// Reads go through the identity map, so two finds of the same key return
/// the same [`EntityRef`]. Writes are deferred until [`Session::commit`].
/// Dropping an open session rolls it back.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == SessionPhase::Open
    }

    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// A fresh, unsaved instance of a registered type.
    pub fn new_entity(&self, entity: &str) -> Result<EntityInstance> {
        Ok(EntityInstance::new(self.shared.schema.entity(entity)?))
    }

    /// Find an instance by key.
    ///
    /// Checks the identity map, then the second-level cache (for cacheable
    /// types), then the store. Soft-deleted rows and instances pending
    /// deletion read as `None`.
    #[tracing::instrument(level = "debug", skip(self, id), fields(session = self.shared.id))]
    pub fn find(&self, entity: &str, id: impl Into<EntityId>) -> Result<Option<EntityRef>> {
        let entity_type = self.shared.schema.entity(entity)?;
        self.shared.lookup(entity_type, id.into(), false)
    }

    /// Is this exact instance managed by the session?
    pub fn contains(&self, entity: &EntityRef) -> bool {
        let (name, id) = {
            let guard = read_entity(entity);
            (guard.entity_type().name, guard.id())
        };
        id.is_some_and(|id| self.shared.lock().identity.is_managed(&ObjectKey::new(name, id), entity))
    }

    /// Persist an instance.
    ///
    /// - unkeyed: queued for INSERT
    /// - managed: queued for UPDATE
    /// - keyed but detached: scalar values are copied onto the managed
    ///   instance (loaded if needed), which is queued for UPDATE and returned
    pub fn save(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        let (entity_type, id) = {
            let guard = read_entity(entity);
            (guard.entity_type(), guard.id())
        };
        self.shared.schema.entity(entity_type.name)?;

        let Some(id) = id else {
            self.shared.lock_open()?.uow.register_new(entity)?;
            return Ok(Arc::clone(entity));
        };

        let key = ObjectKey::new(entity_type.name, id);
        {
            let mut inner = self.shared.lock_open()?;
            if inner.identity.is_managed(&key, entity) {
                let SessionInner { identity, uow, .. } = &mut *inner;
                uow.register_dirty(entity, identity)?;
                return Ok(Arc::clone(entity));
            }
        }

        let Some(managed) = self.shared.lookup(entity_type, id, false)? else {
            return Err(Error::state(
                StateErrorKind::NotTracked,
                entity_type.name,
                format!("no stored row with key {} to merge into", id),
            ));
        };
        let source = read_entity(entity).clone();
        write_entity(&managed).copy_scalars_from(&source);
        tracing::debug!(%key, "Merged detached instance into managed instance");

        let mut inner = self.shared.lock_open()?;
        let SessionInner { identity, uow, .. } = &mut *inner;
        uow.register_dirty(&managed, identity)?;
        Ok(managed)
    }

    /// Queue an UPDATE for a managed instance.
    pub fn mark_dirty(&mut self, entity: &EntityRef) -> Result<()> {
        let mut inner = self.shared.lock_open()?;
        let SessionInner { identity, uow, .. } = &mut *inner;
        uow.register_dirty(entity, identity)?;
        Ok(())
    }

    /// Queue a DELETE for an instance.
    ///
    /// Removing an instance that is only pending insertion cancels the
    /// insert. Keyed instances must be managed by this session.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        let (name, id) = {
            let guard = read_entity(entity);
            (guard.entity_type().name, guard.id())
        };
        let mut inner = self.shared.lock_open()?;
        if let Some(id) = id {
            if !inner.identity.is_managed(&ObjectKey::new(name, id), entity) {
                return Err(Error::state(
                    StateErrorKind::NotTracked,
                    name,
                    "cannot remove an instance this session does not manage",
                ));
            }
        }
        inner.uow.register_deleted(entity)?;
        Ok(())
    }

    /// Queue a DELETE by key. Returns `false` if no such row is visible.
    pub fn delete(&mut self, entity: &str, id: impl Into<EntityId>) -> Result<bool> {
        let Some(found) = self.find(entity, id)? else {
            return Ok(false);
        };
        self.shared.lock_open()?.uow.register_deleted(&found)?;
        Ok(true)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.shared.lock().uow.counts()
    }

    /// Instances currently in the identity map.
    pub fn tracked_count(&self) -> usize {
        self.shared.lock().identity.len()
    }

    /// Flush every pending change and end the session.
    ///
    /// Runs cascade expansion, orders the writes and applies them one at a
    /// time. On success the touched cache entries are refreshed and the
    /// session becomes `Committed`. If a write fails the session becomes
    /// `Failed` and the error lists the writes that were applied.
    ///
    /// An unsaved instance referenced without a save cascade fails the
    /// commit before any write; the session stays open in that case.
    #[tracing::instrument(level = "info", skip(self), fields(session = self.shared.id))]
    pub fn commit(&mut self) -> Result<FlushSummary> {
        let started = Instant::now();
        let shared = Arc::clone(&self.shared);

        let (mut uow, live) = {
            let mut inner = shared.lock_open()?;
            let live: Vec<EntityRef> = inner.identity.entries().into_iter().map(|(_, e)| e).collect();
            if shared.config.auto_dirty_check {
                detect_changes(&mut inner)?;
            }
            (std::mem::take(&mut inner.uow), live)
        };

        let resolver = CascadeResolver::new(shared.config.cascade_step_limit);
        let planned = resolver
            .expand(&mut uow, &live)
            .and_then(|report| Ok((report, FlushPlan::build(&uow, &live)?)));
        let (report, plan) = match planned {
            Ok(planned) => planned,
            Err(err) => {
                shared.lock().uow = uow;
                tracing::debug!(error = %err, "Commit rejected before any write");
                return Err(err);
            }
        };

        let options = FlushOptions {
            delete_missing_is_error: shared.config.delete_missing_is_error,
        };
        let filter = SoftDeleteFilter::new(shared.store.as_ref());
        let outcome = match plan.execute_versioned(&filter, options, shared.cache.as_deref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(cache) = shared.cache.as_deref() {
                    for op in err.applied_operations().unwrap_or_default() {
                        let cacheable = shared.schema.get(op.entity).is_some_and(|t| t.cacheable);
                        match op.id {
                            Some(id) if cacheable => {
                                cache.invalidate(op.entity, id);
                            }
                            _ => {}
                        }
                    }
                }
                shared.lock().end(SessionPhase::Failed);
                return Err(err);
            }
        };

        shared.refresh_cache(&outcome);
        let mut summary = outcome.summary;
        summary.cascaded = report.saved + report.deleted;
        shared.lock().end(SessionPhase::Committed);

        tracing::info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            soft_deleted = summary.soft_deleted,
            linked = summary.linked,
            unlinked = summary.unlinked,
            cascaded = summary.cascaded,
            elapsed_ms = started.elapsed().as_millis(),
            "Session committed"
        );
        Ok(summary)
    }

    /// Discard every pending change without contacting the store.
    ///
    /// In-memory changes to instances are not undone.
    #[tracing::instrument(level = "info", skip(self), fields(session = self.shared.id))]
    pub fn rollback(&mut self) -> Result<()> {
        let mut inner = self.shared.lock_open()?;
        let discarded = inner.uow.len();
        inner.end(SessionPhase::RolledBack);
        tracing::info!(discarded, "Session rolled back");
        Ok(())
    }
}

impl SessionShared {
    /// Bring the cache in line with what a successful flush wrote.
    ///
    /// Each row is cached at the version drawn before its store write. If a
    /// later writer already refreshed the slot, the store order between the
    /// two is unknown, so the entry is invalidated instead.
    fn refresh_cache(&self, outcome: &FlushOutcome) {
        let Some(cache) = self.cache.as_deref() else {
            return;
        };
        let mut seen = HashSet::new();
        for Written { entity, version } in outcome.written.iter().rev() {
            if !seen.insert(InstanceKey::of(entity)) {
                continue;
            }
            let (entity_type, id) = {
                let guard = read_entity(entity);
                (guard.entity_type(), guard.id())
            };
            let Some(id) = id.filter(|_| entity_type.cacheable) else {
                continue;
            };
            if self.config.refresh_cache_on_commit {
                let row = snapshot(entity);
                if self.cache_put(cache, entity_type, id, row, *version) == PutOutcome::Stale {
                    cache.invalidate(entity_type.name, id);
                }
            } else {
                cache.invalidate(entity_type.name, id);
            }
        }
        for &(name, id) in &outcome.removed {
            if self.schema.get(name).is_some_and(|t| t.cacheable) {
                cache.invalidate(name, id);
            }
        }
    }
}

/// Queue UPDATEs for managed instances that changed since they were loaded.
fn detect_changes(inner: &mut SessionInner) -> Result<()> {
    let SessionInner {
        identity,
        uow,
        tracker,
        ..
    } = inner;
    for (key, entity) in identity.entries() {
        if uow.contains(&entity) {
            continue;
        }
        let changed = tracker.changed_columns(&key, &snapshot(&entity));
        if !changed.is_empty() || references_unsaved(&entity) {
            tracing::debug!(%key, ?changed, "Detected modified instance");
            uow.register_dirty(&entity, identity)?;
        }
    }
    Ok(())
}

fn references_unsaved(entity: &EntityRef) -> bool {
    let foreign_keys = read_entity(entity).foreign_keys();
    foreign_keys
        .iter()
        .any(|(_, fk)| matches!(fk, ForeignKey::Target(_)) && fk.current_id().is_none())
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.phase == SessionPhase::Open {
            tracing::debug!(
                session = self.shared.id,
                discarded = inner.uow.len(),
                "Open session dropped; rolling back"
            );
            inner.end(SessionPhase::RolledBack);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("phase", &inner.phase)
            .field("tracked", &inner.identity.len())
            .field("pending", &inner.uow.counts())
            .finish()
    }
}
