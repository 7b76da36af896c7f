//! rowmap - identity-mapped persistence sessions over a row store.
//!
//! rowmap mediates between an in-memory object graph and a relational row
//! store:
//!
//! - One in-memory instance per stored row per session (identity map)
//! - Lazy relationship references that load through their session
//! - Deferred, dependency-ordered writes at commit (unit of work)
//! - Save and delete cascades along relationship edges
//! - Soft delete for types that declare a flag column
//! - An optional process-wide second-level cache of row snapshots
//!
//! # Quick Start
//!
//! ```
//! use rowmap::prelude::*;
//!
//! static COURSE: EntityType = EntityType::new("Course", "CourseDetails")
//!     .columns(&[ColumnInfo::new("name", "courseName", SqlType::Text).nullable(false)])
//!     .cacheable(true);
//!
//! let schema = Schema::builder().register(&COURSE).build().unwrap();
//! let db = rowmap::in_memory(schema, Some(CacheConfig::default()));
//!
//! let mut session = db.factory.open();
//! let course = session
//!     .new_entity("Course")
//!     .unwrap()
//!     .with("name", "MS in 50 Steps")
//!     .unwrap()
//!     .into_ref();
//! session.save(&course).unwrap();
//! let summary = session.commit().unwrap();
//! assert_eq!(summary.inserted, 1);
//!
//! let id = entity_id(&course).unwrap();
//! let session = db.factory.open();
//! let found = session.find("Course", id).unwrap().unwrap();
//! assert_eq!(read_entity(&found).get_as::<String>("name").unwrap(), "MS in 50 Steps");
//! ```
//!
//! # Crates
//!
//! - `rowmap-core`: values, rows, schema metadata, entity instances, lazy
//!   references, errors and the `RowStore` trait
//! - `rowmap-session`: sessions, identity map, unit of work, cascades,
//!   flush ordering and the soft-delete filter
//! - `rowmap-cache`: the shared second-level cache
//! - `rowmap-memory`: an in-memory `RowStore` with call counters and fault
//!   injection

use std::sync::Arc;

pub use rowmap_cache::{
    CacheConfig, CacheEntry, CacheKey, CacheStats, PutOutcome, SecondLevelCache,
};
pub use rowmap_core::{
    AppliedOp, CascadePolicy, ColumnInfo, EntityId, EntityInstance, EntityRef, EntityType, Error,
    FlushError, ForeignKey, FromValue, Lazy, LazyLoader, LazySource, LinkTableInfo, Multiplicity,
    OpKind, OwningSide, Related, RelationshipInfo, RelationshipKind, Resolved, Result, Row,
    RowStore, Schema, SchemaBuilder, SchemaError, SchemaErrorKind, SessionPhase, SqlType,
    StateError, StateErrorKind, StoreError, StoreErrorKind, TypeError, Value, WriteStatus,
    entity_id, read_entity, resolve, snapshot, write_entity,
};
pub use rowmap_memory::{CallCounts, Fault, JournalEntry, MemoryStore, StoreOp};
pub use rowmap_session::{
    CascadeReport, CascadeResolver, FlushSummary, IdentityMap, ObjectKey, PendingCounts,
    PendingKind, Session, SessionConfig, SessionFactory, SoftDeleteFilter, UnitOfWork,
};

/// A session factory wired to an in-memory store.
#[derive(Debug, Clone)]
pub struct InMemory {
    pub factory: SessionFactory,
    /// The backing store, for inspection and fault injection.
    pub store: Arc<MemoryStore>,
    pub cache: Option<Arc<SecondLevelCache>>,
}

/// Build a [`SessionFactory`] over a fresh [`MemoryStore`].
///
/// The store enforces the foreign keys declared in `schema`. Passing a
/// cache config attaches a new second-level cache.
pub fn in_memory(schema: Schema, cache: Option<CacheConfig>) -> InMemory {
    let schema = Arc::new(schema);
    let store = Arc::new(MemoryStore::with_schema(Arc::clone(&schema)));
    let cache = cache.map(|config| Arc::new(SecondLevelCache::new(config)));
    let mut factory = SessionFactory::new(schema, store.clone());
    if let Some(cache) = &cache {
        factory = factory.with_cache(Arc::clone(cache));
    }
    tracing::debug!(
        entity_types = factory.schema().len(),
        cache = cache.is_some(),
        "In-memory session factory ready"
    );
    InMemory {
        factory,
        store,
        cache,
    }
}

/// Prelude module for convenient imports.
///
/// ```
/// use rowmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CacheConfig, CascadePolicy, ColumnInfo, EntityId, EntityInstance, EntityRef, EntityType,
        Error, FlushSummary, LinkTableInfo, MemoryStore, Related, RelationshipInfo,
        RelationshipKind, Result, Row, RowStore, Schema, SecondLevelCache, Session, SessionConfig,
        SessionFactory, SessionPhase, SqlType, Value, entity_id, read_entity, write_entity,
    };
}
