//! Process-wide second-level cache of entity row snapshots.
//!
//! Sessions share one [`SecondLevelCache`]. Entries are immutable
//! `Arc<CacheEntry>` snapshots, so readers never block writers for longer
//! than a shard lookup. Every write carries a version stamp drawn from the
//! cache's clock and is applied only if it is newer than what the slot
//! already holds; invalidation leaves a tombstone with a fresh stamp. A
//! writer that read its row before a concurrent commit therefore cannot
//! resurrect the entry that commit invalidated.
//!
//! Tombstones are capped. Whenever a slot is dropped (pruned tombstone,
//! evicted entry, `clear`) its version raises a floor, and writes to empty
//! slots at or below the floor are rejected as stale.
//!
//! # Example
//!
//! ```
//! use rowmap_cache::{PutOutcome, SecondLevelCache};
//! use rowmap_core::{EntityId, Row, Value};
//!
//! let cache = SecondLevelCache::default();
//! let stamp = cache.next_version();
//! let row = Row::from_pairs([("id", Value::BigInt(1)), ("courseName", "JPA".into())]);
//!
//! // A commit invalidates the key after the reader took its stamp...
//! cache.invalidate("Course", EntityId(1));
//! // ...so the reader's late write is discarded.
//! assert_eq!(cache.put("Course", EntityId(1), row, stamp), PutOutcome::Stale);
//! assert!(cache.get("Course", EntityId(1)).is_none());
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rowmap_core::{EntityId, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key: entity type name and primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: &'static str,
    pub id: EntityId,
}

/// An immutable row snapshot and the version it was stored at.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub row: Row,
    pub version: u64,
}

#[derive(Debug, Clone)]
enum Slot {
    Live(Arc<CacheEntry>),
    Tombstone(u64),
}

impl Slot {
    fn version(&self) -> u64 {
        match self {
            Slot::Live(entry) => entry.version,
            Slot::Tombstone(version) => *version,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, Slot::Live(_))
    }
}

/// Result of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The slot already held a newer version; the write was dropped.
    Stale,
}

/// Second-level cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live entries (0 = unbounded). The oldest stored
    /// entry is evicted first.
    pub max_entries: usize,
    /// Maximum number of tombstones kept; the oldest are pruned first.
    pub max_tombstones: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 0,
            max_tombstones: 1024,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    #[must_use]
    pub fn max_tombstones(mut self, max: usize) -> Self {
        self.max_tombstones = max;
        self
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_writes: u64,
    pub evictions: u64,
}

/// Shared snapshot cache keyed by `(entity type, id)`.
#[derive(Debug)]
pub struct SecondLevelCache {
    slots: DashMap<CacheKey, Slot>,
    clock: AtomicU64,
    /// Highest version of any dropped slot.
    floor: AtomicU64,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_writes: AtomicU64,
    evictions: AtomicU64,
}

impl SecondLevelCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: DashMap::new(),
            clock: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Draw a fresh version stamp. Stamps are strictly increasing.
    pub fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Look up a live snapshot.
    pub fn get(&self, entity: &'static str, id: EntityId) -> Option<Arc<CacheEntry>> {
        let key = CacheKey { entity, id };
        let found = self.slots.get(&key).and_then(|slot| match slot.value() {
            Slot::Live(entry) => Some(Arc::clone(entry)),
            Slot::Tombstone(_) => None,
        });
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity, id = %id, "Second-level cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity, id = %id, "Second-level cache miss");
        }
        found
    }

    /// Store a snapshot if `version` is newer than the slot's current one.
    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn put(&self, entity: &'static str, id: EntityId, row: Row, version: u64) -> PutOutcome {
        let key = CacheKey { entity, id };
        let live = Slot::Live(Arc::new(CacheEntry { row, version }));
        let stored = match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version() >= version {
                    false
                } else {
                    occupied.insert(live);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                if self.floor.load(Ordering::Acquire) >= version {
                    false
                } else {
                    vacant.insert(live);
                    true
                }
            }
        };

        if stored {
            self.enforce_capacity();
            PutOutcome::Stored
        } else {
            self.stale_writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity, id = %id, version, "Discarding stale cache write");
            PutOutcome::Stale
        }
    }

    /// Invalidate a key, leaving a tombstone that rejects older writes.
    ///
    /// Returns the tombstone's version.
    pub fn invalidate(&self, entity: &'static str, id: EntityId) -> u64 {
        let version = self.next_version();
        let key = CacheKey { entity, id };
        match self.slots.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version() < version {
                    occupied.insert(Slot::Tombstone(version));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Tombstone(version));
            }
        }
        tracing::debug!(entity, id = %id, version, "Invalidated cache entry");
        self.prune_tombstones();
        version
    }

    /// Drop every slot. Writes stamped before the clear are rejected.
    pub fn clear(&self) {
        self.floor
            .fetch_max(self.clock.load(Ordering::Acquire), Ordering::AcqRel);
        self.slots.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value().is_live()).count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, entity: &'static str, id: EntityId) -> bool {
        self.slots
            .get(&CacheKey { entity, id })
            .is_some_and(|slot| slot.value().is_live())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn enforce_capacity(&self) {
        let max = self.config.max_entries;
        if max == 0 {
            return;
        }
        while self.len() > max {
            let Some(key) = self.oldest(true) else {
                break;
            };
            if self.drop_slot(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(entity = key.entity, id = %key.id, "Evicted cache entry");
            }
        }
    }

    fn prune_tombstones(&self) {
        while self.tombstone_count() > self.config.max_tombstones {
            let Some(key) = self.oldest(false) else {
                break;
            };
            if self.drop_slot(&key) {
                tracing::trace!(entity = key.entity, id = %key.id, "Pruned cache tombstone");
            }
        }
    }

    fn oldest(&self, live: bool) -> Option<CacheKey> {
        self.slots
            .iter()
            .filter(|slot| slot.value().is_live() == live)
            .min_by_key(|slot| slot.value().version())
            .map(|slot| *slot.key())
    }

    /// Remove a slot, raising the floor to its version.
    fn drop_slot(&self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                self.floor.fetch_max(slot.version(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }
}

impl Default for SecondLevelCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
