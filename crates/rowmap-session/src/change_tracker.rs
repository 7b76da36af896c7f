//! Snapshot-based dirty detection.
//!
//! Each instance loaded into a session gets a snapshot of its row (scalars
//! and foreign keys). At commit the current row is compared against it, so
//! modified instances are flushed even if the caller never called `save`.

use crate::ObjectKey;
use rowmap_core::Row;
use std::collections::HashMap;

/// Load-time rows keyed by row identity.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, Row>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "trace", skip(self, row))]
    pub fn snapshot(&mut self, key: ObjectKey, row: Row) {
        tracing::trace!(columns = row.len(), "Taking object snapshot");
        self.snapshots.insert(key, row);
    }

    /// Columns whose values differ from the snapshot.
    ///
    /// Without a snapshot every column counts as changed.
    pub fn changed_columns(&self, key: &ObjectKey, current: &Row) -> Vec<String> {
        let snapshot = self.snapshots.get(key);
        current
            .iter()
            .filter(|(column, value)| snapshot.is_none_or(|s| s.get(column) != Some(*value)))
            .map(|(column, _)| column.to_string())
            .collect()
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }
}
