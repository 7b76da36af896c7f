//! Row store adapter trait.
//!
//! The persistence engine talks to storage only through [`RowStore`]. Calls
//! are synchronous and made one at a time during a commit; adapters that
//! front a real database are expected to map driver failures onto
//! [`StoreErrorKind`](crate::error::StoreErrorKind).

use crate::error::Result;
use crate::row::Row;
use crate::schema::{EntityType, LinkTableInfo};
use crate::value::{EntityId, Value};
use std::sync::Arc;

/// Outcome of a keyed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The row existed and was written.
    Applied,
    /// No row with that key exists.
    NotFound,
}

/// Keyed row access for one backing store.
///
/// Rows are exchanged by column name; the primary key column is included in
/// fetched rows and ignored on writes.
pub trait RowStore: Send + Sync {
    /// Fetch one row by primary key.
    fn fetch_row(&self, entity: &EntityType, id: EntityId) -> Result<Option<Row>>;

    /// Fetch all rows whose `column` equals `value`.
    fn fetch_many(&self, entity: &EntityType, column: &str, value: &Value) -> Result<Vec<Row>>;

    /// Insert a row and return its assigned key.
    fn insert(&self, entity: &EntityType, row: &Row) -> Result<EntityId>;

    /// Overwrite the given columns of one row.
    fn update(&self, entity: &EntityType, id: EntityId, row: &Row) -> Result<WriteStatus>;

    /// Overwrite the given columns of one row unless `column` currently
    /// holds `value`, in which case the row counts as `NotFound`.
    ///
    /// The default reads and then writes. Adapters over a real database
    /// should issue a single guarded UPDATE.
    fn update_unless(
        &self,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
        column: &str,
        value: &Value,
    ) -> Result<WriteStatus> {
        match self.fetch_row(entity, id)? {
            Some(current) if current.get(column) != Some(value) => self.update(entity, id, row),
            _ => Ok(WriteStatus::NotFound),
        }
    }

    /// Physically delete one row.
    fn delete(&self, entity: &EntityType, id: EntityId) -> Result<WriteStatus>;

    /// Remote keys linked to `owner` through a link table.
    fn fetch_links(&self, link: &LinkTableInfo, owner: EntityId) -> Result<Vec<EntityId>>;

    /// Insert one `(owner, target)` link row.
    fn insert_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Result<()>;

    /// Delete one `(owner, target)` link row.
    fn delete_link(
        &self,
        link: &LinkTableInfo,
        owner: EntityId,
        target: EntityId,
    ) -> Result<WriteStatus>;
}

impl<S: RowStore + ?Sized> RowStore for Arc<S> {
    fn fetch_row(&self, entity: &EntityType, id: EntityId) -> Result<Option<Row>> {
        (**self).fetch_row(entity, id)
    }

    fn fetch_many(&self, entity: &EntityType, column: &str, value: &Value) -> Result<Vec<Row>> {
        (**self).fetch_many(entity, column, value)
    }

    fn insert(&self, entity: &EntityType, row: &Row) -> Result<EntityId> {
        (**self).insert(entity, row)
    }

    fn update(&self, entity: &EntityType, id: EntityId, row: &Row) -> Result<WriteStatus> {
        (**self).update(entity, id, row)
    }

    fn update_unless(
        &self,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
        column: &str,
        value: &Value,
    ) -> Result<WriteStatus> {
        (**self).update_unless(entity, id, row, column, value)
    }

    fn delete(&self, entity: &EntityType, id: EntityId) -> Result<WriteStatus> {
        (**self).delete(entity, id)
    }

    fn fetch_links(&self, link: &LinkTableInfo, owner: EntityId) -> Result<Vec<EntityId>> {
        (**self).fetch_links(link, owner)
    }

    fn insert_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Result<()> {
        (**self).insert_link(link, owner, target)
    }

    fn delete_link(
        &self,
        link: &LinkTableInfo,
        owner: EntityId,
        target: EntityId,
    ) -> Result<WriteStatus> {
        (**self).delete_link(link, owner, target)
    }
}
