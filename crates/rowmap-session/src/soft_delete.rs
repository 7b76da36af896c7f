//! Soft-delete filter over a row store.
//!
//! For entity types that declare a soft-delete flag, every read drops rows
//! whose flag is set and every delete becomes an UPDATE that sets the flag
//! (and refreshes the update timestamp when one is declared). The wrapped
//! store never sees a physical delete for those types. Other types pass
//! straight through.
//!
//! A flagged row behaves as missing for writes too: updating or deleting
//! it reports [`WriteStatus::NotFound`], the same as for a physically
//! deleted row.

use rowmap_core::{
    EntityId, EntityType, LinkTableInfo, Result, Row, RowStore, Value, WriteStatus,
};

const DELETED: Value = Value::Bool(true);

/// Is `row` flagged as deleted for `entity`?
pub fn is_soft_deleted(entity: &EntityType, row: &Row) -> bool {
    entity
        .soft_delete
        .and_then(|flag| row.get(flag))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Columns written when soft-deleting a row of `entity`.
pub fn soft_delete_row(entity: &EntityType) -> Option<Row> {
    let flag = entity.soft_delete?;
    let mut row = Row::from_pairs([(flag, Value::Bool(true))]);
    if let Some(updated) = entity.updated_timestamp {
        row.set(updated, Value::now());
    }
    Some(row)
}

/// A `RowStore` view that hides soft-deleted rows.
pub struct SoftDeleteFilter<'a> {
    inner: &'a dyn RowStore,
}

impl<'a> SoftDeleteFilter<'a> {
    pub fn new(inner: &'a dyn RowStore) -> Self {
        Self { inner }
    }
}

impl RowStore for SoftDeleteFilter<'_> {
    fn fetch_row(&self, entity: &EntityType, id: EntityId) -> Result<Option<Row>> {
        let row = self.inner.fetch_row(entity, id)?;
        Ok(row.filter(|r| {
            let hidden = is_soft_deleted(entity, r);
            if hidden {
                tracing::debug!(entity = entity.name, id = %id, "Row is soft-deleted");
            }
            !hidden
        }))
    }

    fn fetch_many(&self, entity: &EntityType, column: &str, value: &Value) -> Result<Vec<Row>> {
        let mut rows = self.inner.fetch_many(entity, column, value)?;
        if entity.is_soft_deletable() {
            rows.retain(|r| !is_soft_deleted(entity, r));
        }
        Ok(rows)
    }

    fn insert(&self, entity: &EntityType, row: &Row) -> Result<EntityId> {
        self.inner.insert(entity, row)
    }

    fn update(&self, entity: &EntityType, id: EntityId, row: &Row) -> Result<WriteStatus> {
        match entity.soft_delete {
            Some(flag) => self.inner.update_unless(entity, id, row, flag, &DELETED),
            None => self.inner.update(entity, id, row),
        }
    }

    fn update_unless(
        &self,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
        column: &str,
        value: &Value,
    ) -> Result<WriteStatus> {
        self.inner.update_unless(entity, id, row, column, value)
    }

    fn delete(&self, entity: &EntityType, id: EntityId) -> Result<WriteStatus> {
        let (Some(flag), Some(row)) = (entity.soft_delete, soft_delete_row(entity)) else {
            return self.inner.delete(entity, id);
        };
        tracing::debug!(entity = entity.name, id = %id, "Rewriting DELETE as soft delete");
        let status = self.inner.update_unless(entity, id, &row, flag, &DELETED)?;
        if status == WriteStatus::NotFound {
            tracing::debug!(entity = entity.name, id = %id, "Row already soft-deleted or missing");
        }
        Ok(status)
    }

    fn fetch_links(&self, link: &LinkTableInfo, owner: EntityId) -> Result<Vec<EntityId>> {
        self.inner.fetch_links(link, owner)
    }

    fn insert_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Result<()> {
        self.inner.insert_link(link, owner, target)
    }

    fn delete_link(
        &self,
        link: &LinkTableInfo,
        owner: EntityId,
        target: EntityId,
    ) -> Result<WriteStatus> {
        self.inner.delete_link(link, owner, target)
    }
}
