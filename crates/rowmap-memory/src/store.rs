//! The in-memory `RowStore` implementation.

use crate::faults::{CallCounts, Fault, JournalEntry, StoreOp};
use rowmap_core::{
    EntityId, EntityType, Error, LinkTableInfo, Result, Row, RowStore, Schema, Value, WriteStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Table {
    rows: BTreeMap<EntityId, Row>,
    next_id: i64,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    links: HashMap<String, Vec<Row>>,
    counts: CallCounts,
    journal: Vec<JournalEntry>,
    faults: Vec<Fault>,
}

impl Inner {
    /// Count the call and fire any matching fault.
    fn enter(&mut self, op: StoreOp, table: &str) -> Result<()> {
        self.counts.record(op);
        tracing::trace!(%op, table, "Memory store call");
        let mut fired = None;
        for (i, fault) in self.faults.iter_mut().enumerate() {
            if let Some(err) = fault.check(op, table) {
                fired = Some((i, err));
                break;
            }
        }
        match fired {
            Some((i, err)) => {
                self.faults.remove(i);
                tracing::debug!(%op, table, "Injected store failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn table_mut(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_default()
    }

    fn log(&mut self, op: StoreOp, table: &str, id: Option<EntityId>) {
        self.journal.push(JournalEntry {
            op,
            table: table.to_string(),
            id,
        });
    }

    fn row_exists(&self, table: &str, id: EntityId) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.rows.contains_key(&id))
    }
}

/// Thread-safe in-memory row store.
///
/// Tables are created on first use. With a schema attached
/// ([`MemoryStore::with_schema`]) foreign keys are enforced like a real
/// database would: inserts and updates must reference existing rows, and
/// deleting a referenced row is rejected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    schema: Option<Arc<Schema>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that enforces foreign keys declared in `schema`.
    pub fn with_schema(schema: Arc<Schema>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            schema: Some(schema),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row directly, keeping the key found in `row` if any.
    ///
    /// Seeding bypasses counters, faults and constraint checks.
    pub fn seed(&self, entity: &EntityType, mut row: Row) -> EntityId {
        let mut inner = self.lock();
        let table = inner.table_mut(entity.table);
        let id = row
            .get(entity.primary_key)
            .and_then(Value::as_entity_id)
            .unwrap_or(EntityId(table.next_id));
        table.next_id = table.next_id.max(id.get() + 1);
        row.set(entity.primary_key, id.into());
        table.rows.insert(id, row);
        id
    }

    /// Seed one link row.
    pub fn seed_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) {
        self.lock()
            .links
            .entry(link.table_name.to_string())
            .or_default()
            .push(link_row(link, owner, target));
    }

    /// Start key assignment for `table` at `next`.
    pub fn set_next_id(&self, table: &str, next: i64) {
        self.lock().table_mut(table).next_id = next;
    }

    /// Stored row as-is, including soft-deleted rows.
    pub fn raw_row(&self, table: &str, id: EntityId) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    pub fn link_count(&self, table: &str) -> usize {
        self.lock().links.get(table).map_or(0, Vec::len)
    }

    pub fn counts(&self) -> CallCounts {
        self.lock().counts
    }

    /// Applied writes in call order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Reset counters and the journal, keeping data.
    pub fn reset_counts(&self) {
        let mut inner = self.lock();
        inner.counts = CallCounts::default();
        inner.journal.clear();
    }

    /// Arm a one-shot fault.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    fn check_not_null(entity: &EntityType, row: &Row, full: bool) -> Result<()> {
        for col in entity.columns.iter().filter(|c| !c.nullable) {
            let value = row.get(col.column_name);
            let missing = match value {
                Some(v) => v.is_null(),
                None => full,
            };
            if missing {
                return Err(Error::constraint(
                    entity.table,
                    format!("NOT NULL constraint failed: {}.{}", entity.table, col.column_name),
                ));
            }
        }
        Ok(())
    }

    fn check_references(&self, inner: &Inner, entity: &EntityType, row: &Row) -> Result<()> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        for rel in entity.relationships {
            let Some(column) = rel.local_key else {
                continue;
            };
            let Some(fk) = row.get(column).and_then(Value::as_entity_id) else {
                continue;
            };
            let target = schema.entity(rel.target)?;
            if !inner.row_exists(target.table, fk) {
                return Err(Error::constraint(
                    entity.table,
                    format!(
                        "FOREIGN KEY constraint failed: {}.{} = {} has no {} row",
                        entity.table, column, fk, target.table
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Apply an UPDATE to a row known to exist.
    fn write_columns(
        &self,
        inner: &mut Inner,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
    ) -> Result<WriteStatus> {
        Self::check_not_null(entity, row, false)?;
        self.check_references(inner, entity, row)?;

        let table = inner.table_mut(entity.table);
        if let Some(stored) = table.rows.get_mut(&id) {
            for (column, value) in row.iter() {
                if column != entity.primary_key {
                    stored.set(column, value.clone());
                }
            }
        }
        inner.log(StoreOp::Update, entity.table, Some(id));
        Ok(WriteStatus::Applied)
    }

    fn check_not_referenced(&self, inner: &Inner, entity: &EntityType, id: EntityId) -> Result<()> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        let key = Value::from(id);
        for other in schema.types() {
            for rel in other.relationships.iter().filter(|r| r.target == entity.name) {
                let Some(column) = rel.local_key else {
                    continue;
                };
                let referenced = inner.tables.get(other.table).is_some_and(|t| {
                    t.rows.values().any(|r| r.get(column) == Some(&key))
                });
                if referenced {
                    return Err(Error::constraint(
                        entity.table,
                        format!(
                            "FOREIGN KEY constraint failed: {}#{} is referenced by {}.{}",
                            entity.table, id, other.table, column
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn link_row(link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Row {
    Row::from_pairs([
        (link.local_column, Value::from(owner)),
        (link.remote_column, Value::from(target)),
    ])
}

impl RowStore for MemoryStore {
    fn fetch_row(&self, entity: &EntityType, id: EntityId) -> Result<Option<Row>> {
        let mut inner = self.lock();
        inner.enter(StoreOp::FetchRow, entity.table)?;
        Ok(inner
            .tables
            .get(entity.table)
            .and_then(|t| t.rows.get(&id).cloned()))
    }

    fn fetch_many(&self, entity: &EntityType, column: &str, value: &Value) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        inner.enter(StoreOp::FetchMany, entity.table)?;
        Ok(inner.tables.get(entity.table).map_or_else(Vec::new, |t| {
            t.rows
                .values()
                .filter(|r| r.get(column) == Some(value))
                .cloned()
                .collect()
        }))
    }

    fn insert(&self, entity: &EntityType, row: &Row) -> Result<EntityId> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Insert, entity.table)?;
        Self::check_not_null(entity, row, true)?;
        self.check_references(&inner, entity, row)?;

        let table = inner.table_mut(entity.table);
        let id = EntityId(table.next_id);
        table.next_id += 1;
        let mut stored = row.clone();
        stored.set(entity.primary_key, id.into());
        table.rows.insert(id, stored);
        inner.log(StoreOp::Insert, entity.table, Some(id));
        Ok(id)
    }

    fn update(&self, entity: &EntityType, id: EntityId, row: &Row) -> Result<WriteStatus> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Update, entity.table)?;
        if !inner.row_exists(entity.table, id) {
            return Ok(WriteStatus::NotFound);
        }
        self.write_columns(&mut inner, entity, id, row)
    }

    fn update_unless(
        &self,
        entity: &EntityType,
        id: EntityId,
        row: &Row,
        column: &str,
        value: &Value,
    ) -> Result<WriteStatus> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Update, entity.table)?;
        let guarded = inner
            .tables
            .get(entity.table)
            .and_then(|t| t.rows.get(&id))
            .is_none_or(|stored| stored.get(column) == Some(value));
        if guarded {
            return Ok(WriteStatus::NotFound);
        }
        self.write_columns(&mut inner, entity, id, row)
    }

    fn delete(&self, entity: &EntityType, id: EntityId) -> Result<WriteStatus> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Delete, entity.table)?;
        if !inner.row_exists(entity.table, id) {
            return Ok(WriteStatus::NotFound);
        }
        self.check_not_referenced(&inner, entity, id)?;
        inner.table_mut(entity.table).rows.remove(&id);
        inner.log(StoreOp::Delete, entity.table, Some(id));
        Ok(WriteStatus::Applied)
    }

    fn fetch_links(&self, link: &LinkTableInfo, owner: EntityId) -> Result<Vec<EntityId>> {
        let mut inner = self.lock();
        inner.enter(StoreOp::FetchLinks, link.table_name)?;
        let owner = Value::from(owner);
        Ok(inner.links.get(link.table_name).map_or_else(Vec::new, |rows| {
            rows.iter()
                .filter(|r| r.get(link.local_column) == Some(&owner))
                .filter_map(|r| r.get(link.remote_column).and_then(Value::as_entity_id))
                .collect()
        }))
    }

    fn insert_link(&self, link: &LinkTableInfo, owner: EntityId, target: EntityId) -> Result<()> {
        let mut inner = self.lock();
        inner.enter(StoreOp::InsertLink, link.table_name)?;
        let row = link_row(link, owner, target);
        let rows = inner.links.entry(link.table_name.to_string()).or_default();
        if rows.iter().any(|r| {
            r.get(link.local_column) == row.get(link.local_column)
                && r.get(link.remote_column) == row.get(link.remote_column)
        }) {
            return Err(Error::constraint(
                link.table_name,
                format!("UNIQUE constraint failed: ({}, {})", owner, target),
            ));
        }
        rows.push(row);
        inner.log(StoreOp::InsertLink, link.table_name, Some(owner));
        Ok(())
    }

    fn delete_link(
        &self,
        link: &LinkTableInfo,
        owner: EntityId,
        target: EntityId,
    ) -> Result<WriteStatus> {
        let mut inner = self.lock();
        inner.enter(StoreOp::DeleteLink, link.table_name)?;
        let (owner_v, target_v) = (Value::from(owner), Value::from(target));
        let Some(rows) = inner.links.get_mut(link.table_name) else {
            return Ok(WriteStatus::NotFound);
        };
        let before = rows.len();
        rows.retain(|r| {
            !(r.get(link.local_column) == Some(&owner_v)
                && r.get(link.remote_column) == Some(&target_v))
        });
        if rows.len() == before {
            return Ok(WriteStatus::NotFound);
        }
        inner.log(StoreOp::DeleteLink, link.table_name, Some(owner));
        Ok(WriteStatus::Applied)
    }
}
