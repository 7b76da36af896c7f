//! Operation bookkeeping and fault injection for the in-memory store.

use rowmap_core::{EntityId, Error, StoreErrorKind};
use std::fmt;

/// One kind of adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    FetchRow,
    FetchMany,
    Insert,
    Update,
    Delete,
    FetchLinks,
    InsertLink,
    DeleteLink,
}

impl StoreOp {
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            StoreOp::Insert
                | StoreOp::Update
                | StoreOp::Delete
                | StoreOp::InsertLink
                | StoreOp::DeleteLink
        )
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::FetchRow => "fetch_row",
            StoreOp::FetchMany => "fetch_many",
            StoreOp::Insert => "insert",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
            StoreOp::FetchLinks => "fetch_links",
            StoreOp::InsertLink => "insert_link",
            StoreOp::DeleteLink => "delete_link",
        };
        f.write_str(name)
    }
}

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_row: usize,
    pub fetch_many: usize,
    pub insert: usize,
    pub update: usize,
    pub delete: usize,
    pub fetch_links: usize,
    pub insert_link: usize,
    pub delete_link: usize,
}

impl CallCounts {
    pub(crate) fn record(&mut self, op: StoreOp) {
        let slot = match op {
            StoreOp::FetchRow => &mut self.fetch_row,
            StoreOp::FetchMany => &mut self.fetch_many,
            StoreOp::Insert => &mut self.insert,
            StoreOp::Update => &mut self.update,
            StoreOp::Delete => &mut self.delete,
            StoreOp::FetchLinks => &mut self.fetch_links,
            StoreOp::InsertLink => &mut self.insert_link,
            StoreOp::DeleteLink => &mut self.delete_link,
        };
        *slot += 1;
    }

    /// Calls that read rows or links.
    pub fn reads(&self) -> usize {
        self.fetch_row + self.fetch_many + self.fetch_links
    }

    /// Calls that wrote rows or links.
    pub fn writes(&self) -> usize {
        self.insert + self.update + self.delete + self.insert_link + self.delete_link
    }
}

/// A successfully applied write, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: StoreOp,
    pub table: String,
    pub id: Option<EntityId>,
}

/// A one-shot injected failure.
///
/// ```
/// use rowmap_core::StoreErrorKind;
/// use rowmap_memory::{Fault, StoreOp};
///
/// // Reject the second insert into ReviewDetails with a constraint error.
/// let fault = Fault::on(StoreOp::Insert)
///     .table("ReviewDetails")
///     .after(1)
///     .kind(StoreErrorKind::ConstraintViolation);
/// # let _ = fault;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    op: Option<StoreOp>,
    table: Option<String>,
    skip: usize,
    kind: StoreErrorKind,
}

impl Fault {
    /// Fail the next call of `op`.
    pub fn on(op: StoreOp) -> Self {
        Self {
            op: Some(op),
            table: None,
            skip: 0,
            kind: StoreErrorKind::Unavailable,
        }
    }

    /// Fail the next call of any kind.
    pub fn any() -> Self {
        Self {
            op: None,
            table: None,
            skip: 0,
            kind: StoreErrorKind::Unavailable,
        }
    }

    /// Only match calls against `table`.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Let `count` matching calls succeed first.
    #[must_use]
    pub fn after(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: StoreErrorKind) -> Self {
        self.kind = kind;
        self
    }

    fn matches(&self, op: StoreOp, table: &str) -> bool {
        self.op.is_none_or(|o| o == op) && self.table.as_deref().is_none_or(|t| t == table)
    }

    /// Returns the error to raise once this fault fires.
    pub(crate) fn check(&mut self, op: StoreOp, table: &str) -> Option<Error> {
        if !self.matches(op, table) {
            return None;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }
        let message = format!("injected failure on {}", op);
        Some(match self.kind {
            StoreErrorKind::Unavailable => Error::unavailable(message),
            StoreErrorKind::ConstraintViolation => Error::constraint(table, message),
            StoreErrorKind::RowMissing => Error::Store(rowmap_core::StoreError {
                kind: StoreErrorKind::RowMissing,
                table: Some(table.to_string()),
                message,
                source: None,
            }),
        })
    }
}
