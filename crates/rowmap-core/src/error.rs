//! Error types for rowmap operations.

use crate::value::EntityId;
use std::fmt;

/// The primary error type for all rowmap operations.
#[derive(Debug)]
pub enum Error {
    /// Row store adapter errors (unavailable, constraint violations)
    Store(StoreError),
    /// Schema declaration errors
    Schema(SchemaError),
    /// Type conversion errors
    Type(TypeError),
    /// Misuse of an entity or the unit of work
    State(StateError),
    /// Operation on a session that has already ended
    SessionClosed(SessionPhase),
    /// Adapter failure during commit
    Flush(FlushError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The store could not be reached or refused the call
    Unavailable,
    /// A unique, not-null or foreign key constraint was violated
    ConstraintViolation,
    /// An UPDATE targeted a row that no longer exists
    RowMissing,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Identifier does not match the allowed syntax
    InvalidIdentifier,
    /// Two entity types, fields or relationships share a name
    Duplicate,
    /// A relationship points at an unregistered entity type
    UnknownTarget,
    /// A declared column (soft-delete flag, timestamp, key) is missing
    MissingColumn,
    /// Entity type was not registered in the schema
    UnknownEntity,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// `register_new` on an instance that already has a key
    AlreadyPersisted,
    /// `register_dirty` on an instance the session does not track
    NotTracked,
    /// Field name not declared on the entity type
    UnknownField,
    /// Relationship name not declared on the entity type
    UnknownRelationship,
    /// To-one accessor used on a to-many relationship or the reverse
    Multiplicity,
    /// Attempt to change an assigned primary key
    KeyImmutable,
    /// A flushed instance references an unsaved instance that is not being saved
    TransientReference,
}

/// Lifecycle phase of a session, reported by `Error::SessionClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Session accepts operations.
    Open,
    /// Session committed successfully.
    Committed,
    /// Session was rolled back (explicitly or by drop).
    RolledBack,
    /// A flush failed; the session must be discarded.
    Failed,
    /// The session value itself no longer exists.
    Dropped,
}

/// Kind of a flushed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Link,
    Unlink,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Insert => "INSERT",
            OpKind::Update => "UPDATE",
            OpKind::Delete => "DELETE",
            OpKind::Link => "LINK",
            OpKind::Unlink => "UNLINK",
        };
        f.write_str(name)
    }
}

/// One write that reached (or was about to reach) the row store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub kind: OpKind,
    pub entity: &'static str,
    pub id: Option<EntityId>,
}

impl fmt::Display for AppliedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} {}#{}", self.kind, self.entity, id),
            None => write!(f, "{} {}#<new>", self.kind, self.entity),
        }
    }
}

/// Commit aborted by an adapter error.
///
/// Writes listed in `applied` reached the store before `failed` was
/// rejected; nothing after `failed` was attempted.
#[derive(Debug)]
pub struct FlushError {
    pub applied: Vec<AppliedOp>,
    pub failed: AppliedOp,
    pub source: Box<Error>,
}

impl Error {
    /// Is this a transient store failure that a caller could retry in a new session?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.kind == StoreErrorKind::Unavailable,
            Error::Flush(e) => e.source.is_retryable(),
            _ => false,
        }
    }

    /// Did this error come from using an ended session?
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::SessionClosed(_))
    }

    /// Writes applied before a failed flush, if this is a flush failure.
    pub fn applied_operations(&self) -> Option<&[AppliedOp]> {
        match self {
            Error::Flush(e) => Some(&e.applied),
            _ => None,
        }
    }

    /// Store error kind, looking through flush failures.
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Error::Store(e) => Some(e.kind),
            Error::Flush(e) => e.source.store_kind(),
            _ => None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind: StoreErrorKind::Unavailable,
            table: None,
            message: message.into(),
            source: None,
        })
    }

    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store(StoreError {
            kind: StoreErrorKind::ConstraintViolation,
            table: Some(table.into()),
            message: message.into(),
            source: None,
        })
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    pub fn state(kind: StateErrorKind, entity: &'static str, message: impl Into<String>) -> Self {
        Error::State(StateError {
            kind,
            entity,
            message: message.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::State(e) => write!(f, "{}: {}", e.entity, e.message),
            Error::SessionClosed(phase) => write!(f, "Session closed ({:?})", phase),
            Error::Flush(e) => write!(
                f,
                "Flush failed at {} after {} applied operation(s): {}",
                e.failed,
                e.applied.len(),
                e.source
            ),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{:?} on '{}': {}", self.kind, table, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Flush(e) => Some(e.source.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias for rowmap operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_error_reports_applied_ops() {
        let err = Error::Flush(FlushError {
            applied: vec![AppliedOp {
                kind: OpKind::Insert,
                entity: "Course",
                id: Some(EntityId(1)),
            }],
            failed: AppliedOp {
                kind: OpKind::Insert,
                entity: "Review",
                id: None,
            },
            source: Box::new(Error::constraint("ReviewDetails", "rating is null")),
        });

        assert_eq!(err.applied_operations().map(<[AppliedOp]>::len), Some(1));
        assert_eq!(err.store_kind(), Some(StoreErrorKind::ConstraintViolation));
        assert!(!err.is_retryable());
        let text = err.to_string();
        assert!(text.contains("INSERT Review#<new>"));
        assert!(text.contains("1 applied"));
    }

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(Error::unavailable("down").is_retryable());
        assert!(!Error::SessionClosed(SessionPhase::Committed).is_retryable());
        assert!(Error::SessionClosed(SessionPhase::Committed).is_session_closed());
    }
}
