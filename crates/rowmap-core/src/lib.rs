//! Core types and traits for rowmap.
//!
//! This crate provides the foundations the session layer builds on:
//!
//! - `Value`, `Row` and `EntityId` for data exchanged with storage
//! - Static `EntityType` schema declarations registered into a `Schema`
//! - `EntityInstance` objects and shared `EntityRef` handles
//! - Two-state `Lazy` relationship references and the `LazyLoader` seam
//! - The `RowStore` adapter trait

pub mod entity;
pub mod error;
pub mod identifiers;
pub mod lazy;
pub mod row;
pub mod schema;
pub mod store;
pub mod value;

pub use entity::{
    EntityInstance, EntityRef, ForeignKey, Related, entity_id, read_entity, resolve, snapshot,
    write_entity,
};
pub use error::{
    AppliedOp, Error, FlushError, OpKind, Result, SchemaError, SchemaErrorKind, SessionPhase,
    StateError, StateErrorKind, StoreError, StoreErrorKind, TypeError,
};
pub use identifiers::is_valid_identifier;
pub use lazy::{Lazy, LazyLoader, LazySource, Resolved};
pub use row::{FromValue, Row};
pub use schema::{
    CascadePolicy, ColumnInfo, EntityType, LinkTableInfo, Multiplicity, OwningSide,
    RelationshipInfo, RelationshipKind, Schema, SchemaBuilder, SqlType,
};
pub use store::{RowStore, WriteStatus};
pub use value::{EntityId, Value};
