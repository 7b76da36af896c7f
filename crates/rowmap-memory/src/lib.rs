//! In-memory row store for rowmap.
//!
//! [`MemoryStore`] implements the `RowStore` adapter trait over plain maps
//! guarded by a mutex. It is the reference adapter used by the test suites
//! and doubles as an instrumented fake:
//!
//! - per-operation call counters and a journal of applied writes
//! - raw row inspection that ignores soft-delete flags
//! - NOT NULL checks, and foreign key checks when built with a schema
//! - one-shot fault injection by operation, table and position
//!
//! # Example
//!
//! ```
//! use rowmap_core::{ColumnInfo, EntityType, Row, RowStore, SqlType, Value};
//! use rowmap_memory::MemoryStore;
//!
//! static COURSE: EntityType = EntityType::new("Course", "CourseDetails")
//!     .columns(&[ColumnInfo::new("name", "courseName", SqlType::Text)]);
//!
//! let store = MemoryStore::new();
//! let id = store
//!     .insert(&COURSE, &Row::from_pairs([("courseName", Value::from("JPA in 50 Steps"))]))
//!     .unwrap();
//! let row = store.fetch_row(&COURSE, id).unwrap().unwrap();
//! assert_eq!(row.get("courseName"), Some(&Value::from("JPA in 50 Steps")));
//! assert_eq!(store.counts().insert, 1);
//! ```

pub mod faults;
pub mod store;

pub use faults::{CallCounts, Fault, JournalEntry, StoreOp};
pub use store::MemoryStore;
