//! Durable pending-operation storage for the opsync engine
//!
//! This crate provides the leaf persistence layer:
//! - Operation records (the unit of durable, not-yet-confirmed work)
//! - The `PendingStore` contract consumed by the sync engine
//! - A SQLite-backed store and an in-memory store for tests
//! - Advisory storage-usage accounting

pub mod errors;
pub mod record;
pub mod store;
pub mod usage;

pub use errors::{Result, StoreError};
pub use record::{generate_operation_id, OperationKind, OperationPriority, OperationRecord};
pub use store::{CycleRecord, MemoryStore, PendingStore, SqliteStore, DEFAULT_SOFT_QUOTA};
pub use usage::StorageUsage;
