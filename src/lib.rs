//! Opsync workspace root
//!
//! This crate serves as the root of the opsync workspace and contains
//! integration tests that exercise the store and engine crates together.

// Re-export major components for applications and integration testing
pub use opsync_engine as engine;
pub use opsync_store as store;
