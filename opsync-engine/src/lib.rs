//! Offline-first synchronization engine
//!
//! This crate provides the replay side of the offline queue:
//! - Connectivity monitoring and derived connection quality
//! - The sync manager: an Idle/Replaying state machine with deterministic
//!   ordering and bounded retries
//! - The executor contract the application injects
//! - The offline coordinator facade and its aggregate observable state

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod errors;
pub mod executor;
pub mod manager;
pub mod status;

pub use config::SyncConfig;
pub use connectivity::{ConnectionQuality, ConnectivityMonitor, Transition};
pub use coordinator::{DroppedRecord, OfflineCoordinator, OfflineState, Subscription};
pub use errors::{Result, SyncError};
pub use executor::{ExecutorError, OperationExecutor};
pub use manager::{replay_order, CycleOutcome, SyncEvent, SyncManager};
pub use status::SyncStatus;
