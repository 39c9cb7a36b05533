//! Error types for the sync engine

use thiserror::Error;

use crate::executor::ExecutorError;
use opsync_store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Store I/O failed. Aborts the current replay cycle only; queued
    /// records are left untouched for the next one.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
