//! The caller-supplied remote operation executor

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use opsync_store::OperationKind;

/// Typed failure returned by an executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The remote side rejected the operation outright.
    #[error("Operation rejected by remote: {0}")]
    Rejected(String),

    /// The operation never reached the remote side.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The configured per-operation timeout elapsed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Performs one queued mutation against the remote system.
///
/// The engine knows nothing about transport; it only sees the record's kind
/// and opaque payload. Delivery is at-least-once: a retried record may reach
/// the remote side more than once, and implementations must tolerate
/// duplicate application of the same logical operation.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        kind: OperationKind,
        payload: &serde_json::Value,
    ) -> Result<(), ExecutorError>;
}
