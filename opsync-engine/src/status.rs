//! Replay cycle status reporting

use serde::{Deserialize, Serialize};

/// Ephemeral snapshot of the replay cycle in flight. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// True exactly while a replay cycle is running.
    pub is_active: bool,
    /// 0-100, share of the current cycle's initial batch processed.
    pub progress: u8,
    /// Human-readable descriptor of the operation in flight.
    pub current_operation: Option<String>,
    /// Last cycle-level error.
    pub error: Option<String>,
    /// Operations confirmed in the current cycle.
    pub completed: usize,
    /// Size of the current cycle's initial batch.
    pub total: usize,
}

impl SyncStatus {
    /// Status at the start of a cycle over `total` records.
    pub(crate) fn begin(total: usize) -> Self {
        Self {
            is_active: true,
            progress: 0,
            current_operation: None,
            error: None,
            completed: 0,
            total,
        }
    }

    /// Progress before processing the record at `index` of `total`.
    pub(crate) fn batch_progress(index: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        ((index * 100) / total) as u8
    }
}
