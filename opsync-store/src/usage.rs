//! Advisory storage-usage accounting
//!
//! Usage never gates writes; it exists so the application can surface "how
//! much offline data is queued" to the user.

use serde::{Deserialize, Serialize};

/// Snapshot of how much of the backing storage is in use, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used: u64,
    pub available: u64,
    pub quota: u64,
    pub percentage: f32,
}

impl StorageUsage {
    /// Build a snapshot from measured usage against a soft quota.
    pub fn from_used(used: u64, quota: u64) -> Self {
        let available = quota.saturating_sub(used);
        let percentage = if quota == 0 {
            0.0
        } else {
            (used as f32 / quota as f32) * 100.0
        };
        Self {
            used,
            available,
            quota,
            percentage,
        }
    }

    /// Zeroed snapshot for platforms that cannot report usage.
    pub fn unknown() -> Self {
        Self::default()
    }
}
