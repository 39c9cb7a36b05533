//! Runtime-tunable engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Observable configuration for the sync engine.
///
/// All fields are mutable at runtime through the coordinator; changing
/// `sync_interval` while auto-sync is running restarts the timer with the new
/// period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Start automatic replay as soon as the coordinator comes up.
    pub enable_sync: bool,
    /// Period of the automatic replay timer.
    pub sync_interval: Duration,
    /// Failed attempts a record gets before it is dropped.
    pub max_retries: u32,
    /// Pause after a failed executor call before the next record in the
    /// batch.
    pub retry_delay: Duration,
    /// Optional bound on a single executor call. `None` preserves the
    /// unbounded wait of the original design.
    pub op_timeout: Option<Duration>,
    /// Optional suppression window for reachability flapping. `None` reacts
    /// to every raw transition.
    pub debounce: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_sync: true,
            sync_interval: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            op_timeout: None,
            debounce: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert!(config.enable_sync);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.op_timeout, None);
        assert_eq!(config.debounce, None);
    }
}
