//! Reachability observation and derived connection quality
//!
//! The monitor consumes two edge-triggered facts from the host platform -
//! "became reachable" and "became unreachable" - and exposes a single boolean
//! state plus a watch-based subscription. It never decides whether to replay;
//! it only reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Sentinel for "no online edge seen yet".
const NEVER: u64 = u64::MAX;

/// Coarse tier summarizing recency of successful sync activity.
///
/// Purely cosmetic; never gates replay decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Offline,
    Poor,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Derive the tier from reachability and the last successful sync time.
    pub fn derive(reachable: bool, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        if !reachable {
            return ConnectionQuality::Offline;
        }
        match last_sync {
            None => ConnectionQuality::Poor,
            Some(at) => {
                let age = now.signed_duration_since(at);
                if age < chrono::Duration::seconds(5) {
                    ConnectionQuality::Excellent
                } else if age <= chrono::Duration::seconds(30) {
                    ConnectionQuality::Good
                } else {
                    ConnectionQuality::Poor
                }
            }
        }
    }
}

/// Result of feeding one reachability report into the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The host reported the state the monitor was already in.
    Unchanged,
    BecameReachable,
    BecameUnreachable,
    /// The reachable edge landed inside the debounce window. State is
    /// updated, but the edge should not re-trigger replay.
    SuppressedFlap,
}

/// Observes binary reachability transitions.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    /// Debounce window in milliseconds; 0 disables suppression.
    debounce_ms: AtomicU64,
    /// Milliseconds since `epoch` of the last online edge.
    last_online_edge_ms: AtomicU64,
    epoch: Instant,
}

impl ConnectivityMonitor {
    /// New monitor, starting unreachable.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state,
            debounce_ms: AtomicU64::new(0),
            last_online_edge_ms: AtomicU64::new(NEVER),
            epoch: Instant::now(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Watch-based state subscription. Rapid flapping may be coalesced by the
    /// channel; the latest state is always observable.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn set_debounce(&self, window: Option<Duration>) {
        let ms = window.map(|w| w.as_millis() as u64).unwrap_or(0);
        self.debounce_ms.store(ms, Ordering::SeqCst);
    }

    /// Feed one reachability report from the host platform.
    pub fn set_reachable(&self, reachable: bool) -> Transition {
        let changed = self.state.send_if_modified(|current| {
            if *current != reachable {
                *current = reachable;
                true
            } else {
                false
            }
        });
        if !changed {
            return Transition::Unchanged;
        }

        if !reachable {
            info!("Connectivity lost");
            return Transition::BecameUnreachable;
        }

        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let previous = self.last_online_edge_ms.swap(now_ms, Ordering::SeqCst);
        let window_ms = self.debounce_ms.load(Ordering::SeqCst);
        if window_ms > 0 && previous != NEVER && now_ms.saturating_sub(previous) < window_ms {
            debug!(
                "Suppressing reachability flap ({}ms since previous online edge)",
                now_ms.saturating_sub(previous)
            );
            return Transition::SuppressedFlap;
        }

        info!("Connectivity restored");
        Transition::BecameReachable
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seconds_ago(n: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(now - chrono::Duration::seconds(n))
    }

    #[test]
    fn test_quality_tiers() {
        let now = Utc::now();
        assert_eq!(
            ConnectionQuality::derive(false, seconds_ago(1, now), now),
            ConnectionQuality::Offline
        );
        assert_eq!(
            ConnectionQuality::derive(true, None, now),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::derive(true, seconds_ago(60, now), now),
            ConnectionQuality::Poor
        );
        assert_eq!(
            ConnectionQuality::derive(true, seconds_ago(10, now), now),
            ConnectionQuality::Good
        );
        assert_eq!(
            ConnectionQuality::derive(true, seconds_ago(2, now), now),
            ConnectionQuality::Excellent
        );
    }

    #[test]
    fn test_edges_are_deduplicated() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.set_reachable(false), Transition::Unchanged);
        assert_eq!(monitor.set_reachable(true), Transition::BecameReachable);
        assert_eq!(monitor.set_reachable(true), Transition::Unchanged);
        assert_eq!(monitor.set_reachable(false), Transition::BecameUnreachable);
        assert!(!monitor.is_reachable());
    }

    #[test]
    fn test_flap_suppression_within_window() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_debounce(Some(Duration::from_secs(60)));

        assert_eq!(monitor.set_reachable(true), Transition::BecameReachable);
        monitor.set_reachable(false);
        // Second online edge arrives well inside the window.
        assert_eq!(monitor.set_reachable(true), Transition::SuppressedFlap);
        // State itself still tracks the raw transitions.
        assert!(monitor.is_reachable());
    }

    #[test]
    fn test_raw_transitions_without_debounce() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_reachable(true);
        monitor.set_reachable(false);
        assert_eq!(monitor.set_reachable(true), Transition::BecameReachable);
    }

    #[test]
    fn test_subscription_sees_latest_state() {
        let monitor = ConnectivityMonitor::new();
        let rx = monitor.subscribe();
        monitor.set_reachable(true);
        assert!(*rx.borrow());
    }
}
