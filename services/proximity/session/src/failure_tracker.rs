//! Send failure tracker for detecting interrupted sessions

use proximity_storage::PeerIdentity;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Tracks consecutive send failures per peer
#[derive(Debug)]
pub struct SendFailureTracker {
    /// Failure state per peer
    failures: HashMap<PeerIdentity, FailureInfo>,
    /// Threshold for considering a session interrupted
    failure_threshold: u32,
    /// Time window for failure counting
    failure_window: Duration,
}

#[derive(Debug, Clone)]
struct FailureInfo {
    /// Number of consecutive failures
    count: u32,
    /// Timestamp of first failure in current sequence
    first_failure: Instant,
    /// Timestamp of last failure
    last_failure: Instant,
    /// Whether the interruption was already reported
    interruption_notified: bool,
}

impl SendFailureTracker {
    /// Create a new tracker
    pub fn new(failure_threshold: u32, failure_window: Duration) -> Self {
        Self {
            failures: HashMap::new(),
            failure_threshold,
            failure_window,
        }
    }

    /// Record a failed send. Returns the failure count and whether this
    /// failure crossed the threshold.
    pub fn record_failure(&mut self, peer: &PeerIdentity) -> (u32, bool) {
        let now = Instant::now();

        let info = self.failures.entry(peer.clone()).or_insert(FailureInfo {
            count: 0,
            first_failure: now,
            last_failure: now,
            interruption_notified: false,
        });

        if now.duration_since(info.first_failure) > self.failure_window {
            // Start a new window
            info.count = 1;
            info.first_failure = now;
            info.interruption_notified = false;
        } else {
            info.count += 1;
        }
        info.last_failure = now;

        let should_notify = info.count >= self.failure_threshold && !info.interruption_notified;
        if should_notify {
            info.interruption_notified = true;
            warn!(
                "Session with {} interrupted after {} failed sends",
                peer, info.count
            );
        }

        debug!("Recorded send failure for {} (count: {})", peer, info.count);
        (info.count, should_notify)
    }

    /// Record a successful send. Returns true if the peer was interrupted.
    pub fn record_success(&mut self, peer: &PeerIdentity) -> bool {
        match self.failures.remove(peer) {
            Some(info) => {
                if info.interruption_notified {
                    debug!("Session with {} recovered", peer);
                }
                info.interruption_notified
            }
            None => false,
        }
    }

    /// Current failure count for a peer
    pub fn failure_count(&self, peer: &PeerIdentity) -> u32 {
        self.failures.get(peer).map(|info| info.count).unwrap_or(0)
    }

    /// Whether a peer is considered interrupted
    pub fn is_interrupted(&self, peer: &PeerIdentity) -> bool {
        self.failures
            .get(peer)
            .map(|info| info.interruption_notified)
            .unwrap_or(false)
    }

    /// Drop state for a peer whose session ended
    pub fn forget(&mut self, peer: &PeerIdentity) {
        self.failures.remove(peer);
    }

    /// Clean up stale failure records
    pub fn cleanup_old_failures(&mut self) {
        let now = Instant::now();
        let horizon = self.failure_window * 2;
        self.failures
            .retain(|_, info| now.duration_since(info.last_failure) < horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_threshold_and_recovery() {
        let mut tracker = SendFailureTracker::new(3, Duration::from_secs(30));
        let bob = PeerIdentity::from("Bob");

        assert_eq!(tracker.record_failure(&bob), (1, false));
        assert_eq!(tracker.record_failure(&bob), (2, false));
        assert_eq!(tracker.record_failure(&bob), (3, true));
        // Reported once per window
        assert_eq!(tracker.record_failure(&bob), (4, false));
        assert!(tracker.is_interrupted(&bob));

        assert!(tracker.record_success(&bob));
        assert!(!tracker.record_success(&bob));
        assert_eq!(tracker.failure_count(&bob), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_restarts_count() {
        let mut tracker = SendFailureTracker::new(3, Duration::from_secs(30));
        let bob = PeerIdentity::from("Bob");

        tracker.record_failure(&bob);
        tracker.record_failure(&bob);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.record_failure(&bob), (1, false));

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.cleanup_old_failures();
        assert_eq!(tracker.failure_count(&bob), 0);
    }
}
