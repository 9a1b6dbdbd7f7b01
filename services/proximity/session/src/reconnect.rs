//! Reconnection controller and discovery retry backoff.
//!
//! Both are pure state machines over deadlines; the manager's event loop
//! sleeps until [`ReconnectController::deadline`] and then calls
//! [`ReconnectController::poll`]. Cancelling a cycle clears the deadline.

use crate::config::ReconnectConfig;
use proximity_storage::PeerIdentity;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stage inside a reconnection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStage {
    /// Waiting before re-inviting remembered peers
    Grace,
    /// Re-invites sent, waiting before a full reset
    Recovery,
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Nothing pending
    Idle,
    /// A cycle is running
    Reconnecting(ReconnectStage),
    /// The transport is being recreated
    FullReset,
}

/// What the manager must do when a deadline fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Invite each of these remembered peers again
    Reinvite(Vec<PeerIdentity>),
    /// Tear down and recreate the transport, then restart discovery
    FullReset,
}

/// Drives recovery when the connected set becomes empty
#[derive(Debug)]
pub struct ReconnectController {
    config: ReconnectConfig,
    phase: ReconnectPhase,
    deadline: Option<Instant>,
    /// Last known-connected identities, oldest first
    remembered: VecDeque<PeerIdentity>,
    /// Consecutive resets without a restored session
    resets: u32,
}

impl ReconnectController {
    /// Create an idle controller
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            phase: ReconnectPhase::Idle,
            deadline: None,
            remembered: VecDeque::new(),
            resets: 0,
        }
    }

    /// Current phase
    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Whether a cycle is in progress
    pub fn is_reconnecting(&self) -> bool {
        self.phase != ReconnectPhase::Idle
    }

    /// Pending deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consecutive resets so far
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Remembered identities, oldest first
    pub fn remembered(&self) -> Vec<PeerIdentity> {
        self.remembered.iter().cloned().collect()
    }

    /// Remember a peer that just connected
    pub fn remember(&mut self, id: &PeerIdentity) {
        self.remembered.retain(|r| r != id);
        self.remembered.push_back(id.clone());
        while self.remembered.len() > self.config.max_remembered {
            self.remembered.pop_front();
        }
    }

    /// Stop remembering a peer (evicted by the filter)
    pub fn forget(&mut self, id: &PeerIdentity) {
        self.remembered.retain(|r| r != id);
    }

    /// Grace interval for the next cycle, backed off by previous resets
    fn grace_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.resets.min(16));
        self.config
            .grace
            .saturating_mul(factor)
            .min(self.config.max_backoff.max(self.config.grace))
    }

    /// The connected set became empty. Returns true if a cycle was armed.
    pub fn on_connected_set_empty(&mut self, now: Instant) -> bool {
        if self.phase != ReconnectPhase::Idle {
            return false;
        }

        let delay = self.grace_delay();
        self.phase = ReconnectPhase::Reconnecting(ReconnectStage::Grace);
        self.deadline = Some(now + delay);
        info!(
            "No connected peers, re-inviting {} remembered peers in {:?}",
            self.remembered.len(),
            delay
        );
        true
    }

    /// A peer connected. Returns true if a pending cycle was cancelled.
    pub fn on_connected(&mut self) -> bool {
        let was_reconnecting = self.is_reconnecting();
        if was_reconnecting {
            debug!("Reconnection cycle cancelled by new connection");
        }
        self.phase = ReconnectPhase::Idle;
        self.deadline = None;
        self.resets = 0;
        was_reconnecting
    }

    /// Abandon any pending cycle (discovery stopped)
    pub fn cancel(&mut self) {
        self.phase = ReconnectPhase::Idle;
        self.deadline = None;
        self.resets = 0;
    }

    /// Advance the cycle if its deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<ReconnectAction> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }

        match self.phase {
            ReconnectPhase::Reconnecting(ReconnectStage::Grace) => {
                self.phase = ReconnectPhase::Reconnecting(ReconnectStage::Recovery);
                self.deadline = Some(now + self.config.recovery);
                Some(ReconnectAction::Reinvite(self.remembered()))
            }
            ReconnectPhase::Reconnecting(ReconnectStage::Recovery) => {
                self.phase = ReconnectPhase::FullReset;
                self.deadline = None;
                self.resets = self.resets.saturating_add(1);
                warn!("Reconnection failed, performing full reset #{}", self.resets);
                Some(ReconnectAction::FullReset)
            }
            ReconnectPhase::Idle | ReconnectPhase::FullReset => {
                self.deadline = None;
                None
            }
        }
    }

    /// The full reset finished; arm the next cycle with backoff
    pub fn reset_completed(&mut self, now: Instant) {
        self.phase = ReconnectPhase::Idle;
        self.deadline = None;
        self.on_connected_set_empty(now);
    }

    /// Whether connectivity loss should be reported after the last reset
    pub fn connectivity_lost(&self) -> bool {
        self.config.alert_after_resets > 0 && self.resets >= self.config.alert_after_resets
    }
}

/// Exponential backoff for restarting discovery after a failure
#[derive(Debug)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
    deadline: Option<Instant>,
}

impl RetryBackoff {
    /// Create an idle backoff
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
            deadline: None,
        }
    }

    /// Schedule a retry unless one is pending. Returns the delay used.
    pub fn schedule(&mut self, now: Instant) -> Option<Duration> {
        if self.deadline.is_some() {
            return None;
        }
        let delay = match self.current {
            Some(current) => current.saturating_mul(2).min(self.max),
            None => self.initial,
        };
        self.current = Some(delay);
        self.deadline = Some(now + delay);
        Some(delay)
    }

    /// Pending deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the pending retry is due; consumes it
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Forget accumulated backoff
    pub fn reset(&mut self) {
        self.current = None;
        self.deadline = None;
    }
}
