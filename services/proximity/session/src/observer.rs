//! Observable session state and discrete presence events.

use crate::config::DiscoveryFilterConfig;
use crate::error::SessionError;
use crate::registry::ConnectedPeer;
use proximity_storage::PeerIdentity;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Point-in-time view of the session, published after every change
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Local identity
    pub local_peer: Option<PeerIdentity>,
    /// Connected peers in connection order
    pub connected_peers: Vec<ConnectedPeer>,
    /// Peers seen but not connected
    pub discovered_peers: Vec<PeerIdentity>,
    /// Received chat log, `"<sender>: <text>"`
    pub received_messages: Vec<String>,
    /// Invitation awaiting the local user's answer
    pub pending_invitation: Option<PeerIdentity>,
    /// Most recent surfaced error
    pub last_error: Option<SessionError>,
    /// Advertising is active
    pub is_advertising: bool,
    /// Browsing is active
    pub is_browsing: bool,
    /// Both advertising and browsing are active
    pub is_scanning: bool,
    /// A reconnection cycle is running
    pub is_reconnecting: bool,
    /// Effective admission policy
    pub filter: DiscoveryFilterConfig,
    /// Full resets since start
    pub full_resets: u32,
    /// Payloads dropped as undecodable
    pub decode_failures: u64,
}

impl SessionSnapshot {
    /// Whether `id` is in the connected list
    pub fn is_connected(&self, id: &PeerIdentity) -> bool {
        self.connected_peers.iter().any(|p| &p.id == id)
    }
}

/// Trait for handling presence events
pub trait PresenceEventHandler: Send + Sync + std::fmt::Debug {
    /// A session came up
    fn notify_peer_connected(&self, peer: &PeerIdentity);
    /// A session went away
    fn notify_peer_disconnected(&self, peer: &PeerIdentity, reason: &str);
    /// Sends to a connected peer keep failing
    fn notify_peer_interrupted(&self, peer: &PeerIdentity, consecutive_failures: u32);
    /// Sends to an interrupted peer work again
    fn notify_peer_recovered(&self, peer: &PeerIdentity);
    /// Chat text arrived
    fn notify_message_received(&self, peer: &PeerIdentity, text: &str);
    /// An invitation waits for the local user
    fn notify_invitation(&self, peer: &PeerIdentity);
    /// An error was surfaced
    fn notify_error(&self, error: &SessionError);
}

/// Discrete presence event
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Session established
    PeerConnected(PeerIdentity),
    /// Session ended
    PeerDisconnected {
        /// Peer
        peer: PeerIdentity,
        /// Why it ended
        reason: String,
    },
    /// Sends keep failing
    PeerInterrupted {
        /// Peer
        peer: PeerIdentity,
        /// Failures in the current window
        consecutive_failures: u32,
    },
    /// Sends work again
    PeerRecovered(PeerIdentity),
    /// Chat text arrived
    MessageReceived {
        /// Sender
        peer: PeerIdentity,
        /// Text
        text: String,
    },
    /// Invitation waiting for an answer
    InvitationPending(PeerIdentity),
    /// Surfaced error
    Error(SessionError),
}

/// Handler forwarding every event into a channel
#[derive(Debug, Clone)]
pub struct ChannelEventHandler {
    event_tx: mpsc::UnboundedSender<PresenceEvent>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiving end of its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenceEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self { event_tx }, event_rx)
    }

    fn send_event(&self, event: PresenceEvent) {
        debug!("Presence event {:?}", event);
        if let Err(e) = self.event_tx.send(event) {
            error!("Failed to send presence event {:?}", e.0);
        }
    }
}

impl PresenceEventHandler for ChannelEventHandler {
    fn notify_peer_connected(&self, peer: &PeerIdentity) {
        self.send_event(PresenceEvent::PeerConnected(peer.clone()));
    }

    fn notify_peer_disconnected(&self, peer: &PeerIdentity, reason: &str) {
        self.send_event(PresenceEvent::PeerDisconnected {
            peer: peer.clone(),
            reason: reason.to_string(),
        });
    }

    fn notify_peer_interrupted(&self, peer: &PeerIdentity, consecutive_failures: u32) {
        self.send_event(PresenceEvent::PeerInterrupted {
            peer: peer.clone(),
            consecutive_failures,
        });
    }

    fn notify_peer_recovered(&self, peer: &PeerIdentity) {
        self.send_event(PresenceEvent::PeerRecovered(peer.clone()));
    }

    fn notify_message_received(&self, peer: &PeerIdentity, text: &str) {
        self.send_event(PresenceEvent::MessageReceived {
            peer: peer.clone(),
            text: text.to_string(),
        });
    }

    fn notify_invitation(&self, peer: &PeerIdentity) {
        self.send_event(PresenceEvent::InvitationPending(peer.clone()));
    }

    fn notify_error(&self, error: &SessionError) {
        self.send_event(PresenceEvent::Error(error.clone()));
    }
}
