//! Transport port: the radio-facing capability the manager drives.
//!
//! A transport advertises the local identity, browses for nearby peers,
//! issues invitations and delivers opaque payloads. Everything it observes
//! comes back to the manager as [`TransportEvent`]s on an unbounded channel.
//! All calls are non-blocking; results of invitations arrive as events.

use crate::error::TransportError;
use bytes::Bytes;
use proximity_storage::PeerIdentity;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Per-peer session state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Invitation accepted, session being established
    Connecting,
    /// Session is up
    Connected,
    /// Session is gone or never came up
    NotConnected,
}

/// Accept/decline continuation attached to an inbound invitation
pub struct InvitationResponder {
    reply: oneshot::Sender<bool>,
}

impl InvitationResponder {
    /// Create a responder and the receiver the transport waits on
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply }, rx)
    }

    /// Answer the invitation
    pub fn respond(self, accept: bool) {
        // The inviter may have timed out already
        let _ = self.reply.send(accept);
    }

    /// Accept the invitation
    pub fn accept(self) {
        self.respond(true)
    }

    /// Decline the invitation
    pub fn decline(self) {
        self.respond(false)
    }
}

impl fmt::Debug for InvitationResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationResponder")
            .field("answered", &self.reply.is_closed())
            .finish()
    }
}

/// Event observed by the transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A nearby peer is advertising
    PeerDiscovered {
        /// Discovered peer
        peer: PeerIdentity,
        /// Advertised discovery info
        info: HashMap<String, String>,
    },
    /// A previously discovered peer went out of range
    PeerLost {
        /// Lost peer
        peer: PeerIdentity,
    },
    /// A peer's session state changed
    ConnectionStateChanged {
        /// Affected peer
        peer: PeerIdentity,
        /// New state
        state: PeerConnectionState,
    },
    /// A peer wants to open a session with us
    InvitationReceived {
        /// Inviting peer
        peer: PeerIdentity,
        /// Continuation to accept or decline
        responder: InvitationResponder,
    },
    /// Payload delivered by a connected peer
    PayloadReceived {
        /// Sender
        peer: PeerIdentity,
        /// Raw payload
        payload: Bytes,
    },
    /// Advertising stopped with an error
    AdvertiseFailed {
        /// Transport-specific reason
        reason: String,
    },
    /// Browsing stopped with an error
    BrowseFailed {
        /// Transport-specific reason
        reason: String,
    },
    /// The radio was switched on or off
    RadioStateChanged {
        /// Whether the radio is usable
        powered_on: bool,
    },
}

/// Receiving side of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Radio-facing operations used by the manager
pub trait TransportPort: Send {
    /// Announce the local identity
    fn start_advertising(&mut self) -> Result<(), TransportError>;

    /// Stop announcing
    fn stop_advertising(&mut self);

    /// Scan for advertising peers
    fn start_browsing(&mut self) -> Result<(), TransportError>;

    /// Stop scanning
    fn stop_browsing(&mut self);

    /// Invite a discovered peer; the outcome arrives as a state change
    fn invite(&mut self, peer: &PeerIdentity, timeout: Duration) -> Result<(), TransportError>;

    /// Hand a payload to one connected peer
    fn send(&mut self, payload: Bytes, peer: &PeerIdentity) -> Result<(), TransportError>;

    /// Drop the session with one peer
    fn disconnect(&mut self, _peer: &PeerIdentity) {}

    /// Tear down the whole transport session
    fn shutdown(&mut self) {}
}

/// Creates transports once the local identity is known
pub trait TransportFactory: Send + Sync {
    /// Create a transport session for `local` announcing `service_type`
    fn create(
        &self,
        local: &PeerIdentity,
        service_type: &str,
    ) -> Result<(Box<dyn TransportPort>, TransportEvents), TransportError>;
}
