//! Session error taxonomy.
//!
//! Every error the manager surfaces ends up in the snapshot's `last_error`
//! slot, so the types here are `Clone` and carry string payloads only.

use proximity_storage::{PeerIdentity, StorageError};
use proximity_wire::WireError;
use std::fmt;
use thiserror::Error;

/// Failures reported by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Advertising could not start
    #[error("advertising failed: {0}")]
    Advertise(String),

    /// Browsing could not start
    #[error("browsing failed: {0}")]
    Browse(String),

    /// Invitation could not be issued
    #[error("invite to {peer} failed: {reason}")]
    Invite {
        /// Invited peer
        peer: PeerIdentity,
        /// Transport-specific reason
        reason: String,
    },

    /// Payload could not be handed to the peer
    #[error("send to {peer} failed: {reason}")]
    Send {
        /// Recipient
        peer: PeerIdentity,
        /// Transport-specific reason
        reason: String,
    },

    /// The transport session could not be created
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the session manager
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Transport call failed; retried, never fatal
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Profile store read or write failed; in-memory state is kept
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Inbound payload could not be decoded
    #[error("decode failed: {0}")]
    Decode(#[from] WireError),

    /// A requested setting was out of range and has been clamped
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Targeted send to a peer without a live session
    #[error("peer {0} is not connected")]
    NotConnected(PeerIdentity),

    /// Repeated full resets did not restore any session
    #[error("connectivity lost after {resets} transport resets")]
    ConnectivityLost {
        /// Consecutive resets so far
        resets: u32,
    },

    /// The manager has stopped
    #[error("session manager is closed")]
    Closed,
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

/// Coarse error classes for presentation and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transport failures
    Transport,
    /// Store failures
    Persistence,
    /// Malformed inbound data
    Decode,
    /// Clamped or refused settings
    Policy,
    /// Target peer not connected
    NotConnected,
    /// Connectivity lost
    Connectivity,
    /// Manager stopped
    Closed,
}

impl ErrorCategory {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::Decode => "decode",
            ErrorCategory::Policy => "policy",
            ErrorCategory::NotConnected => "not_connected",
            ErrorCategory::Connectivity => "connectivity",
            ErrorCategory::Closed => "closed",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionError {
    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::Transport(_) => ErrorCategory::Transport,
            SessionError::Persistence(_) => ErrorCategory::Persistence,
            SessionError::Decode(_) => ErrorCategory::Decode,
            SessionError::PolicyViolation(_) => ErrorCategory::Policy,
            SessionError::NotConnected(_) => ErrorCategory::NotConnected,
            SessionError::ConnectivityLost { .. } => ErrorCategory::Connectivity,
            SessionError::Closed => ErrorCategory::Closed,
        }
    }

    /// Text suitable for showing to the local user
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Transport(TransportError::Advertise(_))
            | SessionError::Transport(TransportError::Browse(_)) => {
                "Nearby discovery is unavailable right now. Retrying.".to_string()
            }
            SessionError::Transport(TransportError::Send { peer, .. }) => {
                format!("Message to {} could not be delivered.", peer)
            }
            SessionError::Transport(_) => "Connection problem. Retrying.".to_string(),
            SessionError::Persistence(_) => "Could not save profile data.".to_string(),
            SessionError::Decode(_) => "Received an unreadable message.".to_string(),
            SessionError::PolicyViolation(detail) => format!("Setting adjusted: {}", detail),
            SessionError::NotConnected(peer) => format!("{} is not connected.", peer),
            SessionError::ConnectivityLost { .. } => {
                "No nearby peers reachable. Still searching.".to_string()
            }
            SessionError::Closed => "Session has ended.".to_string(),
        }
    }
}
