//! Per-peer connection state machine.
//!
//! `Discovered -> Inviting -> Connected -> Disconnected`, with `Disconnected`
//! returning to `Discovered` on rediscovery. The registry holds exactly one
//! state per identity and reports which transitions changed the connected
//! set; everything else (profiles, timers, notifications) is the manager's
//! business.

use chrono::{DateTime, Utc};
use proximity_storage::{PeerIdentity, ProfileRecord};
use std::collections::{BTreeMap, HashMap};

/// Lifecycle state of a nearby peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Seen by browsing, no session
    Discovered,
    /// Invitation sent or session being established
    Inviting,
    /// Session is up
    Connected,
    /// Session dropped or was never established
    Disconnected,
}

/// Connected peer as shown to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedPeer {
    /// Peer identity
    pub id: PeerIdentity,
    /// Current state (always `Connected` in snapshots)
    pub state: ConnectionState,
    /// Cached profile, a placeholder until the peer shares its own
    pub profile: ProfileRecord,
    /// Info advertised during discovery
    pub discovery_info: HashMap<String, String>,
    /// When the session came up
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    state: ConnectionState,
    info: HashMap<String, String>,
    connected_at: Option<DateTime<Utc>>,
}

impl PeerEntry {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            info: HashMap::new(),
            connected_at: None,
        }
    }
}

/// Owner of every peer's connection state
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerIdentity, PeerEntry>,
    /// Connected identities in connection order
    connected: Vec<PeerIdentity>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `id`
    pub fn state(&self, id: &PeerIdentity) -> Option<ConnectionState> {
        self.peers.get(id).map(|e| e.state)
    }

    /// Whether `id` has a live session
    pub fn is_connected(&self, id: &PeerIdentity) -> bool {
        self.state(id) == Some(ConnectionState::Connected)
    }

    /// Record a discovery. Returns false when the peer is already connected
    /// or being invited, in which case nothing changes.
    pub fn discovered(&mut self, id: &PeerIdentity, info: HashMap<String, String>) -> bool {
        let entry = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntry::new(ConnectionState::Discovered));

        match entry.state {
            ConnectionState::Connected | ConnectionState::Inviting => false,
            ConnectionState::Discovered | ConnectionState::Disconnected => {
                entry.state = ConnectionState::Discovered;
                entry.info = info;
                true
            }
        }
    }

    /// Mark an outbound invitation or an establishing session
    pub fn inviting(&mut self, id: &PeerIdentity) {
        let entry = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntry::new(ConnectionState::Inviting));
        if entry.state != ConnectionState::Connected {
            entry.state = ConnectionState::Inviting;
        }
    }

    /// Record an established session. Returns true if the peer was not
    /// already connected.
    pub fn connected(&mut self, id: &PeerIdentity) -> bool {
        let entry = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntry::new(ConnectionState::Inviting));
        if entry.state == ConnectionState::Connected {
            return false;
        }

        entry.state = ConnectionState::Connected;
        entry.connected_at = Some(Utc::now());
        self.connected.push(id.clone());
        true
    }

    /// Record a dropped (or failed) session. Returns true if the peer was
    /// connected.
    pub fn disconnected(&mut self, id: &PeerIdentity) -> bool {
        let Some(entry) = self.peers.get_mut(id) else {
            return false;
        };
        let was_connected = entry.state == ConnectionState::Connected;
        entry.state = ConnectionState::Disconnected;
        entry.connected_at = None;
        if was_connected {
            self.connected.retain(|c| c != id);
        }
        was_connected
    }

    /// Forget a peer that left range. Returns true if it was connected.
    pub fn lost(&mut self, id: &PeerIdentity) -> bool {
        let was_connected = self.is_connected(id);
        self.peers.remove(id);
        if was_connected {
            self.connected.retain(|c| c != id);
        }
        was_connected
    }

    /// Connected identities in connection order
    pub fn connected_ids(&self) -> Vec<PeerIdentity> {
        self.connected.clone()
    }

    /// Number of connected peers
    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    /// Identities currently in `Discovered`
    pub fn discovered_ids(&self) -> Vec<PeerIdentity> {
        self.peers
            .iter()
            .filter(|(_, e)| e.state == ConnectionState::Discovered)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Discovery info and connection time of a peer
    pub fn details(
        &self,
        id: &PeerIdentity,
    ) -> Option<(&HashMap<String, String>, Option<DateTime<Utc>>)> {
        self.peers.get(id).map(|e| (&e.info, e.connected_at))
    }

    /// Drop every entry (transport torn down)
    pub fn clear(&mut self) {
        self.peers.clear();
        self.connected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> PeerIdentity {
        PeerIdentity::from("Bob")
    }

    #[test]
    fn test_full_lifecycle() {
        let mut registry = PeerRegistry::new();

        assert!(registry.discovered(&bob(), HashMap::new()));
        assert_eq!(registry.state(&bob()), Some(ConnectionState::Discovered));

        registry.inviting(&bob());
        assert_eq!(registry.state(&bob()), Some(ConnectionState::Inviting));
        // Rediscovery while inviting changes nothing
        assert!(!registry.discovered(&bob(), HashMap::new()));

        assert!(registry.connected(&bob()));
        assert!(!registry.connected(&bob()));
        assert_eq!(registry.connected_ids(), vec![bob()]);

        assert!(registry.disconnected(&bob()));
        assert!(!registry.disconnected(&bob()));
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.state(&bob()), Some(ConnectionState::Disconnected));

        // Disconnected peers return to Discovered when seen again
        assert!(registry.discovered(&bob(), HashMap::new()));
        assert_eq!(registry.discovered_ids(), vec![bob()]);
    }

    #[test]
    fn test_single_entry_per_peer() {
        let mut registry = PeerRegistry::new();
        registry.connected(&bob());
        registry.inviting(&bob());
        registry.connected(&bob());
        assert_eq!(registry.connected_ids().len(), 1);
        assert_eq!(registry.state(&bob()), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_lost_peer() {
        let mut registry = PeerRegistry::new();
        let carol = PeerIdentity::from("Carol");

        registry.discovered(&carol, HashMap::new());
        assert!(!registry.lost(&carol));
        assert_eq!(registry.state(&carol), None);

        registry.connected(&bob());
        assert!(registry.lost(&bob()));
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_connection_order_kept() {
        let mut registry = PeerRegistry::new();
        for name in ["Zed", "Amy", "Max"] {
            registry.connected(&PeerIdentity::from(name));
        }
        let names: Vec<String> = registry
            .connected_ids()
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(names, vec!["Zed", "Amy", "Max"]);
    }
}
