//! In-process transport hub.
//!
//! Every [`LoopbackTransport`] registered on the same [`LoopbackHub`] sees the
//! others as nearby peers: advertising and browsing produce discovery events,
//! invitations are answered through the invitee's event stream, and payloads
//! are delivered directly into the recipient's channel. Used by tests and the
//! node binary's simulation mode.

use crate::error::TransportError;
use crate::transport::{
    InvitationResponder, PeerConnectionState, TransportEvent, TransportEvents, TransportFactory,
    TransportPort,
};
use bytes::Bytes;
use dashmap::DashMap;
use proximity_storage::PeerIdentity;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

struct Endpoint {
    generation: u64,
    service_type: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    info: HashMap<String, String>,
    advertising: bool,
    browsing: bool,
    radio_on: bool,
}

#[derive(Default)]
struct HubInner {
    endpoints: DashMap<PeerIdentity, Endpoint>,
    /// Live sessions keyed by the ordered identity pair
    links: DashMap<(PeerIdentity, PeerIdentity), ()>,
    next_generation: AtomicU64,
}

fn link_key(a: &PeerIdentity, b: &PeerIdentity) -> (PeerIdentity, PeerIdentity) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing transports on this hub
    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            hub: self.clone(),
            info: HashMap::new(),
        }
    }

    /// Number of live sessions
    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Whether `a` and `b` share a session
    pub fn is_linked(&self, a: &PeerIdentity, b: &PeerIdentity) -> bool {
        self.inner.links.contains_key(&link_key(a, b))
    }

    fn emit(&self, to: &PeerIdentity, event: TransportEvent) {
        if let Some(endpoint) = self.inner.endpoints.get(to) {
            // Receiver gone means that manager has stopped
            let _ = endpoint.events.send(event);
        }
    }

    fn register(
        &self,
        local: &PeerIdentity,
        service_type: &str,
        info: HashMap<String, String>,
    ) -> (u64, TransportEvents) {
        let stale = self.inner.endpoints.get(local).map(|e| e.generation);
        if let Some(generation) = stale {
            self.teardown(local, generation);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.insert(
            local.clone(),
            Endpoint {
                generation,
                service_type: service_type.to_string(),
                events: tx,
                info,
                advertising: false,
                browsing: false,
                radio_on: true,
            },
        );
        info!("Loopback endpoint {} registered (generation {})", local, generation);
        (generation, rx)
    }

    fn set_advertising(&self, local: &PeerIdentity, on: bool) -> Result<(), TransportError> {
        let (service_type, info) = {
            let mut endpoint = self
                .inner
                .endpoints
                .get_mut(local)
                .ok_or_else(|| TransportError::Advertise("endpoint not registered".into()))?;
            if on && !endpoint.radio_on {
                return Err(TransportError::Advertise("radio is off".into()));
            }
            endpoint.advertising = on;
            (endpoint.service_type.clone(), endpoint.info.clone())
        };

        if on {
            for browser in self.peers_where(local, &service_type, |e| e.browsing) {
                self.emit(
                    &browser,
                    TransportEvent::PeerDiscovered {
                        peer: local.clone(),
                        info: info.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn set_browsing(&self, local: &PeerIdentity, on: bool) -> Result<(), TransportError> {
        let service_type = {
            let mut endpoint = self
                .inner
                .endpoints
                .get_mut(local)
                .ok_or_else(|| TransportError::Browse("endpoint not registered".into()))?;
            if on && !endpoint.radio_on {
                return Err(TransportError::Browse("radio is off".into()));
            }
            endpoint.browsing = on;
            endpoint.service_type.clone()
        };

        if on {
            let advertisers: Vec<(PeerIdentity, HashMap<String, String>)> = self
                .inner
                .endpoints
                .iter()
                .filter(|e| {
                    e.key() != local
                        && e.service_type == service_type
                        && e.advertising
                        && e.radio_on
                })
                .map(|e| (e.key().clone(), e.info.clone()))
                .collect();
            for (peer, info) in advertisers {
                self.emit(local, TransportEvent::PeerDiscovered { peer, info });
            }
        }
        Ok(())
    }

    fn peers_where(
        &self,
        local: &PeerIdentity,
        service_type: &str,
        predicate: impl Fn(&Endpoint) -> bool,
    ) -> Vec<PeerIdentity> {
        self.inner
            .endpoints
            .iter()
            .filter(|e| {
                e.key() != local && e.service_type == service_type && e.radio_on && predicate(e)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    fn invite(
        &self,
        from: &PeerIdentity,
        to: &PeerIdentity,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let reachable = self
            .inner
            .endpoints
            .get(to)
            .map(|e| e.advertising && e.radio_on)
            .unwrap_or(false);
        if !reachable {
            return Err(TransportError::Invite {
                peer: to.clone(),
                reason: "peer not reachable".into(),
            });
        }
        if self.is_linked(from, to) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TransportError::Invite {
            peer: to.clone(),
            reason: e.to_string(),
        })?;

        let (responder, answer) = InvitationResponder::new();
        self.emit(
            to,
            TransportEvent::InvitationReceived {
                peer: from.clone(),
                responder,
            },
        );
        self.emit(
            from,
            TransportEvent::ConnectionStateChanged {
                peer: to.clone(),
                state: PeerConnectionState::Connecting,
            },
        );

        let hub = self.clone();
        let from = from.clone();
        let to = to.clone();
        runtime.spawn(async move {
            match tokio::time::timeout(timeout, answer).await {
                Ok(Ok(true)) => hub.link(&from, &to),
                outcome => {
                    debug!("Invitation {} -> {} not accepted: {:?}", from, to, outcome);
                    hub.emit(
                        &from,
                        TransportEvent::ConnectionStateChanged {
                            peer: to,
                            state: PeerConnectionState::NotConnected,
                        },
                    );
                }
            }
        });
        Ok(())
    }

    fn link(&self, a: &PeerIdentity, b: &PeerIdentity) {
        if !self.inner.endpoints.contains_key(a) || !self.inner.endpoints.contains_key(b) {
            return;
        }
        if self.inner.links.insert(link_key(a, b), ()).is_some() {
            return;
        }
        debug!("Loopback session {} <-> {} established", a, b);
        self.emit(
            a,
            TransportEvent::ConnectionStateChanged {
                peer: b.clone(),
                state: PeerConnectionState::Connected,
            },
        );
        self.emit(
            b,
            TransportEvent::ConnectionStateChanged {
                peer: a.clone(),
                state: PeerConnectionState::Connected,
            },
        );
    }

    /// Drop the session between `a` and `b`, notifying both sides
    pub fn unlink(&self, a: &PeerIdentity, b: &PeerIdentity) {
        if self.inner.links.remove(&link_key(a, b)).is_none() {
            return;
        }
        debug!("Loopback session {} <-> {} dropped", a, b);
        self.emit(
            a,
            TransportEvent::ConnectionStateChanged {
                peer: b.clone(),
                state: PeerConnectionState::NotConnected,
            },
        );
        self.emit(
            b,
            TransportEvent::ConnectionStateChanged {
                peer: a.clone(),
                state: PeerConnectionState::NotConnected,
            },
        );
    }

    fn send(&self, from: &PeerIdentity, to: &PeerIdentity, payload: Bytes) -> Result<(), TransportError> {
        if !self.is_linked(from, to) {
            return Err(TransportError::Send {
                peer: to.clone(),
                reason: "no session".into(),
            });
        }
        self.emit(
            to,
            TransportEvent::PayloadReceived {
                peer: from.clone(),
                payload,
            },
        );
        Ok(())
    }

    fn drop_links_of(&self, local: &PeerIdentity) {
        let counterparts: Vec<PeerIdentity> = self
            .inner
            .links
            .iter()
            .filter_map(|l| {
                let (a, b) = l.key();
                if a == local {
                    Some(b.clone())
                } else if b == local {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for peer in counterparts {
            self.unlink(local, &peer);
        }
    }

    fn teardown(&self, local: &PeerIdentity, generation: u64) {
        let current = self.inner.endpoints.get(local).map(|e| (e.generation, e.service_type.clone()));
        let Some((current, service_type)) = current else {
            return;
        };
        if current != generation {
            return;
        }

        self.drop_links_of(local);
        for browser in self.peers_where(local, &service_type, |e| e.browsing) {
            self.emit(&browser, TransportEvent::PeerLost { peer: local.clone() });
        }
        self.inner.endpoints.remove(local);
        info!("Loopback endpoint {} removed", local);
    }

    /// Switch a device's radio on or off
    pub fn set_radio(&self, local: &PeerIdentity, powered_on: bool) {
        let changed = match self.inner.endpoints.get_mut(local) {
            Some(mut endpoint) if endpoint.radio_on != powered_on => {
                endpoint.radio_on = powered_on;
                if !powered_on {
                    endpoint.advertising = false;
                    endpoint.browsing = false;
                }
                true
            }
            _ => false,
        };
        if !changed {
            return;
        }

        if !powered_on {
            self.drop_links_of(local);
        }
        self.emit(local, TransportEvent::RadioStateChanged { powered_on });
    }
}

/// Transport bound to one identity on a [`LoopbackHub`]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    local: PeerIdentity,
    generation: u64,
}

impl TransportPort for LoopbackTransport {
    fn start_advertising(&mut self) -> Result<(), TransportError> {
        self.hub.set_advertising(&self.local, true)
    }

    fn stop_advertising(&mut self) {
        let _ = self.hub.set_advertising(&self.local, false);
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.hub.set_browsing(&self.local, true)
    }

    fn stop_browsing(&mut self) {
        let _ = self.hub.set_browsing(&self.local, false);
    }

    fn invite(&mut self, peer: &PeerIdentity, timeout: Duration) -> Result<(), TransportError> {
        self.hub.invite(&self.local, peer, timeout)
    }

    fn send(&mut self, payload: Bytes, peer: &PeerIdentity) -> Result<(), TransportError> {
        self.hub.send(&self.local, peer, payload)
    }

    fn disconnect(&mut self, peer: &PeerIdentity) {
        self.hub.unlink(&self.local, peer);
    }

    fn shutdown(&mut self) {
        self.hub.teardown(&self.local, self.generation);
    }
}

/// Creates [`LoopbackTransport`]s on a shared hub
#[derive(Clone)]
pub struct LoopbackFactory {
    hub: LoopbackHub,
    info: HashMap<String, String>,
}

impl LoopbackFactory {
    /// Discovery info advertised by every transport this factory creates
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(
        &self,
        local: &PeerIdentity,
        service_type: &str,
    ) -> Result<(Box<dyn TransportPort>, TransportEvents), TransportError> {
        let (generation, events) = self.hub.register(local, service_type, self.info.clone());
        let transport = LoopbackTransport {
            hub: self.hub.clone(),
            local: local.clone(),
            generation,
        };
        Ok((Box::new(transport), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> PeerIdentity {
        PeerIdentity::from(name)
    }

    #[tokio::test]
    async fn test_discovery_both_orders() {
        let hub = LoopbackHub::new();
        let factory = hub.factory();
        let (mut alice, mut alice_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        let (mut bob, mut bob_rx) = factory.create(&id("bob"), "proximity1").unwrap();

        // Browser first, advertiser second
        alice.start_browsing().unwrap();
        bob.start_advertising().unwrap();
        match alice_rx.recv().await.unwrap() {
            TransportEvent::PeerDiscovered { peer, .. } => assert_eq!(peer, id("bob")),
            other => panic!("unexpected event {:?}", other),
        }

        // Advertiser first, browser second
        alice.start_advertising().unwrap();
        bob.start_browsing().unwrap();
        match bob_rx.recv().await.unwrap() {
            TransportEvent::PeerDiscovered { peer, .. } => assert_eq!(peer, id("alice")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_service_type_invisible() {
        let hub = LoopbackHub::new();
        let factory = hub.factory();
        let (mut alice, mut alice_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        let (mut bob, _bob_rx) = factory.create(&id("bob"), "other").unwrap();

        alice.start_browsing().unwrap();
        bob.start_advertising().unwrap();
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invite_accept_and_send() {
        let hub = LoopbackHub::new();
        let factory = hub.factory();
        let (mut alice, mut alice_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        let (mut bob, mut bob_rx) = factory.create(&id("bob"), "proximity1").unwrap();
        bob.start_advertising().unwrap();

        assert!(alice.send(Bytes::from_static(b"hi"), &id("bob")).is_err());

        alice.invite(&id("bob"), Duration::from_secs(5)).unwrap();
        match bob_rx.recv().await.unwrap() {
            TransportEvent::InvitationReceived { peer, responder } => {
                assert_eq!(peer, id("alice"));
                responder.accept();
            }
            other => panic!("unexpected event {:?}", other),
        }

        match alice_rx.recv().await.unwrap() {
            TransportEvent::ConnectionStateChanged { state, .. } => {
                assert_eq!(state, PeerConnectionState::Connecting)
            }
            other => panic!("unexpected event {:?}", other),
        }
        match alice_rx.recv().await.unwrap() {
            TransportEvent::ConnectionStateChanged { peer, state } => {
                assert_eq!(peer, id("bob"));
                assert_eq!(state, PeerConnectionState::Connected);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(hub.is_linked(&id("alice"), &id("bob")));

        alice.send(Bytes::from_static(b"hi"), &id("bob")).unwrap();
        loop {
            match bob_rx.recv().await.unwrap() {
                TransportEvent::PayloadReceived { peer, payload } => {
                    assert_eq!(peer, id("alice"));
                    assert_eq!(&payload[..], b"hi");
                    break;
                }
                TransportEvent::ConnectionStateChanged { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }

        alice.disconnect(&id("bob"));
        assert_eq!(hub.link_count(), 0);
    }

    #[tokio::test]
    async fn test_declined_invitation() {
        let hub = LoopbackHub::new();
        let factory = hub.factory();
        let (mut alice, mut alice_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        let (mut bob, mut bob_rx) = factory.create(&id("bob"), "proximity1").unwrap();
        bob.start_advertising().unwrap();

        alice.invite(&id("bob"), Duration::from_secs(5)).unwrap();
        if let TransportEvent::InvitationReceived { responder, .. } = bob_rx.recv().await.unwrap() {
            responder.decline();
        }

        let _connecting = alice_rx.recv().await.unwrap();
        match alice_rx.recv().await.unwrap() {
            TransportEvent::ConnectionStateChanged { state, .. } => {
                assert_eq!(state, PeerConnectionState::NotConnected)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(hub.link_count(), 0);
    }

    #[tokio::test]
    async fn test_reregister_tears_down_old_links() {
        let hub = LoopbackHub::new();
        let factory = hub.factory();
        let (_alice, _alice_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        let (_bob, _bob_rx) = factory.create(&id("bob"), "proximity1").unwrap();
        hub.link(&id("alice"), &id("bob"));
        assert_eq!(hub.link_count(), 1);

        let (_alice2, _alice2_rx) = factory.create(&id("alice"), "proximity1").unwrap();
        assert_eq!(hub.link_count(), 0);
    }
}
