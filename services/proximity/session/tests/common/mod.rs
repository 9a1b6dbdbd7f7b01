//! Shared fixtures for session manager integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use proximity_session::{
    ManagerConfig, PeerConnectionState, SessionHandle, SessionManagerBuilder, SessionSnapshot,
    TransportError, TransportEvent, TransportEvents, TransportFactory, TransportPort,
};
use proximity_storage::{
    MemoryProfileStore, PeerIdentity, ProfilePredicate, ProfileRecord, ProfileStore, StorageError,
};
use proximity_wire::AppMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport call recorded by [`MockFactory`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    Invite(PeerIdentity),
    Send(PeerIdentity, Bytes),
    Disconnect(PeerIdentity),
    Shutdown,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<Call>>,
    /// Event sender of every transport created, oldest first
    senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    failing_sends: Mutex<HashSet<PeerIdentity>>,
    fail_advertise: AtomicBool,
}

/// Factory for scripted transports; tests inject events by hand
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports created so far
    pub fn created(&self) -> usize {
        self.state.senders.lock().unwrap().len()
    }

    /// Deliver an event on the most recently created transport
    pub fn emit(&self, event: TransportEvent) {
        let senders = self.state.senders.lock().unwrap();
        let sender = senders.last().expect("no transport created");
        sender.send(event).expect("manager stopped");
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().unwrap().clear();
    }

    pub fn invites_to(&self, peer: &PeerIdentity) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Invite(p) if p == peer))
            .count()
    }

    /// Decoded payloads sent to `peer`
    pub fn sent_to(&self, peer: &PeerIdentity) -> Vec<AppMessage> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(p, payload) if &p == peer => AppMessage::decode(&payload).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn fail_sends_to(&self, peer: &PeerIdentity, failing: bool) {
        let mut set = self.state.failing_sends.lock().unwrap();
        if failing {
            set.insert(peer.clone());
        } else {
            set.remove(peer);
        }
    }

    pub fn fail_advertise(&self, failing: bool) {
        self.state.fail_advertise.store(failing, Ordering::SeqCst);
    }

    /// Discovered and connected, the way a radio reports an accepted invite
    pub fn connect(&self, peer: &PeerIdentity) {
        self.emit(TransportEvent::PeerDiscovered {
            peer: peer.clone(),
            info: HashMap::new(),
        });
        self.set_state(peer, PeerConnectionState::Connected);
    }

    pub fn set_state(&self, peer: &PeerIdentity, state: PeerConnectionState) {
        self.emit(TransportEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    /// Deliver an application message from `peer`
    pub fn deliver(&self, peer: &PeerIdentity, message: &AppMessage) {
        self.emit(TransportEvent::PayloadReceived {
            peer: peer.clone(),
            payload: message.encode().unwrap(),
        });
    }
}

struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    fn record(&self, call: Call) {
        self.state.calls.lock().unwrap().push(call);
    }
}

impl TransportPort for MockTransport {
    fn start_advertising(&mut self) -> Result<(), TransportError> {
        self.record(Call::StartAdvertising);
        if self.state.fail_advertise.load(Ordering::SeqCst) {
            return Err(TransportError::Advertise("radio busy".into()));
        }
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.record(Call::StopAdvertising);
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.record(Call::StartBrowsing);
        Ok(())
    }

    fn stop_browsing(&mut self) {
        self.record(Call::StopBrowsing);
    }

    fn invite(&mut self, peer: &PeerIdentity, _timeout: Duration) -> Result<(), TransportError> {
        self.record(Call::Invite(peer.clone()));
        Ok(())
    }

    fn send(&mut self, payload: Bytes, peer: &PeerIdentity) -> Result<(), TransportError> {
        if self.state.failing_sends.lock().unwrap().contains(peer) {
            return Err(TransportError::Send {
                peer: peer.clone(),
                reason: "peer unreachable".into(),
            });
        }
        self.record(Call::Send(peer.clone(), payload));
        Ok(())
    }

    fn disconnect(&mut self, peer: &PeerIdentity) {
        self.record(Call::Disconnect(peer.clone()));
    }

    fn shutdown(&mut self) {
        self.record(Call::Shutdown);
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        _local: &PeerIdentity,
        _service_type: &str,
    ) -> Result<(Box<dyn TransportPort>, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.senders.lock().unwrap().push(tx);
        let transport = MockTransport {
            state: self.state.clone(),
        };
        Ok((Box::new(transport), rx))
    }
}

/// Store whose saves can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryProfileStore,
    pub failing: AtomicBool,
}

#[async_trait]
impl ProfileStore for FlakyStore {
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError> {
        self.inner.get(id).await
    }

    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError> {
        self.inner.get_logged_in().await
    }

    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.save(record).await
    }

    async fn query(
        &self,
        predicate: ProfilePredicate<'_>,
    ) -> Result<Vec<ProfileRecord>, StorageError> {
        self.inner.query(predicate).await
    }
}

/// Memory store whose listing queries fail while point reads and writes work
#[derive(Default)]
pub struct UnlistableStore {
    pub inner: MemoryProfileStore,
}

#[async_trait]
impl ProfileStore for UnlistableStore {
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError> {
        self.inner.get(id).await
    }

    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError> {
        self.inner.get_logged_in().await
    }

    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        self.inner.save(record).await
    }

    async fn query(
        &self,
        _predicate: ProfilePredicate<'_>,
    ) -> Result<Vec<ProfileRecord>, StorageError> {
        Err(StorageError::Backend("index unavailable".into()))
    }
}

pub fn id(name: &str) -> PeerIdentity {
    PeerIdentity::from(name)
}

pub fn config(name: &str) -> ManagerConfig {
    ManagerConfig {
        display_name: name.to_string(),
        ..Default::default()
    }
}

/// Build and spawn a manager named `name` on `factory`
pub async fn start(factory: &MockFactory, name: &str) -> SessionHandle {
    start_with(SessionManagerBuilder::new().config(config(name)), factory).await
}

pub async fn start_with(builder: SessionManagerBuilder, factory: &MockFactory) -> SessionHandle {
    let (manager, handle) = builder
        .transport_factory(Arc::new(factory.clone()))
        .build()
        .await
        .unwrap();
    tokio::spawn(manager.run());
    settle(&handle).await;
    handle
}

/// Round-trip through the command queue so every earlier event and command
/// has been handled and published
pub async fn settle(handle: &SessionHandle) {
    for _ in 0..2 {
        handle.profile(handle.local_identity().clone()).await.unwrap();
    }
}

/// Poll snapshots until `condition` holds
pub async fn wait_for<F>(handle: &SessionHandle, mut condition: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    for _ in 0..500 {
        settle(handle).await;
        let snapshot = handle.snapshot();
        if condition(&snapshot) {
            return snapshot;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached: {:?}", handle.snapshot());
}
