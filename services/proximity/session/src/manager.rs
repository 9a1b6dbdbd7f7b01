//! Session manager: the single event loop that owns all session state.
//!
//! Transport events, persistence outcomes, user intents, location changes
//! and the reconnect/retry deadlines are serialized through one
//! `tokio::select!`. The presentation layer talks to the loop through a
//! [`SessionHandle`] and observes it through a `watch` snapshot.

use crate::config::{DiscoveryFilterConfig, InvitationPolicy, ManagerConfig};
use crate::directory::{to_wire_links, PersistOutcome, PersistOutcomes, ProfileDirectory, ProfileDraft};
use crate::dispatcher::MessageDispatcher;
use crate::error::{SessionError, TransportError};
use crate::failure_tracker::SendFailureTracker;
use crate::filter;
use crate::ledger::{self, LinkRequestState};
use crate::location::LocationReceiver;
use crate::observer::{PresenceEventHandler, SessionSnapshot};
use crate::reconnect::{ReconnectAction, ReconnectController, RetryBackoff};
use crate::registry::{ConnectedPeer, ConnectionState, PeerRegistry};
use crate::transport::{
    InvitationResponder, PeerConnectionState, TransportEvent, TransportEvents, TransportFactory,
    TransportPort,
};
use anyhow::Context;
use proximity_storage::{
    Coordinates, MemoryProfileStore, PeerIdentity, ProfileRecord, ProfileStore, SocialLink,
};
use proximity_wire::{AppMessage, LinkGrant};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// User intent queued to the event loop
#[derive(Debug)]
enum Command {
    StartDiscovery,
    StopDiscovery,
    Invite(PeerIdentity),
    SendText(String),
    SendTextTo {
        peer: PeerIdentity,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RespondToInvitation(bool),
    UpdateDistance(f64),
    UpdateSubscription(bool),
    RequestLink {
        target: PeerIdentity,
        reply: oneshot::Sender<LinkRequestState>,
    },
    ApproveLink {
        requester: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
    RejectLink {
        requester: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
    CreateProfile {
        draft: ProfileDraft,
        reply: oneshot::Sender<ProfileRecord>,
    },
    FetchOffline {
        include_matched: bool,
        include_location: bool,
        reply: oneshot::Sender<Vec<ProfileRecord>>,
    },
    Combined {
        include_matched: bool,
        include_location: bool,
        reply: oneshot::Sender<Vec<ProfileRecord>>,
    },
    Profile {
        id: PeerIdentity,
        reply: oneshot::Sender<Option<ProfileRecord>>,
    },
    Shutdown,
}

/// Builder resolving the local identity before the transport is created
#[derive(Default)]
pub struct SessionManagerBuilder {
    config: ManagerConfig,
    store: Option<Arc<dyn ProfileStore>>,
    factory: Option<Arc<dyn TransportFactory>>,
    location: Option<LocationReceiver>,
    event_handler: Option<Arc<dyn PresenceEventHandler>>,
}

impl SessionManagerBuilder {
    /// Start with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager configuration
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Profile store; defaults to an in-memory store
    pub fn store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Factory used at start-up and on every full reset
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Source of the device position
    pub fn location(mut self, location: LocationReceiver) -> Self {
        self.location = Some(location);
        self
    }

    /// Handler for discrete presence events
    pub fn event_handler<T>(mut self, handler: Arc<T>) -> Self
    where
        T: PresenceEventHandler + 'static,
    {
        self.event_handler = Some(handler);
        self
    }

    /// Hydrate the directory, resolve the local identity and create the
    /// transport. The identity is the logged-in profile's, else the
    /// configured display name.
    pub async fn build(self) -> anyhow::Result<(SessionManager, SessionHandle)> {
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("Transport factory not set"))?;
        let store: Arc<dyn ProfileStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryProfileStore::new()),
        };

        let (mut directory, persist_outcomes) = ProfileDirectory::new(store);
        let mut last_error = None;
        if let Err(e) = directory.hydrate().await {
            warn!("Starting with an empty profile directory: {}", e);
            last_error = Some(e);
        }

        let local = match directory.logged_in() {
            Some(record) => record.id.clone(),
            None => PeerIdentity::new(self.config.display_name.trim()),
        };
        if local.as_str().is_empty() {
            anyhow::bail!("No local identity: display name is empty and no profile is logged in");
        }

        let (transport, events) = factory
            .create(&local, &self.config.service_type)
            .with_context(|| format!("Failed to create transport for {}", local))?;

        let mut config = self.config;
        let (max_distance_m, clamped) = filter::clamp_distance(config.filter.max_distance_m);
        if clamped {
            let err = SessionError::PolicyViolation(format!(
                "max distance {} clamped to {}",
                config.filter.max_distance_m, max_distance_m
            ));
            warn!("[{}] {}", err.category(), err);
            last_error = Some(err);
            config.filter.max_distance_m = max_distance_m;
        }

        let local_position = self
            .location
            .as_ref()
            .and_then(|rx| *rx.borrow())
            .or_else(|| {
                directory
                    .logged_in()
                    .and_then(|r| r.coordinates)
                    .filter(|c| !c.is_zero())
            });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let manager = SessionManager {
            local: local.clone(),
            factory,
            transport,
            events,
            commands: command_rx,
            state_tx,
            directory,
            persist_outcomes,
            registry: PeerRegistry::new(),
            reconnect: ReconnectController::new(config.reconnect.clone()),
            discovery_retry: RetryBackoff::new(
                config.retry.discovery_initial,
                config.retry.discovery_max,
            ),
            failures: SendFailureTracker::new(
                config.retry.send_failure_threshold,
                config.retry.send_failure_window,
            ),
            dispatcher: MessageDispatcher::new(),
            filter: config.filter,
            location: self.location,
            local_position,
            pending_invitation: None,
            excluded: HashSet::new(),
            discovery_wanted: false,
            is_advertising: false,
            is_browsing: false,
            full_resets: 0,
            last_error,
            event_handler: self.event_handler,
            config,
        };
        manager.publish();

        info!("Session manager built for {}", local);
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            local,
        };
        Ok((manager, handle))
    }
}

/// Event loop owning the transport, the registry and the directory
pub struct SessionManager {
    config: ManagerConfig,
    local: PeerIdentity,
    factory: Arc<dyn TransportFactory>,
    transport: Box<dyn TransportPort>,
    events: TransportEvents,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionSnapshot>,
    directory: ProfileDirectory,
    persist_outcomes: PersistOutcomes,
    registry: PeerRegistry,
    reconnect: ReconnectController,
    discovery_retry: RetryBackoff,
    failures: SendFailureTracker,
    dispatcher: MessageDispatcher,
    filter: DiscoveryFilterConfig,
    location: Option<LocationReceiver>,
    local_position: Option<Coordinates>,
    /// At most one surfaced invitation
    pending_invitation: Option<(PeerIdentity, InvitationResponder)>,
    /// Peers evicted by the filter; not auto-invited until the filter changes
    excluded: HashSet<PeerIdentity>,
    /// Discovery requested by the user (or on launch)
    discovery_wanted: bool,
    is_advertising: bool,
    is_browsing: bool,
    full_resets: u32,
    last_error: Option<SessionError>,
    event_handler: Option<Arc<dyn PresenceEventHandler>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("local", &self.local)
            .field("connected", &self.registry.connected_count())
            .field("is_advertising", &self.is_advertising)
            .field("is_browsing", &self.is_browsing)
            .field("full_resets", &self.full_resets)
            .finish()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Next position from the location source; `None` once the source is gone
async fn next_location(rx: &mut Option<LocationReceiver>) -> Option<Option<Coordinates>> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl SessionManager {
    /// Run the session manager until shutdown or until every handle is dropped
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Starting session manager for {}", self.local);

        if self.config.start_discovery_on_launch {
            self.start_discovery();
        }
        self.publish();

        loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => {
                    self.handle_transport_event(event);
                }

                Some(outcome) = self.persist_outcomes.recv() => {
                    self.handle_persist_outcome(outcome);
                }

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("Session manager shutting down");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },

                change = next_location(&mut self.location) => match change {
                    Some(position) => self.handle_location(position),
                    None => {
                        debug!("Location source closed");
                        self.location = None;
                    }
                },

                _ = sleep_until_opt(self.reconnect.deadline()) => {
                    self.handle_reconnect_deadline();
                }

                _ = sleep_until_opt(self.discovery_retry.deadline()) => {
                    if self.discovery_retry.poll(Instant::now()) && self.discovery_wanted {
                        info!("Retrying discovery");
                        self.restart_discovery();
                    }
                }
            }

            self.publish();
        }

        self.stop();
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> SessionSnapshot {
        let connected_peers = self
            .registry
            .connected_ids()
            .into_iter()
            .map(|id| {
                let (discovery_info, connected_at) = self
                    .registry
                    .details(&id)
                    .map(|(info, at)| (info.clone(), at))
                    .unwrap_or_default();
                let profile = self
                    .directory
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| ProfileRecord::placeholder(id.clone()));
                ConnectedPeer {
                    id,
                    state: ConnectionState::Connected,
                    profile,
                    discovery_info,
                    connected_at,
                }
            })
            .collect();

        SessionSnapshot {
            local_peer: Some(self.local.clone()),
            connected_peers,
            discovered_peers: self.registry.discovered_ids(),
            received_messages: self.dispatcher.received().to_vec(),
            pending_invitation: self.pending_invitation.as_ref().map(|(id, _)| id.clone()),
            last_error: self.last_error.clone(),
            is_advertising: self.is_advertising,
            is_browsing: self.is_browsing,
            is_scanning: self.is_advertising && self.is_browsing,
            is_reconnecting: self.reconnect.is_reconnecting(),
            filter: self.filter,
            full_resets: self.full_resets,
            decode_failures: self.dispatcher.decode_failures(),
        }
    }

    /// Surface an error in `last_error` and to the event handler
    fn report(&mut self, error: SessionError) {
        warn!("[{}] {}", error.category(), error);
        if let Some(ref handler) = self.event_handler {
            handler.notify_error(&error);
        }
        self.last_error = Some(error);
    }

    fn stop(&mut self) {
        if let Some((peer, responder)) = self.pending_invitation.take() {
            debug!("Declining pending invitation from {} on shutdown", peer);
            responder.decline();
        }
        if self.is_advertising {
            self.transport.stop_advertising();
        }
        if self.is_browsing {
            self.transport.stop_browsing();
        }
        self.transport.shutdown();
        self.is_advertising = false;
        self.is_browsing = false;
        self.reconnect.cancel();
        self.discovery_retry.reset();
    }

    // Discovery

    fn start_discovery(&mut self) {
        self.discovery_wanted = true;
        self.restart_discovery();
    }

    fn restart_discovery(&mut self) {
        if !self.is_advertising {
            match self.transport.start_advertising() {
                Ok(()) => self.is_advertising = true,
                Err(e) => self.discovery_failed(e),
            }
        }
        if !self.is_browsing {
            match self.transport.start_browsing() {
                Ok(()) => self.is_browsing = true,
                Err(e) => self.discovery_failed(e),
            }
        }
        if self.is_advertising && self.is_browsing {
            self.discovery_retry.reset();
            info!("Advertising and browsing as {}", self.local);
        }
    }

    fn discovery_failed(&mut self, error: TransportError) {
        self.report(error.into());
        if !self.discovery_wanted {
            return;
        }
        if let Some(delay) = self.discovery_retry.schedule(Instant::now()) {
            info!("Restarting discovery in {:?}", delay);
        }
    }

    fn stop_discovery(&mut self) {
        self.discovery_wanted = false;
        if self.is_advertising {
            self.transport.stop_advertising();
            self.is_advertising = false;
        }
        if self.is_browsing {
            self.transport.stop_browsing();
            self.is_browsing = false;
        }
        self.reconnect.cancel();
        self.discovery_retry.reset();
        info!("Discovery stopped");
    }

    fn invite(&mut self, peer: &PeerIdentity) {
        if self.registry.is_connected(peer) {
            debug!("Not inviting {}: already connected", peer);
            return;
        }
        self.registry.inviting(peer);
        if let Err(e) = self.transport.invite(peer, self.config.invite_timeout) {
            self.registry.disconnected(peer);
            self.report(e.into());
        } else {
            debug!("Invited {}", peer);
        }
    }

    // Transport events

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer, info } => self.on_peer_discovered(peer, info),
            TransportEvent::PeerLost { peer } => {
                debug!("Lost {}", peer);
                if self.registry.lost(&peer) {
                    self.on_peer_disconnected(&peer, "peer lost");
                }
            }
            TransportEvent::ConnectionStateChanged { peer, state } => match state {
                PeerConnectionState::Connecting => self.registry.inviting(&peer),
                PeerConnectionState::Connected => self.on_peer_connected(&peer),
                PeerConnectionState::NotConnected => {
                    if self.registry.disconnected(&peer) {
                        self.on_peer_disconnected(&peer, "session closed");
                    } else {
                        debug!("Session with {} was not established", peer);
                    }
                }
            },
            TransportEvent::InvitationReceived { peer, responder } => {
                self.on_invitation(peer, responder)
            }
            TransportEvent::PayloadReceived { peer, payload } => self.on_payload(&peer, &payload),
            TransportEvent::AdvertiseFailed { reason } => {
                self.is_advertising = false;
                self.discovery_failed(TransportError::Advertise(reason));
            }
            TransportEvent::BrowseFailed { reason } => {
                self.is_browsing = false;
                self.discovery_failed(TransportError::Browse(reason));
            }
            TransportEvent::RadioStateChanged { powered_on } => {
                if powered_on {
                    info!("Radio powered on");
                    if self.discovery_wanted {
                        self.restart_discovery();
                    }
                } else {
                    warn!("Radio powered off");
                    self.is_advertising = false;
                    self.is_browsing = false;
                }
            }
        }
    }

    fn on_peer_discovered(
        &mut self,
        peer: PeerIdentity,
        info: std::collections::HashMap<String, String>,
    ) {
        if peer == self.local {
            return;
        }
        if !self.registry.discovered(&peer, info) {
            debug!("Ignoring discovery of {}: already connected or invited", peer);
            return;
        }

        info!("Discovered {}", peer);
        self.directory.resolve_or_create(&peer);
        if self.config.auto_connect && !self.excluded.contains(&peer) {
            self.invite(&peer);
        }
    }

    fn on_peer_connected(&mut self, peer: &PeerIdentity) {
        if !self.registry.connected(peer) {
            return;
        }

        info!("Connected to {}", peer);
        self.directory.resolve_or_create(peer);
        self.directory.set_online(peer, true);
        self.reconnect.remember(peer);
        self.reconnect.on_connected();

        if let Some(snapshot) = self.directory.local_snapshot(self.config.share_location) {
            let _ = self.send_message(&AppMessage::ProfileSnapshot(snapshot), &[peer.clone()]);
        }

        if let Some(ref handler) = self.event_handler {
            handler.notify_peer_connected(peer);
        }
    }

    fn on_peer_disconnected(&mut self, peer: &PeerIdentity, reason: &str) {
        info!("Disconnected from {} ({})", peer, reason);
        self.directory.set_online(peer, false);
        self.failures.forget(peer);

        if let Some(ref handler) = self.event_handler {
            handler.notify_peer_disconnected(peer, reason);
        }

        if self.registry.connected_count() == 0 && self.discovery_wanted {
            self.reconnect.on_connected_set_empty(Instant::now());
        }
    }

    fn on_invitation(&mut self, peer: PeerIdentity, responder: InvitationResponder) {
        match self.config.invitation_policy {
            InvitationPolicy::AutoAccept => {
                if self.excluded.contains(&peer) {
                    debug!("Declining invitation from filtered peer {}", peer);
                    responder.decline();
                } else {
                    debug!("Accepting invitation from {}", peer);
                    self.registry.inviting(&peer);
                    responder.accept();
                }
            }
            InvitationPolicy::Prompt => {
                if self.pending_invitation.is_some() {
                    debug!("Declining invitation from {}: another is pending", peer);
                    responder.decline();
                    return;
                }
                info!("Invitation from {} waiting for an answer", peer);
                if let Some(ref handler) = self.event_handler {
                    handler.notify_invitation(&peer);
                }
                self.pending_invitation = Some((peer, responder));
            }
        }
    }

    fn respond_to_invitation(&mut self, accept: bool) {
        let Some((peer, responder)) = self.pending_invitation.take() else {
            debug!("No pending invitation to answer");
            return;
        };
        info!(
            "{} invitation from {}",
            if accept { "Accepting" } else { "Declining" },
            peer
        );
        if accept {
            self.excluded.remove(&peer);
            self.registry.inviting(&peer);
        }
        responder.respond(accept);
    }

    fn on_payload(&mut self, peer: &PeerIdentity, payload: &[u8]) {
        if !self.registry.is_connected(peer) {
            debug!("Dropping payload from unconnected peer {}", peer);
            return;
        }
        let Some(message) = self.dispatcher.on_receive(payload, peer) else {
            return;
        };

        match message {
            AppMessage::Chat(text) => {
                debug!("Chat from {} ({} bytes)", peer, text.len());
                if let Some(ref handler) = self.event_handler {
                    handler.notify_message_received(peer, &text);
                }
            }
            AppMessage::ProfileSnapshot(snapshot) => {
                let record = self.directory.cache(peer, &snapshot, true);
                debug!("Cached profile of {} as {}", peer, record.username);
                self.apply_filters();
            }
            AppMessage::LinkRequest => {
                ledger::request(&mut self.directory, peer, &self.local);
            }
            AppMessage::LinkGrant(grant) => {
                let links = grant
                    .links
                    .into_iter()
                    .map(|l| SocialLink::new(l.platform, l.url))
                    .collect();
                ledger::apply_grant(&mut self.directory, &self.local, peer, links);
            }
            AppMessage::LinkDeclined => {
                ledger::apply_decline(&mut self.directory, &self.local, peer);
            }
        }
    }

    fn handle_persist_outcome(&mut self, outcome: PersistOutcome) {
        match self.directory.on_persist_outcome(outcome) {
            // A stored copy replaced a cached record; it may change admission
            Ok(true) => self.apply_filters(),
            Ok(false) => {}
            Err(e) => self.report(e),
        }
    }

    // Reconnection

    fn handle_reconnect_deadline(&mut self) {
        match self.reconnect.poll(Instant::now()) {
            Some(ReconnectAction::Reinvite(peers)) => {
                info!("Re-inviting {} remembered peers", peers.len());
                for peer in peers {
                    if !self.registry.is_connected(&peer) && !self.excluded.contains(&peer) {
                        self.invite(&peer);
                    }
                }
            }
            Some(ReconnectAction::FullReset) => self.full_reset(),
            None => {}
        }
    }

    fn full_reset(&mut self) {
        warn!("Recreating transport session for {}", self.local);

        if let Some((_, responder)) = self.pending_invitation.take() {
            responder.decline();
        }
        self.transport.shutdown();
        for peer in self.registry.connected_ids() {
            self.directory.set_online(&peer, false);
        }
        self.registry.clear();
        self.is_advertising = false;
        self.is_browsing = false;

        match self.factory.create(&self.local, &self.config.service_type) {
            Ok((transport, events)) => {
                self.transport = transport;
                self.events = events;
            }
            Err(e) => {
                error!("Failed to recreate transport: {}", e);
                self.report(e.into());
            }
        }

        self.full_resets += 1;
        self.restart_discovery();
        self.reconnect.reset_completed(Instant::now());

        if self.reconnect.connectivity_lost() {
            self.report(SessionError::ConnectivityLost {
                resets: self.reconnect.resets(),
            });
        }
    }

    // Messaging

    /// Encode and send `message`; returns the last send failure, if any
    fn send_message(
        &mut self,
        message: &AppMessage,
        recipients: &[PeerIdentity],
    ) -> Result<(), SessionError> {
        if recipients.is_empty() {
            return Ok(());
        }
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                let err = SessionError::PolicyViolation(format!("message not sent: {}", e));
                self.report(err.clone());
                return Err(err);
            }
        };

        self.failures.cleanup_old_failures();
        let report = self
            .dispatcher
            .send(self.transport.as_mut(), &payload, recipients);

        for peer in &report.delivered {
            if self.failures.record_success(peer) {
                info!("Session with {} recovered", peer);
                if let Some(ref handler) = self.event_handler {
                    handler.notify_peer_recovered(peer);
                }
            }
        }

        let mut outcome = Ok(());
        for (peer, err) in report.failed {
            let (failures, interrupted) = self.failures.record_failure(&peer);
            if interrupted {
                if let Some(ref handler) = self.event_handler {
                    handler.notify_peer_interrupted(&peer, failures);
                }
                if let Err(e) = self.transport.invite(&peer, self.config.invite_timeout) {
                    warn!("Re-invite of interrupted peer {} failed: {}", peer, e);
                }
            }
            let err = SessionError::from(err);
            self.report(err.clone());
            outcome = Err(err);
        }
        outcome
    }

    fn send_text(&mut self, text: String) {
        if text.is_empty() {
            debug!("Ignoring empty message");
            return;
        }
        let recipients = self.registry.connected_ids();
        if recipients.is_empty() {
            debug!("No connected peers, message not sent");
            return;
        }
        let _ = self.send_message(&AppMessage::Chat(text), &recipients);
    }

    fn send_text_to(&mut self, peer: PeerIdentity, text: String) -> Result<(), SessionError> {
        if !self.registry.is_connected(&peer) {
            let err = SessionError::NotConnected(peer);
            self.report(err.clone());
            return Err(err);
        }
        if text.is_empty() {
            debug!("Ignoring empty message");
            return Ok(());
        }
        self.send_message(&AppMessage::Chat(text), &[peer])
    }

    fn broadcast_local_profile(&mut self) {
        let Some(snapshot) = self.directory.local_snapshot(self.config.share_location) else {
            return;
        };
        let recipients = self.registry.connected_ids();
        let _ = self.send_message(&AppMessage::ProfileSnapshot(snapshot), &recipients);
    }

    // Filters

    fn apply_filters(&mut self) {
        let connected = self.registry.connected_ids();
        let profiles: Vec<&ProfileRecord> = connected
            .iter()
            .filter_map(|id| self.directory.get(id))
            .collect();
        let evicted = filter::evaluate(&self.filter, self.local_position, &profiles);

        for peer in evicted {
            self.evict(&peer);
        }
    }

    fn evict(&mut self, peer: &PeerIdentity) {
        info!("Evicting {}: outside discovery filter", peer);
        self.transport.disconnect(peer);
        self.registry.disconnected(peer);
        self.reconnect.forget(peer);
        self.failures.forget(peer);
        self.directory.set_online(peer, false);
        self.excluded.insert(peer.clone());

        if let Some(ref handler) = self.event_handler {
            handler.notify_peer_disconnected(peer, "filtered");
        }
    }

    fn update_distance(&mut self, requested: f64) {
        let (effective, clamped) = filter::clamp_distance(requested);
        if clamped {
            self.report(SessionError::PolicyViolation(format!(
                "max distance {} clamped to {}",
                requested, effective
            )));
        }
        self.filter.max_distance_m = effective;
        self.excluded.clear();
        info!("Max discovery distance set to {} m", effective);
        self.apply_filters();
    }

    fn update_subscription(&mut self, subscription_only: bool) {
        self.filter.subscription_only = subscription_only;
        self.excluded.clear();
        info!("Subscription-only filter {}", if subscription_only { "on" } else { "off" });
        self.apply_filters();
    }

    fn handle_location(&mut self, position: Option<Coordinates>) {
        self.local_position = position;
        if let Some(position) = position {
            if self.config.share_location && self.directory.update_local_coordinates(position) {
                self.broadcast_local_profile();
            }
        }
        self.apply_filters();
    }

    // Profiles and links

    fn create_profile(&mut self, draft: ProfileDraft) -> ProfileRecord {
        let mut record = self.directory.upsert_local(&self.local, draft);
        if self.config.share_location {
            if let Some(position) = self.local_position {
                if self.directory.update_local_coordinates(position) {
                    record = self.directory.get(&self.local).cloned().unwrap_or(record);
                }
            }
        }
        self.broadcast_local_profile();
        record
    }

    fn request_link(&mut self, target: &PeerIdentity) -> LinkRequestState {
        let created = ledger::request(&mut self.directory, &self.local, target);
        if created && self.registry.is_connected(target) {
            let _ = self.send_message(&AppMessage::LinkRequest, &[target.clone()]);
        }
        ledger::state(&self.directory, &self.local, target)
    }

    fn approve_link(&mut self, requester: &PeerIdentity) -> bool {
        let approved = ledger::approve(&mut self.directory, requester, &self.local);
        if approved && self.registry.is_connected(requester) {
            let links = self
                .directory
                .get(&self.local)
                .map(|r| to_wire_links(&r.social_links))
                .unwrap_or_default();
            let _ = self.send_message(
                &AppMessage::LinkGrant(LinkGrant { links }),
                &[requester.clone()],
            );
        }
        approved
    }

    fn reject_link(&mut self, requester: &PeerIdentity) -> bool {
        let rejected = ledger::reject(&mut self.directory, requester, &self.local);
        if rejected && self.registry.is_connected(requester) {
            let _ = self.send_message(&AppMessage::LinkDeclined, &[requester.clone()]);
        }
        rejected
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartDiscovery => self.start_discovery(),
            Command::StopDiscovery => self.stop_discovery(),
            Command::Invite(peer) => {
                self.excluded.remove(&peer);
                self.invite(&peer);
            }
            Command::SendText(text) => self.send_text(text),
            Command::SendTextTo { peer, text, reply } => {
                let _ = reply.send(self.send_text_to(peer, text));
            }
            Command::RespondToInvitation(accept) => self.respond_to_invitation(accept),
            Command::UpdateDistance(meters) => self.update_distance(meters),
            Command::UpdateSubscription(on) => self.update_subscription(on),
            Command::RequestLink { target, reply } => {
                let _ = reply.send(self.request_link(&target));
            }
            Command::ApproveLink { requester, reply } => {
                let _ = reply.send(self.approve_link(&requester));
            }
            Command::RejectLink { requester, reply } => {
                let _ = reply.send(self.reject_link(&requester));
            }
            Command::CreateProfile { draft, reply } => {
                let _ = reply.send(self.create_profile(draft));
            }
            Command::FetchOffline {
                include_matched,
                include_location,
                reply,
            } => {
                let _ = reply.send(
                    self.directory
                        .fetch_offline(include_matched, include_location),
                );
            }
            Command::Combined {
                include_matched,
                include_location,
                reply,
            } => {
                let connected = self.registry.connected_ids();
                let _ = reply.send(self.directory.combined(
                    &connected,
                    include_matched,
                    include_location,
                ));
            }
            Command::Profile { id, reply } => {
                let _ = reply.send(self.directory.get(&id).cloned());
            }
            // Handled by the loop
            Command::Shutdown => {}
        }
    }
}

/// Cloneable handle for issuing intents and observing the session.
///
/// Social-link intents act on (requester, target) pairs where one side is
/// always the local user: `request_social_link(target)` uses the local user
/// as requester, while `approve_social_link(requester)` and
/// `reject_social_link(requester)` use the local user as target.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    local: PeerIdentity,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Local identity
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Start advertising and browsing
    pub fn start_discovery(&self) -> Result<(), SessionError> {
        self.send(Command::StartDiscovery)
    }

    /// Stop advertising and browsing; cancels any reconnection cycle
    pub fn stop_discovery(&self) -> Result<(), SessionError> {
        self.send(Command::StopDiscovery)
    }

    /// Invite a peer
    pub fn invite(&self, peer: PeerIdentity) -> Result<(), SessionError> {
        self.send(Command::Invite(peer))
    }

    /// Send chat text to every connected peer
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::SendText(text.into()))
    }

    /// Send chat text to one connected peer
    pub async fn send_text_to(
        &self,
        peer: PeerIdentity,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendTextTo { peer, text, reply })
            .await?
    }

    /// Answer the pending invitation
    pub fn respond_to_invitation(&self, accept: bool) -> Result<(), SessionError> {
        self.send(Command::RespondToInvitation(accept))
    }

    /// Change the maximum distance; negative values are clamped to 0
    pub fn update_discovery_distance(&self, meters: f64) -> Result<(), SessionError> {
        self.send(Command::UpdateDistance(meters))
    }

    /// Toggle the subscription-only filter
    pub fn update_subscription_filter(&self, subscription_only: bool) -> Result<(), SessionError> {
        self.send(Command::UpdateSubscription(subscription_only))
    }

    /// Ask `target` for its social links; the local user is the requester
    pub async fn request_social_link(
        &self,
        target: PeerIdentity,
    ) -> Result<LinkRequestState, SessionError> {
        self.request(|reply| Command::RequestLink { target, reply })
            .await
    }

    /// Approve `requester`'s pending request; the local user is the target
    pub async fn approve_social_link(&self, requester: PeerIdentity) -> Result<bool, SessionError> {
        self.request(|reply| Command::ApproveLink { requester, reply })
            .await
    }

    /// Reject `requester`'s pending request; the local user is the target
    pub async fn reject_social_link(&self, requester: PeerIdentity) -> Result<bool, SessionError> {
        self.request(|reply| Command::RejectLink { requester, reply })
            .await
    }

    /// Create or edit the local profile
    pub async fn create_profile(&self, draft: ProfileDraft) -> Result<ProfileRecord, SessionError> {
        self.request(|reply| Command::CreateProfile { draft, reply })
            .await
    }

    /// Stored peers that are not online
    pub async fn fetch_offline(
        &self,
        include_matched: bool,
        include_location: bool,
    ) -> Result<Vec<ProfileRecord>, SessionError> {
        self.request(|reply| Command::FetchOffline {
            include_matched,
            include_location,
            reply,
        })
        .await
    }

    /// Connected peers' profiles followed by offline ones
    pub async fn combined(
        &self,
        include_matched: bool,
        include_location: bool,
    ) -> Result<Vec<ProfileRecord>, SessionError> {
        self.request(|reply| Command::Combined {
            include_matched,
            include_location,
            reply,
        })
        .await
    }

    /// Cached profile for `id`
    pub async fn profile(&self, id: PeerIdentity) -> Result<Option<ProfileRecord>, SessionError> {
        self.request(|reply| Command::Profile { id, reply }).await
    }

    /// Stop the manager
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown)
    }
}
