//! Proximity node binary.
//!
//! Runs a session manager against the in-process loopback radio, optionally
//! together with a handful of simulated nearby devices.

use anyhow::Context;
use clap::Parser;
use proximity_session::{
    ChannelEventHandler, LocationFeed, LoopbackHub, PresenceEvent, ProfileDraft, SessionHandle,
    SessionManagerBuilder,
};
use proximity_storage::{open_store, Coordinates};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::ProximityLogFormatter;

/// Proximity peer session node
#[derive(Parser, Debug)]
#[command(name = "proximity-node", version, about = "Nearby peer discovery and messaging node")]
struct Args {
    /// Path to the shared configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Display name used when no profile is logged in
    #[arg(long)]
    display_name: Option<String>,

    /// Username for the local profile created at startup
    #[arg(long)]
    username: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Storage mode: memory, file, redis
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory for file storage
    #[arg(long)]
    storage_data_dir: Option<PathBuf>,

    /// Maximum peer distance in meters
    #[arg(long)]
    max_distance: Option<f64>,

    /// Only keep premium peers
    #[arg(long)]
    subscription_only: bool,

    /// Grace period before re-inviting lost peers, e.g. 3s
    #[arg(long)]
    reconnect_grace: Option<humantime::Duration>,

    /// Recovery window before a full transport reset, e.g. 3s
    #[arg(long)]
    reconnect_recovery: Option<humantime::Duration>,

    /// Initial position as "lat,lon"
    #[arg(long, value_parser = parse_position)]
    position: Option<Coordinates>,

    /// Number of simulated nearby devices
    #[arg(long, default_value = "0")]
    simulate: usize,

    /// Interval between status lines
    #[arg(long, default_value = "10s")]
    status_interval: humantime::Duration,
}

fn parse_position(raw: &str) -> Result<Coordinates, String> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected \"lat,lon\", got '{}'", raw))?;
    let latitude = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let longitude = lon.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Coordinates::new(latitude, longitude))
}

impl Args {
    /// Command-line flags win over file and environment values
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(name) = &self.display_name {
            config.display_name = name.clone();
        }
        if let Some(mode) = &self.storage_mode {
            config.storage.mode = mode.clone();
        }
        if let Some(dir) = &self.storage_data_dir {
            config.storage.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(meters) = self.max_distance {
            config.max_distance_m = meters;
        }
        if self.subscription_only {
            config.subscription_only = true;
        }
        if let Some(grace) = self.reconnect_grace {
            config.reconnect_grace = grace.into();
        }
        if let Some(recovery) = self.reconnect_recovery {
            config.reconnect_recovery = recovery.into();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::new("info")
        .add_directive(format!("proximity_node={}", args.log_level).parse()?)
        .add_directive(format!("proximity_session={}", args.log_level).parse()?)
        .add_directive(format!("proximity_storage={}", args.log_level).parse()?)
        .add_directive(format!("proximity_wire={}", args.log_level).parse()?);

    let formatter = ProximityLogFormatter::new("proximity".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .event_format(formatter)
        .init();

    info!("Starting proximity node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut node_config);

    let storage_mode = node_config.storage_mode()?;
    info!("Opening profile store: {:?}", storage_mode);
    let store = open_store(storage_mode)
        .await
        .context("Failed to open profile store")?;

    let hub = LoopbackHub::new();
    let (feed, location_rx) = LocationFeed::new();
    if let Some(position) = args.position {
        feed.publish(position);
    }

    let (events, mut event_rx) = ChannelEventHandler::new();
    let (manager, handle) = SessionManagerBuilder::new()
        .config(node_config.manager_config())
        .store(store)
        .transport_factory(Arc::new(hub.factory()))
        .location(location_rx)
        .event_handler(Arc::new(events))
        .build()
        .await?;

    info!(
        "Local identity {} advertising service '{}'",
        handle.local_identity(),
        node_config.service_type
    );
    let manager_task = tokio::spawn(manager.run());

    if let Some(username) = &args.username {
        let record = handle
            .create_profile(ProfileDraft {
                username: username.clone(),
                ..Default::default()
            })
            .await?;
        component_info!("profile", "Created local profile '{}'", record.username);
    }

    let simulated = spawn_simulated_peers(&hub, &node_config, args.simulate).await?;

    let mut status = tokio::time::interval(Duration::from(args.status_interval));
    status.tick().await;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    info!("Proximity node started. Waiting for events...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            Some(event) = event_rx.recv() => log_event(&event),
            _ = status.tick() => {
                let snapshot = handle.snapshot();
                component_info!(
                    "status",
                    "{} connected, {} discovered, advertising={}, browsing={}, reconnecting={}, resets={}",
                    snapshot.connected_peers.len(),
                    snapshot.discovered_peers.len(),
                    snapshot.is_advertising,
                    snapshot.is_browsing,
                    snapshot.is_reconnecting,
                    snapshot.full_resets
                );
            }
            else => {
                info!("Event channel closed, shutting down");
                break;
            }
        }
    }

    for peer in &simulated {
        if let Err(e) = peer.handle.shutdown() {
            warn!("Simulated peer {} already stopped: {}", peer.handle.local_identity(), e);
        }
    }
    if let Err(e) = handle.shutdown() {
        warn!("Session manager already stopped: {}", e);
    }

    match manager_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Session manager exited with error: {:#}", e),
        Err(e) => warn!("Session manager task failed: {}", e),
    }
    for peer in simulated {
        peer.task.abort();
    }

    info!("Proximity node shutdown complete");
    Ok(())
}

fn log_event(event: &PresenceEvent) {
    match event {
        PresenceEvent::PeerConnected(peer) => {
            component_info!("session", "Peer {} connected", peer)
        }
        PresenceEvent::PeerDisconnected { peer, reason } => {
            component_info!("session", "Peer {} disconnected ({})", peer, reason)
        }
        PresenceEvent::PeerInterrupted {
            peer,
            consecutive_failures,
        } => component_warn!(
            "session",
            "Peer {} interrupted after {} failed sends",
            peer,
            consecutive_failures
        ),
        PresenceEvent::PeerRecovered(peer) => {
            component_info!("session", "Peer {} recovered", peer)
        }
        PresenceEvent::MessageReceived { peer, text } => {
            component_info!("chat", "{}: {}", peer, text)
        }
        PresenceEvent::InvitationPending(peer) => {
            component_info!("session", "Invitation from {} awaiting response", peer)
        }
        PresenceEvent::Error(err) => {
            component_error!("session", "{} ({:?})", err, err.category())
        }
    }
}

struct SimulatedPeer {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Start `count` in-memory devices on the same hub; each greets whoever connects
async fn spawn_simulated_peers(
    hub: &LoopbackHub,
    node_config: &NodeConfig,
    count: usize,
) -> anyhow::Result<Vec<SimulatedPeer>> {
    let mut peers = Vec::with_capacity(count);
    for index in 0..count {
        let name = format!("sim-{}", index + 1);
        let mut config = node_config.manager_config();
        config.display_name = name.clone();
        config.filter.subscription_only = false;

        let (events, mut event_rx) = ChannelEventHandler::new();
        let (manager, handle) = SessionManagerBuilder::new()
            .config(config)
            .transport_factory(Arc::new(hub.factory().with_info("simulated", "true")))
            .event_handler(Arc::new(events))
            .build()
            .await
            .with_context(|| format!("Failed to start simulated peer {}", name))?;

        handle
            .create_profile(ProfileDraft {
                username: name.clone(),
                status: Some("simulated".to_string()),
                is_premium: index % 2 == 0,
                ..Default::default()
            })
            .await?;

        let greeter = handle.clone();
        let task = tokio::spawn(async move {
            let runner = tokio::spawn(manager.run());
            while let Some(event) = event_rx.recv().await {
                if let PresenceEvent::PeerConnected(peer) = event {
                    let greeting = format!("hello {}, this is {}", peer, name);
                    if let Err(e) = greeter.send_text_to(peer, greeting).await {
                        component_debug!("simulator", "Greeting from {} failed: {}", name, e);
                    }
                }
            }
            if let Err(e) = runner.await {
                component_warn!("simulator", "Simulated peer {} task failed: {}", name, e);
            }
        });

        component_info!("simulator", "Simulated peer {} started", handle.local_identity());
        peers.push(SimulatedPeer { handle, task });
    }
    Ok(peers)
}
