//! Discovery, connection lifecycle and messaging for nearby peers.
//!
//! This crate owns everything between a proximity radio transport and the
//! presentation layer: the per-peer connection state machine, reconnection
//! after the connected set empties, the discovery filter, the profile
//! directory, message dispatch and the social-link request ledger.
//!
//! ## Features
//!
//! - **Transport Port**: narrow trait over advertise/browse/invite/send
//! - **Loopback Transport**: in-process hub for tests and simulation
//! - **Session Manager**: single `tokio::select!` event loop
//! - **Reconnection**: grace re-invite, full reset, exponential backoff
//! - **Profile Directory**: cached profiles with background persistence
//!
//! ## Example
//!
//! ```rust,no_run
//! use proximity_session::{LoopbackHub, ManagerConfig, SessionManagerBuilder};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = LoopbackHub::new();
//! let config = ManagerConfig {
//!     display_name: "Alice".to_string(),
//!     ..Default::default()
//! };
//!
//! let (manager, handle) = SessionManagerBuilder::new()
//!     .config(config)
//!     .transport_factory(Arc::new(hub.factory()))
//!     .build()
//!     .await?;
//! tokio::spawn(manager.run());
//!
//! handle.send_text("hello")?;
//! for peer in handle.snapshot().connected_peers {
//!     println!("{} ({})", peer.id, peer.profile.username);
//! }
//! handle.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod failure_tracker;
pub mod filter;
pub mod ledger;
pub mod location;
pub mod loopback;
pub mod manager;
pub mod observer;
pub mod reconnect;
pub mod registry;
pub mod transport;

// Re-export main types
pub use config::{
    DiscoveryFilterConfig, InvitationPolicy, ManagerConfig, ReconnectConfig, RetryConfig,
};
pub use directory::{PersistOutcome, ProfileDirectory, ProfileDraft};
pub use dispatcher::{MessageDispatcher, SendReport};
pub use error::{ErrorCategory, SessionError, TransportError};
pub use failure_tracker::SendFailureTracker;
pub use ledger::LinkRequestState;
pub use location::{LocationFeed, LocationReceiver};
pub use loopback::{LoopbackFactory, LoopbackHub, LoopbackTransport};
pub use manager::{SessionHandle, SessionManager, SessionManagerBuilder};
pub use observer::{ChannelEventHandler, PresenceEvent, PresenceEventHandler, SessionSnapshot};
pub use reconnect::{ReconnectAction, ReconnectController, ReconnectPhase, ReconnectStage, RetryBackoff};
pub use registry::{ConnectedPeer, ConnectionState, PeerRegistry};
pub use transport::{
    InvitationResponder, PeerConnectionState, TransportEvent, TransportEvents, TransportFactory,
    TransportPort,
};
