//! Manager configuration with defaults.

use std::time::Duration;

/// How inbound invitations are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvitationPolicy {
    /// Accept every invitation immediately
    #[default]
    AutoAccept,
    /// Surface the invitation and wait for the local user
    Prompt,
}

/// Admission policy applied to connected peers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoveryFilterConfig {
    /// Maximum distance in meters; never negative
    pub max_distance_m: f64,
    /// Only keep premium peers
    pub subscription_only: bool,
}

impl Default for DiscoveryFilterConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 100.0,
            subscription_only: false,
        }
    }
}

/// Reconnection controller timings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Wait after the connected set empties before re-inviting
    pub grace: Duration,
    /// Wait after re-inviting before a full reset
    pub recovery: Duration,
    /// Cap on the backed-off grace interval after resets
    pub max_backoff: Duration,
    /// Consecutive resets before connectivity loss is reported
    pub alert_after_resets: u32,
    /// Maximum number of remembered peers
    pub max_remembered: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            recovery: Duration::from_secs(3),
            max_backoff: Duration::from_secs(60),
            alert_after_resets: 3,
            max_remembered: 32,
        }
    }
}

/// Retry and failure-detection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Consecutive send failures before a peer counts as interrupted
    pub send_failure_threshold: u32,
    /// Window in which send failures are counted
    pub send_failure_window: Duration,
    /// First discovery restart delay
    pub discovery_initial: Duration,
    /// Longest discovery restart delay
    pub discovery_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            send_failure_threshold: 3,
            send_failure_window: Duration::from_secs(30),
            discovery_initial: Duration::from_millis(500),
            discovery_max: Duration::from_secs(30),
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Display name used as identity when no profile is logged in
    pub display_name: String,
    /// Service type advertised to nearby devices
    pub service_type: String,
    /// Invite every newly discovered peer
    pub auto_connect: bool,
    /// Inbound invitation handling
    pub invitation_policy: InvitationPolicy,
    /// Invitation timeout handed to the transport
    pub invite_timeout: Duration,
    /// Write position updates to the local profile and share them
    pub share_location: bool,
    /// Initial admission policy
    pub filter: DiscoveryFilterConfig,
    /// Reconnection timings
    pub reconnect: ReconnectConfig,
    /// Retry settings
    pub retry: RetryConfig,
    /// Start advertising and browsing when the manager starts
    pub start_discovery_on_launch: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            display_name: "proximity-device".to_string(),
            service_type: "proximity1".to_string(),
            auto_connect: true,
            invitation_policy: InvitationPolicy::AutoAccept,
            invite_timeout: Duration::from_secs(30),
            share_location: true,
            filter: DiscoveryFilterConfig::default(),
            reconnect: ReconnectConfig::default(),
            retry: RetryConfig::default(),
            start_discovery_on_launch: true,
        }
    }
}
