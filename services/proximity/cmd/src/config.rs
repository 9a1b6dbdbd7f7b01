//! Configuration handling for the proximity node.
//!
//! Values come from the shared config file first, then environment
//! variables, then command-line flags (applied in `main`).

use anyhow::{bail, Result};
use proximity_session::{DiscoveryFilterConfig, InvitationPolicy, ManagerConfig, ReconnectConfig};
use proximity_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory`, `file` or `redis`
    pub mode: String,
    /// Data directory for file storage
    pub data_dir: String,
    /// Sync each profile write to disk
    pub fsync: bool,
    /// Redis connection URL
    pub redis_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            data_dir: "./proximitydata".to_string(),
            fsync: true,
            redis_url: "redis://127.0.0.1/".to_string(),
        }
    }
}

/// Proximity node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity used when no profile is logged in
    pub display_name: String,
    /// Advertised service type
    pub service_type: String,
    /// Storage settings
    pub storage: StorageConfig,
    /// Maximum peer distance in meters
    pub max_distance_m: f64,
    /// Only keep premium peers
    pub subscription_only: bool,
    /// Invite every discovered peer
    pub auto_connect: bool,
    /// Share the device position with peers
    pub share_location: bool,
    /// Ask before accepting invitations
    pub prompt_invitations: bool,
    /// Invitation timeout
    #[serde(with = "humantime_serde_compat")]
    pub invite_timeout: Duration,
    /// Wait after the last peer leaves before re-inviting
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_grace: Duration,
    /// Wait after re-inviting before a full reset
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_recovery: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            display_name: manager.display_name,
            service_type: manager.service_type,
            storage: StorageConfig::default(),
            max_distance_m: manager.filter.max_distance_m,
            subscription_only: manager.filter.subscription_only,
            auto_connect: manager.auto_connect,
            share_location: manager.share_location,
            prompt_invitations: false,
            invite_timeout: manager.invite_timeout,
            reconnect_grace: manager.reconnect.grace,
            reconnect_recovery: manager.reconnect.recovery,
        }
    }
}

/// Durations serialized as humantime strings (`"3s"`, `"500ms"`)
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    proximity: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides();

        info!(
            "Final proximity configuration: display_name={}, service_type={}, storage={}, max_distance={}m",
            config.display_name, config.service_type, config.storage.mode, config.max_distance_m
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(service) = root_config.services.and_then(|s| s.proximity) {
            self.apply_service_config(service);
        }
    }

    fn apply_service_config(&mut self, service_config: ServiceConfig) {
        for arg in service_config.args.unwrap_or_default() {
            if let Some(name) = arg.strip_prefix("--display-name=") {
                self.display_name = name.to_string();
            } else if let Some(dir) = arg.strip_prefix("--data-dir=") {
                self.storage.mode = "file".to_string();
                self.storage.data_dir = dir.to_string();
            }
        }

        for (key, value) in service_config.config.unwrap_or_default() {
            self.apply_key(&key, value);
        }
    }

    fn apply_key(&mut self, key: &str, value: String) {
        let duration = |raw: &str| match humantime::parse_duration(raw) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("Ignoring {}: {}", key, e);
                None
            }
        };

        match key {
            "services.proximity.display_name" => self.display_name = value,
            "services.proximity.service_type" => self.service_type = value,
            "services.proximity.storage.mode" => self.storage.mode = value,
            "services.proximity.storage.data_dir" => self.storage.data_dir = value,
            "services.proximity.storage.fsync" => self.storage.fsync = parse_bool(&value),
            "services.proximity.storage.redis_url" => self.storage.redis_url = value,
            "services.proximity.filter.max_distance_m" => match value.parse::<f64>() {
                Ok(meters) => self.max_distance_m = meters,
                Err(e) => warn!("Ignoring {}: {}", key, e),
            },
            "services.proximity.filter.subscription_only" => {
                self.subscription_only = parse_bool(&value)
            }
            "services.proximity.auto_connect" => self.auto_connect = parse_bool(&value),
            "services.proximity.share_location" => self.share_location = parse_bool(&value),
            "services.proximity.invitation_policy" => {
                self.prompt_invitations = value.eq_ignore_ascii_case("prompt")
            }
            "services.proximity.invite_timeout" => {
                if let Some(d) = duration(&value) {
                    self.invite_timeout = d;
                }
            }
            "services.proximity.reconnect.grace" => {
                if let Some(d) = duration(&value) {
                    self.reconnect_grace = d;
                }
            }
            "services.proximity.reconnect.recovery" => {
                if let Some(d) = duration(&value) {
                    self.reconnect_recovery = d;
                }
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("PROXIMITY_DISPLAY_NAME") {
            info!("Display name overridden by environment: {}", name);
            self.display_name = name;
        }

        if let Some(distance) = lookup("PROXIMITY_MAX_DISTANCE") {
            match distance.parse::<f64>() {
                Ok(meters) => {
                    self.max_distance_m = meters;
                    info!("Max distance overridden by environment: {}m", meters);
                }
                Err(e) => warn!("Ignoring PROXIMITY_MAX_DISTANCE={}: {}", distance, e),
            }
        }

        if let Some(flag) = lookup("PROXIMITY_SUBSCRIPTION_ONLY") {
            self.subscription_only = parse_bool(&flag);
            info!(
                "Subscription-only overridden by environment: {}",
                self.subscription_only
            );
        }

        if let Some(dir) = lookup("PROXIMITY_STORAGE_DIR") {
            info!("Storage directory overridden by environment: {}", dir);
            self.storage.mode = "file".to_string();
            self.storage.data_dir = dir;
        }
    }

    /// Storage backend selected by this configuration
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.storage.mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                data_dir: self.storage.data_dir.clone(),
                fsync: self.storage.fsync,
            }),
            "redis" => Ok(StorageMode::Redis {
                url: self.storage.redis_url.clone(),
            }),
            other => bail!("Unknown storage mode '{}' (expected memory, file or redis)", other),
        }
    }

    /// Session manager configuration derived from this node configuration
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            display_name: self.display_name.clone(),
            service_type: self.service_type.clone(),
            auto_connect: self.auto_connect,
            invitation_policy: if self.prompt_invitations {
                InvitationPolicy::Prompt
            } else {
                InvitationPolicy::AutoAccept
            },
            invite_timeout: self.invite_timeout,
            share_location: self.share_location,
            filter: DiscoveryFilterConfig {
                max_distance_m: self.max_distance_m,
                subscription_only: self.subscription_only,
            },
            reconnect: ReconnectConfig {
                grace: self.reconnect_grace,
                recovery: self.reconnect_recovery,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
