//! Profile records and durable profile stores with pluggable backends.
//!
//! This crate holds the data model shared by the session layer (peer
//! identities, profile records, social links, coordinates) and the
//! [`ProfileStore`] trait with in-memory, file-based and Redis backends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Username given to profiles created on first contact
pub const PLACEHOLDER_USERNAME: &str = "Unknown User";

/// Mean Earth radius used for great-circle distances
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Remote device identifier derived from its advertised display name
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap a display name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Geographic position in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}

impl Coordinates {
    /// Create a new position
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether this is the (0, 0) "never synced" position
    pub fn is_zero(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    /// Great-circle distance in meters (haversine)
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }
}

/// Auxiliary contact link (platform + URL)
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocialLink {
    /// Platform name
    pub platform: String,
    /// Link target
    pub url: String,
}

impl SocialLink {
    /// Create a new link
    pub fn new(platform: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            url: url.into(),
        }
    }
}

/// Cached profile of a peer or of the local user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// Peer identifier (store key)
    pub id: PeerIdentity,
    /// Display username
    pub username: String,
    /// Free-text bio
    #[serde(default)]
    pub bio: Option<String>,
    /// Age in years
    #[serde(default)]
    pub age: Option<u16>,
    /// Avatar reference
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Contact email
    #[serde(default)]
    pub email: Option<String>,
    /// Free-text status line
    #[serde(default)]
    pub status: Option<String>,
    /// Last known position
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    /// Premium subscription flag
    #[serde(default)]
    pub is_premium: bool,
    /// Local user flag; at most one record carries it
    #[serde(default)]
    pub is_logged_in: bool,
    /// Live presence flag
    #[serde(default)]
    pub is_online: bool,
    /// First time this peer was matched
    #[serde(default)]
    pub matched_at: Option<DateTime<Utc>>,
    /// Identities waiting for this profile's social links
    #[serde(default)]
    pub pending_link_requests: BTreeSet<PeerIdentity>,
    /// Identities whose last request for this profile's links was rejected
    #[serde(default)]
    pub rejected_link_requests: BTreeSet<PeerIdentity>,
    /// Links other profiles approved for this one
    #[serde(default)]
    pub approved_links: BTreeSet<SocialLink>,
    /// This profile's own links
    #[serde(default)]
    pub social_links: Vec<SocialLink>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl ProfileRecord {
    /// Placeholder created on first contact with an identity
    pub fn placeholder(id: PeerIdentity) -> Self {
        Self {
            id,
            username: PLACEHOLDER_USERNAME.to_string(),
            bio: None,
            age: None,
            avatar_url: None,
            email: None,
            status: None,
            coordinates: None,
            is_premium: false,
            is_logged_in: false,
            is_online: false,
            matched_at: None,
            pending_link_requests: BTreeSet::new(),
            rejected_link_requests: BTreeSet::new(),
            approved_links: BTreeSet::new(),
            social_links: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the record still carries placeholder data
    pub fn is_placeholder(&self) -> bool {
        self.username == PLACEHOLDER_USERNAME
    }

    /// Whether the record has a usable position
    pub fn has_location(&self) -> bool {
        self.coordinates.map(|c| !c.is_zero()).unwrap_or(false)
    }

    /// Stamp the mutation time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Entry not found
    #[error("Entry not found")]
    NotFound,
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Predicate used by [`ProfileStore::query`]
pub type ProfilePredicate<'a> = &'a (dyn Fn(&ProfileRecord) -> bool + Send + Sync);

/// Durable key-value persistence of profile records
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Look up a record by identifier
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError>;

    /// The record flagged as the local user, if any
    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError>;

    /// Insert or replace a record
    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError>;

    /// All records matching `predicate`
    async fn query(&self, predicate: ProfilePredicate<'_>) -> Result<Vec<ProfileRecord>, StorageError>;

    /// Every stored record
    async fn load_all(&self) -> Result<Vec<ProfileRecord>, StorageError> {
        self.query(&|_| true).await
    }
}

/// Pick the logged-in record, preferring the most recently updated one
pub(crate) fn newest_logged_in<I>(records: I) -> Option<ProfileRecord>
where
    I: IntoIterator<Item = ProfileRecord>,
{
    records
        .into_iter()
        .filter(|r| r.is_logged_in)
        .max_by_key(|r| r.updated_at)
}

/// Storage backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// One JSON document per profile under `data_dir`
    File {
        /// Data directory path
        data_dir: String,
        /// Sync every write to disk before renaming it into place
        fsync: bool,
    },
    /// Redis as primary storage
    Redis {
        /// Redis connection URL
        url: String,
    },
}

// Re-export backend implementations
pub use backend::file::{FileProfileStore, FileStoreConfig};
pub use backend::mem::MemoryProfileStore;
#[cfg(feature = "redis-backend")]
pub use backend::redis::RedisProfileStore;

/// Create a profile store from configuration
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn ProfileStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryProfileStore::new())),
        StorageMode::File { data_dir, fsync } => {
            let config = FileStoreConfig {
                data_dir: data_dir.into(),
                fsync,
            };
            Ok(Arc::new(FileProfileStore::open(config).await?))
        }
        #[cfg(feature = "redis-backend")]
        StorageMode::Redis { url } => Ok(Arc::new(RedisProfileStore::connect(&url).await?)),
        #[cfg(not(feature = "redis-backend"))]
        StorageMode::Redis { .. } => Err(StorageError::Invalid(
            "built without the redis-backend feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_profile() {
        let record = ProfileRecord::placeholder("Bob".into());
        assert_eq!(record.username, "Unknown User");
        assert!(record.is_placeholder());
        assert!(!record.is_logged_in);
        assert!(record.matched_at.is_none());
        assert!(!record.has_location());
    }

    #[test]
    fn test_haversine_distance() {
        let a = Coordinates::new(52.5200, 13.4050);
        let b = Coordinates::new(52.5200, 13.4065);
        let d = a.distance_to(&b);
        // ~101 m along the parallel at this latitude
        assert!(d > 95.0 && d < 110.0, "distance was {d}");
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_zero_coordinates_not_a_location() {
        let mut record = ProfileRecord::placeholder("Carol".into());
        record.coordinates = Some(Coordinates::new(0.0, 0.0));
        assert!(!record.has_location());
        record.coordinates = Some(Coordinates::new(1.0, 0.0));
        assert!(record.has_location());
    }

    #[test]
    fn test_record_json_defaults() {
        let json = r#"{"id":"Dave","username":"dave","updated_at":"2024-05-01T10:00:00Z"}"#;
        let record: ProfileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id.as_str(), "Dave");
        assert!(record.rejected_link_requests.is_empty());
        assert!(record.pending_link_requests.is_empty());
        assert!(!record.is_premium);
    }

    #[tokio::test]
    async fn test_open_in_memory_store() {
        let store = open_store(StorageMode::InMemory).await.unwrap();
        assert!(store.get(&"nobody".into()).await.unwrap().is_none());
        assert!(store.get_logged_in().await.unwrap().is_none());
    }
}
