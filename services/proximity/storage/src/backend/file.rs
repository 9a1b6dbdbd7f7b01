//! File-based storage backend: one checksummed JSON document per profile

use crate::{newest_logged_in, PeerIdentity, ProfilePredicate, ProfileRecord, ProfileStore, StorageError};
use async_trait::async_trait;
use crc32fast::Hasher;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Configuration for the file-based profile store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Sync each document to disk before it replaces the previous one
    pub fsync: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./proximitydata"),
            fsync: true,
        }
    }
}

/// On-disk envelope around a serialized record
#[derive(Serialize, Deserialize, Debug)]
struct StoredProfile {
    /// CRC32 over `body`
    crc32: u32,
    /// JSON-encoded `ProfileRecord`
    body: String,
}

impl StoredProfile {
    fn wrap(record: &ProfileRecord) -> Result<Self, StorageError> {
        let body = serde_json::to_string(record)?;
        Ok(Self {
            crc32: compute_crc(body.as_bytes()),
            body,
        })
    }

    fn unwrap_record(self) -> Result<ProfileRecord, StorageError> {
        if compute_crc(self.body.as_bytes()) != self.crc32 {
            return Err(StorageError::Corruption("checksum mismatch".to_string()));
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// File name for an identity: lowercase hex of its UTF-8 bytes
fn file_name_for(id: &PeerIdentity) -> String {
    let mut name = String::with_capacity(id.as_str().len() * 2 + 5);
    for byte in id.as_str().bytes() {
        name.push_str(&format!("{:02x}", byte));
    }
    name.push_str(".json");
    name
}

/// File-based profile store
///
/// Records are cached in memory after the initial directory scan; every
/// `save` rewrites the record's document through a temp file and rename.
pub struct FileProfileStore {
    config: FileStoreConfig,
    /// Write-through cache of every readable document
    records: Arc<DashMap<PeerIdentity, ProfileRecord>>,
}

impl FileProfileStore {
    /// Open (or create) a store rooted at `config.data_dir`
    pub async fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        let store = Self {
            config,
            records: Arc::new(DashMap::new()),
        };

        tokio::fs::create_dir_all(store.profiles_dir()).await?;
        store.load_profiles().await?;

        Ok(store)
    }

    fn profiles_dir(&self) -> PathBuf {
        self.config.data_dir.join("profiles")
    }

    async fn load_profiles(&self) -> Result<(), StorageError> {
        let mut entries = tokio::fs::read_dir(self.profiles_dir()).await?;
        let mut loaded = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match Self::load_profile(&path).await {
                Ok(record) => {
                    self.records.insert(record.id.clone(), record);
                    loaded += 1;
                }
                Err(e) => {
                    warn!("Skipping unreadable profile {}: {}", path.display(), e);
                }
            }
        }

        info!(
            "Loaded {} profiles from {}",
            loaded,
            self.config.data_dir.display()
        );
        Ok(())
    }

    async fn load_profile(path: &Path) -> Result<ProfileRecord, StorageError> {
        let content = tokio::fs::read_to_string(path).await?;
        let stored: StoredProfile = serde_json::from_str(&content)
            .map_err(|e| StorageError::Corruption(format!("invalid envelope: {}", e)))?;
        stored.unwrap_record()
    }

    async fn write_profile(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        let stored = StoredProfile::wrap(record)?;
        let content = serde_json::to_vec_pretty(&stored)?;

        let final_path = self.profiles_dir().join(file_name_for(&record.id));
        let tmp_path = final_path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        if self.config.fsync {
            file.sync_all().await?;
        }
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError> {
        Ok(newest_logged_in(
            self.records.iter().map(|r| r.value().clone()),
        ))
    }

    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        debug!("FileStore save id={}", record.id);

        self.write_profile(record).await?;
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn query(&self, predicate: ProfilePredicate<'_>) -> Result<Vec<ProfileRecord>, StorageError> {
        let mut results: Vec<ProfileRecord> = self
            .records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }
}
