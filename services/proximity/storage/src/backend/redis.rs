//! Redis storage backend: JSON values under `proximity:profile:<id>`

use crate::{newest_logged_in, PeerIdentity, ProfilePredicate, ProfileRecord, ProfileStore, StorageError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "proximity:profile:";

fn key_for(id: &PeerIdentity) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

fn backend_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Redis-backed profile store
#[derive(Clone)]
pub struct RedisProfileStore {
    conn: ConnectionManager,
}

impl RedisProfileStore {
    /// Connect to `url`
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        info!("Connected profile store to redis at {}", url);
        Ok(Self { conn })
    }

    async fn scan_all(&self) -> Result<Vec<ProfileRecord>, StorageError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{}*", KEY_PREFIX))
            .await
            .map_err(backend_err)?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = conn.get(&key).await.map_err(backend_err)?;
            let Some(value) = value else { continue };
            match serde_json::from_str::<ProfileRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable profile at {}: {}", key, e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ProfileStore for RedisProfileStore {
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key_for(id)).await.map_err(backend_err)?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError> {
        Ok(newest_logged_in(self.scan_all().await?))
    }

    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        debug!("RedisStore save id={}", record.id);
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key_for(&record.id), json)
            .await
            .map_err(backend_err)
    }

    async fn query(&self, predicate: ProfilePredicate<'_>) -> Result<Vec<ProfileRecord>, StorageError> {
        let mut results: Vec<ProfileRecord> = self
            .scan_all()
            .await?
            .into_iter()
            .filter(|r| predicate(r))
            .collect();
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(key_for(&"Bob".into()), "proximity:profile:Bob");
    }
}
