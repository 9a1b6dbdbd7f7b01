//! In-memory storage backend for development and testing

use crate::{newest_logged_in, PeerIdentity, ProfilePredicate, ProfileRecord, ProfileStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory profile store
#[derive(Clone, Default)]
pub struct MemoryProfileStore {
    /// Records keyed by identifier
    records: Arc<DashMap<PeerIdentity, ProfileRecord>>,
}

impl MemoryProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get(&self, id: &PeerIdentity) -> Result<Option<ProfileRecord>, StorageError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn get_logged_in(&self) -> Result<Option<ProfileRecord>, StorageError> {
        Ok(newest_logged_in(
            self.records.iter().map(|r| r.value().clone()),
        ))
    }

    async fn save(&self, record: &ProfileRecord) -> Result<(), StorageError> {
        debug!("profile save id={} username={}", record.id, record.username);
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
