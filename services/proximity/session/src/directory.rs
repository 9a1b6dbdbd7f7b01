//! Profile directory: the in-memory view of every known profile.
//!
//! The directory is hydrated from the [`ProfileStore`] at start-up and is
//! the source of truth afterwards. Every mutation is queued to a single
//! writer task so saves reach the store in order; the writer reports each
//! outcome back over a channel that the manager's event loop drains. A
//! failed save leaves the in-memory record untouched and marks it dirty, and
//! the next persist of any record retries every dirty record in full.
//!
//! A record created on a cache miss has not been checked against the store
//! yet. Until it is, its saves are reconciled: the writer reads the stored
//! copy, merges the cached changes into it and saves the merge, so history
//! already on disk survives a failed hydrate.

use crate::error::SessionError;
use chrono::Utc;
use proximity_storage::{
    Coordinates, PeerIdentity, ProfileRecord, ProfileStore, SocialLink, StorageError,
};
use proximity_wire::{ProfileSnapshot, WireCoordinates, WireLink};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Result of one background save
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    /// Saved record
    pub id: PeerIdentity,
    /// Store error text on failure
    pub result: Result<(), String>,
    /// Merged record written by a reconciling save
    pub resolved: Option<ProfileRecord>,
}

/// Receiving side of the writer's outcome stream
pub type PersistOutcomes = mpsc::UnboundedReceiver<PersistOutcome>;

/// Fields the local user edits on signup or profile edit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileDraft {
    /// Display username
    pub username: String,
    /// Free-text bio
    pub bio: Option<String>,
    /// Age in years
    pub age: Option<u16>,
    /// Avatar reference
    pub avatar_url: Option<String>,
    /// Contact email
    pub email: Option<String>,
    /// Free-text status line
    pub status: Option<String>,
    /// Premium subscription flag
    pub is_premium: bool,
    /// Links shared on approved requests
    pub social_links: Vec<SocialLink>,
}

#[derive(Debug)]
enum WriteJob {
    /// Overwrite the stored record
    Save(ProfileRecord),
    /// Merge into the stored copy, if any, then save
    Reconcile(ProfileRecord),
}

/// Merge `cached` into `stored`. Match time, link requests and approved
/// links are never lost; placeholder fields never replace stored ones.
pub fn reconcile(stored: ProfileRecord, cached: &ProfileRecord) -> ProfileRecord {
    let mut merged = stored;

    if !cached.is_placeholder() {
        merged.username = cached.username.clone();
        merged.is_premium = cached.is_premium;
    }
    if !cached.social_links.is_empty() {
        merged.social_links = cached.social_links.clone();
    }
    merged.bio = cached.bio.clone().or(merged.bio);
    merged.age = cached.age.or(merged.age);
    merged.avatar_url = cached.avatar_url.clone().or(merged.avatar_url);
    merged.email = cached.email.clone().or(merged.email);
    merged.status = cached.status.clone().or(merged.status);
    merged.coordinates = cached.coordinates.or(merged.coordinates);

    merged.matched_at = match (merged.matched_at, cached.matched_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    merged
        .pending_link_requests
        .extend(cached.pending_link_requests.iter().cloned());
    merged
        .rejected_link_requests
        .extend(cached.rejected_link_requests.iter().cloned());
    merged
        .pending_link_requests
        .retain(|id| !cached.rejected_link_requests.contains(id));
    merged
        .approved_links
        .extend(cached.approved_links.iter().cloned());
    merged.is_logged_in |= cached.is_logged_in;
    merged.is_online = cached.is_online;
    merged.updated_at = merged.updated_at.max(cached.updated_at);
    merged
}

async fn reconcile_and_save(
    store: &dyn ProfileStore,
    cached: ProfileRecord,
) -> Result<ProfileRecord, StorageError> {
    let merged = match store.get(&cached.id).await? {
        Some(stored) => {
            debug!("Merging cached profile {} into its stored copy", cached.id);
            reconcile(stored, &cached)
        }
        None => cached,
    };
    store.save(&merged).await?;
    Ok(merged)
}

async fn run_writer(
    store: Arc<dyn ProfileStore>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    outcomes: mpsc::UnboundedSender<PersistOutcome>,
) {
    while let Some(job) = jobs.recv().await {
        let outcome = match job {
            WriteJob::Save(record) => PersistOutcome {
                result: store.save(&record).await.map_err(|e| {
                    error!("Failed to persist profile {}: {}", record.id, e);
                    e.to_string()
                }),
                id: record.id,
                resolved: None,
            },
            WriteJob::Reconcile(record) => {
                let id = record.id.clone();
                match reconcile_and_save(store.as_ref(), record).await {
                    Ok(merged) => PersistOutcome {
                        id,
                        result: Ok(()),
                        resolved: Some(merged),
                    },
                    Err(e) => {
                        error!("Failed to reconcile profile {}: {}", id, e);
                        PersistOutcome {
                            id,
                            result: Err(e.to_string()),
                            resolved: None,
                        }
                    }
                }
            }
        };
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    debug!("Profile writer stopped");
}

/// Cached profiles keyed by identity
pub struct ProfileDirectory {
    store: Arc<dyn ProfileStore>,
    records: HashMap<PeerIdentity, ProfileRecord>,
    /// Records whose last save failed
    dirty: BTreeSet<PeerIdentity>,
    /// Records created on a cache miss and not yet checked against the store
    unconfirmed: HashSet<PeerIdentity>,
    /// Reconciling saves still queued, per identity
    in_flight: HashMap<PeerIdentity, usize>,
    writer: mpsc::UnboundedSender<WriteJob>,
}

impl ProfileDirectory {
    /// Create an empty directory and start its writer task
    pub fn new(store: Arc<dyn ProfileStore>) -> (Self, PersistOutcomes) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store.clone(), job_rx, outcome_tx));

        let directory = Self {
            store,
            records: HashMap::new(),
            dirty: BTreeSet::new(),
            unconfirmed: HashSet::new(),
            in_flight: HashMap::new(),
            writer: job_tx,
        };
        (directory, outcome_rx)
    }

    /// Load every stored record into the cache
    pub async fn hydrate(&mut self) -> Result<usize, SessionError> {
        let stored = self.store.load_all().await?;
        let count = stored.len();
        for mut record in stored {
            // Presence is live state; nobody is online at start-up
            record.is_online = false;
            self.records.insert(record.id.clone(), record);
        }
        info!("Profile directory hydrated with {} records", count);
        Ok(count)
    }

    /// Cached record for `id`
    pub fn get(&self, id: &PeerIdentity) -> Option<&ProfileRecord> {
        self.records.get(id)
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The local user's record
    pub fn logged_in(&self) -> Option<&ProfileRecord> {
        self.records
            .values()
            .filter(|r| r.is_logged_in)
            .max_by_key(|r| r.updated_at)
    }

    /// Identities whose last save failed
    pub fn dirty_ids(&self) -> Vec<PeerIdentity> {
        self.dirty.iter().cloned().collect()
    }

    /// Queue `id` for saving, together with every record still dirty
    fn persist(&mut self, id: &PeerIdentity) {
        let mut batch: Vec<PeerIdentity> = std::mem::take(&mut self.dirty).into_iter().collect();
        if !batch.contains(id) {
            batch.push(id.clone());
        }

        for id in batch {
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            let job = if self.unconfirmed.contains(&id) {
                *self.in_flight.entry(id.clone()).or_default() += 1;
                WriteJob::Reconcile(record.clone())
            } else {
                WriteJob::Save(record.clone())
            };
            if self.writer.send(job).is_err() {
                error!("Profile writer is gone, keeping {} dirty", id);
                self.dirty.insert(id);
            }
        }
    }

    /// Apply a writer outcome. Returns true when the cached record was
    /// replaced by its reconciled stored copy.
    pub fn on_persist_outcome(&mut self, outcome: PersistOutcome) -> Result<bool, SessionError> {
        let settled = match self.in_flight.get_mut(&outcome.id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if settled {
            self.in_flight.remove(&outcome.id);
        }

        match outcome.result {
            Ok(()) => match outcome.resolved {
                // Later reconciling saves carry newer changes; only the last one is adopted
                Some(merged) if settled => {
                    self.unconfirmed.remove(&outcome.id);
                    Ok(self.adopt(merged))
                }
                _ => Ok(false),
            },
            Err(reason) => {
                self.dirty.insert(outcome.id.clone());
                Err(SessionError::Persistence(format!(
                    "saving profile {} failed: {}",
                    outcome.id, reason
                )))
            }
        }
    }

    /// Replace the cached record with `merged`, keeping live presence
    fn adopt(&mut self, mut merged: ProfileRecord) -> bool {
        let id = merged.id.clone();
        merged.is_online = self.records.get(&id).map(|r| r.is_online).unwrap_or(false);
        if self.records.get(&id) == Some(&merged) {
            return false;
        }
        info!("Profile {} restored from store as {}", id, merged.username);
        self.records.insert(id, merged);
        true
    }

    /// Look up `id`, creating and persisting a placeholder when absent
    pub fn resolve_or_create(&mut self, id: &PeerIdentity) -> ProfileRecord {
        if let Some(record) = self.records.get(id) {
            return record.clone();
        }

        debug!("Creating placeholder profile for {}", id);
        let record = ProfileRecord::placeholder(id.clone());
        self.records.insert(id.clone(), record.clone());
        self.unconfirmed.insert(id.clone());
        self.persist(id);
        record
    }

    /// Merge a peer's snapshot into its cached record
    pub fn cache(
        &mut self,
        id: &PeerIdentity,
        incoming: &ProfileSnapshot,
        is_matched: bool,
    ) -> ProfileRecord {
        self.resolve_or_create(id);
        let Some(record) = self.records.get_mut(id) else {
            return ProfileRecord::placeholder(id.clone());
        };

        if !incoming.username.is_empty() {
            record.username = incoming.username.clone();
        }
        if incoming.bio.is_some() {
            record.bio = incoming.bio.clone();
        }
        if incoming.age.is_some() {
            record.age = incoming.age;
        }
        if incoming.avatar_url.is_some() {
            record.avatar_url = incoming.avatar_url.clone();
        }
        if incoming.email.is_some() {
            record.email = incoming.email.clone();
        }
        if incoming.status.is_some() {
            record.status = incoming.status.clone();
        }
        if let Some(coords) = incoming.coordinates {
            record.coordinates = Some(Coordinates::new(coords.latitude, coords.longitude));
        }
        record.is_premium = incoming.is_premium;
        record.social_links = incoming
            .social_links
            .iter()
            .map(|l| SocialLink::new(l.platform.clone(), l.url.clone()))
            .collect();
        if is_matched && record.matched_at.is_none() {
            record.matched_at = Some(Utc::now());
        }
        record.touch();

        let updated = record.clone();
        self.persist(id);
        updated
    }

    /// Track live presence (not persisted)
    pub fn set_online(&mut self, id: &PeerIdentity, online: bool) {
        if let Some(record) = self.records.get_mut(id) {
            record.is_online = online;
        }
    }

    /// Mutate a cached record; `f` returns whether anything changed, in
    /// which case the record is stamped and persisted.
    pub fn update<F>(&mut self, id: &PeerIdentity, f: F) -> bool
    where
        F: FnOnce(&mut ProfileRecord) -> bool,
    {
        let changed = match self.records.get_mut(id) {
            Some(record) => {
                let changed = f(record);
                if changed {
                    record.touch();
                }
                changed
            }
            None => false,
        };
        if changed {
            self.persist(id);
        }
        changed
    }

    /// Create or edit the local user's profile under `local`
    pub fn upsert_local(&mut self, local: &PeerIdentity, draft: ProfileDraft) -> ProfileRecord {
        let others: Vec<PeerIdentity> = self
            .records
            .values()
            .filter(|r| r.is_logged_in && &r.id != local)
            .map(|r| r.id.clone())
            .collect();
        for id in others {
            self.update(&id, |r| {
                r.is_logged_in = false;
                true
            });
        }

        if !self.records.contains_key(local) {
            self.unconfirmed.insert(local.clone());
        }
        let record = self
            .records
            .entry(local.clone())
            .or_insert_with(|| ProfileRecord::placeholder(local.clone()));
        record.username = draft.username;
        record.bio = draft.bio;
        record.age = draft.age;
        record.avatar_url = draft.avatar_url;
        record.email = draft.email;
        record.status = draft.status;
        record.is_premium = draft.is_premium;
        record.social_links = draft.social_links;
        record.is_logged_in = true;
        record.touch();

        let updated = record.clone();
        info!("Local profile {} saved as {}", local, updated.username);
        self.persist(local);
        updated
    }

    /// Write a position update to the local record
    pub fn update_local_coordinates(&mut self, position: Coordinates) -> bool {
        let Some(local) = self.logged_in().map(|r| r.id.clone()) else {
            return false;
        };
        self.update(&local, |r| {
            if r.coordinates == Some(position) {
                return false;
            }
            r.coordinates = Some(position);
            true
        })
    }

    /// Snapshot of the local profile to share with peers
    pub fn local_snapshot(&self, include_location: bool) -> Option<ProfileSnapshot> {
        self.logged_in().map(|r| to_snapshot(r, include_location))
    }

    /// Stored peers that are neither the local user nor online
    pub fn fetch_offline(&self, include_matched: bool, include_location: bool) -> Vec<ProfileRecord> {
        let mut records: Vec<ProfileRecord> = self
            .records
            .values()
            .filter(|r| !r.is_logged_in && !r.is_online)
            .filter(|r| !include_matched || r.matched_at.is_some())
            .filter(|r| !include_location || r.has_location())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Connected peers' profiles followed by offline ones, one per identity
    pub fn combined(
        &self,
        connected: &[PeerIdentity],
        include_matched: bool,
        include_location: bool,
    ) -> Vec<ProfileRecord> {
        let mut seen: HashSet<PeerIdentity> = HashSet::new();
        let mut records = Vec::new();

        for id in connected {
            if let Some(record) = self.records.get(id) {
                if seen.insert(id.clone()) {
                    records.push(record.clone());
                }
            } else {
                warn!("Connected peer {} has no cached profile", id);
            }
        }
        for record in self.fetch_offline(include_matched, include_location) {
            if seen.insert(record.id.clone()) {
                records.push(record);
            }
        }
        records
    }
}

/// Wire snapshot of a record
pub fn to_snapshot(record: &ProfileRecord, include_location: bool) -> ProfileSnapshot {
    ProfileSnapshot {
        username: record.username.clone(),
        bio: record.bio.clone(),
        age: record.age,
        avatar_url: record.avatar_url.clone(),
        email: record.email.clone(),
        status: record.status.clone(),
        coordinates: if include_location && record.has_location() {
            record.coordinates.map(|c| WireCoordinates {
                latitude: c.latitude,
                longitude: c.longitude,
            })
        } else {
            None
        },
        is_premium: record.is_premium,
        social_links: to_wire_links(&record.social_links),
    }
}

/// Wire form of a link list
pub fn to_wire_links<'a>(links: impl IntoIterator<Item = &'a SocialLink>) -> Vec<WireLink> {
    links
        .into_iter()
        .map(|l| WireLink {
            platform: l.platform.clone(),
            url: l.url.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proximity_storage::{MemoryProfileStore, ProfilePredicate, StorageError};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose writes can be switched to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryProfileStore,
        failing: AtomicBool,
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

    fn id(name: &str) -> PeerIdentity {
        PeerIdentity::from(name)
    }

    #[tokio::test]
    async fn test_resolve_or_create_placeholder() {
        let store = Arc::new(MemoryProfileStore::new());
        let (mut dir, mut outcomes) = ProfileDirectory::new(store.clone());

        let record = dir.resolve_or_create(&id("Bob"));
        assert_eq!(record.username, "Unknown User");
        assert_eq!(outcomes.recv().await.unwrap().result, Ok(()));
        assert!(store.get(&id("Bob")).await.unwrap().is_some());

        // Second call returns the cached record without another save
        dir.resolve_or_create(&id("Bob"));
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cache_merges_and_keeps_first_match() {
        let store = Arc::new(MemoryProfileStore::new());
        let (mut dir, _outcomes) = ProfileDirectory::new(store);

        let snapshot = ProfileSnapshot {
            username: "bob".into(),
            bio: Some("hiker".into()),
            is_premium: true,
            ..Default::default()
        };
        let first = dir.cache(&id("Bob"), &snapshot, true);
        assert_eq!(first.username, "bob");
        assert!(first.is_premium);
        let matched = first.matched_at.unwrap();

        let update = ProfileSnapshot {
            username: "bobby".into(),
            ..Default::default()
        };
        let second = dir.cache(&id("Bob"), &update, true);
        assert_eq!(second.username, "bobby");
        // Missing fields keep their cached value
        assert_eq!(second.bio.as_deref(), Some("hiker"));
        assert_eq!(second.matched_at, Some(matched));
    }

    #[tokio::test]
    async fn test_failed_persist_retried_on_next_write() {
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let (mut dir, mut outcomes) = ProfileDirectory::new(store.clone());

        dir.resolve_or_create(&id("Bob"));
        let outcome = outcomes.recv().await.unwrap();
        assert!(dir.on_persist_outcome(outcome).is_err());
        assert_eq!(dir.dirty_ids(), vec![id("Bob")]);
        // Cache is still valid
        assert!(dir.get(&id("Bob")).is_some());

        store.failing.store(false, Ordering::SeqCst);
        dir.resolve_or_create(&id("Carol"));
        assert!(dir.dirty_ids().is_empty());

        for _ in 0..2 {
            let outcome = outcomes.recv().await.unwrap();
            assert!(dir.on_persist_outcome(outcome).is_ok());
        }
        assert!(store.get(&id("Bob")).await.unwrap().is_some());
        assert!(store.get(&id("Carol")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_offline_and_combined() {
        let store = Arc::new(MemoryProfileStore::new());
        let (mut dir, _outcomes) = ProfileDirectory::new(store);

        dir.upsert_local(&id("Me"), ProfileDraft {
            username: "me".into(),
            ..Default::default()
        });
        dir.cache(&id("Matched"), &ProfileSnapshot::default(), true);
        dir.resolve_or_create(&id("Stranger"));
        dir.cache(
            &id("Located"),
            &ProfileSnapshot {
                coordinates: Some(WireCoordinates {
                    latitude: 1.0,
                    longitude: 2.0,
                }),
                ..Default::default()
            },
            false,
        );
        dir.resolve_or_create(&id("Online"));
        dir.set_online(&id("Online"), true);

        let ids = |records: Vec<ProfileRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.id.to_string()).collect()
        };

        assert_eq!(
            ids(dir.fetch_offline(false, false)),
            vec!["Located", "Matched", "Stranger"]
        );
        assert_eq!(ids(dir.fetch_offline(true, false)), vec!["Matched"]);
        assert_eq!(ids(dir.fetch_offline(false, true)), vec!["Located"]);

        assert_eq!(
            ids(dir.combined(&[id("Online"), id("Matched")], true, false)),
            vec!["Online", "Matched"]
        );
    }

    #[tokio::test]
    async fn test_single_logged_in_record() {
        let store = Arc::new(MemoryProfileStore::new());
        let (mut dir, _outcomes) = ProfileDirectory::new(store);

        dir.upsert_local(&id("Old"), ProfileDraft::default());
        dir.upsert_local(&id("New"), ProfileDraft {
            username: "new".into(),
            ..Default::default()
        });

        let logged_in: Vec<&ProfileRecord> =
            dir.records.values().filter(|r| r.is_logged_in).collect();
        assert_eq!(logged_in.len(), 1);
        assert_eq!(dir.logged_in().unwrap().id, id("New"));
    }

    #[tokio::test]
    async fn test_hydrate_clears_presence() {
        let store = Arc::new(MemoryProfileStore::new());
        let mut stale = ProfileRecord::placeholder(id("Bob"));
        stale.is_online = true;
        store.save(&stale).await.unwrap();

        let (mut dir, _outcomes) = ProfileDirectory::new(store);
        assert_eq!(dir.hydrate().await.unwrap(), 1);
        assert!(!dir.get(&id("Bob")).unwrap().is_online);
    }

    /// Memory store whose listing queries fail
    #[derive(Default)]
    struct UnlistableStore {
        inner: MemoryProfileStore,
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

    #[tokio::test]
    async fn test_cache_miss_after_failed_hydrate_reconciles() {
        let store = Arc::new(UnlistableStore::default());
        let matched_at = Utc::now() - chrono::Duration::days(2);
        let mut stored = ProfileRecord::placeholder(id("Bob"));
        stored.username = "bob".into();
        stored.matched_at = Some(matched_at);
        stored.approved_links.insert(SocialLink::new("web", "https://bob.example"));
        store.inner.save(&stored).await.unwrap();

        let (mut dir, mut outcomes) = ProfileDirectory::new(store.clone());
        assert!(dir.hydrate().await.is_err());

        let placeholder = dir.resolve_or_create(&id("Bob"));
        assert_eq!(placeholder.username, "Unknown User");
        dir.set_online(&id("Bob"), true);
        assert!(dir.update(&id("Bob"), |r| r.pending_link_requests.insert(id("Carol"))));

        // Only the last queued reconcile replaces the cached record
        let first = outcomes.recv().await.unwrap();
        assert!(first.resolved.is_some());
        assert_eq!(dir.on_persist_outcome(first), Ok(false));
        let second = outcomes.recv().await.unwrap();
        assert_eq!(dir.on_persist_outcome(second), Ok(true));

        let cached = dir.get(&id("Bob")).unwrap();
        assert_eq!(cached.username, "bob");
        assert_eq!(cached.matched_at, Some(matched_at));
        assert!(cached.is_online);
        assert!(cached.pending_link_requests.contains(&id("Carol")));

        let on_disk = store.inner.get(&id("Bob")).await.unwrap().unwrap();
        assert_eq!(on_disk.username, "bob");
        assert_eq!(on_disk.matched_at, Some(matched_at));
        assert_eq!(on_disk.approved_links.len(), 1);

        // Confirmed records go back to plain saves
        dir.update(&id("Bob"), |r| {
            r.bio = Some("hi".into());
            true
        });
        let third = outcomes.recv().await.unwrap();
        assert!(third.resolved.is_none());
        assert_eq!(dir.on_persist_outcome(third), Ok(false));
    }

    #[test]
    fn test_reconcile_keeps_stored_history() {
        let earlier = Utc::now() - chrono::Duration::days(5);
        let mut stored = ProfileRecord::placeholder(id("Bob"));
        stored.username = "bob".into();
        stored.matched_at = Some(earlier);
        stored.pending_link_requests.insert(id("Me"));

        let mut cached = ProfileRecord::placeholder(id("Bob"));
        cached.matched_at = Some(Utc::now());
        cached.rejected_link_requests.insert(id("Me"));
        cached.bio = Some("new bio".into());

        let merged = reconcile(stored, &cached);
        assert_eq!(merged.username, "bob");
        assert_eq!(merged.matched_at, Some(earlier));
        assert_eq!(merged.bio.as_deref(), Some("new bio"));
        assert!(merged.pending_link_requests.is_empty());
        assert!(merged.rejected_link_requests.contains(&id("Me")));
    }
}
