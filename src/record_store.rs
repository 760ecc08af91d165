//! Keeps the local node discoverable.
//!
//! A [`RecordStoreManager`] stores the packed local [`PeerIdentity`] under a
//! well-known key and re-stores it on a timer whenever fewer than
//! `max_node_count` distinct nodes hold it, or the local node itself is not
//! among them. Newcomers read the same key to find entry points.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::identity::{NodeId, PeerIdentity};
use crate::protocols::DhtStorage;

/// Target number of distinct holders of the local record.
pub const MAX_NODE_COUNT: usize = 8;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const ENTRY_POINT_KEY_SEED: &[u8] = b"overlay-dht/entry-points";

/// Key under which every node stores its own identity.
pub fn entry_point_key() -> NodeId {
    NodeId::derive(ENTRY_POINT_KEY_SEED)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecordStoreConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub refresh_interval: Duration,
    pub max_node_count: usize,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_node_count: MAX_NODE_COUNT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreRefreshError {
    #[error("failed to fetch stored records: {0:#}")]
    Fetch(anyhow::Error),
    #[error("failed to store local record: {0:#}")]
    Store(anyhow::Error),
    #[error("failed to pack local identity: {0}")]
    Pack(#[from] bincode::Error),
}

struct Inner<S: DhtStorage> {
    storage: S,
    local: PeerIdentity,
    key: NodeId,
    config: RecordStoreConfig,
    stored: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
}

pub struct RecordStoreManager<S: DhtStorage> {
    inner: Arc<Inner<S>>,
}

impl<S: DhtStorage> Clone for RecordStoreManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DhtStorage> RecordStoreManager<S> {
    pub fn new(storage: S, local: PeerIdentity, config: RecordStoreConfig) -> Self {
        Self::with_key(storage, local, entry_point_key(), config)
    }

    pub fn with_key(storage: S, local: PeerIdentity, key: NodeId, config: RecordStoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                local,
                key,
                config,
                stored: AtomicBool::new(false),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn key(&self) -> NodeId {
        self.inner.key
    }

    /// `true` once [`Self::store_and_keep_local_node`] has been invoked.
    /// Says nothing about how many nodes currently hold the record.
    pub fn is_local_node_stored(&self) -> bool {
        self.inner.stored.load(Ordering::Acquire)
    }

    /// Store the local record now and keep it replicated until
    /// [`Self::destroy`]. Calling it again only re-stores.
    pub async fn store_and_keep_local_node(&self) {
        self.inner.stored.store(true, Ordering::Release);
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        if let Err(e) = self.store_local_record().await {
            warn!(error = %e, "initial store of local record failed, retrying on next refresh");
        }

        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.inner.config.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = manager.refresh_once().await {
                    warn!(error = %e, "local record refresh failed");
                }
            }
            trace!("record refresh task stopped");
        });
    }

    /// One refresh round. Returns `true` when the record was re-stored.
    pub async fn refresh_once(&self) -> Result<bool, StoreRefreshError> {
        let holders = self.discover_holders().await?;
        let local_present = holders.iter().any(|p| p.node_id == self.inner.local.node_id);
        if holders.len() >= self.inner.config.max_node_count && local_present {
            trace!(holders = holders.len(), "local record sufficiently replicated");
            return Ok(false);
        }
        debug!(
            holders = holders.len(),
            local_present,
            wanted = self.inner.config.max_node_count,
            "re-storing local record"
        );
        self.store_local_record().await?;
        Ok(true)
    }

    async fn store_local_record(&self) -> Result<(), StoreRefreshError> {
        let packed = self.inner.local.pack()?;
        let accepted = self
            .inner
            .storage
            .store_data_to_dht(self.inner.key, packed)
            .await
            .map_err(StoreRefreshError::Store)?;
        trace!(accepted = accepted.len(), "local record stored");
        Ok(())
    }

    /// Distinct identities currently stored under the key, deleted entries
    /// and unreadable values excluded.
    pub async fn discover_holders(&self) -> Result<Vec<PeerIdentity>, StoreRefreshError> {
        let entries = self
            .inner
            .storage
            .fetch_data_from_dht(self.inner.key)
            .await
            .map_err(StoreRefreshError::Fetch)?;

        let mut seen = HashSet::new();
        let mut holders = Vec::new();
        for entry in entries.into_iter().filter(|e| !e.deleted) {
            match PeerIdentity::unpack(&entry.value) {
                Ok(identity) => {
                    if seen.insert(identity.node_id) {
                        holders.push(identity);
                    }
                }
                Err(e) => trace!(
                    creator = ?hex::encode(&entry.creator.as_bytes()[..8]),
                    error = %e,
                    "skipping unreadable record"
                ),
            }
        }
        Ok(holders)
    }

    /// Stop refreshing and delete the local record. Never waits for the
    /// deletion to reach the network.
    pub async fn destroy(&self) {
        self.withdraw(false).await
    }

    /// Like [`Self::destroy`], but returns only once the deletion has been
    /// sent to the closest nodes.
    pub async fn destroy_and_wait(&self) {
        self.withdraw(true).await
    }

    async fn withdraw(&self, wait_for_completion: bool) {
        self.inner.shutdown.cancel();
        if !self.is_local_node_stored() {
            return;
        }
        if let Err(e) = self
            .inner
            .storage
            .delete_data_from_dht(self.inner.key, wait_for_completion)
            .await
        {
            debug!(error = %e, "failed to delete local record");
            return;
        }
        info!(
            node = ?hex::encode(&self.inner.local.node_id.as_bytes()[..8]),
            "local record withdrawn"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredRecordEntry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Shared in-memory view of the overlay: every node's entry under every key.
    #[derive(Clone, Default)]
    struct FakeDht {
        records: Arc<Mutex<HashMap<NodeId, HashMap<NodeId, StoredRecordEntry>>>>,
        stores: Arc<Mutex<usize>>,
        deletes: Arc<Mutex<Vec<NodeId>>>,
        fail_fetch: Arc<AtomicBool>,
    }

    /// One node's handle onto the fake overlay.
    #[derive(Clone)]
    struct FakeStorage {
        dht: FakeDht,
        local: NodeId,
    }

    #[async_trait]
    impl DhtStorage for FakeStorage {
        async fn fetch_data_from_dht(&self, key: NodeId) -> anyhow::Result<Vec<StoredRecordEntry>> {
            if self.dht.fail_fetch.load(Ordering::Acquire) {
                anyhow::bail!("fetch failed");
            }
            let records = self.dht.records.lock().await;
            Ok(records.get(&key).map(|m| m.values().cloned().collect()).unwrap_or_default())
        }

        async fn store_data_to_dht(&self, key: NodeId, value: Vec<u8>) -> anyhow::Result<Vec<PeerIdentity>> {
            *self.dht.stores.lock().await += 1;
            let entry = StoredRecordEntry::new(key, value, self.local, Duration::from_secs(600));
            self.dht.records.lock().await.entry(key).or_default().insert(self.local, entry);
            Ok(vec![PeerIdentity::bare(self.local)])
        }

        async fn delete_data_from_dht(&self, key: NodeId, _wait: bool) -> anyhow::Result<()> {
            self.dht.deletes.lock().await.push(self.local);
            if let Some(entry) = self.dht.records.lock().await.get_mut(&key).and_then(|m| m.get_mut(&self.local)) {
                entry.deleted = true;
            }
            Ok(())
        }
    }

    fn manager(dht: &FakeDht, config: RecordStoreConfig) -> RecordStoreManager<FakeStorage> {
        let local = PeerIdentity::bare(NodeId::random());
        let storage = FakeStorage {
            dht: dht.clone(),
            local: local.node_id,
        };
        RecordStoreManager::new(storage, local, config)
    }

    fn fast_config() -> RecordStoreConfig {
        RecordStoreConfig {
            refresh_interval: Duration::from_secs(1),
            max_node_count: MAX_NODE_COUNT,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn holders_converge_to_max_node_count() {
        let dht = FakeDht::default();
        let managers: Vec<_> = (0..10).map(|_| manager(&dht, fast_config())).collect();
        for m in &managers {
            m.store_and_keep_local_node().await;
            assert!(m.is_local_node_stored());
        }

        tokio::time::sleep(Duration::from_secs(3)).await;

        let holders = managers[0].discover_holders().await.unwrap();
        assert!(holders.len() >= MAX_NODE_COUNT);
        for m in &managers {
            assert!(holders.iter().any(|p| p.node_id == m.inner.local.node_id));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_holder_set_is_left_alone_until_a_holder_drops() {
        let dht = FakeDht::default();
        let managers: Vec<_> = (0..MAX_NODE_COUNT).map(|_| manager(&dht, fast_config())).collect();
        for m in &managers {
            m.store_and_keep_local_node().await;
        }
        let published = *dht.stores.lock().await;
        assert_eq!(published, MAX_NODE_COUNT);

        // every holder sees the full set on each tick
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(*dht.stores.lock().await, published);

        let gone = managers[3].inner.local.node_id;
        dht.records.lock().await.get_mut(&managers[3].key()).unwrap().remove(&gone);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let restored = *dht.stores.lock().await;
        assert!(restored > published);
        assert!(restored <= published + MAX_NODE_COUNT);
        let holders = managers[0].discover_holders().await.unwrap();
        assert_eq!(holders.len(), MAX_NODE_COUNT);
        assert!(holders.iter().any(|p| p.node_id == gone));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*dht.stores.lock().await, restored);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_record_is_restored_on_next_tick() {
        let dht = FakeDht::default();
        let m = manager(&dht, fast_config());
        m.store_and_keep_local_node().await;

        dht.records.lock().await.clear();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let holders = m.discover_holders().await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].node_id, m.inner.local.node_id);
    }

    #[tokio::test]
    async fn refresh_skips_store_when_replicated() {
        let dht = FakeDht::default();
        let config = RecordStoreConfig {
            max_node_count: 2,
            ..fast_config()
        };
        let a = manager(&dht, config.clone());
        let b = manager(&dht, config);
        a.store_and_keep_local_node().await;
        b.store_and_keep_local_node().await;

        let before = *dht.stores.lock().await;
        assert!(!a.refresh_once().await.unwrap());
        assert_eq!(*dht.stores.lock().await, before);
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_as_refresh_error() {
        let dht = FakeDht::default();
        let m = manager(&dht, fast_config());
        dht.fail_fetch.store(true, Ordering::Release);
        assert!(matches!(m.refresh_once().await, Err(StoreRefreshError::Fetch(_))));
    }

    #[tokio::test]
    async fn deleted_and_garbage_entries_are_not_holders() {
        let dht = FakeDht::default();
        let a = manager(&dht, fast_config());
        let b = manager(&dht, fast_config());
        a.store_and_keep_local_node().await;
        b.store_and_keep_local_node().await;

        let garbage_creator = NodeId::random();
        dht.records.lock().await.entry(a.key()).or_default().insert(
            garbage_creator,
            StoredRecordEntry::new(a.key(), vec![0xff; 3], garbage_creator, Duration::from_secs(60)),
        );
        b.destroy().await;

        let holders = a.discover_holders().await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].node_id, a.inner.local.node_id);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_refreshing() {
        let dht = FakeDht::default();
        let m = manager(&dht, fast_config());
        m.store_and_keep_local_node().await;
        m.destroy().await;
        assert_eq!(dht.deletes.lock().await.len(), 1);

        let stores = *dht.stores.lock().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*dht.stores.lock().await, stores);
    }

    #[tokio::test]
    async fn destroy_without_store_deletes_nothing() {
        let dht = FakeDht::default();
        let m = manager(&dht, fast_config());
        m.destroy().await;
        assert!(dht.deletes.lock().await.is_empty());
        assert!(!m.is_local_node_stored());
    }
}
