//! The store interface shared by the replicated and in-memory stores.
//!
//! Every component that needs data or membership receives an
//! `Arc<dyn KvStore>` at construction time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::membership::{ClusterState, PeerRole, PeerState, Suffrage};

/// Key-value storage with prefix scans, per-key TTL and a membership view.
///
/// Reads are local and may lag behind writes made through other nodes.
/// Writes resolve once the mutation is durable.
#[async_trait]
pub trait KvStore: Send + Sync {
    fn node_id(&self) -> u64;

    /// Fails with [`StoreError::NotFound`] when the key is absent or expired.
    fn get(&self, key: &str) -> Result<String, StoreError>;

    fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError>;

    /// Keys under `prefix`, without fetching values.
    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Adds a voting member. A member with the same id and address is a no-op.
    async fn join(&self, node_id: u64, addr: &str) -> Result<(), StoreError>;

    /// Removes every member whose id or address matches.
    async fn remove(&self, node_id: u64, addr: &str) -> Result<(), StoreError>;

    fn cluster_state(&self) -> ClusterState;
}

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Thread-safe in-memory store for single-process use.
///
/// Membership is whatever was last configured; `join` and `remove` edit that
/// view directly.
pub struct MemoryStore {
    node_id: u64,
    data: Mutex<BTreeMap<String, Slot>>,
    cluster: Mutex<ClusterState>,
}

impl MemoryStore {
    /// A store that considers itself the only member and the leader.
    pub fn new(node_id: u64, addr: &str) -> Self {
        Self::with_cluster(
            node_id,
            ClusterState {
                leader_id: Some(node_id),
                leader_addr: Some(addr.to_string()),
                peers: vec![PeerState {
                    id: node_id,
                    addr: addr.to_string(),
                    role: PeerRole::Leader,
                    state: Suffrage::Voter,
                }],
            },
        )
    }

    pub fn with_cluster(node_id: u64, cluster: ClusterState) -> Self {
        Self {
            node_id,
            data: Mutex::new(BTreeMap::new()),
            cluster: Mutex::new(cluster),
        }
    }

    pub fn set_cluster(&self, cluster: ClusterState) {
        *self.cluster.lock() = cluster;
    }

    fn live_range(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        self.data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, slot)| slot.live(now))
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn get(&self, key: &str) -> Result<String, StoreError> {
        let data = self.data.lock();
        match data.get(key) {
            Some(slot) if slot.live(Instant::now()) => Ok(slot.value.clone()),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.live_range(prefix).into_iter().collect())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.live_range(prefix).into_iter().map(|(key, _)| key).collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::Invalid("empty key".into()));
        }
        let slot = Slot {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.data.lock().insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn join(&self, node_id: u64, addr: &str) -> Result<(), StoreError> {
        let mut cluster = self.cluster.lock();
        if cluster.contains(node_id, addr) {
            return Ok(());
        }
        cluster.peers.retain(|peer| peer.id != node_id);
        cluster.peers.push(PeerState {
            id: node_id,
            addr: addr.to_string(),
            role: PeerRole::Follower,
            state: Suffrage::Voter,
        });
        Ok(())
    }

    async fn remove(&self, node_id: u64, addr: &str) -> Result<(), StoreError> {
        let mut cluster = self.cluster.lock();
        cluster
            .peers
            .retain(|peer| peer.id != node_id && peer.addr != addr);
        if cluster.leader_id.is_some_and(|id| id == node_id) {
            cluster.leader_id = None;
            cluster.leader_addr = None;
        }
        Ok(())
    }

    fn cluster_state(&self) -> ClusterState {
        self.cluster.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_keys_disappear_from_reads_and_scans() -> anyhow::Result<()> {
        let store = MemoryStore::new(1, "127.0.0.1:9000");
        store.set("instance.info.demo.g.1.1.1.1:80", "UP", Some(Duration::from_millis(20))).await?;
        store.set("instance.info.demo.g.2.2.2.2:80", "UP", None).await?;

        assert_eq!(store.scan_keys("instance.info.demo.g.")?.len(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            store.get("instance.info.demo.g.1.1.1.1:80"),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(
            store.scan_keys("instance.info.demo.g.")?,
            vec!["instance.info.demo.g.2.2.2.2:80".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn prefix_scan_stops_at_prefix_boundary() -> anyhow::Result<()> {
        let store = MemoryStore::new(1, "127.0.0.1:9000");
        store.set("cfg.current.a.g.x.yaml", "1", None).await?;
        store.set("cfg.current.a.g.y.json", "2", None).await?;
        store.set("cfg.current.ab.g.z.yaml", "3", None).await?;
        store.set("cfg.future.a.g.x.yaml", "4", None).await?;

        let scanned = store.scan_prefix("cfg.current.a.")?;
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned["cfg.current.a.g.y.json"], "2");
        Ok(())
    }

    #[tokio::test]
    async fn membership_edits_follow_join_and_remove_rules() -> anyhow::Result<()> {
        let store = MemoryStore::new(1, "127.0.0.1:9001");
        store.join(2, "127.0.0.1:9002").await?;
        store.join(2, "127.0.0.1:9002").await?;
        assert_eq!(store.cluster_state().peers.len(), 2);

        // Removal matches on address even when the id differs.
        store.join(3, "127.0.0.1:9003").await?;
        store.remove(9, "127.0.0.1:9003").await?;
        let ids: Vec<u64> = store.cluster_state().peers.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
        Ok(())
    }
}
