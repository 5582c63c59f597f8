//! Delivery of released changes to subscribers, locally and on every peer.
//!
//! The releasing node pushes the diff to its own subscribers and posts it to
//! every other member, which repeats the local step only. Each subscriber and
//! each peer is served by its own task, and every wait in those tasks ends
//! early once the shutdown signal fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft_store::forward::Forwarder;
use raft_store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ClientHandle, ConnectionRegistry};
use crate::diff::NamespaceDiff;
use crate::instance::InstanceService;
use crate::keys::NamespaceId;
use crate::message::{EventKind, encode_event};

pub const LISTEN_PATH: &str = "/api/cfg/listen";

#[derive(Debug, Clone, Copy)]
pub struct PropagationSettings {
    /// How long a subscriber without a live connection is waited for.
    pub reconnect_wait: Duration,
    pub reconnect_poll: Duration,
    pub peer_retries: u32,
    /// Retry `n` sleeps `n * peer_backoff`.
    pub peer_backoff: Duration,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            reconnect_wait: Duration::from_secs(30),
            reconnect_poll: Duration::from_secs(1),
            peer_retries: 20,
            peer_backoff: Duration::from_secs(1),
        }
    }
}

/// A released diff as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChange {
    pub app_id: String,
    pub group: String,
    pub diff: NamespaceDiff,
}

#[async_trait]
pub trait PeerNotifier: Send + Sync {
    /// Hands `change` to the member whose raft address is `peer_addr`.
    async fn push(&self, peer_addr: &str, change: &ConfigChange) -> Result<(), StoreError>;
}

/// Posts changes to the peers' internal listen endpoint.
pub struct HttpPeers {
    forwarder: Forwarder,
}

impl HttpPeers {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl PeerNotifier for HttpPeers {
    async fn push(&self, peer_addr: &str, change: &ConfigChange) -> Result<(), StoreError> {
        self.forwarder.post(peer_addr, LISTEN_PATH, change).await
    }
}

#[derive(Clone)]
pub struct Propagator {
    store: Arc<dyn KvStore>,
    instances: Arc<InstanceService>,
    registry: Arc<ConnectionRegistry>,
    peers: Arc<dyn PeerNotifier>,
    settings: PropagationSettings,
    shutdown: watch::Receiver<bool>,
}

impl Propagator {
    pub fn new(
        store: Arc<dyn KvStore>,
        instances: Arc<InstanceService>,
        registry: Arc<ConnectionRegistry>,
        peers: Arc<dyn PeerNotifier>,
        settings: PropagationSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            instances,
            registry,
            peers,
            settings,
            shutdown,
        }
    }

    /// Fans a released change out to local subscribers and to every other
    /// member. Returns the spawned delivery tasks without waiting on them.
    pub fn on_release(&self, change: ConfigChange) -> Vec<JoinHandle<()>> {
        let mut tasks = self.accept_change(&change);

        let state = self.store.cluster_state();
        let change = Arc::new(change);
        for peer in state.others(self.store.node_id()) {
            let peers = self.peers.clone();
            let addr = peer.addr.clone();
            let change = change.clone();
            let settings = self.settings;
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                push_with_retry(peers, addr, change, settings, shutdown).await;
            }));
        }
        tasks
    }

    /// Delivers a change to the subscribers connected to this node only.
    pub fn accept_change(&self, change: &ConfigChange) -> Vec<JoinHandle<()>> {
        let id = NamespaceId {
            app_id: change.app_id.clone(),
            group: change.group.clone(),
            namespace: change.diff.namespace.clone(),
        };
        let frames: Vec<String> = change
            .diff
            .events()
            .iter()
            .filter_map(|event| match encode_event(EventKind::Config, event) {
                Ok(frame) => Some(frame),
                Err(err) => {
                    error!(namespace = %id, error = %err, "failed to encode change event");
                    None
                }
            })
            .collect();
        if frames.is_empty() {
            return Vec::new();
        }
        let subscribers = match self.instances.subscribers(&id) {
            Ok(subscribers) => subscribers,
            Err(err) => {
                error!(namespace = %id, error = %err, "failed to list subscribers");
                return Vec::new();
            }
        };
        info!(
            namespace = %id,
            subscribers = subscribers.len(),
            events = frames.len(),
            "pushing change"
        );

        let frames = Arc::new(frames);
        subscribers
            .into_iter()
            .map(|subscriber| {
                let registry = self.registry.clone();
                let key = subscriber.connection_key();
                let frames = frames.clone();
                let settings = self.settings;
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    deliver(registry, key, frames, settings, shutdown).await;
                })
            })
            .collect()
    }
}

async fn deliver(
    registry: Arc<ConnectionRegistry>,
    key: String,
    frames: Arc<Vec<String>>,
    settings: PropagationSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(handle) = wait_for_connection(&registry, &key, settings, &mut shutdown).await else {
        warn!(%key, "subscriber not connected, change not delivered");
        return;
    };
    for frame in frames.iter() {
        if !handle.send(frame.clone()) {
            warn!(%key, "subscriber went away during delivery");
            return;
        }
    }
    debug!(%key, events = frames.len(), "change delivered");
}

/// Polls the registry for a connection under `key` until the reconnect wait
/// runs out.
async fn wait_for_connection(
    registry: &ConnectionRegistry,
    key: &str,
    settings: PropagationSettings,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<ClientHandle> {
    if let Some(handle) = registry.lookup(key) {
        return Some(handle);
    }
    let poll = settings.reconnect_poll.max(Duration::from_millis(1));
    let polls = (settings.reconnect_wait.as_millis() / poll.as_millis()).max(1);
    for _ in 0..polls {
        if !pause(poll, shutdown).await {
            return None;
        }
        if let Some(handle) = registry.lookup(key) {
            return Some(handle);
        }
    }
    None
}

async fn push_with_retry(
    peers: Arc<dyn PeerNotifier>,
    addr: String,
    change: Arc<ConfigChange>,
    settings: PropagationSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    for attempt in 0..=settings.peer_retries {
        if attempt > 0 && !pause(settings.peer_backoff * attempt, &mut shutdown).await {
            debug!(peer = %addr, "change push cancelled");
            return;
        }
        match peers.push(&addr, &change).await {
            Ok(()) => {
                debug!(peer = %addr, attempt, "change pushed to peer");
                return;
            }
            Err(err) => warn!(peer = %addr, attempt, error = %err, "change push failed"),
        }
    }
    error!(peer = %addr, namespace = %change.diff.namespace, "giving up pushing change");
}

/// Sleeps for `duration`; false when shutdown fired first.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        Ok(_) = shutdown.wait_for(|stop| *stop) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;
    use raft_store::{ClusterState, MemoryStore, PeerRole, PeerState, Suffrage};

    use super::*;
    use crate::diff::diff;
    use crate::message::decode_event;

    /// Records pushes and fails the first `failures` attempts per peer.
    #[derive(Default)]
    struct FakePeers {
        failures: u32,
        attempts: Mutex<BTreeMap<String, u32>>,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerNotifier for FakePeers {
        async fn push(&self, peer_addr: &str, _change: &ConfigChange) -> Result<(), StoreError> {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(peer_addr.to_string()).or_default();
            *count += 1;
            if *count <= self.failures {
                return Err(StoreError::remote("unreachable", "connection refused"));
            }
            self.delivered.lock().push(peer_addr.to_string());
            Ok(())
        }
    }

    fn three_members() -> ClusterState {
        let peer = |id: u64| PeerState {
            id,
            addr: format!("127.0.0.1:900{id}"),
            role: if id == 1 { PeerRole::Leader } else { PeerRole::Follower },
            state: Suffrage::Voter,
        };
        ClusterState {
            leader_id: Some(1),
            leader_addr: Some("127.0.0.1:9001".into()),
            peers: vec![peer(1), peer(2), peer(3)],
        }
    }

    fn fast() -> PropagationSettings {
        PropagationSettings {
            reconnect_wait: Duration::from_millis(500),
            reconnect_poll: Duration::from_millis(10),
            peer_retries: 3,
            peer_backoff: Duration::from_millis(5),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        peers: Arc<FakePeers>,
        propagator: Propagator,
        shutdown: watch::Sender<bool>,
    }

    fn fixture(failures: u32, settings: PropagationSettings) -> Fixture {
        let store = Arc::new(MemoryStore::with_cluster(1, three_members()));
        let registry = Arc::new(ConnectionRegistry::new());
        let peers = Arc::new(FakePeers {
            failures,
            ..FakePeers::default()
        });
        let (shutdown, stop) = watch::channel(false);
        let propagator = Propagator::new(
            store.clone(),
            Arc::new(InstanceService::new(store.clone())),
            registry.clone(),
            peers.clone(),
            settings,
            stop,
        );
        Fixture {
            store,
            registry,
            peers,
            propagator,
            shutdown,
        }
    }

    fn change() -> anyhow::Result<ConfigChange> {
        Ok(ConfigChange {
            app_id: "demo".into(),
            group: "group".into(),
            diff: diff("app.props", "", "a=1\nb=2")?,
        })
    }

    async fn join_all(tasks: Vec<JoinHandle<()>>) -> anyhow::Result<()> {
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(5), task).await??;
        }
        Ok(())
    }

    #[tokio::test]
    async fn release_reaches_local_subscribers_and_other_members() -> anyhow::Result<()> {
        let fx = fixture(0, fast());
        fx.store
            .set("ns.demo.group.app.props.10.0.0.5:8080", "demo", None)
            .await?;
        let (handle, mut channels) = fx.registry.open("demo:10.0.0.5:8080", 16);
        fx.registry.register(handle);

        join_all(fx.propagator.on_release(change()?)).await?;

        let mut kinds = Vec::new();
        while let Ok(frame) = channels.outbound.try_recv() {
            let (kind, json) = decode_event(&frame).ok_or_else(|| anyhow::anyhow!("bad frame"))?;
            assert_eq!(kind, EventKind::Config);
            let event: crate::message::ChangeEvent = serde_json::from_str(json)?;
            kinds.push((event.key, event.kind));
        }
        assert_eq!(kinds.len(), 2);
        assert!(kinds.iter().all(|(_, kind)| *kind == crate::message::ChangeType::Add));

        let mut delivered = fx.peers.delivered.lock().clone();
        delivered.sort();
        assert_eq!(delivered, vec!["127.0.0.1:9002", "127.0.0.1:9003"]);
        Ok(())
    }

    #[tokio::test]
    async fn peer_failures_are_retried_independently() -> anyhow::Result<()> {
        let fx = fixture(2, fast());
        join_all(fx.propagator.on_release(change()?)).await?;

        let attempts = fx.peers.attempts.lock().clone();
        assert_eq!(attempts["127.0.0.1:9002"], 3);
        assert_eq!(attempts["127.0.0.1:9003"], 3);
        assert_eq!(fx.peers.delivered.lock().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn delivery_waits_for_a_reconnecting_subscriber() -> anyhow::Result<()> {
        let fx = fixture(0, fast());
        fx.store
            .set("ns.demo.group.app.props.10.0.0.5:8080", "demo", None)
            .await?;
        let tasks = fx.propagator.accept_change(&change()?);
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (handle, mut channels) = fx.registry.open("demo:10.0.0.5:8080", 16);
        fx.registry.register(handle);
        join_all(tasks).await?;

        assert!(channels.outbound.try_recv().is_ok());
        assert!(channels.outbound.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_retries_and_waits() -> anyhow::Result<()> {
        let slow = PropagationSettings {
            reconnect_wait: Duration::from_secs(60),
            reconnect_poll: Duration::from_secs(1),
            peer_retries: 20,
            peer_backoff: Duration::from_secs(1),
        };
        let fx = fixture(u32::MAX, slow);
        fx.store
            .set("ns.demo.group.app.props.10.0.0.5:8080", "demo", None)
            .await?;
        let tasks = fx.propagator.on_release(change()?);
        assert_eq!(tasks.len(), 3);

        fx.shutdown.send_replace(true);
        join_all(tasks).await?;
        assert!(fx.peers.delivered.lock().is_empty());
        Ok(())
    }
}
