//! The consensus-backed store.
//!
//! Reads come from the local state machine. Writes are proposed when this
//! node leads and forwarded to the leader's HTTP API otherwise.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::Command;
use crate::engine::COMPACTION_INTERVAL;
use crate::error::StoreError;
use crate::forward::{ClusterCommand, ClusterOp, Forwarder, WriteOp, WriteRequest, inner_token};
use crate::log_store::DEFAULT_MAX_TXN_OPS;
use crate::membership::ClusterState;
use crate::node::{ChangeKind, MembershipChange};
use crate::runtime::{NodeConfig, NodeHandle, spawn_node};
use crate::store::KvStore;
use crate::now_ms;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub node_id: u64,
    /// Raft transport address. The HTTP API listens
    /// [`crate::membership::RAFT_PORT_OFFSET`] ports below it.
    pub raft_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    /// Shared cluster secret the internal token is derived from.
    pub secret: String,
    /// Longest a leader write waits to be applied.
    pub apply_timeout: Duration,
    pub forward_timeout: Duration,
    pub max_txn_ops: usize,
    pub compaction_interval: Duration,
    pub snapshot_threshold: u64,
}

impl StoreConfig {
    pub fn new(node_id: u64, raft_addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            raft_addr: raft_addr.into(),
            data_dir: data_dir.into(),
            bootstrap: false,
            secret: String::new(),
            apply_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(10),
            max_txn_ops: DEFAULT_MAX_TXN_OPS,
            compaction_interval: COMPACTION_INTERVAL,
            snapshot_threshold: 8192,
        }
    }
}

pub struct RaftStore {
    node: NodeHandle,
    forwarder: Forwarder,
    apply_timeout: Duration,
}

impl RaftStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let forwarder = Forwarder::new(inner_token(&config.secret), config.forward_timeout)?;
        let node = spawn_node(NodeConfig {
            id: config.node_id,
            listen_addr: config.raft_addr.clone(),
            data_dir: config.data_dir.clone(),
            bootstrap: config.bootstrap,
            max_txn_ops: config.max_txn_ops,
            compaction_interval: config.compaction_interval,
            snapshot_threshold: config.snapshot_threshold,
        })?;
        Ok(Self {
            node,
            forwarder,
            apply_timeout: config.apply_timeout,
        })
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.node
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Token peers must present on internal endpoints.
    pub fn inner_token(&self) -> &str {
        self.forwarder.token()
    }

    /// Applies a write locally when leading, else replays it on the leader.
    pub async fn write(&self, request: WriteRequest) -> Result<(), StoreError> {
        if request.key.is_empty() {
            return Err(StoreError::Invalid("empty key".into()));
        }
        if self.node.is_leader() {
            let command = match request.cmd {
                WriteOp::Set => Command::Set {
                    key: request.key.clone(),
                    value: request.value.clone(),
                },
                WriteOp::Setex => Command::SetWithTtl {
                    key: request.key.clone(),
                    value: request.value.clone(),
                    expires_at_ms: now_ms().saturating_add(request.exp),
                },
                WriteOp::Del => Command::Delete {
                    key: request.key.clone(),
                },
            };
            match self.propose(command).await {
                Err(StoreError::NotLeader) => {}
                outcome => return outcome,
            }
        }
        let leader = self.remote_leader()?;
        debug!(key = %request.key, leader = %leader, "forwarding write to leader");
        self.forwarder.write(&leader, &request).await
    }

    /// Applies a membership command locally when leading, else on the leader.
    pub async fn change_membership(&self, command: ClusterCommand) -> Result<(), StoreError> {
        let state = self.node.cluster_state();
        if command.cmd == ClusterOp::Join && state.contains(command.node_id, &command.addr) {
            return Ok(());
        }
        if self.node.is_leader() {
            let changes: Vec<MembershipChange> = match command.cmd {
                ClusterOp::Join => vec![MembershipChange {
                    kind: ChangeKind::Add,
                    node_id: command.node_id,
                    addr: command.addr.clone(),
                }],
                ClusterOp::Remove => state
                    .matching(command.node_id, &command.addr)
                    .into_iter()
                    .map(|node_id| MembershipChange {
                        kind: ChangeKind::Remove,
                        node_id,
                        addr: String::new(),
                    })
                    .collect(),
            };
            let mut forwarded = false;
            for change in changes {
                info!(
                    node = self.node.id(),
                    member = change.node_id,
                    kind = ?change.kind,
                    "changing membership"
                );
                match self.timed(self.node.change_membership(change)).await {
                    Err(StoreError::NotLeader) => {
                        forwarded = true;
                        break;
                    }
                    outcome => outcome?,
                }
            }
            if !forwarded {
                return Ok(());
            }
        }
        let leader = self.remote_leader()?;
        self.forwarder.cluster(&leader, &command).await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.node.shutdown().await
    }

    async fn propose(&self, command: Command) -> Result<(), StoreError> {
        self.timed(self.node.propose(command)).await
    }

    async fn timed(
        &self,
        call: impl std::future::Future<Output = Result<(), StoreError>>,
    ) -> Result<(), StoreError> {
        tokio::time::timeout(self.apply_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// The leader's raft address, when the leader is some other node.
    fn remote_leader(&self) -> Result<String, StoreError> {
        let state = self.node.cluster_state();
        match state.leader() {
            Some(leader) if leader.id != self.node.id() && !leader.addr.is_empty() => {
                Ok(leader.addr.clone())
            }
            _ => Err(StoreError::NoLeader),
        }
    }
}

#[async_trait]
impl KvStore for RaftStore {
    fn node_id(&self) -> u64 {
        self.node.id()
    }

    fn get(&self, key: &str) -> Result<String, StoreError> {
        self.node
            .fsm()
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.node.fsm().scan_prefix(prefix)?)
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.node.fsm().scan_keys(prefix)?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.write(WriteRequest::set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.write(WriteRequest::delete(key)).await
    }

    async fn join(&self, node_id: u64, addr: &str) -> Result<(), StoreError> {
        self.change_membership(ClusterCommand {
            cmd: ClusterOp::Join,
            node_id,
            addr: addr.to_string(),
        })
        .await
    }

    async fn remove(&self, node_id: u64, addr: &str) -> Result<(), StoreError> {
        self.change_membership(ClusterCommand {
            cmd: ClusterOp::Remove,
            node_id,
            addr: addr.to_string(),
        })
        .await
    }

    fn cluster_state(&self) -> ClusterState {
        self.node.cluster_state()
    }
}
