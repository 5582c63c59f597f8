//! Core Raft node.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` over the durable [`LogStore`] and
//! applies committed entries to the [`StateMachine`]. It is driven by a single
//! thread: callers tick it, step peer messages into it and drain
//! [`RaftNode::poll_ready`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::{SnapshotStatus, StateRole};
use slog::{Logger, o};
use tracing::{debug, info};

use crate::command::Command;
use crate::fsm::StateMachine;
use crate::log_store::{LogStore, SnapshotPayload};
use crate::membership::{ClusterState, PeerRole, PeerState, Suffrage};

/// raft-rs insists on a slog root. Role and membership changes are reported
/// through `tracing` by the node and the worker.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn request_id(context: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = context.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
}

/// A membership change, either requested or applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub kind: ChangeKind,
    pub node_id: u64,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedEvent {
    Command(Command),
    Membership(MembershipChange),
}

/// Records an entry applied to the state machine.
///
/// `request_id` is the proposal context set by [`RaftNode::propose`] on the
/// node that proposed the entry; the worker uses it to wake the caller.
#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub request_id: Option<u64>,
    pub event: AppliedEvent,
}

/// Output from processing a Raft ready state: messages to send and entries
/// that were applied locally.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

pub struct RaftNode {
    id: u64,
    addr: String,
    raw: RawNode<LogStore>,
    storage: LogStore,
    fsm: Arc<StateMachine>,
    conf_state: ConfState,
    peers: BTreeMap<u64, String>,
    applied: u64,
}

impl RaftNode {
    /// Opens a node over existing storage.
    ///
    /// When the storage has never been written and `initial_voters` is not
    /// empty, the log is seeded with that configuration. A node opened with
    /// no voters on fresh storage waits to be added by an existing leader.
    ///
    /// With the worker's 100ms tick, `election_tick = 10` and
    /// `heartbeat_tick = 3` give a one second election timeout and leader
    /// heartbeats every 300ms.
    pub fn open(
        id: u64,
        addr: &str,
        storage: LogStore,
        fsm: Arc<StateMachine>,
        initial_voters: &[u64],
    ) -> Result<Self> {
        if !initial_voters.is_empty() && storage.is_fresh()? {
            info!(node = id, voters = ?initial_voters, "bootstrapping new cluster");
            storage.initialize(ConfState::from((initial_voters.to_vec(), vec![])))?;
        }

        let mut peers = storage.peers()?;
        peers.insert(id, addr.to_string());
        storage.set_peers(&peers)?;

        let applied = fsm.applied_index()?;
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            applied,
            pre_vote: true,
            ..Default::default()
        };
        let conf_state = storage.conf_state()?;
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            addr: addr.to_string(),
            raw,
            storage,
            fsm,
            conf_state,
            peers,
            applied,
        })
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Zero while no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn peer_addr(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn fsm(&self) -> &Arc<StateMachine> {
        &self.fsm
    }

    /// Appends a command to the local log. The entry context carries
    /// `request_id` so the apply report can be matched to the caller.
    pub fn propose(&mut self, request_id: u64, command: &Command) -> Result<()> {
        let data = command.encode().context("encode command failed")?;
        self.raw
            .propose(request_id.to_be_bytes().to_vec(), data)
            .context("propose failed")
    }

    /// Proposes a single-step membership change. The member's address travels
    /// in the change context and is recorded when the change is applied.
    pub fn propose_membership(&mut self, request_id: u64, change: &MembershipChange) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(match change.kind {
            ChangeKind::Add => ConfChangeType::AddNode,
            ChangeKind::Remove => ConfChangeType::RemoveNode,
        });
        cc.node_id = change.node_id;
        cc.context = change.addr.clone().into_bytes().into();
        self.raw
            .propose_conf_change(request_id.to_be_bytes().to_vec(), cc)
            .context("propose membership change failed")
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    pub fn report_snapshot(&mut self, to: u64, status: SnapshotStatus) {
        self.raw.report_snapshot(to, status);
    }

    /// Remembers a peer address learned from the transport without touching
    /// the persisted membership.
    pub fn learn_route(&mut self, id: u64, addr: &str) -> bool {
        if id == self.id || self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(id, addr.to_string());
        true
    }

    /// Drains one ready round into the redb log and the state machine.
    ///
    /// An incoming snapshot is installed before new entries are appended and
    /// the hard state is saved. Committed commands and conf changes from both
    /// the ready and the light ready are applied in index order, and the
    /// messages of both are returned for the transport to send.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot())?;
        }

        if !ready.entries().is_empty() {
            self.storage
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage
                .set_hard_state(hard_state)
                .context("persist hard state failed")?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit).context("persist commit failed")?;
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let payload = SnapshotPayload::decode(&snapshot.data)?;
        self.fsm
            .restore(&mut payload.data.as_slice(), meta.index)
            .context("restore state machine from snapshot")?;
        self.storage.apply_snapshot(snapshot)?;

        self.conf_state = meta.get_conf_state().clone();
        self.peers = payload.peers;
        self.peers.insert(self.id, self.addr.clone());
        self.storage.set_peers(&self.peers)?;
        self.applied = meta.index;
        info!(node = self.id, index = meta.index, term = meta.term, "installed snapshot");
        Ok(())
    }

    /// Applies committed entries in order.
    ///
    /// A committed entry that cannot be decoded is fatal: replicas must agree
    /// on every applied command, so the error stops this node.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        for entry in entries {
            let request_id = request_id(&entry.context);
            let event = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => {
                    self.fsm.mark_applied(entry.index)?;
                    self.applied = entry.index;
                    continue;
                }
                EntryType::EntryNormal => {
                    let command = Command::decode(&entry.data).with_context(|| {
                        format!("undecodable command at index {}", entry.index)
                    })?;
                    self.fsm.apply(entry.index, &command)?;
                    AppliedEvent::Command(command)
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..]).with_context(|| {
                        format!("undecodable membership change at index {}", entry.index)
                    })?;
                    let change = self.apply_conf_change(&cc)?;
                    self.fsm.mark_applied(entry.index)?;
                    AppliedEvent::Membership(change)
                }
                EntryType::EntryConfChangeV2 => {
                    bail!("joint membership change at index {} is not supported", entry.index)
                }
            };
            self.applied = entry.index;
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                request_id,
                event,
            });
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<MembershipChange> {
        let conf_state = self
            .raw
            .apply_conf_change(cc)
            .context("apply membership change failed")?;
        self.storage.set_conf_state(&conf_state)?;
        self.conf_state = conf_state;

        let addr = String::from_utf8(cc.context.to_vec()).unwrap_or_default();
        let kind = match cc.change_type() {
            ConfChangeType::RemoveNode => {
                if cc.node_id != self.id {
                    self.peers.remove(&cc.node_id);
                }
                ChangeKind::Remove
            }
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !addr.is_empty() {
                    self.peers.insert(cc.node_id, addr.clone());
                }
                ChangeKind::Add
            }
        };
        self.storage.set_peers(&self.peers)?;
        info!(node = self.id, member = cc.node_id, ?kind, %addr, "membership changed");
        Ok(MembershipChange {
            kind,
            node_id: cc.node_id,
            addr,
        })
    }

    /// Snapshots and truncates the log once `threshold` applied entries have
    /// accumulated in it.
    pub fn maybe_compact(&mut self, threshold: u64) -> Result<()> {
        let Some(first) = self.storage.first_log_index()? else {
            return Ok(());
        };
        if self.applied < first || self.applied - first < threshold {
            return Ok(());
        }
        let index = self.storage.compact()?;
        debug!(node = self.id, index, "log compacted");
        Ok(())
    }

    /// The membership view: configured members, their addresses and who leads.
    pub fn cluster_state(&self) -> ClusterState {
        let leader = self.leader_id();
        let leader_id = (leader != raft::INVALID_ID).then_some(leader);
        let member = |id: u64, state: Suffrage| PeerState {
            id,
            addr: self.peers.get(&id).cloned().unwrap_or_default(),
            role: if Some(id) == leader_id {
                PeerRole::Leader
            } else {
                PeerRole::Follower
            },
            state,
        };
        let mut peers: Vec<PeerState> = self
            .conf_state
            .voters
            .iter()
            .map(|&id| member(id, Suffrage::Voter))
            .collect();
        peers.extend(
            self.conf_state
                .learners
                .iter()
                .map(|&id| member(id, Suffrage::Nonvoter)),
        );
        ClusterState {
            leader_id,
            leader_addr: leader_id.and_then(|id| self.peers.get(&id).cloned()),
            peers,
        }
    }

    /// Closes both engines; the node must not be used afterwards.
    pub fn close(&self) {
        self.storage.close();
        self.fsm.engine().close();
    }
}
