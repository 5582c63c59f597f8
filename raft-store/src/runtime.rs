//! Threads behind a running store node.
//!
//! - **Worker**: the only owner of the [`RaftNode`]; proposals, peer frames
//!   and ticks all funnel into it.
//! - **Listener**: accepts peer connections and spawns one reader each.
//! - **Peer writers**: one per member, reconnecting to its advertised address
//!   and dropping frames when its queue is full.
//!
//! Async callers talk to the worker through [`NodeHandle`]: requests go over a
//! crossbeam channel and answers come back on tokio oneshot channels, so the
//! worker stays single-threaded while callers never block a runtime thread.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use raft::prelude::{Message, MessageType};
use raft::{SnapshotStatus, StateRole};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::engine::{COMPACTION_INTERVAL, spawn_compaction};
use crate::error::StoreError;
use crate::fsm::StateMachine;
use crate::log_store::{DEFAULT_MAX_TXN_OPS, LogStore};
use crate::membership::ClusterState;
use crate::node::{AppliedEvent, ApplyReport, MembershipChange, RaftNode};

/// Heartbeats go out every 3 ticks and elections start after 10.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Frames queued per peer before new ones are dropped. Raft retransmits.
const PEER_QUEUE: usize = 256;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest frame a peer may send.
const MAX_FRAME: usize = 256 * 1024 * 1024;

/// Identity, address and storage of one store node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: u64,
    /// Address to bind for incoming Raft messages, advertised to peers.
    pub listen_addr: String,
    /// Directory holding `raft.redb` and `fsm.redb`.
    pub data_dir: PathBuf,
    /// Seed a single-member cluster when the data directory is empty.
    pub bootstrap: bool,
    pub max_txn_ops: usize,
    pub compaction_interval: Duration,
    /// Applied entries kept in the log before it is snapshotted and truncated.
    pub snapshot_threshold: u64,
}

impl NodeConfig {
    pub fn new(id: u64, listen_addr: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            listen_addr: listen_addr.into(),
            data_dir: data_dir.into(),
            bootstrap: false,
            max_txn_ops: DEFAULT_MAX_TXN_OPS,
            compaction_interval: COMPACTION_INTERVAL,
            snapshot_threshold: 8192,
        }
    }
}

type Responder = oneshot::Sender<Result<(), StoreError>>;

/// Requests sent from callers to the worker thread.
enum ClientRequest {
    Propose { command: Command, respond_to: Responder },
    ChangeMembership { change: MembershipChange, respond_to: Responder },
    Shutdown,
}

/// Async side of the worker.
///
/// Every clone talks to the same worker. Reads go straight
/// to the local state machine and never pass through the worker.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    request_tx: Sender<ClientRequest>,
    cluster_rx: watch::Receiver<ClusterState>,
    fsm: Arc<StateMachine>,
    worker: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fsm(&self) -> &Arc<StateMachine> {
        &self.fsm
    }

    /// The latest membership view published by the worker.
    pub fn cluster_state(&self) -> ClusterState {
        self.cluster_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClusterState> {
        self.cluster_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.cluster_rx.borrow().is_leader(self.id)
    }

    /// Proposes a command and resolves once it is applied locally.
    ///
    /// Fails with [`StoreError::NotLeader`] when this node does not lead, and
    /// with [`StoreError::Timeout`] when leadership is lost before the entry
    /// is applied.
    pub async fn propose(&self, command: Command) -> Result<(), StoreError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ClientRequest::Propose { command, respond_to })?;
        rx.await.map_err(|_| StoreError::Shutdown)?
    }

    pub async fn change_membership(&self, change: MembershipChange) -> Result<(), StoreError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(ClientRequest::ChangeMembership { change, respond_to })?;
        rx.await.map_err(|_| StoreError::Shutdown)?
    }

    /// Stops the worker and waits for it to close the storage engines.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("join shutdown task")?
            .map_err(|_| anyhow!("raft worker panicked"))
    }

    fn send(&self, request: ClientRequest) -> Result<(), StoreError> {
        self.request_tx
            .send(request)
            .map_err(|_| StoreError::Shutdown)
    }
}

/// Opens the node's storage, binds its transport and starts the worker.
///
/// # Errors
///
/// Returns error if either database cannot be opened or the listen address
/// cannot be bound.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let fsm = StateMachine::open(config.data_dir.join("fsm.redb"))?;
    let storage = LogStore::open(
        config.data_dir.join("raft.redb"),
        Arc::clone(&fsm),
        config.max_txn_ops,
    )?;
    storage.spawn_compaction(config.compaction_interval)?;
    spawn_compaction(Arc::downgrade(&fsm), config.compaction_interval, "fsm")?;

    let voters = if config.bootstrap { vec![config.id] } else { Vec::new() };
    let mut node = RaftNode::open(
        config.id,
        &config.listen_addr,
        storage,
        Arc::clone(&fsm),
        &voters,
    )?;

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind raft transport on {}", config.listen_addr))?;
    let stop = Arc::new(AtomicBool::new(false));
    let (network_tx, network_rx) = unbounded();
    spawn_listener(listener, network_tx, Arc::clone(&stop))?;

    let state = node.cluster_state();
    if config.bootstrap && state.peers.len() == 1 && state.peers[0].id == config.id {
        node.campaign()?;
    }
    let (cluster_tx, cluster_rx) = watch::channel(state);
    let (client_tx, client_rx) = unbounded();

    let id = config.id;
    let transport = Transport::new(id, config.listen_addr.clone(), stop);
    let mut worker = Worker::new(
        node,
        client_rx,
        network_rx,
        transport,
        cluster_tx,
        config.snapshot_threshold,
    );
    let handle = thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node = id, error = ?err, "raft worker crashed");
            }
            worker.stop();
        })
        .context("failed to spawn raft worker")?;

    info!(node = id, addr = %config.listen_addr, bootstrap = config.bootstrap, "raft node started");
    Ok(NodeHandle {
        id,
        request_tx: client_tx,
        cluster_rx,
        fsm,
        worker: Arc::new(Mutex::new(Some(handle))),
    })
}

/// Event loop over proposals from [`NodeHandle`], peer frames and ticks.
/// Pending proposals are answered when their entry applies, or with
/// [`StoreError::Timeout`] once leadership is lost.
struct Worker {
    node: RaftNode,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Inbound>,
    transport: Transport,
    cluster_tx: watch::Sender<ClusterState>,
    /// Proposals made by this node, keyed by the id carried in the entry context.
    pending: HashMap<u64, Responder>,
    next_request: u64,
    snapshot_threshold: u64,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Inbound>,
        transport: Transport,
        cluster_tx: watch::Sender<ClusterState>,
        snapshot_threshold: u64,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            client_rx,
            network_rx,
            transport,
            cluster_tx,
            pending: HashMap::new(),
            next_request: 0,
            snapshot_threshold,
            last_role,
        }
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    let Ok(inbound) = inbound else { break };
                    if self.node.learn_route(inbound.from, &inbound.from_addr) {
                        debug!(
                            node = self.node.id(),
                            peer = inbound.from,
                            addr = %inbound.from_addr,
                            "learned peer route"
                        );
                    }
                    self.node.step(inbound.message)?;
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.track_role();
        }
        Ok(())
    }

    /// Ids embed the node id so entries proposed elsewhere never match.
    fn next_request_id(&mut self) -> u64 {
        self.next_request += 1;
        (self.node.id() << 40) | (self.next_request & ((1 << 40) - 1))
    }

    /// Returns `false` if shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        let (respond_to, outcome) = match req {
            ClientRequest::Shutdown => return Ok(false),
            ClientRequest::Propose { command, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(StoreError::NotLeader));
                    return Ok(true);
                }
                let id = self.next_request_id();
                (respond_to, self.node.propose(id, &command).map(|()| id))
            }
            ClientRequest::ChangeMembership { change, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(StoreError::NotLeader));
                    return Ok(true);
                }
                let id = self.next_request_id();
                (respond_to, self.node.propose_membership(id, &change).map(|()| id))
            }
        };
        match outcome {
            Ok(id) => {
                self.pending.insert(id, respond_to);
            }
            Err(err) => {
                let _ = respond_to.send(Err(StoreError::Internal(err)));
            }
        }
        Ok(true)
    }

    /// Drains all ready state from Raft: sends messages first, then wakes
    /// callers whose entries were applied.
    ///
    /// The cluster view is republished before callers wake, so a caller that
    /// changed membership observes its change.
    fn process_ready(&mut self) -> Result<()> {
        let mut applied = Vec::new();
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            applied.extend(bundle.applied);
        }
        if applied.is_empty() {
            return Ok(());
        }
        self.publish_cluster();
        for report in applied {
            self.notify(report);
        }
        self.node.maybe_compact(self.snapshot_threshold)
    }

    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        let to = msg.to;
        let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;
        let Some(addr) = self.node.peer_addr(to).map(str::to_string) else {
            warn!(node = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        let queued = self.transport.send(to, &addr, &msg);
        if is_snapshot {
            let status = if queued { SnapshotStatus::Finish } else { SnapshotStatus::Failure };
            self.node.report_snapshot(to, status);
        }
        Ok(())
    }

    fn notify(&mut self, report: ApplyReport) {
        match &report.event {
            AppliedEvent::Command(command) => {
                debug!(
                    node = self.node.id(),
                    key = command.key(),
                    index = report.index,
                    term = report.term,
                    "applied"
                );
            }
            AppliedEvent::Membership(change) => {
                info!(
                    node = self.node.id(),
                    member = change.node_id,
                    kind = ?change.kind,
                    index = report.index,
                    "applied membership change"
                );
            }
        }
        if let Some(respond_to) = report.request_id.and_then(|id| self.pending.remove(&id)) {
            let _ = respond_to.send(Ok(()));
        }
    }

    /// Fails proposals orphaned by a lost leadership and republishes the view.
    fn track_role(&mut self) {
        let current = self.node.role();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                leader = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            if self.last_role == StateRole::Leader {
                for (_, respond_to) in self.pending.drain() {
                    let _ = respond_to.send(Err(StoreError::Timeout));
                }
            }
            self.last_role = current;
        }
        self.publish_cluster();
    }

    fn publish_cluster(&mut self) {
        let state = self.node.cluster_state();
        self.cluster_tx.send_if_modified(|published| {
            if *published == state {
                return false;
            }
            *published = state;
            true
        });
    }

    fn stop(&mut self) {
        for (_, respond_to) in self.pending.drain() {
            let _ = respond_to.send(Err(StoreError::Shutdown));
        }
        self.transport.stop();
        self.node.close();
        info!(node = self.node.id(), "raft worker stopped");
    }
}

/// Framed unit on the wire. The sender's address lets a node answer peers it
/// has not yet learned about through membership.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: u64,
    from_addr: String,
    message: Vec<u8>,
}

#[derive(Debug)]
struct Inbound {
    from: u64,
    from_addr: String,
    message: Message,
}

struct PeerSender {
    addr: String,
    tx: Sender<Vec<u8>>,
}

/// Outbound half of the transport: one writer thread per peer.
struct Transport {
    id: u64,
    addr: String,
    peers: HashMap<u64, PeerSender>,
    stop: Arc<AtomicBool>,
}

impl Transport {
    fn new(id: u64, addr: String, stop: Arc<AtomicBool>) -> Self {
        Self {
            id,
            addr,
            peers: HashMap::new(),
            stop,
        }
    }

    /// Queues `msg` for `to`. Returns false when the frame was dropped.
    fn send(&mut self, to: u64, addr: &str, msg: &Message) -> bool {
        let frame = match bincode::serialize(&Envelope {
            from: self.id,
            from_addr: self.addr.clone(),
            message: msg.encode_to_vec(),
        }) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = to, error = %err, "failed to encode raft message");
                return false;
            }
        };

        let stale = self.peers.get(&to).is_some_and(|peer| peer.addr != addr);
        if stale {
            self.peers.remove(&to);
        }
        if !self.peers.contains_key(&to) {
            match spawn_writer(to, addr.to_string()) {
                Ok(tx) => {
                    self.peers.insert(to, PeerSender { addr: addr.to_string(), tx });
                }
                Err(err) => {
                    warn!(peer = to, error = ?err, "failed to start peer writer");
                    return false;
                }
            }
        }
        let Some(peer) = self.peers.get(&to) else {
            return false;
        };
        match peer.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(peer = to, "peer queue full, dropping message");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.peers.remove(&to);
                false
            }
        }
    }

    /// Closes every writer and wakes the listener so it can exit.
    fn stop(&mut self) {
        self.peers.clear();
        self.stop.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(&self.addr);
    }
}

fn spawn_writer(to: u64, addr: String) -> Result<Sender<Vec<u8>>> {
    let (tx, rx) = bounded::<Vec<u8>>(PEER_QUEUE);
    thread::Builder::new()
        .name(format!("raft-peer-{to}"))
        .spawn(move || {
            let mut stream: Option<TcpStream> = None;
            for frame in rx {
                if stream.is_none() {
                    match connect(&addr) {
                        Ok(connected) => stream = Some(connected),
                        Err(err) => {
                            debug!(peer = to, %addr, error = %err, "peer unreachable");
                            continue;
                        }
                    }
                }
                let Some(conn) = stream.as_mut() else {
                    continue;
                };
                if let Err(err) = write_frame(conn, &frame) {
                    debug!(peer = to, %addr, error = %err, "peer write failed, reconnecting");
                    stream = None;
                }
            }
        })
        .context("failed to spawn peer writer")?;
    Ok(tx)
}

fn connect(addr: &str) -> io::Result<TcpStream> {
    let target: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
    let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn spawn_listener(listener: TcpListener, tx: Sender<Inbound>, stop: Arc<AtomicBool>) -> Result<()> {
    let addr = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        let spawned = thread::Builder::new()
                            .name(format!("raft-net-reader-{addr}"))
                            .spawn(move || {
                                if let Err(err) = handle_connection(stream, tx) {
                                    debug!(error = %err, "peer connection closed");
                                }
                            });
                        if let Err(err) = spawned {
                            warn!(error = %err, "failed to spawn connection reader");
                        }
                    }
                    Err(err) => warn!(error = %err, "accept error"),
                }
            }
            debug!(%addr, "raft listener stopped");
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads frames from one peer connection until it closes. A frame is a
/// big-endian u32 length followed by a bincode [`Envelope`].
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> Result<()> {
    loop {
        let Some(frame) = read_frame(&mut stream)? else {
            return Ok(());
        };
        let envelope: Envelope = bincode::deserialize(&frame).context("decode envelope")?;
        let message = Message::decode(&envelope.message[..]).context("decode raft message")?;
        tx.send(Inbound {
            from: envelope.from,
            from_addr: envelope.from_addr,
            message,
        })
        .map_err(|_| anyhow!("worker gone"))?;
    }
}

fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(anyhow!("frame of {len} bytes exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()
}
