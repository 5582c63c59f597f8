//! Raft-replicated key-value store.
//!
//! Every node keeps two embedded redb databases: the raft log (entries plus
//! the stable hard state) and the application data the state machine mutates.
//! Writes go through consensus; reads are served from the local state machine.
//!
//! # Architecture
//!
//! - **Worker thread**: owns the [`node::RaftNode`], drives ticks, proposals and
//!   ready processing. It is the only place state is mutated.
//! - **Transport threads**: one listener plus one reader per inbound peer
//!   connection, and one writer per outbound peer.
//! - **Async callers**: [`replicated::RaftStore`] sends requests to the worker
//!   over a crossbeam channel and awaits the answer on a tokio oneshot.
//!   Non-leader writes are forwarded over HTTP to the leader.
//!
//! # Modules
//!
//! - [`engine`]: redb wrapper shared by the log and the state machine
//! - [`log_store`]: `raft::Storage` implementation over the engine
//! - [`fsm`]: applies committed commands, produces and restores snapshots
//! - [`node`]: wraps tikv/raft's `RawNode`
//! - [`runtime`]: worker loop, peer transport, node handle
//! - [`replicated`]: the consensus-backed [`store::KvStore`]
//! - [`store`]: the store interface and an in-memory implementation
//! - [`forward`]: leader forwarding wire contract and client
//! - [`membership`]: cluster view and address translation
//! - [`command`]: commands replicated through the raft log

pub mod command;
pub mod engine;
pub mod error;
pub mod forward;
pub mod fsm;
pub mod log_store;
pub mod membership;
pub mod node;
pub mod replicated;
pub mod runtime;
pub mod store;

pub use error::StoreError;
pub use membership::{ClusterState, PeerRole, PeerState, Suffrage};
pub use replicated::{RaftStore, StoreConfig};
pub use store::{KvStore, MemoryStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, the clock TTL expiries are measured against.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
