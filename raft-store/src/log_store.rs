//! Durable raft log and stable store.
//!
//! Entries live in the `logs` table keyed by their index as 8 big-endian
//! bytes, so engine key order is log order. Hard state, configuration state,
//! peer addresses and the latest snapshot live in the `stable` table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::storage::{RaftState, Storage};
use raft::{GetEntriesContext, StorageError};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{Compactable, CompactionError, Engine, spawn_compaction};
use crate::error::StoreError;
use crate::fsm::StateMachine;

const LOGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("logs");
const STABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stable");

const HARD_STATE: &str = "hard_state";
const CONF_STATE: &str = "conf_state";
const PEERS: &str = "peers";
const SNAPSHOT_META: &str = "snapshot_meta";
const SNAPSHOT: &str = "snapshot";

/// Default cap on deletions per write transaction in [`LogStore::delete_range`].
pub const DEFAULT_MAX_TXN_OPS: usize = 4096;

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn parse_index(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| anyhow!("log key has {} bytes, expected 8", key.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn storage_error(err: anyhow::Error) -> raft::Error {
    raft::Error::Store(StorageError::Other(err.into()))
}

/// Snapshot body: the state machine export plus the peer address book, so a
/// node restored from a snapshot can reach every member.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub peers: BTreeMap<u64, String>,
    pub data: Vec<u8>,
}

impl SnapshotPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(bytes).context("decode snapshot payload")
    }
}

struct Inner {
    engine: Engine,
    fsm: Arc<StateMachine>,
    max_txn_ops: usize,
}

impl Compactable for Inner {
    fn compact(&self) -> Result<(), CompactionError> {
        self.engine.compact()
    }
}

/// `raft::Storage` over an embedded engine. Cloning shares the same engine.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Inner>,
}

impl LogStore {
    pub fn open(
        path: impl AsRef<Path>,
        fsm: Arc<StateMachine>,
        max_txn_ops: usize,
    ) -> Result<Self> {
        let engine = Engine::open(path)?;
        let txn = engine.begin_write()?;
        txn.open_table(LOGS)?;
        txn.open_table(STABLE)?;
        txn.commit()?;
        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                fsm,
                max_txn_ops: max_txn_ops.max(1),
            }),
        })
    }

    pub fn spawn_compaction(&self, interval: Duration) -> Result<thread::JoinHandle<()>> {
        spawn_compaction(Arc::downgrade(&self.inner), interval, "raft-log")
    }

    pub fn close(&self) {
        self.inner.engine.close();
    }

    /// True when nothing was ever persisted: no entries, no term, no members.
    pub fn is_fresh(&self) -> Result<bool> {
        Ok(self.last_log_index()?.is_none()
            && self.hard_state()?.term == 0
            && self.conf_state()?.voters.is_empty()
            && self.snapshot_metadata()?.index == 0)
    }

    /// Seeds a brand new cluster with `conf_state` at index 1, term 1.
    pub fn initialize(&self, conf_state: ConfState) -> Result<()> {
        let mut meta = SnapshotMetadata::default();
        meta.index = 1;
        meta.term = 1;
        meta.set_conf_state(conf_state.clone());

        let mut hard_state = HardState::default();
        hard_state.term = 1;
        hard_state.commit = 1;

        let txn = self.inner.engine.begin_write()?;
        {
            let mut stable = txn.open_table(STABLE)?;
            stable.insert(SNAPSHOT_META, meta.encode_to_vec().as_slice())?;
            stable.insert(HARD_STATE, hard_state.encode_to_vec().as_slice())?;
            stable.insert(CONF_STATE, conf_state.encode_to_vec().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Appends entries in order within one transaction.
    pub fn store_logs(&self, entries: &[Entry]) -> Result<()> {
        let txn = self.inner.engine.begin_write()?;
        {
            let mut logs = txn.open_table(LOGS)?;
            for entry in entries {
                let key = index_key(entry.index);
                logs.insert(&key[..], entry.encode_to_vec().as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Appends entries handed over by raft, dropping any conflicting suffix first.
    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if let Some(last) = self.last_log_index()? {
            if first.index <= last {
                self.delete_range(first.index, last)?;
            }
        }
        self.store_logs(entries)
    }

    pub fn get_log(&self, index: u64) -> Result<Entry, StoreError> {
        let txn = self.inner.engine.begin_read()?;
        let logs = txn.open_table(LOGS).map_err(anyhow::Error::from)?;
        let key = index_key(index);
        let found = logs.get(&key[..]).map_err(anyhow::Error::from)?;
        let Some(raw) = found else {
            return Err(StoreError::NotFound(format!("log index {index}")));
        };
        let entry = Entry::decode(raw.value()).context("decode log entry")?;
        Ok(entry)
    }

    /// Lowest index present in the engine, read with a forward iterator.
    pub fn first_log_index(&self) -> Result<Option<u64>> {
        let txn = self.inner.engine.begin_read()?;
        let logs = txn.open_table(LOGS)?;
        let first = logs.iter()?.next().transpose()?;
        first.map(|(key, _)| parse_index(key.value())).transpose()
    }

    /// Highest index present in the engine, read with a reverse iterator.
    pub fn last_log_index(&self) -> Result<Option<u64>> {
        let txn = self.inner.engine.begin_read()?;
        let logs = txn.open_table(LOGS)?;
        let last = logs.iter()?.next_back().transpose()?;
        last.map(|(key, _)| parse_index(key.value())).transpose()
    }

    fn read_range(&self, low: u64, high: u64) -> Result<Vec<Entry>> {
        let txn = self.inner.engine.begin_read()?;
        let logs = txn.open_table(LOGS)?;
        let (low, high) = (index_key(low), index_key(high));
        let mut entries = Vec::new();
        for item in logs.range::<&[u8]>(&low[..]..&high[..])? {
            let (_, raw) = item?;
            entries.push(Entry::decode(raw.value()).context("decode log entry")?);
        }
        Ok(entries)
    }

    /// Deletes `[min, max]`.
    ///
    /// At most `max_txn_ops` keys are removed per transaction. When the range
    /// is larger, the partial transaction is committed and deletion resumes
    /// from the first key that did not fit.
    pub fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Ok(());
        }
        let limit = self.inner.max_txn_ops;
        let txn = self.inner.engine.begin_write()?;
        let resume_at = {
            let mut logs = txn.open_table(LOGS)?;
            let (low, high) = (index_key(min), index_key(max));
            let batch = logs
                .range::<&[u8]>(&low[..]..=&high[..])?
                .take(limit + 1)
                .map(|item| {
                    let (key, _) = item?;
                    parse_index(key.value())
                })
                .collect::<Result<Vec<u64>>>()?;

            let mut resume_at = None;
            for (n, index) in batch.into_iter().enumerate() {
                if n == limit {
                    resume_at = Some(index);
                    break;
                }
                logs.remove(&index_key(index)[..])?;
            }
            resume_at
        };
        txn.commit()?;

        match resume_at {
            Some(next) => {
                debug!(next, max, "delete range hit transaction limit, continuing");
                self.delete_range(next, max)
            }
            None => Ok(()),
        }
    }

    fn get_stable<M: ProstMessage + Default>(&self, key: &str) -> Result<Option<M>> {
        let txn = self.inner.engine.begin_read()?;
        let stable = txn.open_table(STABLE)?;
        let found = stable.get(key)?;
        found
            .map(|raw| M::decode(raw.value()).with_context(|| format!("decode stable key {key}")))
            .transpose()
    }

    fn put_stable(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let txn = self.inner.engine.begin_write()?;
        txn.open_table(STABLE)?.insert(key, bytes)?;
        txn.commit()?;
        Ok(())
    }

    pub fn hard_state(&self) -> Result<HardState> {
        Ok(self.get_stable(HARD_STATE)?.unwrap_or_default())
    }

    pub fn set_hard_state(&self, hard_state: &HardState) -> Result<()> {
        self.put_stable(HARD_STATE, &hard_state.encode_to_vec())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hard_state = self.hard_state()?;
        hard_state.commit = commit;
        self.set_hard_state(&hard_state)
    }

    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(self.get_stable(CONF_STATE)?.unwrap_or_default())
    }

    pub fn set_conf_state(&self, conf_state: &ConfState) -> Result<()> {
        self.put_stable(CONF_STATE, &conf_state.encode_to_vec())
    }

    pub fn peers(&self) -> Result<BTreeMap<u64, String>> {
        let txn = self.inner.engine.begin_read()?;
        let stable = txn.open_table(STABLE)?;
        let found = stable.get(PEERS)?;
        match found {
            Some(raw) => bincode::deserialize(raw.value()).context("decode peer addresses"),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn set_peers(&self, peers: &BTreeMap<u64, String>) -> Result<()> {
        self.put_stable(PEERS, &bincode::serialize(peers)?)
    }

    pub fn snapshot_metadata(&self) -> Result<SnapshotMetadata> {
        Ok(self.get_stable(SNAPSHOT_META)?.unwrap_or_default())
    }

    /// Builds a snapshot at the state machine's applied index and persists it.
    pub fn create_snapshot(&self) -> Result<Snapshot> {
        let (applied, data) = self.inner.fsm.snapshot()?;
        let previous = self.snapshot_metadata()?;
        let term = if applied == previous.index {
            previous.term
        } else {
            self.get_log(applied)
                .map_err(|err| anyhow!("no term for applied index {applied}: {err}"))?
                .term
        };
        let payload = SnapshotPayload {
            peers: self.peers()?,
            data,
        };

        let mut snapshot = Snapshot::default();
        snapshot.data = payload.encode()?.into();
        let meta = snapshot.mut_metadata();
        meta.index = applied;
        meta.term = term;
        meta.set_conf_state(self.conf_state()?);

        let txn = self.inner.engine.begin_write()?;
        {
            let mut stable = txn.open_table(STABLE)?;
            stable.insert(SNAPSHOT_META, snapshot.get_metadata().encode_to_vec().as_slice())?;
            stable.insert(SNAPSHOT, snapshot.encode_to_vec().as_slice())?;
        }
        txn.commit()?;
        debug!(index = applied, term, "snapshot created");
        Ok(snapshot)
    }

    /// Snapshots the state machine and drops every log entry it covers.
    pub fn compact(&self) -> Result<u64> {
        let snapshot = self.create_snapshot()?;
        let index = snapshot.get_metadata().index;
        if let Some(first) = self.first_log_index()? {
            self.delete_range(first, index)?;
        }
        Ok(index)
    }

    /// Adopts a snapshot received from the leader. The state machine must be
    /// restored by the caller.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let mut hard_state = self.hard_state()?;
        hard_state.term = hard_state.term.max(meta.term);
        hard_state.commit = hard_state.commit.max(meta.index);

        let txn = self.inner.engine.begin_write()?;
        txn.delete_table(LOGS)?;
        {
            txn.open_table(LOGS)?;
            let mut stable = txn.open_table(STABLE)?;
            stable.insert(SNAPSHOT_META, meta.encode_to_vec().as_slice())?;
            stable.insert(SNAPSHOT, snapshot.encode_to_vec().as_slice())?;
            stable.insert(HARD_STATE, hard_state.encode_to_vec().as_slice())?;
            stable.insert(CONF_STATE, meta.get_conf_state().encode_to_vec().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn first_index_inner(&self) -> Result<u64> {
        match self.first_log_index()? {
            Some(index) => Ok(index),
            None => Ok(self.snapshot_metadata()?.index + 1),
        }
    }

    fn last_index_inner(&self) -> Result<u64> {
        match self.last_log_index()? {
            Some(index) => Ok(index),
            None => Ok(self.snapshot_metadata()?.index),
        }
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let hard_state = self.hard_state().map_err(storage_error)?;
        let conf_state = self.conf_state().map_err(storage_error)?;
        Ok(RaftState::new(hard_state, conf_state))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        if low < self.first_index_inner().map_err(storage_error)? {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > self.last_index_inner().map_err(storage_error)? + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let mut entries = self.read_range(low, high).map_err(storage_error)?;
        raft::util::limit_size(&mut entries, max_size);
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let meta = self.snapshot_metadata().map_err(storage_error)?;
        if idx == meta.index {
            return Ok(meta.term);
        }
        if idx < self.first_index_inner().map_err(storage_error)? {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        match self.get_log(idx) {
            Ok(entry) => Ok(entry.term),
            Err(StoreError::NotFound(_)) => Err(raft::Error::Store(StorageError::Unavailable)),
            Err(err) => Err(storage_error(err.into())),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.first_index_inner().map_err(storage_error)
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.last_index_inner().map_err(storage_error)
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let snapshot = self.create_snapshot().map_err(storage_error)?;
        let index = snapshot.get_metadata().index;
        if index == 0 || index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot)
    }
}
