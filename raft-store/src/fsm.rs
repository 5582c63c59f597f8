//! Replicated state machine.
//!
//! Committed commands are applied to a redb table whose values carry an
//! 8-byte big-endian expiry prefix (0 means no expiry). Expired entries are
//! hidden from reads and swept during compaction.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use redb::{ReadableTable, TableDefinition};
use tracing::debug;

use crate::command::Command;
use crate::engine::{Compactable, CompactionError, Engine};
use crate::now_ms;

const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const APPLIED_INDEX: &str = "applied_index";
const EXPIRY_LEN: usize = 8;

/// A value as stored in the data table.
fn encode_value(value: &str, expires_at_ms: Option<u64>) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(EXPIRY_LEN + value.len());
    encoded.extend_from_slice(&expires_at_ms.unwrap_or(0).to_be_bytes());
    encoded.extend_from_slice(value.as_bytes());
    encoded
}

fn expiry_of(raw: &[u8]) -> Option<u64> {
    let prefix: [u8; EXPIRY_LEN] = raw.get(..EXPIRY_LEN)?.try_into().ok()?;
    match u64::from_be_bytes(prefix) {
        0 => None,
        at => Some(at),
    }
}

fn is_live(raw: &[u8], now: u64) -> bool {
    expiry_of(raw).map_or(true, |at| at > now)
}

fn decode_value(raw: &[u8]) -> Result<String> {
    let body = raw.get(EXPIRY_LEN..).unwrap_or_default();
    String::from_utf8(body.to_vec()).context("stored value is not utf-8")
}

pub struct StateMachine {
    engine: Engine,
    // Serialises mutations against snapshot capture.
    lock: Mutex<()>,
}

impl StateMachine {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let engine = Engine::open(path)?;
        let txn = engine.begin_write()?;
        txn.open_table(DATA)?;
        txn.open_table(META)?;
        txn.commit()?;
        Ok(Arc::new(Self {
            engine,
            lock: Mutex::new(()),
        }))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Applies one committed command and records `index` as applied in the
    /// same transaction.
    ///
    /// A TTL write whose expiry already passed on this replica's clock is
    /// dropped, but the index still counts as applied.
    pub fn apply(&self, index: u64, command: &Command) -> Result<()> {
        let _guard = self.lock.lock();
        let txn = self.engine.begin_write()?;
        {
            let mut data = txn.open_table(DATA)?;
            match command {
                Command::Set { key, value } => {
                    data.insert(key.as_bytes(), encode_value(value, None).as_slice())?;
                }
                Command::SetWithTtl {
                    key,
                    value,
                    expires_at_ms,
                } => {
                    let now = now_ms();
                    if now > *expires_at_ms {
                        debug!(
                            key,
                            index,
                            expired_by_ms = now - expires_at_ms,
                            "dropping expired write"
                        );
                    } else {
                        let encoded = encode_value(value, Some(*expires_at_ms));
                        data.insert(key.as_bytes(), encoded.as_slice())?;
                    }
                }
                Command::Delete { key } => {
                    data.remove(key.as_bytes())?;
                }
            }
            txn.open_table(META)?.insert(APPLIED_INDEX, index)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Records an entry that carries no command (leader no-ops, membership changes).
    pub fn mark_applied(&self, index: u64) -> Result<()> {
        let _guard = self.lock.lock();
        let txn = self.engine.begin_write()?;
        txn.open_table(META)?.insert(APPLIED_INDEX, index)?;
        txn.commit()?;
        Ok(())
    }

    pub fn applied_index(&self) -> Result<u64> {
        let txn = self.engine.begin_read()?;
        let meta = txn.open_table(META)?;
        Ok(meta.get(APPLIED_INDEX)?.map(|v| v.value()).unwrap_or(0))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.engine.begin_read()?;
        let data = txn.open_table(DATA)?;
        let Some(raw) = data.get(key.as_bytes())? else {
            return Ok(None);
        };
        let raw = raw.value();
        if !is_live(raw, now_ms()) {
            return Ok(None);
        }
        decode_value(raw).map(Some)
    }

    pub fn scan_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        self.scan(prefix, |key, raw| {
            found.insert(key, decode_value(raw)?);
            Ok(())
        })?;
        Ok(found)
    }

    /// Like [`scan_prefix`](Self::scan_prefix) but only reads the expiry
    /// header of each value.
    pub fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.scan(prefix, |key, _| {
            keys.push(key);
            Ok(())
        })?;
        Ok(keys)
    }

    fn scan<F>(&self, prefix: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(String, &[u8]) -> Result<()>,
    {
        let now = now_ms();
        let txn = self.engine.begin_read()?;
        let data = txn.open_table(DATA)?;
        for item in data.range::<&[u8]>(prefix.as_bytes()..)? {
            let (key, raw) = item?;
            let key = key.value();
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let raw = raw.value();
            if !is_live(raw, now) {
                continue;
            }
            let key = String::from_utf8(key.to_vec()).context("stored key is not utf-8")?;
            visit(key, raw)?;
        }
        Ok(())
    }

    /// Captures the applied index and the full data table under the mutation lock.
    pub fn snapshot(&self) -> Result<(u64, Vec<u8>)> {
        let _guard = self.lock.lock();
        let txn = self.engine.begin_read()?;
        let applied = txn
            .open_table(META)?
            .get(APPLIED_INDEX)?
            .map(|v| v.value())
            .unwrap_or(0);
        let mut out = Vec::new();
        backup_table(&txn, &mut out)?;
        Ok((applied, out))
    }

    /// Replaces the whole data table with the frames in `reader` and marks
    /// `applied_index` as applied.
    ///
    /// Runs before the node serves traffic for the restored state, so the
    /// mutation lock is not taken.
    pub fn restore<R: Read>(&self, reader: &mut R, applied_index: u64) -> Result<()> {
        let now = now_ms();
        let txn = self.engine.begin_write()?;
        txn.delete_table(DATA)?;
        let mut restored = 0usize;
        {
            let mut data = txn.open_table(DATA)?;
            while let Some(key) = read_frame(reader)? {
                let Some(raw) = read_frame(reader)? else {
                    bail!("snapshot ended between a key and its value");
                };
                if is_live(&raw, now) {
                    data.insert(key.as_slice(), raw.as_slice())?;
                    restored += 1;
                }
            }
            txn.open_table(META)?.insert(APPLIED_INDEX, applied_index)?;
        }
        txn.commit()?;
        debug!(restored, applied_index, "state machine restored from snapshot");
        Ok(())
    }

    /// Deletes entries whose expiry has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        let now = now_ms();
        let txn = self.engine.begin_write()?;
        let removed = {
            let mut data = txn.open_table(DATA)?;
            let expired = data
                .iter()?
                .filter_map(|item| match item {
                    Ok((key, raw)) if !is_live(raw.value(), now) => Some(Ok(key.value().to_vec())),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            for key in &expired {
                data.remove(key.as_slice())?;
            }
            expired.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}

impl Compactable for StateMachine {
    fn compact(&self) -> Result<(), CompactionError> {
        if self.engine.is_closed() {
            return Err(CompactionError::Closed);
        }
        let removed = self.purge_expired()?;
        if removed > 0 {
            debug!(removed, "purged expired entries");
        }
        self.engine.compact()
    }
}

fn backup_table<W: Write>(txn: &redb::ReadTransaction, writer: &mut W) -> Result<()> {
    let now = now_ms();
    let data = txn.open_table(DATA)?;
    for item in data.iter()? {
        let (key, raw) = item?;
        let raw = raw.value();
        if !is_live(raw, now) {
            continue;
        }
        write_frame(writer, key.value())?;
        write_frame(writer, raw)?;
    }
    Ok(())
}

fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Result<(tempfile::TempDir, Arc<StateMachine>)> {
        let dir = tempfile::tempdir()?;
        let fsm = StateMachine::open(dir.path().join("fsm.redb"))?;
        Ok((dir, fsm))
    }

    fn set(key: &str, value: &str) -> Command {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn apply_set_and_delete() -> Result<()> {
        let (_dir, fsm) = open()?;
        fsm.apply(1, &set("cfg.current.demo", "a=1"))?;
        assert_eq!(fsm.get("cfg.current.demo")?.as_deref(), Some("a=1"));

        fsm.apply(2, &Command::Delete {
            key: "cfg.current.demo".into(),
        })?;
        assert_eq!(fsm.get("cfg.current.demo")?, None);
        assert_eq!(fsm.applied_index()?, 2);
        Ok(())
    }

    #[test]
    fn expired_ttl_write_is_a_noop_at_apply_time() -> Result<()> {
        let (_dir, fsm) = open()?;
        fsm.apply(1, &set("instance.info.demo", "UP"))?;
        fsm.apply(2, &Command::SetWithTtl {
            key: "instance.info.demo".into(),
            value: "DOWN".into(),
            expires_at_ms: now_ms() - 1_000,
        })?;
        assert_eq!(fsm.get("instance.info.demo")?.as_deref(), Some("UP"));
        assert_eq!(fsm.applied_index()?, 2);
        Ok(())
    }

    #[test]
    fn live_ttl_write_lands_and_then_lapses() -> Result<()> {
        let (_dir, fsm) = open()?;
        fsm.apply(1, &Command::SetWithTtl {
            key: "ns.demo.group.app.props.10.0.0.5:8080".into(),
            value: "UP".into(),
            expires_at_ms: now_ms() + 150,
        })?;
        assert_eq!(fsm.scan_keys("ns.demo.")?.len(), 1);
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(fsm.scan_keys("ns.demo.")?.is_empty());
        assert_eq!(fsm.purge_expired()?, 1);
        Ok(())
    }

    #[test]
    fn scans_stop_at_prefix_boundary() -> Result<()> {
        let (_dir, fsm) = open()?;
        fsm.apply(1, &set("cfg.current.a.g.x.yaml", "1"))?;
        fsm.apply(2, &set("cfg.current.a.g.y.yaml", "2"))?;
        fsm.apply(3, &set("cfg.future.a.g.x.yaml", "3"))?;

        let current = fsm.scan_prefix("cfg.current.a.g.")?;
        assert_eq!(current.len(), 2);
        assert_eq!(current["cfg.current.a.g.y.yaml"], "2");
        assert_eq!(fsm.scan_keys("cfg.future.")?, vec!["cfg.future.a.g.x.yaml".to_string()]);
        Ok(())
    }

    #[test]
    fn snapshot_restores_into_fresh_machine() -> Result<()> {
        let (_dir, source) = open()?;
        source.apply(1, &set("k1", "v1"))?;
        source.apply(2, &set("k2", "v2"))?;
        let (applied, bytes) = source.snapshot()?;
        assert_eq!(applied, 2);

        let (_other, target) = open()?;
        target.apply(1, &set("stale", "x"))?;
        target.restore(&mut bytes.as_slice(), applied)?;

        assert_eq!(target.get("stale")?, None);
        assert_eq!(target.get("k2")?.as_deref(), Some("v2"));
        assert_eq!(target.applied_index()?, 2);
        Ok(())
    }

    #[test]
    fn frames_carry_a_big_endian_length() -> Result<()> {
        let mut out = Vec::new();
        write_frame(&mut out, b"key")?;
        assert_eq!(out, [0, 0, 0, 3, b'k', b'e', b'y']);
        assert_eq!(read_frame(&mut out.as_slice())?, Some(b"key".to_vec()));
        assert_eq!(read_frame(&mut io::empty())?, None);
        Ok(())
    }

    #[test]
    fn truncated_snapshot_is_rejected() -> Result<()> {
        let (_dir, fsm) = open()?;
        let mut bytes = Vec::new();
        write_frame(&mut bytes, b"orphan-key")?;
        assert!(fsm.restore(&mut bytes.as_slice(), 1).is_err());
        Ok(())
    }
}
