//! Embedded ordered key-value engine.
//!
//! A thin wrapper over a redb [`Database`] that can be closed while other
//! components still hold a reference. The raft log and the state machine each
//! own one engine, and each engine gets a background compaction thread that
//! exits once the engine reports it has been closed.

use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use redb::{Database, ReadTransaction, WriteTransaction};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How often background compaction runs against an open engine.
pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum CompactionError {
    /// The engine was closed. Background loops stop on this.
    #[error("engine closed")]
    Closed,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Something a background compaction loop can work on.
pub trait Compactable: Send + Sync + 'static {
    fn compact(&self) -> Result<(), CompactionError>;
}

pub struct Engine {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl Engine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("failed to open redb database at {}", path.display()))?;
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db()?.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db()?.begin_write()?)
    }

    /// Drops the underlying database. Later calls fail and compaction loops stop.
    pub fn close(&self) {
        if self.db.write().take().is_some() {
            debug!(path = %self.path.display(), "engine closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.db.read().is_none()
    }

    fn db(&self) -> Result<MappedRwLockReadGuard<'_, Database>> {
        RwLockReadGuard::try_map(self.db.read(), |db| db.as_ref())
            .map_err(|_| anyhow!("engine at {} is closed", self.path.display()))
    }
}

impl Compactable for Engine {
    fn compact(&self) -> Result<(), CompactionError> {
        let mut guard = self.db.write();
        let db = guard.as_mut().ok_or(CompactionError::Closed)?;
        let compacted = db
            .compact()
            .with_context(|| format!("compaction of {} failed", self.path.display()))?;
        debug!(path = %self.path.display(), compacted, "engine compaction finished");
        Ok(())
    }
}

/// Runs `target.compact()` every `interval` on a dedicated thread.
///
/// The thread holds only a weak reference. It stops when the target is dropped
/// or reports [`CompactionError::Closed`]; other failures are logged and retried
/// on the next interval.
pub fn spawn_compaction<T: Compactable>(
    target: Weak<T>,
    interval: Duration,
    name: &str,
) -> Result<thread::JoinHandle<()>> {
    let name = name.to_string();
    thread::Builder::new()
        .name(format!("compaction-{name}"))
        .spawn(move || {
            loop {
                thread::sleep(interval);
                let Some(target) = target.upgrade() else {
                    break;
                };
                match target.compact() {
                    Ok(()) => {}
                    Err(CompactionError::Closed) => break,
                    Err(CompactionError::Failed(err)) => {
                        warn!(engine = %name, error = ?err, "background compaction failed");
                    }
                }
            }
            info!(engine = %name, "background compaction stopped");
        })
        .context("failed to spawn compaction thread")
}
