//! The store: a log engine plus its session pool, checkpoints and lifecycle.
//!
//! Every data operation checks a session out of the pool (without waiting
//! when one is idle or can be built, otherwise blocking until one is
//! returned), runs, and returns the session on the way out.
//!
//! Maintenance operations (checkpoint, recover, reset, snapshot creation,
//! dispose) are serialized with each other but not with reads and writes.
//!
//! Recovery on open:
//! 1. Remove incomplete and orphaned checkpoint directories
//! 2. Rebuild the index from the latest checkpoint (image or log replay)
//! 3. With `recover_log_tail`, replay records written after the checkpoint
//! 4. Cut the log after the last valid record

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::checkpoint::{CheckpointDirectory, CheckpointInfo, CheckpointKind, CheckpointToken, CHECKPOINT_FORMAT_VERSION};
use crate::checkpointer::{start_checkpointer, CheckpointTarget, CheckpointerHandle};
use crate::config::Config;
use crate::engine::{LogEngine, Session, StagedIndex};
use crate::error::{HybridError, HybridResult};
use crate::log::LogAddress;
use crate::ordering::{KeyComparer, SeekDirection};
use crate::seek::Seek;
use crate::session::{Pooled, SessionPool};
use crate::snapshot::Snapshot;

/// A persistent key-value store over a hybrid log.
///
/// All methods take `&self`; share it across threads behind an `Arc`.
/// Dropping the store disposes it (final checkpoint, devices released); call
/// [`Store::dispose`] to observe the result instead.
pub struct Store {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    path: PathBuf,
    config: Config,
    engine: Arc<LogEngine>,
    pool: SessionPool<Session>,
    pub(crate) checkpoints: CheckpointDirectory,
    maintenance: Mutex<()>,
    checkpointer: Mutex<Option<CheckpointerHandle>>,
    disposed: AtomicBool,
}

impl Store {
    /// Open or create a store at `path`, recovering the latest checkpoint.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> HybridResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|e| HybridError::io_at(&path, e, "Failed to create store directory"))?;

        let checkpoints = CheckpointDirectory::open(&path.join("checkpoints"))?;
        let engine = LogEngine::open_primary(&path, &config)?;

        let latest = checkpoints.latest()?;
        let token = latest.as_ref().map(|info| info.token);
        rebuild(&engine, &checkpoints, latest.as_ref(), config.recover_log_tail)
            .map_err(|e| recovery_failure(token, e))?;

        tracing::info!(
            path = %path.display(),
            entries = engine.len(),
            checkpoint = ?token,
            "store opened"
        );

        let pool = {
            let engine = Arc::clone(&engine);
            SessionPool::new(config.session_capacity, move || engine.new_session())
        };

        let inner = Arc::new(StoreInner {
            path,
            config,
            engine,
            pool,
            checkpoints,
            maintenance: Mutex::new(()),
            checkpointer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        if let Some(cadence) = inner.config.checkpoint_interval {
            inner.start_checkpointer(cadence)?;
        }
        Ok(Self { inner })
    }

    /// Value for `key`, or `None` if absent.
    pub fn get(&self, key: &[u8]) -> HybridResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> HybridResult<bool> {
        self.inner.contains(key)
    }

    /// Insert or overwrite.
    pub fn put(&self, key: &[u8], value: &[u8]) -> HybridResult<()> {
        self.inner.put(key, value)
    }

    /// Remove `key`. Succeeds whether or not the key exists.
    pub fn delete(&self, key: &[u8]) -> HybridResult<()> {
        self.inner.delete(key)
    }

    /// Ordered scan starting at `prefix`. An empty prefix scans everything.
    pub fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HybridResult<Seek> {
        self.inner.seek(prefix, direction)
    }

    /// Take a checkpoint and block until it is durable.
    pub fn checkpoint(&self, kind: CheckpointKind) -> HybridResult<CheckpointToken> {
        self.inner.checkpoint(kind).map(|info| info.token)
    }

    /// Roll the store back to the state captured by `token`.
    ///
    /// The log is cut at the checkpoint's tail and later checkpoints are
    /// purged. Writers should be quiesced for the duration.
    pub fn recover(&self, token: CheckpointToken) -> HybridResult<()> {
        self.inner.recover(token)
    }

    /// An isolated, writable view of the current state. Its writes reach the
    /// store only through [`Snapshot::commit`].
    pub fn get_snapshot(&self) -> HybridResult<Snapshot> {
        Snapshot::create(&self.inner)
    }

    /// Irreversibly drop all data and every checkpoint not held by a live
    /// snapshot.
    pub fn reset(&self) -> HybridResult<()> {
        self.inner.reset()
    }

    /// Take a final standalone checkpoint and release the devices.
    pub fn dispose(self) -> HybridResult<()> {
        self.inner.shutdown()
    }

    pub fn len(&self) -> usize {
        self.inner.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Complete checkpoints, oldest first.
    pub fn checkpoints(&self) -> HybridResult<Vec<CheckpointInfo>> {
        self.inner.checkpoints.list()
    }

    /// The checkpoint the next open would recover from.
    pub fn latest_checkpoint(&self) -> HybridResult<Option<CheckpointInfo>> {
        self.inner.checkpoints.latest()
    }

    /// Delete a checkpoint. Fails for a checkpoint held by a live snapshot.
    pub fn purge_checkpoint(&self, token: CheckpointToken) -> HybridResult<bool> {
        let _guard = self.inner.maintenance.lock();
        if self.inner.checkpoints.is_pinned(token) {
            return Err(HybridError::Checkpoint { reason: format!("checkpoint {} is held by a live snapshot", token) });
        }
        self.inner.checkpoints.purge(token)
    }

    /// Mutations since the last durable checkpoint.
    pub fn pending_mutations(&self) -> u64 {
        self.inner.engine.pending_mutations()
    }

    /// Current end of the hybrid log.
    pub fn log_tail(&self) -> Option<LogAddress> {
        self.inner.engine.log_tail()
    }

    pub fn session_pool(&self) -> &SessionPool<Session> {
        &self.inner.pool
    }

    /// Run the background checkpointer at `cadence`, replacing a running one.
    pub fn start_checkpointer(&self, cadence: Duration) -> HybridResult<()> {
        self.inner.ensure_open()?;
        self.inner.start_checkpointer(cadence)
    }

    pub fn stop_checkpointer(&self) {
        self.inner.stop_checkpointer();
    }

    pub fn is_checkpointer_running(&self) -> bool {
        self.inner.checkpointer.lock().as_ref().map_or(false, |h| h.is_running())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.inner.shutdown() {
            tracing::warn!(path = %self.inner.path.display(), error = %e, "dispose on drop failed");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("entries", &self.inner.engine.len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

/// Why a checkpoint is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    /// Requested by a caller or the checkpointer
    Explicit,
    /// Backs a snapshot: transient and pinned
    Snapshot,
    /// Final checkpoint of a dispose; replaces the previous one
    Dispose,
}

impl StoreInner {
    pub(crate) fn ensure_open(&self) -> HybridResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HybridError::Disposed);
        }
        Ok(())
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn session(&self) -> HybridResult<Pooled<'_, Session>> {
        self.ensure_open()?;
        match self.pool.try_get()? {
            Some(session) => Ok(session),
            None => self.pool.get_blocking(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> HybridResult<Option<Vec<u8>>> {
        self.session()?.read(key)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> HybridResult<bool> {
        self.session()?.contains(key)
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> HybridResult<()> {
        self.session()?.upsert(key, value)
    }

    pub(crate) fn delete(&self, key: &[u8]) -> HybridResult<()> {
        self.session()?.delete(key)
    }

    pub(crate) fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HybridResult<Seek> {
        let comparer = KeyComparer::for_direction(direction);
        let entries = self.session()?.scan(|key| comparer.admits(key, prefix))?;
        Ok(Seek::new(entries, prefix, direction))
    }

    pub(crate) fn checkpoint(&self, kind: CheckpointKind) -> HybridResult<CheckpointInfo> {
        self.ensure_open()?;
        let _guard = self.maintenance.lock();
        self.take_checkpoint(kind, Purpose::Explicit)
    }

    /// Standalone checkpoint backing a snapshot; pinned before it is visible
    /// to any purge.
    pub(crate) fn snapshot_checkpoint(&self) -> HybridResult<CheckpointInfo> {
        self.ensure_open()?;
        let _guard = self.maintenance.lock();
        let info = self.take_checkpoint(CheckpointKind::Standalone, Purpose::Snapshot)?;
        self.checkpoints.pin(info.token);
        Ok(info)
    }

    /// Capture and persist. Callers hold `maintenance`.
    fn take_checkpoint(&self, kind: CheckpointKind, purpose: Purpose) -> HybridResult<CheckpointInfo> {
        let transient = purpose == Purpose::Snapshot;
        let captured = self.engine.capture(kind, !transient).map_err(checkpoint_failure)?;

        let info = CheckpointInfo {
            token: CheckpointToken::new(),
            version: self.checkpoints.next_version(),
            kind,
            created_at: Utc::now(),
            log_tail: captured.log_tail,
            entry_count: captured.entry_count,
            transient,
            on_dispose: purpose == Purpose::Dispose,
            format_version: CHECKPOINT_FORMAT_VERSION,
        };

        if let Err(e) = self.checkpoints.write(&info, captured.image.as_deref()) {
            self.engine.restore_pending(captured.pending);
            if let Err(purge_err) = self.checkpoints.purge(info.token) {
                tracing::warn!(token = %info.token, error = %purge_err, "failed to remove partial checkpoint");
            }
            return Err(checkpoint_failure(e));
        }

        if transient {
            tracing::debug!(token = %info.token, entries = info.entry_count, "snapshot checkpoint taken");
            return Ok(info);
        }

        tracing::info!(
            token = %info.token,
            version = info.version,
            kind = ?kind,
            log_tail = %info.log_tail,
            entries = info.entry_count,
            "checkpoint taken"
        );

        if self.config.remove_outdated {
            match self.checkpoints.purge_older_than(info.version) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "outdated checkpoints purged"),
                Err(e) => tracing::warn!(error = %e, "failed to purge outdated checkpoints"),
            }
        }
        if purpose == Purpose::Dispose {
            match self.checkpoints.purge_superseded_dispose(info.version) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "superseded dispose checkpoints purged"),
                Err(e) => tracing::warn!(error = %e, "failed to purge superseded dispose checkpoints"),
            }
        }
        Ok(info)
    }

    fn recover(&self, token: CheckpointToken) -> HybridResult<()> {
        self.ensure_open()?;
        let _guard = self.maintenance.lock();

        let info = self.checkpoints.load(token).map_err(|e| recovery_failure(Some(token), e))?;
        rebuild(&self.engine, &self.checkpoints, Some(&info), false).map_err(|e| recovery_failure(Some(token), e))?;
        let purged = self
            .checkpoints
            .purge_newer_than(info.version)
            .map_err(|e| recovery_failure(Some(token), e))?;

        tracing::info!(
            token = %token,
            version = info.version,
            entries = self.engine.len(),
            purged,
            "recovered to checkpoint"
        );
        Ok(())
    }

    fn reset(&self) -> HybridResult<()> {
        self.ensure_open()?;
        let _guard = self.maintenance.lock();
        self.engine.clear()?;
        let purged = self.checkpoints.purge_unpinned()?;
        tracing::info!(path = %self.path.display(), purged, "store reset");
        Ok(())
    }

    fn start_checkpointer(self: &Arc<Self>, cadence: Duration) -> HybridResult<()> {
        let handle = start_checkpointer(Arc::downgrade(self), cadence)?;
        let previous = self.checkpointer.lock().replace(handle);
        if let Some(previous) = previous {
            previous.shutdown();
        }
        Ok(())
    }

    fn stop_checkpointer(&self) {
        let handle = self.checkpointer.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    /// Dispose once; later calls succeed without doing anything.
    fn shutdown(&self) -> HybridResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_checkpointer();

        let result = {
            let _guard = self.maintenance.lock();
            self.take_checkpoint(CheckpointKind::Standalone, Purpose::Dispose)
        };

        self.pool.dispose();
        self.engine.close();

        match &result {
            Ok(info) => tracing::info!(path = %self.path.display(), token = %info.token, "store disposed"),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "final checkpoint failed"),
        }
        result.map(|_| ())
    }
}

impl CheckpointTarget for StoreInner {
    fn pending_mutations(&self) -> u64 {
        self.engine.pending_mutations()
    }

    fn fold_over(&self) -> HybridResult<()> {
        self.checkpoint(CheckpointKind::FoldOver).map(|_| ())
    }
}

/// Rebuild the index from `base` (or from nothing) and cut the log.
///
/// A standalone base loads its image; a fold-over base replays the log up to
/// its tail. With `replay_tail`, records after the base tail are replayed too
/// and the log is cut after the last valid one; otherwise it is cut at the
/// base tail.
///
/// The new index is built aside and installed only once the log is cut, so
/// on error the engine keeps serving its previous state.
fn rebuild(
    engine: &LogEngine,
    checkpoints: &CheckpointDirectory,
    base: Option<&CheckpointInfo>,
    replay_tail: bool,
) -> HybridResult<()> {
    let (mut staged, base_tail) = match base {
        Some(info) => {
            let staged = match info.kind {
                CheckpointKind::Standalone => StagedIndex::from_image(checkpoints.read_image(info.token)?),
                CheckpointKind::FoldOver => {
                    let mut staged = StagedIndex::new();
                    let stats = engine.replay(&mut staged, LogAddress::ZERO, Some(info.log_tail))?;
                    tracing::debug!(records = stats.records, skipped = stats.skipped, "checkpoint replay finished");
                    staged
                }
            };
            (staged, info.log_tail)
        }
        None => (StagedIndex::new(), LogAddress::ZERO),
    };

    let (cut, pending) = if replay_tail {
        let stats = engine.replay(&mut staged, base_tail, None)?;
        if stats.records > 0 || stats.torn {
            tracing::info!(
                records = stats.records,
                skipped = stats.skipped,
                torn = stats.torn,
                end = %stats.end,
                "replayed log past checkpoint"
            );
        }
        // Replayed records are not covered by any checkpoint yet
        (stats.end, stats.records)
    } else {
        (base_tail, 0)
    };

    tracing::debug!(entries = staged.len(), cut = %cut, "installing rebuilt index");
    engine.install(staged, cut, pending)
}

fn recovery_failure(token: Option<CheckpointToken>, err: HybridError) -> HybridError {
    match err {
        HybridError::Recovery { .. } | HybridError::Disposed => err,
        other => HybridError::Recovery { token, reason: other.to_string() },
    }
}

fn checkpoint_failure(err: HybridError) -> HybridError {
    match err {
        HybridError::Checkpoint { .. } | HybridError::Disposed => err,
        other => HybridError::Checkpoint { reason: other.to_string() },
    }
}
