//! Point-in-time views with buffered writes.
//!
//! A snapshot is a standalone checkpoint of its store, recovered into a
//! detached engine (null devices, values inline), plus a `WriteBuffer` of
//! pending puts and deletes. Reads see the buffer over the recovered state and
//! never observe store writes made after the snapshot was taken.
//!
//! `commit` replays the buffer against the store key by key. There is no
//! cross-key ordering or atomicity: every key is attempted and failures are
//! reported together. Applied entries leave the buffer and are folded into
//! the snapshot's own engine, so the snapshot keeps reading its own writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::checkpoint::{CheckpointInfo, CheckpointToken};
use crate::engine::{LogEngine, Session};
use crate::error::{HybridError, HybridResult};
use crate::format::EntryLimits;
use crate::ordering::{BuildKeyHasher, KeyComparer, SeekDirection};
use crate::seek::Seek;
use crate::session::{Pooled, SessionPool};
use crate::store::StoreInner;

/// Pending snapshot writes. `None` is a tombstone: the key reads as absent
/// and is deleted from the store on commit.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    entries: RwLock<HashMap<Vec<u8>, Option<Vec<u8>>, BuildKeyHasher>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.entries.write().insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn delete(&self, key: &[u8]) {
        self.entries.write().insert(key.to_vec(), None);
    }

    /// `Some(None)` for a tombstone, `None` when the key is not buffered.
    pub fn lookup(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every buffered entry, in no particular order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.entries.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Drop `key` if it still holds `expected`. A write that raced with a
    /// commit stays buffered.
    fn remove_if_unchanged(&self, key: &[u8], expected: &Option<Vec<u8>>) -> bool {
        let mut entries = self.entries.write();
        if entries.get(key) == Some(expected) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Overlay buffered entries admitted by `admit` onto `base`.
    fn overlay<F>(&self, base: Vec<(Vec<u8>, Vec<u8>)>, admit: F) -> Vec<(Vec<u8>, Vec<u8>)>
    where
        F: Fn(&[u8]) -> bool,
    {
        let entries = self.entries.read();
        if entries.is_empty() {
            return base;
        }

        let mut merged: HashMap<Vec<u8>, Vec<u8>, BuildKeyHasher> = base.into_iter().collect();
        for (key, value) in entries.iter() {
            match value {
                Some(value) if admit(key.as_slice()) => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(_) => {}
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

/// An isolated view of a store with buffered writes.
///
/// Dropping a snapshot discards uncommitted writes and purges its
/// checkpoint; [`Snapshot::dispose`] does the same and reports errors.
pub struct Snapshot {
    store: Arc<StoreInner>,
    engine: Arc<LogEngine>,
    pool: SessionPool<Session>,
    info: CheckpointInfo,
    buffer: WriteBuffer,
    limits: EntryLimits,
    disposed: AtomicBool,
}

impl Snapshot {
    /// Checkpoint `store` and recover the checkpoint into a detached engine.
    pub(crate) fn create(store: &Arc<StoreInner>) -> HybridResult<Self> {
        let info = store.snapshot_checkpoint()?;
        let config = store.config();

        let engine = LogEngine::open_detached(config);
        match store.checkpoints.read_image(info.token) {
            Ok(image) => engine.load_image(image),
            Err(e) => {
                if let Err(purge_err) = store.checkpoints.purge(info.token) {
                    tracing::warn!(token = %info.token, error = %purge_err, "failed to remove snapshot checkpoint");
                }
                return Err(HybridError::Recovery { token: Some(info.token), reason: e.to_string() });
            }
        }

        let pool = {
            let engine = Arc::clone(&engine);
            SessionPool::new(config.session_capacity, move || engine.new_session())
        };

        tracing::debug!(token = %info.token, entries = engine.len(), "snapshot created");
        Ok(Self {
            store: Arc::clone(store),
            limits: EntryLimits { max_key_size: config.max_key_size, max_value_size: config.max_value_size },
            engine,
            pool,
            info,
            buffer: WriteBuffer::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Token of the checkpoint this snapshot was recovered from.
    pub fn token(&self) -> CheckpointToken {
        self.info.token
    }

    pub fn info(&self) -> &CheckpointInfo {
        &self.info
    }

    /// Buffered writes not yet committed.
    pub fn pending_writes(&self) -> usize {
        self.buffer.len()
    }

    fn ensure_open(&self) -> HybridResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HybridError::Disposed);
        }
        Ok(())
    }

    fn session(&self) -> HybridResult<Pooled<'_, Session>> {
        self.ensure_open()?;
        match self.pool.try_get()? {
            Some(session) => Ok(session),
            None => self.pool.get_blocking(),
        }
    }

    /// Buffered value first (a tombstone reads as absent), then the
    /// recovered state.
    pub fn get(&self, key: &[u8]) -> HybridResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(buffered) = self.buffer.lookup(key) {
            return Ok(buffered);
        }
        self.session()?.read(key)
    }

    pub fn contains(&self, key: &[u8]) -> HybridResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Buffer a put. Size limits are checked now rather than at commit.
    pub fn put(&self, key: &[u8], value: &[u8]) -> HybridResult<()> {
        self.ensure_open()?;
        self.limits.check(key, value)?;
        self.buffer.put(key, value);
        Ok(())
    }

    /// Buffer a delete.
    pub fn delete(&self, key: &[u8]) -> HybridResult<()> {
        self.ensure_open()?;
        self.limits.check(key, &[])?;
        self.buffer.delete(key);
        Ok(())
    }

    /// Ordered scan over the recovered state with the buffer merged in:
    /// buffered values replace or add entries, tombstones hide them.
    pub fn seek(&self, prefix: &[u8], direction: SeekDirection) -> HybridResult<Seek> {
        let comparer = KeyComparer::for_direction(direction);
        let admit = |key: &[u8]| comparer.admits(key, prefix);
        let base = self.session()?.scan(admit)?;
        Ok(Seek::new(self.buffer.overlay(base, admit), prefix, direction))
    }

    /// Replay buffered writes against the store. Returns the number applied.
    ///
    /// Every key is attempted. If any fail, the rest are still applied and the
    /// error lists each failed key; failed entries stay buffered so a later
    /// commit can retry them.
    pub fn commit(&self) -> HybridResult<usize> {
        self.ensure_open()?;
        let entries = self.buffer.entries();
        if entries.is_empty() {
            return Ok(0);
        }

        let mut session = self.session()?;
        let mut applied = 0usize;
        let mut failures = Vec::new();

        for (key, value) in entries {
            let result = match &value {
                Some(value) => self.store.put(&key, value),
                None => self.store.delete(&key),
            };
            match result {
                Ok(()) => {
                    applied += 1;
                    if self.buffer.remove_if_unchanged(&key, &value) {
                        let folded = match &value {
                            Some(value) => session.upsert(&key, value),
                            None => session.delete(&key),
                        };
                        if let Err(e) = folded {
                            tracing::warn!(token = %self.info.token, error = %e, "failed to fold committed write into snapshot");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(token = %self.info.token, key_len = key.len(), error = %e, "commit failed for key");
                    failures.push((key, e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            tracing::debug!(token = %self.info.token, applied, "snapshot committed");
            Ok(applied)
        } else {
            Err(HybridError::CommitFailed { applied, failures })
        }
    }

    /// Release the recovered engine and purge the snapshot's checkpoint.
    pub fn dispose(self) -> HybridResult<()> {
        self.release()
    }

    fn release(&self) -> HybridResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.dispose();
        self.engine.close();

        let discarded = self.buffer.len();
        if discarded > 0 {
            tracing::debug!(token = %self.info.token, discarded, "uncommitted snapshot writes discarded");
        }

        // Gone already if the store was reset meanwhile
        self.store.checkpoints.purge(self.info.token)?;
        tracing::debug!(token = %self.info.token, "snapshot disposed");
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(token = %self.info.token, error = %e, "snapshot dispose on drop failed");
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("token", &self.info.token)
            .field("entries", &self.engine.len())
            .field("pending_writes", &self.buffer.len())
            .finish()
    }
}
