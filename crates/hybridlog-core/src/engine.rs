//! Log engine: the in-memory hash index over a hybrid log.
//!
//! **Read path**: index lookup under a read lock; values above the inline
//! limit are fetched from the object log through the session's reader.
//! **Write path**: log append (object log first for large values), then the
//! index update, both under the log mutex so log order equals index order.
//! **Checkpoint**: under the log mutex, sync both logs and capture the tail
//! (plus a copy of the index for standalone checkpoints).
//!
//! A primary engine owns file devices under the store root. A detached engine
//! (used to serve a snapshot) has null devices: it never writes to disk and
//! keeps every value inline.
//!
//! Lock order: `log` → `objects` → `index`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::checkpoint::CheckpointKind;
use crate::config::Config;
use crate::error::{HybridError, HybridResult};
use crate::format::{EntryLimits, ObjectAddress, Operation};
use crate::log::{LogAddress, LogReader, LogWriter, ReplayStats};
use crate::object_log::{ObjectLogReader, ObjectLogWriter};
use crate::ordering::BuildKeyHasher;

type Index = HashMap<Vec<u8>, IndexEntry, BuildKeyHasher>;

/// Where the current value of a key lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IndexEntry {
    Inline(Vec<u8>),
    Object(ObjectAddress),
}

enum LogDevice {
    File(LogWriter),
    Null,
}

impl LogDevice {
    fn append(&mut self, key: &[u8], value: &[u8], op: Operation) -> HybridResult<()> {
        match self {
            LogDevice::File(writer) => writer.append(key, value, op).map(|_| ()),
            LogDevice::Null => Ok(()),
        }
    }
}

enum ObjectDevice {
    File(ObjectLogWriter),
    Null,
}

/// State captured by a checkpoint under the log mutex.
#[derive(Debug)]
pub(crate) struct CapturedState {
    pub log_tail: LogAddress,
    pub entry_count: u64,
    /// Every live entry with values resolved; standalone checkpoints only
    pub image: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Mutation count this capture took over from `pending_mutations`
    pub pending: u64,
}

/// An index rebuilt off to the side. The live index does not change until
/// [`LogEngine::install`] swaps it in.
#[derive(Debug, Default)]
pub(crate) struct StagedIndex {
    index: Index,
}

impl StagedIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Entries of a checkpoint image, values inline.
    pub(crate) fn from_image(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let mut index = Index::default();
        index.reserve(entries.len());
        for (key, value) in entries {
            index.insert(key, IndexEntry::Inline(value));
        }
        Self { index }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}

pub struct LogEngine {
    index: RwLock<Index>,
    log: Mutex<LogDevice>,
    objects: Mutex<ObjectDevice>,
    log_dir: Option<PathBuf>,
    object_dir: Option<PathBuf>,
    /// Bumped whenever the object log is reset; sessions drop cached handles
    object_epoch: AtomicU64,
    /// Mutations since the last durable checkpoint
    pending: AtomicU64,
    limits: EntryLimits,
    inline_value_limit: usize,
    next_session_id: AtomicU64,
    closed: AtomicBool,
}

impl LogEngine {
    /// Open file devices under `root` (`log/` and `objects/`). The index
    /// starts empty; the store rebuilds it from a checkpoint and the log.
    pub(crate) fn open_primary(root: &Path, config: &Config) -> HybridResult<Arc<Self>> {
        let log_dir = root.join("log");
        let object_dir = root.join("objects");
        let limits = EntryLimits { max_key_size: config.max_key_size, max_value_size: config.max_value_size };

        let log = LogWriter::open(&log_dir, config.log_segment_size, config.durable_writes, limits)?;
        let objects = ObjectLogWriter::open(&object_dir, config.object_segment_size, config.durable_writes)?;

        Ok(Arc::new(Self {
            index: RwLock::new(Index::default()),
            log: Mutex::new(LogDevice::File(log)),
            objects: Mutex::new(ObjectDevice::File(objects)),
            log_dir: Some(log_dir),
            object_dir: Some(object_dir),
            object_epoch: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            limits,
            inline_value_limit: config.inline_value_limit,
            next_session_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }

    /// An engine with null devices, populated by `load_image`.
    pub(crate) fn open_detached(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            index: RwLock::new(Index::default()),
            log: Mutex::new(LogDevice::Null),
            objects: Mutex::new(ObjectDevice::Null),
            log_dir: None,
            object_dir: None,
            object_epoch: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            limits: EntryLimits { max_key_size: config.max_key_size, max_value_size: config.max_value_size },
            inline_value_limit: config.inline_value_limit,
            next_session_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn new_session(self: &Arc<Self>) -> HybridResult<Session> {
        self.ensure_open()?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(session = id, "session created");
        Ok(Session {
            id,
            engine: Arc::clone(self),
            objects: self.object_dir.as_deref().map(ObjectLogReader::new),
            epoch: self.object_epoch.load(Ordering::Acquire),
        })
    }

    fn ensure_open(&self) -> HybridResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HybridError::Disposed);
        }
        Ok(())
    }

    /// Append to the log and update the index. `None` deletes.
    fn write(&self, key: &[u8], value: Option<&[u8]>) -> HybridResult<()> {
        self.ensure_open()?;
        self.limits.check(key, value.unwrap_or_default())?;

        let mut log = self.log.lock();
        let entry = match value {
            None => {
                log.append(key, &[], Operation::Delete)?;
                None
            }
            Some(value) if value.len() > self.inline_value_limit => match &mut *self.objects.lock() {
                ObjectDevice::File(objects) => {
                    let address = objects.append(key, value)?;
                    log.append(key, &address.to_bytes(), Operation::PutObject)?;
                    Some(IndexEntry::Object(address))
                }
                ObjectDevice::Null => {
                    log.append(key, value, Operation::Put)?;
                    Some(IndexEntry::Inline(value.to_vec()))
                }
            },
            Some(value) => {
                log.append(key, value, Operation::Put)?;
                Some(IndexEntry::Inline(value.to_vec()))
            }
        };

        let mut index = self.index.write();
        match entry {
            Some(entry) => {
                index.insert(key.to_vec(), entry);
            }
            None => {
                index.remove(key);
            }
        }
        drop(index);
        self.pending.fetch_add(1, Ordering::AcqRel);
        drop(log);
        Ok(())
    }

    /// Sync both logs and capture the tail. Callers serialize captures with
    /// `clear` and `install`.
    pub(crate) fn capture(&self, kind: CheckpointKind, take_pending: bool) -> HybridResult<CapturedState> {
        self.ensure_open()?;

        let (log_tail, entry_count, entries, pending) = {
            let log = self.log.lock();
            if let ObjectDevice::File(objects) = &*self.objects.lock() {
                objects.sync()?;
            }
            let log_tail = match &*log {
                LogDevice::File(writer) => {
                    writer.sync()?;
                    writer.tail()
                }
                LogDevice::Null => LogAddress::ZERO,
            };

            let index = self.index.read();
            let entries: Option<Vec<(Vec<u8>, IndexEntry)>> = match kind {
                CheckpointKind::Standalone => Some(index.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                CheckpointKind::FoldOver => None,
            };
            let pending = if take_pending { self.pending.swap(0, Ordering::AcqRel) } else { 0 };
            (log_tail, index.len() as u64, entries, pending)
        };

        let image = match entries {
            Some(entries) => match self.resolve(entries) {
                Ok(image) => Some(image),
                Err(e) => {
                    self.restore_pending(pending);
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(CapturedState { log_tail, entry_count, image, pending })
    }

    /// Hand back a pending count taken by a capture that did not complete.
    pub(crate) fn restore_pending(&self, pending: u64) {
        self.pending.fetch_add(pending, Ordering::AcqRel);
    }

    fn resolve(&self, entries: Vec<(Vec<u8>, IndexEntry)>) -> HybridResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut reader = self.object_dir.as_deref().map(ObjectLogReader::new);
        entries
            .into_iter()
            .map(|(key, entry)| {
                let value = resolve_entry(&key, entry, reader.as_mut())?;
                Ok((key, value))
            })
            .collect()
    }

    /// Replace the index with the entries of a checkpoint image.
    pub(crate) fn load_image(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        *self.index.write() = StagedIndex::from_image(entries).index;
    }

    /// Apply log records with `from <= address < to` to `staged`.
    pub(crate) fn replay(&self, staged: &mut StagedIndex, from: LogAddress, to: Option<LogAddress>) -> HybridResult<ReplayStats> {
        let Some(log_dir) = self.log_dir.as_deref() else {
            return Ok(ReplayStats { records: 0, skipped: 0, torn: false, end: from });
        };

        let index = &mut staged.index;
        LogReader::new(log_dir).replay(from, to, |address, record| {
            match record.operation {
                Operation::Put => {
                    index.insert(record.key, IndexEntry::Inline(record.value));
                }
                Operation::PutObject => match ObjectAddress::from_bytes(&record.value) {
                    Some(object) => {
                        index.insert(record.key, IndexEntry::Object(object));
                    }
                    None => {
                        tracing::warn!(%address, "object record with malformed address skipped");
                    }
                },
                Operation::Delete => {
                    index.remove(&record.key);
                }
            }
            Ok(())
        })
    }

    /// Cut the log at `cut`, then replace the live index with `staged`.
    ///
    /// The live index is untouched unless the cut succeeds. Later appends
    /// continue from `cut`.
    pub(crate) fn install(&self, staged: StagedIndex, cut: LogAddress, pending: u64) -> HybridResult<()> {
        self.ensure_open()?;
        let mut log = self.log.lock();
        if let LogDevice::File(writer) = &mut *log {
            writer.truncate_to(cut)?;
        }
        *self.index.write() = staged.index;
        self.pending.store(pending, Ordering::Release);
        drop(log);
        Ok(())
    }

    /// Drop all data: index, log and object log.
    pub(crate) fn clear(&self) -> HybridResult<()> {
        self.ensure_open()?;
        let mut log = self.log.lock();
        let mut objects = self.objects.lock();
        let mut index = self.index.write();

        if let LogDevice::File(writer) = &mut *log {
            writer.reset()?;
        }
        if let ObjectDevice::File(writer) = &mut *objects {
            writer.reset()?;
        }
        index.clear();
        self.object_epoch.fetch_add(1, Ordering::AcqRel);
        self.pending.store(0, Ordering::Release);
        Ok(())
    }

    /// Release devices and memory. Later operations fail with `Disposed`.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.log.lock() = LogDevice::Null;
        *self.objects.lock() = ObjectDevice::Null;
        self.index.write().clear();
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_mutations(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn log_tail(&self) -> Option<LogAddress> {
        match &*self.log.lock() {
            LogDevice::File(writer) => Some(writer.tail()),
            LogDevice::Null => None,
        }
    }
}

fn resolve_entry(key: &[u8], entry: IndexEntry, reader: Option<&mut ObjectLogReader>) -> HybridResult<Vec<u8>> {
    match (entry, reader) {
        (IndexEntry::Inline(value), _) => Ok(value),
        (IndexEntry::Object(address), Some(reader)) => reader.read(address, key),
        (IndexEntry::Object(address), None) => Err(HybridError::Recovery {
            token: None,
            reason: format!("object value at segment {} without an object log", address.segment),
        }),
    }
}

/// A client of one engine. Owns a cached object-log reader, so sessions are
/// pooled rather than created per operation.
pub struct Session {
    id: u64,
    engine: Arc<LogEngine>,
    objects: Option<ObjectLogReader>,
    epoch: u64,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drop cached handles if the object log was reset since last use.
    /// Called with the index read lock held.
    fn refresh(&mut self) {
        let epoch = self.engine.object_epoch.load(Ordering::Acquire);
        if epoch != self.epoch {
            if let Some(reader) = self.objects.as_mut() {
                reader.invalidate();
            }
            self.epoch = epoch;
        }
    }

    pub fn read(&mut self, key: &[u8]) -> HybridResult<Option<Vec<u8>>> {
        self.engine.ensure_open()?;
        let engine = Arc::clone(&self.engine);
        let index = engine.index.read();
        self.refresh();
        match index.get(key) {
            Some(entry) => resolve_entry(key, entry.clone(), self.objects.as_mut()).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&mut self, key: &[u8]) -> HybridResult<bool> {
        self.engine.ensure_open()?;
        Ok(self.engine.index.read().contains_key(key))
    }

    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> HybridResult<()> {
        self.engine.write(key, Some(value))
    }

    pub fn delete(&mut self, key: &[u8]) -> HybridResult<()> {
        self.engine.write(key, None)
    }

    /// Every live entry whose key passes `admit`, values resolved, in no
    /// particular order.
    pub fn scan<F>(&mut self, admit: F) -> HybridResult<Vec<(Vec<u8>, Vec<u8>)>>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.engine.ensure_open()?;
        let engine = Arc::clone(&self.engine);
        let index = engine.index.read();
        self.refresh();

        let mut out = Vec::new();
        for (key, entry) in index.iter() {
            if admit(key) {
                let value = resolve_entry(key, entry.clone(), self.objects.as_mut())?;
                out.push((key.clone(), value));
            }
        }
        Ok(out)
    }

    pub fn iterate(&mut self) -> HybridResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(|_| true)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::trace!(session = self.id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> Config {
        Config::default().with_inline_value_limit(64)
    }

    #[test]
    fn test_put_get_delete() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();

        session.upsert(b"hello", b"world").unwrap();
        assert_eq!(session.read(b"hello").unwrap(), Some(b"world".to_vec()));
        assert!(session.contains(b"hello").unwrap());

        session.delete(b"hello").unwrap();
        assert_eq!(session.read(b"hello").unwrap(), None);
        assert_eq!(engine.pending_mutations(), 2);
    }

    #[test]
    fn test_large_values_go_out_of_line() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();

        let big = vec![0xAB; 10_000];
        session.upsert(b"big", &big).unwrap();
        assert!(matches!(engine.index.read().get(&b"big"[..]), Some(IndexEntry::Object(_))));
        assert_eq!(session.read(b"big").unwrap(), Some(big));
    }

    #[test]
    fn test_replay_rebuilds_index() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
            let mut session = engine.new_session().unwrap();
            session.upsert(b"a", b"1").unwrap();
            session.upsert(b"b", &vec![2u8; 500]).unwrap();
            session.upsert(b"c", b"3").unwrap();
            session.delete(b"c").unwrap();
        }

        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut staged = StagedIndex::new();
        let stats = engine.replay(&mut staged, LogAddress::ZERO, None).unwrap();
        assert_eq!(stats.records, 4);
        assert_eq!(stats.end, engine.log_tail().unwrap());
        assert_eq!(staged.len(), 2);
        assert!(engine.is_empty());

        engine.install(staged, stats.end, stats.records).unwrap();
        assert_eq!(engine.pending_mutations(), 4);

        let mut session = engine.new_session().unwrap();
        assert_eq!(session.read(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(session.read(b"b").unwrap(), Some(vec![2u8; 500]));
        assert_eq!(session.read(b"c").unwrap(), None);
    }

    #[test]
    fn test_standalone_capture_resolves_objects() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();
        session.upsert(b"small", b"s").unwrap();
        session.upsert(b"large", &vec![9u8; 1000]).unwrap();

        let captured = engine.capture(CheckpointKind::Standalone, true).unwrap();
        assert_eq!(captured.entry_count, 2);
        assert_eq!(captured.pending, 2);
        assert_eq!(engine.pending_mutations(), 0);

        let mut image = captured.image.unwrap();
        image.sort();
        assert_eq!(image, vec![(b"large".to_vec(), vec![9u8; 1000]), (b"small".to_vec(), b"s".to_vec())]);

        let fold = engine.capture(CheckpointKind::FoldOver, false).unwrap();
        assert!(fold.image.is_none());
        assert_eq!(fold.log_tail, captured.log_tail);
    }

    #[test]
    fn test_detached_engine_keeps_values_inline() {
        let engine = LogEngine::open_detached(&config());
        engine.load_image(vec![(b"k".to_vec(), vec![1u8; 1000])]);
        let mut session = engine.new_session().unwrap();
        assert_eq!(session.read(b"k").unwrap(), Some(vec![1u8; 1000]));

        session.upsert(b"k2", &vec![2u8; 1000]).unwrap();
        assert!(matches!(engine.index.read().get(&b"k2"[..]), Some(IndexEntry::Inline(_))));
        assert_eq!(engine.log_tail(), None);
    }

    #[test]
    fn test_clear_invalidates_session_readers() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();
        session.upsert(b"x", &vec![1u8; 1000]).unwrap();
        assert!(session.read(b"x").unwrap().is_some());

        engine.clear().unwrap();
        assert!(engine.is_empty());
        assert_eq!(engine.log_tail(), Some(LogAddress::ZERO));

        session.upsert(b"y", &vec![2u8; 1000]).unwrap();
        assert_eq!(session.read(b"y").unwrap(), Some(vec![2u8; 1000]));
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();
        engine.close();
        assert!(matches!(session.read(b"k"), Err(HybridError::Disposed)));
        assert!(matches!(session.upsert(b"k", b"v"), Err(HybridError::Disposed)));
        assert!(matches!(engine.new_session(), Err(HybridError::Disposed)));
    }

    #[test]
    fn test_oversized_write_leaves_index_untouched() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();
        let key = vec![b'k'; config().max_key_size + 1];
        assert!(matches!(session.upsert(&key, b"v"), Err(HybridError::OversizedEntry { .. })));
        assert!(engine.is_empty());
        assert_eq!(engine.pending_mutations(), 0);
    }

    #[test]
    fn test_failed_install_keeps_live_index() {
        let tmp = TempDir::new().unwrap();
        let engine = LogEngine::open_primary(tmp.path(), &config()).unwrap();
        let mut session = engine.new_session().unwrap();
        session.upsert(b"live", b"1").unwrap();

        let staged = StagedIndex::from_image(vec![(b"other".to_vec(), b"2".to_vec())]);
        let beyond = LogAddress::new(0, 1 << 20);
        assert!(engine.install(staged, beyond, 0).is_err());

        assert_eq!(session.read(b"live").unwrap(), Some(b"1".to_vec()));
        assert_eq!(session.read(b"other").unwrap(), None);
        assert_eq!(engine.pending_mutations(), 1);
    }
}
