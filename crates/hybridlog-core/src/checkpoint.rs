//! Checkpoint tokens, descriptors and the on-disk checkpoint directory.
//!
//! Layout under the store root:
//!
//! ```text
//! checkpoints/
//!   <token>/
//!     index.img   (standalone checkpoints only)
//!     info.json   (written last; its presence marks the checkpoint complete)
//! ```
//!
//! `info.json` format:
//! ```json
//! {
//!   "token": "4b0c5a9e-1f1e-4d43-9f7a-0b7c3c1f0d2a",
//!   "version": 7,
//!   "kind": "fold_over",
//!   "created_at": "2026-10-19T11:30:00Z",
//!   "log_tail": { "segment": 0, "offset": 4096 },
//!   "entry_count": 12,
//!   "transient": false,
//!   "on_dispose": false,
//!   "format_version": 1
//! }
//! ```
//!
//! Image format: `MAGIC(4) + format_version u32 LE + entry_count u64 LE`,
//! then one data chunk per entry.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HybridError, HybridResult};
use crate::format::{decode_chunk_body, encode_chunk, DataChunkHeader, DATA_HEADER_SIZE, MAGIC_ARRAY};
use crate::log::LogAddress;
use crate::platform_durability::{durable_sync, sync_dir};

/// Current `info.json` and image format version
pub const CHECKPOINT_FORMAT_VERSION: u8 = 1;

const INFO_FILE: &str = "info.json";
const IMAGE_FILE: &str = "index.img";
const IMAGE_HEADER_SIZE: usize = 16;

/// Opaque identifier of a completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(Uuid);

impl CheckpointToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CheckpointToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for CheckpointToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What a checkpoint captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Flush the log and record its tail; recovery replays the log up to it.
    FoldOver,
    /// Flush the log and also write a full index image; recovery loads the
    /// image without touching the log before the tail.
    Standalone,
}

/// Descriptor persisted as `info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub token: CheckpointToken,
    /// Issued in increasing order; the highest version is the latest checkpoint
    pub version: u64,
    pub kind: CheckpointKind,
    pub created_at: DateTime<Utc>,
    /// Log address just past the last record the checkpoint covers
    pub log_tail: LogAddress,
    pub entry_count: u64,
    /// Taken to back a snapshot; never chosen for recovery on open
    #[serde(default)]
    pub transient: bool,
    /// Final checkpoint of a dispose; superseded by the next one
    #[serde(default)]
    pub on_dispose: bool,
    pub format_version: u8,
}

impl CheckpointInfo {
    pub fn to_json(&self) -> HybridResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| HybridError::Checkpoint {
            reason: format!("Failed to serialize checkpoint info: {}", e),
        })
    }

    pub fn from_json(json: &str) -> HybridResult<Self> {
        serde_json::from_str(json).map_err(|e| HybridError::Checkpoint {
            reason: format!("Failed to parse checkpoint info: {}", e),
        })
    }
}

/// The `checkpoints/` directory of a store.
///
/// Tracks the version counter and the set of tokens pinned by live snapshots.
/// Only `purge` removes a pinned checkpoint.
pub struct CheckpointDirectory {
    root: PathBuf,
    last_version: AtomicU64,
    pinned: Mutex<HashSet<CheckpointToken>>,
}

impl CheckpointDirectory {
    /// Open (creating if needed) and clean up leftovers from a previous run:
    /// directories without a readable `info.json` and transient checkpoints
    /// whose snapshot no longer exists.
    pub fn open(root: &Path) -> HybridResult<Self> {
        fs::create_dir_all(root).map_err(|e| HybridError::io_at(root, e, "Failed to create checkpoint directory"))?;

        let mut last_version = 0u64;
        for (dir, token) in scan_dirs(root)? {
            match read_info(&dir) {
                Ok(Some(info)) if !info.transient => {
                    last_version = last_version.max(info.version);
                }
                Ok(Some(info)) => {
                    tracing::debug!(token = %token, "removing orphaned snapshot checkpoint");
                    last_version = last_version.max(info.version);
                    remove_dir(&dir)?;
                }
                Ok(None) => {
                    tracing::warn!(token = %token, "removing incomplete checkpoint");
                    remove_dir(&dir)?;
                }
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "removing unreadable checkpoint");
                    remove_dir(&dir)?;
                }
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            last_version: AtomicU64::new(last_version),
            pinned: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, token: CheckpointToken) -> PathBuf {
        self.root.join(token.to_string())
    }

    /// Next version number. Never reissues a number within this process.
    pub fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// All complete checkpoints, oldest first.
    pub fn list(&self) -> HybridResult<Vec<CheckpointInfo>> {
        let mut infos = Vec::new();
        for (dir, _) in scan_dirs(&self.root)? {
            // Skip rather than fail: a concurrent purge may remove it mid-scan
            if let Ok(Some(info)) = read_info(&dir) {
                infos.push(info);
            }
        }
        infos.sort_by_key(|info| info.version);
        Ok(infos)
    }

    /// The checkpoint recovery on open starts from.
    pub fn latest(&self) -> HybridResult<Option<CheckpointInfo>> {
        Ok(self.list()?.into_iter().filter(|info| !info.transient).last())
    }

    pub fn load(&self, token: CheckpointToken) -> HybridResult<CheckpointInfo> {
        match read_info(&self.path(token))? {
            Some(info) => Ok(info),
            None => Err(HybridError::CheckpointNotFound { token }),
        }
    }

    /// Persist a checkpoint. The image (if any) is written first; `info.json`
    /// is renamed into place last so a crash leaves either a complete
    /// checkpoint or a directory `open` removes.
    pub fn write(&self, info: &CheckpointInfo, image: Option<&[(Vec<u8>, Vec<u8>)]>) -> HybridResult<()> {
        let dir = self.path(info.token);
        fs::create_dir_all(&dir).map_err(|e| HybridError::io_at(&dir, e, "Failed to create checkpoint"))?;

        if let Some(entries) = image {
            write_image(&dir.join(IMAGE_FILE), entries)?;
        }

        let json = info.to_json()?;
        let tmp = dir.join(format!("{}.tmp", INFO_FILE));
        {
            let mut file = File::create(&tmp).map_err(|e| HybridError::io_at(&tmp, e, "Failed to create checkpoint info"))?;
            file.write_all(json.as_bytes())
                .map_err(|e| HybridError::io_at(&tmp, e, "Failed to write checkpoint info"))?;
            durable_sync(&file).map_err(|e| HybridError::io_at(&tmp, e, "Failed to sync checkpoint info"))?;
        }
        let target = dir.join(INFO_FILE);
        fs::rename(&tmp, &target).map_err(|e| HybridError::io_at(&target, e, "Failed to publish checkpoint info"))?;

        sync_dir(&dir).map_err(|e| HybridError::io_at(&dir, e, "Failed to sync checkpoint"))?;
        sync_dir(&self.root).map_err(|e| HybridError::io_at(&self.root, e, "Failed to sync checkpoint directory"))
    }

    /// Load the index image of a standalone checkpoint.
    pub fn read_image(&self, token: CheckpointToken) -> HybridResult<Vec<(Vec<u8>, Vec<u8>)>> {
        read_image(&self.path(token).join(IMAGE_FILE))
    }

    /// Remove a checkpoint and drop any pin on it. Returns false if it was
    /// already gone.
    pub fn purge(&self, token: CheckpointToken) -> HybridResult<bool> {
        self.pinned.lock().remove(&token);
        let dir = self.path(token);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HybridError::io_at(&dir, e, "Failed to purge checkpoint")),
        }
    }

    /// Remove every checkpoint not pinned by a live snapshot.
    pub fn purge_unpinned(&self) -> HybridResult<usize> {
        let removed = self.purge_where(|_| true)?;
        sync_dir(&self.root).map_err(|e| HybridError::io_at(&self.root, e, "Failed to sync checkpoint directory"))?;
        Ok(removed)
    }

    /// Remove unpinned, non-transient checkpoints older than `version`.
    pub fn purge_older_than(&self, version: u64) -> HybridResult<usize> {
        self.purge_where(|info| !info.transient && info.version < version)
    }

    /// Remove unpinned dispose checkpoints older than `version`.
    pub fn purge_superseded_dispose(&self, version: u64) -> HybridResult<usize> {
        self.purge_where(|info| info.on_dispose && info.version < version)
    }

    /// Remove unpinned checkpoints newer than `version`.
    pub fn purge_newer_than(&self, version: u64) -> HybridResult<usize> {
        self.purge_where(|info| info.version > version)
    }

    fn purge_where(&self, select: impl Fn(&CheckpointInfo) -> bool) -> HybridResult<usize> {
        let mut removed = 0;
        for info in self.list()? {
            if select(&info) && !self.is_pinned(info.token) && self.purge(info.token)? {
                tracing::debug!(token = %info.token, version = info.version, "purged checkpoint");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn pin(&self, token: CheckpointToken) {
        self.pinned.lock().insert(token);
    }

    pub fn unpin(&self, token: CheckpointToken) {
        self.pinned.lock().remove(&token);
    }

    pub fn is_pinned(&self, token: CheckpointToken) -> bool {
        self.pinned.lock().contains(&token)
    }
}

/// Subdirectories named like tokens.
fn scan_dirs(root: &Path) -> HybridResult<Vec<(PathBuf, CheckpointToken)>> {
    let entries = fs::read_dir(root).map_err(|e| HybridError::io_at(root, e, "Failed to read checkpoint directory"))?;
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(token) = entry.file_name().to_str().and_then(|n| n.parse().ok()) else {
            continue;
        };
        dirs.push((path, token));
    }
    Ok(dirs)
}

/// `Ok(None)` when the directory has no `info.json`.
fn read_info(dir: &Path) -> HybridResult<Option<CheckpointInfo>> {
    let path = dir.join(INFO_FILE);
    match fs::read_to_string(&path) {
        Ok(json) => CheckpointInfo::from_json(&json).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HybridError::io_at(&path, e, "Failed to read checkpoint info")),
    }
}

fn remove_dir(dir: &Path) -> HybridResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HybridError::io_at(dir, e, "Failed to remove checkpoint")),
    }
}

/// Write an index image with the atomic rename pattern:
/// 1. Write all chunks to `index.img.tmp`
/// 2. durable_sync the temp file
/// 3. Rename over `index.img`
fn write_image(path: &Path, entries: &[(Vec<u8>, Vec<u8>)]) -> HybridResult<()> {
    let tmp = path.with_extension("img.tmp");
    let file = File::create(&tmp).map_err(|e| HybridError::io_at(&tmp, e, "Failed to create index image"))?;
    let mut writer = BufWriter::new(file);

    let mut header = [0u8; IMAGE_HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC_ARRAY);
    header[4..8].copy_from_slice(&(CHECKPOINT_FORMAT_VERSION as u32).to_le_bytes());
    header[8..16].copy_from_slice(&(entries.len() as u64).to_le_bytes());
    writer
        .write_all(&header)
        .map_err(|e| HybridError::io_at(&tmp, e, "Failed to write index image header"))?;

    for (key, value) in entries {
        writer
            .write_all(&encode_chunk(key, value, false))
            .map_err(|e| HybridError::io_at(&tmp, e, "Failed to write index image entry"))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| HybridError::io_at(&tmp, e.into_error(), "Failed to flush index image"))?;
    durable_sync(&file).map_err(|e| HybridError::io_at(&tmp, e, "Failed to sync index image"))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| HybridError::io_at(path, e, "Failed to publish index image"))
}

fn read_image(path: &Path) -> HybridResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let data = fs::read(path).map_err(|e| HybridError::io_at(path, e, "Failed to read index image"))?;

    let corrupted = |offset: usize, reason: String| HybridError::LogCorrupted {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason,
    };

    if data.len() < IMAGE_HEADER_SIZE || data[0..4] != MAGIC_ARRAY {
        return Err(corrupted(0, "missing index image header".to_string()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != CHECKPOINT_FORMAT_VERSION as u32 {
        return Err(corrupted(4, format!("unsupported index image version {}", version)));
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&data[8..16]);
    let count = u64::from_le_bytes(count_bytes);

    let mut entries = Vec::with_capacity(count.min(1 << 20) as usize);
    let mut offset = IMAGE_HEADER_SIZE;
    while offset < data.len() {
        if data.len() - offset < DATA_HEADER_SIZE {
            return Err(corrupted(offset, "truncated entry header".to_string()));
        }
        let mut header_bytes = [0u8; DATA_HEADER_SIZE];
        header_bytes.copy_from_slice(&data[offset..offset + DATA_HEADER_SIZE]);
        let header = DataChunkHeader::from_bytes(&header_bytes);

        let body_start = offset + DATA_HEADER_SIZE;
        let body_end = body_start + header.body_len();
        if body_end > data.len() {
            return Err(corrupted(offset, "truncated entry body".to_string()));
        }
        entries.push(decode_chunk_body(&header, &data[body_start..body_end], path, offset as u64)?);
        offset = body_end;
    }

    if entries.len() as u64 != count {
        return Err(corrupted(8, format!("index image holds {} entries, header says {}", entries.len(), count)));
    }
    Ok(entries)
}
