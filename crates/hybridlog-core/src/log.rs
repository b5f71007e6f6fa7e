//! Hybrid log: the append-only primary log of a store.
//!
//! Every mutation is appended here before the index reflects it. The log is
//! split into segment files `log-{seq:016x}.hlog`; a position in the log is a
//! `LogAddress { segment, offset }`. Checkpoints record the log tail, and
//! recovery replays the records between two addresses.
//!
//! Appends reach the OS page cache immediately. They reach persistent storage
//! at the next `sync()` (every checkpoint) or, with `durable`, after every
//! append.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HybridError, HybridResult};
use crate::format::{
    decode_record, encode_record, find_next_magic, record_size, EntryLimits, LogRecord,
    Operation, MAGIC_ARRAY,
};
use crate::platform_durability::{durable_sync, sync_dir};

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".hlog";

/// Position in the hybrid log. Ordered by segment, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogAddress {
    pub segment: u64,
    pub offset: u64,
}

impl LogAddress {
    pub const ZERO: LogAddress = LogAddress { segment: 0, offset: 0 };

    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl std::fmt::Display for LogAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

pub(crate) fn segment_path(log_dir: &Path, sequence: u64) -> PathBuf {
    log_dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX))
}

/// All segments in `dir` with the given prefix, sorted by sequence number.
pub(crate) fn list_segments(dir: &Path, prefix: &str) -> HybridResult<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HybridError::io_at(dir, e, "Failed to read segment directory")),
    };

    let mut segments = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(hex) = name.strip_prefix(prefix).and_then(|n| n.strip_suffix(SEGMENT_SUFFIX)) {
            if let Ok(seq) = u64::from_str_radix(hex, 16) {
                segments.push((seq, entry.path()));
            }
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Appends records to the current log segment, rotating as segments fill.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    /// Current segment size in bytes (tracked to avoid stat calls)
    size: u64,
    log_dir: PathBuf,
    sequence: u64,
    segment_size: u64,
    durable: bool,
    limits: EntryLimits,
    /// Set when a partial append could not be rolled back
    poisoned: bool,
}

impl LogWriter {
    /// Open the log in `log_dir`, resuming at the end of the highest segment.
    pub fn open(log_dir: &Path, segment_size: u64, durable: bool, limits: EntryLimits) -> HybridResult<Self> {
        fs::create_dir_all(log_dir)
            .map_err(|e| HybridError::io_at(log_dir, e, "Failed to create log directory"))?;

        let sequence = list_segments(log_dir, SEGMENT_PREFIX)?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(0);
        let (file, path, size) = open_segment(log_dir, sequence)?;

        Ok(Self {
            file,
            path,
            size,
            log_dir: log_dir.to_path_buf(),
            sequence,
            segment_size,
            durable,
            limits,
            poisoned: false,
        })
    }

    /// Append one record and return the address it starts at.
    ///
    /// The encoded record is validated against the size limits before any
    /// byte is written.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: Operation) -> HybridResult<LogAddress> {
        let bytes = encode_record(key, value, op, &self.limits)?;

        if self.poisoned {
            return Err(HybridError::LogCorrupted {
                path: self.path.clone(),
                offset: self.size,
                reason: "an earlier partial append could not be rolled back".to_string(),
            });
        }

        if self.size > 0 && self.size + bytes.len() as u64 > self.segment_size {
            self.rotate()?;
        }

        let address = self.tail();
        if let Err(e) = self.file.write_all(&bytes) {
            self.discard_partial()?;
            return Err(HybridError::io_at(&self.path, e, "Log append failed"));
        }
        self.size += bytes.len() as u64;

        if self.durable {
            self.sync()?;
        }
        Ok(address)
    }

    /// Cut the segment back to the last complete record, dropping whatever a
    /// failed write left behind. If that fails the writer refuses further
    /// appends.
    fn discard_partial(&mut self) -> HybridResult<()> {
        if let Err(e) = self.file.set_len(self.size) {
            self.poisoned = true;
            return Err(HybridError::io_at(&self.path, e, "Failed to roll back partial log append"));
        }
        Ok(())
    }

    /// Address the next record will be written at.
    pub fn tail(&self) -> LogAddress {
        LogAddress::new(self.sequence, self.size)
    }

    /// Sync the current segment to persistent storage.
    pub fn sync(&self) -> HybridResult<()> {
        durable_sync(&self.file).map_err(|e| HybridError::io_at(&self.path, e, "Log durable_sync failed"))
    }

    /// Discard everything at or after `address` and continue appending there.
    ///
    /// The segment holding `address` must exist and be at least `address.offset`
    /// long, unless the address is the start of a segment.
    pub fn truncate_to(&mut self, address: LogAddress) -> HybridResult<()> {
        if address == self.tail() {
            return Ok(());
        }

        // Validate before touching any file
        let path = segment_path(&self.log_dir, address.segment);
        let existing = fs::metadata(&path).map(|m| m.len()).ok();
        match existing {
            Some(len) if len >= address.offset => {}
            None if address.offset == 0 => {}
            _ => {
                return Err(HybridError::LogCorrupted {
                    path,
                    offset: existing.unwrap_or(0),
                    reason: format!("log ends before address {}", address),
                });
            }
        }

        for (seq, path) in list_segments(&self.log_dir, SEGMENT_PREFIX)? {
            if seq > address.segment {
                fs::remove_file(&path)
                    .map_err(|e| HybridError::io_at(&path, e, "Failed to remove log segment"))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| HybridError::io_at(&path, e, "Failed to open log segment for truncation"))?;
        file.set_len(address.offset)
            .map_err(|e| HybridError::io_at(&path, e, "Failed to truncate log segment"))?;
        durable_sync(&file).map_err(|e| HybridError::io_at(&path, e, "Log durable_sync failed"))?;
        drop(file);
        sync_dir(&self.log_dir).map_err(|e| HybridError::io_at(&self.log_dir, e, "Failed to sync log directory"))?;

        let (file, path, size) = open_segment(&self.log_dir, address.segment)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence = address.segment;
        self.poisoned = false;
        Ok(())
    }

    /// Delete every segment and start again at `LogAddress::ZERO`.
    pub fn reset(&mut self) -> HybridResult<()> {
        for (_, path) in list_segments(&self.log_dir, SEGMENT_PREFIX)? {
            fs::remove_file(&path).map_err(|e| HybridError::io_at(&path, e, "Failed to remove log segment"))?;
        }
        let (file, path, size) = open_segment(&self.log_dir, 0)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence = 0;
        self.poisoned = false;
        sync_dir(&self.log_dir).map_err(|e| HybridError::io_at(&self.log_dir, e, "Failed to sync log directory"))
    }

    /// Rotate to a new segment. Syncs the current one before switching.
    fn rotate(&mut self) -> HybridResult<()> {
        self.sync()?;
        let (file, path, size) = open_segment(&self.log_dir, self.sequence + 1)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence += 1;
        Ok(())
    }

    /// Current segment path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }
}

fn open_segment(log_dir: &Path, sequence: u64) -> HybridResult<(File, PathBuf, u64)> {
    let path = segment_path(log_dir, sequence);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| HybridError::io_at(&path, e, "Failed to open log segment"))?;
    let size = file
        .metadata()
        .map_err(|e| HybridError::io_at(&path, e, "Failed to stat log segment"))?
        .len();
    Ok((file, path, size))
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records handed to the visitor
    pub records: u64,
    /// Corrupted records skipped by resynchronising on the next magic
    pub skipped: u64,
    /// A partial record was found at the end of a segment
    pub torn: bool,
    /// Address just past the last valid record visited
    pub end: LogAddress,
}

/// Replays records from the log segments of a directory.
pub struct LogReader {
    log_dir: PathBuf,
}

impl LogReader {
    pub fn new(log_dir: &Path) -> Self {
        Self { log_dir: log_dir.to_path_buf() }
    }

    /// Visit every valid record with `from <= address < to` in log order.
    ///
    /// Per segment:
    /// 1. Check the magic at the current offset
    /// 2. Check the record fits in the remaining bytes
    /// 3. Decode and verify the CRC32C
    /// 4. On corruption, resync on the next magic
    /// 5. On a torn record, stop the whole replay
    ///
    /// Nothing after a torn record is visited, even in later segments, so
    /// `end` is always a point the log can be cut at.
    pub fn replay<F>(&self, from: LogAddress, to: Option<LogAddress>, mut visit: F) -> HybridResult<ReplayStats>
    where
        F: FnMut(LogAddress, LogRecord) -> HybridResult<()>,
    {
        let mut stats = ReplayStats { records: 0, skipped: 0, torn: false, end: from };

        for (seq, path) in list_segments(&self.log_dir, SEGMENT_PREFIX)? {
            if seq < from.segment {
                continue;
            }
            if let Some(to) = to {
                if seq > to.segment {
                    break;
                }
            }

            let buffer = read_segment(&path)?;
            let mut offset = if seq == from.segment { from.offset as usize } else { 0 };

            while offset < buffer.len() {
                let address = LogAddress::new(seq, offset as u64);
                if to.map_or(false, |to| address >= to) {
                    return Ok(stats);
                }

                let remaining = &buffer[offset..];
                if remaining.len() >= 4 && remaining[..4] != MAGIC_ARRAY {
                    tracing::warn!(segment = seq, offset, "bad magic in log, scanning for next record");
                    stats.skipped += 1;
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }

                let size = match record_size(remaining) {
                    Some(size) if size <= remaining.len() => size,
                    _ => {
                        tracing::warn!(
                            segment = seq,
                            offset,
                            available = remaining.len(),
                            "torn record at end of log segment"
                        );
                        stats.torn = true;
                        return Ok(stats);
                    }
                };

                match decode_record(&remaining[..size], &path, offset as u64) {
                    Ok(record) => {
                        visit(address, record)?;
                        offset += size;
                        stats.records += 1;
                        stats.end = LogAddress::new(seq, offset as u64);
                    }
                    Err(e) => {
                        tracing::warn!(segment = seq, offset, error = %e, "corrupt log record skipped");
                        stats.skipped += 1;
                        match find_next_magic(&buffer, offset + 1) {
                            Some(next) => { offset = next; continue; }
                            None => break,
                        }
                    }
                }
            }
        }

        Ok(stats)
    }
}

fn read_segment(path: &Path) -> HybridResult<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| HybridError::io_at(path, e, "Failed to open log segment for replay"))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| HybridError::io_at(path, e, "Failed to read log segment"))?;
    Ok(buffer)
}
