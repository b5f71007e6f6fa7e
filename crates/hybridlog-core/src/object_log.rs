//! Object log: out-of-line storage for large values.
//!
//! Values longer than `Config::inline_value_limit` are appended here as data
//! chunks and the primary log records only their `ObjectAddress`. Segments are
//! `obj-{seq:016x}.hlog`. Each chunk carries the key as well as the value, so a
//! reader can confirm the address still belongs to the key it was looked up
//! under.
//!
//! File format: DataChunkHeader (24 bytes) + key_bytes + value_bytes

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::error::{HybridError, HybridResult};
use crate::format::{decode_chunk_body, encode_chunk, DataChunkHeader, ObjectAddress, DATA_HEADER_SIZE};
use crate::log::list_segments;
use crate::platform_durability::{durable_sync, sync_dir};

const SEGMENT_PREFIX: &str = "obj-";

pub(crate) fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{}{:016x}.hlog", SEGMENT_PREFIX, sequence))
}

/// Appends large values to object log segments.
pub struct ObjectLogWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    sequence: u64,
    segment_size: u64,
    durable: bool,
    poisoned: bool,
}

impl ObjectLogWriter {
    /// Open the object log in `dir`, resuming at the end of the highest segment.
    pub fn open(dir: &Path, segment_size: u64, durable: bool) -> HybridResult<Self> {
        fs::create_dir_all(dir).map_err(|e| HybridError::io_at(dir, e, "Failed to create object log directory"))?;

        let sequence = list_segments(dir, SEGMENT_PREFIX)?
            .last()
            .map(|(seq, _)| *seq)
            .unwrap_or(0);
        let (file, path, size) = open_segment(dir, sequence)?;

        Ok(Self {
            file,
            path,
            size,
            dir: dir.to_path_buf(),
            sequence,
            segment_size,
            durable,
            poisoned: false,
        })
    }

    /// Append a value. Sizes are validated by the caller against the store
    /// limits before anything reaches the log.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> HybridResult<ObjectAddress> {
        let chunk = encode_chunk(key, value, false);

        if self.poisoned {
            return Err(HybridError::LogCorrupted {
                path: self.path.clone(),
                offset: self.size,
                reason: "an earlier partial object write could not be rolled back".to_string(),
            });
        }

        if self.size > 0 && self.size + chunk.len() as u64 > self.segment_size {
            self.rotate()?;
        }

        let address = ObjectAddress { segment: self.sequence, offset: self.size, len: value.len() as u32 };
        if let Err(e) = self.file.write_all(&chunk) {
            self.discard_partial()?;
            return Err(HybridError::io_at(&self.path, e, "Object log write failed"));
        }
        self.size += chunk.len() as u64;

        if self.durable {
            self.sync()?;
        }
        Ok(address)
    }

    pub fn sync(&self) -> HybridResult<()> {
        durable_sync(&self.file).map_err(|e| HybridError::io_at(&self.path, e, "Object log durable_sync failed"))
    }

    /// Drop the bytes of a failed write so the next chunk starts at `size`.
    fn discard_partial(&mut self) -> HybridResult<()> {
        if let Err(e) = self.file.set_len(self.size) {
            self.poisoned = true;
            return Err(HybridError::io_at(&self.path, e, "Failed to roll back partial object write"));
        }
        Ok(())
    }

    /// Delete every segment and start again at segment 0.
    pub fn reset(&mut self) -> HybridResult<()> {
        for (_, path) in list_segments(&self.dir, SEGMENT_PREFIX)? {
            fs::remove_file(&path).map_err(|e| HybridError::io_at(&path, e, "Failed to remove object segment"))?;
        }
        let (file, path, size) = open_segment(&self.dir, 0)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence = 0;
        self.poisoned = false;
        sync_dir(&self.dir).map_err(|e| HybridError::io_at(&self.dir, e, "Failed to sync object log directory"))
    }

    fn rotate(&mut self) -> HybridResult<()> {
        self.sync()?;
        let (file, path, size) = open_segment(&self.dir, self.sequence + 1)?;
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence += 1;
        Ok(())
    }
}

fn open_segment(dir: &Path, sequence: u64) -> HybridResult<(File, PathBuf, u64)> {
    let path = segment_path(dir, sequence);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| HybridError::io_at(&path, e, "Failed to open object segment"))?;
    let size = file
        .metadata()
        .map_err(|e| HybridError::io_at(&path, e, "Failed to stat object segment"))?
        .len();
    Ok((file, path, size))
}

/// Reads values back from the object log with CRC32C verification.
///
/// Keeps one open handle per segment it has touched. Not shared: each session
/// owns its own reader.
pub struct ObjectLogReader {
    dir: PathBuf,
    handles: HashMap<u64, File>,
}

impl ObjectLogReader {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), handles: HashMap::new() }
    }

    /// Drop cached handles. Required after the object log is reset, since an
    /// open handle keeps reading the unlinked file.
    pub fn invalidate(&mut self) {
        self.handles.clear();
    }

    /// Read the value stored at `address` for `key`.
    pub fn read(&mut self, address: ObjectAddress, key: &[u8]) -> HybridResult<Vec<u8>> {
        let path = segment_path(&self.dir, address.segment);
        let file = match self.handles.entry(address.segment) {
            hashbrown::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                let file = File::open(&path)
                    .map_err(|e| HybridError::io_at(&path, e, "Failed to open object segment for read"))?;
                slot.insert(file)
            }
        };

        file.seek(SeekFrom::Start(address.offset))
            .map_err(|e| HybridError::io_at(&path, e, "Failed to seek object segment"))?;

        let mut header_bytes = [0u8; DATA_HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| {
            HybridError::io_at(&path, e, &format!("Failed to read object header at offset {}", address.offset))
        })?;
        let header = DataChunkHeader::from_bytes(&header_bytes);

        if header.is_tombstone() || header.value_len != address.len || header.key_len as usize != key.len() {
            return Err(HybridError::LogCorrupted {
                path,
                offset: address.offset,
                reason: format!(
                    "object chunk does not match address (key_len {}, value_len {}, expected {})",
                    header.key_len, header.value_len, address.len
                ),
            });
        }

        let mut body = vec![0u8; header.body_len()];
        file.read_exact(&mut body).map_err(|e| {
            HybridError::io_at(&path, e, &format!("Failed to read object body at offset {}", address.offset))
        })?;

        let (stored_key, value) = decode_chunk_body(&header, &body, &path, address.offset)?;
        if stored_key != key {
            return Err(HybridError::LogCorrupted {
                path,
                offset: address.offset,
                reason: "object chunk belongs to a different key".to_string(),
            });
        }
        Ok(value)
    }
}
