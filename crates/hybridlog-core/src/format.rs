//! Binary format definitions for HybridLog files
//!
//! Log records:
//! RecordHeader (32 bytes) + key_len(u16) + value_len(u32) + operation(u8) + padding(u8) + key_bytes + value_bytes
//!
//! Data chunks (object log and checkpoint images):
//! DataChunkHeader (24 bytes) + key_bytes + value_bytes

use std::path::Path;

use crate::error::{HybridError, HybridResult};

/// Magic bytes opening every record and chunk: "HLOG"
pub const MAGIC_ARRAY: [u8; 4] = [0x48, 0x4C, 0x4F, 0x47];

/// Log record header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed payload prefix: key_len(2) + value_len(4) + op(1) + pad(1)
pub const PAYLOAD_PREFIX_SIZE: usize = 8;

/// Data chunk header size in bytes
pub const DATA_HEADER_SIZE: usize = 24;

/// Tombstone flag in the data chunk flags byte
pub const FLAG_TOMBSTONE: u8 = 0x01;

/// Size of an encoded `ObjectAddress`
pub const OBJECT_ADDRESS_SIZE: usize = 20;

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update with the value inline
    Put = 1,
    /// Delete a key
    Delete = 2,
    /// Insert or update; the value is an encoded `ObjectAddress`
    PutObject = 3,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::PutObject),
            _ => None,
        }
    }
}

/// Size limits enforced before any record is encoded.
#[derive(Debug, Clone, Copy)]
pub struct EntryLimits {
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl EntryLimits {
    pub fn check(&self, key: &[u8], value: &[u8]) -> HybridResult<()> {
        if key.len() > self.max_key_size {
            return Err(HybridError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.max_key_size as u64,
                component: "key".to_string(),
            });
        }
        if value.len() > self.max_value_size {
            return Err(HybridError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.max_value_size as u64,
                component: "value".to_string(),
            });
        }
        Ok(())
    }
}

/// Fixed-size header for each log record
///
/// Layout:
///   [0..4]   magic:      [u8;4] - "HLOG"
///   [4..8]   length:     u32    - payload length in bytes
///   [8..12]  checksum:   u32    - CRC32C of payload bytes
///   [12]     entry_type: u8     - operation type
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
}

impl RecordHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self { magic: MAGIC_ARRAY, length, checksum, entry_type: entry_type as u8 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
}

/// Encode a record. `value` must be empty for `Delete`.
pub fn encode_record(key: &[u8], value: &[u8], op: Operation, limits: &EntryLimits) -> HybridResult<Vec<u8>> {
    // Validate before allocating
    limits.check(key, value)?;

    let payload_size = PAYLOAD_PREFIX_SIZE + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.resize(HEADER_SIZE, 0);

    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.push(op as u8);
    buffer.push(0);
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let checksum = crc32c::crc32c(&buffer[HEADER_SIZE..]);
    let header = RecordHeader::new(payload_size as u32, checksum, op);
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    Ok(buffer)
}

/// Decode one record from the start of `data`. `path` and `offset` only
/// feed error context.
pub fn decode_record(data: &[u8], path: &Path, offset: u64) -> HybridResult<LogRecord> {
    if data.len() < HEADER_SIZE {
        return Err(HybridError::TornWrite {
            path: path.to_path_buf(),
            expected_size: HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset,
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(HybridError::NoMagicFound {
            path: path.to_path_buf(),
            offset,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(HybridError::TornWrite {
            path: path.to_path_buf(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(HybridError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual: computed,
            offset,
        });
    }

    if payload.len() < PAYLOAD_PREFIX_SIZE {
        return Err(HybridError::LogCorrupted {
            path: path.to_path_buf(),
            offset,
            reason: "Payload too short for record fields".to_string(),
        });
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let operation = Operation::from_byte(payload[6]).ok_or_else(|| HybridError::LogCorrupted {
        path: path.to_path_buf(),
        offset,
        reason: format!("Invalid operation type: {}", payload[6]),
    })?;

    let key_end = PAYLOAD_PREFIX_SIZE + key_len;
    let value_end = key_end + value_len;
    if payload.len() != value_end {
        return Err(HybridError::LogCorrupted {
            path: path.to_path_buf(),
            offset,
            reason: format!(
                "Payload is {} bytes, fields need {} for key({}) + value({})",
                payload.len(), value_end, key_len, value_len
            ),
        });
    }

    Ok(LogRecord {
        key: payload[PAYLOAD_PREFIX_SIZE..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
        operation,
    })
}

/// Total encoded size of the record whose header starts `data`, if the
/// header is present and carries the magic.
pub fn record_size(data: &[u8]) -> Option<usize> {
    if data.len() < 8 || data[0..4] != MAGIC_ARRAY {
        return None;
    }
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    Some(HEADER_SIZE + length)
}

/// Scan forward for the next magic. Used to resync after corruption.
pub fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    (start..=buffer.len() - 4).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}

/// Data chunk header for object log values and checkpoint image entries.
///
/// Layout:
///   [0..4]   magic:     [u8;4] - "HLOG"
///   [4..6]   key_len:   u16 LE
///   [6..10]  value_len: u32 LE
///   [10..14] checksum:  u32 LE - CRC32C of (key_bytes + value_bytes)
///   [14]     flags:     u8     - bit 0 = tombstone
///   [15..24] reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunkHeader {
    pub magic: [u8; 4],
    pub key_len: u16,
    pub value_len: u32,
    pub checksum: u32,
    pub flags: u8,
}

impl DataChunkHeader {
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.key_len.to_le_bytes());
        buf[6..10].copy_from_slice(&self.value_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.checksum.to_le_bytes());
        buf[14] = self.flags;
        buf
    }

    pub fn from_bytes(buf: &[u8; DATA_HEADER_SIZE]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            key_len: u16::from_le_bytes([buf[4], buf[5]]),
            value_len: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            checksum: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
            flags: buf[14],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        (self.flags & FLAG_TOMBSTONE) != 0
    }

    pub fn body_len(&self) -> usize {
        self.key_len as usize + self.value_len as usize
    }
}

fn chunk_checksum(key: &[u8], value: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(key), value)
}

/// Encode a data chunk. Callers validate sizes first.
pub fn encode_chunk(key: &[u8], value: &[u8], tombstone: bool) -> Vec<u8> {
    let header = DataChunkHeader {
        magic: MAGIC_ARRAY,
        key_len: key.len() as u16,
        value_len: value.len() as u32,
        checksum: chunk_checksum(key, value),
        flags: if tombstone { FLAG_TOMBSTONE } else { 0 },
    };
    let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + key.len() + value.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

/// Verify a chunk body against its header and split it into (key, value).
pub fn decode_chunk_body(
    header: &DataChunkHeader,
    body: &[u8],
    path: &Path,
    offset: u64,
) -> HybridResult<(Vec<u8>, Vec<u8>)> {
    if header.magic != MAGIC_ARRAY {
        return Err(HybridError::NoMagicFound {
            path: path.to_path_buf(),
            offset,
            found_bytes: header.magic,
        });
    }
    if body.len() != header.body_len() {
        return Err(HybridError::TornWrite {
            path: path.to_path_buf(),
            expected_size: header.body_len() as u32,
            available_bytes: body.len() as u64,
            offset,
        });
    }
    let (key, value) = body.split_at(header.key_len as usize);
    let computed = chunk_checksum(key, value);
    if computed != header.checksum {
        return Err(HybridError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum,
            actual: computed,
            offset,
        });
    }
    Ok((key.to_vec(), value.to_vec()))
}

/// Location of a value in the object log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectAddress {
    pub segment: u64,
    /// Offset of the chunk header
    pub offset: u64,
    /// Value length
    pub len: u32,
}

impl ObjectAddress {
    pub fn to_bytes(&self) -> [u8; OBJECT_ADDRESS_SIZE] {
        let mut buf = [0u8; OBJECT_ADDRESS_SIZE];
        buf[0..8].copy_from_slice(&self.segment.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OBJECT_ADDRESS_SIZE {
            return None;
        }
        let mut segment = [0u8; 8];
        let mut offset = [0u8; 8];
        let mut len = [0u8; 4];
        segment.copy_from_slice(&bytes[0..8]);
        offset.copy_from_slice(&bytes[8..16]);
        len.copy_from_slice(&bytes[16..20]);
        Some(Self {
            segment: u64::from_le_bytes(segment),
            offset: u64::from_le_bytes(offset),
            len: u32::from_le_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> EntryLimits {
        EntryLimits { max_key_size: 128, max_value_size: 1024 }
    }

    fn here() -> &'static Path {
        Path::new("<buffer>")
    }

    #[test]
    fn test_record_roundtrip() {
        let encoded = encode_record(b"test_key", b"test_value_data", Operation::Put, &limits()).unwrap();
        assert_eq!(record_size(&encoded), Some(encoded.len()));

        let record = decode_record(&encoded, here(), 0).unwrap();
        assert_eq!(record.key, b"test_key");
        assert_eq!(record.value, b"test_value_data");
        assert_eq!(record.operation, Operation::Put);
    }

    #[test]
    fn test_delete_record_has_empty_value() {
        let encoded = encode_record(b"delete_me", b"", Operation::Delete, &limits()).unwrap();
        let record = decode_record(&encoded, here(), 0).unwrap();
        assert_eq!(record.operation, Operation::Delete);
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; 129];
        let result = encode_record(&key, b"val", Operation::Put, &limits());
        assert!(matches!(result, Err(HybridError::OversizedEntry { component, .. }) if component == "key"));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let value = vec![0u8; 1025];
        let result = encode_record(b"k", &value, Operation::Put, &limits());
        assert!(matches!(result, Err(HybridError::OversizedEntry { component, .. }) if component == "value"));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = encode_record(b"key", b"value", Operation::Put, &limits()).unwrap();
        data[0] = 0xFF;
        assert!(matches!(decode_record(&data, here(), 0), Err(HybridError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_record(b"key", b"value", Operation::Put, &limits()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_record(&data, here(), 0), Err(HybridError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let data = encode_record(b"key", b"value", Operation::Put, &limits()).unwrap();
        let torn = &data[..data.len() - 2];
        assert!(matches!(decode_record(torn, here(), 0), Err(HybridError::TornWrite { .. })));
    }

    #[test]
    fn test_find_next_magic() {
        let mut buf = vec![0u8; 10];
        buf.extend_from_slice(&MAGIC_ARRAY);
        assert_eq!(find_next_magic(&buf, 0), Some(10));
        assert_eq!(find_next_magic(&buf, 11), None);
        assert_eq!(find_next_magic(&[0u8; 2], 0), None);
    }

    #[test]
    fn test_chunk_checksum_covers_key_and_value() {
        let chunk = encode_chunk(b"k", b"v", false);
        let mut hdr = [0u8; DATA_HEADER_SIZE];
        hdr.copy_from_slice(&chunk[..DATA_HEADER_SIZE]);
        let header = DataChunkHeader::from_bytes(&hdr);
        assert!(!header.is_tombstone());

        let (k, v) = decode_chunk_body(&header, &chunk[DATA_HEADER_SIZE..], here(), 0).unwrap();
        assert_eq!((k.as_slice(), v.as_slice()), (&b"k"[..], &b"v"[..]));

        let mut bad = chunk[DATA_HEADER_SIZE..].to_vec();
        bad[1] ^= 0x01;
        assert!(matches!(
            decode_chunk_body(&header, &bad, here(), 0),
            Err(HybridError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_object_address_encoding() {
        let addr = ObjectAddress { segment: 3, offset: 4096, len: 70_000 };
        assert_eq!(ObjectAddress::from_bytes(&addr.to_bytes()), Some(addr));
        assert_eq!(ObjectAddress::from_bytes(&[0u8; 4]), None);
    }
}
