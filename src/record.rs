//! Binary layout of the records stored in log segments.
//!
//! ```text
//! +--------------+---------------+---------+-------------+---------------+-----+-------+
//! | checksum (8) | timestamp (8) | ttl (8) | key len (4) | value len (4) | key | value |
//! +--------------+---------------+---------+-------------+---------------+-----+-------+
//! ```
//!
//! All integers are little-endian. A record whose value is empty is a tombstone.

use std::io::Write;

use crate::error::{Error, Result};

/// The empty value marks a deleted key.
pub const TOMBSTONE: &[u8] = &[];

/// Fixed-size header that prefixes every record and hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// CRC32 of timestamp, ttl, key and value, zero-extended to 64 bits
    pub checksum: u64,
    /// Milliseconds since UNIX epoch when the record was written
    pub timestamp: u64,
    /// Expiry instant in milliseconds since UNIX epoch, `0` when the record never expires
    pub ttl: u64,
    /// Length of the key in bytes
    pub key_size: u32,
    /// Length of the value in bytes (0 for tombstones)
    pub value_size: u32,
}

impl Header {
    /// Size of the header in bytes, computed from its field types.
    pub const SIZE: usize = 3 * std::mem::size_of::<u64>() + 2 * std::mem::size_of::<u32>();

    pub fn new(checksum: u64, timestamp: u64, ttl: u64, key_size: u32, value_size: u32) -> Self {
        Self {
            checksum,
            timestamp,
            ttl,
            key_size,
            value_size,
        }
    }

    /// Whether the record carrying this header has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl > 0 && now > self.ttl
    }

    /// Number of bytes following the header in a data segment.
    pub fn body_size(&self) -> u64 {
        self.key_size as u64 + self.value_size as u64
    }

    /// Serializes the header to a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the write operations fail (`Error::Io`)
    pub fn serialize(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.write_all(&self.checksum.to_le_bytes())?;
        buffer.write_all(&self.timestamp.to_le_bytes())?;
        buffer.write_all(&self.ttl.to_le_bytes())?;
        buffer.write_all(&self.key_size.to_le_bytes())?;
        buffer.write_all(&self.value_size.to_le_bytes())?;
        Ok(())
    }

    /// Deserializes a header from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::TruncatedRecord` if the buffer is shorter than [`Header::SIZE`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::TruncatedRecord {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        Ok(Self {
            checksum: le_u64(&buf[0..8]),
            timestamp: le_u64(&buf[8..16]),
            ttl: le_u64(&buf[16..24]),
            key_size: le_u32(&buf[24..28]),
            value_size: le_u32(&buf[28..32]),
        })
    }
}

/// A single key-value entry of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: Header,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// Creates a record and computes its checksum.
    pub fn new(key: Vec<u8>, value: Vec<u8>, timestamp: u64, ttl: u64) -> Self {
        let header = Header::new(
            checksum(timestamp, ttl, &key, &value),
            timestamp,
            ttl,
            key.len() as u32,
            value.len() as u32,
        );
        Self { header, key, value }
    }

    /// Creates a tombstone record for `key`.
    pub fn tombstone(key: Vec<u8>, timestamp: u64) -> Self {
        Self::new(key, TOMBSTONE.to_vec(), timestamp, 0)
    }

    pub fn key_size(&self) -> usize {
        self.key.len()
    }

    pub fn value_size(&self) -> usize {
        self.value.len()
    }

    /// Total encoded size of the record.
    pub fn size(&self) -> usize {
        Header::SIZE + self.key_size() + self.value_size()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size());
        // Writing into a Vec cannot fail.
        let _ = self.header.serialize(&mut buffer);
        buffer.extend_from_slice(&self.key);
        buffer.extend_from_slice(&self.value);
        buffer
    }

    /// Decodes a record from the start of `buf`.
    ///
    /// The key and value sizes are read from the header and exactly that many bytes are
    /// extracted. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::TruncatedRecord` if `buf` holds fewer bytes than the header announces.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = Header::deserialize(buf)?;
        let expected = Header::SIZE + header.body_size() as usize;
        if buf.len() < expected {
            return Err(Error::TruncatedRecord {
                expected,
                actual: buf.len(),
            });
        }

        let key_end = Header::SIZE + header.key_size as usize;
        Ok(Self {
            header,
            key: buf[Header::SIZE..key_end].to_vec(),
            value: buf[key_end..expected].to_vec(),
        })
    }

    pub fn is_valid_checksum(&self) -> bool {
        self.header.checksum
            == checksum(self.header.timestamp, self.header.ttl, &self.key, &self.value)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value == TOMBSTONE
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.header.is_expired(now)
    }
}

/// CRC32 over `timestamp || ttl || key || value`.
pub fn checksum(timestamp: u64, ttl: u64, key: &[u8], value: &[u8]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&ttl.to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize() as u64
}

/// Gets current timestamp as milliseconds since UNIX epoch.
///
/// # Errors
///
/// Returns an error if:
/// * System time operations fail (`Error::TimestampError`)
/// * Milliseconds value doesn't fit in u64 (`Error::TimestampOverflow`)
pub fn timestamp_as_u64() -> Result<u64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(Error::TimestampError)?
        .as_millis()
        .try_into()
        .map_err(Error::TimestampOverflow)
}

pub(crate) fn le_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

pub(crate) fn le_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}
