//! Hint segments: compact summaries of a data segment.
//!
//! A hint stores the record header and the position of the value inside the data segment,
//! but not the value itself, so the keydir can be rebuilt without reading values.
//!
//! ```text
//! +-------------+--------------------+-----+
//! | header (32) | value position (8) | key |
//! +-------------+--------------------+-----+
//! ```
//!
//! Hint segments are written to `<n>.hint.partial` and renamed to `<n>.hint` once complete,
//! so a crash never leaves a half-written hint file under the name recovery looks for.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};
use crate::naming::{with_suffix, PARTIAL_SUFFIX};
use crate::record::{le_u64, Header, Record};
use crate::segment::rename_file;

/// Location summary of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub header: Header,
    pub value_position: u64,
    pub key: Vec<u8>,
}

impl Hint {
    /// Size of the fixed part of a hint.
    pub const FIXED_SIZE: usize = Header::SIZE + std::mem::size_of::<u64>();

    /// Builds the hint of `record` whose value starts at `value_position`.
    pub fn of(record: &Record, value_position: u64) -> Self {
        Self {
            header: record.header,
            value_position,
            key: record.key.clone(),
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_SIZE + self.key.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.size());
        let _ = self.header.serialize(&mut buffer);
        buffer.extend_from_slice(&self.value_position.to_le_bytes());
        buffer.extend_from_slice(&self.key);
        buffer
    }

    /// # Errors
    ///
    /// Returns `Error::TruncatedRecord` if `buf` is shorter than the hint it announces.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::TruncatedRecord {
                expected: Self::FIXED_SIZE,
                actual: buf.len(),
            });
        }
        let header = Header::deserialize(buf)?;
        let expected = Self::FIXED_SIZE + header.key_size as usize;
        if buf.len() < expected {
            return Err(Error::TruncatedRecord {
                expected,
                actual: buf.len(),
            });
        }

        Ok(Self {
            header,
            value_position: le_u64(&buf[Header::SIZE..Self::FIXED_SIZE]),
            key: buf[Self::FIXED_SIZE..expected].to_vec(),
        })
    }
}

/// Writer side of a hint segment.
#[derive(Debug)]
pub struct HintSegment {
    partial_path: PathBuf,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl HintSegment {
    /// Creates `<path>.partial`, truncating any leftover from an interrupted run.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let partial_path = with_suffix(&path, PARTIAL_SUFFIX);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial_path)
            .map_err(|e| Error::write(partial_path.display().to_string(), e))?;

        Ok(Self {
            partial_path,
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, hint: &Hint) -> Result<usize> {
        let buffer = hint.encode();
        self.writer
            .write_all(&buffer)
            .map_err(|e| Error::write(self.partial_path.display().to_string(), e))?;
        Ok(buffer.len())
    }

    /// Flushes the hints to disk and renames the partial file to its final name.
    pub fn commit(mut self) -> Result<PathBuf> {
        let name = self.partial_path.display().to_string();
        self.writer
            .flush()
            .map_err(|e| Error::write(name.clone(), e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::write(name.clone(), e))?;
        rename_file(&self.partial_path, &self.path).map_err(|e| Error::write(name, e))?;
        log::debug!("Committed hint segment {}", self.path.display());
        Ok(self.path)
    }
}

/// Reads every hint of the hint segment at `path`.
///
/// # Errors
///
/// Returns `Error::Read` on I/O failure and `Error::TruncatedRecord` if the file ends in the
/// middle of a hint. Committed hint files are never truncated, so both mean the file cannot
/// be trusted.
pub fn read_hints(path: impl AsRef<Path>) -> Result<Vec<Hint>> {
    let path = path.as_ref();
    let buf = fs::read(path).map_err(|e| Error::read(path.display().to_string(), e))?;

    let mut hints = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let hint = Hint::decode(&buf[offset..])?;
        offset += hint.size();
        hints.push(hint);
    }
    Ok(hints)
}

/// Like `read_exact`, but reports how many bytes were read before end-of-file.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
