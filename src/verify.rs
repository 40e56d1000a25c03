//! Offline checksum verification of a log directory.
//!
//! The normal read and recovery paths trust the data on disk; this scan recomputes the
//! checksum of every record and reports the ones that do not match. Segments are opened
//! read-only, so it is safe to run against the directory of an open store.

use std::{path::Path, sync::Arc};

use crate::error::Result;
use crate::naming::list_segments;
use crate::record::Header;
use crate::segment::{map_segments, LogSegment};

/// A record whose stored checksum does not match its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFailure {
    /// Name of the segment holding the record
    pub segment: String,
    /// Byte offset of the record within the segment
    pub position: u64,
    pub header: Header,
}

impl std::fmt::Display for ChecksumFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segment {} position {}: checksum {:#010x}, timestamp {}, ttl {}, key size {}, value size {}",
            self.segment,
            self.position,
            self.header.checksum,
            self.header.timestamp,
            self.header.ttl,
            self.header.key_size,
            self.header.value_size
        )
    }
}

/// Verifies every data segment of `dir` using up to `threads` workers.
///
/// Returns the failures ordered by segment and position; an empty list means the log is
/// intact. A truncated trailing record is not a failure: it is logged and ignored, the same
/// way recovery treats it.
pub fn verify_dir(dir: impl AsRef<Path>, threads: usize) -> Result<Vec<ChecksumFailure>> {
    let dir = dir.as_ref();
    let mut segments = Vec::new();
    for (_, path) in list_segments(dir)? {
        segments.push(Arc::new(LogSegment::open(&path, true)?));
    }
    log::info!(
        "Verifying {} segments in {}",
        segments.len(),
        dir.display()
    );

    let mut results = map_segments(&segments, threads, verify_segment)?;
    results.sort_by_key(|(id, _)| *id);

    let failures: Vec<ChecksumFailure> = results
        .into_iter()
        .flat_map(|(_, failures)| failures)
        .collect();
    if failures.is_empty() {
        log::info!("All checksums valid");
    } else {
        log::warn!("Found {} records with invalid checksums", failures.len());
    }
    Ok(failures)
}

/// Checks the checksum of every record of `segment`.
pub fn verify_segment(segment: &LogSegment) -> Result<Vec<ChecksumFailure>> {
    let mut failures = Vec::new();
    let mut records = segment.records()?;
    while let Some(record) = records.next() {
        let record = record?;
        if !record.is_valid_checksum() {
            let failure = ChecksumFailure {
                segment: segment.name().to_string(),
                position: records.last_position(),
                header: record.header,
            };
            log::warn!("Invalid checksum: {}", failure);
            failures.push(failure);
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::log_file_name;
    use crate::record::Record;
    use std::fs;

    #[test]
    fn test_intact_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        for id in 0..3u64 {
            let segment = LogSegment::open(temp.path().join(log_file_name(id)), false)?;
            for i in 0..10u64 {
                let key = format!("key{}", i).into_bytes();
                segment.append(&Record::new(key, b"v".to_vec(), i, 0))?;
            }
        }

        assert!(verify_dir(temp.path(), 2)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_corrupted_records_are_reported() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let first = Record::new(b"k1".to_vec(), b"value1".to_vec(), 1, 0);
        let second = Record::new(b"k2".to_vec(), b"value2".to_vec(), 2, 0);
        let mut bytes = first.encode();
        bytes.extend(second.encode());

        // Flip a byte of the second value.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(temp.path().join(log_file_name(7)), bytes)?;
        fs::write(temp.path().join(log_file_name(8)), first.encode())?;

        let failures = verify_dir(temp.path(), 4)?;
        assert_eq!(
            failures,
            vec![ChecksumFailure {
                segment: "00000000000000000007".to_string(),
                position: first.size() as u64,
                header: second.header,
            }]
        );
        assert!(failures[0].to_string().contains("position"));
        Ok(())
    }
}
