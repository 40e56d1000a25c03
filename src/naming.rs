//! Log segment file naming.
//!
//! Segments are named by a 20-digit zero-padded counter so that the numeric order, which
//! decides which write is the most recent, is also the lexicographic order.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::{Error, Result};
use crate::segment::LogSegment;

/// Extension of data segments.
pub const LOG_EXTENSION: &str = ".log";
/// Extension of hint segments.
pub const HINT_EXTENSION: &str = ".hint";
/// Suffix of hint segments still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix of files waiting for the cleanup sweep.
pub const DELETED_SUFFIX: &str = ".deleted";

const DIGITS: usize = 20;

/// Produces monotonically increasing segment paths.
///
/// The generator is shared between the store, which rolls the active segment, and the log
/// cleaner, which opens compacted segments, so `next` takes `&self`.
#[derive(Debug)]
pub struct LogSegmentNameGenerator {
    dir: PathBuf,
    counter: AtomicU64,
}

impl LogSegmentNameGenerator {
    /// Creates a generator whose first segment is `00000000000000000000.log`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::starting_at(dir, 0)
    }

    pub fn starting_at(dir: impl AsRef<Path>, counter: u64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            counter: AtomicU64::new(counter),
        }
    }

    /// Creates a generator continuing after `segment`.
    pub fn from_segment(segment: &LogSegment) -> Self {
        Self::starting_at(segment.dir(), segment.id() + 1)
    }

    /// Returns the next segment number and its path.
    pub fn next(&self) -> (u64, PathBuf) {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        (id, self.dir.join(log_file_name(id)))
    }

    /// Number the next call to [`LogSegmentNameGenerator::next`] will return.
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

pub fn log_file_name(id: u64) -> String {
    format!("{:0width$}{}", id, LOG_EXTENSION, width = DIGITS)
}

/// Path of the hint segment belonging to the data segment at `log_path`.
pub fn hint_path_for(log_path: &Path) -> PathBuf {
    log_path.with_extension(&HINT_EXTENSION[1..])
}

/// Appends `suffix` to the file name of `path`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Parses the segment number of a `<digits>.log` file name.
///
/// # Errors
///
/// Returns `Error::InvalidSegmentName` if the name is not a data segment name.
pub fn parse_log_file_name(name: &str) -> Result<u64> {
    name.strip_suffix(LOG_EXTENSION)
        .and_then(|stem| stem.parse::<u64>().ok())
        .ok_or_else(|| Error::InvalidSegmentName {
            filename: name.to_string(),
        })
}

/// Parses the leading segment number of any file kiwi writes into a log directory,
/// including hint, partial and deleted files.
pub fn parse_segment_number(name: &str) -> Option<u64> {
    let digits = name.split('.').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Data segments found in `dir`, sorted by segment number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(id) = parse_log_file_name(&name) {
            segments.push((id, entry.path()));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Highest segment number used by any file in `dir`, soft-deleted files included.
pub fn highest_segment_number(dir: &Path) -> Result<Option<u64>> {
    let mut highest = None;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(id) = parse_segment_number(&name) {
            highest = highest.max(Some(id));
        }
    }
    Ok(highest)
}
