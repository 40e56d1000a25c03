//! Log segments: the append-only files holding the records.
//!
//! A segment is written while it is the store's active segment, then becomes read-only,
//! may later be compacted, and is finally soft-deleted by renaming it to
//! `<n>.log.deleted` until the cleanup sweep removes it.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hint::{self, read_full};
use crate::keydir::{PartialEntry, PartialKeyDir, ValueReference};
use crate::naming::{hint_path_for, parse_log_file_name, with_suffix, DELETED_SUFFIX};
use crate::record::{timestamp_as_u64, Header, Record};

/// Snapshot of key timestamps telling which records have been superseded.
pub type KeyTimestamps = HashMap<Vec<u8>, u64>;

/// A single log segment file.
///
/// All methods take `&self`: the store appends to the active segment while other threads
/// read values from it, and the log cleaner scans read-only segments that clients keep
/// reading. Random-access reads and appends share one file handle behind a mutex; scans
/// open their own handle so they never move the shared cursor.
#[derive(Debug)]
pub struct LogSegment {
    id: u64,
    path: PathBuf,
    name: String,
    file: Mutex<SegmentFile>,
}

#[derive(Debug)]
struct SegmentFile {
    handle: File,
    read_only: bool,
    /// Write cursor, the end of the last appended record
    position: u64,
}

impl LogSegment {
    /// Opens the segment at `path`.
    ///
    /// A writable segment is created if it does not exist and appends go to its end.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file name is not `<number>.log` (`Error::InvalidSegmentName`)
    /// * A read-only segment does not exist or cannot be opened (`Error::Read`)
    /// * A writable segment cannot be created or opened (`Error::Write`)
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let id = parse_log_file_name(&file_name)?;
        let name = file_name.trim_end_matches(".log").to_string();

        let handle = if read_only {
            File::open(&path).map_err(|e| Error::read(&name, e))?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)
                .map_err(|e| Error::write(&name, e))?
        };
        let position = handle.metadata().map_err(|e| Error::read(&name, e))?.len();

        log::debug!(
            "Opened log segment {} ({}, {} bytes)",
            path.display(),
            if read_only { "read-only" } else { "writable" },
            position
        );

        Ok(Self {
            id,
            path,
            name,
            file: Mutex::new(SegmentFile {
                handle,
                read_only,
                position,
            }),
        })
    }

    /// Segment number parsed from the file name.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File name without the `.log` extension.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory containing the segment.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn is_read_only(&self) -> bool {
        self.file.lock().read_only
    }

    /// Appends `record` and returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `Error::Write` if the segment is read-only or the write fails.
    pub fn append(&self, record: &Record) -> Result<usize> {
        let mut file = self.file.lock();
        if file.read_only {
            return Err(Error::write(
                &self.name,
                io::Error::new(ErrorKind::PermissionDenied, "segment is read-only"),
            ));
        }

        let buffer = record.encode();
        file.handle
            .write_all(&buffer)
            .map_err(|e| Error::write(&self.name, e))?;
        file.position += buffer.len() as u64;
        Ok(buffer.len())
    }

    /// Reads `size` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Read` if the range lies outside the segment or the read fails.
    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let len = file
            .handle
            .metadata()
            .map_err(|e| Error::read(&self.name, e))?
            .len();
        if offset.saturating_add(size as u64) > len {
            return Err(Error::read(
                &self.name,
                io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("range {}+{} past end of segment ({} bytes)", offset, size, len),
                ),
            ));
        }

        file.handle
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::read(&self.name, e))?;
        let mut value = vec![0; size as usize];
        file.handle
            .read_exact(&mut value)
            .map_err(|e| Error::read(&self.name, e))?;
        Ok(value)
    }

    /// Current write position.
    pub fn position(&self) -> Result<u64> {
        Ok(self.file.lock().position)
    }

    /// Size of the segment file in bytes.
    pub fn size(&self) -> Result<u64> {
        let file = self.file.lock();
        file.handle
            .metadata()
            .map(|metadata| metadata.len())
            .map_err(|e| Error::read(&self.name, e))
    }

    /// Flushes appended records to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        if file.read_only {
            return Ok(());
        }
        file.handle
            .sync_data()
            .map_err(|e| Error::write(&self.name, e))
    }

    /// Flushes the segment and reopens it read-only.
    pub fn mark_as_read_only(&self) -> Result<()> {
        let mut file = self.file.lock();
        if file.read_only {
            return Ok(());
        }

        file.handle
            .sync_all()
            .map_err(|e| Error::write(&self.name, e))?;
        file.handle = File::open(&self.path).map_err(|e| Error::write(&self.name, e))?;
        file.read_only = true;
        log::debug!("Marked log segment {} as read-only", self.name);
        Ok(())
    }

    /// Renames the segment, and its hint file if any, for the cleanup sweep to remove.
    ///
    /// The open handle stays valid, so readers that resolved this segment before the
    /// rename can still read from it. Failures are logged: the files are picked up again
    /// by a later compaction.
    pub fn mark_as_deleted(&self) {
        let mut file = self.file.lock();
        if !file.read_only {
            if let Err(e) = file.handle.sync_all() {
                log::warn!("Failed to sync log segment {} before deletion: {}", self.name, e);
            }
            file.read_only = true;
        }

        match rename_file(&self.path, &with_suffix(&self.path, DELETED_SUFFIX)) {
            Ok(()) => log::info!("Marked log segment {} for deletion", self.path.display()),
            Err(e) => log::error!(
                "Failed to mark log segment {} for deletion: {}",
                self.path.display(),
                e
            ),
        }

        let hint_path = hint_path_for(&self.path);
        if hint_path.exists() {
            if let Err(e) = rename_file(&hint_path, &with_suffix(&hint_path, DELETED_SUFFIX)) {
                log::error!(
                    "Failed to mark hint segment {} for deletion: {}",
                    hint_path.display(),
                    e
                );
            }
        }
    }

    /// Cuts off a record left half-written at the end of the segment by a crash, so that
    /// appends continue right after the last complete record.
    ///
    /// Returns whether anything was cut.
    pub fn truncate_torn_tail(&self) -> Result<bool> {
        let mut scanner = SegmentScanner::open(self)?;
        while scanner.next_key()?.is_some() {}
        let Some(valid_len) = scanner.torn_at else {
            return Ok(false);
        };

        let mut file = self.file.lock();
        if file.read_only {
            return Ok(false);
        }
        file.handle
            .set_len(valid_len)
            .map_err(|e| Error::write(&self.name, e))?;
        file.position = valid_len;
        log::warn!("Truncated log segment {} to {} bytes", self.name, valid_len);
        Ok(true)
    }

    /// Fraction of records superseded by a newer write or expired.
    ///
    /// Only headers and keys are read. An empty segment reports `0.0`.
    pub fn dirty_ratio(&self, snapshot: &KeyTimestamps) -> Result<f64> {
        let now = timestamp_as_u64()?;
        let mut total = 0u64;
        let mut dirty = 0u64;
        self.for_each_key(|header, key| {
            total += 1;
            if is_stale(header, key, snapshot, now) {
                dirty += 1;
            }
        })?;

        if total == 0 {
            return Ok(0.0);
        }
        Ok(dirty as f64 / total as f64)
    }

    /// Visits the header and key of every record. Values are skipped, not read.
    pub fn for_each_key<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Header, &[u8]),
    {
        let mut scanner = SegmentScanner::open(self)?;
        while let Some(entry) = scanner.next_key()? {
            visit(&entry.header, &entry.key);
        }
        Ok(())
    }

    /// Streams the records that are neither expired nor superseded according to `snapshot`.
    pub fn active_records<'a>(
        &self,
        snapshot: &'a KeyTimestamps,
    ) -> Result<RecordIter<impl FnMut(&Header, &[u8]) -> bool + 'a>> {
        let now = timestamp_as_u64()?;
        self.scan(move |header, key| !is_stale(header, key, snapshot, now))
    }

    /// Streams every record of the segment.
    pub fn records(&self) -> Result<RecordIter<impl FnMut(&Header, &[u8]) -> bool>> {
        self.scan(|_, _| true)
    }

    /// Streams the records accepted by `filter`, which sees each header and key before
    /// the value is read. Values of rejected records are skipped.
    pub fn scan<F>(&self, filter: F) -> Result<RecordIter<F>>
    where
        F: FnMut(&Header, &[u8]) -> bool,
    {
        Ok(RecordIter {
            scanner: SegmentScanner::open(self)?,
            filter,
            last_position: 0,
            done: false,
        })
    }

    /// Builds the keydir of this segment alone.
    ///
    /// Uses the hint segment when there is one and falls back to scanning the data when it
    /// is missing or unreadable. Tombstones and expired records become
    /// [`PartialEntry::Tombstone`] so that merging removes older values of the key.
    ///
    /// Only compaction writes hint segments, so a segment with one is marked as compacted
    /// even when its keydir comes from the data.
    pub fn build_keydir(&self) -> Result<PartialKeyDir> {
        let hint_path = hint_path_for(&self.path);
        let compacted = hint_path.exists();
        if compacted {
            match self.build_keydir_from_hint(&hint_path) {
                Ok(keydir) => return Ok(keydir),
                Err(e) => log::warn!(
                    "Failed to build keydir from hint segment {}: {}",
                    hint_path.display(),
                    e
                ),
            }
        }
        self.build_keydir_from_data(compacted)
    }

    fn build_keydir_from_hint(&self, hint_path: &Path) -> Result<PartialKeyDir> {
        log::info!("Building keydir from hint segment {}", hint_path.display());

        let now = timestamp_as_u64()?;
        let size = self.size()?;
        let mut keydir = PartialKeyDir::new(true);
        for hint in hint::read_hints(hint_path)? {
            if hint.value_position + hint.header.value_size as u64 > size {
                return Err(Error::read(
                    hint_path.display().to_string(),
                    io::Error::new(ErrorKind::InvalidData, "hint points past end of segment"),
                ));
            }
            let entry = self.partial_entry(&hint.header, hint.value_position, now);
            keydir.insert(hint.key, entry);
        }
        Ok(keydir)
    }

    fn build_keydir_from_data(&self, compacted: bool) -> Result<PartialKeyDir> {
        log::info!("Building keydir from log segment {}", self.path.display());

        let now = timestamp_as_u64()?;
        let mut scanner = SegmentScanner::open(self)?;
        let mut keydir = PartialKeyDir::new(compacted);
        while let Some(entry) = scanner.next_key()? {
            let value_position = entry.value_position();
            let partial = self.partial_entry(&entry.header, value_position, now);
            keydir.insert(entry.key, partial);
        }
        Ok(keydir)
    }

    fn partial_entry(&self, header: &Header, value_position: u64, now: u64) -> PartialEntry {
        if header.value_size == 0 || header.is_expired(now) {
            PartialEntry::Tombstone {
                timestamp: header.timestamp,
            }
        } else {
            PartialEntry::Value(ValueReference {
                segment_id: self.id,
                offset: value_position,
                value_size: header.value_size,
                ttl: header.ttl,
                timestamp: header.timestamp,
            })
        }
    }
}

/// Whether a record is dirty: expired, or superseded by a newer write of its key.
///
/// A key missing from the snapshot has been deleted or expired, so all its records are
/// stale. A snapshot older than the record should not happen because the snapshot is taken
/// after every scanned record was written; such a record is kept rather than dropped.
pub(crate) fn is_stale(header: &Header, key: &[u8], snapshot: &KeyTimestamps, now: u64) -> bool {
    if header.is_expired(now) {
        return true;
    }
    match snapshot.get(key) {
        None => true,
        Some(&latest) if latest > header.timestamp => true,
        Some(&latest) => {
            if latest < header.timestamp {
                log::warn!(
                    "Record written at {} is newer than its keydir snapshot ({}), keeping it",
                    header.timestamp,
                    latest
                );
            }
            false
        }
    }
}

/// Renames `from` to `to`, falling back to copy-and-remove when the rename fails.
pub(crate) fn rename_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(e) => {
            log::warn!(
                "Atomic rename of {} failed ({}), falling back to non-atomic move",
                from.display(),
                e
            );
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Applies `f` to every segment, spreading the segments over up to `threads` workers.
///
/// Results are paired with the segment number; their order is unspecified.
pub(crate) fn map_segments<T, F>(
    segments: &[Arc<LogSegment>],
    threads: usize,
    f: F,
) -> Result<Vec<(u64, T)>>
where
    T: Send,
    F: Fn(&LogSegment) -> Result<T> + Sync,
{
    let threads = threads.clamp(1, segments.len().max(1));
    let chunk_size = segments.len().div_ceil(threads).max(1);

    thread::scope(|scope| {
        let f = &f;
        let workers: Vec<_> = segments
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|segment| f(segment).map(|result| (segment.id(), result)))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();

        let mut results = Vec::with_capacity(segments.len());
        for worker in workers {
            let partial = worker
                .join()
                .map_err(|_| Error::Io(io::Error::other("segment worker panicked")))??;
            results.extend(partial);
        }
        Ok(results)
    })
}

/// Header and key of a record found by a scan.
#[derive(Debug)]
struct ScannedKey {
    position: u64,
    header: Header,
    key: Vec<u8>,
}

impl ScannedKey {
    fn value_position(&self) -> u64 {
        self.position + Header::SIZE as u64 + self.header.key_size as u64
    }
}

/// Forward-only reader over the records of a segment.
///
/// The scan stops at the first record that does not fit in the file, which is how a
/// record left half-written by a crash looks.
#[derive(Debug)]
struct SegmentScanner {
    reader: BufReader<File>,
    name: String,
    /// Offset of the next unread byte
    position: u64,
    len: u64,
    /// Size of the value following the last key, not yet read or skipped
    pending_value: Option<u32>,
    /// Start of the truncated record that ended the scan
    torn_at: Option<u64>,
}

impl SegmentScanner {
    fn open(segment: &LogSegment) -> Result<Self> {
        let file = File::open(&segment.path).map_err(|e| Error::read(segment.name(), e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::read(segment.name(), e))?
            .len();
        Ok(Self {
            reader: BufReader::new(file),
            name: segment.name().to_string(),
            position: 0,
            len,
            pending_value: None,
            torn_at: None,
        })
    }

    /// Reads the header and key of the next record, skipping the previous value if it was
    /// not read. Returns `None` at the end of the segment or at a truncated record.
    fn next_key(&mut self) -> Result<Option<ScannedKey>> {
        if let Some(value_size) = self.pending_value.take() {
            self.reader
                .seek_relative(value_size as i64)
                .map_err(|e| Error::read(&self.name, e))?;
            self.position += value_size as u64;
        }

        if self.position >= self.len {
            return Ok(None);
        }
        if self.position + Header::SIZE as u64 > self.len {
            self.truncated(Header::SIZE as u64);
            return Ok(None);
        }

        let mut buf = [0u8; Header::SIZE];
        let n = read_full(&mut self.reader, &mut buf).map_err(|e| Error::read(&self.name, e))?;
        if n < Header::SIZE {
            self.truncated(Header::SIZE as u64);
            return Ok(None);
        }
        let header = Header::deserialize(&buf)?;

        let record_size = Header::SIZE as u64 + header.body_size();
        if self.position + record_size > self.len {
            self.truncated(record_size);
            return Ok(None);
        }

        let mut key = vec![0u8; header.key_size as usize];
        self.reader
            .read_exact(&mut key)
            .map_err(|e| Error::read(&self.name, e))?;

        let position = self.position;
        self.position += Header::SIZE as u64 + header.key_size as u64;
        self.pending_value = Some(header.value_size);
        Ok(Some(ScannedKey {
            position,
            header,
            key,
        }))
    }

    fn read_value(&mut self) -> Result<Vec<u8>> {
        let size = self.pending_value.take().unwrap_or(0);
        let mut value = vec![0u8; size as usize];
        self.reader
            .read_exact(&mut value)
            .map_err(|e| Error::read(&self.name, e))?;
        self.position += size as u64;
        Ok(value)
    }

    fn truncated(&mut self, wanted: u64) {
        log::warn!(
            "Log segment {} ends with a truncated record at {} ({} of {} bytes), stopping scan",
            self.name,
            self.position,
            self.len - self.position,
            wanted
        );
        self.torn_at = Some(self.position);
        self.position = self.len;
    }
}

/// Lazy iterator over the records of a segment accepted by a filter.
#[derive(Debug)]
pub struct RecordIter<F> {
    scanner: SegmentScanner,
    filter: F,
    last_position: u64,
    done: bool,
}

impl<F> RecordIter<F> {
    /// Byte offset of the record most recently returned.
    pub fn last_position(&self) -> u64 {
        self.last_position
    }
}

impl<F> Iterator for RecordIter<F>
where
    F: FnMut(&Header, &[u8]) -> bool,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let entry = match self.scanner.next_key() {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if !(self.filter)(&entry.header, &entry.key) {
                continue;
            }

            return match self.scanner.read_value() {
                Ok(value) => {
                    self.last_position = entry.position;
                    Some(Ok(Record {
                        header: entry.header,
                        key: entry.key,
                        value,
                    }))
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }
    }
}
