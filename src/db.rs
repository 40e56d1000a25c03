//! The Bitcask store: an append-only log on disk indexed by an in-memory keydir.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
    time::Duration,
};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::cleaner::{self, CompactionStats, LogCleaner};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keydir::{KeyDir, PartialKeyDir};
use crate::naming::{
    highest_segment_number, hint_path_for, list_segments, log_file_name, parse_segment_number,
    LogSegmentNameGenerator, HINT_EXTENSION, PARTIAL_SUFFIX,
};
use crate::record::{timestamp_as_u64, Record, TOMBSTONE};
use crate::segment::{map_segments, LogSegment};
use crate::writer::{segment_writer, SegmentWriter};

/// The name of the file lock. Used to ensure only one writer at a time and process safety.
const FILE_LOCK_PATH: &str = "db.lock";

/// How long closing the store waits for an in-flight cleaner pass.
const CLEANER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest key or value a record header can describe.
const MAX_FIELD_SIZE: usize = u32::MAX as usize;

/// Segments by number. Values reference segments by number and are resolved here.
pub(crate) type SegmentRegistry = RwLock<BTreeMap<u64, Arc<LogSegment>>>;

/// The segment receiving client writes.
#[derive(Debug)]
pub(crate) struct ActiveLog {
    pub(crate) writer: Box<dyn SegmentWriter>,
    /// Timestamp of the last record appended, so that every write gets a strictly
    /// greater one even when the clock stalls or goes back.
    last_timestamp: u64,
}

impl ActiveLog {
    fn next_timestamp(&mut self) -> Result<u64> {
        let timestamp = timestamp_as_u64()?.max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        Ok(timestamp)
    }
}

/// State shared by the store and the log cleaner threads.
#[derive(Debug)]
pub(crate) struct Context {
    pub(crate) config: Config,
    pub(crate) keydir: KeyDir,
    pub(crate) segments: SegmentRegistry,
    pub(crate) active: Mutex<ActiveLog>,
    pub(crate) names: LogSegmentNameGenerator,
    /// Serializes compaction passes
    pub(crate) compaction: Mutex<()>,
    /// Held until the last thread working on the directory lets go of the context, which
    /// may be a cleaner thread detached at shutdown
    _file_lock: File,
}

impl Context {
    /// Opens a new segment and registers it, so values copied or written into it can be
    /// read as soon as the keydir points at them.
    pub(crate) fn open_segment(&self) -> Result<Arc<LogSegment>> {
        let (id, path) = self.names.next();
        let segment = Arc::new(LogSegment::open(&path, false)?);
        self.segments.write().insert(id, Arc::clone(&segment));
        Ok(segment)
    }

    /// Makes the active segment read-only and continues on a new one.
    fn roll(&self, active: &mut ActiveLog) -> Result<()> {
        let next = self.open_segment()?;
        let previous = Arc::clone(active.writer.segment());
        active.writer.switch_to(Arc::clone(&next))?;
        previous.mark_as_read_only()?;
        log::info!(
            "Rolled active segment {} to {}",
            previous.name(),
            next.name()
        );
        Ok(())
    }
}

/// A Bitcask-style key-value store.
///
/// Bitcask is an append-only log-structured storage engine that maintains an in-memory
/// index (keydir) mapping keys to their most recent value locations on disk.
///
/// # Features
/// - Process-safe file locking: one store per directory
/// - All operations take `&self`, a store can be shared between threads with an `Arc`
/// - Values with an expiry instant
/// - Background compaction of stale segments
///
/// # Examples
///
/// Basic usage:
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let db = kiwi::Bitcask::open("my_db")?;
///
/// // Store a value
/// db.put(b"key".to_vec(), b"value".to_vec())?;
///
/// // Retrieve a value
/// assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
///
/// // Remove a value
/// db.delete(b"key".to_vec())?;
/// db.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Bitcask {
    ctx: Arc<Context>,
    cleaner: Option<LogCleaner>,
    closed: bool,
}

impl Bitcask {
    /// Opens the store at `path` with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Bitcask::open_with`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(Config::with_dir(path.as_ref()))
    }

    /// Opens the store described by `config` with exclusive write access.
    ///
    /// Creates the log directory if needed, rebuilds the keydir from the existing segments
    /// and starts the log cleaner unless `config.compaction_interval` is zero.
    ///
    /// # Parameters
    ///
    /// * `config` - Log directory, segment size, compaction and sync settings
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The configuration is invalid (`Error::Config`)
    /// * Another process has write access (`Error::WriterLock`)
    /// * A segment cannot be read (`Error::Read`) or the active one opened (`Error::Write`)
    /// * Filesystem operations fail (`Error::Io`)
    pub fn open_with(config: Config) -> Result<Self> {
        config.validate()?;
        let dir = config.dir.clone();
        fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(FILE_LOCK_PATH))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::WriterLock)?;

        let names = match highest_segment_number(&dir)? {
            Some(highest) => LogSegmentNameGenerator::starting_at(&dir, highest + 1),
            None => LogSegmentNameGenerator::new(&dir),
        };
        remove_incomplete_compactions(&dir)?;

        // Appending to a segment with a hint would hide the new records from the next
        // recovery, so compacted segments are never reused as the active segment.
        let mut paths = list_segments(&dir)?;
        let reusable = paths
            .last()
            .is_some_and(|(_, path)| !hint_path_for(path).exists());
        let active_path = match paths.pop() {
            Some((_, path)) if reusable => path,
            last => {
                paths.extend(last);
                names.next().1
            }
        };

        let mut segments = Vec::with_capacity(paths.len() + 1);
        for (_, path) in &paths {
            segments.push(Arc::new(LogSegment::open(path, true)?));
        }
        let active = Arc::new(LogSegment::open(&active_path, false)?);
        active.truncate_torn_tail()?;
        segments.push(Arc::clone(&active));

        let (keydir, last_timestamp) = build_keydir(&segments, config.keydir_builder_threads)?;
        log::info!(
            "Loaded {} keys from {} segments in {}",
            keydir.len(),
            segments.len(),
            dir.display()
        );

        let registry = segments
            .into_iter()
            .map(|segment| (segment.id(), segment))
            .collect();
        let writer = segment_writer(config.sync, active)?;

        let ctx = Arc::new(Context {
            config,
            keydir,
            segments: RwLock::new(registry),
            active: Mutex::new(ActiveLog {
                writer,
                last_timestamp,
            }),
            names,
            compaction: Mutex::new(()),
            _file_lock: lock_file,
        });

        let cleaner = if ctx.config.compaction_interval.is_zero() {
            None
        } else {
            Some(LogCleaner::start(Arc::clone(&ctx))?)
        };

        Ok(Self {
            ctx,
            cleaner,
            closed: false,
        })
    }

    /// Stores a key-value pair that never expires.
    ///
    /// # Parameters
    ///
    /// * `key` - Non-empty key
    /// * `value` - Non-empty value
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * Key is empty (`Error::InvalidEmptyKey`)
    /// * Value is empty (`Error::InvalidEmptyValue`)
    /// * Key or value is larger than `u32::MAX` bytes (`Error::KeyTooLarge`, `Error::ValueTooLarge`)
    /// * The record cannot be written (`Error::Write`)
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.put_with_ttl(key, value, 0)
    }

    /// Stores a key-value pair that expires after `ttl`, in milliseconds since UNIX epoch.
    ///
    /// A `ttl` of `0` never expires. Expired values are dropped lazily: the key is removed
    /// the first time it is read after expiry, or by the next compaction.
    pub fn put_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: u64) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidEmptyKey);
        }
        if value.is_empty() {
            return Err(Error::InvalidEmptyValue);
        }
        check_sizes(key.len(), value.len())?;
        self.append(key, value, ttl)
    }

    /// Retrieves the value stored for `key`, `None` if it is absent or expired.
    ///
    /// # Errors
    ///
    /// Returns `Error::Read` if the value cannot be read from its segment.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(reference) = self.ctx.keydir.get(key) else {
                return Ok(None);
            };

            let now = timestamp_as_u64()?;
            if reference.is_expired(now) {
                self.ctx.keydir.remove_if_expired(key, now);
                return Ok(None);
            }

            let segment = self
                .ctx
                .segments
                .read()
                .get(&reference.segment_id)
                .cloned();
            let Some(segment) = segment else {
                // Compaction moved the value and retired the segment in the meantime.
                if self.ctx.keydir.get(key) == Some(reference) {
                    return Err(Error::read(
                        reference.segment_id.to_string(),
                        io::Error::new(ErrorKind::NotFound, "segment is not registered"),
                    ));
                }
                continue;
            };

            let value = segment.read(reference.offset, reference.value_size)?;
            if value == TOMBSTONE {
                return Ok(None);
            }
            return Ok(Some(value));
        }
    }

    /// Removes `key` by appending a tombstone. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * Key is empty (`Error::InvalidEmptyKey`)
    /// * The tombstone cannot be written (`Error::Write`)
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidEmptyKey);
        }
        check_sizes(key.len(), 0)?;
        self.append(key, TOMBSTONE.to_vec(), 0)
    }

    /// Whether the keydir holds `key`. Expired keys count until they are read.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.ctx.keydir.contains_key(key)
    }

    /// Number of keys in the keydir. Expired keys count until they are read.
    pub fn size(&self) -> usize {
        self.ctx.keydir.len()
    }

    /// Flushes the active segment to disk.
    pub fn flush(&self) -> Result<()> {
        self.ctx.active.lock().writer.flush()
    }

    /// Runs one compaction pass now.
    pub fn compact(&self) -> Result<CompactionStats> {
        cleaner::compact(&self.ctx)
    }

    /// Removes the segments left behind by compaction. Returns the number of files removed.
    pub fn clean(&self) -> Result<usize> {
        cleaner::clean(&self.ctx.config.dir)
    }

    /// Stops the log cleaner and flushes the active segment. The directory lock is released
    /// once no cleaner thread uses the store any more.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut cleaner) = self.cleaner.take() {
            cleaner.shutdown(CLEANER_SHUTDOWN_TIMEOUT);
        }
        self.ctx.active.lock().writer.close()?;
        log::info!("Closed store at {}", self.ctx.config.dir.display());
        Ok(())
    }

    fn append(&self, key: Vec<u8>, value: Vec<u8>, ttl: u64) -> Result<()> {
        let mut active = self.ctx.active.lock();
        let record = Record::new(key, value, active.next_timestamp()?, ttl);

        let written = active.writer.append(&record)?;
        if written == 0 {
            return Err(Error::write(
                active.writer.segment().name(),
                io::Error::new(ErrorKind::WriteZero, "no bytes written"),
            ));
        }
        self.ctx.keydir.update(&record, active.writer.segment())?;

        if active.writer.segment().size()? >= self.ctx.config.segment_bytes {
            self.ctx.roll(&mut active)?;
        }
        Ok(())
    }
}

impl Drop for Bitcask {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to close store: {}", e);
        }
    }
}

fn check_sizes(key_size: usize, value_size: usize) -> Result<()> {
    if key_size > MAX_FIELD_SIZE {
        return Err(Error::KeyTooLarge { size: key_size });
    }
    if value_size > MAX_FIELD_SIZE {
        return Err(Error::ValueTooLarge { size: value_size });
    }
    Ok(())
}

/// Builds the keydir of every segment in parallel and merges them.
///
/// Also returns the highest timestamp of any record on disk, tombstones and expired
/// records included, so that new writes are stamped after all of them.
fn build_keydir(segments: &[Arc<LogSegment>], threads: usize) -> Result<(KeyDir, u64)> {
    let partials: Vec<(u64, PartialKeyDir)> =
        map_segments(segments, threads, |segment| segment.build_keydir())?;
    let max_timestamp = partials
        .iter()
        .map(|(_, partial)| partial.max_timestamp)
        .max()
        .unwrap_or(0);
    Ok((KeyDir::merge(partials), max_timestamp))
}

/// Removes what an interrupted compaction pass left behind: hint files that were never
/// committed and the segments they describe. The source segments of a pass are retired
/// only after every output is committed, so they still hold all the records.
fn remove_incomplete_compactions(dir: &Path) -> Result<()> {
    let suffix = format!("{}{}", HINT_EXTENSION, PARTIAL_SUFFIX);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(&suffix) {
            continue;
        }
        log::warn!("Removing incomplete hint file {}", entry.path().display());
        fs::remove_file(entry.path())?;

        if let Some(id) = parse_segment_number(&name) {
            let segment = dir.join(log_file_name(id));
            if segment.exists() {
                log::warn!("Removing incomplete compacted segment {}", segment.display());
                fs::remove_file(segment)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::SyncPolicy;

    fn config(dir: &Path) -> Config {
        Config {
            dir: dir.to_path_buf(),
            segment_bytes: 1024,
            compaction_interval: Duration::ZERO,
            ..Config::default()
        }
    }

    #[test]
    fn test_put_get_delete() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        db.put(b"key".to_vec(), b"value".to_vec())?;
        assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
        assert!(db.contains(b"key"));
        assert_eq!(db.size(), 1);

        db.delete(b"key".to_vec())?;
        assert_eq!(db.get(b"key")?, None);
        assert!(!db.contains(b"key"));
        assert_eq!(db.size(), 0);
        Ok(())
    }

    #[test]
    fn test_empty_key_and_value_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        assert!(matches!(
            db.put(Vec::new(), b"value".to_vec()),
            Err(Error::InvalidEmptyKey)
        ));
        assert!(matches!(
            db.put(b"key".to_vec(), Vec::new()),
            Err(Error::InvalidEmptyValue)
        ));
        assert!(matches!(db.delete(Vec::new()), Err(Error::InvalidEmptyKey)));
        Ok(())
    }

    #[test]
    fn test_timestamps_strictly_increase() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        let mut previous = 0;
        for i in 0..100u32 {
            db.put(b"key".to_vec(), i.to_le_bytes().to_vec())?;
            let timestamp = db.ctx.keydir.get(b"key").map(|r| r.timestamp).unwrap_or(0);
            assert!(timestamp > previous);
            previous = timestamp;
        }
        Ok(())
    }

    #[test]
    fn test_roll_registers_new_segment() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        for i in 0..50u32 {
            db.put(format!("key{}", i).into_bytes(), vec![b'x'; 64])?;
        }

        let segments = db.ctx.segments.read();
        assert!(segments.len() > 1);
        let active_id = db.ctx.active.lock().writer.segment().id();
        assert_eq!(segments.keys().last(), Some(&active_id));
        for (id, segment) in segments.iter() {
            assert_eq!(segment.is_read_only(), *id != active_id);
        }
        Ok(())
    }

    #[test]
    fn test_stale_partial_hints_are_removed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let partial = temp.path().join("00000000000000000003.hint.partial");
        fs::write(&partial, b"half a hint")?;

        let db = Bitcask::open_with(config(temp.path()))?;
        assert!(!partial.exists());

        // Segment numbers continue after every file seen in the directory.
        assert_eq!(db.ctx.active.lock().writer.segment().id(), 4);
        assert_eq!(db.ctx.names.peek(), 5);
        Ok(())
    }

    #[test]
    fn test_uncommitted_compaction_output_is_removed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = LogSegment::open(temp.path().join(log_file_name(0)), false)?;
        source.append(&Record::new(b"key".to_vec(), b"old".to_vec(), 1, 0))?;
        source.append(&Record::new(b"key".to_vec(), b"new".to_vec(), 5, 0))?;

        // A pass copied the stale value before the crash, its hint was never committed.
        let output = LogSegment::open(temp.path().join(log_file_name(3)), false)?;
        output.append(&Record::new(b"key".to_vec(), b"old".to_vec(), 1, 0))?;
        let partial = temp.path().join("00000000000000000003.hint.partial");
        fs::write(&partial, b"half a hint")?;
        drop((source, output));

        let db = Bitcask::open_with(config(temp.path()))?;
        assert!(!partial.exists());
        assert!(!temp.path().join(log_file_name(3)).exists());
        assert_eq!(db.get(b"key")?, Some(b"new".to_vec()));
        Ok(())
    }

    #[test]
    fn test_new_writes_follow_every_record_on_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let future = timestamp_as_u64()? + 600_000;
        let segment = LogSegment::open(temp.path().join(log_file_name(0)), false)?;
        segment.append(&Record::new(b"key".to_vec(), b"old".to_vec(), future - 1, 0))?;
        segment.append(&Record::tombstone(b"key".to_vec(), future))?;
        drop(segment);

        let db = Bitcask::open_with(config(temp.path()))?;
        assert_eq!(db.size(), 0);
        db.put(b"other".to_vec(), b"value".to_vec())?;
        let timestamp = db.ctx.keydir.get(b"other").map(|r| r.timestamp).unwrap_or(0);
        assert!(timestamp > future);
        Ok(())
    }

    #[test]
    fn test_lock_is_held_while_context_is_shared() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        // Stands in for a cleaner thread still running after shutdown gave up on it.
        let ctx = Arc::clone(&db.ctx);
        db.close()?;
        assert!(matches!(
            Bitcask::open_with(config(temp.path())),
            Err(Error::WriterLock)
        ));

        drop(ctx);
        Bitcask::open_with(config(temp.path()))?;
        Ok(())
    }

    #[test]
    fn test_oversized_fields_are_rejected() {
        assert!(check_sizes(MAX_FIELD_SIZE, MAX_FIELD_SIZE).is_ok());
        assert!(matches!(
            check_sizes(MAX_FIELD_SIZE + 1, 1),
            Err(Error::KeyTooLarge { .. })
        ));
        assert!(matches!(
            check_sizes(1, MAX_FIELD_SIZE + 1),
            Err(Error::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_every_sync_policy() -> anyhow::Result<()> {
        for sync in [
            SyncPolicy::Lazy,
            SyncPolicy::Periodic {
                interval: Duration::from_millis(10),
            },
            SyncPolicy::Batch { records: 3 },
        ] {
            let temp = tempfile::tempdir()?;
            let db = Bitcask::open_with(Config {
                sync,
                ..config(temp.path())
            })?;
            for i in 0..40u32 {
                db.put(format!("key{}", i).into_bytes(), vec![b'v'; 32])?;
            }
            db.close()?;

            let db = Bitcask::open_with(config(temp.path()))?;
            assert_eq!(db.size(), 40);
            assert_eq!(db.get(b"key39")?, Some(vec![b'v'; 32]));
        }
        Ok(())
    }
}
