//! Log cleaner: background compaction of stale segments and removal of retired files.
//!
//! Compaction copies the live records of dirty segments into fresh segments, points the
//! keydir at the copies and renames the sources to `<n>.log.deleted`. A second task sweeps
//! the `.deleted` files away. The two tasks run on their own threads, each waking up at a
//! jittered interval so that several stores do not compact in lockstep.

use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rand::Rng;

use crate::db::Context;
use crate::error::Result;
use crate::hint::{Hint, HintSegment};
use crate::naming::{hint_path_for, DELETED_SUFFIX};
use crate::record::{timestamp_as_u64, Header, Record};
use crate::segment::{is_stale, KeyTimestamps, LogSegment};

/// Outcome of a compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Source segments retired
    pub segments_compacted: usize,
    /// New segments written
    pub segments_written: usize,
    /// Records copied into the new segments
    pub records_copied: usize,
    /// Source bytes minus written bytes
    pub bytes_reclaimed: u64,
}

/// Handle on the compaction and cleanup threads.
#[derive(Debug)]
pub struct LogCleaner {
    shutdown: Option<Sender<()>>,
    workers: Vec<Worker>,
}

#[derive(Debug)]
struct Worker {
    name: &'static str,
    /// Disconnected when the worker thread exits
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl LogCleaner {
    /// Starts the compaction and cleanup threads, both scheduled every
    /// `compaction_interval` with ±30% jitter.
    pub(crate) fn start(ctx: Arc<Context>) -> Result<Self> {
        let interval = ctx.config.compaction_interval;
        let (shutdown, stop) = channel::bounded::<()>(0);

        let workers = vec![
            spawn_worker("kiwi-compaction", &ctx, stop.clone(), interval, |ctx| {
                let stats = compact(ctx)?;
                if stats.segments_compacted > 0 {
                    log::info!(
                        "Compacted {} segments into {}, {} records copied, {} bytes reclaimed",
                        stats.segments_compacted,
                        stats.segments_written,
                        stats.records_copied,
                        stats.bytes_reclaimed
                    );
                }
                Ok(())
            })?,
            spawn_worker("kiwi-cleanup", &ctx, stop, interval, |ctx| {
                clean(&ctx.config.dir).map(|_| ())
            })?,
        ];

        log::info!("Started log cleaner, interval {:?}", interval);
        Ok(Self {
            shutdown: Some(shutdown),
            workers,
        })
    }

    /// Stops scheduling new passes and waits up to `timeout` for the running ones.
    ///
    /// Workers still busy after the timeout are detached; they exit once their pass ends.
    pub fn shutdown(&mut self, timeout: Duration) {
        // Dropping the sender wakes up both workers.
        if self.shutdown.take().is_none() {
            return;
        }

        let deadline = Instant::now() + timeout;
        for worker in self.workers.drain(..) {
            match worker.done.recv_deadline(deadline) {
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Log cleaner thread {} still running after {:?}, detaching it",
                        worker.name,
                        timeout
                    );
                }
                _ => {
                    if worker.handle.join().is_err() {
                        log::error!("Log cleaner thread {} panicked", worker.name);
                    }
                }
            }
        }
        log::info!("Stopped log cleaner");
    }
}

impl Drop for LogCleaner {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

fn spawn_worker<F>(
    name: &'static str,
    ctx: &Arc<Context>,
    stop: Receiver<()>,
    interval: Duration,
    pass: F,
) -> Result<Worker>
where
    F: Fn(&Context) -> Result<()> + Send + 'static,
{
    let ctx: Weak<Context> = Arc::downgrade(ctx);
    let (done_tx, done) = channel::bounded::<()>(0);

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _done = done_tx;
            loop {
                match stop.recv_timeout(jittered(interval)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(ctx) = ctx.upgrade() else {
                    break;
                };
                if let Err(e) = pass(&ctx) {
                    log::error!("{} pass failed: {}", name, e);
                }
            }
        })?;

    Ok(Worker { name, done, handle })
}

/// `interval` scaled by a random factor in `[0.7, 1.3]`.
fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen_range(0.7..=1.3))
}

/// A segment chosen for compaction.
#[derive(Debug)]
struct Candidate {
    segment: Arc<LogSegment>,
    dirty_ratio: f64,
    size: u64,
    /// Chosen for being smaller than `compaction_segment_min_bytes`
    undersized: bool,
}

/// Runs one compaction pass.
///
/// Every segment but the active one is a candidate. A candidate is compacted when its
/// dirty ratio reaches `min_dirty_ratio` or when it is smaller than
/// `compaction_segment_min_bytes`; a single small segment alone is left as is since
/// rewriting it would not shrink anything. A dirty segment is left as is too when every
/// one of its records has to be kept, which happens to tombstones shadowing older values
/// in a segment outside the pass.
pub(crate) fn compact(ctx: &Context) -> Result<CompactionStats> {
    let _pass = ctx.compaction.lock();

    // Taken under the active lock: every record of the candidates predates the snapshot.
    let (snapshot, candidates) = {
        let active = ctx.active.lock();
        let active_id = active.writer.segment().id();
        let snapshot = ctx.keydir.timestamps();
        let candidates: Vec<Arc<LogSegment>> = ctx
            .segments
            .read()
            .values()
            .filter(|segment| segment.id() != active_id)
            .cloned()
            .collect();
        (snapshot, candidates)
    };
    let now = timestamp_as_u64()?;

    let mut selected = Vec::new();
    let mut remaining = Vec::new();
    for segment in &candidates {
        let dirty_ratio = segment.dirty_ratio(&snapshot)?;
        let size = segment.size()?;
        log::debug!(
            "Log segment {}: dirty ratio {:.2}, {} bytes",
            segment.name(),
            dirty_ratio,
            size
        );
        let undersized = size < ctx.config.compaction_segment_min_bytes;
        if dirty_ratio >= ctx.config.min_dirty_ratio || undersized {
            selected.push(Candidate {
                segment: Arc::clone(segment),
                dirty_ratio,
                size,
                undersized,
            });
        } else {
            remaining.push(Arc::clone(segment));
        }
    }

    let shadowing = shadowing_keys(&selected, now)?;
    let mut survivors = KeyTimestamps::new();
    for segment in &remaining {
        add_oldest_timestamps(&mut survivors, segment, &shadowing)?;
    }
    loop {
        let mut kept = Vec::with_capacity(selected.len());
        let mut released = false;
        for candidate in selected {
            if candidate.undersized
                || reclaimable(&candidate.segment, &snapshot, &survivors, now)? > 0
            {
                kept.push(candidate);
                continue;
            }
            log::debug!(
                "Log segment {} has nothing to reclaim, leaving it as is",
                candidate.segment.name()
            );
            add_oldest_timestamps(&mut survivors, &candidate.segment, &shadowing)?;
            released = true;
        }
        selected = kept;
        if !released {
            break;
        }
    }

    match selected.as_slice() {
        [] => return Ok(CompactionStats::default()),
        [only] if only.size < ctx.config.compaction_segment_min_bytes => {
            log::debug!("Skipping compaction of lone small segment {}", only.segment.name());
            return Ok(CompactionStats::default());
        }
        _ => {}
    }

    log::info!(
        "Compacting {} segments: {}",
        selected.len(),
        selected
            .iter()
            .map(|c| format!("{} ({:.2})", c.segment.name(), c.dirty_ratio))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut output = CompactionOutput::new(ctx);
    let copied = copy_live_records(ctx, &selected, &snapshot, &survivors, now, &mut output);
    let written = output.finish();
    let (records_copied, written) = (copied?, written?);

    let mut stats = CompactionStats {
        segments_written: written.len(),
        records_copied,
        ..CompactionStats::default()
    };
    let written_bytes: u64 = written.iter().sum();
    let source_bytes: u64 = selected.iter().map(|c| c.size).sum();
    stats.bytes_reclaimed = source_bytes.saturating_sub(written_bytes);

    for candidate in &selected {
        ctx.segments.write().remove(&candidate.segment.id());
        candidate.segment.mark_as_deleted();
        stats.segments_compacted += 1;
    }
    Ok(stats)
}

/// Whether a record of a compacted segment has to be copied to the output.
///
/// Live values are copied. Tombstones and expired records are copied while a segment
/// outside the pass holds an older record of the key, otherwise that record would come
/// back on the next recovery. `survivors` maps those keys to their oldest timestamp.
fn retains(
    header: &Header,
    key: &[u8],
    snapshot: &KeyTimestamps,
    survivors: &KeyTimestamps,
    now: u64,
) -> bool {
    if header.value_size == 0 || header.is_expired(now) {
        let shadows = survivors
            .get(key)
            .is_some_and(|&oldest| oldest <= header.timestamp);
        shadows
            && snapshot
                .get(key)
                .map_or(true, |&latest| latest <= header.timestamp)
    } else {
        !is_stale(header, key, snapshot, now)
    }
}

/// Number of records of `segment` compaction would drop.
fn reclaimable(
    segment: &LogSegment,
    snapshot: &KeyTimestamps,
    survivors: &KeyTimestamps,
    now: u64,
) -> Result<usize> {
    let mut count = 0;
    segment.for_each_key(|header, key| {
        if !retains(header, key, snapshot, survivors, now) {
            count += 1;
        }
    })?;
    Ok(count)
}

/// Keys of the tombstones and expired records of `selected`.
fn shadowing_keys(selected: &[Candidate], now: u64) -> Result<HashSet<Vec<u8>>> {
    let mut keys = HashSet::new();
    for candidate in selected {
        candidate.segment.for_each_key(|header, key| {
            if header.value_size == 0 || header.is_expired(now) {
                keys.insert(key.to_vec());
            }
        })?;
    }
    Ok(keys)
}

/// Records the oldest timestamp `segment` holds for each of the `shadowing` keys.
fn add_oldest_timestamps(
    survivors: &mut KeyTimestamps,
    segment: &LogSegment,
    shadowing: &HashSet<Vec<u8>>,
) -> Result<()> {
    if shadowing.is_empty() {
        return Ok(());
    }
    segment.for_each_key(|header, key| {
        if !shadowing.contains(key) {
            return;
        }
        match survivors.get_mut(key) {
            Some(oldest) => *oldest = (*oldest).min(header.timestamp),
            None => {
                survivors.insert(key.to_vec(), header.timestamp);
            }
        }
    })
}

/// Copies the records of `selected` that must survive into `output` and points the keydir
/// at the copied values.
fn copy_live_records(
    ctx: &Context,
    selected: &[Candidate],
    snapshot: &KeyTimestamps,
    survivors: &KeyTimestamps,
    now: u64,
    output: &mut CompactionOutput<'_>,
) -> Result<usize> {
    let mut copied = 0;
    for candidate in selected {
        let records = candidate
            .segment
            .scan(|header: &Header, key: &[u8]| retains(header, key, snapshot, survivors, now))?;

        for record in records {
            let record = record?;
            let target = output.append(&record)?;
            if !record.is_tombstone() && !record.is_expired(now) {
                ctx.keydir.relocate(&record, &target)?;
            }
            copied += 1;
        }
    }
    Ok(copied)
}

/// Rolling set of segments receiving the copied records, each with its hint segment.
struct CompactionOutput<'a> {
    ctx: &'a Context,
    current: Option<(Arc<LogSegment>, HintSegment)>,
    /// Sizes of the finished segments
    written: Vec<u64>,
}

impl<'a> CompactionOutput<'a> {
    fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            current: None,
            written: Vec::new(),
        }
    }

    /// Appends `record` and its hint, rolling over when the current segment is full.
    /// Returns the segment the record went to.
    fn append(&mut self, record: &Record) -> Result<Arc<LogSegment>> {
        if let Some((segment, _)) = &self.current {
            if segment.size()? >= self.ctx.config.segment_bytes {
                self.finish_current()?;
            }
        }

        let current = match self.current.take() {
            Some(current) => current,
            None => {
                let segment = self.ctx.open_segment()?;
                let hints = HintSegment::create(hint_path_for(segment.path()))?;
                log::debug!("Compacting into log segment {}", segment.name());
                (segment, hints)
            }
        };
        let (segment, hints) = self.current.insert(current);

        segment.append(record)?;
        let value_position = segment.position()? - record.value_size() as u64;
        hints.append(&Hint::of(record, value_position))?;
        Ok(Arc::clone(segment))
    }

    /// The data is flushed before the hint is committed, so a hint never describes
    /// records that are not on disk.
    fn finish_current(&mut self) -> Result<()> {
        if let Some((segment, hints)) = self.current.take() {
            segment.mark_as_read_only()?;
            hints.commit()?;
            self.written.push(segment.size()?);
        }
        Ok(())
    }

    /// Finishes the last segment and returns the sizes of all written segments.
    fn finish(mut self) -> Result<Vec<u64>> {
        self.finish_current()?;
        Ok(self.written)
    }
}

/// Removes every soft-deleted file of `dir`. Returns the number of files removed.
///
/// Failures are logged and the file is left for the next sweep.
pub(crate) fn clean(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().ends_with(DELETED_SUFFIX) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                log::info!("Removed {}", entry.path().display());
                removed += 1;
            }
            Err(e) => log::warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Bitcask;

    fn config(dir: &Path) -> Config {
        Config {
            dir: dir.to_path_buf(),
            segment_bytes: 512,
            compaction_interval: Duration::ZERO,
            min_dirty_ratio: 0.5,
            compaction_segment_min_bytes: 0,
            ..Config::default()
        }
    }

    fn files_with_suffix(dir: &Path, suffix: &str) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if name.ends_with(suffix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_secs(10);
        for _ in 0..100 {
            let delay = jittered(interval);
            assert!(delay >= Duration::from_secs(7));
            assert!(delay <= Duration::from_secs(13));
        }
    }

    #[test]
    fn test_compaction_keeps_live_data() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(Config {
            min_dirty_ratio: 0.0,
            ..config(temp.path())
        })?;

        for round in 0..5u32 {
            for i in 0..20u32 {
                db.put(
                    format!("key{}", i).into_bytes(),
                    format!("value{}-{}", i, round).into_bytes(),
                )?;
            }
        }
        for i in 0..5u32 {
            db.delete(format!("key{}", i).into_bytes())?;
        }
        let segments_before = files_with_suffix(temp.path(), ".log")?.len();

        let stats = db.compact()?;
        assert!(stats.segments_compacted > 0);
        assert!(stats.bytes_reclaimed > 0);
        assert!(files_with_suffix(temp.path(), ".log")?.len() < segments_before);
        assert!(!files_with_suffix(temp.path(), ".hint")?.is_empty());

        for i in 0..5u32 {
            assert_eq!(db.get(format!("key{}", i).as_bytes())?, None);
        }
        for i in 5..20u32 {
            assert_eq!(
                db.get(format!("key{}", i).as_bytes())?,
                Some(format!("value{}-4", i).into_bytes())
            );
        }

        assert_eq!(db.clean()?, stats.segments_compacted);
        assert!(files_with_suffix(temp.path(), ".deleted")?.is_empty());
        drop(db);

        // Recovery from the compacted segments and their hints.
        let db = Bitcask::open_with(config(temp.path()))?;
        assert_eq!(db.size(), 15);
        for i in 5..20u32 {
            assert_eq!(
                db.get(format!("key{}", i).as_bytes())?,
                Some(format!("value{}-4", i).into_bytes())
            );
        }
        for i in 0..5u32 {
            assert_eq!(db.get(format!("key{}", i).as_bytes())?, None);
        }
        Ok(())
    }

    #[test]
    fn test_nothing_to_compact() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;
        assert_eq!(db.compact()?, CompactionStats::default());

        // Unique keys only: no segment is dirty.
        for i in 0..40u32 {
            db.put(format!("key{}", i).into_bytes(), vec![b'v'; 16])?;
        }
        assert_eq!(db.compact()?, CompactionStats::default());
        Ok(())
    }

    #[test]
    fn test_lone_small_segment_is_skipped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(Config {
            compaction_segment_min_bytes: 1024 * 1024,
            ..config(temp.path())
        })?;

        // Fill exactly one segment past the threshold, then one record in the next.
        let mut i = 0u32;
        while files_with_suffix(temp.path(), ".log")?.len() < 2 {
            db.put(format!("key{}", i).into_bytes(), vec![b'v'; 16])?;
            i += 1;
        }
        assert_eq!(db.compact()?, CompactionStats::default());
        Ok(())
    }

    #[test]
    fn test_tombstones_survive_when_older_segment_remains() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(Config {
            min_dirty_ratio: 1.0,
            ..config(temp.path())
        })?;

        // First segment: one value that stays live keeps it out of compaction.
        db.put(b"keep".to_vec(), vec![b'k'; 16])?;
        let mut written = 0u32;
        while files_with_suffix(temp.path(), ".log")?.len() < 2 {
            db.put(format!("key{}", written).into_bytes(), vec![b'a'; 16])?;
            written += 1;
        }

        // Second segment: tombstones of the first segment's keys and a superseded value.
        for i in 0..written {
            db.delete(format!("key{}", i).into_bytes())?;
        }
        db.put(b"roll".to_vec(), vec![b'r'; 600])?;
        db.put(b"roll".to_vec(), vec![b'r'; 10])?;
        assert_eq!(db.size(), 2);

        let stats = db.compact()?;
        assert_eq!(stats.segments_compacted, 1);
        assert_eq!(stats.records_copied, written as usize);

        // The copied tombstones are all still needed: the next pass leaves them alone.
        assert_eq!(db.compact()?, CompactionStats::default());
        drop(db);

        let db = Bitcask::open_with(config(temp.path()))?;
        for i in 0..written {
            assert_eq!(db.get(format!("key{}", i).as_bytes())?, None);
        }
        assert_eq!(db.size(), 2);
        assert_eq!(db.get(b"roll")?, Some(vec![b'r'; 10]));
        Ok(())
    }

    #[test]
    fn test_tombstones_are_dropped_when_no_older_value_remains() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(config(temp.path()))?;

        // First segment: unique live keys only, it is never dirty.
        let mut live = 0u32;
        while files_with_suffix(temp.path(), ".log")?.len() < 2 {
            db.put(format!("live{}", live).into_bytes(), vec![b'l'; 16])?;
            live += 1;
        }

        // Second segment: a key written and deleted there, then overwrites of another key.
        db.put(b"gone".to_vec(), vec![b'g'; 16])?;
        db.delete(b"gone".to_vec())?;
        while files_with_suffix(temp.path(), ".log")?.len() < 3 {
            db.put(b"churn".to_vec(), vec![b'c'; 16])?;
        }
        db.put(b"churn".to_vec(), b"last".to_vec())?;

        let stats = db.compact()?;
        assert_eq!(stats.segments_compacted, 1);
        assert_eq!(stats.records_copied, 0);
        assert_eq!(stats.segments_written, 0);
        drop(db);

        let db = Bitcask::open_with(config(temp.path()))?;
        assert_eq!(db.size(), live as usize + 1);
        assert_eq!(db.get(b"gone")?, None);
        assert_eq!(db.get(b"churn")?, Some(b"last".to_vec()));
        Ok(())
    }

    #[test]
    fn test_clean_removes_deleted_files_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("00000000000000000001.log.deleted"), b"")?;
        fs::write(temp.path().join("00000000000000000001.hint.deleted"), b"")?;
        fs::write(temp.path().join("00000000000000000002.log"), b"")?;

        assert_eq!(clean(temp.path())?, 2);
        assert_eq!(
            files_with_suffix(temp.path(), "")?,
            vec!["00000000000000000002.log".to_string()]
        );
        Ok(())
    }

    #[test]
    fn test_background_cleaner_shuts_down() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let db = Bitcask::open_with(Config {
            compaction_interval: Duration::from_millis(20),
            ..config(temp.path())
        })?;

        for round in 0..3u32 {
            for i in 0..20u32 {
                db.put(format!("key{}", i).into_bytes(), round.to_le_bytes().to_vec())?;
            }
        }
        thread::sleep(Duration::from_millis(200));
        for i in 0..20u32 {
            assert_eq!(
                db.get(format!("key{}", i).as_bytes())?,
                Some(2u32.to_le_bytes().to_vec())
            );
        }
        db.close()?;
        Ok(())
    }
}
