//! Writers appending client records to the active segment.
//!
//! The writers differ only in when appended records are flushed to disk, which is chosen
//! once from [`SyncPolicy`] when the store opens.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::error::Result;
use crate::record::Record;
use crate::segment::LogSegment;

/// When appended records are flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Leave flushing to the operating system
    Lazy,

    /// Flush the active segment from a background thread every `interval`
    Periodic { interval: Duration },

    /// Flush after every `records` appended records
    Batch { records: usize },
}

/// Appends records to the active segment.
///
/// Every writer flushes on [`SegmentWriter::flush`], on [`SegmentWriter::close`] and when
/// it moves on to a new segment.
pub trait SegmentWriter: Send + std::fmt::Debug {
    /// Segment currently written to.
    fn segment(&self) -> &Arc<LogSegment>;

    /// Appends `record` to the current segment and returns the number of bytes written.
    fn append(&mut self, record: &Record) -> Result<usize>;

    /// Flushes the current segment to disk.
    fn flush(&mut self) -> Result<()>;

    /// Flushes the current segment and continues writing to `segment`.
    fn switch_to(&mut self, segment: Arc<LogSegment>) -> Result<()>;

    /// Flushes the current segment and stops any background work.
    fn close(&mut self) -> Result<()>;
}

/// Creates the writer for `policy`, starting on `segment`.
///
/// # Errors
///
/// Returns `Error::Io` if the flusher thread of a periodic writer cannot be spawned.
pub fn segment_writer(
    policy: SyncPolicy,
    segment: Arc<LogSegment>,
) -> Result<Box<dyn SegmentWriter>> {
    Ok(match policy {
        SyncPolicy::Lazy => Box::new(LazySegmentWriter::new(segment)),
        SyncPolicy::Periodic { interval } => {
            Box::new(PeriodicSegmentWriter::start(segment, interval)?)
        }
        SyncPolicy::Batch { records } => Box::new(BatchSegmentWriter::new(segment, records)),
    })
}

#[derive(Debug)]
pub struct LazySegmentWriter {
    segment: Arc<LogSegment>,
}

impl LazySegmentWriter {
    pub fn new(segment: Arc<LogSegment>) -> Self {
        Self { segment }
    }
}

impl SegmentWriter for LazySegmentWriter {
    fn segment(&self) -> &Arc<LogSegment> {
        &self.segment
    }

    fn append(&mut self, record: &Record) -> Result<usize> {
        self.segment.append(record)
    }

    fn flush(&mut self) -> Result<()> {
        self.segment.sync()
    }

    fn switch_to(&mut self, segment: Arc<LogSegment>) -> Result<()> {
        self.flush()?;
        self.segment = segment;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Flushes the current segment from a background thread at a fixed interval.
#[derive(Debug)]
pub struct PeriodicSegmentWriter {
    /// Shared with the flusher thread, which always syncs the current segment
    current: Arc<Mutex<Arc<LogSegment>>>,
    segment: Arc<LogSegment>,
    shutdown: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl PeriodicSegmentWriter {
    pub fn start(segment: Arc<LogSegment>, interval: Duration) -> Result<Self> {
        let current = Arc::new(Mutex::new(Arc::clone(&segment)));
        let (shutdown, stopped) = channel::bounded::<()>(0);
        let ticker = channel::tick(interval);

        let target = Arc::clone(&current);
        let flusher = thread::Builder::new()
            .name("kiwi-sync".into())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stopped) -> _ => break,
                    recv(ticker) -> _ => {
                        let segment = Arc::clone(&target.lock());
                        if let Err(e) = segment.sync() {
                            log::error!("Periodic sync of log segment {} failed: {}", segment.name(), e);
                        }
                    }
                }
            })?;

        log::debug!("Started periodic sync every {:?}", interval);
        Ok(Self {
            current,
            segment,
            shutdown: Some(shutdown),
            flusher: Some(flusher),
        })
    }
}

impl SegmentWriter for PeriodicSegmentWriter {
    fn segment(&self) -> &Arc<LogSegment> {
        &self.segment
    }

    fn append(&mut self, record: &Record) -> Result<usize> {
        self.segment.append(record)
    }

    fn flush(&mut self) -> Result<()> {
        self.segment.sync()
    }

    fn switch_to(&mut self, segment: Arc<LogSegment>) -> Result<()> {
        self.flush()?;
        *self.current.lock() = Arc::clone(&segment);
        self.segment = segment;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the sender disconnects the channel and wakes the flusher.
        self.shutdown.take();
        if let Some(flusher) = self.flusher.take() {
            if flusher.join().is_err() {
                log::error!("Periodic sync thread panicked");
            }
        }
        self.flush()
    }
}

impl Drop for PeriodicSegmentWriter {
    fn drop(&mut self) {
        if self.flusher.is_some() {
            if let Err(e) = self.close() {
                log::error!("Failed to close periodic segment writer: {}", e);
            }
        }
    }
}

/// Flushes after a fixed number of appended records.
#[derive(Debug)]
pub struct BatchSegmentWriter {
    segment: Arc<LogSegment>,
    batch_size: usize,
    pending: usize,
}

impl BatchSegmentWriter {
    pub fn new(segment: Arc<LogSegment>, batch_size: usize) -> Self {
        Self {
            segment,
            batch_size: batch_size.max(1),
            pending: 0,
        }
    }
}

impl SegmentWriter for BatchSegmentWriter {
    fn segment(&self) -> &Arc<LogSegment> {
        &self.segment
    }

    fn append(&mut self, record: &Record) -> Result<usize> {
        let written = self.segment.append(record)?;
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.flush()?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        self.segment.sync()?;
        self.pending = 0;
        Ok(())
    }

    fn switch_to(&mut self, segment: Arc<LogSegment>) -> Result<()> {
        self.flush()?;
        self.segment = segment;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}
