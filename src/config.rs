//! Store configuration.

use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};
use crate::writer::SyncPolicy;

/// Configuration of a [`crate::Bitcask`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the log segments, hint files and the process lock
    pub dir: PathBuf,

    /// Size after which the active segment is rolled, also the size of compacted segments
    pub segment_bytes: u64,

    /// Average delay between two compaction passes, and between two cleanup sweeps.
    /// `Duration::ZERO` disables the background log cleaner.
    pub compaction_interval: Duration,

    /// Fraction of stale records from which a segment is compacted
    pub min_dirty_ratio: f64,

    /// Segments smaller than this are compacted whatever their dirty ratio
    pub compaction_segment_min_bytes: u64,

    /// Worker threads used to build the keydir at startup
    pub keydir_builder_threads: usize,

    /// When appended records are flushed to disk
    pub sync: SyncPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./kiwi_data"),
            segment_bytes: 64 * 1024 * 1024, // 64 MB
            compaction_interval: Duration::from_secs(10 * 60),
            min_dirty_ratio: 0.5,
            compaction_segment_min_bytes: 1024 * 1024, // 1 MB
            keydir_builder_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            sync: SyncPolicy::Lazy,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Default configuration for the store at `dir`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns `Error::Config` if:
    /// * `min_dirty_ratio` is not within `[0, 1]`
    /// * `segment_bytes` is zero
    /// * `keydir_builder_threads` is zero
    /// * a batch sync policy flushes every zero records
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_dirty_ratio) {
            return Err(Error::Config(format!(
                "min_dirty_ratio must be within [0, 1], got {}",
                self.min_dirty_ratio
            )));
        }
        if self.segment_bytes == 0 {
            return Err(Error::Config("segment_bytes must be greater than 0".into()));
        }
        if self.keydir_builder_threads == 0 {
            return Err(Error::Config(
                "keydir_builder_threads must be greater than 0".into(),
            ));
        }
        match self.sync {
            SyncPolicy::Batch { records: 0 } => Err(Error::Config(
                "batch sync policy needs at least one record per batch".into(),
            )),
            SyncPolicy::Periodic { interval } if interval.is_zero() => Err(Error::Config(
                "periodic sync policy needs a non-zero interval".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the log directory
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dir = dir.into();
        self
    }

    /// Set the segment size threshold (in bytes)
    pub fn segment_bytes(mut self, bytes: u64) -> Self {
        self.config.segment_bytes = bytes;
        self
    }

    /// Set the compaction interval, `Duration::ZERO` disables the log cleaner
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_interval = interval;
        self
    }

    pub fn min_dirty_ratio(mut self, ratio: f64) -> Self {
        self.config.min_dirty_ratio = ratio;
        self
    }

    /// Set the size under which segments are always compacted (in bytes)
    pub fn compaction_segment_min_bytes(mut self, bytes: u64) -> Self {
        self.config.compaction_segment_min_bytes = bytes;
        self
    }

    pub fn keydir_builder_threads(mut self, threads: usize) -> Self {
        self.config.keydir_builder_threads = threads;
        self
    }

    /// Set the sync policy
    pub fn sync(mut self, policy: SyncPolicy) -> Self {
        self.config.sync = policy;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
