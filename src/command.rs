use std::{env, path::PathBuf, time::Duration};

use anyhow::bail;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::db::Bitcask;
use crate::record::timestamp_as_u64;
use crate::verify::verify_dir;

/// kiwi cli
#[derive(Parser, Debug)]
#[clap(
    version = "0.1.0",
    about = "Kiwi is a Bitcask-style key-value store written in Rust."
)]
pub struct Kiwi {
    /// Sets logging to "debug" level, defaults to "info"
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Log directory of the store
    #[clap(long, global = true, env = "KIWI_PATH", default_value = "./kiwi_data")]
    pub dir: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Get a value from the store
    Get {
        /// sets the key to get
        #[clap(long)]
        key: String,
    },
    /// Put a value into the store
    Put {
        /// sets the key to put
        #[clap(long)]
        key: String,

        /// sets the value to put
        #[clap(long)]
        value: String,

        /// expires the value after this many milliseconds
        #[clap(long)]
        ttl: Option<u64>,
    },
    /// Delete a key from the store
    Delete {
        /// sets the key to delete
        #[clap(long)]
        key: String,
    },
    /// Compact the log and remove the retired segments
    Compact,
    /// Verify the checksum of every record
    Verify {
        /// number of segments verified in parallel
        #[clap(long, default_value_t = 4)]
        threads: usize,
    },
}

impl Kiwi {
    pub fn exec(self) -> anyhow::Result<()> {
        if self.verbose {
            env::set_var("RUST_LOG", "debug")
        } else if env::var_os("RUST_LOG").is_none() {
            env::set_var("RUST_LOG", "info")
        }
        env_logger::init();

        if let Command::Verify { threads } = self.command {
            let failures = verify_dir(&self.dir, threads)?;
            for failure in &failures {
                println!("{}", failure);
            }
            if !failures.is_empty() {
                bail!("{} records failed checksum verification", failures.len());
            }
            return Ok(());
        }

        // One-shot commands never run the background cleaner.
        let db = Bitcask::open_with(Config {
            dir: self.dir,
            compaction_interval: Duration::ZERO,
            ..Config::default()
        })?;

        match self.command {
            Command::Get { key } => match db.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => bail!("key not found: {}", key),
            },
            Command::Put { key, value, ttl } => {
                let expiry = expiry_after(ttl, timestamp_as_u64()?)?;
                db.put_with_ttl(key.into_bytes(), value.into_bytes(), expiry)?;
            }
            Command::Delete { key } => db.delete(key.into_bytes())?,
            Command::Compact => {
                let stats = db.compact()?;
                let removed = db.clean()?;
                println!(
                    "compacted {} segments into {}, copied {} records, reclaimed {} bytes, removed {} files",
                    stats.segments_compacted,
                    stats.segments_written,
                    stats.records_copied,
                    stats.bytes_reclaimed,
                    removed
                );
            }
            Command::Verify { .. } => {}
        }

        db.close()?;
        Ok(())
    }
}

/// Expiry instant of a value written at `now` that lives for `ttl` milliseconds, `0` for
/// a value that never expires.
fn expiry_after(ttl: Option<u64>, now: u64) -> anyhow::Result<u64> {
    match ttl {
        Some(ttl) => match now.checked_add(ttl) {
            Some(expiry) => Ok(expiry),
            None => bail!("ttl of {} ms is too large", ttl),
        },
        None => Ok(0),
    }
}
