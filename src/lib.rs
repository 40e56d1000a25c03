//! Kiwi is a Bitcask-style embedded key-value store.
//!
//! Records are appended to log segments on disk and an in-memory keydir maps every live
//! key to the location of its latest value, so a read costs one lookup and one positioned
//! read. A background log cleaner compacts segments dominated by overwritten, deleted or
//! expired records.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = kiwi::Bitcask::open_with(
//!     kiwi::Config::builder()
//!         .dir("my_db")
//!         .sync(kiwi::SyncPolicy::Batch { records: 100 })
//!         .build()?,
//! )?;
//! db.put(b"key".to_vec(), b"value".to_vec())?;
//! assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod hint;
pub mod keydir;
pub mod naming;
pub mod record;
pub mod segment;
pub mod verify;
pub mod writer;

pub use cleaner::CompactionStats;
pub use command::Kiwi;
pub use config::{Config, ConfigBuilder};
pub use db::Bitcask;
pub use error::{Error, Result};
pub use verify::{verify_dir, ChecksumFailure};
pub use writer::SyncPolicy;
