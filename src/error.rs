//! Error type shared by every kiwi operation.

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to write to log segment '{segment}'")]
    Write {
        segment: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read from log segment '{segment}'")]
    Read {
        segment: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Truncated record: expected {expected} bytes, found {actual}")]
    TruncatedRecord { expected: usize, actual: usize },

    #[error("Key size must be greater than 0")]
    InvalidEmptyKey,

    #[error("Value size must be greater than 0")]
    InvalidEmptyValue,

    #[error("Key of {size} bytes exceeds the maximum record key size")]
    KeyTooLarge { size: usize },

    #[error("Value of {size} bytes exceeds the maximum record value size")]
    ValueTooLarge { size: usize },

    #[error("Only one writer allowed at a time")]
    WriterLock,

    #[error("Invalid log segment name '{filename}'")]
    InvalidSegmentName { filename: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timestamp error: {0}")]
    TimestampError(#[from] std::time::SystemTimeError),

    #[error("Timestamp overflow, converting to u64: {0}")]
    TimestampOverflow(#[from] std::num::TryFromIntError),
}

impl Error {
    pub(crate) fn write(segment: impl Into<String>, source: std::io::Error) -> Self {
        Self::Write {
            segment: segment.into(),
            source,
        }
    }

    pub(crate) fn read(segment: impl Into<String>, source: std::io::Error) -> Self {
        Self::Read {
            segment: segment.into(),
            source,
        }
    }
}
