//! Error types for essence reading.

use thiserror::Error;

use crate::ul::UniversalLabel;

/// Result type for essence reading operations.
pub type Result<T> = std::result::Result<T, EssenceError>;

/// Errors that can occur while mapping positions and reading essence.
#[derive(Error, Debug)]
pub enum EssenceError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An essence offset or file position is not covered by any chunk.
    #[error("{0} not covered by the essence container")]
    NotFound(String),

    /// A content package begins with a key different from the first one seen.
    #[error("content package starts with {found} instead of {expected}")]
    StartKeyMismatch {
        expected: UniversalLabel,
        found: UniversalLabel,
    },

    /// Bytes consumed in a content package disagree with the index table.
    #[error(
        "content package size 0x{read:x} does not match indexed size 0x{indexed:x} \
         at file position 0x{file_position:x}"
    )]
    IndexMismatch {
        read: i64,
        indexed: i64,
        file_position: i64,
    },

    /// The underlying read returned fewer bytes than requested.
    #[error("short read: requested {requested} bytes, got {read}")]
    ShortRead { requested: u64, read: u64 },

    /// Structural impossibility in the file.
    #[error("malformed file: {0}")]
    Malformed(String),

    /// Caller precondition violation.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
}
