//! Error taxonomy for archive parsing and part extraction.
//!
//! Parsing and streaming code returns [`BurstError`], whose variants map
//! one-to-one onto the failure kinds callers need to tell apart. The
//! orchestration layer and the binary wrap these in `anyhow` with context.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the parsing and streaming core.
pub type Result<T> = std::result::Result<T, BurstError>;

/// Failure kinds, without payload. Handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    Truncated,
    InvalidSignature,
    NoEocd,
    Zip64Unsupported,
    NeedMoreData,
    Io,
    WriteBackendError,
    UnexpectedEof,
    ProtocolViolation,
}

/// Errors raised by the archive core.
///
/// The type is `Clone` so a failed part processor can hand the same error
/// back on every later call.
#[derive(Debug, Clone, Error)]
pub enum BurstError {
    /// Malformed caller input (bad part size, unsafe path, mismatched slices).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Fewer bytes available than a structure declares.
    #[error("truncated: {0}")]
    Truncated(String),

    /// A record's magic did not match where one was required.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("no end of central directory record found")]
    NoEocd,

    #[error("ZIP64 not supported: {0}")]
    Zip64Unsupported(String),

    /// Not a failure: the caller must supply bytes starting at this archive
    /// offset and retry.
    #[error("need more data from archive offset {0}")]
    NeedMoreData(u64),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The compressed-write capability failed for a reason other than
    /// "needs fallback".
    #[error("compressed write failed: {0}")]
    WriteBackendError(String),

    /// Carry-over bytes were left when a part was finalized.
    #[error("unexpected end of part: {0}")]
    UnexpectedEof(String),

    /// The frame sequence broke the part state machine's expectations.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl BurstError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BurstError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BurstError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            BurstError::Truncated(_) => ErrorKind::Truncated,
            BurstError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            BurstError::NoEocd => ErrorKind::NoEocd,
            BurstError::Zip64Unsupported(_) => ErrorKind::Zip64Unsupported,
            BurstError::NeedMoreData(_) => ErrorKind::NeedMoreData,
            BurstError::Io { .. } => ErrorKind::Io,
            BurstError::WriteBackendError(_) => ErrorKind::WriteBackendError,
            BurstError::UnexpectedEof(_) => ErrorKind::UnexpectedEof,
            BurstError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        BurstError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

impl From<io::Error> for BurstError {
    fn from(source: io::Error) -> Self {
        BurstError::io("I/O error", source)
    }
}
