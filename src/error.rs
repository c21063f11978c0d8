//! Error types for the stream store.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. A missing stream is not an error: stream reads
//! report it through [`PageReadStatus::StreamNotFound`](crate::types::PageReadStatus).

/// Unified error type for all stream store operations.
///
/// - `WrongExpectedVersion` is surfaced to the caller and never retried internally.
/// - `Disposed` is returned by every call made after [`StreamStore::dispose`].
/// - `Cancelled` means the caller's cancellation token fired before any mutation.
///
/// [`StreamStore::dispose`]: crate::store::StreamStore::dispose
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Optimistic concurrency check failed: the stream's current version does not
    /// match the caller's expectation.
    #[error("wrong expected version on stream '{stream_id}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        /// Stream the append, delete or metadata write targeted.
        stream_id: String,
        /// The version the caller expected the stream to be at.
        expected: String,
        /// The version the stream is actually at.
        actual: String,
    },

    /// The store has been disposed and accepts no further calls.
    #[error("stream store has been disposed")]
    Disposed,

    /// The caller cancelled the operation while it was waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A metadata or tombstone message written by the store could not be decoded.
    #[error("corrupt system message in stream '{stream_id}': {detail}")]
    CorruptSystemMessage {
        /// Stream holding the undecodable message.
        stream_id: String,
        /// Decoder error text.
        detail: String,
    },
}

impl Error {
    /// Returns `true` for optimistic concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::WrongExpectedVersion { .. })
    }
}
