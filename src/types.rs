//! Core domain types for the stream store.
//!
//! This module defines the data types every other module depends on: messages as
//! proposed by callers and as recorded by the store, expected version semantics for
//! optimistic concurrency, read positions, pages, metadata results and subscription
//! messages. None of these types carry logic beyond small conversions.

use bytes::Bytes;
use uuid::Uuid;

/// Maximum length of a message type tag in bytes.
pub const MAX_MESSAGE_TYPE_LEN: usize = 256;

/// A message the caller wants to append to a stream.
///
/// The caller assigns the `message_id`. The store does not enforce uniqueness of
/// message ids across calls; it only recognises an exact resend of a stream's most
/// recent batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStreamMessage {
    /// Caller-assigned id for this message.
    pub message_id: Uuid,
    /// Type discriminator (UTF-8, 1..=256 bytes).
    pub message_type: String,
    /// Opaque message body.
    pub payload: Bytes,
    /// Opaque message metadata.
    pub metadata: Bytes,
}

impl NewStreamMessage {
    /// Build a message with empty metadata.
    pub fn new(message_id: Uuid, message_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            payload: payload.into(),
            metadata: Bytes::new(),
        }
    }

    /// Attach opaque metadata to the message.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// A committed message with store-assigned positions.
///
/// `stream_version` is zero-based and gap-free within the stream; `checkpoint` is
/// unique and strictly increasing across the whole store. Both are assigned exactly
/// once at commit time and never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Stream this message belongs to.
    pub stream_id: String,
    /// Caller-assigned message id.
    pub message_id: Uuid,
    /// Zero-based version within the stream.
    pub stream_version: u64,
    /// Position in the global log.
    pub checkpoint: u64,
    /// Unix epoch milliseconds from the store clock.
    pub created_utc: u64,
    /// Type discriminator.
    pub message_type: String,
    /// Opaque message body.
    pub payload: Bytes,
    /// Opaque message metadata.
    pub metadata: Bytes,
}

/// Optimistic concurrency precondition for appends, deletes and metadata writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check.
    Any,
    /// The stream must not exist.
    NoStream,
    /// The stream's current version must be exactly this value.
    Exact(u64),
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("Any"),
            ExpectedVersion::NoStream => f.write_str("NoStream"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Inclusive starting point for a read over the global log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// The lowest checkpoint.
    Start,
    /// Past the head for forward reads, the head for backward reads.
    End,
    /// An explicit checkpoint.
    Checkpoint(u64),
}

/// Inclusive starting point for a read over a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVersion {
    /// Version 0.
    Start,
    /// Past the last version for forward reads, the last version for backward reads.
    End,
    /// An explicit stream version.
    Version(u64),
}

/// Direction a page was read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// Ascending positions.
    Forward,
    /// Descending positions.
    Backward,
}

/// Outcome of a stream read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageReadStatus {
    /// The stream exists; the page may still be empty.
    Success,
    /// The stream has never been written, or has been deleted.
    StreamNotFound,
}

/// A page of the global log.
#[derive(Debug, Clone, PartialEq)]
pub struct AllMessagesPage {
    /// Checkpoint the page actually started from.
    pub from_checkpoint: u64,
    /// Checkpoint to request for the following page in the same direction.
    pub next_checkpoint: u64,
    /// `true` when no further messages exist in this direction.
    pub is_end: bool,
    /// Direction the page was read in.
    pub direction: ReadDirection,
    /// Messages in read order.
    pub messages: Vec<StreamMessage>,
}

/// A page of a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessagesPage {
    /// Stream that was read.
    pub stream_id: String,
    /// Whether the stream exists.
    pub status: PageReadStatus,
    /// Version the read started from after resolving `Start`/`End`.
    pub from_version: u64,
    /// Version to request for the following page in the same direction.
    pub next_version: u64,
    /// Highest version ever issued to the stream, `None` when it does not exist.
    pub last_stream_version: Option<u64>,
    /// Direction the page was read in.
    pub direction: ReadDirection,
    /// `true` when no further messages exist in this direction.
    pub is_end: bool,
    /// Messages in read order.
    pub messages: Vec<StreamMessage>,
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Version of the last message of the batch.
    pub current_version: u64,
    /// Checkpoint of the last message of the batch.
    pub current_position: u64,
}

/// Retention policy and custom metadata of a stream.
///
/// Every field is derived from the latest message of the stream's metadata stream;
/// all optional fields are `None` when no metadata was ever written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadataResult {
    /// Stream the metadata applies to.
    pub stream_id: String,
    /// Version of the latest message in the metadata stream.
    pub metadata_stream_version: Option<u64>,
    /// Maximum message age in seconds.
    pub max_age: Option<u32>,
    /// Maximum number of live messages.
    pub max_count: Option<u32>,
    /// Free-form JSON supplied by the caller.
    pub custom_metadata: Option<String>,
}

/// New metadata for a stream, written with [`StreamStore::set_stream_metadata`].
///
/// [`StreamStore::set_stream_metadata`]: crate::store::StreamStore::set_stream_metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetStreamMetadata {
    /// Maximum message age in seconds.
    pub max_age: Option<u32>,
    /// Maximum number of live messages.
    pub max_count: Option<u32>,
    /// Free-form JSON.
    pub custom_metadata: Option<String>,
}

/// An item yielded by the pull-based subscription streams.
///
/// `CaughtUp` is yielded once, after the last historical message and before the first
/// live one.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    /// A committed message.
    Message(StreamMessage),
    /// End of the catch-up phase.
    CaughtUp,
}
