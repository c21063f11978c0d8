//! streamstore: an in-memory, append-only message stream store.
//!
//! Messages are appended to named streams under optimistic concurrency and also land
//! in a single global log ordered by checkpoint. The store supports paged reads in
//! both directions, per-stream metadata with max-count and max-age retention, single
//! message and whole stream deletion with tombstones, and catch-up-then-live
//! subscriptions.

pub mod broker;
pub mod clock;
pub mod codec;
pub mod config;
mod dedup;
pub mod error;
pub mod index;
pub mod log;
pub mod metrics;
mod reader;
mod retention;
pub mod store;
pub mod subscription;
pub mod types;
mod writer;

pub use broker::SubscriptionStream;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::Tombstone;
pub use config::StoreConfig;
pub use error::Error;
pub use store::StreamStore;
pub use subscription::{
    HandlerError, Subscription, SubscriptionDropReason, SubscriptionDropped, SubscriptionState,
};
pub use tokio_util::sync::CancellationToken;
pub use types::{
    AllMessagesPage, AppendResult, ExpectedVersion, MAX_MESSAGE_TYPE_LEN, NewStreamMessage,
    PageReadStatus, Position, ReadDirection, SetStreamMetadata, StreamMessage,
    StreamMessagesPage, StreamMetadataResult, StreamVersion, SubscriptionMessage,
};
