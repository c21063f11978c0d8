//! The in-memory stream store.
//!
//! [`StreamStore`] is a cheaply cloneable handle to one store: a global log and a
//! stream index behind a single `tokio::sync::RwLock`, a notification broker and a
//! clock. Mutations take the write lock and finish synchronously once it is held, so
//! an operation either happens completely or not at all, even when its future is
//! dropped. Waiting for the lock races the caller's cancellation token and the
//! store's disposal token.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{self, Broker, SubscriptionStream};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::Error;
use crate::index::StreamIndex;
use crate::log::GlobalLog;
use crate::metrics;
use crate::retention::Removed;
use crate::subscription::{self, HandlerError, Subscription, SubscriptionDropped};
use crate::writer;
use crate::types::{
    AllMessagesPage, AppendResult, ExpectedVersion, NewStreamMessage, Position,
    SetStreamMetadata, StreamMessage, StreamMessagesPage, StreamMetadataResult, StreamVersion,
};

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    /// Every live message, keyed by checkpoint.
    pub(crate) log: GlobalLog,
    /// Stream headers and their live slots.
    pub(crate) streams: StreamIndex,
}

struct Inner {
    state: RwLock<StoreState>,
    broker: Broker,
    clock: Arc<dyn Clock>,
    disposed: CancellationToken,
    config: StoreConfig,
}

/// Handle to an in-memory stream store.
///
/// Clones share the same store. Every operation fails with [`Error::Disposed`] after
/// [`dispose`](StreamStore::dispose).
#[derive(Clone)]
pub struct StreamStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStore")
            .field("config", &self.inner.config)
            .field("disposed", &self.inner.disposed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStore {
    /// Create an empty store with the default configuration and the system clock.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create an empty store with `config` and the system clock.
    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store that timestamps messages and evaluates max-age with `clock`.
    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(StoreState::default()),
                broker: Broker::new(config.notification_capacity),
                clock,
                disposed: CancellationToken::new(),
                config,
            }),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> StoreConfig {
        self.inner.config
    }

    /// `true` once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    pub(crate) fn disposal_token(&self) -> CancellationToken {
        self.inner.disposed.clone()
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<RwLockReadGuard<'_, StoreState>, Error> {
        self.acquire(cancel, self.inner.state.read()).await
    }

    async fn write(&self, cancel: &CancellationToken) -> Result<RwLockWriteGuard<'_, StoreState>, Error> {
        self.acquire(cancel, self.inner.state.write()).await
    }

    async fn acquire<G>(
        &self,
        cancel: &CancellationToken,
        lock: impl Future<Output = G>,
    ) -> Result<G, Error> {
        if self.inner.disposed.is_cancelled() {
            return Err(Error::Disposed);
        }
        tokio::select! {
            biased;
            _ = self.inner.disposed.cancelled() => Err(Error::Disposed),
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock => Ok(guard),
        }
    }

    /// Publish the outcome of a committed mutation. Called after the write guard is
    /// released.
    fn committed(&self, head: Option<u64>, next_checkpoint: u64) {
        metrics::set_head_checkpoint(head);
        self.inner.broker.notify(next_checkpoint);
    }

    /// Append `messages` to `stream_id`.
    ///
    /// Repeating the stream's last batch (same message ids in the same order) under a
    /// consistent expected version returns the original result without writing. After
    /// a commit the stream's max-count is enforced.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidArgument`] for an empty or `$`-prefixed stream id, an empty
    ///   batch or a message type that is empty or longer than 256 bytes.
    /// * [`Error::WrongExpectedVersion`] when the concurrency check fails.
    /// * [`Error::Cancelled`] / [`Error::Disposed`] while waiting for the lock.
    pub async fn append_to_stream(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        cancel: &CancellationToken,
    ) -> Result<AppendResult, Error> {
        writer::reject_reserved_stream_id(stream_id)?;
        let clock = self.inner.clock.as_ref();
        let mut state = self.write(cancel).await?;
        let outcome = state
            .append(clock, stream_id, expected, &messages)
            .inspect_err(|e| {
                if e.is_conflict() {
                    metrics::record_conflict();
                }
            })?;
        if !outcome.is_committed() {
            return Ok(outcome.result());
        }

        metrics::record_append(messages.len());
        let removed = state.enforce_max_count_after_commit(clock, stream_id);
        metrics::record_removed(removed);
        let (head, next) = (state.head_checkpoint(), state.log.next_checkpoint());
        drop(state);

        self.committed(head, next);
        Ok(outcome.result())
    }

    /// Delete `stream_id` and its metadata stream.
    ///
    /// Unknown streams are a no-op for [`ExpectedVersion::Any`] and
    /// [`ExpectedVersion::NoStream`].
    ///
    /// # Errors
    ///
    /// [`Error::WrongExpectedVersion`] when `expected` does not match the stream.
    pub async fn delete_stream(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut state = self.write(cancel).await?;
        let removed = state
            .delete_stream(self.inner.clock.as_ref(), stream_id, expected)
            .inspect_err(|e| {
                if e.is_conflict() {
                    metrics::record_conflict();
                }
            })?;
        self.finish_removal(state, removed);
        if removed.streams > 0 {
            tracing::info!(stream_id, count = removed.messages, "stream deleted");
        }
        Ok(())
    }

    /// Delete the lowest-versioned live message of `stream_id` with `message_id`.
    /// Unknown streams and ids are a no-op.
    pub async fn delete_message(
        &self,
        stream_id: &str,
        message_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut state = self.write(cancel).await?;
        let deleted = state.delete_message(self.inner.clock.as_ref(), stream_id, message_id)?;
        let removed = Removed {
            messages: usize::from(deleted),
            streams: 0,
        };
        self.finish_removal(state, removed);
        Ok(())
    }

    fn finish_removal(&self, state: RwLockWriteGuard<'_, StoreState>, removed: Removed) {
        metrics::record_removed(removed);
        if removed == Removed::default() {
            return;
        }
        let (head, next) = (state.head_checkpoint(), state.log.next_checkpoint());
        drop(state);
        self.committed(head, next);
    }

    /// Read the global log upwards from `from`, inclusive.
    pub async fn read_all_forwards(
        &self,
        from: Position,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<AllMessagesPage, Error> {
        metrics::record_read("read_all_forwards");
        Ok(self.read(cancel).await?.read_all_forwards(from, max_count))
    }

    /// Read the global log downwards from `from`, inclusive. A start past the head
    /// is clamped to the head.
    pub async fn read_all_backwards(
        &self,
        from: Position,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<AllMessagesPage, Error> {
        metrics::record_read("read_all_backwards");
        Ok(self.read(cancel).await?.read_all_backwards(from, max_count))
    }

    /// Read `stream_id` upwards from `from`, inclusive.
    ///
    /// An unknown stream is not an error: the page reports
    /// [`PageReadStatus::StreamNotFound`](crate::types::PageReadStatus::StreamNotFound).
    pub async fn read_stream_forwards(
        &self,
        stream_id: &str,
        from: StreamVersion,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<StreamMessagesPage, Error> {
        metrics::record_read("read_stream_forwards");
        Ok(self
            .read(cancel)
            .await?
            .read_stream_forwards(stream_id, from, max_count))
    }

    /// Read `stream_id` downwards from `from`, inclusive.
    pub async fn read_stream_backwards(
        &self,
        stream_id: &str,
        from: StreamVersion,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<StreamMessagesPage, Error> {
        metrics::record_read("read_stream_backwards");
        Ok(self
            .read(cancel)
            .await?
            .read_stream_backwards(stream_id, from, max_count))
    }

    /// Highest live checkpoint, `None` when the store holds no messages.
    pub async fn read_head_checkpoint(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, Error> {
        Ok(self.read(cancel).await?.head_checkpoint())
    }

    /// Number of live messages in `stream_id`; 0 for unknown streams.
    pub async fn get_stream_message_count(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        Ok(self.read(cancel).await?.stream_message_count(stream_id))
    }

    /// Current metadata of `stream_id`; every field is `None` if none was ever set.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptSystemMessage`] if the latest metadata message does not decode.
    pub async fn get_stream_metadata(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadataResult, Error> {
        self.read(cancel).await?.stream_metadata(stream_id)
    }

    /// Write new metadata for `stream_id`. `expected` applies to the metadata stream.
    ///
    /// A new max-count takes effect immediately; a new max-age is applied by the next
    /// [`purge_expired`](Self::purge_expired).
    pub async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        metadata: SetStreamMetadata,
        cancel: &CancellationToken,
    ) -> Result<AppendResult, Error> {
        let mut state = self.write(cancel).await?;
        let (outcome, removed) = state
            .set_stream_metadata(self.inner.clock.as_ref(), stream_id, expected, metadata)
            .inspect_err(|e| {
                if e.is_conflict() {
                    metrics::record_conflict();
                }
            })?;
        metrics::record_removed(removed);
        let (head, next) = (state.head_checkpoint(), state.log.next_checkpoint());
        drop(state);

        if outcome.is_committed() {
            self.committed(head, next);
        }
        Ok(outcome.result())
    }

    /// Delete every message older than its stream's max-age. Returns how many were
    /// deleted.
    pub async fn purge_expired(&self, cancel: &CancellationToken) -> Result<usize, Error> {
        let mut state = self.write(cancel).await?;
        let removed = state.purge_expired(self.inner.clock.as_ref())?;
        self.finish_removal(state, removed);
        Ok(removed.messages)
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the store is
    /// disposed.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let disposed = store.disposal_token();
            let cancel = CancellationToken::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = disposed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.purge_expired(&cancel).await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "expired messages purged"),
                    Err(Error::Disposed) => break,
                    Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                }
            }
            tracing::debug!("expiry sweeper stopped");
        })
    }

    /// Stream every message from `start` on, then live appends, with a
    /// [`SubscriptionMessage::CaughtUp`] marker in between.
    ///
    /// [`Position::End`] delivers only messages committed after this call. The stream
    /// ends with `Err(Error::Disposed)` when the store is disposed.
    pub async fn all_messages(
        &self,
        start: Position,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionStream, Error> {
        let rx = self.inner.broker.subscribe();
        let start = {
            let state = self.read(cancel).await?;
            match start {
                Position::Start => 0,
                Position::End => state.log.next_checkpoint(),
                Position::Checkpoint(c) => c,
            }
        };
        Ok(broker::all_messages(
            self.clone(),
            rx,
            start,
            self.inner.config.catch_up_page_size,
        ))
    }

    /// Stream the messages of `stream_id` from `start` on, then live appends.
    pub async fn stream_messages(
        &self,
        stream_id: &str,
        start: StreamVersion,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionStream, Error> {
        let rx = self.inner.broker.subscribe();
        let start = {
            let state = self.read(cancel).await?;
            match start {
                StreamVersion::Start => 0,
                StreamVersion::End => state.streams.get(stream_id).map_or(0, |e| e.next_version()),
                StreamVersion::Version(v) => v,
            }
        };
        Ok(broker::stream_messages(
            self.clone(),
            rx,
            stream_id.to_string(),
            start,
            self.inner.config.catch_up_page_size,
        ))
    }

    /// Subscribe to every stream from `start`.
    ///
    /// Each message is passed to `on_message` and awaited before the next one is
    /// delivered. `on_dropped` runs exactly once when the subscription stops.
    pub async fn subscribe_to_all<F, Fut, D>(
        &self,
        start: Position,
        on_message: F,
        on_dropped: D,
        name: impl Into<String>,
    ) -> Result<Subscription, Error>
    where
        F: FnMut(StreamMessage) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        D: FnOnce(SubscriptionDropped) + Send + 'static,
    {
        let messages = self.all_messages(start, &CancellationToken::new()).await?;
        Ok(subscription::spawn(name.into(), messages, on_message, on_dropped))
    }

    /// Subscribe to `stream_id` from `start`. The stream need not exist yet.
    pub async fn subscribe_to_stream<F, Fut, D>(
        &self,
        stream_id: &str,
        start: StreamVersion,
        on_message: F,
        on_dropped: D,
        name: impl Into<String>,
    ) -> Result<Subscription, Error>
    where
        F: FnMut(StreamMessage) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        D: FnOnce(SubscriptionDropped) + Send + 'static,
    {
        let messages = self
            .stream_messages(stream_id, start, &CancellationToken::new())
            .await?;
        Ok(subscription::spawn(name.into(), messages, on_message, on_dropped))
    }

    /// Shut the store down.
    ///
    /// Live subscriptions drop with `StoreDisposed`, the contents are released and
    /// every later call fails with [`Error::Disposed`]. Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();

        let mut state = self.inner.state.write().await;
        state.log.clear();
        state.streams.clear();
        drop(state);

        metrics::set_head_checkpoint(None);
        tracing::info!("stream store disposed");
    }
}
