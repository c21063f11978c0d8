//! Append notifications and the catch-up-then-live subscription streams.
//!
//! The `Broker` wraps a `tokio::broadcast` channel. After each committed mutation the
//! store sends the next checkpoint as a hint; subscribers never trust it and always
//! re-read from their own cursor. A lagged receiver has merely missed hints, so lag
//! counts as one more wakeup rather than an error.

use std::pin::Pin;

use async_stream::stream;
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::metrics::SubscriptionGauge;
use crate::store::StreamStore;
use crate::types::{Position, StreamVersion, SubscriptionMessage};

/// Catch-up-then-live message stream returned by
/// [`StreamStore::all_messages`] and [`StreamStore::stream_messages`].
pub type SubscriptionStream = Pin<Box<dyn Stream<Item = Result<SubscriptionMessage, Error>> + Send>>;

/// Sending half of the append notification channel.
#[derive(Debug, Clone)]
pub struct Broker {
    tx: broadcast::Sender<u64>,
}

impl Broker {
    /// Create a broker whose channel buffers `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Wake every subscriber. Sending to no receivers is fine.
    pub fn notify(&self, next_checkpoint: u64) {
        let _ = self.tx.send(next_checkpoint);
    }

    /// Register a receiver for notifications sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Wait for the next notification. Returns `false` once the store is disposed.
async fn wait_for_append(rx: &mut broadcast::Receiver<u64>, disposed: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = disposed.cancelled() => false,
        recv = rx.recv() => match recv {
            Ok(_) | Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => false,
        },
    }
}

/// Stream every message from checkpoint `start` on, then live appends.
///
/// `rx` must be registered before `start` is resolved so that nothing committed in
/// between is missed.
pub(crate) fn all_messages(
    store: StreamStore,
    mut rx: broadcast::Receiver<u64>,
    start: u64,
    page_size: usize,
) -> SubscriptionStream {
    Box::pin(stream! {
        let _gauge = SubscriptionGauge::new();
        let disposed = store.disposal_token();
        let cancel = CancellationToken::new();
        let mut cursor = start;
        let mut caught_up = false;

        loop {
            // Drain everything after the cursor, one page at a time.
            loop {
                let page = match store
                    .read_all_forwards(Position::Checkpoint(cursor), page_size, &cancel)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                cursor = cursor.max(page.next_checkpoint);
                for message in page.messages {
                    yield Ok(SubscriptionMessage::Message(message));
                }
                if page.is_end {
                    break;
                }
            }

            if !caught_up {
                caught_up = true;
                yield Ok(SubscriptionMessage::CaughtUp);
            }

            if !wait_for_append(&mut rx, &disposed).await {
                yield Err(Error::Disposed);
                return;
            }
        }
    })
}

/// Stream the messages of `stream_id` from version `start` on, then live appends.
pub(crate) fn stream_messages(
    store: StreamStore,
    mut rx: broadcast::Receiver<u64>,
    stream_id: String,
    start: u64,
    page_size: usize,
) -> SubscriptionStream {
    Box::pin(stream! {
        let _gauge = SubscriptionGauge::new();
        let disposed = store.disposal_token();
        let cancel = CancellationToken::new();
        let mut cursor = start;
        let mut caught_up = false;

        loop {
            loop {
                let page = match store
                    .read_stream_forwards(&stream_id, StreamVersion::Version(cursor), page_size, &cancel)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                cursor = cursor.max(page.next_version);
                for message in page.messages {
                    yield Ok(SubscriptionMessage::Message(message));
                }
                if page.is_end {
                    break;
                }
            }

            if !caught_up {
                caught_up = true;
                yield Ok(SubscriptionMessage::CaughtUp);
            }

            if !wait_for_append(&mut rx, &disposed).await {
                yield Err(Error::Disposed);
                return;
            }
        }
    })
}
