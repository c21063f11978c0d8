//! Callback subscriptions.
//!
//! A [`Subscription`] drives one of the broker's catch-up-then-live streams on a
//! spawned task, hands every message to the caller's handler and waits for it before
//! pulling the next one. The task ends on unsubscribe, on disposal of the store, or on
//! the first handler failure; the drop callback then runs exactly once.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::{FutureExt, StreamExt};
use futures_core::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::types::{StreamMessage, SubscriptionMessage};

/// Error a message handler may return. Any failure drops the subscription.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why a subscription stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    /// The caller unsubscribed or dropped the handle.
    UserInitiated,
    /// The store was disposed.
    StoreDisposed,
    /// The message handler returned an error or panicked.
    SubscriberError(String),
    /// Reading from the store failed.
    StoreError(String),
}

/// Lifecycle of a subscription. `Dropped` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, task not yet running.
    Initializing,
    /// Delivering messages committed before the subscription caught up.
    CatchingUp,
    /// Caught up; delivering new messages as they are committed.
    Live,
    /// Stopped for good.
    Dropped(SubscriptionDropReason),
}

impl SubscriptionState {
    /// `true` once the subscription has stopped.
    pub fn is_dropped(&self) -> bool {
        matches!(self, SubscriptionState::Dropped(_))
    }
}

/// Argument of the drop callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDropped {
    /// Name the subscription was created with.
    pub name: String,
    /// Why it stopped.
    pub reason: SubscriptionDropReason,
}

/// Handle to a running subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Name the subscription was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Wait until the subscription has caught up or stopped, returning that state.
    pub async fn wait_until_live(&mut self) -> SubscriptionState {
        let waited = self
            .state
            .wait_for(|s| matches!(s, SubscriptionState::Live | SubscriptionState::Dropped(_)))
            .await
            .map(|state| (*state).clone());
        match waited {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Wait until the subscription has stopped, returning the reason.
    pub async fn wait_until_dropped(&mut self) -> SubscriptionDropReason {
        let waited = self
            .state
            .wait_for(SubscriptionState::is_dropped)
            .await
            .map(|state| (*state).clone());
        match waited {
            Ok(SubscriptionState::Dropped(reason)) => reason,
            _ => SubscriptionDropReason::UserInitiated,
        }
    }

    /// Stop the subscription and wait for its drop callback to finish.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the task that feeds `messages` to `on_message`.
pub(crate) fn spawn<S, F, Fut, D>(
    name: String,
    messages: S,
    on_message: F,
    on_dropped: D,
) -> Subscription
where
    S: Stream<Item = Result<SubscriptionMessage, Error>> + Send + 'static,
    F: FnMut(StreamMessage) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    D: FnOnce(SubscriptionDropped) + Send + 'static,
{
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Initializing);
    let task = tokio::spawn(run(
        name.clone(),
        messages,
        on_message,
        on_dropped,
        cancel.clone(),
        state_tx,
    ));
    Subscription {
        name,
        state: state_rx,
        cancel,
        task: Some(task),
    }
}

async fn run<S, F, Fut, D>(
    name: String,
    messages: S,
    on_message: F,
    on_dropped: D,
    cancel: CancellationToken,
    state: watch::Sender<SubscriptionState>,
) where
    S: Stream<Item = Result<SubscriptionMessage, Error>>,
    F: FnMut(StreamMessage) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
    D: FnOnce(SubscriptionDropped),
{
    tracing::info!(subscription = %name, "subscription started");
    state.send_replace(SubscriptionState::CatchingUp);

    let reason = deliver(messages, on_message, &cancel, &state).await;
    match &reason {
        SubscriptionDropReason::UserInitiated | SubscriptionDropReason::StoreDisposed => {
            tracing::info!(subscription = %name, reason = ?reason, "subscription dropped");
        }
        SubscriptionDropReason::SubscriberError(e) | SubscriptionDropReason::StoreError(e) => {
            tracing::warn!(subscription = %name, reason = ?reason, error = %e, "subscription dropped");
        }
    }

    state.send_replace(SubscriptionState::Dropped(reason.clone()));
    on_dropped(SubscriptionDropped { name, reason });
}

async fn deliver<S, F, Fut>(
    messages: S,
    mut on_message: F,
    cancel: &CancellationToken,
    state: &watch::Sender<SubscriptionState>,
) -> SubscriptionDropReason
where
    S: Stream<Item = Result<SubscriptionMessage, Error>>,
    F: FnMut(StreamMessage) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    tokio::pin!(messages);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SubscriptionDropReason::UserInitiated,
            next = messages.next() => next,
        };

        match next {
            Some(Ok(SubscriptionMessage::Message(message))) => {
                let handled = AssertUnwindSafe(on_message(message)).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SubscriptionDropReason::UserInitiated,
                    outcome = handled => outcome,
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return SubscriptionDropReason::SubscriberError(e.to_string()),
                    Err(_) => {
                        return SubscriptionDropReason::SubscriberError(
                            "message handler panicked".to_string(),
                        );
                    }
                }
            }
            Some(Ok(SubscriptionMessage::CaughtUp)) => {
                state.send_replace(SubscriptionState::Live);
            }
            Some(Err(Error::Disposed)) | None => return SubscriptionDropReason::StoreDisposed,
            Some(Err(e)) => return SubscriptionDropReason::StoreError(e.to_string()),
        }
    }
}
