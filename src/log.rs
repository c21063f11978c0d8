//! The global log: every live message across all streams, ordered by checkpoint.
//!
//! Checkpoints are handed out by [`GlobalLog::next_checkpoint`] from a counter that
//! only moves forward. Removing a message leaves a gap; the slot is never reused.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::StreamMessage;

/// Ordered, checkpoint-addressable sequence of live messages.
#[derive(Debug, Default)]
pub struct GlobalLog {
    /// Live messages keyed by checkpoint.
    messages: BTreeMap<u64, StreamMessage>,
    /// Checkpoint the next committed message receives.
    next_checkpoint: u64,
}

impl GlobalLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint the next committed message will receive.
    pub fn next_checkpoint(&self) -> u64 {
        self.next_checkpoint
    }

    /// Append a message. Its checkpoint must be the one returned by
    /// [`next_checkpoint`](Self::next_checkpoint).
    pub(crate) fn push(&mut self, message: StreamMessage) {
        debug_assert_eq!(message.checkpoint, self.next_checkpoint);
        self.next_checkpoint = message.checkpoint + 1;
        self.messages.insert(message.checkpoint, message);
    }

    /// Remove the message at `checkpoint`, returning it if it was live.
    pub(crate) fn remove(&mut self, checkpoint: u64) -> Option<StreamMessage> {
        self.messages.remove(&checkpoint)
    }

    /// Message at `checkpoint`, if live.
    pub fn get(&self, checkpoint: u64) -> Option<&StreamMessage> {
        self.messages.get(&checkpoint)
    }

    /// Highest live checkpoint, `None` for an empty log.
    pub fn head(&self) -> Option<u64> {
        self.messages.keys().next_back().copied()
    }

    /// Lowest live checkpoint, `None` for an empty log.
    pub fn first(&self) -> Option<u64> {
        self.messages.keys().next().copied()
    }

    /// Number of live messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// `true` when no message is live.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Live messages with checkpoint `>= from`, ascending.
    pub(crate) fn iter_from(&self, from: u64) -> impl Iterator<Item = &StreamMessage> {
        self.messages.range(from..).map(|(_, m)| m)
    }

    /// Live messages with checkpoint `<= from`, descending.
    pub(crate) fn iter_back_from(&self, from: u64) -> impl Iterator<Item = &StreamMessage> {
        self.messages
            .range((Bound::Unbounded, Bound::Included(from)))
            .rev()
            .map(|(_, m)| m)
    }

    /// Drop every message. The checkpoint counter is kept.
    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }
}
