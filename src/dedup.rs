//! Resend detection for idempotent appends.
//!
//! Each stream remembers the message ids of its most recently committed batch. A
//! retried append carrying exactly those ids, in the same order and under an expected
//! version consistent with the state before that batch, is answered with the original
//! result instead of being appended again or rejected as a conflict.

use uuid::Uuid;

use crate::types::{AppendResult, ExpectedVersion, NewStreamMessage};

/// The most recently committed batch of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LastBatch {
    /// Message ids in batch order.
    message_ids: Vec<Uuid>,
    /// Version assigned to the first message of the batch.
    first_version: u64,
    /// Result returned when the batch was committed.
    result: AppendResult,
}

impl LastBatch {
    /// Remember a committed batch.
    pub(crate) fn new(messages: &[NewStreamMessage], first_version: u64, result: AppendResult) -> Self {
        Self {
            message_ids: messages.iter().map(|m| m.message_id).collect(),
            first_version,
            result,
        }
    }

    /// Returns the original result if `messages` under `expected` is a resend of this
    /// batch, `None` otherwise.
    pub(crate) fn check(
        &self,
        expected: ExpectedVersion,
        messages: &[NewStreamMessage],
    ) -> Option<AppendResult> {
        let same_ids = self.message_ids.len() == messages.len()
            && self
                .message_ids
                .iter()
                .zip(messages)
                .all(|(id, m)| *id == m.message_id);
        if !same_ids {
            return None;
        }

        let consistent = match expected {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => self.first_version == 0,
            ExpectedVersion::Exact(v) => v.checked_add(1) == Some(self.first_version),
        };
        consistent.then_some(self.result)
    }
}
