//! Append engine.
//!
//! Validates a batch, applies the optimistic concurrency check and commits the batch
//! into the [`StoreState`]. Everything here runs synchronously while the caller holds
//! the store's write lock, so a batch becomes visible to readers atomically.

use crate::clock::Clock;
use crate::dedup::LastBatch;
use crate::error::Error;
use crate::index::{Slot, StreamEntry};
use crate::store::StoreState;
use crate::types::{
    AppendResult, ExpectedVersion, MAX_MESSAGE_TYPE_LEN, NewStreamMessage, StreamMessage,
};

/// What an append did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendOutcome {
    /// The batch was committed.
    Committed(AppendResult),
    /// The batch repeated the stream's last batch; nothing was written.
    Resent(AppendResult),
}

impl AppendOutcome {
    pub(crate) fn result(self) -> AppendResult {
        match self {
            AppendOutcome::Committed(r) | AppendOutcome::Resent(r) => r,
        }
    }

    pub(crate) fn is_committed(self) -> bool {
        matches!(self, AppendOutcome::Committed(_))
    }
}

/// Build the conflict error for `stream_id`.
pub(crate) fn wrong_expected_version(
    stream_id: &str,
    expected: ExpectedVersion,
    actual: Option<u64>,
) -> Error {
    Error::WrongExpectedVersion {
        stream_id: stream_id.to_string(),
        expected: expected.to_string(),
        actual: actual.map_or_else(|| "NoStream".to_string(), |v| v.to_string()),
    }
}

/// Check `expected` against the current header of a stream (`None` if unknown).
///
/// Shared by appends and stream deletion, which follow the same rule.
pub(crate) fn check_expected_version(
    stream_id: &str,
    expected: ExpectedVersion,
    entry: Option<&StreamEntry>,
) -> Result<(), Error> {
    let actual = entry.map(|e| e.version);
    match (expected, actual) {
        (ExpectedVersion::Any, _) | (ExpectedVersion::NoStream, None) => Ok(()),
        (ExpectedVersion::Exact(v), Some(current)) if v == current => Ok(()),
        _ => Err(wrong_expected_version(stream_id, expected, actual)),
    }
}

pub(crate) fn validate_stream_id(stream_id: &str) -> Result<(), Error> {
    if stream_id.is_empty() {
        return Err(Error::InvalidArgument(
            "stream id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Streams whose id starts with `$` are written only by the store itself.
pub(crate) fn reject_reserved_stream_id(stream_id: &str) -> Result<(), Error> {
    if stream_id.starts_with('$') {
        return Err(Error::InvalidArgument(format!(
            "stream id '{stream_id}' is reserved: ids starting with '$' belong to the store"
        )));
    }
    Ok(())
}

fn validate_batch(stream_id: &str, messages: &[NewStreamMessage]) -> Result<(), Error> {
    validate_stream_id(stream_id)?;
    if messages.is_empty() {
        return Err(Error::InvalidArgument(
            "append batch must contain at least one message".to_string(),
        ));
    }
    for message in messages {
        if message.message_type.is_empty() {
            return Err(Error::InvalidArgument(
                "message type must not be empty".to_string(),
            ));
        }
        if message.message_type.len() > MAX_MESSAGE_TYPE_LEN {
            return Err(Error::InvalidArgument(format!(
                "message type exceeds {} byte limit: {} bytes",
                MAX_MESSAGE_TYPE_LEN,
                message.message_type.len()
            )));
        }
    }
    Ok(())
}

impl StoreState {
    /// Append `messages` to `stream_id` under `expected`.
    ///
    /// Retention is not applied here; the caller runs max-count enforcement after a
    /// committed user append.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty stream id, an empty batch or a
    /// bad message type, and [`Error::WrongExpectedVersion`] when the concurrency
    /// check fails. Nothing is mutated on error.
    pub(crate) fn append(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        expected: ExpectedVersion,
        messages: &[NewStreamMessage],
    ) -> Result<AppendOutcome, Error> {
        validate_batch(stream_id, messages)?;

        // Step 1: a retried batch gets its original answer.
        let entry = self.streams.get(stream_id);
        if let Some(result) = entry
            .and_then(|e| e.last_batch.as_ref())
            .and_then(|batch| batch.check(expected, messages))
        {
            tracing::debug!(stream_id, version = result.current_version, "idempotent resend");
            return Ok(AppendOutcome::Resent(result));
        }

        // Step 2: optimistic concurrency.
        check_expected_version(stream_id, expected, entry)?;

        // Step 3: assign versions and checkpoints in batch order and commit.
        let first_version = entry.map_or(0, StreamEntry::next_version);
        let created_utc = clock.now_millis();
        let StoreState { log, streams } = self;
        let entry = streams.get_or_create(stream_id, log.next_checkpoint());

        let mut result = AppendResult {
            current_version: first_version,
            current_position: log.next_checkpoint(),
        };
        for (version, message) in (first_version..).zip(messages) {
            let checkpoint = log.next_checkpoint();
            log.push(StreamMessage {
                stream_id: stream_id.to_string(),
                message_id: message.message_id,
                stream_version: version,
                checkpoint,
                created_utc,
                message_type: message.message_type.clone(),
                payload: message.payload.clone(),
                metadata: message.metadata.clone(),
            });
            entry.slots.insert(
                version,
                Slot {
                    checkpoint,
                    message_id: message.message_id,
                },
            );
            result = AppendResult {
                current_version: version,
                current_position: checkpoint,
            };
        }
        entry.version = result.current_version;
        entry.position = result.current_position;
        entry.last_batch = Some(LastBatch::new(messages, first_version, result));

        tracing::debug!(
            stream_id,
            count = messages.len(),
            version = result.current_version,
            checkpoint = result.current_position,
            "batch committed"
        );
        Ok(AppendOutcome::Committed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use uuid::Uuid;

    use crate::clock::ManualClock;

    fn new_message(message_type: &str) -> NewStreamMessage {
        NewStreamMessage::new(Uuid::new_v4(), message_type, Bytes::from_static(b"{}"))
    }

    fn batch(n: usize) -> Vec<NewStreamMessage> {
        (0..n).map(|_| new_message("TestMessage")).collect()
    }

    fn append(
        state: &mut StoreState,
        stream_id: &str,
        expected: ExpectedVersion,
        messages: &[NewStreamMessage],
    ) -> Result<AppendOutcome, Error> {
        state.append(&ManualClock::new(1_000), stream_id, expected, messages)
    }

    #[test]
    fn first_batch_starts_at_version_zero() {
        let mut state = StoreState::default();
        let outcome = append(&mut state, "s", ExpectedVersion::NoStream, &batch(3))
            .expect("append should succeed");
        assert_eq!(
            outcome,
            AppendOutcome::Committed(AppendResult {
                current_version: 2,
                current_position: 2
            })
        );

        let entry = state.streams.get("s").expect("stream should exist");
        assert_eq!(entry.version, 2);
        assert_eq!(entry.position, 2);
        assert_eq!(entry.live_count(), 3);
        assert_eq!(state.log.len(), 3);
        assert_eq!(state.log.get(1).map(|m| m.stream_version), Some(1));
        assert_eq!(state.log.get(1).map(|m| m.created_utc), Some(1_000));
    }

    #[test]
    fn checkpoints_interleave_across_streams() {
        let mut state = StoreState::default();
        append(&mut state, "a", ExpectedVersion::Any, &batch(1)).expect("a");
        append(&mut state, "b", ExpectedVersion::Any, &batch(1)).expect("b");
        let r = append(&mut state, "a", ExpectedVersion::Exact(0), &batch(1))
            .expect("a again")
            .result();
        assert_eq!(r.current_version, 1);
        assert_eq!(r.current_position, 2);
    }

    #[test]
    fn no_stream_on_known_stream_conflicts() {
        let mut state = StoreState::default();
        append(&mut state, "s", ExpectedVersion::Any, &batch(2)).expect("seed");
        let err = append(&mut state, "s", ExpectedVersion::NoStream, &batch(1)).unwrap_err();
        match err {
            Error::WrongExpectedVersion {
                expected, actual, ..
            } => {
                assert_eq!(expected, "NoStream");
                assert_eq!(actual, "1");
            }
            other => panic!("expected WrongExpectedVersion, got: {other:?}"),
        }
        assert_eq!(state.log.len(), 2);
    }

    #[test]
    fn exact_on_unknown_stream_conflicts() {
        let mut state = StoreState::default();
        let err = append(&mut state, "s", ExpectedVersion::Exact(0), &batch(1)).unwrap_err();
        match err {
            Error::WrongExpectedVersion { actual, .. } => assert_eq!(actual, "NoStream"),
            other => panic!("expected WrongExpectedVersion, got: {other:?}"),
        }
        assert!(state.streams.get("s").is_none());
    }

    #[test]
    fn exact_mismatch_conflicts_and_mutates_nothing() {
        let mut state = StoreState::default();
        append(&mut state, "s", ExpectedVersion::Any, &batch(2)).expect("seed");
        let err = append(&mut state, "s", ExpectedVersion::Exact(5), &batch(1)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(state.log.next_checkpoint(), 2);
    }

    #[test]
    fn identical_retry_returns_original_result() {
        let mut state = StoreState::default();
        let messages = batch(2);
        let first = append(&mut state, "s", ExpectedVersion::NoStream, &messages).expect("first");
        let retry = append(&mut state, "s", ExpectedVersion::NoStream, &messages).expect("retry");
        assert!(first.is_committed());
        assert_eq!(retry, AppendOutcome::Resent(first.result()));
        assert_eq!(state.log.len(), 2);
    }

    #[test]
    fn retry_of_older_batch_is_a_conflict() {
        let mut state = StoreState::default();
        let older = batch(1);
        append(&mut state, "s", ExpectedVersion::NoStream, &older).expect("older");
        append(&mut state, "s", ExpectedVersion::Exact(0), &batch(1)).expect("newer");
        let err = append(&mut state, "s", ExpectedVersion::NoStream, &older).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn same_ids_under_any_after_other_batch_append_again() {
        // Duplicate ids are allowed once they are no longer the last batch.
        let mut state = StoreState::default();
        let repeated = batch(1);
        append(&mut state, "s", ExpectedVersion::Any, &repeated).expect("first");
        append(&mut state, "s", ExpectedVersion::Any, &batch(1)).expect("other");
        let outcome = append(&mut state, "s", ExpectedVersion::Any, &repeated).expect("again");
        assert!(outcome.is_committed());
        assert_eq!(state.streams.get("s").map(|e| e.live_count()), Some(3));
    }

    #[test]
    fn invalid_batches_are_rejected() {
        let mut state = StoreState::default();
        let cases = [
            ("", batch(1)),
            ("s", Vec::new()),
            ("s", vec![new_message("")]),
            ("s", vec![new_message(&"x".repeat(MAX_MESSAGE_TYPE_LEN + 1))]),
        ];
        for (stream_id, messages) in cases {
            let err = append(&mut state, stream_id, ExpectedVersion::Any, &messages).unwrap_err();
            assert!(
                matches!(err, Error::InvalidArgument(_)),
                "expected InvalidArgument, got: {err:?}"
            );
        }
        assert!(state.log.is_empty());

        let max_len = vec![new_message(&"x".repeat(MAX_MESSAGE_TYPE_LEN))];
        append(&mut state, "s", ExpectedVersion::Any, &max_len).expect("256 bytes is allowed");
    }

    #[test]
    fn versions_continue_after_slots_are_removed() {
        let mut state = StoreState::default();
        append(&mut state, "s", ExpectedVersion::Any, &batch(3)).expect("seed");
        if let Some(entry) = state.streams.get_mut("s") {
            entry.slots.clear();
        }
        let r = append(&mut state, "s", ExpectedVersion::Exact(2), &batch(1))
            .expect("append after removal")
            .result();
        assert_eq!(r.current_version, 3);
        assert_eq!(r.current_position, 3);
    }
}
