//! Deletion, stream metadata and retention.
//!
//! Every removal unlinks the message from the stream index and the global log and
//! then records a tombstone in `$deleted`. Tombstone writes are
//! plain internal appends and never trigger retention themselves.

use uuid::Uuid;

use crate::clock::Clock;
use crate::codec::{DELETED_STREAM_ID, MetadataMessage, Tombstone, metadata_stream_id};
use crate::error::Error;
use crate::store::StoreState;
use crate::types::{ExpectedVersion, SetStreamMetadata, StreamMetadataResult, StreamVersion};
use crate::writer::{
    AppendOutcome, check_expected_version, validate_stream_id, wrong_expected_version,
};

/// Counts of what a retention pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Removed {
    pub messages: usize,
    pub streams: usize,
}

impl StoreState {
    /// Current metadata of `stream_id`, read from the latest `$$stream_id` message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptSystemMessage`] if that message does not decode.
    pub(crate) fn stream_metadata(&self, stream_id: &str) -> Result<StreamMetadataResult, Error> {
        let page = self.read_stream_backwards(&metadata_stream_id(stream_id), StreamVersion::End, 1);
        let mut result = StreamMetadataResult {
            stream_id: stream_id.to_string(),
            metadata_stream_version: page.last_stream_version,
            max_age: None,
            max_count: None,
            custom_metadata: None,
        };
        if let (Some(version), Some(message)) = (page.last_stream_version, page.messages.first()) {
            result = MetadataMessage::decode(message)?.into_result(stream_id, version);
        }
        Ok(result)
    }

    /// Append a metadata message for `stream_id` and apply its max-count right away.
    pub(crate) fn set_stream_metadata(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        expected: ExpectedVersion,
        metadata: SetStreamMetadata,
    ) -> Result<(AppendOutcome, Removed), Error> {
        validate_stream_id(stream_id)?;
        let message = MetadataMessage {
            stream_id: stream_id.to_string(),
            max_age: metadata.max_age,
            max_count: metadata.max_count,
            meta_json: metadata.custom_metadata,
        }
        .to_new_message();

        let outcome = self.append(clock, &metadata_stream_id(stream_id), expected, &[message])?;
        let removed = self.enforce_max_count_after_commit(clock, stream_id);
        Ok((outcome, removed))
    }

    /// Max-count enforcement for a write that is already committed. A failure is
    /// logged and leaves the stream over budget until its next write.
    pub(crate) fn enforce_max_count_after_commit(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
    ) -> Removed {
        self.enforce_max_count(clock, stream_id)
            .unwrap_or_else(|e| {
                tracing::warn!(stream_id, error = %e, "max-count enforcement failed");
                Removed::default()
            })
    }

    /// Delete the oldest live messages of `stream_id` beyond its max-count.
    pub(crate) fn enforce_max_count(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
    ) -> Result<Removed, Error> {
        let Some(max_count) = self.stream_metadata(stream_id)?.max_count else {
            return Ok(Removed::default());
        };
        let surplus = self
            .stream_message_count(stream_id)
            .saturating_sub(max_count as usize);
        if surplus == 0 {
            return Ok(Removed::default());
        }

        let versions = self
            .streams
            .get(stream_id)
            .map(|e| e.oldest(surplus))
            .unwrap_or_default();
        let mut removed = Removed::default();
        for version in versions {
            if self.delete_message_at(clock, stream_id, version)? {
                removed.messages += 1;
            }
        }
        tracing::debug!(stream_id, max_count, count = removed.messages, "max-count enforced");
        Ok(removed)
    }

    /// Delete every live message older than its stream's max-age.
    ///
    /// A message expires once `created_utc + max_age` seconds is not after now.
    pub(crate) fn purge_expired(&mut self, clock: &dyn Clock) -> Result<Removed, Error> {
        let now = clock.now_millis();
        let stream_ids: Vec<String> = self.streams.stream_ids().map(str::to_string).collect();

        let mut removed = Removed::default();
        for stream_id in stream_ids {
            let Some(max_age) = self.stream_metadata(&stream_id)?.max_age else {
                continue;
            };
            let max_age_ms = u64::from(max_age) * 1000;
            let expired: Vec<u64> = match self.streams.get(&stream_id) {
                Some(entry) => entry
                    .slots_from(0)
                    .filter(|(_, slot)| {
                        self.log
                            .get(slot.checkpoint)
                            .is_some_and(|m| m.created_utc.saturating_add(max_age_ms) <= now)
                    })
                    .map(|(version, _)| version)
                    .collect(),
                None => continue,
            };
            for version in expired {
                if self.delete_message_at(clock, &stream_id, version)? {
                    removed.messages += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete the lowest-versioned live message of `stream_id` with `message_id`.
    ///
    /// Returns `false` if the stream or the message is unknown.
    pub(crate) fn delete_message(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        message_id: Uuid,
    ) -> Result<bool, Error> {
        let Some(version) = self
            .streams
            .get(stream_id)
            .and_then(|e| e.find_message(message_id))
        else {
            return Ok(false);
        };
        self.delete_message_at(clock, stream_id, version)
    }

    /// Delete the message at `version` of `stream_id`. A slot already gone is a no-op.
    fn delete_message_at(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        version: u64,
    ) -> Result<bool, Error> {
        let Some(slot) = self
            .streams
            .get_mut(stream_id)
            .and_then(|e| e.slots.remove(&version))
        else {
            return Ok(false);
        };
        self.log.remove(slot.checkpoint);

        let tombstone = Tombstone::MessageDeleted {
            stream_id: stream_id.to_string(),
            message_id: slot.message_id,
        };
        self.append(
            clock,
            DELETED_STREAM_ID,
            ExpectedVersion::Any,
            &[tombstone.to_new_message()],
        )?;
        tracing::debug!(
            stream_id,
            version,
            checkpoint = slot.checkpoint,
            "message deleted"
        );
        Ok(true)
    }

    /// Delete `stream_id` and its metadata stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongExpectedVersion`] when `expected` does not match the
    /// stream. Unknown streams are a no-op unless `expected` names a version.
    pub(crate) fn delete_stream(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        expected: ExpectedVersion,
    ) -> Result<Removed, Error> {
        validate_stream_id(stream_id)?;
        let mut removed = self.remove_stream(clock, stream_id, expected)?;
        let metadata = self.remove_stream(clock, &metadata_stream_id(stream_id), ExpectedVersion::Any)?;
        removed.messages += metadata.messages;
        removed.streams += metadata.streams;
        Ok(removed)
    }

    fn remove_stream(
        &mut self,
        clock: &dyn Clock,
        stream_id: &str,
        expected: ExpectedVersion,
    ) -> Result<Removed, Error> {
        let current = self.streams.get(stream_id);
        check_expected_version(stream_id, expected, current)?;
        // An emptied stream has no version left to match.
        if let (ExpectedVersion::Exact(_), Some(entry)) = (expected, current)
            && entry.live_count() == 0
        {
            return Err(wrong_expected_version(stream_id, expected, Some(entry.version)));
        }

        let Some(entry) = self.streams.remove(stream_id) else {
            return Ok(Removed::default());
        };
        for slot in entry.slots.values() {
            self.log.remove(slot.checkpoint);
        }

        let tombstone = Tombstone::StreamDeleted {
            stream_id: stream_id.to_string(),
        };
        self.append(
            clock,
            DELETED_STREAM_ID,
            ExpectedVersion::Any,
            &[tombstone.to_new_message()],
        )?;
        tracing::debug!(
            stream_id,
            count = entry.live_count(),
            version = entry.version,
            "stream deleted"
        );
        Ok(Removed {
            messages: entry.live_count(),
            streams: 1,
        })
    }
}
