//! Paged reads over the global log and over single streams.
//!
//! Positions are inclusive cursors. A page reports where it started, where the next
//! page in the same direction starts, and whether the range is exhausted. Gaps left by
//! deleted messages are skipped silently.

use crate::store::StoreState;
use crate::types::{
    AllMessagesPage, PageReadStatus, Position, ReadDirection, StreamMessage, StreamMessagesPage,
    StreamVersion,
};

/// Empty page that echoes `position` in both cursors.
fn end_of_log(position: u64, direction: ReadDirection) -> AllMessagesPage {
    AllMessagesPage {
        from_checkpoint: position,
        next_checkpoint: position,
        is_end: true,
        direction,
        messages: Vec::new(),
    }
}

/// Page for a stream that has never been created (or was deleted).
fn stream_not_found(
    stream_id: &str,
    from: StreamVersion,
    direction: ReadDirection,
) -> StreamMessagesPage {
    let version = match from {
        StreamVersion::Version(v) => v,
        StreamVersion::Start | StreamVersion::End => 0,
    };
    StreamMessagesPage {
        stream_id: stream_id.to_string(),
        status: PageReadStatus::StreamNotFound,
        from_version: version,
        next_version: version,
        last_stream_version: None,
        direction,
        is_end: true,
        messages: Vec::new(),
    }
}

/// Take up to `max_count` items and report whether the iterator ran dry.
fn take_page<'a>(
    mut iter: impl Iterator<Item = &'a StreamMessage>,
    max_count: usize,
) -> (Vec<StreamMessage>, bool) {
    let messages: Vec<StreamMessage> = iter.by_ref().take(max_count).cloned().collect();
    let is_end = iter.next().is_none();
    (messages, is_end)
}

impl StoreState {
    /// Read up to `max_count` live messages with checkpoint `>= from`, oldest first.
    ///
    /// An empty log yields an end page at checkpoint 0. A start beyond the head yields
    /// an end page that echoes the start, so a caller polling with `next_checkpoint`
    /// never moves backwards.
    pub(crate) fn read_all_forwards(&self, from: Position, max_count: usize) -> AllMessagesPage {
        let Some(head) = self.log.head() else {
            return end_of_log(0, ReadDirection::Forward);
        };
        let start = match from {
            Position::Start => 0,
            Position::End => head + 1,
            Position::Checkpoint(c) => c,
        };
        if start > head {
            return end_of_log(start, ReadDirection::Forward);
        }

        let (messages, is_end) = take_page(self.log.iter_from(start), max_count);
        AllMessagesPage {
            from_checkpoint: messages.first().map_or(start, |m| m.checkpoint),
            next_checkpoint: messages.last().map_or(start, |m| m.checkpoint + 1),
            is_end,
            direction: ReadDirection::Forward,
            messages,
        }
    }

    /// Read up to `max_count` live messages with checkpoint `<= from`, newest first.
    ///
    /// A start past the head is clamped to the head. `next_checkpoint` saturates at 0,
    /// so `is_end` is the only reliable end marker in this direction.
    pub(crate) fn read_all_backwards(&self, from: Position, max_count: usize) -> AllMessagesPage {
        let (Some(first), Some(head)) = (self.log.first(), self.log.head()) else {
            return end_of_log(0, ReadDirection::Backward);
        };
        let start = match from {
            Position::Start => 0,
            Position::End => head,
            Position::Checkpoint(c) => c.min(head),
        };
        if start < first {
            return end_of_log(start, ReadDirection::Backward);
        }

        let (messages, is_end) = take_page(self.log.iter_back_from(start), max_count);
        AllMessagesPage {
            from_checkpoint: messages.first().map_or(start, |m| m.checkpoint),
            next_checkpoint: messages
                .last()
                .map_or(start, |m| m.checkpoint.saturating_sub(1)),
            is_end,
            direction: ReadDirection::Backward,
            messages,
        }
    }

    /// Read up to `max_count` live messages of `stream_id` with version `>= from`.
    ///
    /// [`StreamVersion::End`] resolves to one past the last issued version and so
    /// always yields an empty page. Unknown streams report
    /// [`PageReadStatus::StreamNotFound`].
    pub(crate) fn read_stream_forwards(
        &self,
        stream_id: &str,
        from: StreamVersion,
        max_count: usize,
    ) -> StreamMessagesPage {
        let Some(entry) = self.streams.get(stream_id) else {
            return stream_not_found(stream_id, from, ReadDirection::Forward);
        };
        let start = match from {
            StreamVersion::Start => 0,
            StreamVersion::End => entry.version + 1,
            StreamVersion::Version(v) => v,
        };

        let live = entry
            .slots_from(start)
            .filter_map(|(_, slot)| self.log.get(slot.checkpoint));
        let (messages, is_end) = take_page(live, max_count);
        StreamMessagesPage {
            stream_id: stream_id.to_string(),
            status: PageReadStatus::Success,
            from_version: start,
            next_version: messages.last().map_or(start, |m| m.stream_version + 1),
            last_stream_version: Some(entry.version),
            direction: ReadDirection::Forward,
            is_end,
            messages,
        }
    }

    /// Read up to `max_count` live messages of `stream_id` with version `<= from`,
    /// newest first. A start past the last issued version is clamped to it.
    pub(crate) fn read_stream_backwards(
        &self,
        stream_id: &str,
        from: StreamVersion,
        max_count: usize,
    ) -> StreamMessagesPage {
        let Some(entry) = self.streams.get(stream_id) else {
            return stream_not_found(stream_id, from, ReadDirection::Backward);
        };
        let start = match from {
            StreamVersion::Start => 0,
            StreamVersion::End => entry.version,
            StreamVersion::Version(v) => v.min(entry.version),
        };

        let live = entry
            .slots_back_from(start)
            .filter_map(|(_, slot)| self.log.get(slot.checkpoint));
        let (messages, is_end) = take_page(live, max_count);
        StreamMessagesPage {
            stream_id: stream_id.to_string(),
            status: PageReadStatus::Success,
            from_version: start,
            next_version: messages
                .last()
                .map_or(start, |m| m.stream_version.saturating_sub(1)),
            last_stream_version: Some(entry.version),
            direction: ReadDirection::Backward,
            is_end,
            messages,
        }
    }

    /// Highest live checkpoint, `None` when the store holds no messages.
    pub(crate) fn head_checkpoint(&self) -> Option<u64> {
        self.log.head()
    }

    /// Live messages in `stream_id`, 0 for an unknown stream.
    pub(crate) fn stream_message_count(&self, stream_id: &str) -> usize {
        self.streams.get(stream_id).map_or(0, |e| e.live_count())
    }
}
