//! The stream index: per-stream headers and the live slots of each stream.
//!
//! A slot maps a stream version to the checkpoint holding the message in the
//! [`GlobalLog`](crate::log::GlobalLog). Headers outlive their slots: a stream whose
//! messages were all deleted one by one is still known and keeps its version counter.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use uuid::Uuid;

use crate::dedup::LastBatch;

/// Location of one live message of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Checkpoint of the message in the global log.
    pub checkpoint: u64,
    /// Caller-assigned message id.
    pub message_id: Uuid,
}

/// Header and live slots of one stream.
#[derive(Debug)]
pub struct StreamEntry {
    /// Original, caller-supplied id.
    pub id: String,
    /// Internal numeric key, assigned in stream creation order.
    pub key: u64,
    /// Highest version ever issued to the stream.
    pub version: u64,
    /// Highest checkpoint ever issued to the stream.
    pub position: u64,
    /// Live slots keyed by stream version.
    pub(crate) slots: BTreeMap<u64, Slot>,
    /// Most recently committed batch, for resend detection.
    pub(crate) last_batch: Option<LastBatch>,
}

impl StreamEntry {
    /// Number of live messages.
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    /// Version the next appended message receives.
    pub(crate) fn next_version(&self) -> u64 {
        self.version + 1
    }

    /// Live slots with version `>= from`, ascending.
    pub(crate) fn slots_from(&self, from: u64) -> impl Iterator<Item = (u64, Slot)> + '_ {
        self.slots.range(from..).map(|(v, s)| (*v, *s))
    }

    /// Live slots with version `<= from`, descending.
    pub(crate) fn slots_back_from(&self, from: u64) -> impl Iterator<Item = (u64, Slot)> + '_ {
        self.slots
            .range((Bound::Unbounded, Bound::Included(from)))
            .rev()
            .map(|(v, s)| (*v, *s))
    }

    /// Version of the lowest-versioned live message with `message_id`.
    pub(crate) fn find_message(&self, message_id: Uuid) -> Option<u64> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.message_id == message_id)
            .map(|(v, _)| *v)
    }

    /// Versions of the `n` oldest live messages.
    pub(crate) fn oldest(&self, n: usize) -> Vec<u64> {
        self.slots.keys().take(n).copied().collect()
    }
}

/// Mapping from stream id to [`StreamEntry`].
#[derive(Debug, Default)]
pub struct StreamIndex {
    streams: HashMap<String, StreamEntry>,
    next_key: u64,
}

impl StreamIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `stream_id`, if the stream is known.
    pub fn get(&self, stream_id: &str) -> Option<&StreamEntry> {
        self.streams.get(stream_id)
    }

    pub(crate) fn get_mut(&mut self, stream_id: &str) -> Option<&mut StreamEntry> {
        self.streams.get_mut(stream_id)
    }

    /// Entry for `stream_id`, registering the stream if it is unknown.
    ///
    /// `first_checkpoint` seeds the header of a new stream; the commit that creates
    /// the stream completes it.
    pub(crate) fn get_or_create(&mut self, stream_id: &str, first_checkpoint: u64) -> &mut StreamEntry {
        let next_key = &mut self.next_key;
        self.streams
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                let key = *next_key;
                *next_key += 1;
                StreamEntry {
                    id: stream_id.to_string(),
                    key,
                    version: 0,
                    position: first_checkpoint,
                    slots: BTreeMap::new(),
                    last_batch: None,
                }
            })
    }

    /// Forget a stream entirely, returning its entry.
    pub(crate) fn remove(&mut self, stream_id: &str) -> Option<StreamEntry> {
        self.streams.remove(stream_id)
    }

    /// Ids of every known stream, in no particular order.
    pub fn stream_ids(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Number of known streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// `true` when no stream is known.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_versions(index: &mut StreamIndex, id: &str, versions: &[u64]) {
        let entry = index.get_or_create(id, 0);
        for &v in versions {
            entry.slots.insert(
                v,
                Slot {
                    checkpoint: v,
                    message_id: Uuid::new_v4(),
                },
            );
            entry.version = v;
        }
    }

    #[test]
    fn keys_follow_creation_order() {
        let mut index = StreamIndex::new();
        entry_with_versions(&mut index, "a", &[0]);
        entry_with_versions(&mut index, "b", &[0]);
        assert_eq!(index.get("a").map(|e| e.key), Some(0));
        assert_eq!(index.get("b").map(|e| e.key), Some(1));
        assert_eq!(index.len(), 2);

        // Looking up an existing stream does not consume a key.
        index.get_or_create("a", 9);
        entry_with_versions(&mut index, "c", &[0]);
        assert_eq!(index.get("c").map(|e| e.key), Some(2));
    }

    #[test]
    fn header_survives_slot_removal() {
        let mut index = StreamIndex::new();
        entry_with_versions(&mut index, "a", &[0, 1, 2]);
        let entry = index.get_mut("a").expect("stream a");
        entry.slots.clear();
        assert_eq!(entry.live_count(), 0);
        assert_eq!(entry.version, 2);
        assert_eq!(entry.next_version(), 3);
    }

    #[test]
    fn slot_ranges_respect_gaps() {
        let mut index = StreamIndex::new();
        entry_with_versions(&mut index, "a", &[0, 2, 5]);
        let entry = index.get("a").expect("stream a");

        let forward: Vec<u64> = entry.slots_from(1).map(|(v, _)| v).collect();
        assert_eq!(forward, vec![2, 5]);

        let backward: Vec<u64> = entry.slots_back_from(4).map(|(v, _)| v).collect();
        assert_eq!(backward, vec![2, 0]);

        assert_eq!(entry.oldest(2), vec![0, 2]);
    }

    #[test]
    fn find_message_returns_lowest_version_for_duplicate_ids() {
        let mut index = StreamIndex::new();
        let dup = Uuid::new_v4();
        let entry = index.get_or_create("a", 0);
        for v in [0u64, 1, 2] {
            let message_id = if v == 0 { Uuid::new_v4() } else { dup };
            entry.slots.insert(v, Slot { checkpoint: v, message_id });
        }
        assert_eq!(entry.find_message(dup), Some(1));
        assert_eq!(entry.find_message(Uuid::new_v4()), None);
    }
}
