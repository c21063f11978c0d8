//! JSON codec for the messages the store writes about itself.
//!
//! Metadata messages and deletion tombstones are ordinary stream messages whose
//! payload is JSON. This module owns their shapes, their message type tags and the
//! reserved stream-id conventions. It is pure data transformation: no locking, no
//! index access.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{NewStreamMessage, StreamMessage, StreamMetadataResult};

/// Prefix that turns a stream id into the id of its metadata stream.
pub const METADATA_STREAM_PREFIX: &str = "$$";

/// Reserved stream collecting one tombstone per deleted message or stream.
pub const DELETED_STREAM_ID: &str = "$deleted";

/// Message type of metadata messages.
pub const STREAM_METADATA_TYPE: &str = "$stream-metadata";

/// Message type of the tombstone written when a single message is deleted.
pub const MESSAGE_DELETED_TYPE: &str = "$message-deleted";

/// Message type of the tombstone written when a stream is deleted.
pub const STREAM_DELETED_TYPE: &str = "$stream-deleted";

/// Id of the metadata stream companion to `stream_id`.
pub fn metadata_stream_id(stream_id: &str) -> String {
    format!("{METADATA_STREAM_PREFIX}{stream_id}")
}

/// Payload of a `$stream-metadata` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetadataMessage {
    pub stream_id: String,
    #[serde(default)]
    pub max_age: Option<u32>,
    #[serde(default)]
    pub max_count: Option<u32>,
    #[serde(default)]
    pub meta_json: Option<String>,
}

impl MetadataMessage {
    /// Encode as a new message for the metadata stream.
    pub(crate) fn to_new_message(&self) -> NewStreamMessage {
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        NewStreamMessage::new(Uuid::new_v4(), STREAM_METADATA_TYPE, Bytes::from(json))
    }

    /// Decode the payload of a committed metadata message.
    pub(crate) fn decode(message: &StreamMessage) -> Result<MetadataMessage, Error> {
        decode_payload(message)
    }

    /// Project into the public metadata result.
    pub(crate) fn into_result(self, stream_id: &str, version: u64) -> StreamMetadataResult {
        StreamMetadataResult {
            stream_id: stream_id.to_string(),
            metadata_stream_version: Some(version),
            max_age: self.max_age,
            max_count: self.max_count,
            custom_metadata: self.meta_json,
        }
    }
}

/// A decoded deletion tombstone read back from the `$deleted` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tombstone {
    /// A single message was removed from a stream.
    MessageDeleted {
        /// Stream the message belonged to.
        stream_id: String,
        /// Id of the removed message.
        message_id: Uuid,
    },
    /// A whole stream was removed.
    StreamDeleted {
        /// Id of the removed stream.
        stream_id: String,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDeletedPayload {
    stream_id: String,
    message_id: Uuid,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamDeletedPayload {
    stream_id: String,
}

impl Tombstone {
    /// Encode as a new message for the `$deleted` stream.
    pub(crate) fn to_new_message(&self) -> NewStreamMessage {
        let (message_type, json) = match self {
            Tombstone::MessageDeleted {
                stream_id,
                message_id,
            } => (
                MESSAGE_DELETED_TYPE,
                serde_json::to_vec(&MessageDeletedPayload {
                    stream_id: stream_id.clone(),
                    message_id: *message_id,
                }),
            ),
            Tombstone::StreamDeleted { stream_id } => (
                STREAM_DELETED_TYPE,
                serde_json::to_vec(&StreamDeletedPayload {
                    stream_id: stream_id.clone(),
                }),
            ),
        };
        NewStreamMessage::new(
            Uuid::new_v4(),
            message_type,
            Bytes::from(json.unwrap_or_default()),
        )
    }

    /// Decode a message read from the `$deleted` stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptSystemMessage`] if the message type is not a tombstone
    /// type or the payload does not match it.
    pub fn decode(message: &StreamMessage) -> Result<Tombstone, Error> {
        match message.message_type.as_str() {
            MESSAGE_DELETED_TYPE => {
                let payload: MessageDeletedPayload = decode_payload(message)?;
                Ok(Tombstone::MessageDeleted {
                    stream_id: payload.stream_id,
                    message_id: payload.message_id,
                })
            }
            STREAM_DELETED_TYPE => {
                let payload: StreamDeletedPayload = decode_payload(message)?;
                Ok(Tombstone::StreamDeleted {
                    stream_id: payload.stream_id,
                })
            }
            other => Err(Error::CorruptSystemMessage {
                stream_id: message.stream_id.clone(),
                detail: format!("unexpected tombstone type '{other}'"),
            }),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(message: &StreamMessage) -> Result<T, Error> {
    serde_json::from_slice(&message.payload).map_err(|e| Error::CorruptSystemMessage {
        stream_id: message.stream_id.clone(),
        detail: e.to_string(),
    })
}
