//! JSON encoding of persisted cache records.
//!
//! A room's cache is two records: a message snapshot and a sibling metadata
//! record. Snapshots decode leniently: the record envelope must parse, but
//! each message entry is checked on its own so that a handful of damaged
//! entries can be dropped instead of losing the whole record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{MediaItem, Message, MessageId, ParticipantId, Timestamp};

/// Version tag written into every snapshot record.
pub const CACHE_VERSION: &str = "1";

/// Error type for record encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization of the record envelope failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a single cached message entry was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    /// The entry does not have the shape of a message.
    #[error("malformed entry: {0}")]
    Malformed(String),
    /// A required identifier is present but empty.
    #[error("empty required field `{0}`")]
    EmptyField(&'static str),
}

/// Message snapshot record as written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub messages: Vec<Message>,
    /// When the record was written.
    pub timestamp: Timestamp,
    pub version: String,
}

/// Derived pagination metadata stored next to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub oldest_timestamp: Option<Timestamp>,
    pub has_more: bool,
    pub last_updated: Timestamp,
}

#[derive(Deserialize)]
struct RawSnapshotRecord {
    #[serde(default)]
    messages: Vec<Value>,
    timestamp: Timestamp,
    #[serde(default)]
    version: String,
}

/// A snapshot record whose entries have been checked one by one.
#[derive(Debug)]
pub struct DecodedSnapshot {
    pub timestamp: Timestamp,
    pub version: String,
    /// Entries in stored order.
    pub entries: Vec<Result<Message, EntryError>>,
}

impl DecodedSnapshot {
    /// Number of entries that decoded into a usable message.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_ok()).count()
    }

    /// Consumes the snapshot, keeping only the usable messages.
    #[must_use]
    pub fn into_valid(self) -> Vec<Message> {
        self.entries.into_iter().filter_map(Result::ok).collect()
    }
}

/// Encodes a snapshot record.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the record cannot be serialized.
pub fn encode_snapshot(record: &SnapshotRecord) -> Result<String, CodecError> {
    Ok(serde_json::to_string(record)?)
}

/// Decodes a snapshot record, checking each message entry independently.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the record envelope itself is not
/// valid (not JSON, missing `timestamp`, `messages` not a list).
pub fn decode_snapshot(text: &str) -> Result<DecodedSnapshot, CodecError> {
    let raw: RawSnapshotRecord = serde_json::from_str(text)?;
    Ok(DecodedSnapshot {
        timestamp: raw.timestamp,
        version: raw.version,
        entries: raw.messages.into_iter().map(decode_entry).collect(),
    })
}

/// Checks a single cached entry.
///
/// Only the fields needed to place and display a message are required: a
/// non-empty string `id`, a non-empty string `senderId`, a string `text` and
/// a numeric `createdAt`. Every other field is optional; a value this build
/// does not understand falls back to the field's default, and unreadable
/// media items are skipped.
///
/// # Errors
///
/// Returns [`EntryError`] describing why the entry is unusable.
pub fn decode_entry(value: Value) -> Result<Message, EntryError> {
    let Value::Object(mut fields) = value else {
        return Err(EntryError::Malformed("entry is not an object".into()));
    };
    let id = required_str(&mut fields, "id")?;
    let sender_id = required_str(&mut fields, "senderId")?;
    let text = required_str(&mut fields, "text")?;
    let created_at = fields
        .get("createdAt")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            EntryError::Malformed("`createdAt` is missing or not a number".into())
        })?;
    if id.is_empty() {
        return Err(EntryError::EmptyField("id"));
    }
    if sender_id.is_empty() {
        return Err(EntryError::EmptyField("senderId"));
    }

    let media = match fields.remove("media") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<MediaItem>(item).ok())
            .collect(),
        _ => Vec::new(),
    };
    Ok(Message {
        id: MessageId::new(id),
        text,
        sender_id: ParticipantId::new(sender_id),
        receiver_id: optional(&mut fields, "receiverId"),
        created_at: Timestamp::from_millis(created_at),
        message_type: optional(&mut fields, "messageType").unwrap_or_default(),
        media,
        reply_to: optional(&mut fields, "replyTo"),
        status: optional(&mut fields, "status").unwrap_or_default(),
        seen_by: optional(&mut fields, "seenBy").unwrap_or_default(),
    })
}

fn required_str(fields: &mut Map<String, Value>, key: &str) -> Result<String, EntryError> {
    match fields.remove(key) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(EntryError::Malformed(format!(
            "`{key}` is missing or not a string"
        ))),
    }
}

fn optional<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str) -> Option<T> {
    fields
        .remove(key)
        .and_then(|value| serde_json::from_value(value).ok())
}

/// Encodes a metadata record.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the record cannot be serialized.
pub fn encode_metadata(record: &MetadataRecord) -> Result<String, CodecError> {
    Ok(serde_json::to_string(record)?)
}

/// Decodes a metadata record.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a metadata record.
pub fn decode_metadata(text: &str) -> Result<MetadataRecord, CodecError> {
    Ok(serde_json::from_str(text)?)
}
