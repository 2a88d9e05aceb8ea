//! Message types exchanged with the remote store and persisted in the cache.
//!
//! Field names serialize as camelCase (`senderId`, `createdAt`, ...) so that
//! cached records and remote documents share one JSON shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed text payload size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix carried by ids of locally-created, unacknowledged messages.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Identifier of a message.
///
/// Confirmed ids are assigned by the remote store and are opaque strings.
/// Unacknowledged sends carry a `temp-` prefixed id until the remote copy
/// supersedes them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a remote-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh transient id (`temp-<uuid v7>`).
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id belongs to an unacknowledged local send.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a room participant (sender, receiver, reader).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of content a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Voice,
    Gif,
    Sticker,
    File,
    /// Text plus one or more media attachments.
    Mixed,
}

/// Category of an attached media item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    /// Anything the client cannot render, including a missing type.
    #[default]
    #[serde(other)]
    Unsupported,
}

/// A media attachment reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaItem {
    pub uri: String,
    #[serde(rename = "type", default)]
    pub kind: MediaKind,
}

/// Denormalized reference to the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub message_id: MessageId,
    #[serde(default)]
    pub text: String,
    pub sender_id: ParticipantId,
    #[serde(default)]
    pub sender_name: String,
}

/// Delivery lifecycle of a message.
///
/// Ordered `Sending < Sent < Delivered < Read`. A message's status only moves
/// forward; see [`MessageStatus::advanced`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Created locally, not yet acknowledged by the remote store.
    Sending,
    /// Accepted by the remote store.
    #[default]
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Seen by the recipient.
    Read,
}

impl MessageStatus {
    /// Returns the later of the two statuses.
    #[must_use]
    pub fn advanced(self, other: Self) -> Self {
        self.max(other)
    }
}

/// A chat message as displayed, cached and exchanged with the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<ParticipantId>,
    /// Sole ordering key within a room.
    pub created_at: Timestamp,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub media: Vec<MediaItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub seen_by: BTreeMap<ParticipantId, bool>,
}

impl Message {
    /// Whether this is an unacknowledged local echo.
    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        self.id.is_temporary()
    }

    /// Whether `other` looks like the same logical message: same sender and
    /// text, created within `window_ms` of each other.
    #[must_use]
    pub fn is_near_duplicate_of(&self, other: &Self, window_ms: u64) -> bool {
        self.sender_id == other.sender_id
            && self.text == other.text
            && self.created_at.abs_diff(other.created_at) <= window_ms
    }
}

/// Error returned when a draft fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text nor media.
    #[error("message has no text and no media")]
    Empty,
    /// Text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// User-composed content that has not been sent yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub receiver_id: Option<ParticipantId>,
    pub text: String,
    pub message_type: MessageType,
    pub media: Vec<MediaItem>,
    pub reply_to: Option<ReplyRef>,
}

impl Draft {
    /// Plain text draft.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Checks that the draft has content and is within the size limit
    /// ([`MAX_MESSAGE_SIZE`] = 64 KB).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if there is neither text nor media,
    /// or [`ValidationError::TooLarge`] if the text exceeds `MAX_MESSAGE_SIZE`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.text.trim().is_empty() && self.media.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.text.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// A validated draft stamped with its author and creation time, as handed
/// to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: ParticipantId,
    pub receiver_id: Option<ParticipantId>,
    pub text: String,
    pub message_type: MessageType,
    pub media: Vec<MediaItem>,
    pub reply_to: Option<ReplyRef>,
    pub created_at: Timestamp,
}

impl OutgoingMessage {
    #[must_use]
    pub fn from_draft(draft: Draft, sender_id: ParticipantId, created_at: Timestamp) -> Self {
        Self {
            sender_id,
            receiver_id: draft.receiver_id,
            text: draft.text,
            message_type: draft.message_type,
            media: draft.media,
            reply_to: draft.reply_to,
            created_at,
        }
    }

    /// Materializes the message under the given id and status.
    #[must_use]
    pub fn into_message(self, id: MessageId, status: MessageStatus) -> Message {
        Message {
            id,
            text: self.text,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            created_at: self.created_at,
            message_type: self.message_type,
            media: self.media,
            reply_to: self.reply_to,
            status,
            seen_by: BTreeMap::new(),
        }
    }
}
