//! Remote message store abstraction.
//!
//! Defines the [`RemoteGateway`] trait the synchronization engine talks to.
//! The remote store is treated as an opaque, ordered document stream with
//! at-least-once delivery; how it is reached is the implementation's concern.
//! Concrete implementations include:
//! - [`memory::InMemoryGateway`]: in-process store for tests and the demo

pub mod memory;

use std::fmt;

use tokio::sync::mpsc;

use chatsync_proto::message::{
    Message, MessageId, OutgoingMessage, ParticipantId, RoomId, Timestamp,
};

/// Errors reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The store could not be reached.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The store refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The snapshot stream ended.
    #[error("snapshot stream closed")]
    StreamClosed,
}

/// Sort direction for snapshot queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Parameters of a live room query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotQuery {
    /// Order of messages by `created_at`.
    pub order: SortOrder,
    /// Keep only the most recent `limit` messages, if set.
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    /// Ascending by `created_at`, optionally depth-limited.
    #[must_use]
    pub const fn ascending(limit: Option<usize>) -> Self {
        Self {
            order: SortOrder::Ascending,
            limit,
        }
    }
}

/// One item of a snapshot stream: a full ordered message list, or a
/// stream failure.
pub type SnapshotResult = Result<Vec<Message>, GatewayError>;

/// Cancels a live subscription on the remote side.
pub struct CancelHandle(Option<Box<dyn FnOnce() + Send + Sync>>);

impl CancelHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// A handle with nothing to cancel.
    #[must_use]
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle")
            .field(&self.0.is_some())
            .finish()
    }
}

/// A live room query: snapshots arrive on `snapshots` until cancelled.
#[derive(Debug)]
pub struct Subscription {
    pub snapshots: mpsc::Receiver<SnapshotResult>,
    pub cancel: CancelHandle,
}

/// Async interface to the remote room message collection.
///
/// # Invariant
///
/// Every snapshot is the complete, current message list for the query, not a
/// delta. A successful [`send`](RemoteGateway::send) implies the message
/// eventually appears in the room's snapshot stream.
pub trait RemoteGateway: Send + Sync {
    /// Open a live query over a room's messages.
    fn subscribe(
        &self,
        room: &RoomId,
        query: SnapshotQuery,
    ) -> impl std::future::Future<Output = Result<Subscription, GatewayError>> + Send;

    /// Fetch up to `limit` of the most recent messages created strictly
    /// before `before` (or the newest messages if `None`), ascending.
    fn fetch_page(
        &self,
        room: &RoomId,
        limit: usize,
        before: Option<Timestamp>,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, GatewayError>> + Send;

    /// Store a new message; returns the id the remote store assigned.
    fn send(
        &self,
        room: &RoomId,
        message: &OutgoingMessage,
    ) -> impl std::future::Future<Output = Result<MessageId, GatewayError>> + Send;

    /// Record that `participant` has seen the room's messages.
    fn mark_seen(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;
}
