//! Room synchronization engine.
//!
//! [`SyncController`] keeps one [`RoomMessageState`] per room consistent
//! across three sources: the remote snapshot stream, local optimistic sends,
//! and the on-device cache. It owns the room registry (one live subscription
//! per open room), applies every update as a reducer against the latest
//! state, and publishes the result through a `watch` channel per room.
//!
//! # Room open sequence
//!
//! 1. The room is marked open before anything is awaited, so a second
//!    `open_room` is a no-op.
//! 2. The cache is validated, repaired and loaded (see `reconcile`).
//! 3. The remote subscription starts; a listener task applies snapshots.
//! 4. A bounded initial page fetch runs and is applied unless a snapshot
//!    got there first.
//!
//! Each open gets a fresh session number. Any result that resolves after
//! its room closed or was reopened is discarded.
//!
//! The operations are split across files: `send` (optimistic pipeline and
//! read receipts), `pagination` (backward history) and `reconcile` (cache
//! restore and initial fetch).

mod pagination;
mod reconcile;
mod send;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chatsync_proto::message::{
    Message, MessageId, ParticipantId, RoomId, Timestamp, ValidationError,
};

use crate::cache::LocalCacheStore;
use crate::cache::store::KeyValueStore;
use crate::gateway::{
    CancelHandle, GatewayError, RemoteGateway, SnapshotQuery, SnapshotResult, Subscription,
};
use crate::room::{RoomMessageState, SyncPhase, dedupe_near_duplicates};

pub use pagination::{LoadOlderOutcome, SkipReason};
pub use send::PendingSend;

/// Errors surfaced to callers of the controller.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The remote subscription could not be started.
    #[error("subscription to room {room} failed: {source}")]
    Subscription { room: RoomId, source: GatewayError },

    /// A send was rejected; its optimistic entry has been rolled back.
    #[error("send to room {room} failed: {source}")]
    Send { room: RoomId, source: GatewayError },

    /// An older page could not be fetched; the cursor is unchanged.
    #[error("loading older messages in room {room} failed: {source}")]
    Pagination { room: RoomId, source: GatewayError },

    /// The read receipt could not be recorded remotely.
    #[error("marking room {room} as seen failed: {source}")]
    MarkSeen { room: RoomId, source: GatewayError },

    /// The room has never been opened on this controller.
    #[error("room {0} is not known")]
    UnknownRoom(RoomId),

    /// The draft was rejected before anything was shown.
    #[error("invalid draft: {0}")]
    Validation(#[from] ValidationError),
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Cached content was put on screen for a room.
    CacheRestored { room: RoomId, count: usize },
    /// The first remote snapshot of a room was applied.
    RoomLive { room: RoomId, count: usize },
    /// The snapshot stream of a room reported an error.
    SubscriptionFailed { room: RoomId, error: String },
    /// A send failed and its local echo was removed.
    SendFailed {
        room: RoomId,
        temp_id: MessageId,
        error: String,
    },
    /// An older page could not be loaded.
    PaginationFailed { room: RoomId, error: String },
}

/// Result of [`SyncController::open_room`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The room was opened; `from_cache` tells whether cached content was shown.
    Opened { from_cache: bool },
    /// The room already had a live subscription.
    AlreadyOpen,
    /// The room was closed again before opening finished.
    Abandoned,
}

/// Tuning for the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The local user; author of every send.
    pub participant: ParticipantId,
    /// Messages requested per history page.
    pub page_size: usize,
    /// Depth limit requested from the snapshot stream, if any.
    pub snapshot_limit: Option<usize>,
    /// Window within which same-sender, same-text messages count as one.
    pub dedup_window: Duration,
    /// Capacity of the [`SyncEvent`] channel.
    pub event_buffer: usize,
    /// Source of `created_at` for optimistic messages.
    pub clock: fn() -> Timestamp,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            participant: ParticipantId::new("local"),
            page_size: 20,
            snapshot_limit: None,
            dedup_window: Duration::from_secs(2),
            event_buffer: 64,
            clock: Timestamp::now,
        }
    }
}

/// Live subscription of an open room.
struct SubscriptionHandle {
    cancel: CancelHandle,
    listener: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn cancel(self) {
        self.cancel.cancel();
        self.listener.abort();
    }
}

/// Bookkeeping that travels with a room's state but is not displayed.
#[derive(Debug, Default)]
struct RoomTracking {
    /// Temp ids of sends that have not resolved yet.
    pending: HashSet<MessageId>,
    /// An older-page fetch is in flight.
    paging: bool,
}

struct RoomEntry {
    state: watch::Sender<RoomMessageState>,
    subscription: Option<SubscriptionHandle>,
    tracking: RoomTracking,
    open: bool,
    session: u64,
}

impl RoomEntry {
    fn new() -> Self {
        let (state, _) = watch::channel(RoomMessageState::default());
        Self {
            state,
            subscription: None,
            tracking: RoomTracking::default(),
            open: false,
            session: 0,
        }
    }

    const fn is_current(&self, session: u64) -> bool {
        self.open && self.session == session
    }
}

/// Per-room message synchronization over a remote gateway and a local cache.
pub struct SyncController<G: RemoteGateway, K: KeyValueStore> {
    gateway: G,
    cache: LocalCacheStore<K>,
    config: SyncConfig,
    /// Room registry. Never held across an `.await`.
    rooms: Mutex<HashMap<RoomId, RoomEntry>>,
    next_session: AtomicU64,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<G, K> SyncController<G, K>
where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    /// Creates a controller.
    ///
    /// Returns the controller and a receiver for [`SyncEvent`]s that the
    /// presentation layer should consume.
    pub fn new(
        gateway: G,
        cache: LocalCacheStore<K>,
        config: SyncConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let controller = Arc::new(Self {
            gateway,
            cache,
            config,
            rooms: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            event_tx,
        });
        (controller, event_rx)
    }

    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    pub const fn cache(&self) -> &LocalCacheStore<K> {
        &self.cache
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open a room: restore cache, subscribe, fetch the first page.
    ///
    /// Opening a room that is already open is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Subscription`] if the snapshot stream cannot be
    /// started. The room is then left closed so that it can be retried, with
    /// the error recorded in its state.
    pub async fn open_room(self: &Arc<Self>, room: &RoomId) -> Result<OpenOutcome, SyncError> {
        let session = {
            let mut rooms = self.rooms.lock();
            let entry = rooms.entry(room.clone()).or_insert_with(RoomEntry::new);
            if entry.open {
                tracing::debug!(room_id = %room, "room already open");
                return Ok(OpenOutcome::AlreadyOpen);
            }
            entry.open = true;
            entry.session = self.next_session.fetch_add(1, Ordering::SeqCst);
            entry.tracking = RoomTracking::default();
            entry.session
        };
        tracing::info!(room_id = %room, session, "opening room");

        let from_cache = self.restore_cached(room, session).await;

        let query = SnapshotQuery::ascending(self.config.snapshot_limit);
        let subscription = match self.gateway.subscribe(room, query).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "subscription failed");
                {
                    let mut rooms = self.rooms.lock();
                    if let Some(entry) = rooms.get_mut(room)
                        && entry.is_current(session)
                    {
                        entry.open = false;
                        entry.state.send_modify(|state| state.fail(err.to_string()));
                    }
                }
                self.emit(SyncEvent::SubscriptionFailed {
                    room: room.clone(),
                    error: err.to_string(),
                });
                return Err(SyncError::Subscription {
                    room: room.clone(),
                    source: err,
                });
            }
        };

        if !self.attach_subscription(room, session, subscription) {
            tracing::debug!(room_id = %room, session, "room closed while opening");
            return Ok(OpenOutcome::Abandoned);
        }

        self.fetch_initial_page(room, session).await;
        Ok(OpenOutcome::Opened { from_cache })
    }

    /// Install the listener for a fresh subscription. Returns `false` (and
    /// cancels the subscription) if the session is no longer current.
    fn attach_subscription(
        self: &Arc<Self>,
        room: &RoomId,
        session: u64,
        subscription: Subscription,
    ) -> bool {
        let Subscription { snapshots, cancel } = subscription;
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room).filter(|e| e.is_current(session)) else {
            cancel.cancel();
            return false;
        };
        entry.state.send_modify(RoomMessageState::begin_sync);
        let listener = tokio::spawn(run_listener(
            Arc::downgrade(self),
            room.clone(),
            session,
            snapshots,
        ));
        entry.subscription = Some(SubscriptionHandle { cancel, listener });
        true
    }

    /// Close a room: cancel its subscription and stop applying late results.
    ///
    /// Displayed messages are kept. Returns whether the room was open.
    pub fn close_room(&self, room: &RoomId) -> bool {
        let handle = {
            let mut rooms = self.rooms.lock();
            let Some(entry) = rooms.get_mut(room).filter(|e| e.open) else {
                return false;
            };
            entry.open = false;
            entry.tracking.paging = false;
            entry.state.send_modify(|state| {
                state.loading = false;
                state.phase = SyncPhase::Idle;
            });
            entry.subscription.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        tracing::info!(room_id = %room, "room closed");
        true
    }

    /// Current state of a room, if it has ever been opened.
    pub fn get_state(&self, room: &RoomId) -> Option<RoomMessageState> {
        self.rooms
            .lock()
            .get(room)
            .map(|e| e.state.borrow().clone())
    }

    /// Observe a room's state. The receiver closes when the room is torn down.
    pub fn watch(&self, room: &RoomId) -> Option<watch::Receiver<RoomMessageState>> {
        self.rooms.lock().get(room).map(|e| e.state.subscribe())
    }

    pub fn is_open(&self, room: &RoomId) -> bool {
        self.rooms.lock().get(room).is_some_and(|e| e.open)
    }

    /// Rooms with a live subscription.
    pub fn open_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .iter()
            .filter(|(_, e)| e.open)
            .map(|(room, _)| room.clone())
            .collect()
    }

    /// Tear everything down: close every room, drop all room state, and
    /// clear the local cache.
    pub async fn logout(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut rooms = self.rooms.lock();
            rooms
                .drain()
                .filter_map(|(_, mut entry)| entry.subscription.take())
                .collect()
        };
        let closed = handles.len();
        for handle in handles {
            handle.cancel();
        }
        self.cache.clear_all().await;
        tracing::info!(closed, "logged out");
    }

    /// Apply `f` to a room's state and tracking if `session` is still the
    /// room's current open session. Returns `None` when the result is late.
    fn update_if_current<R>(
        &self,
        room: &RoomId,
        session: u64,
        f: impl FnOnce(&mut RoomMessageState, &mut RoomTracking) -> R,
    ) -> Option<R> {
        let mut rooms = self.rooms.lock();
        let entry = rooms.get_mut(room).filter(|e| e.is_current(session))?;
        let tracking = &mut entry.tracking;
        let mut out = None;
        entry
            .state
            .send_modify(|state| out = Some(f(state, tracking)));
        out
    }

    async fn apply_snapshot(&self, room: &RoomId, session: u64, snapshot: Vec<Message>) {
        let window = self.dedup_window_ms();
        let received = snapshot.len();
        let applied = self.update_if_current(room, session, |state, tracking| {
            let first = state.phase != SyncPhase::Live;
            state.replace_with_snapshot(snapshot, &tracking.pending, window);
            tracking
                .pending
                .retain(|id| state.messages.iter().any(|m| &m.id == id));
            state.loading = tracking.paging;
            (first, state.confirmed_messages(), state.has_more)
        });
        let Some((first, confirmed, has_more)) = applied else {
            tracing::trace!(room_id = %room, session, "discarding late snapshot");
            return;
        };
        tracing::debug!(room_id = %room, received, "snapshot applied");
        if first {
            self.emit(SyncEvent::RoomLive {
                room: room.clone(),
                count: confirmed.len(),
            });
        }
        self.persist(room, confirmed, has_more).await;
    }

    fn subscription_failed(&self, room: &RoomId, session: u64, err: &GatewayError) {
        let applied = self.update_if_current(room, session, |state, _| state.fail(err.to_string()));
        if applied.is_none() {
            return;
        }
        tracing::warn!(room_id = %room, error = %err, "snapshot stream error");
        self.emit(SyncEvent::SubscriptionFailed {
            room: room.clone(),
            error: err.to_string(),
        });
    }

    /// The snapshot stream ended on its own. Record it and release the room
    /// so that a later `open_room` subscribes again.
    fn stream_ended(&self, room: &RoomId, session: u64) {
        let err = GatewayError::StreamClosed;
        let handle = {
            let mut rooms = self.rooms.lock();
            let Some(entry) = rooms.get_mut(room).filter(|e| e.is_current(session)) else {
                return;
            };
            entry.open = false;
            entry.tracking.paging = false;
            entry.state.send_modify(|state| state.fail(err.to_string()));
            entry.subscription.take()
        };
        // The listener is the caller; only the remote side needs releasing.
        if let Some(handle) = handle {
            handle.cancel.cancel();
        }
        tracing::warn!(room_id = %room, session, "snapshot stream ended, room released");
        self.emit(SyncEvent::SubscriptionFailed {
            room: room.clone(),
            error: err.to_string(),
        });
    }

    /// Write confirmed content and the room's `has_more` to the cache,
    /// collapsing near-duplicates.
    async fn persist(&self, room: &RoomId, confirmed: Vec<Message>, has_more: bool) {
        let deduped = dedupe_near_duplicates(confirmed, self.dedup_window_ms());
        self.cache
            .save_with_has_more(room, &deduped, has_more)
            .await;
    }

    fn dedup_window_ms(&self) -> u64 {
        u64::try_from(self.config.dedup_window.as_millis()).unwrap_or(u64::MAX)
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            tracing::debug!(error = %err, "sync event dropped");
        }
    }
}

/// Apply a room's snapshot stream until it ends or the controller goes away.
async fn run_listener<G, K>(
    controller: Weak<SyncController<G, K>>,
    room: RoomId,
    session: u64,
    mut snapshots: mpsc::Receiver<SnapshotResult>,
) where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    while let Some(item) = snapshots.recv().await {
        let Some(controller) = controller.upgrade() else {
            return;
        };
        match item {
            Ok(snapshot) => controller.apply_snapshot(&room, session, snapshot).await,
            Err(err) => controller.subscription_failed(&room, session, &err),
        }
    }
    if let Some(controller) = controller.upgrade() {
        controller.stream_ended(&room, session);
    }
}
