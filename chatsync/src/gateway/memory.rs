//! In-process remote store for testing and local demos.
//!
//! [`InMemoryGateway`] keeps one message log per room and behaves like a
//! live document store: every subscriber gets an initial snapshot on
//! subscribe and a fresh full snapshot after every change. Failures can be
//! injected per operation, and page fetches can be paused to exercise
//! in-flight races.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use chatsync_proto::message::{
    Message, MessageId, MessageStatus, OutgoingMessage, ParticipantId, RoomId, Timestamp,
};

use super::{
    CancelHandle, GatewayError, RemoteGateway, SnapshotQuery, SnapshotResult, SortOrder,
    Subscription,
};

/// Default per-subscriber snapshot channel capacity.
const DEFAULT_BUFFER: usize = 64;

struct Subscriber {
    id: u64,
    query: SnapshotQuery,
    tx: mpsc::Sender<SnapshotResult>,
}

#[derive(Default)]
struct RoomLog {
    messages: Vec<Message>,
    subscribers: Vec<Subscriber>,
}

impl RoomLog {
    fn render(&self, query: SnapshotQuery) -> Vec<Message> {
        let mut snapshot = self.messages.clone();
        snapshot.sort_by_key(|m| m.created_at);
        if let Some(limit) = query.limit
            && snapshot.len() > limit
        {
            snapshot.drain(..snapshot.len() - limit);
        }
        if query.order == SortOrder::Descending {
            snapshot.reverse();
        }
        snapshot
    }
}

#[derive(Default)]
struct InjectedFailures {
    subscribe: Option<GatewayError>,
    fetch: Option<GatewayError>,
    send: Option<GatewayError>,
}

/// In-process [`RemoteGateway`] backed by per-room message logs.
pub struct InMemoryGateway {
    rooms: Arc<Mutex<HashMap<RoomId, RoomLog>>>,
    failures: Mutex<InjectedFailures>,
    /// `true` while page fetches are held back.
    fetch_gate: watch::Sender<bool>,
    next_subscriber: AtomicU64,
    fetch_calls: AtomicUsize,
    buffer: usize,
}

impl InMemoryGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Create an empty gateway with the given snapshot channel capacity.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        let (fetch_gate, _) = watch::channel(false);
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            failures: Mutex::new(InjectedFailures::default()),
            fetch_gate,
            next_subscriber: AtomicU64::new(1),
            fetch_calls: AtomicUsize::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Replace a room's log without notifying subscribers.
    pub fn seed(&self, room: &RoomId, messages: Vec<Message>) {
        self.rooms.lock().entry(room.clone()).or_default().messages = messages;
    }

    /// Append a message as if another client wrote it, and notify subscribers.
    pub async fn push_remote(&self, room: &RoomId, message: Message) {
        self.rooms
            .lock()
            .entry(room.clone())
            .or_default()
            .messages
            .push(message);
        self.broadcast(room).await;
    }

    /// Delete a message remotely, and notify subscribers.
    pub async fn remove_remote(&self, room: &RoomId, id: &MessageId) {
        if let Some(log) = self.rooms.lock().get_mut(room) {
            log.messages.retain(|m| &m.id != id);
        }
        self.broadcast(room).await;
    }

    /// Deliver a stream error to every subscriber of a room.
    pub async fn fail_subscription(&self, room: &RoomId, err: GatewayError) {
        let senders: Vec<mpsc::Sender<SnapshotResult>> = self
            .rooms
            .lock()
            .get(room)
            .map(|log| log.subscribers.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default();
        for tx in senders {
            let _ = tx.send(Err(err.clone())).await;
        }
    }

    /// End every snapshot stream of a room, as if the remote side hung up.
    pub fn end_streams(&self, room: &RoomId) {
        if let Some(log) = self.rooms.lock().get_mut(room) {
            log.subscribers.clear();
        }
    }

    /// Make the next `subscribe` call fail.
    pub fn fail_next_subscribe(&self, err: GatewayError) {
        self.failures.lock().subscribe = Some(err);
    }

    /// Make the next `fetch_page` call fail.
    pub fn fail_next_fetch(&self, err: GatewayError) {
        self.failures.lock().fetch = Some(err);
    }

    /// Make the next `send` call fail.
    pub fn fail_next_send(&self, err: GatewayError) {
        self.failures.lock().send = Some(err);
    }

    /// Hold every `fetch_page` call until [`resume_fetches`](Self::resume_fetches).
    pub fn pause_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    /// Release held and future `fetch_page` calls.
    pub fn resume_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    /// Number of `fetch_page` calls received so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of live subscribers on a room.
    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms
            .lock()
            .get(room)
            .map_or(0, |log| {
                log.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
            })
    }

    /// Current contents of a room's log, ascending.
    pub fn messages(&self, room: &RoomId) -> Vec<Message> {
        self.rooms
            .lock()
            .get(room)
            .map(|log| log.render(SnapshotQuery::ascending(None)))
            .unwrap_or_default()
    }

    /// Push a fresh snapshot to every live subscriber of `room`.
    async fn broadcast(&self, room: &RoomId) {
        let deliveries: Vec<(mpsc::Sender<SnapshotResult>, Vec<Message>)> = {
            let mut rooms = self.rooms.lock();
            let Some(log) = rooms.get_mut(room) else {
                return;
            };
            log.subscribers.retain(|s| !s.tx.is_closed());
            log.subscribers
                .iter()
                .map(|s| (s.tx.clone(), log.render(s.query)))
                .collect()
        };
        for (tx, snapshot) in deliveries {
            // A subscriber that went away between collection and delivery is fine.
            let _ = tx.send(Ok(snapshot)).await;
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteGateway for InMemoryGateway {
    async fn subscribe(
        &self,
        room: &RoomId,
        query: SnapshotQuery,
    ) -> Result<Subscription, GatewayError> {
        if let Some(err) = self.failures.lock().subscribe.take() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        {
            let mut rooms = self.rooms.lock();
            let log = rooms.entry(room.clone()).or_default();
            // The channel is fresh, so the initial snapshot always fits.
            let _ = tx.try_send(Ok(log.render(query)));
            log.subscribers.push(Subscriber { id, query, tx });
        }
        tracing::debug!(room_id = %room, subscriber = id, "subscriber registered");

        let rooms = Arc::clone(&self.rooms);
        let room = room.clone();
        let cancel = CancelHandle::new(move || {
            if let Some(log) = rooms.lock().get_mut(&room) {
                log.subscribers.retain(|s| s.id != id);
            }
            tracing::debug!(room_id = %room, subscriber = id, "subscriber cancelled");
        });

        Ok(Subscription {
            snapshots: rx,
            cancel,
        })
    }

    async fn fetch_page(
        &self,
        room: &RoomId,
        limit: usize,
        before: Option<Timestamp>,
    ) -> Result<Vec<Message>, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.fetch_gate.subscribe();
        let gate_open = gate.wait_for(|paused| !*paused).await.is_ok();
        if !gate_open {
            return Err(GatewayError::Unavailable("gateway shut down".into()));
        }

        if let Some(err) = self.failures.lock().fetch.take() {
            return Err(err);
        }

        let rooms = self.rooms.lock();
        let Some(log) = rooms.get(room) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<Message> = log
            .render(SnapshotQuery::ascending(None))
            .into_iter()
            .filter(|m| before.is_none_or(|b| m.created_at < b))
            .collect();
        if page.len() > limit {
            page.drain(..page.len() - limit);
        }
        drop(rooms);
        Ok(page)
    }

    async fn send(
        &self,
        room: &RoomId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, GatewayError> {
        if let Some(err) = self.failures.lock().send.take() {
            return Err(err);
        }

        let id = MessageId::new(Uuid::now_v7().to_string());
        let stored = message
            .clone()
            .into_message(id.clone(), MessageStatus::Sent);
        self.rooms
            .lock()
            .entry(room.clone())
            .or_default()
            .messages
            .push(stored);
        tracing::debug!(room_id = %room, message_id = %id, "message stored");

        self.broadcast(room).await;
        Ok(id)
    }

    async fn mark_seen(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), GatewayError> {
        let changed = {
            let mut rooms = self.rooms.lock();
            let Some(log) = rooms.get_mut(room) else {
                return Ok(());
            };
            let mut changed = false;
            for msg in log
                .messages
                .iter_mut()
                .filter(|m| &m.sender_id != participant)
            {
                if msg.seen_by.insert(participant.clone(), true) != Some(true) {
                    changed = true;
                }
                msg.status = msg.status.advanced(MessageStatus::Read);
            }
            changed
        };
        if changed {
            self.broadcast(room).await;
        }
        Ok(())
    }
}
