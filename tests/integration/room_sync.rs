//! Integration tests for room open/close and snapshot synchronization.
//!
//! Covers the room lifecycle against the in-memory gateway:
//! 1. One live subscription per open room; a second open is a no-op.
//! 2. Every snapshot fully replaces the displayed list.
//! 3. Stream errors keep the last good list and set `error`; a stream that
//!    ends releases the room so it can be opened again.
//! 4. Closing a room stops updates but keeps its messages.
//! 5. Logout tears down every room and clears the cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::cache::store::{InMemoryKv, KeyValueStore};
use chatsync::cache::{CacheConfig, LocalCacheStore};
use chatsync::gateway::GatewayError;
use chatsync::gateway::memory::InMemoryGateway;
use chatsync::room::{RoomMessageState, SyncPhase};
use chatsync::sync::{OpenOutcome, SyncConfig, SyncController, SyncError, SyncEvent};
use chatsync_proto::message::{
    Draft, Message, MessageId, MessageStatus, OutgoingMessage, ParticipantId, RoomId, Timestamp,
};

type Controller = SyncController<InMemoryGateway, InMemoryKv>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn msg(id: &str, sender: &str, text: &str, t: u64) -> Message {
    OutgoingMessage::from_draft(
        Draft::text(text),
        ParticipantId::new(sender),
        Timestamp::from_millis(t),
    )
    .into_message(MessageId::new(id), MessageStatus::Sent)
}

fn make_controller(gateway: InMemoryGateway) -> (Arc<Controller>, mpsc::Receiver<SyncEvent>) {
    SyncController::new(
        gateway,
        LocalCacheStore::new(InMemoryKv::new(), CacheConfig::default()),
        SyncConfig {
            participant: ParticipantId::new("me"),
            ..SyncConfig::default()
        },
    )
}

/// Wait until the room's state satisfies `done` and return it.
async fn wait_state(
    ctrl: &Controller,
    room: &RoomId,
    done: impl FnMut(&RoomMessageState) -> bool,
) -> RoomMessageState {
    let mut rx = ctrl.watch(room).expect("room has state");
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(done))
        .await
        .expect("state settled in time")
        .expect("state channel open")
        .clone()
}

/// Wait until the room's cache entry holds `count` messages.
async fn wait_cached(ctrl: &Controller, room: &RoomId, count: usize) -> Vec<Message> {
    for _ in 0..200 {
        if let Some(entry) = ctrl.cache().load(room).await
            && entry.messages.len() == count
        {
            return entry.messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache for {room} never reached {count} messages");
}

fn drain(events: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn ids(state: &RoomMessageState) -> Vec<&str> {
    state.messages.iter().map(|m| m.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cold_open_goes_live_with_remote_content() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(
        &room,
        vec![
            msg("b", "peer", "second", 200),
            msg("a", "peer", "first", 100),
            msg("c", "peer", "third", 300),
        ],
    );
    let (ctrl, mut events) = make_controller(gateway);

    let outcome = ctrl.open_room(&room).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Opened { from_cache: false });
    assert!(ctrl.is_open(&room));

    let state = wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;
    assert_eq!(ids(&state), vec!["a", "b", "c"]);
    assert!(!state.loading);
    assert_eq!(state.error, None);
    assert_eq!(state.oldest_timestamp, Some(Timestamp::from_millis(100)));

    assert!(drain(&mut events).contains(&SyncEvent::RoomLive {
        room: room.clone(),
        count: 3,
    }));
}

#[tokio::test]
async fn second_open_is_noop() {
    let (ctrl, _events) = make_controller(InMemoryGateway::new());
    let room = RoomId::new("general");

    ctrl.open_room(&room).await.unwrap();
    assert_eq!(
        ctrl.open_room(&room).await.unwrap(),
        OpenOutcome::AlreadyOpen
    );
    assert_eq!(ctrl.gateway().subscriber_count(&room), 1);
    assert_eq!(ctrl.open_rooms(), vec![room]);
}

#[tokio::test]
async fn snapshots_fully_replace_the_list() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(&room, vec![msg("a", "peer", "first", 100)]);
    let (ctrl, _events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    ctrl.gateway()
        .push_remote(&room, msg("b", "peer", "second", 200))
        .await;
    let state = wait_state(&ctrl, &room, |s| s.messages.len() == 2).await;
    assert_eq!(ids(&state), vec!["a", "b"]);

    ctrl.gateway()
        .remove_remote(&room, &MessageId::new("a"))
        .await;
    let state = wait_state(&ctrl, &room, |s| s.messages.len() == 1).await;
    assert_eq!(ids(&state), vec!["b"]);
    assert_eq!(state.oldest_timestamp, Some(Timestamp::from_millis(200)));
}

#[tokio::test]
async fn snapshot_content_is_cached() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(
        &room,
        vec![msg("a", "peer", "first", 100), msg("b", "peer", "second", 200)],
    );
    let (ctrl, _events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    let cached = wait_cached(&ctrl, &room, 2).await;
    let cached_ids: Vec<&str> = cached.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(cached_ids, vec!["a", "b"]);
}

#[tokio::test]
async fn stream_error_keeps_last_good_list() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(
        &room,
        vec![msg("a", "peer", "first", 100), msg("b", "peer", "second", 200)],
    );
    let (ctrl, mut events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    ctrl.gateway()
        .fail_subscription(&room, GatewayError::PermissionDenied("revoked".into()))
        .await;
    let state = wait_state(&ctrl, &room, |s| s.error.is_some()).await;
    assert_eq!(state.messages.len(), 2);
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("permission denied: revoked"));

    assert!(drain(&mut events).contains(&SyncEvent::SubscriptionFailed {
        room: room.clone(),
        error: "permission denied: revoked".into(),
    }));

    // A later snapshot clears the error again.
    ctrl.gateway()
        .push_remote(&room, msg("c", "peer", "third", 300))
        .await;
    let state = wait_state(&ctrl, &room, |s| s.messages.len() == 3).await;
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn ended_stream_releases_room_for_reopen() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(
        &room,
        vec![msg("a", "peer", "first", 100), msg("b", "peer", "second", 200)],
    );
    let (ctrl, mut events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    ctrl.gateway().end_streams(&room);
    let state = wait_state(&ctrl, &room, |s| s.error.is_some()).await;
    assert_eq!(state.error.as_deref(), Some("snapshot stream closed"));
    assert_eq!(state.messages.len(), 2);
    assert!(!ctrl.is_open(&room));
    assert!(drain(&mut events).contains(&SyncEvent::SubscriptionFailed {
        room: room.clone(),
        error: "snapshot stream closed".into(),
    }));

    // The room is not stuck behind a dead handle: opening it again resubscribes.
    let outcome = ctrl.open_room(&room).await.unwrap();
    assert!(matches!(outcome, OpenOutcome::Opened { .. }));
    assert_eq!(ctrl.gateway().subscriber_count(&room), 1);

    ctrl.gateway()
        .push_remote(&room, msg("c", "peer", "third", 300))
        .await;
    let state = wait_state(&ctrl, &room, |s| s.messages.len() == 3).await;
    assert_eq!(state.error, None);
    assert!(ctrl.is_open(&room));
}

#[tokio::test]
async fn failed_subscribe_leaves_room_retryable() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(&room, vec![msg("a", "peer", "first", 100)]);
    gateway.fail_next_subscribe(GatewayError::Unavailable("offline".into()));
    let (ctrl, _events) = make_controller(gateway);

    let err = ctrl.open_room(&room).await.unwrap_err();
    assert!(matches!(err, SyncError::Subscription { .. }));
    assert!(!ctrl.is_open(&room));
    let state = ctrl.get_state(&room).unwrap();
    assert!(!state.loading);
    assert!(state.error.is_some());

    assert_eq!(
        ctrl.open_room(&room).await.unwrap(),
        OpenOutcome::Opened { from_cache: false }
    );
    let state = wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;
    assert_eq!(ids(&state), vec!["a"]);
    assert_eq!(state.error, None);
}

#[tokio::test]
async fn initial_fetch_failure_still_goes_live() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(&room, vec![msg("a", "peer", "first", 100)]);
    gateway.fail_next_fetch(GatewayError::Unavailable("flaky".into()));
    let (ctrl, _events) = make_controller(gateway);

    ctrl.open_room(&room).await.unwrap();
    let state = wait_state(&ctrl, &room, |s| {
        s.phase == SyncPhase::Live && !s.loading && s.error.is_none()
    })
    .await;
    assert_eq!(ids(&state), vec!["a"]);
}

#[tokio::test]
async fn close_stops_updates_but_keeps_messages() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(&room, vec![msg("a", "peer", "first", 100)]);
    let (ctrl, _events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    assert!(ctrl.close_room(&room));
    assert!(!ctrl.close_room(&room));
    assert!(!ctrl.is_open(&room));
    assert_eq!(ctrl.gateway().subscriber_count(&room), 0);

    ctrl.gateway()
        .push_remote(&room, msg("b", "peer", "second", 200))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = ctrl.get_state(&room).unwrap();
    assert_eq!(ids(&state), vec!["a"]);
    assert_eq!(state.phase, SyncPhase::Idle);
}

#[tokio::test]
async fn reopen_after_close_resubscribes() {
    let gateway = InMemoryGateway::new();
    let room = RoomId::new("general");
    gateway.seed(&room, vec![msg("a", "peer", "first", 100)]);
    let (ctrl, _events) = make_controller(gateway);
    ctrl.open_room(&room).await.unwrap();
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;
    wait_cached(&ctrl, &room, 1).await;
    ctrl.close_room(&room);

    ctrl.gateway()
        .push_remote(&room, msg("b", "peer", "second", 200))
        .await;

    let outcome = ctrl.open_room(&room).await.unwrap();
    assert_eq!(outcome, OpenOutcome::Opened { from_cache: true });
    let state = wait_state(&ctrl, &room, |s| {
        s.phase == SyncPhase::Live && s.messages.len() == 2
    })
    .await;
    assert_eq!(ids(&state), vec!["a", "b"]);
    assert_eq!(ctrl.gateway().subscriber_count(&room), 1);
}

#[tokio::test]
async fn rooms_are_independent() {
    let gateway = InMemoryGateway::new();
    let one = RoomId::new("one");
    let two = RoomId::new("two");
    gateway.seed(&one, vec![msg("a", "peer", "in one", 100)]);
    gateway.seed(&two, vec![msg("b", "peer", "in two", 100)]);
    let (ctrl, _events) = make_controller(gateway);

    ctrl.open_room(&one).await.unwrap();
    ctrl.open_room(&two).await.unwrap();
    wait_state(&ctrl, &one, |s| s.phase == SyncPhase::Live).await;
    wait_state(&ctrl, &two, |s| s.phase == SyncPhase::Live).await;

    ctrl.gateway()
        .push_remote(&one, msg("c", "peer", "more", 200))
        .await;
    wait_state(&ctrl, &one, |s| s.messages.len() == 2).await;
    assert_eq!(ids(&ctrl.get_state(&two).unwrap()), vec!["b"]);
}

#[tokio::test]
async fn logout_tears_everything_down() {
    let gateway = InMemoryGateway::new();
    let one = RoomId::new("one");
    let two = RoomId::new("two");
    gateway.seed(&one, vec![msg("a", "peer", "x", 100)]);
    gateway.seed(&two, vec![msg("b", "peer", "y", 100)]);
    let (ctrl, _events) = make_controller(gateway);
    ctrl.open_room(&one).await.unwrap();
    ctrl.open_room(&two).await.unwrap();
    let mut watcher = ctrl.watch(&one).unwrap();

    ctrl.logout().await;

    assert!(ctrl.get_state(&one).is_none());
    assert!(ctrl.get_state(&two).is_none());
    assert!(ctrl.open_rooms().is_empty());
    assert_eq!(ctrl.gateway().subscriber_count(&one), 0);
    assert_eq!(ctrl.gateway().subscriber_count(&two), 0);
    assert!(ctrl.cache().kv().keys().await.unwrap().is_empty());
    // Observers see the room go away.
    assert!(watcher.has_changed().is_err());
}
