//! Integration tests for the optimistic send pipeline.
//!
//! Verifies that:
//! 1. A send is visible as a `sending` temp entry before anything is awaited.
//! 2. After a successful send the temp entry is gone and the confirmed copy
//!    arrives through a snapshot, with no duplicate.
//! 3. After a failed send the temp entry is gone and the failure is reported.
//! 4. The cache never holds optimistic entries or near-duplicates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatsync::cache::store::InMemoryKv;
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

fn clock_300() -> Timestamp {
    Timestamp::from_millis(300)
}

fn make_controller(
    gateway: InMemoryGateway,
    cache: LocalCacheStore<InMemoryKv>,
) -> (Arc<Controller>, mpsc::Receiver<SyncEvent>) {
    SyncController::new(
        gateway,
        cache,
        SyncConfig {
            participant: ParticipantId::new("me"),
            clock: clock_300,
            ..SyncConfig::default()
        },
    )
}

fn empty_cache() -> LocalCacheStore<InMemoryKv> {
    LocalCacheStore::new(InMemoryKv::new(), CacheConfig::default())
}

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

/// Open a room and wait for its first snapshot.
async fn open_live(ctrl: &Arc<Controller>, room: &RoomId) -> RoomMessageState {
    ctrl.open_room(room).await.unwrap();
    wait_state(ctrl, room, |s| s.phase == SyncPhase::Live).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Cached [A(100), B(200)], send C optimistically, then the snapshot with
/// the confirmed C replaces the list: exactly three entries, no duplicate.
#[tokio::test]
async fn confirmed_snapshot_supersedes_optimistic_entry() {
    let room = RoomId::new("r");
    let a = msg("a", "peer", "A", 100);
    let b = msg("b", "peer", "B", 200);

    let cache = empty_cache();
    cache.save(&room, &[a.clone(), b.clone()]).await;
    let gateway = InMemoryGateway::new();
    gateway.seed(&room, vec![a, b]);
    let (ctrl, _events) = make_controller(gateway, cache);

    assert_eq!(
        ctrl.open_room(&room).await.unwrap(),
        OpenOutcome::Opened { from_cache: true }
    );
    wait_state(&ctrl, &room, |s| s.phase == SyncPhase::Live).await;

    let pending = ctrl.send(&room, Draft::text("C")).unwrap();
    let temp_id = pending.temp_id().clone();

    // Visible before the remote call has even started.
    let state = ctrl.get_state(&room).unwrap();
    let shown: Vec<(&str, MessageStatus)> = state
        .messages
        .iter()
        .map(|m| (m.text.as_str(), m.status))
        .collect();
    assert_eq!(
        shown,
        vec![
            ("A", MessageStatus::Sent),
            ("B", MessageStatus::Sent),
            ("C", MessageStatus::Sending),
        ]
    );
    assert_eq!(state.messages[2].id, temp_id);

    let real_id = pending.wait().await.unwrap();
    assert!(!real_id.is_temporary());

    let state = wait_state(&ctrl, &room, |s| s.messages.iter().any(|m| m.id == real_id)).await;
    assert_eq!(state.messages.len(), 3);
    assert_eq!(state.optimistic_count(), 0);
    let c = &state.messages[2];
    assert_eq!(c.id, real_id);
    assert_eq!(c.text, "C");
    assert_eq!(c.created_at, Timestamp::from_millis(300));
    assert_eq!(c.status, MessageStatus::Sent);
}

#[tokio::test]
async fn watchers_see_the_local_echo_immediately() {
    let room = RoomId::new("r");
    let (ctrl, _events) = make_controller(InMemoryGateway::new(), empty_cache());
    open_live(&ctrl, &room).await;
    let rx = ctrl.watch(&room).unwrap();

    let sent = ctrl.send_optimistic(&room, Draft::text("hello")).unwrap();

    let seen = rx.borrow().messages.last().cloned();
    assert_eq!(seen, Some(sent));
}

#[tokio::test]
async fn failed_send_rolls_back_and_reports() {
    let room = RoomId::new("r");
    let gateway = InMemoryGateway::new();
    gateway.seed(&room, vec![msg("a", "peer", "A", 100)]);
    gateway.fail_next_send(GatewayError::Rejected("blocked".into()));
    let (ctrl, mut events) = make_controller(gateway, empty_cache());
    open_live(&ctrl, &room).await;

    let pending = ctrl.send(&room, Draft::text("nope")).unwrap();
    let temp_id = pending.temp_id().clone();
    assert_eq!(ctrl.get_state(&room).unwrap().messages.len(), 2);

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Send {
            source: GatewayError::Rejected(_),
            ..
        }
    ));

    let state = ctrl.get_state(&room).unwrap();
    assert_eq!(state.messages.len(), 1);
    assert!(state.messages.iter().all(|m| m.id != temp_id));
    assert!(ctrl.gateway().messages(&room).len() == 1);

    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SendFailed { temp_id, error, .. } = event {
            failures.push((temp_id, error));
        }
    }
    assert_eq!(
        failures,
        vec![(temp_id, "request rejected: blocked".to_string())]
    );
}

#[tokio::test]
async fn sequential_sends_leave_no_orphans() {
    let room = RoomId::new("r");
    let (ctrl, _events) = make_controller(InMemoryGateway::new(), empty_cache());
    open_live(&ctrl, &room).await;

    let first = ctrl.send(&room, Draft::text("one")).unwrap();
    let second = ctrl.send(&room, Draft::text("two")).unwrap();
    assert_eq!(ctrl.get_state(&room).unwrap().optimistic_count(), 2);

    let id_one = first.wait().await.unwrap();
    let id_two = second.wait().await.unwrap();

    let state = wait_state(&ctrl, &room, |s| {
        s.messages.iter().any(|m| m.id == id_one) && s.messages.iter().any(|m| m.id == id_two)
    })
    .await;
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.optimistic_count(), 0);
}

#[tokio::test]
async fn pending_echo_survives_unrelated_snapshot() {
    let room = RoomId::new("r");
    let (ctrl, _events) = make_controller(InMemoryGateway::new(), empty_cache());
    open_live(&ctrl, &room).await;

    let echo = ctrl.send_optimistic(&room, Draft::text("draft")).unwrap();
    ctrl.gateway()
        .push_remote(&room, msg("x", "peer", "meanwhile", 250))
        .await;

    let state = wait_state(&ctrl, &room, |s| {
        s.messages.iter().any(|m| m.id.as_str() == "x")
    })
    .await;
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[1].id, echo.id);
}

#[tokio::test]
async fn cache_never_holds_optimistic_entries() {
    let room = RoomId::new("r");
    let (ctrl, _events) = make_controller(InMemoryGateway::new(), empty_cache());
    open_live(&ctrl, &room).await;

    ctrl.send_optimistic(&room, Draft::text("local only"))
        .unwrap();
    ctrl.gateway()
        .push_remote(&room, msg("x", "peer", "remote", 250))
        .await;
    wait_state(&ctrl, &room, |s| s.messages.len() == 2).await;

    let mut cached = Vec::new();
    for _ in 0..200 {
        if let Some(entry) = ctrl.cache().load(&room).await
            && !entry.messages.is_empty()
        {
            cached = entry.messages;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, MessageId::new("x"));
    assert!(cached.iter().all(|m| !m.is_optimistic()));
}

#[tokio::test]
async fn near_duplicates_are_shown_but_cached_once() {
    let room = RoomId::new("r");
    let gateway = InMemoryGateway::new();
    gateway.seed(
        &room,
        vec![
            msg("x1", "peer", "double tap", 1_000),
            msg("x2", "peer", "double tap", 1_800),
            msg("y", "peer", "later", 9_000),
        ],
    );
    let (ctrl, _events) = make_controller(gateway, empty_cache());
    let state = open_live(&ctrl, &room).await;
    assert_eq!(state.messages.len(), 3);

    let mut cached = Vec::new();
    for _ in 0..200 {
        if let Some(entry) = ctrl.cache().load(&room).await {
            cached = entry.messages;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let cached_ids: Vec<&str> = cached.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(cached_ids, vec!["x1", "y"]);
}
