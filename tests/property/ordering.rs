//! Property-based tests for the message model and cache record codec.
//!
//! Uses proptest to verify:
//! 1. Status merging never moves a message backwards.
//! 2. Near-duplicate detection is symmetric and respects the window.
//! 3. Arbitrary text never makes snapshot decoding panic.
//! 4. Damaged entries are counted individually, never failing the record.

use proptest::prelude::*;
use serde_json::json;

use chatsync_proto::codec::{self, CACHE_VERSION, EntryError, SnapshotRecord};
use chatsync_proto::message::*;

// --- Strategies ---

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Read),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        "[a-z0-9]{1,12}",
        "[a-c]{1,2}",
        "[ -~]{0,40}",
        0u64..10_000,
        arb_status(),
    )
        .prop_map(|(id, sender, text, created_at, status)| {
            OutgoingMessage::from_draft(
                Draft::text(text),
                ParticipantId::new(sender),
                Timestamp::from_millis(created_at),
            )
            .into_message(MessageId::new(id), status)
        })
}

// --- Status ---

proptest! {
    #[test]
    fn advanced_never_regresses(a in arb_status(), b in arb_status()) {
        let merged = a.advanced(b);
        prop_assert!(merged >= a);
        prop_assert!(merged >= b);
        prop_assert_eq!(merged, b.advanced(a));
        prop_assert_eq!(merged.advanced(a), merged);
    }

    #[test]
    fn advancing_through_a_sequence_is_order_independent(
        statuses in prop::collection::vec(arb_status(), 1..8)
    ) {
        let forward = statuses
            .iter()
            .copied()
            .fold(MessageStatus::Sending, MessageStatus::advanced);
        let backward = statuses
            .iter()
            .rev()
            .copied()
            .fold(MessageStatus::Sending, MessageStatus::advanced);
        prop_assert_eq!(forward, backward);
        prop_assert_eq!(Some(forward), statuses.iter().copied().max());
    }
}

// --- Near duplicates ---

proptest! {
    #[test]
    fn near_duplicate_is_symmetric(a in arb_message(), b in arb_message(), window in 0u64..5_000) {
        prop_assert_eq!(a.is_near_duplicate_of(&b, window), b.is_near_duplicate_of(&a, window));
    }

    #[test]
    fn near_duplicate_respects_window(
        base in arb_message(),
        offset in 0u64..10_000,
        window in 0u64..5_000,
    ) {
        let mut later = base.clone();
        later.id = MessageId::new(format!("{}-copy", base.id));
        later.created_at = Timestamp::from_millis(base.created_at.as_millis() + offset);
        prop_assert_eq!(base.is_near_duplicate_of(&later, window), offset <= window);
    }

    #[test]
    fn different_text_is_never_a_near_duplicate(
        base in arb_message(),
        suffix in "[a-z]{1,4}",
    ) {
        let mut edited = base.clone();
        edited.text.push_str(&suffix);
        prop_assert!(!base.is_near_duplicate_of(&edited, u64::MAX));
    }
}

// --- Codec ---

proptest! {
    #[test]
    fn decode_snapshot_never_panics(text in "\\PC{0,256}") {
        let _ = codec::decode_snapshot(&text);
    }

    #[test]
    fn decode_entry_never_panics_on_json(value in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = codec::decode_entry(json!({ "bytes": value }));
    }

    #[test]
    fn written_snapshot_decodes_fully(
        messages in prop::collection::vec(arb_message(), 0..30),
        timestamp in any::<u64>(),
    ) {
        let record = SnapshotRecord {
            messages: messages.clone(),
            timestamp: Timestamp::from_millis(timestamp),
            version: CACHE_VERSION.to_string(),
        };
        let encoded = codec::encode_snapshot(&record).unwrap();
        let decoded = codec::decode_snapshot(&encoded).unwrap();
        prop_assert_eq!(decoded.valid_count(), messages.len());
        prop_assert_eq!(decoded.version.as_str(), CACHE_VERSION);
        prop_assert_eq!(decoded.into_valid(), messages);
    }

    #[test]
    fn damaged_entries_are_counted_not_fatal(
        good in prop::collection::vec(arb_message(), 0..20),
        bad in 0usize..20,
    ) {
        let mut entries: Vec<serde_json::Value> =
            good.iter().map(|m| serde_json::to_value(m).unwrap()).collect();
        for i in 0..bad {
            if i % 2 == 0 {
                entries.push(json!({ "id": "", "text": "x", "senderId": "a", "createdAt": 1 }));
            } else {
                entries.push(json!({ "text": 42 }));
            }
        }
        let raw =
            json!({ "messages": entries, "timestamp": 7, "version": CACHE_VERSION }).to_string();

        let decoded = codec::decode_snapshot(&raw).unwrap();
        prop_assert_eq!(decoded.entries.len(), good.len() + bad);
        prop_assert_eq!(decoded.valid_count(), good.len());
    }
}

#[test]
fn empty_identifiers_are_rejected() {
    let no_id = json!({ "id": "", "text": "t", "senderId": "a", "createdAt": 1 });
    assert_eq!(
        codec::decode_entry(no_id),
        Err(EntryError::EmptyField("id"))
    );

    let no_sender = json!({ "id": "m", "text": "t", "senderId": "", "createdAt": 1 });
    assert_eq!(
        codec::decode_entry(no_sender),
        Err(EntryError::EmptyField("senderId"))
    );
}

#[test]
fn oversized_draft_fails_validation() {
    let draft = Draft::text("x".repeat(MAX_MESSAGE_SIZE + 1));
    assert!(matches!(
        draft.validate(),
        Err(ValidationError::TooLarge { .. })
    ));
    assert_eq!(Draft::text("").validate(), Err(ValidationError::Empty));
}
