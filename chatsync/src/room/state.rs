//! Per-room message state and its reducers.
//!
//! Every reducer is a plain method on [`RoomMessageState`] with no I/O, so the
//! controllers can apply them against the latest state under a short lock.
//! After any reducer `messages` is sorted non-decreasing by `created_at` and
//! holds no two entries with the same id.

use std::collections::{HashMap, HashSet};

use chatsync_proto::message::{Message, MessageId, MessageStatus, ParticipantId, Timestamp};

use crate::cache::CacheMetadata;

/// Where a room is in its open sequence.
///
/// `Idle -> CacheHit -> Syncing -> Live`, or `Idle -> CacheMiss -> Syncing -> Live`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    #[default]
    Idle,
    /// Cached content is on screen while the remote catches up.
    CacheHit,
    /// Nothing usable was cached.
    CacheMiss,
    /// Subscribed, waiting for the first snapshot.
    Syncing,
    /// At least one snapshot has been applied.
    Live,
}

/// The displayed state of one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomMessageState {
    /// Ascending by `created_at`, ids unique.
    pub messages: Vec<Message>,
    pub loading: bool,
    /// Last remote failure for this room, cleared by the next success.
    pub error: Option<String>,
    /// Whether older history may still exist upstream.
    pub has_more: bool,
    /// Pagination cursor: `created_at` of the oldest confirmed message.
    pub oldest_timestamp: Option<Timestamp>,
    pub phase: SyncPhase,
}

impl RoomMessageState {
    /// Show cached content while the remote paths run.
    pub fn restore_from_cache(&mut self, messages: Vec<Message>, metadata: &CacheMetadata) {
        self.messages = normalize(messages);
        self.oldest_timestamp = metadata
            .oldest_timestamp
            .or_else(|| self.oldest_confirmed());
        self.has_more = metadata.has_more;
        self.loading = true;
        self.error = None;
        self.phase = SyncPhase::CacheHit;
    }

    /// Nothing cached; wait for the remote with an empty list.
    pub fn start_cold(&mut self) {
        self.loading = true;
        self.error = None;
        self.phase = SyncPhase::CacheMiss;
    }

    /// The subscription has been registered.
    pub fn begin_sync(&mut self) {
        self.phase = SyncPhase::Syncing;
    }

    /// Replace confirmed content with a remote snapshot.
    ///
    /// Optimistic entries listed in `pending` survive unless the snapshot
    /// already carries their counterpart (a near-duplicate within
    /// `window_ms`). A message seen before keeps the later of its two
    /// statuses and any read receipts it already had.
    ///
    /// The pagination cursor moves to the new oldest confirmed message.
    /// `has_more` is kept only when the snapshot reaches at least as far back
    /// as the previous cursor; a shallower snapshot sets it back to `true`.
    pub fn replace_with_snapshot(
        &mut self,
        snapshot: Vec<Message>,
        pending: &HashSet<MessageId>,
        window_ms: u64,
    ) {
        let previous: HashMap<&MessageId, &Message> =
            self.messages.iter().map(|m| (&m.id, m)).collect();

        let mut merged: Vec<Message> = snapshot
            .into_iter()
            .map(|mut msg| {
                if let Some(old) = previous.get(&msg.id) {
                    msg.status = msg.status.advanced(old.status);
                    for (reader, seen) in &old.seen_by {
                        if *seen {
                            msg.seen_by.insert(reader.clone(), true);
                        }
                    }
                }
                msg
            })
            .collect();

        let retained: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.is_optimistic() && pending.contains(&m.id))
            .filter(|m| {
                !merged.iter().any(|s| s.is_near_duplicate_of(m, window_ms))
            })
            .cloned()
            .collect();
        merged.extend(retained);

        let previous_cursor = self.oldest_timestamp;
        self.messages = normalize(merged);
        self.oldest_timestamp = self.oldest_confirmed();
        self.has_more = match (self.oldest_timestamp, previous_cursor) {
            (None, _) => false,
            (Some(new), Some(old)) if new <= old => self.has_more,
            (Some(_), _) => true,
        };
        self.loading = false;
        self.error = None;
        self.phase = SyncPhase::Live;
    }

    /// Apply the first bounded history fetch of a room open.
    ///
    /// Ignored once the room is live; snapshots win from then on. Returns
    /// whether the page was applied.
    pub fn apply_initial_page(&mut self, page: Vec<Message>, page_size: usize) -> bool {
        if self.phase == SyncPhase::Live {
            return false;
        }
        self.has_more = page.len() >= page_size;
        let mut merged = page;
        merged.extend(self.messages.drain(..).filter(Message::is_optimistic));
        self.messages = normalize(merged);
        self.oldest_timestamp = self.oldest_confirmed();
        self.loading = false;
        self.error = None;
        true
    }

    /// Merge an older page in front of the current list.
    ///
    /// A page shorter than `requested` (including an empty one) means the
    /// start of history has been reached.
    pub fn prepend_page(&mut self, page: Vec<Message>, requested: usize) {
        let exhausted = page.len() < requested;
        let known: HashSet<&MessageId> = self.messages.iter().map(|m| &m.id).collect();
        let mut merged: Vec<Message> = page
            .into_iter()
            .filter(|m| !known.contains(&m.id))
            .collect();
        merged.append(&mut self.messages);
        self.messages = normalize(merged);
        self.oldest_timestamp = self.oldest_confirmed().or(self.oldest_timestamp);
        if exhausted {
            self.has_more = false;
        }
        self.loading = false;
        self.error = None;
    }

    /// Insert a local echo at the tail.
    pub fn append_optimistic(&mut self, message: Message) {
        self.messages.retain(|m| m.id != message.id);
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    /// Remove a message by id. Returns whether it was present.
    pub fn remove_message(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| &m.id != id);
        self.messages.len() != before
    }

    /// Record a remote failure. Content and cursor are left untouched.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.loading = false;
    }

    /// Mark every message from someone else as read by `participant`.
    /// Returns the number of messages that changed.
    pub fn mark_seen_by(&mut self, participant: &ParticipantId) -> usize {
        let mut changed = 0;
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| &m.sender_id != participant)
        {
            let newly_seen = msg.seen_by.insert(participant.clone(), true) != Some(true);
            let status = msg.status.advanced(MessageStatus::Read);
            if newly_seen || status != msg.status {
                changed += 1;
            }
            msg.status = status;
        }
        changed
    }

    /// Messages confirmed by the remote store, in display order.
    #[must_use]
    pub fn confirmed_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_optimistic())
            .cloned()
            .collect()
    }

    /// Number of unacknowledged local echoes currently shown.
    #[must_use]
    pub fn optimistic_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_optimistic()).count()
    }

    fn oldest_confirmed(&self) -> Option<Timestamp> {
        self.messages
            .iter()
            .find(|m| !m.is_optimistic())
            .map(|m| m.created_at)
    }
}

/// Stable-sort by `created_at` and keep the first occurrence of each id.
fn normalize(mut messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|m| seen.insert(m.id.clone()));
    messages.sort_by_key(|m| m.created_at);
    messages
}

/// Drop later copies of the same logical message: same sender and text,
/// created within `window_ms` of a message already kept.
///
/// Input must be sorted by `created_at`; output keeps that order.
#[must_use]
pub fn dedupe_near_duplicates(messages: Vec<Message>, window_ms: u64) -> Vec<Message> {
    let mut kept: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        let duplicate = kept
            .iter()
            .rev()
            .take_while(|k| k.created_at.abs_diff(msg.created_at) <= window_ms)
            .any(|k| k.is_near_duplicate_of(&msg, window_ms));
        if !duplicate {
            kept.push(msg);
        }
    }
    kept
}
