//! Backward history loading for [`SyncController`].

use chatsync_proto::message::{RoomId, Timestamp};

use crate::cache::store::KeyValueStore;
use crate::gateway::RemoteGateway;

use super::{SyncController, SyncError, SyncEvent};

/// Why a [`load_older`](SyncController::load_older) call did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The room was never opened.
    UnknownRoom,
    /// The room is not open.
    Closed,
    /// Another load is in flight, or the room is still opening.
    Busy,
    /// Older history is known to be exhausted.
    Exhausted,
    /// Nothing has been loaded yet, so there is no cursor.
    NoCursor,
}

/// Result of [`SyncController::load_older`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlderOutcome {
    Skipped(SkipReason),
    /// A page was fetched and merged.
    Loaded { fetched: usize, has_more: bool },
    /// The room closed or reopened while the fetch was in flight; the page
    /// was dropped.
    Discarded,
}

impl<G, K> SyncController<G, K>
where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    /// Fetch the page of messages just older than the current cursor and
    /// merge it in front of the list.
    ///
    /// The room is marked loading before anything is awaited, so a second
    /// call while one is in flight returns `Skipped(Busy)`. The merge is
    /// applied to the room's latest state, not to the state at call time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Pagination`] if the fetch failed. `loading` is
    /// cleared, the error recorded, and `has_more` left as it was so the
    /// call can be retried.
    pub async fn load_older(&self, room: &RoomId) -> Result<LoadOlderOutcome, SyncError> {
        let (session, before) = match self.begin_page(room) {
            Ok(started) => started,
            Err(reason) => {
                tracing::trace!(room_id = %room, ?reason, "load older skipped");
                return Ok(LoadOlderOutcome::Skipped(reason));
            }
        };
        let page_size = self.config.page_size;
        tracing::debug!(room_id = %room, %before, page_size, "loading older messages");

        match self.gateway.fetch_page(room, page_size, Some(before)).await {
            Ok(page) => {
                let fetched = page.len();
                let applied = self.update_if_current(room, session, |state, tracking| {
                    tracking.paging = false;
                    state.prepend_page(page, page_size);
                    (state.has_more, state.confirmed_messages())
                });
                let Some((has_more, confirmed)) = applied else {
                    tracing::debug!(room_id = %room, fetched, "discarding late page");
                    return Ok(LoadOlderOutcome::Discarded);
                };
                self.persist(room, confirmed, has_more).await;
                Ok(LoadOlderOutcome::Loaded { fetched, has_more })
            }
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "load older failed");
                let applied = self.update_if_current(room, session, |state, tracking| {
                    tracking.paging = false;
                    state.fail(err.to_string());
                });
                if applied.is_some() {
                    self.emit(SyncEvent::PaginationFailed {
                        room: room.clone(),
                        error: err.to_string(),
                    });
                }
                Err(SyncError::Pagination {
                    room: room.clone(),
                    source: err,
                })
            }
        }
    }

    /// Check the guards and mark the room loading, all under one lock.
    fn begin_page(&self, room: &RoomId) -> Result<(u64, Timestamp), SkipReason> {
        let mut rooms = self.rooms.lock();
        let entry = rooms.get_mut(room).ok_or(SkipReason::UnknownRoom)?;
        if !entry.open {
            return Err(SkipReason::Closed);
        }
        if entry.tracking.paging {
            return Err(SkipReason::Busy);
        }
        let mut decision = Err(SkipReason::Busy);
        entry.state.send_if_modified(|state| {
            decision = if state.loading {
                Err(SkipReason::Busy)
            } else if !state.has_more {
                Err(SkipReason::Exhausted)
            } else {
                state.oldest_timestamp.ok_or(SkipReason::NoCursor)
            };
            if decision.is_ok() {
                state.loading = true;
            }
            decision.is_ok()
        });
        let before = decision?;
        entry.tracking.paging = true;
        Ok((entry.session, before))
    }
}
