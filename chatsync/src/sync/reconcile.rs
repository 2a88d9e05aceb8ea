//! Room-open orchestration: cache restore and the initial history fetch.

use chatsync_proto::message::RoomId;

use crate::cache::store::KeyValueStore;
use crate::gateway::RemoteGateway;
use crate::room::SyncPhase;

use super::{SyncController, SyncEvent};

impl<G, K> SyncController<G, K>
where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    /// Validate, repair and load the room's cache entry, and show it if it
    /// has content. Returns whether cached content was shown.
    ///
    /// `loading` stays set either way until a remote result arrives.
    pub(super) async fn restore_cached(&self, room: &RoomId, session: u64) -> bool {
        let usable = self.cache.validate_and_repair(room).await;
        let entry = if usable {
            self.cache.load(room).await
        } else {
            None
        };

        match entry.filter(|e| !e.messages.is_empty()) {
            Some(entry) => {
                let count = entry.messages.len();
                let applied = self.update_if_current(room, session, |state, _| {
                    state.restore_from_cache(entry.messages, &entry.metadata);
                });
                if applied.is_none() {
                    return false;
                }
                tracing::debug!(room_id = %room, count, "cache hit");
                self.emit(SyncEvent::CacheRestored {
                    room: room.clone(),
                    count,
                });
                true
            }
            None => {
                self.update_if_current(room, session, |state, _| state.start_cold());
                tracing::debug!(room_id = %room, "cache miss");
                false
            }
        }
    }

    /// Fetch the newest page and apply it unless a snapshot already made the
    /// room live. Clears `loading` on success and on error.
    pub(super) async fn fetch_initial_page(&self, room: &RoomId, session: u64) {
        let page_size = self.config.page_size;
        match self.gateway.fetch_page(room, page_size, None).await {
            Ok(page) => {
                let fetched = page.len();
                let applied = self.update_if_current(room, session, |state, tracking| {
                    let applied = state.apply_initial_page(page, page_size);
                    state.loading = tracking.paging;
                    applied.then(|| (state.confirmed_messages(), state.has_more))
                });
                match applied {
                    Some(Some((confirmed, has_more))) => {
                        tracing::debug!(room_id = %room, fetched, "initial page applied");
                        self.persist(room, confirmed, has_more).await;
                    }
                    Some(None) => {
                        tracing::trace!(room_id = %room, "initial page superseded by snapshot");
                    }
                    None => {
                        tracing::trace!(room_id = %room, session, "discarding late initial page");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(room_id = %room, error = %err, "initial page fetch failed");
                self.update_if_current(room, session, |state, tracking| {
                    if state.phase == SyncPhase::Live {
                        state.loading = tracking.paging;
                    } else {
                        state.fail(err.to_string());
                    }
                });
            }
        }
    }
}
