//! Optimistic send pipeline and read receipts for [`SyncController`].
//!
//! A send is split in two so that the local echo is visible before anything
//! is awaited: [`SyncController::send`] validates the draft and inserts a
//! `temp-` message synchronously, then hands back a [`PendingSend`] whose
//! [`wait`](PendingSend::wait) performs the remote call. Either way the temp
//! entry is removed once the call resolves; the confirmed copy arrives with
//! a later snapshot.

use chatsync_proto::message::{
    Draft, Message, MessageId, MessageStatus, OutgoingMessage, ParticipantId, RoomId,
};

use crate::cache::store::KeyValueStore;
use crate::gateway::{GatewayError, RemoteGateway};

use super::{SyncController, SyncError, SyncEvent};

/// A send whose local echo is on screen and whose remote call has not run.
///
/// Dropping it without calling [`wait`](Self::wait) leaves the echo in
/// place until the room is torn down; callers are expected to drive it.
#[must_use = "the message is only sent when `wait` is awaited"]
pub struct PendingSend<'a, G: RemoteGateway, K: KeyValueStore> {
    controller: &'a SyncController<G, K>,
    room: RoomId,
    outgoing: OutgoingMessage,
    message: Message,
}

impl<G, K> PendingSend<'_, G, K>
where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    /// The optimistic message as it is displayed.
    pub const fn message(&self) -> &Message {
        &self.message
    }

    pub const fn temp_id(&self) -> &MessageId {
        &self.message.id
    }

    /// Send to the remote store and settle the optimistic entry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Send`] if the remote store rejected the message.
    pub async fn wait(self) -> Result<MessageId, SyncError> {
        let gateway = &self.controller.gateway;
        let outcome = gateway.send(&self.room, &self.outgoing).await;
        self.controller
            .confirm_or_rollback(&self.room, &self.message.id, outcome)
    }
}

impl<G, K> SyncController<G, K>
where
    G: RemoteGateway + 'static,
    K: KeyValueStore + 'static,
{
    /// Show a draft immediately as a `sending` message with a temp id.
    ///
    /// Nothing is awaited: the message is part of the room state when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty or oversized draft and
    /// [`SyncError::UnknownRoom`] if the room was never opened.
    pub fn send_optimistic(&self, room: &RoomId, draft: Draft) -> Result<Message, SyncError> {
        self.insert_optimistic(room, draft)
            .map(|(message, _)| message)
    }

    /// Start a send: insert the local echo now, return the remote half.
    ///
    /// # Errors
    ///
    /// Same as [`send_optimistic`](Self::send_optimistic); nothing is shown
    /// when an error is returned.
    pub fn send(&self, room: &RoomId, draft: Draft) -> Result<PendingSend<'_, G, K>, SyncError> {
        let (message, outgoing) = self.insert_optimistic(room, draft)?;
        Ok(PendingSend {
            controller: self,
            room: room.clone(),
            outgoing,
            message,
        })
    }

    fn insert_optimistic(
        &self,
        room: &RoomId,
        draft: Draft,
    ) -> Result<(Message, OutgoingMessage), SyncError> {
        draft.validate()?;
        let outgoing = OutgoingMessage::from_draft(
            draft,
            self.config.participant.clone(),
            (self.config.clock)(),
        );
        let message = outgoing
            .clone()
            .into_message(MessageId::temporary(), MessageStatus::Sending);

        let mut rooms = self.rooms.lock();
        let entry = rooms
            .get_mut(room)
            .ok_or_else(|| SyncError::UnknownRoom(room.clone()))?;
        entry.tracking.pending.insert(message.id.clone());
        entry
            .state
            .send_modify(|state| state.append_optimistic(message.clone()));
        drop(rooms);

        tracing::debug!(room_id = %room, temp_id = %message.id, "optimistic message inserted");
        Ok((message, outgoing))
    }

    /// Settle an optimistic entry after its remote send resolved.
    ///
    /// The temp entry is removed in both cases; it is never renamed to the
    /// confirmed id. On failure a [`SyncEvent::SendFailed`] is emitted. There
    /// is no retry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Send`] carrying the gateway error on failure.
    pub fn confirm_or_rollback(
        &self,
        room: &RoomId,
        temp_id: &MessageId,
        outcome: Result<MessageId, GatewayError>,
    ) -> Result<MessageId, SyncError> {
        {
            let mut rooms = self.rooms.lock();
            if let Some(entry) = rooms.get_mut(room) {
                entry.tracking.pending.remove(temp_id);
                entry
                    .state
                    .send_if_modified(|state| state.remove_message(temp_id));
            }
        }

        match outcome {
            Ok(id) => {
                tracing::debug!(room_id = %room, %temp_id, message_id = %id, "send confirmed");
                Ok(id)
            }
            Err(err) => {
                tracing::warn!(room_id = %room, %temp_id, error = %err, "send failed, rolled back");
                self.emit(SyncEvent::SendFailed {
                    room: room.clone(),
                    temp_id: temp_id.clone(),
                    error: err.to_string(),
                });
                Err(SyncError::Send {
                    room: room.clone(),
                    source: err,
                })
            }
        }
    }

    /// Mark the room's messages from other senders as read by `participant`.
    ///
    /// The receipt is echoed locally first, then recorded remotely.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownRoom`] if the room was never opened, or
    /// [`SyncError::MarkSeen`] if the remote call failed. The local echo is
    /// kept in that case; the next snapshot settles it.
    pub async fn mark_seen(
        &self,
        room: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(), SyncError> {
        let changed = {
            let rooms = self.rooms.lock();
            let entry = rooms
                .get(room)
                .ok_or_else(|| SyncError::UnknownRoom(room.clone()))?;
            let mut changed = 0;
            entry.state.send_if_modified(|state| {
                changed = state.mark_seen_by(participant);
                changed > 0
            });
            changed
        };
        tracing::trace!(room_id = %room, %participant, changed, "marked seen locally");

        self.gateway
            .mark_seen(room, participant)
            .await
            .map_err(|source| {
                tracing::warn!(room_id = %room, error = %source, "mark seen failed");
                SyncError::MarkSeen {
                    room: room.clone(),
                    source,
                }
            })
    }
}
