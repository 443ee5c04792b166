use thiserror::Error;

use crate::{
    error::{ChatError, ChatErrorCategory},
    store::MessageStore,
    types::{Message, SyncCursor, SyncRequest, SyncResponse},
};

/// Reasons a sync batch is rejected as a whole.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncMergeError {
    #[error("sync batch for room '{room_id}' contains a message without an id")]
    MissingId { room_id: String },
    #[error("message '{message_id}' in sync batch for room '{room_id}' is tagged with room '{tagged}'")]
    RoomMismatch {
        room_id: String,
        message_id: String,
        tagged: String,
    },
    #[error("message '{message_id}' in sync batch for room '{room_id}' exceeds the text limit")]
    TextTooLong { room_id: String, message_id: String },
}

impl From<&SyncMergeError> for ChatError {
    fn from(err: &SyncMergeError) -> Self {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "sync_batch_rejected",
            err.to_string(),
        )
    }
}

/// Handle for one in-flight sync, issued by [`SyncReconciler::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTicket {
    issued_at: SyncCursor,
    epoch: u64,
}

impl SyncTicket {
    /// Cursor that was current when the request was built.
    pub fn issued_at(&self) -> SyncCursor {
        self.issued_at
    }
}

/// Result of applying a sync response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The batch was merged.
    Applied {
        /// Messages that were new to the store, in batch order.
        merged: Vec<Message>,
        /// Cursor after the merge.
        cursor: SyncCursor,
    },
    /// A newer sync (or a session reset) moved the cursor first; the batch was
    /// dropped and will be covered by the newer cursor.
    Stale,
}

/// Owns the sync cursor and merges server batches into a [`MessageStore`].
#[derive(Debug, Clone, Default)]
pub struct SyncReconciler {
    cursor: SyncCursor,
    epoch: u64,
}

impl SyncReconciler {
    pub fn new(cursor: SyncCursor) -> Self {
        Self { cursor, epoch: 0 }
    }

    pub fn cursor(&self) -> SyncCursor {
        self.cursor
    }

    /// Build a request for everything newer than the cursor in the store's
    /// known rooms.
    pub fn begin(&self, store: &MessageStore) -> (SyncTicket, SyncRequest) {
        let ticket = SyncTicket {
            issued_at: self.cursor,
            epoch: self.epoch,
        };
        let request = SyncRequest {
            last_sync: self.cursor,
            rooms: store.known_rooms(),
        };
        (ticket, request)
    }

    /// Merge a response, all-or-nothing.
    ///
    /// Every message is validated before anything touches the store, so a
    /// rejected batch leaves both the store and the cursor unchanged. The
    /// cursor only ever moves forward.
    pub fn apply(
        &mut self,
        ticket: SyncTicket,
        response: &SyncResponse,
        store: &mut MessageStore,
    ) -> Result<SyncOutcome, SyncMergeError> {
        if ticket.epoch != self.epoch || ticket.issued_at != self.cursor {
            return Ok(SyncOutcome::Stale);
        }

        validate_batch(response)?;

        let mut merged = Vec::new();
        for batch in &response.messages {
            for message in &batch.messages {
                if store.append(&batch.room_id, message.clone()) {
                    merged.push(message.clone().in_room(batch.room_id.clone()));
                }
            }
        }

        if let Some(reported) = reported_cursor(response) {
            self.cursor = self.cursor.max(reported);
        }

        Ok(SyncOutcome::Applied {
            merged,
            cursor: self.cursor,
        })
    }

    /// Forget the cursor and invalidate in-flight tickets.
    pub fn reset(&mut self) {
        self.cursor = SyncCursor::ZERO;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

fn validate_batch(response: &SyncResponse) -> Result<(), SyncMergeError> {
    for batch in &response.messages {
        for message in &batch.messages {
            if message.id.is_empty() {
                return Err(SyncMergeError::MissingId {
                    room_id: batch.room_id.clone(),
                });
            }
            if let Some(tagged) = &message.room_id
                && tagged != &batch.room_id
            {
                return Err(SyncMergeError::RoomMismatch {
                    room_id: batch.room_id.clone(),
                    message_id: message.id.clone(),
                    tagged: tagged.clone(),
                });
            }
            if !Message::text_within_bounds(&message.text) {
                return Err(SyncMergeError::TextTooLong {
                    room_id: batch.room_id.clone(),
                    message_id: message.id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Server clock when present, otherwise the newest message in the batch.
fn reported_cursor(response: &SyncResponse) -> Option<SyncCursor> {
    if let Some(server_time) = response.server_time {
        return Some(SyncCursor::from_millis(server_time));
    }
    response
        .messages
        .iter()
        .flat_map(|batch| batch.messages.iter())
        .map(|message| SyncCursor::from_datetime(message.timestamp))
        .max()
}
