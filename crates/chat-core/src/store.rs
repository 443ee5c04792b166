use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{MAX_MESSAGE_CHARS, Message},
};

/// Default window for [`MessageStore::recent_messages`].
pub const DEFAULT_RECENT_LIMIT: usize = 50;

/// Reasons a store mutation is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageStoreError {
    /// The room has no message with this id.
    #[error("message '{message_id}' was not found in room '{room_id}'")]
    NotFound { room_id: String, message_id: String },
    /// Only the author may edit a message.
    #[error("'{editor}' cannot edit message '{message_id}' sent by '{author}'")]
    Permission {
        message_id: String,
        editor: String,
        author: String,
    },
    /// The new body is longer than [`MAX_MESSAGE_CHARS`].
    #[error("message text has {len} characters, limit is {max}")]
    TextTooLong { len: usize, max: usize },
}

impl From<&MessageStoreError> for ChatError {
    fn from(err: &MessageStoreError) -> Self {
        let (category, code) = match err {
            MessageStoreError::NotFound { .. } => (ChatErrorCategory::NotFound, "message_not_found"),
            MessageStoreError::Permission { .. } => {
                (ChatErrorCategory::Permission, "permission_denied")
            }
            MessageStoreError::TextTooLong { .. } => {
                (ChatErrorCategory::Validation, "text_too_long")
            }
        };
        ChatError::new(category, code, err.to_string())
    }
}

/// One room's membership flag and ordered message log.
#[derive(Debug, Clone, Default)]
pub struct Room {
    room_id: String,
    joined: bool,
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl Room {
    fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_owned(),
            ..Self::default()
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn joined(&self) -> bool {
        self.joined
    }

    /// Messages in local append order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        if !self.contains(message_id) {
            return None;
        }
        self.messages.iter().position(|m| m.id == message_id)
    }
}

/// Session-scoped, per-room message log with id deduplication.
///
/// Created when a session starts (optionally from a persisted snapshot) and
/// cleared at logout. Persistence is driven by the owner after each mutation.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    rooms: BTreeMap<String, Room>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a room → messages mapping.
    ///
    /// Duplicate ids inside a room keep their first occurrence.
    pub fn from_snapshot(snapshot: BTreeMap<String, Vec<Message>>) -> Self {
        let mut store = Self::new();
        for (room_id, messages) in snapshot {
            store.room_entry(&room_id);
            for message in messages {
                store.append(&room_id, message);
            }
        }
        store
    }

    /// Room → messages mapping suitable for persistence.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Message>> {
        self.rooms
            .iter()
            .map(|(room_id, room)| (room_id.clone(), room.messages.clone()))
            .collect()
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    /// Messages of a room in store order, empty when the room is unknown.
    pub fn messages(&self, room_id: &str) -> &[Message] {
        self.rooms
            .get(room_id)
            .map(Room::messages)
            .unwrap_or_default()
    }

    /// The last `limit` messages of a room.
    pub fn recent_messages(&self, room_id: &str, limit: usize) -> &[Message] {
        let messages = self.messages(room_id);
        &messages[messages.len().saturating_sub(limit)..]
    }

    pub fn message(&self, room_id: &str, message_id: &str) -> Option<&Message> {
        let room = self.rooms.get(room_id)?;
        room.position(message_id).map(|idx| &room.messages[idx])
    }

    /// Insert at the end of the room's log unless the id is already present.
    pub fn append(&mut self, room_id: &str, mut message: Message) -> bool {
        let room = self.room_entry(room_id);
        if room.contains(&message.id) {
            return false;
        }
        message.room_id = Some(room_id.to_owned());
        room.ids.insert(message.id.clone());
        room.messages.push(message);
        true
    }

    /// Replace the body of a message authored by `editor`.
    pub fn edit(
        &mut self,
        room_id: &str,
        message_id: &str,
        new_text: &str,
        editor: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<&Message, MessageStoreError> {
        let not_found = || MessageStoreError::NotFound {
            room_id: room_id.to_owned(),
            message_id: message_id.to_owned(),
        };
        let room = self.rooms.get_mut(room_id).ok_or_else(not_found)?;
        let idx = room.position(message_id).ok_or_else(not_found)?;

        let message = &mut room.messages[idx];
        if message.sender.id != editor {
            return Err(MessageStoreError::Permission {
                message_id: message_id.to_owned(),
                editor: editor.to_owned(),
                author: message.sender.id.clone(),
            });
        }
        if !Message::text_within_bounds(new_text) {
            return Err(MessageStoreError::TextTooLong {
                len: new_text.chars().count(),
                max: MAX_MESSAGE_CHARS,
            });
        }

        message.text = new_text.to_owned();
        message.edited = true;
        message.edit_timestamp = Some(edited_at);
        Ok(message)
    }

    /// Remove a message. Returns whether anything was removed.
    pub fn delete(&mut self, room_id: &str, message_id: &str) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(idx) = room.position(message_id) else {
            return false;
        };
        room.messages.remove(idx);
        room.ids.remove(message_id);
        true
    }

    /// Case-insensitive substring search over message text, in store order.
    pub fn search(&self, room_id: &str, query: &str) -> MessageSearch<'_> {
        MessageSearch {
            messages: self.messages(room_id),
            needle: query.to_lowercase(),
            position: 0,
        }
    }

    /// Mark a room as joined or left, creating it when unknown.
    pub fn set_joined(&mut self, room_id: &str, joined: bool) {
        self.room_entry(room_id).joined = joined;
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms
            .values()
            .filter(|room| room.joined)
            .map(|room| room.room_id.clone())
            .collect()
    }

    /// Every room the store has seen, joined or holding messages.
    pub fn known_rooms(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub fn message_count(&self) -> usize {
        self.rooms.values().map(|room| room.messages.len()).sum()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }

    fn room_entry(&mut self, room_id: &str) -> &mut Room {
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id))
    }
}

/// Lazy iterator over search matches.
///
/// Cloning yields an independent cursor; [`MessageSearch::restart`] rewinds.
#[derive(Debug, Clone)]
pub struct MessageSearch<'a> {
    messages: &'a [Message],
    needle: String,
    position: usize,
}

impl MessageSearch<'_> {
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl<'a> Iterator for MessageSearch<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(message) = self.messages.get(self.position) {
            self.position += 1;
            if message.text.to_lowercase().contains(&self.needle) {
                return Some(message);
            }
        }
        None
    }
}
