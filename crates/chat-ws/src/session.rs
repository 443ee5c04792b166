use std::sync::Arc;

use chat_core::{
    ChatError, ChatErrorCategory, LAST_SYNC_KEY, MESSAGES_KEY, Message, MessageStore, MessageStoreError, SessionSnapshot,
    SyncCursor, SyncMergeError, SyncOutcome, SyncReconciler, SyncRequest, SyncResponse,
    SyncTicket,
};
use chat_platform::{KeyValueStore, ScopedKeyValueStore, StorageError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Message log and sync cursor, written through to durable storage after
/// every successful mutation.
///
/// Storage failures never fail the mutation; they are logged, kept for
/// [`Session::take_persistence_error`], and the next write retries with the
/// full snapshot.
pub struct Session {
    storage: ScopedKeyValueStore<Arc<dyn KeyValueStore>>,
    store: MessageStore,
    sync: SyncReconciler,
    persistence_error: Option<ChatError>,
}

impl Session {
    /// Restore from storage. Missing or unreadable values start empty.
    pub fn load(storage: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        let storage = ScopedKeyValueStore::new(storage, namespace);

        let rooms = read_key(&storage, MESSAGES_KEY)
            .and_then(|raw| match SessionSnapshot::decode(Some(&raw), None) {
                Ok(snapshot) => Some(snapshot.rooms),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable message log");
                    None
                }
            })
            .unwrap_or_default();
        let cursor = read_key(&storage, LAST_SYNC_KEY)
            .and_then(|raw| match SessionSnapshot::decode(None, Some(&raw)) {
                Ok(snapshot) => Some(snapshot.last_sync),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable sync cursor");
                    None
                }
            })
            .unwrap_or(SyncCursor::ZERO);

        let store = MessageStore::from_snapshot(rooms);
        info!(
            namespace = storage.namespace(),
            rooms = store.known_rooms().len(),
            messages = store.message_count(),
            last_sync = cursor.as_millis(),
            "restored chat session"
        );

        Self {
            storage,
            store,
            sync: SyncReconciler::new(cursor),
            persistence_error: None,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn cursor(&self) -> SyncCursor {
        self.sync.cursor()
    }

    /// Append unless the id is already present in the room.
    pub fn append(&mut self, room_id: &str, message: Message) -> bool {
        let added = self.store.append(room_id, message);
        if added {
            self.persist_messages();
        }
        added
    }

    pub fn edit(
        &mut self,
        room_id: &str,
        message_id: &str,
        new_text: &str,
        editor: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Message, MessageStoreError> {
        let edited = self
            .store
            .edit(room_id, message_id, new_text, editor, edited_at)?
            .clone();
        self.persist_messages();
        Ok(edited)
    }

    pub fn delete(&mut self, room_id: &str, message_id: &str) -> bool {
        let removed = self.store.delete(room_id, message_id);
        if removed {
            self.persist_messages();
        }
        removed
    }

    /// Membership lives in memory only.
    pub fn set_joined(&mut self, room_id: &str, joined: bool) {
        self.store.set_joined(room_id, joined);
    }

    pub fn begin_sync(&self) -> (SyncTicket, SyncRequest) {
        self.sync.begin(&self.store)
    }

    pub fn apply_sync(
        &mut self,
        ticket: SyncTicket,
        response: &SyncResponse,
    ) -> Result<SyncOutcome, SyncMergeError> {
        let outcome = self.sync.apply(ticket, response, &mut self.store)?;
        if let SyncOutcome::Applied { merged, cursor } = &outcome {
            debug!(
                merged = merged.len(),
                cursor = cursor.as_millis(),
                "applied sync batch"
            );
            if !merged.is_empty() {
                self.persist_messages();
            }
            self.persist_cursor();
        }
        Ok(outcome)
    }

    /// Forget every message and the cursor, in memory and on disk.
    pub fn clear(&mut self) {
        self.store.clear();
        self.sync.reset();
        for key in [MESSAGES_KEY, LAST_SYNC_KEY] {
            if let Err(err) = self.storage.remove(key) {
                warn!(key, error = %err, "failed removing persisted session value");
                self.record_failure(storage_error("storage_remove_failed", key, &err));
            }
        }
    }

    /// Latest storage failure since the previous call, if any.
    pub fn take_persistence_error(&mut self) -> Option<ChatError> {
        self.persistence_error.take()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            rooms: self.store.snapshot(),
            last_sync: self.sync.cursor(),
        }
    }

    fn persist_messages(&mut self) {
        match self.snapshot().encode_rooms() {
            Ok(raw) => self.write_key(MESSAGES_KEY, &raw),
            Err(err) => {
                warn!(error = %err, "failed encoding message log");
                self.record_failure(ChatError::new(
                    ChatErrorCategory::Serialization,
                    "snapshot_encode_failed",
                    err.to_string(),
                ));
            }
        }
    }

    fn persist_cursor(&mut self) {
        match self.snapshot().encode_last_sync() {
            Ok(raw) => self.write_key(LAST_SYNC_KEY, &raw),
            Err(err) => {
                warn!(error = %err, "failed encoding sync cursor");
                self.record_failure(ChatError::new(
                    ChatErrorCategory::Serialization,
                    "snapshot_encode_failed",
                    err.to_string(),
                ));
            }
        }
    }

    fn write_key(&mut self, key: &str, raw: &str) {
        if let Err(err) = self.storage.set(key, raw) {
            warn!(key, error = %err, "failed persisting chat session");
            self.record_failure(storage_error("storage_write_failed", key, &err));
        }
    }

    fn record_failure(&mut self, error: ChatError) {
        self.persistence_error = Some(error);
    }
}

fn storage_error(code: &str, key: &str, err: &StorageError) -> ChatError {
    ChatError::new(
        ChatErrorCategory::Storage,
        code,
        format!("session key '{key}': {err}"),
    )
}

fn read_key(storage: &ScopedKeyValueStore<Arc<dyn KeyValueStore>>, key: &str) -> Option<String> {
    match storage.get_optional(key) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "failed reading persisted session value");
            None
        }
    }
}
