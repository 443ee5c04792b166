use std::collections::BTreeMap;

use thiserror::Error;

use crate::types::{Message, SyncCursor};

/// Storage key holding the room → message list mapping.
pub const MESSAGES_KEY: &str = "chat_messages";
/// Storage key holding the last sync cursor.
pub const LAST_SYNC_KEY: &str = "chat_last_sync";

/// Persisted session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub rooms: BTreeMap<String, Vec<Message>>,
    pub last_sync: SyncCursor,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed encoding {key}: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed decoding {key}: {source}")]
    Decode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionSnapshot {
    pub fn encode_rooms(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(&self.rooms).map_err(|source| SnapshotError::Encode {
            key: MESSAGES_KEY,
            source,
        })
    }

    pub fn encode_last_sync(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(&self.last_sync).map_err(|source| SnapshotError::Encode {
            key: LAST_SYNC_KEY,
            source,
        })
    }

    /// Rebuild a snapshot from the raw stored values; absent keys mean empty.
    pub fn decode(rooms: Option<&str>, last_sync: Option<&str>) -> Result<Self, SnapshotError> {
        let rooms = match rooms {
            Some(raw) => serde_json::from_str(raw).map_err(|source| SnapshotError::Decode {
                key: MESSAGES_KEY,
                source,
            })?,
            None => BTreeMap::new(),
        };
        let last_sync = match last_sync {
            Some(raw) => serde_json::from_str(raw).map_err(|source| SnapshotError::Decode {
                key: LAST_SYNC_KEY,
                source,
            })?,
            None => SyncCursor::ZERO,
        };
        Ok(Self { rooms, last_sync })
    }
}
