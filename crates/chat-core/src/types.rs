use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Upper bound on message text length, counted in Unicode scalar values.
pub const MAX_MESSAGE_CHARS: usize = 4_096;

/// Transport lifecycle state reported to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket; the channel is ready for another `Open`.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Socket is open and frames can be sent.
    Connected,
}

/// Identity of a message author, supplied by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    /// Stable user identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional avatar reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Sender {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
        }
    }
}

/// One chat message as stored locally and exchanged on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Opaque identifier, unique within its room.
    pub id: String,
    /// Owning room. Optional on the wire because frames and sync batches
    /// carry the room next to the message; the store always fills it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Author.
    pub sender: Sender,
    /// Message body.
    pub text: String,
    /// Opaque attachment references.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Creation time (RFC 3339 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Set once the body has been edited.
    #[serde(default)]
    pub edited: bool,
    /// Time of the latest edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Compose a fresh, unedited message.
    pub fn new(
        id: impl Into<String>,
        sender: Sender,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            room_id: None,
            sender,
            text: text.into(),
            attachments: Vec::new(),
            timestamp,
            edited: false,
            edit_timestamp: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Whether the body fits within [`MAX_MESSAGE_CHARS`].
    pub fn text_within_bounds(text: &str) -> bool {
        text.chars().count() <= MAX_MESSAGE_CHARS
    }
}

/// Boundary between synchronized and not-yet-synchronized server messages,
/// in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct SyncCursor(i64);

impl SyncCursor {
    pub const ZERO: Self = Self(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.max(0))
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self::from_millis(at.timestamp_millis())
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

/// Frames written to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    /// A chat message for a room.
    ChatMessage { room_id: String, message: Message },
    /// Typing indicator.
    Typing { room_id: String, is_typing: bool },
    /// Read acknowledgement for one message.
    ReadReceipt { room_id: String, message_id: String },
    /// Subscribe to a room.
    JoinRoom { room_id: String },
    /// Unsubscribe from a room.
    LeaveRoom { room_id: String },
}

impl OutboundFrame {
    pub fn room_id(&self) -> &str {
        match self {
            Self::ChatMessage { room_id, .. }
            | Self::Typing { room_id, .. }
            | Self::ReadReceipt { room_id, .. }
            | Self::JoinRoom { room_id }
            | Self::LeaveRoom { room_id } => room_id,
        }
    }
}

/// Frames read from the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    /// A chat message pushed by the server.
    ChatMessage { room_id: String, message: Message },
    /// A member joined a room.
    UserJoined { room_id: String, user: Sender },
    /// A member left a room.
    UserLeft { room_id: String, user: Sender },
    /// A member started or stopped typing.
    Typing {
        room_id: String,
        user: Sender,
        is_typing: bool,
    },
    /// A member read a message.
    ReadReceipt {
        room_id: String,
        message_id: String,
        user: Sender,
    },
}

/// Body of a sync endpoint request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Cursor of the last applied batch.
    pub last_sync: SyncCursor,
    /// Rooms to synchronize.
    pub rooms: Vec<String>,
}

/// Messages for one room inside a sync response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRoomBatch {
    pub room_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Body of a sync endpoint response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub messages: Vec<SyncRoomBatch>,
    /// Server clock at the time the batch was cut, in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
}

/// Room directory entry served by the rooms endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server fields without a typed counterpart, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of a room creation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewRoom {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NewRoom {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Command channel input accepted by the channel runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatCommand {
    /// Open the transport. Also the manual recovery after `ReconnectExhausted`.
    Open,
    /// Close the transport and cancel any pending reconnect.
    Close,
    /// Compose and send (or queue) a chat message.
    SendMessage {
        /// Target room.
        room_id: String,
        /// Caller-chosen message id, echoed in events.
        message_id: String,
        /// Message body.
        text: String,
        /// Attachment references.
        attachments: Vec<String>,
    },
    /// Typing indicator; dropped while disconnected.
    SendTyping { room_id: String, is_typing: bool },
    /// Read receipt; dropped while disconnected.
    SendReadReceipt { room_id: String, message_id: String },
    /// Join a room and announce it on every reconnect.
    JoinRoom { room_id: String },
    /// Leave a room.
    LeaveRoom { room_id: String },
    /// Edit a message authored by the current user.
    EditMessage {
        room_id: String,
        message_id: String,
        new_text: String,
    },
    /// Delete a message from the local log.
    DeleteMessage { room_id: String, message_id: String },
    /// Search a room's log; results arrive as `SearchResults`.
    SearchMessages {
        room_id: String,
        query: String,
        /// Optional cap on returned matches.
        limit: Option<usize>,
    },
    /// Load a room's whole log; answered by `RoomHistory`.
    LoadMessages { room_id: String },
    /// Load the newest messages of a room; answered by `RoomHistory`.
    LoadRecentMessages {
        room_id: String,
        /// Defaults to `DEFAULT_RECENT_LIMIT`.
        limit: Option<usize>,
    },
    /// Fetch the server room directory; answered by `RoomsListed`.
    ListRooms,
    /// Create a room on the server; answered by `RoomCreated`.
    CreateRoom { room: NewRoom },
    /// Fetch one room's details; answered by `RoomInfoLoaded`.
    FetchRoomInfo { room_id: String },
    /// Run one sync immediately.
    SyncNow,
    /// Enable or pause the periodic sync.
    SetForeground { foreground: bool },
    /// Drop all local messages, queued frames and the sync cursor.
    ClearSession,
}

/// Event channel output emitted by the channel runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatEvent {
    /// `disconnected -> connecting`.
    Connecting {
        /// Reconnect attempt number, `0` for a manual open.
        attempt: u32,
    },
    /// `connecting -> connected`.
    Connected,
    /// `connected -> disconnected`.
    Disconnected {
        /// Close reason when the peer or the client supplied one.
        reason: Option<String>,
    },
    /// `connecting -> disconnected`.
    ConnectionFailed { error: ChatError },
    /// A reconnect timer was armed.
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Retries are used up; only a manual `Open` reconnects.
    ReconnectExhausted { attempts: u32, error: ChatError },
    /// A chat message is waiting for the transport, either composed offline
    /// or returned after its write went unconfirmed.
    MessageQueued {
        room_id: String,
        message_id: String,
        queue_len: usize,
    },
    /// A drain pass finished: `sent` entries were confirmed written and
    /// `remaining` still wait for the next connection.
    QueueDrained { sent: usize, remaining: usize },
    /// A message was added to a room's log.
    NewMessage { room_id: String, message: Message },
    /// A member joined.
    UserJoined { room_id: String, user: Sender },
    /// A member left.
    UserLeft { room_id: String, user: Sender },
    /// Typing indicator from another member.
    Typing {
        room_id: String,
        user: Sender,
        is_typing: bool,
    },
    /// Read receipt from another member.
    ReadReceipt {
        room_id: String,
        message_id: String,
        user: Sender,
    },
    /// A message body was edited.
    MessageEdited { room_id: String, message: Message },
    /// A message was removed from the log.
    MessageDeleted { room_id: String, message_id: String },
    /// An edit or delete was refused by the store.
    MutationRejected {
        room_id: String,
        message_id: String,
        error: ChatError,
    },
    /// Answer to `SearchMessages`.
    SearchResults {
        room_id: String,
        query: String,
        messages: Vec<Message>,
    },
    /// Answer to `LoadMessages` and `LoadRecentMessages`, oldest first.
    RoomHistory {
        room_id: String,
        messages: Vec<Message>,
    },
    /// Answer to `ListRooms`.
    RoomsListed { rooms: Vec<RoomInfo> },
    /// Answer to `CreateRoom`.
    RoomCreated { room: RoomInfo },
    /// Answer to `FetchRoomInfo`.
    RoomInfoLoaded { room: RoomInfo },
    /// A sync batch was merged.
    SyncCompleted {
        /// Messages that were new to the store.
        merged: usize,
        /// Cursor after the merge.
        cursor: SyncCursor,
    },
    /// A sync attempt failed; the next tick retries.
    SyncFailed { error: ChatError },
    /// Local session state was wiped.
    SessionCleared,
    /// Writing the session to durable storage failed; memory is still
    /// current and the next write retries with the full log.
    PersistenceFailed { error: ChatError },
    /// A command could not be carried out.
    CommandFailed { error: ChatError },
}
