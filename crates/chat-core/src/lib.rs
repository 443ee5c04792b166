//! Core contract of the resilient chat channel.
//!
//! This crate defines the wire frames, command/event protocol, connection
//! lifecycle, reconnect policy, outbound queue, per-room message store and
//! sync reconciliation. It performs no I/O; the runtime crate drives it.

/// Async command/event channel primitives.
pub mod channel;
/// Stable error payloads and HTTP classification helpers.
pub mod error;
/// Inbound frame decoding and event mapping.
pub mod normalization;
/// FIFO buffer for messages not yet confirmed as written.
pub mod queue;
/// Reconnect backoff policy and attempt tracking.
pub mod retry;
/// Persisted session snapshot codec.
pub mod snapshot;
/// Transport lifecycle state machine.
pub mod state_machine;
/// Per-room message log.
pub mod store;
/// Server batch reconciliation and sync cursor.
pub mod sync;
/// Wire frames and command/event types.
pub mod types;

pub use channel::{ChannelError, ChatChannels, EventStream};
pub use error::{ChatError, ChatErrorCategory, classify_http_status};
pub use normalization::{InboundDecode, decode_inbound, encode_outbound, inbound_event};
pub use queue::{DrainReport, InFlight, OutboundQueue, QueuedMessage};
pub use retry::{ReconnectDecision, ReconnectPolicy, ReconnectTracker};
pub use snapshot::{LAST_SYNC_KEY, MESSAGES_KEY, SessionSnapshot, SnapshotError};
pub use state_machine::ConnectionStateMachine;
pub use store::{DEFAULT_RECENT_LIMIT, MessageSearch, MessageStore, MessageStoreError, Room};
pub use sync::{SyncMergeError, SyncOutcome, SyncReconciler, SyncTicket};
pub use types::{
    ChatCommand, ChatEvent, ConnectionState, InboundFrame, MAX_MESSAGE_CHARS, Message, NewRoom,
    OutboundFrame, RoomInfo, Sender, SyncCursor, SyncRequest, SyncResponse, SyncRoomBatch,
};
