use serde_json::Value;

use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{ChatEvent, InboundFrame, OutboundFrame},
};

const KNOWN_INBOUND_TYPES: &[&str] = &[
    "chat_message",
    "user_joined",
    "user_left",
    "typing",
    "read_receipt",
];

/// Outcome of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecode {
    /// A frame the channel understands.
    Frame(InboundFrame),
    /// Valid JSON with a `type` the channel does not handle.
    Unrecognized { kind: String },
    /// Not JSON, no `type`, or a known `type` with the wrong shape.
    Malformed { reason: String },
}

/// Decode a raw text frame without ever failing hard.
pub fn decode_inbound(raw: &str) -> InboundDecode {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(err) => {
            return InboundDecode::Malformed {
                reason: err.to_string(),
            };
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return InboundDecode::Malformed {
            reason: "frame has no string 'type' field".to_owned(),
        };
    };
    if !KNOWN_INBOUND_TYPES.contains(&kind) {
        return InboundDecode::Unrecognized {
            kind: kind.to_owned(),
        };
    }

    match serde_json::from_value::<InboundFrame>(value) {
        Ok(frame) => InboundDecode::Frame(frame),
        Err(err) => InboundDecode::Malformed {
            reason: err.to_string(),
        },
    }
}

/// Serialize an outbound frame to its JSON text form.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, ChatError> {
    serde_json::to_string(frame).map_err(|err| {
        ChatError::new(
            ChatErrorCategory::Serialization,
            "frame_encode_failed",
            err.to_string(),
        )
    })
}

/// Map an inbound frame to the event a renderer sees.
///
/// Chat messages become `NewMessage`; callers emit it only when the store
/// accepted the message, so duplicates never reach the renderer.
pub fn inbound_event(frame: InboundFrame) -> ChatEvent {
    match frame {
        InboundFrame::ChatMessage { room_id, message } => {
            ChatEvent::NewMessage { room_id, message }
        }
        InboundFrame::UserJoined { room_id, user } => ChatEvent::UserJoined { room_id, user },
        InboundFrame::UserLeft { room_id, user } => ChatEvent::UserLeft { room_id, user },
        InboundFrame::Typing {
            room_id,
            user,
            is_typing,
        } => ChatEvent::Typing {
            room_id,
            user,
            is_typing,
        },
        InboundFrame::ReadReceipt {
            room_id,
            message_id,
            user,
        } => ChatEvent::ReadReceipt {
            room_id,
            message_id,
            user,
        },
    }
}

/// Wrap an error into the generic command-failure event.
pub fn command_failed(error: ChatError) -> ChatEvent {
    ChatEvent::CommandFailed { error }
}
