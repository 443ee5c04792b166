use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for user-facing handling and recovery behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Transport-level failure; triggers the reconnect flow.
    Connection,
    /// A frame was sent while the transport was not connected.
    NotConnected,
    /// An awaited operation exceeded its deadline.
    Timeout,
    /// Reconnect attempts are used up.
    ReconnectExhausted,
    /// A store mutation referenced a message that does not exist.
    NotFound,
    /// A store mutation was attempted by someone other than the author.
    Permission,
    /// Input failed validation (for example over-long text).
    Validation,
    /// Rate-limited by the server.
    RateLimited,
    /// Authentication/authorization failure reported by the server.
    Auth,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Invalid configuration or request shape.
    Config,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while channel is {current:?}"),
        )
    }

    /// Terminal error reported once the reconnect budget is spent.
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::new(
            ChatErrorCategory::ReconnectExhausted,
            "reconnect_exhausted",
            format!("gave up reconnecting after {attempts} attempts"),
        )
    }

    /// Failures that the reconnect and sync loops recover from on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Connection
                | ChatErrorCategory::NotConnected
                | ChatErrorCategory::Timeout
                | ChatErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Auth,
        408 => ChatErrorCategory::Timeout,
        429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Connection,
        _ => ChatErrorCategory::Internal,
    }
}
