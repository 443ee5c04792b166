use crate::{
    error::ChatError,
    types::{ChatEvent, ConnectionState},
};

/// Transport lifecycle. Every accepted transition yields exactly one event.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn begin_connect(&mut self, attempt: u32) -> Result<ChatEvent, ChatError> {
        self.transition(
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            "connect",
        )?;
        Ok(ChatEvent::Connecting { attempt })
    }

    pub fn on_connected(&mut self) -> Result<ChatEvent, ChatError> {
        self.transition(
            ConnectionState::Connecting,
            ConnectionState::Connected,
            "on_connected",
        )?;
        Ok(ChatEvent::Connected)
    }

    pub fn on_connect_failed(&mut self, error: ChatError) -> Result<ChatEvent, ChatError> {
        self.transition(
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            "on_connect_failed",
        )?;
        Ok(ChatEvent::ConnectionFailed { error })
    }

    /// The peer or the network dropped an established connection.
    pub fn on_transport_closed(&mut self, reason: Option<String>) -> Result<ChatEvent, ChatError> {
        self.transition(
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            "on_transport_closed",
        )?;
        Ok(ChatEvent::Disconnected { reason })
    }

    /// Client-initiated close. Safe from any state; `None` when already
    /// disconnected.
    pub fn close(&mut self, reason: impl Into<String>) -> Option<ChatEvent> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        Some(ChatEvent::Disconnected {
            reason: Some(reason.into()),
        })
    }

    fn transition(
        &mut self,
        expected: ConnectionState,
        next: ConnectionState,
        action: &str,
    ) -> Result<(), ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(())
    }
}
