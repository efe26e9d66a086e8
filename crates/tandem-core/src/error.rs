//! Error types for the Tandem rendezvous protocol

use std::time::Duration;

use thiserror::Error;

/// Longest close reason that fits in a WebSocket close frame
/// (125 byte control payload minus the 2 byte status code).
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// Errors raised while handling a matchmaking or signaling connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("room full: {0}")]
    RoomFull(String),

    #[error("matchmaking queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("relay timed out after {0:?}")]
    RelayTimeout(Duration),

    #[error("peer disconnected")]
    Disconnected,

    #[error("send failed: {0}")]
    Send(String),

    #[error("server shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignalError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether this error ends only one forwarding attempt rather than the connection
    pub fn is_local_to_relay(&self) -> bool {
        matches!(self, SignalError::RelayTimeout(_) | SignalError::Send(_))
    }

    /// Close reason suitable for a WebSocket close frame
    pub fn close_reason(&self) -> String {
        truncate_reason(&self.to_string())
    }
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        SignalError::Protocol(format!("invalid JSON: {}", e))
    }
}

/// WebSocket close status codes used by the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseStatus {
    Normal = 1000,
    GoingAway = 1001,
    Protocol = 1002,
    PolicyViolation = 1008,
    InternalError = 1011,
    TryAgainLater = 1013,
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<&SignalError> for CloseStatus {
    fn from(e: &SignalError) -> Self {
        match e {
            SignalError::Handshake(_) => CloseStatus::Protocol,
            SignalError::Protocol(_) => CloseStatus::Protocol,
            SignalError::RoomFull(_) => CloseStatus::PolicyViolation,
            SignalError::QueueFull { .. } => CloseStatus::TryAgainLater,
            SignalError::Shutdown => CloseStatus::GoingAway,
            SignalError::RelayTimeout(_) => CloseStatus::InternalError,
            SignalError::Disconnected => CloseStatus::InternalError,
            SignalError::Send(_) => CloseStatus::InternalError,
            SignalError::Internal(_) => CloseStatus::InternalError,
        }
    }
}

/// Trim a close reason to the frame limit without splitting a character
pub fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
