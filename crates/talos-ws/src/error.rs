//! Error types for the WebSocket client engine.
//!
//! This module defines the errors raised while driving the upgrade handshake,
//! decoding inbound frames and writing outbound frames, together with the
//! close codes used when an error terminates a connection.

use std::fmt;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur during WebSocket operations.
#[derive(Debug, Error)]
pub enum WsError {
    /// An operation was invoked in a state that does not allow it.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The upgrade response did not complete the handshake.
    #[error("WebSocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server demanded authentication that could not be provided.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A target or redirect URI was malformed or used an unsupported scheme.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The peer violated the wire protocol.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Close code to send to the peer.
        code: CloseCode,
        /// Human-readable description, also used as the close reason.
        reason: String,
    },

    /// Buffered inbound data exceeded the configured maximum.
    #[error("Buffer overflow.")]
    BufferOverflow {
        /// Number of bytes that would have been buffered.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An extension hook failed.
    #[error("extension {name} failed: {reason}")]
    Extension {
        /// Extension name.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// The connection has been closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Close code, if one was exchanged.
        code: Option<u16>,
        /// Reason for closing.
        reason: String,
    },

    /// Failed to send a frame.
    #[error("failed to send frame: {0}")]
    SendFailed(String),

    /// I/O error from the transport writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WsError {
    /// Create a new illegal state error.
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    /// Create a new handshake failed error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }

    /// Create a new authentication failed error.
    pub fn authentication_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed(reason.into())
    }

    /// Create a new invalid URI error.
    pub fn invalid_uri(reason: impl Into<String>) -> Self {
        Self::InvalidUri(reason.into())
    }

    /// Create a new protocol error with the `1002` close code.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::protocol_with_code(CloseCode::Protocol, reason)
    }

    /// Create a new protocol error with a specific close code.
    pub fn protocol_with_code(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new buffer overflow error.
    pub fn buffer_overflow(size: usize, max: usize) -> Self {
        Self::BufferOverflow { size, max }
    }

    /// Create a new extension error.
    pub fn extension(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Extension {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new connection closed error.
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new send failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed(reason.into())
    }

    /// Create a new internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Get the close code if this is a connection closed error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            Self::Protocol { code, .. } => Some(code.as_u16()),
            _ => None,
        }
    }

    /// The close frame to send when this error terminates a connection.
    ///
    /// Protocol errors carry their own code and reason; everything else
    /// closes with `1011` and the error message.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Protocol { code, reason } => CloseReason::new(*code, reason.clone()),
            other => CloseReason::new(CloseCode::InternalError, other.to_string()),
        }
    }
}

/// Close code for WebSocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Extension required (1010).
    ExtensionRequired = 1010,
    /// Internal error / unexpected condition (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015).
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::ExtensionRequired),
            1011 => Some(Self::InternalError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether `code` may appear in a close frame on the wire.
    ///
    /// `1005`, `1006` and `1015` are reserved for local reporting; `3000..=4999`
    /// are registered/private application codes.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::Unsupported => "Unsupported",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidPayload => "InvalidPayload",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::ExtensionRequired => "ExtensionRequired",
            Self::InternalError => "InternalError",
            Self::ServiceRestart => "ServiceRestart",
            Self::TryAgainLater => "TryAgainLater",
            Self::BadGateway => "BadGateway",
            Self::TlsHandshake => "TlsHandshake",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// Close code plus reason phrase, as exchanged in close frames and reported
/// to sessions and close listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Numeric close code.
    pub code: u16,
    /// Reason phrase (may be empty).
    pub reason: String,
}

impl CloseReason {
    /// Create a new close reason.
    pub fn new(code: impl Into<u16>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Normal closure with an empty reason.
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// The close code as a known [`CloseCode`], if it is one.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.reason)
        }
    }
}
