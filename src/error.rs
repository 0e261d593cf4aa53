//! Error types for the WebSocket engine

use std::fmt;
use std::io;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket engine error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying writer or socket
    Io(io::Error),
    /// Malformed frame on the wire
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Protocol violation
    Protocol(&'static str),
    /// Protocol violation with a formatted message
    ProtocolOwned(String),
    /// Connection closed
    ConnectionClosed,
    /// Message exceeded the configured buffer limit
    MessageTooBig,
    /// Frame exceeded the configured frame limit
    FrameTooLarge,
    /// Opening handshake failed; carries the HTTP status to report
    Handshake {
        /// HTTP status code (400, 403, 426, or the peer's non-101 status)
        status: u16,
        /// Human readable reason
        reason: String,
    },
    /// Invalid state for the requested operation
    InvalidState(&'static str),
    /// Close code that may not appear on the wire
    InvalidCloseCode(u16),
    /// An extension failed to process a frame
    Extension {
        /// Extension name
        name: String,
        /// Failure description
        reason: String,
    },
    /// Compression/decompression error
    Compression(String),
    /// A frame write was cancelled before completing
    WriteCancelled,
}

impl Error {
    /// Create a handshake error
    pub fn handshake(status: u16, reason: impl Into<String>) -> Self {
        Error::Handshake {
            status,
            reason: reason.into(),
        }
    }

    /// Create an extension error
    pub fn extension(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Extension {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status carried by a handshake error
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Handshake { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Close code to send to the peer when this error terminates the connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidFrame(_)
            | Error::Protocol(_)
            | Error::ProtocolOwned(_)
            | Error::InvalidCloseCode(_) => CloseReason::PROTOCOL_ERROR,
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooBig | Error::FrameTooLarge => CloseReason::TOO_BIG,
            _ => CloseReason::INTERNAL,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Reserved
    pub const RESERVED: u16 = 1004;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;
    /// Service restart (server to client only)
    pub const SERVICE_RESTART: u16 = 1012;
    /// Try again later (server to client only)
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Bad gateway
    pub const BAD_GATEWAY: u16 = 1014;
    /// TLS handshake failure
    pub const TLS_HANDSHAKE_FAILURE: u16 = 1015;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close reason reported when the peer's close frame had no status
    pub fn no_status() -> Self {
        Self::new(Self::NO_STATUS, "")
    }

    /// Check if the close code may be received on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Code actually written to the wire when `code` is requested locally.
    ///
    /// 1005, 1006 and 1015 are never sent; a client additionally never
    /// sends 1012 or 1013. All of them become 1000.
    pub fn outgoing_code(code: u16, client: bool) -> u16 {
        match code {
            Self::NO_STATUS | Self::ABNORMAL | Self::TLS_HANDSHAKE_FAILURE => Self::NORMAL,
            Self::SERVICE_RESTART | Self::TRY_AGAIN_LATER if client => Self::NORMAL,
            other => other,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::ProtocolOwned(msg) => write!(f, "Protocol error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::MessageTooBig => write!(f, "Message too big"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::Handshake { status, reason } => {
                write!(f, "Handshake failed ({}): {}", status, reason)
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidCloseCode(code) => write!(f, "Invalid close code: {}", code),
            Error::Extension { name, reason } => {
                write!(f, "Extension '{}' failed: {}", name, reason)
            }
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::WriteCancelled => write!(f, "Frame write cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            Error::MessageTooBig => io::Error::new(io::ErrorKind::InvalidData, "message too big"),
            other => io::Error::other(other.to_string()),
        }
    }
}
