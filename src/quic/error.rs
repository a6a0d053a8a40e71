//! QUIC error types
//!
//! This module defines error types for QUIC operations and the transport
//! error codes carried by CONNECTION_CLOSE frames (RFC 9000 Section 20.1).

use std::fmt;

/// QUIC errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OpenSSL failure while deriving keys or running a cipher
    #[error("Crypto backend error: {0}")]
    Backend(#[from] openssl::error::ErrorStack),

    /// Input ended before a complete value could be read
    #[error("Buffer too short: {0}")]
    Truncated(String),

    /// Value does not fit in a 62-bit variable-length integer
    #[error("Varint overflow: {0}")]
    VarintOverflow(u64),

    /// Malformed packet header
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Version other than QUIC v1 (version negotiation required)
    #[error("Unsupported version: 0x{0:08x}")]
    UnsupportedVersion(u32),

    /// Malformed frame (FRAME_ENCODING_ERROR)
    #[error("Frame encoding error: {0}")]
    FrameEncoding(String),

    /// Frame type not known to this implementation
    #[error("Unknown frame type: 0x{0:x}")]
    UnknownFrameType(u64),

    /// Protocol violation (PROTOCOL_VIOLATION)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Flow control limit exceeded (FLOW_CONTROL_ERROR)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream limit exceeded (STREAM_LIMIT_ERROR)
    #[error("Stream limit error: {0}")]
    StreamLimit(String),

    /// Frame received for a stream in the wrong state (STREAM_STATE_ERROR)
    #[error("Stream state error: {0}")]
    StreamState(String),

    /// Final size changed or exceeded (FINAL_SIZE_ERROR)
    #[error("Final size error: {0}")]
    FinalSize(String),

    /// Malformed or invalid transport parameters
    #[error("Transport parameter error: {0}")]
    TransportParameter(String),

    /// Too many connection IDs issued by the peer
    #[error("Connection ID limit error: {0}")]
    ConnectionIdLimit(String),

    /// Key derivation or cipher setup failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// TLS alert raised by the handshake engine (CRYPTO_ERROR range)
    #[error("TLS alert: {0}")]
    TlsAlert(u8),

    /// AEAD open failed; carries no detail on purpose
    #[error("Packet decryption failed")]
    Decryption,

    /// Keys for the required encryption level are not installed
    #[error("Keys unavailable: {0}")]
    KeysUnavailable(String),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u64),

    /// Peer reset the stream
    #[error("Stream {stream} reset by peer (code 0x{code:x})")]
    StreamReset { stream: u64, code: u64 },

    /// Peer asked us to stop sending on the stream
    #[error("Stream {stream} stopped by peer (code 0x{code:x})")]
    StreamStopped { stream: u64, code: u64 },

    /// Send side is blocked by flow or congestion control
    #[error("Send blocked")]
    Blocked,

    /// Connection has been closed
    #[error("Connection closed: {reason} (code 0x{code:x})")]
    ConnectionClosed { code: u64, reason: String },

    /// Operation not valid in the current connection state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No usable session ticket for 0-RTT
    #[error("No session ticket available")]
    NoSessionTicket,

    /// Server refused early data
    #[error("Early data rejected")]
    EarlyDataRejected,

    /// ClientHello seen before within the anti-replay window
    #[error("Potential replay detected")]
    ReplayDetected,

    /// Path validation did not complete in time
    #[error("Path validation failed")]
    PathValidationFailed,

    /// Timeout waiting for operation
    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Transport error code to report in CONNECTION_CLOSE for this error
    pub fn transport_code(&self) -> u64 {
        let code = match self {
            Error::Truncated(_) | Error::VarintOverflow(_) | Error::FrameEncoding(_) => {
                TransportErrorCode::FrameEncodingError
            }
            Error::UnknownFrameType(_) => TransportErrorCode::FrameEncodingError,
            Error::Protocol(_) | Error::InvalidPacket(_) => TransportErrorCode::ProtocolViolation,
            Error::FlowControl(_) => TransportErrorCode::FlowControlError,
            Error::StreamLimit(_) => TransportErrorCode::StreamLimitError,
            Error::StreamState(_) | Error::StreamNotFound(_) => TransportErrorCode::StreamStateError,
            Error::FinalSize(_) => TransportErrorCode::FinalSizeError,
            Error::TransportParameter(_) => TransportErrorCode::TransportParameterError,
            Error::ConnectionIdLimit(_) => TransportErrorCode::ConnectionIdLimitError,
            Error::TlsAlert(alert) => return CRYPTO_ERROR_BASE + *alert as u64,
            Error::ConnectionClosed { code, .. } => return *code,
            _ => TransportErrorCode::InternalError,
        };
        code.as_u64()
    }
}

/// First code of the CRYPTO_ERROR range (0x0100-0x01ff)
pub const CRYPTO_ERROR_BASE: u64 = 0x100;

/// QUIC transport error codes (RFC 9000 Section 20.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportErrorCode {
    /// Graceful close
    NoError = 0x0,
    /// Implementation fault
    InternalError = 0x1,
    /// Server refuses the connection
    ConnectionRefused = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Too many streams opened
    StreamLimitError = 0x4,
    /// Frame received in invalid stream state
    StreamStateError = 0x5,
    /// Change to final size
    FinalSizeError = 0x6,
    /// Frame encoding error
    FrameEncodingError = 0x7,
    /// Error in transport parameters
    TransportParameterError = 0x8,
    /// Too many connection IDs received
    ConnectionIdLimitError = 0x9,
    /// Generic protocol violation
    ProtocolViolation = 0xa,
    /// Invalid Retry or NEW_TOKEN token
    InvalidToken = 0xb,
    /// Application error
    ApplicationError = 0xc,
    /// CRYPTO data buffer overflowed
    CryptoBufferExceeded = 0xd,
    /// Invalid packet protection update
    KeyUpdateError = 0xe,
    /// Excessive use of packet protection keys
    AeadLimitReached = 0xf,
    /// No viable network path exists
    NoViablePath = 0x10,
}

impl TransportErrorCode {
    /// Convert error code to u64
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Create error code from u64
    pub fn from_u64(code: u64) -> Option<Self> {
        match code {
            0x0 => Some(TransportErrorCode::NoError),
            0x1 => Some(TransportErrorCode::InternalError),
            0x2 => Some(TransportErrorCode::ConnectionRefused),
            0x3 => Some(TransportErrorCode::FlowControlError),
            0x4 => Some(TransportErrorCode::StreamLimitError),
            0x5 => Some(TransportErrorCode::StreamStateError),
            0x6 => Some(TransportErrorCode::FinalSizeError),
            0x7 => Some(TransportErrorCode::FrameEncodingError),
            0x8 => Some(TransportErrorCode::TransportParameterError),
            0x9 => Some(TransportErrorCode::ConnectionIdLimitError),
            0xa => Some(TransportErrorCode::ProtocolViolation),
            0xb => Some(TransportErrorCode::InvalidToken),
            0xc => Some(TransportErrorCode::ApplicationError),
            0xd => Some(TransportErrorCode::CryptoBufferExceeded),
            0xe => Some(TransportErrorCode::KeyUpdateError),
            0xf => Some(TransportErrorCode::AeadLimitReached),
            0x10 => Some(TransportErrorCode::NoViablePath),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            TransportErrorCode::NoError => "NO_ERROR",
            TransportErrorCode::InternalError => "INTERNAL_ERROR",
            TransportErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            TransportErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            TransportErrorCode::StreamLimitError => "STREAM_LIMIT_ERROR",
            TransportErrorCode::StreamStateError => "STREAM_STATE_ERROR",
            TransportErrorCode::FinalSizeError => "FINAL_SIZE_ERROR",
            TransportErrorCode::FrameEncodingError => "FRAME_ENCODING_ERROR",
            TransportErrorCode::TransportParameterError => "TRANSPORT_PARAMETER_ERROR",
            TransportErrorCode::ConnectionIdLimitError => "CONNECTION_ID_LIMIT_ERROR",
            TransportErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            TransportErrorCode::InvalidToken => "INVALID_TOKEN",
            TransportErrorCode::ApplicationError => "APPLICATION_ERROR",
            TransportErrorCode::CryptoBufferExceeded => "CRYPTO_BUFFER_EXCEEDED",
            TransportErrorCode::KeyUpdateError => "KEY_UPDATE_ERROR",
            TransportErrorCode::AeadLimitReached => "AEAD_LIMIT_REACHED",
            TransportErrorCode::NoViablePath => "NO_VIABLE_PATH",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// Result type for QUIC operations
pub type Result<T> = std::result::Result<T, Error>;
