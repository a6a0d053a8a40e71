//! HTTP/3 error types
//!
//! This module defines error types for HTTP/3 operations, mapping to
//! the error codes defined in RFC 9114 Section 8.1 and RFC 9204 Section 6.

use super::qpack::QpackError;
use std::fmt;

/// HTTP/3 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from the QUIC transport
    #[error("Transport error: {0}")]
    Transport(#[from] crate::quic::Error),

    /// Header compression error
    #[error("QPACK error: {0}")]
    Qpack(#[from] QpackError),

    /// Peer violated the protocol in a way no more specific code covers
    #[error("General protocol error: {0}")]
    GeneralProtocol(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Peer created a stream we will not accept
    #[error("Stream creation error: {0}")]
    StreamCreation(String),

    /// Control or QPACK stream closed or reset
    #[error("Critical stream closed: {0}")]
    ClosedCriticalStream(String),

    /// Frame not allowed in the current state or on this stream
    #[error("Unexpected frame: {0}")]
    FrameUnexpected(String),

    /// Malformed frame
    #[error("Frame error: {0}")]
    Frame(String),

    /// Stream or push ID used incorrectly
    #[error("ID error: {0}")]
    Id(String),

    /// Bad SETTINGS content
    #[error("Settings error: {0}")]
    Settings(String),

    /// First control frame was not SETTINGS
    #[error("Missing SETTINGS")]
    MissingSettings,

    /// Request refused before processing
    #[error("Request rejected: stream {0}")]
    RequestRejected(u64),

    /// Malformed request or response message
    #[error("Message error: {0}")]
    Message(String),

    /// Stream not known to this connection
    #[error("Stream not found: {0}")]
    StreamNotFound(u64),

    /// Connection is shutting down
    #[error("Connection going away")]
    GoingAway,
}

impl Error {
    /// Wire code for this error
    pub fn code(&self) -> H3ErrorCode {
        match self {
            Error::Transport(_) | Error::Internal(_) => H3ErrorCode::InternalError,
            Error::Qpack(err) => err.code(),
            Error::GeneralProtocol(_) => H3ErrorCode::GeneralProtocolError,
            Error::StreamCreation(_) => H3ErrorCode::StreamCreationError,
            Error::ClosedCriticalStream(_) => H3ErrorCode::ClosedCriticalStream,
            Error::FrameUnexpected(_) => H3ErrorCode::FrameUnexpected,
            Error::Frame(_) => H3ErrorCode::FrameError,
            Error::Id(_) => H3ErrorCode::IdError,
            Error::Settings(_) => H3ErrorCode::SettingsError,
            Error::MissingSettings => H3ErrorCode::MissingSettings,
            Error::RequestRejected(_) | Error::GoingAway => H3ErrorCode::RequestRejected,
            Error::Message(_) => H3ErrorCode::MessageError,
            Error::StreamNotFound(_) => H3ErrorCode::InternalError,
        }
    }
}

/// HTTP/3 and QPACK error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum H3ErrorCode {
    /// No error, used when closing without a problem
    NoError = 0x100,
    GeneralProtocolError = 0x101,
    InternalError = 0x102,
    StreamCreationError = 0x103,
    ClosedCriticalStream = 0x104,
    FrameUnexpected = 0x105,
    FrameError = 0x106,
    ExcessiveLoad = 0x107,
    IdError = 0x108,
    SettingsError = 0x109,
    MissingSettings = 0x10a,
    RequestRejected = 0x10b,
    RequestCancelled = 0x10c,
    RequestIncomplete = 0x10d,
    MessageError = 0x10e,
    ConnectError = 0x10f,
    VersionFallback = 0x110,
    /// Header block could not be interpreted
    QpackDecompressionFailed = 0x200,
    QpackEncoderStreamError = 0x201,
    QpackDecoderStreamError = 0x202,
}

impl H3ErrorCode {
    /// Convert error code to u64
    pub fn as_u64(self) -> u64 {
        self as u64
    }

    /// Create error code from u64
    pub fn from_u64(code: u64) -> Option<Self> {
        match code {
            0x100 => Some(H3ErrorCode::NoError),
            0x101 => Some(H3ErrorCode::GeneralProtocolError),
            0x102 => Some(H3ErrorCode::InternalError),
            0x103 => Some(H3ErrorCode::StreamCreationError),
            0x104 => Some(H3ErrorCode::ClosedCriticalStream),
            0x105 => Some(H3ErrorCode::FrameUnexpected),
            0x106 => Some(H3ErrorCode::FrameError),
            0x107 => Some(H3ErrorCode::ExcessiveLoad),
            0x108 => Some(H3ErrorCode::IdError),
            0x109 => Some(H3ErrorCode::SettingsError),
            0x10a => Some(H3ErrorCode::MissingSettings),
            0x10b => Some(H3ErrorCode::RequestRejected),
            0x10c => Some(H3ErrorCode::RequestCancelled),
            0x10d => Some(H3ErrorCode::RequestIncomplete),
            0x10e => Some(H3ErrorCode::MessageError),
            0x10f => Some(H3ErrorCode::ConnectError),
            0x110 => Some(H3ErrorCode::VersionFallback),
            0x200 => Some(H3ErrorCode::QpackDecompressionFailed),
            0x201 => Some(H3ErrorCode::QpackEncoderStreamError),
            0x202 => Some(H3ErrorCode::QpackDecoderStreamError),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            H3ErrorCode::NoError => "H3_NO_ERROR",
            H3ErrorCode::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            H3ErrorCode::InternalError => "H3_INTERNAL_ERROR",
            H3ErrorCode::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            H3ErrorCode::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            H3ErrorCode::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            H3ErrorCode::FrameError => "H3_FRAME_ERROR",
            H3ErrorCode::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            H3ErrorCode::IdError => "H3_ID_ERROR",
            H3ErrorCode::SettingsError => "H3_SETTINGS_ERROR",
            H3ErrorCode::MissingSettings => "H3_MISSING_SETTINGS",
            H3ErrorCode::RequestRejected => "H3_REQUEST_REJECTED",
            H3ErrorCode::RequestCancelled => "H3_REQUEST_CANCELLED",
            H3ErrorCode::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            H3ErrorCode::MessageError => "H3_MESSAGE_ERROR",
            H3ErrorCode::ConnectError => "H3_CONNECT_ERROR",
            H3ErrorCode::VersionFallback => "H3_VERSION_FALLBACK",
            H3ErrorCode::QpackDecompressionFailed => "QPACK_DECOMPRESSION_FAILED",
            H3ErrorCode::QpackEncoderStreamError => "QPACK_ENCODER_STREAM_ERROR",
            H3ErrorCode::QpackDecoderStreamError => "QPACK_DECODER_STREAM_ERROR",
        }
    }
}

impl fmt::Display for H3ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u64())
    }
}

/// Result type for HTTP/3 operations
pub type Result<T> = std::result::Result<T, Error>;
