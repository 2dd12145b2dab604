//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 7540 Section 7, and the two failure
//! outcomes a request can end in: a non-success response on its stream, or
//! the loss of the whole connection.

use super::Headers;
use bytes::Bytes;
use std::fmt;

/// HTTP/2 errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream closed (RFC 7540 Section 7 - Error code 0x5)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Invalid header
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Too many streams
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// All client stream identifiers have been used on this connection
    #[error("Stream identifiers exhausted")]
    StreamIdsExhausted,

    /// Stream reset by the peer
    #[error("Stream {stream_id} reset: {}", describe_code(*.error_code))]
    Reset { stream_id: u32, error_code: u32 },

    /// The stream completed with a non-success status
    #[error("HTTP status {}", .0.status)]
    Response(Box<ResponseError>),

    /// The connection went away before the stream completed
    #[error("Disconnected: {0}")]
    Disconnected(DisconnectError),
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

impl Error {
    /// Error code to put in a GOAWAY when this error tears down the connection
    pub fn goaway_code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::InvalidSettings(_) | Error::InvalidHeader(_) => {
                ErrorCode::ProtocolError
            }
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            _ => ErrorCode::InternalError,
        }
    }
}

fn describe_code(code: u32) -> String {
    match ErrorCode::from_u32(code) {
        Some(known) => known.to_string(),
        None => format!("unknown (0x{:x})", code),
    }
}

/// Decode a body as JSON, yielding `None` when absent or malformed
fn decode_json(body: Option<&Bytes>) -> Option<serde_json::Value> {
    body.filter(|b| !b.is_empty())
        .and_then(|b| serde_json::from_slice(b).ok())
}

/// A stream that completed with a non-success status
#[derive(Debug, Clone)]
pub struct ResponseError {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Response body, if any DATA arrived
    pub body: Option<Bytes>,
}

impl ResponseError {
    /// Body decoded as JSON, best effort
    pub fn json_data(&self) -> Option<serde_json::Value> {
        decode_json(self.body.as_ref())
    }

    /// Get header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }
}

/// The connection terminated before a stream completed
#[derive(Debug, Clone, Default)]
pub struct DisconnectError {
    /// GOAWAY error code; `None` when the transport closed without one
    pub error_code: Option<u32>,
    /// GOAWAY debug data
    pub additional_data: Option<Bytes>,
}

impl DisconnectError {
    /// Disconnect carrying a GOAWAY code and debug payload
    pub fn goaway(error_code: u32, additional_data: Bytes) -> Self {
        DisconnectError {
            error_code: Some(error_code),
            additional_data: if additional_data.is_empty() {
                None
            } else {
                Some(additional_data)
            },
        }
    }

    /// Disconnect with a locally known code and no payload
    pub fn local(code: ErrorCode) -> Self {
        DisconnectError {
            error_code: Some(code.as_u32()),
            additional_data: None,
        }
    }

    /// Transport closed with no GOAWAY
    pub fn transport_closed() -> Self {
        DisconnectError::default()
    }

    /// Known error code, if any
    pub fn code(&self) -> Option<ErrorCode> {
        self.error_code.and_then(ErrorCode::from_u32)
    }

    /// Debug data decoded as JSON, best effort
    pub fn json_data(&self) -> Option<serde_json::Value> {
        decode_json(self.additional_data.as_ref())
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_code {
            Some(code) => write!(f, "{}", describe_code(code)),
            None => write!(f, "transport closed"),
        }
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
