//! HTTP/2 protocol implementation
//!
//! This module provides the HTTP/2 client engine used by the APNs layer: a
//! sans-I/O connection codec, a stream multiplexer, a flow-control gate and
//! the task that drives them over one transport.
//!
//! # Architecture
//!
//! ```text
//!   callers ──send_request──► H2Client ──Command──► driver task
//!                                                      │
//!                      ┌───────────────────────────────┤
//!                      │                               │
//!              StreamMultiplexer               FlowControlGate
//!           (stream table, FIFO slots)     (parked bodies, windows)
//!                      │                               │
//!                      └──────────► H2Connection ◄─────┘
//!                                 (frames, HPACK, state)
//!                                        │
//!                                     Session
//! ```
//!
//! The driver task is the only owner of the transport and of all protocol
//! state. Callers hold an [`H2Client`] handle and a [`ResponseFuture`] per
//! request; nothing else is shared.
//!
//! ## Features
//!
//! - **Frame handling**: DATA, HEADERS, CONTINUATION, SETTINGS, PING,
//!   RST_STREAM, GOAWAY, WINDOW_UPDATE
//! - **Stream multiplexing**: unbounded callers over the negotiated
//!   concurrent-stream limit, queued FIFO when the limit is reached
//! - **HPACK compression**: via the `hpack` crate
//! - **Flow control**: connection and stream windows in both directions
//! - **Cancellation**: dropping a response future releases its slot

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod multiplexer;
pub mod settings;
pub mod stream;

pub use client::{H2Client, H2ClientBuilder, H2Response, ResponseFuture};
pub use connection::{Event, H2Connection};
pub use error::{DisconnectError, Error, ErrorCode, ResponseError, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Response header map: case-sensitive names, last occurrence wins
pub type Headers = std::collections::HashMap<String, String>;
