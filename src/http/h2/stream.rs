//! HTTP/2 stream management
//!
//! This module implements the client side of the stream state machine from
//! RFC 7540 Section 5.1, together with the per-stream flow-control windows.

use super::error::{Error, Result};
use super::flow_control::FlowControlWindow;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_STREAM_ID};
use bytes::BytesMut;
use std::collections::HashMap;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
///
/// A client never reserves streams, so the reserved states are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    /// Outbound window, sized by the peer's SETTINGS_INITIAL_WINDOW_SIZE
    send_window: FlowControlWindow,
    /// Inbound window, sized by our SETTINGS_INITIAL_WINDOW_SIZE
    recv_window: FlowControlWindow,
    /// Set once the response header block has been delivered
    response_started: bool,
}

impl H2Stream {
    /// Create a new stream with specified window sizes
    pub fn with_window_sizes(id: StreamId, send_size: u32, recv_size: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            send_window: FlowControlWindow::with_initial_size(send_size),
            recv_window: FlowControlWindow::with_initial_size(recv_size),
            response_started: false,
        }
    }

    /// Create a new stream with default windows
    pub fn new(id: StreamId) -> Self {
        Self::with_window_sizes(id, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    pub fn recv_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.recv_window
    }

    /// True once a header block has been received on this stream; a later
    /// block is trailers
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Apply an outbound HEADERS frame
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "Cannot send HEADERS on stream {} in state {:?}",
                self.id, self.state
            ))),
        }
    }

    /// Apply an outbound DATA frame of `len` bytes
    ///
    /// The caller must have checked the window; sending past it is an
    /// internal error.
    pub fn send_data(&mut self, len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }

        if self.send_window.consume(len) != len {
            return Err(Error::Internal(format!(
                "DATA of {} bytes exceeds stream {} send window",
                len, self.id
            )));
        }

        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                _ => StreamState::Closed,
            };
        }

        Ok(())
    }

    /// Apply an inbound header block
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }

        self.response_started = true;
        if end_stream {
            self.receive_end_stream();
        }

        Ok(())
    }

    /// Apply an inbound DATA frame, charging `flow_len` bytes to the receive window
    pub fn receive_data(&mut self, flow_len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }

        self.recv_window.decrease(flow_len)?;
        if end_stream {
            self.receive_end_stream();
        }

        Ok(())
    }

    fn receive_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    /// Reset the stream
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
    }
}

/// Stream manager
///
/// Owns every stream of one client connection. Closed streams are removed
/// immediately, so every stream in the table counts against the peer's
/// concurrency limit.
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Next client stream ID (odd)
    next_stream_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS
    max_concurrent_streams: Option<u32>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE
    initial_send_window: u32,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE
    initial_recv_window: u32,
    /// Partial header block awaiting CONTINUATION
    pending_header_block: Option<(StreamId, BytesMut, bool)>,
}

impl StreamManager {
    pub fn new(initial_recv_window: u32) -> Self {
        StreamManager {
            streams: HashMap::new(),
            next_stream_id: 1,
            max_concurrent_streams: None,
            initial_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_recv_window,
            pending_header_block: None,
        }
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    /// Get next stream ID (without incrementing)
    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    #[cfg(test)]
    pub(crate) fn set_next_stream_id(&mut self, id: StreamId) {
        self.next_stream_id = id;
    }

    /// True if a new stream could be opened right now
    pub fn has_capacity(&self) -> bool {
        match self.max_concurrent_streams {
            Some(max) => self.streams.len() < max as usize,
            None => true,
        }
    }

    /// Allocate the next stream ID and create the stream
    ///
    /// Fails with `StreamIdsExhausted` once the 31-bit ID space is used up,
    /// and with `TooManyStreams` while the peer's concurrency limit is reached.
    pub fn create_stream(&mut self) -> Result<StreamId> {
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(Error::StreamIdsExhausted);
        }
        if !self.has_capacity() {
            return Err(Error::TooManyStreams);
        }

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let stream = H2Stream::with_window_sizes(stream_id, self.initial_send_window, self.initial_recv_window);
        self.streams.insert(stream_id, stream);

        Ok(stream_id)
    }

    /// True if `stream_id` was opened by us at some point
    pub fn was_opened(&self, stream_id: StreamId) -> bool {
        stream_id % 2 == 1 && stream_id < self.next_stream_id
    }

    pub fn get_stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Remove a stream
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    /// Remove the stream if it has reached `Closed`
    pub fn remove_if_closed(&mut self, stream_id: StreamId) -> bool {
        let closed = self
            .streams
            .get(&stream_id)
            .map(|s| s.state().is_closed())
            .unwrap_or(false);
        if closed {
            self.streams.remove(&stream_id);
        }
        closed
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Open stream IDs in ascending order
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply a new peer SETTINGS_INITIAL_WINDOW_SIZE to every open stream
    pub fn update_initial_send_window(&mut self, size: u32) -> Result<()> {
        self.initial_send_window = size;
        for stream in self.streams.values_mut() {
            stream.send_window_mut().update_initial_size(size)?;
        }
        Ok(())
    }

    /// Start or continue a header block
    ///
    /// Returns the complete block, with the END_STREAM flag of its HEADERS
    /// frame, once END_HEADERS arrives.
    pub fn accumulate_header_block(
        &mut self,
        stream_id: StreamId,
        fragment: &[u8],
        end_stream: Option<bool>,
        end_headers: bool,
    ) -> Result<Option<(BytesMut, bool)>> {
        let (block, block_end_stream) = match (self.pending_header_block.take(), end_stream) {
            // HEADERS
            (None, Some(end_stream)) => (BytesMut::from(fragment), end_stream),
            // CONTINUATION
            (Some((pending_id, mut block, end_stream)), None) if pending_id == stream_id => {
                block.extend_from_slice(fragment);
                (block, end_stream)
            }
            (None, None) => {
                return Err(Error::Protocol(format!(
                    "CONTINUATION on stream {} without HEADERS",
                    stream_id
                )))
            }
            (Some((pending_id, _, _)), _) => {
                return Err(Error::Protocol(format!(
                    "Expected CONTINUATION on stream {}, got frame on stream {}",
                    pending_id, stream_id
                )))
            }
        };

        if end_headers {
            Ok(Some((block, block_end_stream)))
        } else {
            self.pending_header_block = Some((stream_id, block, block_end_stream));
            Ok(None)
        }
    }

    /// True while a header block is incomplete; only CONTINUATION may follow
    pub fn expecting_continuation(&self) -> bool {
        self.pending_header_block.is_some()
    }
}
