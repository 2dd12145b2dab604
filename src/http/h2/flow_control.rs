//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! [`FlowControlWindow`] tracks one window (connection or stream, send or
//! receive). [`FlowControlGate`] holds request bodies that could not be sent
//! in full because a send window ran out, and hands them back out chunk by
//! chunk as WINDOW_UPDATE frames reopen the windows.

use super::error::{Error, Result};
use super::stream::StreamId;
use super::{CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Largest legal window (2^31 - 1)
const MAX_WINDOW: i64 = 0x7FFFFFFF;

/// Flow control window
///
/// The current size may go negative when the peer shrinks
/// SETTINGS_INITIAL_WINDOW_SIZE below what is already in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    /// Initial window size
    initial_size: u32,
    /// Current window size
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Usable capacity, zero when the window is exhausted or negative
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the amount actually granted, which may be less than requested
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = (amount as i64).min(self.current_size.max(0));
        self.current_size -= granted;
        granted as usize
    }

    /// Increase window size (WINDOW_UPDATE)
    ///
    /// Returns the new window size
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        // RFC 7540 Section 6.9.1
        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Decrease window size (receiving data)
    ///
    /// Receiving more than the window allows is a flow-control violation.
    pub fn decrease(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "Received {} bytes with only {} left in window",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Update initial window size from SETTINGS
    ///
    /// Applies the difference between the old and new initial size to the
    /// current size (RFC 7540 Section 6.9.2).
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;

        Ok(())
    }

    /// Increment to advertise once more than half the receive window is used
    pub fn should_send_window_update(&self) -> Option<u32> {
        let initial_size = self.initial_size as i64;
        if self.current_size < initial_size / 2 {
            Some((initial_size - self.current_size) as u32)
        } else {
            None
        }
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// A piece of a parked body that fits the current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// True when this chunk carries the last byte of the body
    pub end_stream: bool,
}

/// Request bodies waiting for send window
///
/// At most one body is parked per stream. Which streams a WINDOW_UPDATE
/// releases depends on its scope: a stream-level update releases only that
/// stream, a connection-level update releases every parked stream in
/// ascending stream-id order.
#[derive(Debug, Default)]
pub struct FlowControlGate {
    parked: BTreeMap<StreamId, Bytes>,
}

impl FlowControlGate {
    pub fn new() -> Self {
        FlowControlGate::default()
    }

    /// Park the unsent remainder of a stream's body
    pub fn park(&mut self, stream_id: StreamId, remaining: Bytes) {
        debug_assert!(
            !self.parked.contains_key(&stream_id),
            "stream {} already has a parked body",
            stream_id
        );
        self.parked.insert(stream_id, remaining);
    }

    pub fn is_parked(&self, stream_id: StreamId) -> bool {
        self.parked.contains_key(&stream_id)
    }

    /// Number of streams waiting for window
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Split the next chunk off a stream's parked body
    ///
    /// The chunk is at most `min(window, max_frame)` bytes. Returns `None`
    /// when nothing is parked for the stream or the window is closed. The
    /// stream stays parked until its last chunk has been taken.
    pub fn next_chunk(&mut self, stream_id: StreamId, window: usize, max_frame: usize) -> Option<Chunk> {
        let allowed = window.min(max_frame);
        if allowed == 0 {
            return None;
        }

        let body = self.parked.get_mut(&stream_id)?;
        if body.len() <= allowed {
            let data = self.parked.remove(&stream_id)?;
            return Some(Chunk { data, end_stream: true });
        }

        let data = body.split_to(allowed);
        Some(Chunk { data, end_stream: false })
    }

    /// Streams a WINDOW_UPDATE on `stream_id` releases, in the order to resume them
    pub fn released_by(&self, stream_id: StreamId) -> Vec<StreamId> {
        if stream_id == CONNECTION_STREAM_ID {
            self.parked.keys().copied().collect()
        } else if self.parked.contains_key(&stream_id) {
            vec![stream_id]
        } else {
            Vec::new()
        }
    }

    /// Drop a stream's parked body (stream reset or cancelled)
    pub fn cancel(&mut self, stream_id: StreamId) -> bool {
        self.parked.remove(&stream_id).is_some()
    }

    /// Drop every parked body (connection gone)
    pub fn clear(&mut self) {
        self.parked.clear();
    }
}
