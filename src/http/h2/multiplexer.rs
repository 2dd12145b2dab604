//! Stream multiplexer
//!
//! Correlates streams with the callers waiting on them. Every open stream has
//! exactly one result slot, filled exactly once: with the assembled response
//! when the stream ends, or with an error when it is reset or the connection
//! goes away. Requests that arrive while the peer's concurrent-stream limit
//! is reached wait here in FIFO order for a slot.

use super::client::H2Response;
use super::error::{DisconnectError, Error, ResponseError, Result};
use super::stream::StreamId;
use super::Headers;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Identifies one submitted request for its whole life, queued or open
pub type Ticket = u64;

/// Where a request's outcome is delivered
pub type Reply = oneshot::Sender<Result<H2Response>>;

/// A request that has been submitted but not yet given a stream
#[derive(Debug)]
pub struct Submission {
    pub ticket: Ticket,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub reply: Reply,
}

/// Response state accumulated for one open stream
#[derive(Debug)]
struct PendingStream {
    ticket: Ticket,
    reply: Reply,
    status: Option<u16>,
    headers: Headers,
    body: BytesMut,
}

/// What cancelling a ticket found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// The request was still waiting for a slot and has been dropped
    Queued,
    /// The request owns this stream, which the caller must reset
    Open(StreamId),
    /// Already finished, or never seen
    Unknown,
}

#[derive(Debug, Default)]
pub struct StreamMultiplexer {
    streams: HashMap<StreamId, PendingStream>,
    tickets: HashMap<Ticket, StreamId>,
    waiters: VecDeque<Submission>,
}

impl StreamMultiplexer {
    pub fn new() -> Self {
        StreamMultiplexer::default()
    }

    /// Bind a result slot to a freshly opened stream
    ///
    /// Must happen before the stream's HEADERS are written, so no response
    /// can arrive for a stream without a slot.
    pub fn register(&mut self, stream_id: StreamId, ticket: Ticket, reply: Reply) {
        debug_assert!(!self.streams.contains_key(&stream_id));
        self.tickets.insert(ticket, stream_id);
        self.streams.insert(
            stream_id,
            PendingStream {
                ticket,
                reply,
                status: None,
                headers: Headers::new(),
                body: BytesMut::new(),
            },
        );
    }

    /// Queue a request behind all current waiters
    pub fn park(&mut self, submission: Submission) {
        self.waiters.push_back(submission);
    }

    /// Put a request back at the head of the queue
    pub fn park_front(&mut self, submission: Submission) {
        self.waiters.push_front(submission);
    }

    /// Oldest waiter whose caller is still interested
    pub fn next_waiter(&mut self) -> Option<Submission> {
        while let Some(submission) = self.waiters.pop_front() {
            if !submission.reply.is_closed() {
                return Some(submission);
            }
        }
        None
    }

    /// Drop every waiter, handing them back so they can be failed
    pub fn take_waiters(&mut self) -> Vec<Submission> {
        self.waiters.drain(..).collect()
    }

    /// Forget a cancelled request, wherever it is
    pub fn cancel(&mut self, ticket: Ticket) -> Cancelled {
        if let Some(stream_id) = self.tickets.remove(&ticket) {
            self.streams.remove(&stream_id);
            return Cancelled::Open(stream_id);
        }
        match self.waiters.iter().position(|s| s.ticket == ticket) {
            Some(index) => {
                self.waiters.remove(index);
                Cancelled::Queued
            }
            None => Cancelled::Unknown,
        }
    }

    pub fn stream_for_ticket(&self, ticket: Ticket) -> Option<StreamId> {
        self.tickets.get(&ticket).copied()
    }

    /// Record the response header block; the last value of a repeated name wins
    pub fn on_headers(&mut self, stream_id: StreamId, headers: Vec<(String, String)>) {
        if let Some(pending) = self.streams.get_mut(&stream_id) {
            for (name, value) in headers {
                if name == ":status" {
                    pending.status = value.parse().ok();
                } else {
                    pending.headers.insert(name, value);
                }
            }
        }
    }

    pub fn on_data(&mut self, stream_id: StreamId, data: &[u8]) {
        if let Some(pending) = self.streams.get_mut(&stream_id) {
            pending.body.extend_from_slice(data);
        }
    }

    /// The stream ended normally: resolve its slot
    ///
    /// A 2xx status resolves with the response, anything else with
    /// [`Error::Response`]. Returns false if the stream had no slot.
    pub fn complete(&mut self, stream_id: StreamId) -> bool {
        let pending = match self.take(stream_id) {
            Some(pending) => pending,
            None => return false,
        };

        let body = if pending.body.is_empty() {
            None
        } else {
            Some(pending.body.freeze())
        };

        let result = match pending.status {
            Some(status) if (200..300).contains(&status) => Ok(H2Response {
                stream_id,
                status,
                headers: pending.headers,
                body: body.unwrap_or_default(),
            }),
            Some(status) => Err(Error::Response(Box::new(ResponseError {
                status,
                headers: pending.headers,
                body,
            }))),
            None => Err(Error::Protocol(format!(
                "Stream {} ended without a valid :status",
                stream_id
            ))),
        };

        let _ = pending.reply.send(result);
        true
    }

    /// Resolve a stream's slot with an error
    pub fn fail_stream(&mut self, stream_id: StreamId, error: Error) -> bool {
        match self.take(stream_id) {
            Some(pending) => {
                let _ = pending.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// The connection is gone: every open stream and every waiter fails
    ///
    /// Leaves the multiplexer empty. Returns how many callers were failed.
    pub fn fail_all(&mut self, disconnect: &DisconnectError) -> usize {
        let mut failed = 0;
        for (_, pending) in self.streams.drain() {
            if pending.reply.send(Err(Error::Disconnected(disconnect.clone()))).is_ok() {
                failed += 1;
            }
        }
        self.tickets.clear();
        for submission in self.waiters.drain(..) {
            if submission
                .reply
                .send(Err(Error::Disconnected(disconnect.clone())))
                .is_ok()
            {
                failed += 1;
            }
        }
        failed
    }

    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    fn take(&mut self, stream_id: StreamId) -> Option<PendingStream> {
        let pending = self.streams.remove(&stream_id)?;
        self.tickets.remove(&pending.ticket);
        Some(pending)
    }
}
