//! HTTP/2 client
//!
//! [`H2ClientBuilder::build`] takes an established transport, spawns the
//! connection driver task on it and returns an [`H2Client`] handle. Any
//! number of tasks may issue requests through clones of the handle; they are
//! multiplexed onto the single connection.
//!
//! The driver task owns the transport and all protocol state. It waits on two
//! things at once: commands from handles, and bytes from the peer. After each
//! wakeup it writes out every frame the protocol state queued.

use super::connection::{Event, H2Connection};
use super::error::{DisconnectError, Error, ErrorCode, Result};
use super::flow_control::FlowControlGate;
use super::multiplexer::{Cancelled, StreamMultiplexer, Submission, Ticket};
use super::settings::SettingsBuilder;
use super::stream::StreamId;
use super::Headers;
use crate::http::Session;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Read buffer size for the driver task
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// HTTP/2 response
#[derive(Debug, Clone)]
pub struct H2Response {
    /// Stream ID
    pub stream_id: StreamId,
    /// Status code
    pub status: u16,
    /// Headers, without pseudo-headers
    pub headers: Headers,
    /// Body
    pub body: Bytes,
}

impl H2Response {
    /// Get status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Get header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Get body as bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get body as string
    pub fn body_string(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| Error::Internal(format!("Invalid UTF-8 in body: {}", e)))
    }
}

enum Command {
    Submit(Submission),
    Cancel(Ticket),
    Shutdown,
}

/// Handle to a running HTTP/2 connection
///
/// Cheap to clone. The connection stays up while its driver task runs;
/// dropping every handle (and every pending [`ResponseFuture`]) shuts it down.
#[derive(Clone)]
pub struct H2Client {
    commands: mpsc::UnboundedSender<Command>,
    next_ticket: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

impl H2Client {
    /// Submit a request
    ///
    /// `headers` must contain the request pseudo-headers first. The request is
    /// handed to the connection before this returns, so requests submitted
    /// one after another get ascending stream IDs. Awaiting the returned
    /// future yields the response; dropping it cancels the request.
    pub fn send_request(&self, headers: Vec<(String, String)>, body: Option<Bytes>) -> ResponseFuture {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();

        let submission = Submission {
            ticket,
            headers,
            body,
            reply,
        };
        if let Err(mpsc::error::SendError(Command::Submit(submission))) =
            self.commands.send(Command::Submit(submission))
        {
            let _ = submission
                .reply
                .send(Err(Error::Disconnected(DisconnectError::transport_closed())));
        }

        ResponseFuture {
            ticket,
            response,
            commands: self.commands.clone(),
            done: false,
        }
    }

    /// True while the connection accepts new requests
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Close the connection with GOAWAY(NO_ERROR)
    ///
    /// Requests still in flight fail with [`Error::Disconnected`].
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Resolves once the driver task has exited
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

impl std::fmt::Debug for H2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Client")
            .field("open", &self.is_open())
            .finish()
    }
}

/// The outcome of one request
///
/// Dropping it before completion cancels the request: a queued request is
/// forgotten, an open stream is reset with CANCEL and its slot released.
#[must_use = "dropping a ResponseFuture cancels the request"]
pub struct ResponseFuture {
    ticket: Ticket,
    response: oneshot::Receiver<Result<H2Response>>,
    commands: mpsc::UnboundedSender<Command>,
    done: bool,
}

impl Future for ResponseFuture {
    type Output = Result<H2Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.response).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(Error::Disconnected(DisconnectError::transport_closed()))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.commands.send(Command::Cancel(self.ticket));
        }
    }
}

/// HTTP/2 client builder
pub struct H2ClientBuilder {
    settings: SettingsBuilder,
}

impl H2ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        H2ClientBuilder {
            settings: SettingsBuilder::new().enable_push(false),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings = self.settings.header_table_size(size);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings = self.settings.initial_window_size(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings = self.settings.max_frame_size(size);
        self
    }

    /// Set the number of concurrent streams we allow the peer
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings = self.settings.max_concurrent_streams(max);
        self
    }

    /// Start the connection over `session`
    ///
    /// Must be called within a tokio runtime; the driver task is spawned on it.
    pub fn build<S: Session>(self, session: S) -> Result<H2Client> {
        let settings = self.settings.build()?;
        Ok(spawn(H2Connection::new(settings), session))
    }
}

impl Default for H2ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn<S: Session>(conn: H2Connection, session: S) -> H2Client {
    let (commands, receiver) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let driver = Driver {
        session,
        conn,
        mux: StreamMultiplexer::new(),
        gate: FlowControlGate::new(),
        commands: receiver,
        open: open.clone(),
        draining: false,
    };
    tokio::spawn(driver.run());

    H2Client {
        commands,
        next_ticket: Arc::new(AtomicU64::new(0)),
        open,
    }
}

/// Owner of one connection's transport and protocol state
struct Driver<S> {
    session: S,
    conn: H2Connection,
    mux: StreamMultiplexer,
    gate: FlowControlGate,
    commands: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
    /// Stream IDs are used up: finish open streams, then close
    draining: bool,
}

impl<S: Session> Driver<S> {
    async fn run(mut self) {
        let disconnect = match self.drive().await {
            Ok(disconnect) => disconnect,
            Err(Error::Io(err)) => {
                warn!(error = %err, "HTTP/2 transport failed");
                DisconnectError::transport_closed()
            }
            Err(err) => {
                warn!(error = %err, "HTTP/2 connection error");
                let code = err.goaway_code();
                self.conn.close_connection(code, Bytes::from(err.to_string()));
                let _ = self.flush().await;
                DisconnectError::local(code)
            }
        };

        self.open.store(false, Ordering::Release);
        self.commands.close();
        self.gate.clear();

        // Requests that raced the shutdown fail like everything else
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(submission) = command {
                self.mux.park(submission);
            }
        }
        let failed = self.mux.fail_all(&disconnect);
        debug!(%disconnect, failed, "HTTP/2 connection closed");

        let _ = self.session.shutdown().await;
    }

    async fn drive(&mut self) -> Result<DisconnectError> {
        self.conn.initiate_connection();
        self.flush().await?;

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(submission)) => self.submit(submission)?,
                    Some(Command::Cancel(ticket)) => self.cancel(ticket)?,
                    Some(Command::Shutdown) | None => {
                        debug!("closing HTTP/2 connection");
                        return self.goaway().await;
                    }
                },
                read = self.session.read_buf(&mut buf) => {
                    if read? == 0 {
                        debug!("HTTP/2 transport closed by peer");
                        return Ok(DisconnectError::transport_closed());
                    }
                    let events = self.conn.receive_data(&buf)?;
                    buf.clear();
                    for event in events {
                        if let Some(disconnect) = self.handle_event(event)? {
                            self.flush().await?;
                            return Ok(disconnect);
                        }
                    }
                }
            }

            self.flush().await?;

            if self.draining && self.conn.open_streams() == 0 {
                debug!("stream identifiers exhausted, closing drained connection");
                return self.goaway().await;
            }
        }
    }

    async fn goaway(&mut self) -> Result<DisconnectError> {
        self.conn.close_connection(ErrorCode::NoError, Bytes::new());
        self.flush().await?;
        Ok(DisconnectError::local(ErrorCode::NoError))
    }

    async fn flush(&mut self) -> Result<()> {
        let data = self.conn.data_to_send();
        if !data.is_empty() {
            self.session.write_all(&data).await?;
            self.session.flush().await?;
        }
        Ok(())
    }

    fn submit(&mut self, submission: Submission) -> Result<()> {
        // Keep FIFO order: a newcomer never overtakes a waiter
        if self.mux.waiting_count() > 0 || !self.conn.has_stream_capacity() {
            trace!(ticket = submission.ticket, "no stream slot, queueing request");
            self.mux.park(submission);
            return Ok(());
        }
        self.start(submission)
    }

    /// Open a stream for a request and send as much of it as the windows allow
    fn start(&mut self, submission: Submission) -> Result<()> {
        if submission.reply.is_closed() {
            return Ok(());
        }
        if self.draining {
            let _ = submission
                .reply
                .send(Err(Error::Disconnected(DisconnectError::local(ErrorCode::NoError))));
            return Ok(());
        }
        if self.conn.is_closed() {
            // The peer's GOAWAY is still queued behind this event; it fails the waiter
            self.mux.park_front(submission);
            return Ok(());
        }

        let stream_id = match self.conn.open_stream() {
            Ok(stream_id) => stream_id,
            Err(Error::TooManyStreams) => {
                self.mux.park_front(submission);
                return Ok(());
            }
            Err(Error::StreamIdsExhausted) => {
                self.begin_draining();
                let _ = submission
                    .reply
                    .send(Err(Error::Disconnected(DisconnectError::local(ErrorCode::NoError))));
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let Submission {
            ticket,
            headers,
            body,
            reply,
        } = submission;
        let body = body.filter(|b| !b.is_empty());

        trace!(ticket, stream_id, "opened stream");
        self.mux.register(stream_id, ticket, reply);
        self.conn.send_headers(stream_id, &headers, body.is_none())?;

        if let Some(body) = body {
            self.gate.park(stream_id, body);
            self.pump(stream_id)?;
        }
        Ok(())
    }

    /// Send parked body chunks for a stream until its window or body runs out
    fn pump(&mut self, stream_id: StreamId) -> Result<()> {
        loop {
            let window = self.conn.local_flow_control_window(stream_id);
            let max_frame = self.conn.max_outbound_frame_size();
            match self.gate.next_chunk(stream_id, window, max_frame) {
                Some(chunk) => self.conn.send_data(stream_id, chunk.data, chunk.end_stream)?,
                None => break,
            }
        }
        if self.gate.is_parked(stream_id) {
            trace!(stream_id, "body waiting for send window");
        }
        Ok(())
    }

    /// A stream finished one way or another: give its slot to the next waiter
    fn release_slot(&mut self) -> Result<()> {
        if let Some(submission) = self.mux.next_waiter() {
            self.start(submission)?;
        }
        Ok(())
    }

    fn begin_draining(&mut self) {
        if !self.draining {
            warn!("HTTP/2 stream identifiers exhausted");
            self.draining = true;
            self.open.store(false, Ordering::Release);
            let disconnect = DisconnectError::local(ErrorCode::NoError);
            for submission in self.mux.take_waiters() {
                let _ = submission
                    .reply
                    .send(Err(Error::Disconnected(disconnect.clone())));
            }
        }
    }

    fn cancel(&mut self, ticket: Ticket) -> Result<()> {
        match self.mux.cancel(ticket) {
            Cancelled::Queued => trace!(ticket, "cancelled queued request"),
            Cancelled::Open(stream_id) => {
                debug!(ticket, stream_id, "cancelled open stream");
                self.gate.cancel(stream_id);
                self.conn.reset_stream(stream_id, ErrorCode::Cancel);
                self.release_slot()?;
            }
            Cancelled::Unknown => {}
        }
        Ok(())
    }

    /// Apply one protocol event; returns the disconnect if the peer hung up
    fn handle_event(&mut self, event: Event) -> Result<Option<DisconnectError>> {
        match event {
            Event::ResponseReceived { stream_id, headers } => {
                self.mux.on_headers(stream_id, headers);
            }
            Event::TrailersReceived { stream_id, .. } => {
                trace!(stream_id, "ignoring trailers");
            }
            Event::DataReceived { stream_id, data } => {
                self.mux.on_data(stream_id, &data);
            }
            Event::StreamEnded { stream_id } => {
                self.gate.cancel(stream_id);
                self.mux.complete(stream_id);
                self.release_slot()?;
            }
            Event::StreamReset {
                stream_id,
                error_code,
            } => {
                debug!(stream_id, error_code, "stream reset by peer");
                self.gate.cancel(stream_id);
                self.mux.fail_stream(
                    stream_id,
                    Error::Reset {
                        stream_id,
                        error_code,
                    },
                );
                self.release_slot()?;
            }
            Event::WindowUpdated { stream_id, .. } => {
                for released in self.gate.released_by(stream_id) {
                    self.pump(released)?;
                }
            }
            Event::SettingsReceived { changed } => {
                // The limit may have grown, and so may the stream windows
                while self.conn.has_stream_capacity() && !self.draining && !self.conn.is_closed() {
                    match self.mux.next_waiter() {
                        Some(submission) => self.start(submission)?,
                        None => break,
                    }
                }
                if changed.initial_window_size.is_some() {
                    for released in self.gate.released_by(0) {
                        self.pump(released)?;
                    }
                }
            }
            Event::ConnectionTerminated {
                error_code,
                last_stream_id,
                additional_data,
            } => {
                let disconnect = DisconnectError::goaway(error_code, additional_data);
                warn!(%disconnect, last_stream_id, "peer closed HTTP/2 connection");
                return Ok(Some(disconnect));
            }
        }
        Ok(None)
    }
}
