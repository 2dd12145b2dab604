//! Sans-I/O HTTP/2 client connection
//!
//! [`H2Connection`] holds all protocol state of one client connection: the
//! frame codec, HPACK contexts, the stream table and the connection-level
//! flow-control windows. It performs no I/O. Bytes read from the transport
//! are passed to [`H2Connection::receive_data`], which returns the
//! [`Event`]s they produced; frames to write accumulate internally and are
//! drained with [`H2Connection::data_to_send`].

use super::codec::{self, FrameCodec};
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControlWindow;
use super::frames::*;
use super::settings::Settings;
use super::stream::{StreamId, StreamManager, StreamState};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use bytes::{Bytes, BytesMut};
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use tracing::{debug, trace};

/// Something the peer did that the owner of the connection must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Final response header block for a stream, pseudo-headers included
    ResponseReceived {
        stream_id: StreamId,
        headers: Vec<(String, String)>,
    },
    /// Trailing header block for a stream
    TrailersReceived {
        stream_id: StreamId,
        headers: Vec<(String, String)>,
    },
    /// Body bytes for a stream, padding removed
    DataReceived { stream_id: StreamId, data: Bytes },
    /// The peer finished its side of the stream; the stream is gone
    StreamEnded { stream_id: StreamId },
    /// Send window grew; stream 0 means the connection window
    WindowUpdated { stream_id: StreamId, delta: u32 },
    /// The peer reset a stream
    StreamReset { stream_id: StreamId, error_code: u32 },
    /// The peer changed settings (only the parameters it sent)
    SettingsReceived { changed: Settings },
    /// The peer sent GOAWAY
    ConnectionTerminated {
        error_code: u32,
        last_stream_id: StreamId,
        additional_data: Bytes,
    },
}

/// HTTP/2 client connection state machine
pub struct H2Connection {
    codec: FrameCodec,
    streams: StreamManager,
    /// Connection-level outbound window
    send_window: FlowControlWindow,
    /// Connection-level inbound window
    recv_window: FlowControlWindow,
    hpack_encoder: HpackEncoder<'static>,
    hpack_decoder: HpackDecoder<'static>,
    local_settings: Settings,
    remote_settings: Settings,
    /// Encoded frames not yet handed to the transport
    outbound: BytesMut,
    /// Set once either side sent GOAWAY
    closed: bool,
}

impl H2Connection {
    /// Create a connection that will advertise `local_settings`
    pub fn new(local_settings: Settings) -> Self {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(local_settings.get_max_frame_size() as usize);

        H2Connection {
            codec,
            streams: StreamManager::new(local_settings.get_initial_window_size()),
            send_window: FlowControlWindow::new(),
            recv_window: FlowControlWindow::new(),
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::new(),
            local_settings,
            remote_settings: Settings::new(),
            outbound: BytesMut::with_capacity(4096),
            closed: false,
        }
    }

    /// Queue the connection preface and our SETTINGS (RFC 7540 Section 3.5)
    pub fn initiate_connection(&mut self) {
        self.outbound.extend_from_slice(CONNECTION_PREFACE);
        let frame = SettingsFrame::new(self.local_settings.clone());
        self.outbound
            .extend_from_slice(&FrameCodec::encode_settings_frame(&frame));
    }

    /// Take every frame queued for the transport
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// True once GOAWAY has been sent or received
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of streams currently open
    pub fn open_streams(&self) -> usize {
        self.streams.active_stream_count()
    }

    /// True if the peer's concurrency limit allows another stream
    pub fn has_stream_capacity(&self) -> bool {
        self.streams.has_capacity()
    }

    /// State of a stream, `None` once it is gone
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get_stream(stream_id).map(|s| s.state())
    }

    #[cfg(test)]
    pub(crate) fn set_next_stream_id(&mut self, id: StreamId) {
        self.streams.set_next_stream_id(id);
    }

    /// Allocate a new stream
    pub fn open_stream(&mut self) -> Result<StreamId> {
        if self.closed {
            return Err(Error::Protocol("Connection is closed".to_string()));
        }
        self.streams.create_stream()
    }

    /// Largest DATA payload the peer accepts
    pub fn max_outbound_frame_size(&self) -> usize {
        self.remote_settings.get_max_frame_size() as usize
    }

    /// Bytes that may be sent on a stream right now: the smaller of the
    /// connection and stream send windows, never negative
    pub fn local_flow_control_window(&self, stream_id: StreamId) -> usize {
        match self.streams.get_stream(stream_id) {
            Some(stream) if stream.state().can_send() => {
                self.send_window.available().min(stream.send_window().available())
            }
            _ => 0,
        }
    }

    /// Queue a header block, split into HEADERS and CONTINUATION frames
    pub fn send_headers(&mut self, stream_id: StreamId, headers: &[(String, String)], end_stream: bool) -> Result<()> {
        let stream = self
            .streams
            .get_stream_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        stream.send_headers(end_stream)?;

        let mut block = Vec::new();
        self.hpack_encoder
            .encode_into(
                headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())),
                &mut block,
            )
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;

        let max_frame = self.max_outbound_frame_size();
        let mut block = Bytes::from(block);
        let first = block.split_to(block.len().min(max_frame));
        let frame = HeadersFrame::new(stream_id, first, end_stream, block.is_empty());
        self.outbound
            .extend_from_slice(&FrameCodec::encode_headers_frame(&frame));

        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max_frame));
            let frame = ContinuationFrame {
                stream_id,
                header_block: fragment,
                end_headers: block.is_empty(),
            };
            self.outbound
                .extend_from_slice(&FrameCodec::encode_continuation_frame(&frame));
        }

        trace!(stream_id, end_stream, "queued HEADERS");
        Ok(())
    }

    /// Queue one DATA frame
    ///
    /// The payload must fit [`local_flow_control_window`] and
    /// [`max_outbound_frame_size`].
    ///
    /// [`local_flow_control_window`]: H2Connection::local_flow_control_window
    /// [`max_outbound_frame_size`]: H2Connection::max_outbound_frame_size
    pub fn send_data(&mut self, stream_id: StreamId, data: Bytes, end_stream: bool) -> Result<()> {
        if data.len() > self.max_outbound_frame_size() {
            return Err(Error::FrameSize(format!(
                "DATA of {} bytes exceeds peer max frame size",
                data.len()
            )));
        }
        if data.len() > self.send_window.available() {
            return Err(Error::Internal(format!(
                "DATA of {} bytes exceeds connection send window",
                data.len()
            )));
        }

        let stream = self
            .streams
            .get_stream_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        stream.send_data(data.len(), end_stream)?;
        self.send_window.consume(data.len());

        trace!(stream_id, len = data.len(), end_stream, "queued DATA");
        let frame = DataFrame::new(stream_id, data, end_stream);
        self.outbound
            .extend_from_slice(&FrameCodec::encode_data_frame(&frame));
        self.streams.remove_if_closed(stream_id);
        Ok(())
    }

    /// Abort a stream with RST_STREAM
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if self.streams.remove_stream(stream_id).is_some() {
            debug!(stream_id, code = %error_code, "resetting stream");
            let frame = RstStreamFrame::new(stream_id, error_code);
            self.outbound
                .extend_from_slice(&FrameCodec::encode_rst_stream_frame(&frame));
        }
    }

    /// Queue GOAWAY; no further streams may be opened
    pub fn close_connection(&mut self, error_code: ErrorCode, debug_data: Bytes) {
        if self.closed {
            return;
        }
        self.closed = true;
        // We never accept peer-initiated streams
        let frame = GoawayFrame::new(0, error_code, debug_data);
        self.outbound
            .extend_from_slice(&FrameCodec::encode_goaway_frame(&frame));
    }

    /// Process bytes read from the transport
    ///
    /// An error is a connection error: the caller should send GOAWAY with
    /// [`Error::goaway_code`] and drop the connection.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<Event>> {
        self.codec.feed(data);

        let mut events = Vec::new();
        while let Some(frame) = self.codec.next_frame()? {
            self.process_frame(frame, &mut events)?;
        }
        Ok(events)
    }

    fn process_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        let frame_type = match frame.frame_type {
            Some(frame_type) => frame_type,
            // Extension frames are ignored, but never inside a header block
            None if self.streams.expecting_continuation() => {
                return Err(Error::Protocol("Expected CONTINUATION".to_string()))
            }
            None => return Ok(()),
        };

        if self.streams.expecting_continuation() && frame_type != FrameType::Continuation {
            return Err(Error::Protocol(format!(
                "Expected CONTINUATION, got {}",
                frame_type
            )));
        }

        trace!(frame = %frame_type, stream_id = frame.stream_id, len = frame.payload_len(), "received frame");

        match frame_type {
            FrameType::Data => self.on_data(frame, events),
            FrameType::Headers => {
                self.require_stream_frame(&frame, frame_type)?;
                let end_stream = frame.flags.is_end_stream();
                let end_headers = frame.flags.is_end_headers();
                let fragment = codec::headers_fragment(frame.flags, frame.payload)?;
                if let Some((block, end_stream)) =
                    self.streams
                        .accumulate_header_block(frame.stream_id, &fragment, Some(end_stream), end_headers)?
                {
                    self.on_header_block(frame.stream_id, &block, end_stream, events)?;
                }
                Ok(())
            }
            FrameType::Continuation => {
                self.require_stream_frame(&frame, frame_type)?;
                let end_headers = frame.flags.is_end_headers();
                if let Some((block, end_stream)) =
                    self.streams
                        .accumulate_header_block(frame.stream_id, &frame.payload, None, end_headers)?
                {
                    self.on_header_block(frame.stream_id, &block, end_stream, events)?;
                }
                Ok(())
            }
            FrameType::Priority => Ok(()),
            FrameType::RstStream => {
                self.require_stream_frame(&frame, frame_type)?;
                let rst = codec::decode_rst_stream(frame.stream_id, &frame.payload)?;
                if self.streams.remove_stream(rst.stream_id).is_some() {
                    events.push(Event::StreamReset {
                        stream_id: rst.stream_id,
                        error_code: rst.error_code,
                    });
                } else {
                    self.require_known_stream(rst.stream_id)?;
                }
                Ok(())
            }
            FrameType::Settings => self.on_settings(frame, events),
            FrameType::PushPromise => Err(Error::Protocol(
                "PUSH_PROMISE received with push disabled".to_string(),
            )),
            FrameType::Ping => {
                self.require_connection_frame(&frame, frame_type)?;
                let ping = codec::decode_ping(frame.flags, &frame.payload)?;
                if !ping.ack {
                    self.outbound
                        .extend_from_slice(&FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data)));
                }
                Ok(())
            }
            FrameType::Goaway => {
                self.require_connection_frame(&frame, frame_type)?;
                let goaway = codec::decode_goaway(frame.payload)?;
                self.closed = true;
                events.push(Event::ConnectionTerminated {
                    error_code: goaway.error_code,
                    last_stream_id: goaway.last_stream_id,
                    additional_data: goaway.debug_data,
                });
                Ok(())
            }
            FrameType::WindowUpdate => {
                let update = codec::decode_window_update(frame.stream_id, &frame.payload)?;
                if update.stream_id == CONNECTION_STREAM_ID {
                    self.send_window.increase(update.size_increment)?;
                } else if let Some(stream) = self.streams.get_stream_mut(update.stream_id) {
                    stream.send_window_mut().increase(update.size_increment)?;
                } else {
                    self.require_known_stream(update.stream_id)?;
                    return Ok(());
                }
                events.push(Event::WindowUpdated {
                    stream_id: update.stream_id,
                    delta: update.size_increment,
                });
                Ok(())
            }
        }
    }

    fn on_data(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        self.require_stream_frame(&frame, FrameType::Data)?;
        let stream_id = frame.stream_id;
        let end_stream = frame.flags.is_end_stream();
        // Padding counts against flow control
        let flow_len = frame.payload_len();

        self.recv_window.decrease(flow_len)?;
        if let Some(increment) = self.recv_window.should_send_window_update() {
            self.recv_window.increase(increment)?;
            self.queue_window_update(CONNECTION_STREAM_ID, increment);
        }

        let stream = match self.streams.get_stream_mut(stream_id) {
            Some(stream) => stream,
            None => return self.require_known_stream(stream_id),
        };
        if !stream.response_started() {
            return Err(Error::Protocol(format!(
                "DATA before HEADERS on stream {}",
                stream_id
            )));
        }

        stream.receive_data(flow_len, end_stream)?;
        let stream_update = if end_stream {
            None
        } else {
            stream.recv_window().should_send_window_update()
        };
        if let Some(increment) = stream_update {
            stream.recv_window_mut().increase(increment)?;
            self.queue_window_update(stream_id, increment);
        }

        let data = codec::strip_padding(frame.flags, frame.payload)?;
        if !data.is_empty() {
            events.push(Event::DataReceived { stream_id, data });
        }
        if end_stream {
            self.end_remote_stream(stream_id, events);
        }
        Ok(())
    }

    fn on_header_block(&mut self, stream_id: StreamId, block: &[u8], end_stream: bool, events: &mut Vec<Event>) -> Result<()> {
        // Decode even for streams we no longer track, to keep HPACK state in sync
        let decoded = self
            .hpack_decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;
        let headers: Vec<(String, String)> = decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        let stream = match self.streams.get_stream_mut(stream_id) {
            Some(stream) => stream,
            None => return self.require_known_stream(stream_id),
        };

        let informational = !stream.response_started() && !end_stream && is_informational(&headers);
        if informational {
            trace!(stream_id, "skipping informational response");
            return Ok(());
        }

        let trailers = stream.response_started();
        stream.receive_headers(end_stream)?;
        events.push(if trailers {
            Event::TrailersReceived { stream_id, headers }
        } else {
            Event::ResponseReceived { stream_id, headers }
        });

        if end_stream {
            self.end_remote_stream(stream_id, events);
        }
        Ok(())
    }

    /// The peer closed its side; the stream leaves the table
    ///
    /// If we are still sending, the rest of the request is abandoned with
    /// RST_STREAM(NO_ERROR) (RFC 7540 Section 8.1).
    fn end_remote_stream(&mut self, stream_id: StreamId, events: &mut Vec<Event>) {
        if let Some(stream) = self.streams.remove_stream(stream_id) {
            if stream.state() == StreamState::HalfClosedRemote {
                let frame = RstStreamFrame::new(stream_id, ErrorCode::NoError);
                self.outbound
                    .extend_from_slice(&FrameCodec::encode_rst_stream_frame(&frame));
            }
        }
        events.push(Event::StreamEnded { stream_id });
    }

    fn on_settings(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<()> {
        self.require_connection_frame(&frame, FrameType::Settings)?;

        if frame.flags.is_ack() {
            if frame.payload_len() != 0 {
                return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
            }
            trace!("SETTINGS acknowledged");
            return Ok(());
        }

        let changed = Settings::decode(&frame.payload)?;
        self.remote_settings.merge(&changed);

        if changed.max_concurrent_streams.is_some() {
            self.streams
                .set_max_concurrent_streams(changed.max_concurrent_streams);
        }
        if let Some(size) = changed.initial_window_size {
            self.streams.update_initial_send_window(size)?;
        }

        debug!(
            max_concurrent_streams = ?self.remote_settings.get_max_concurrent_streams(),
            initial_window_size = self.remote_settings.get_initial_window_size(),
            max_frame_size = self.remote_settings.get_max_frame_size(),
            "peer settings"
        );

        self.outbound
            .extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
        events.push(Event::SettingsReceived { changed });
        Ok(())
    }

    fn queue_window_update(&mut self, stream_id: StreamId, increment: u32) {
        let frame = WindowUpdateFrame::new(stream_id, increment);
        self.outbound
            .extend_from_slice(&FrameCodec::encode_window_update_frame(&frame));
    }

    /// Frames for streams we closed are ignored; frames for idle streams are an error
    fn require_known_stream(&self, stream_id: StreamId) -> Result<()> {
        if self.streams.was_opened(stream_id) {
            Ok(())
        } else {
            Err(Error::Protocol(format!("Frame on idle stream {}", stream_id)))
        }
    }

    fn require_stream_frame(&self, frame: &Frame, frame_type: FrameType) -> Result<()> {
        if frame.stream_id == CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} frame on stream 0", frame_type)));
        }
        Ok(())
    }

    fn require_connection_frame(&self, frame: &Frame, frame_type: FrameType) -> Result<()> {
        if frame.stream_id != CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!(
                "{} frame on stream {}",
                frame_type, frame.stream_id
            )));
        }
        Ok(())
    }
}

fn is_informational(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .find(|(name, _)| name == ":status")
        .map(|(_, value)| value.starts_with('1'))
        .unwrap_or(false)
}
