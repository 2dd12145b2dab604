//! Shared test helpers: a scripted HTTP/2 server over an in-memory pipe

#![allow(dead_code)]

use apns_h2::apns::{ConnectError, Connector};
use apns_h2::http::h2::codec::{headers_fragment, FrameCodec};
use apns_h2::http::h2::frames::*;
use apns_h2::http::h2::{ErrorCode, H2Client, H2ClientBuilder, Settings, StreamId, CONNECTION_PREFACE};
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A request as the server saw it
#[derive(Debug, Default)]
pub struct Request {
    pub stream_id: StreamId,
    pub headers: Vec<(String, String)>,
    pub body: BytesMut,
    block: BytesMut,
    headers_done: bool,
    ended: bool,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.header(":path").unwrap_or("")
    }
}

/// Transport the server side runs over
pub trait ServerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ServerIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Server end of an HTTP/2 connection, scripted by the test
pub struct MockServer {
    io: Box<dyn ServerIo>,
    codec: FrameCodec,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    partial: HashMap<StreamId, Request>,
    ready: VecDeque<Request>,
    /// Every frame read from the client, in order
    pub log: Vec<Frame>,
}

impl MockServer {
    /// Client transport plus the server driving its other end
    pub fn pair() -> (DuplexStream, MockServer) {
        let (client, server) = tokio::io::duplex(1 << 20);
        (client, MockServer::over(server))
    }

    /// Server over an already established transport
    pub fn over(io: impl ServerIo + 'static) -> MockServer {
        MockServer {
            io: Box::new(io),
            codec: FrameCodec::new(),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            partial: HashMap::new(),
            ready: VecDeque::new(),
            log: Vec::new(),
        }
    }

    /// Client on one end of a fresh pipe, with default client settings
    pub fn client() -> (H2Client, MockServer) {
        let (io, server) = MockServer::pair();
        let client = H2ClientBuilder::new().build(io).unwrap();
        (client, server)
    }

    /// Read the preface, exchange SETTINGS and wait until the client has
    /// applied ours
    pub async fn handshake(&mut self, settings: Settings) {
        let mut preface = [0u8; 24];
        self.io.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        self.send(FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)))
            .await;
        loop {
            let frame = self.read_frame().await.expect("client hung up during handshake");
            if frame.frame_type == Some(FrameType::Settings) {
                if frame.flags.is_ack() {
                    return;
                }
                self.send(FrameCodec::encode_settings_frame(&SettingsFrame::ack()))
                    .await;
            }
        }
    }

    /// Next frame from the client, `None` once it closed the transport
    ///
    /// Every frame also feeds request assembly, so requests whose frames
    /// arrive while a test reads raw frames are not lost.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.codec.next_frame().unwrap() {
                self.absorb(&frame);
                self.log.push(frame.clone());
                return Some(frame);
            }
            let n = self.io.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.codec.feed(&buf[..n]);
        }
    }

    /// Next complete request, `None` once the client closed the transport
    pub async fn next_request(&mut self) -> Option<Request> {
        loop {
            if let Some(request) = self.ready.pop_front() {
                return Some(request);
            }
            self.read_frame().await?;
        }
    }

    fn absorb(&mut self, frame: &Frame) {
        let stream_id = frame.stream_id;
        match frame.frame_type {
            Some(FrameType::Headers) => {
                let fragment = headers_fragment(frame.flags, frame.payload.clone()).unwrap();
                let request = self.partial.entry(stream_id).or_insert_with(|| Request {
                    stream_id,
                    ..Request::default()
                });
                request.block.extend_from_slice(&fragment);
                request.ended |= frame.flags.is_end_stream();
                if frame.flags.is_end_headers() {
                    self.decode_block(stream_id);
                }
            }
            Some(FrameType::Continuation) => {
                if let Some(request) = self.partial.get_mut(&stream_id) {
                    request.block.extend_from_slice(&frame.payload);
                }
                if frame.flags.is_end_headers() {
                    self.decode_block(stream_id);
                }
            }
            Some(FrameType::Data) => {
                if let Some(request) = self.partial.get_mut(&stream_id) {
                    request.body.extend_from_slice(&frame.payload);
                    request.ended |= frame.flags.is_end_stream();
                }
            }
            _ => return,
        }

        let complete = self
            .partial
            .get(&stream_id)
            .map_or(false, |r| r.headers_done && r.ended);
        if complete {
            if let Some(request) = self.partial.remove(&stream_id) {
                self.ready.push_back(request);
            }
        }
    }

    fn decode_block(&mut self, stream_id: StreamId) {
        if let Some(request) = self.partial.get_mut(&stream_id) {
            let block = request.block.split();
            request.headers = self
                .decoder
                .decode(&block)
                .unwrap()
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8(n).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect();
            request.headers_done = true;
        }
    }

    /// Answer a request: HEADERS, then one DATA frame if there is a body
    pub async fn respond(&mut self, stream_id: StreamId, status: u16, headers: &[(&str, &str)], body: &[u8]) {
        let bytes = self.encode_response(stream_id, status, headers, body);
        self.send(bytes).await;
    }

    /// Wire bytes of a complete response, for tests that batch frames into one write
    pub fn encode_response(&mut self, stream_id: StreamId, status: u16, headers: &[(&str, &str)], body: &[u8]) -> Bytes {
        let status = status.to_string();
        let mut fields: Vec<(&[u8], &[u8])> = vec![(&b":status"[..], status.as_bytes())];
        fields.extend(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        let block = self.encoder.encode(fields);

        let mut wire = BytesMut::new();
        let frame = HeadersFrame::new(stream_id, Bytes::from(block), body.is_empty(), true);
        wire.extend_from_slice(&FrameCodec::encode_headers_frame(&frame));
        if !body.is_empty() {
            let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(body), true);
            wire.extend_from_slice(&FrameCodec::encode_data_frame(&frame));
        }
        wire.freeze()
    }

    pub async fn send_settings(&mut self, settings: Settings) {
        self.send(FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)))
            .await;
    }

    pub async fn send_window_update(&mut self, stream_id: StreamId, increment: u32) {
        let frame = WindowUpdateFrame::new(stream_id, increment);
        self.send(FrameCodec::encode_window_update_frame(&frame)).await;
    }

    pub async fn send_reset(&mut self, stream_id: StreamId, code: ErrorCode) {
        let frame = RstStreamFrame::new(stream_id, code);
        self.send(FrameCodec::encode_rst_stream_frame(&frame)).await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode, debug_data: &'static [u8]) {
        let frame = GoawayFrame::new(last_stream_id, code, Bytes::from_static(debug_data));
        self.send(FrameCodec::encode_goaway_frame(&frame)).await;
    }

    pub async fn send(&mut self, bytes: Bytes) {
        self.io.write_all(&bytes).await.unwrap();
    }

    /// Frames of one type read so far
    pub fn logged(&self, frame_type: FrameType) -> Vec<&Frame> {
        self.log
            .iter()
            .filter(|f| f.frame_type == Some(frame_type))
            .collect()
    }
}

type Serve = Arc<dyn Fn(MockServer) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connects to a fresh [`MockServer`] task per attempt
pub struct DuplexConnector {
    attempts: Arc<AtomicUsize>,
    serve: Serve,
}

impl DuplexConnector {
    pub fn new<F>(serve: F) -> (Self, Arc<AtomicUsize>)
    where
        F: Fn(MockServer) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = DuplexConnector {
            attempts: attempts.clone(),
            serve: Arc::new(serve),
        };
        (connector, attempts)
    }
}

impl Connector for DuplexConnector {
    fn connect(&self) -> BoxFuture<'static, Result<H2Client, ConnectError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let serve = self.serve.clone();
        async move {
            // Long enough for concurrent callers to pile up behind this attempt
            tokio::time::sleep(Duration::from_millis(20)).await;
            let (io, server) = MockServer::pair();
            tokio::spawn(serve(server));
            Ok(H2ClientBuilder::new().build(io)?)
        }
        .boxed()
    }
}
