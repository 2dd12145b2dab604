//! HTTP/2 frame encoding and decoding
//!
//! Encoding is a set of free-standing functions producing complete frames.
//! Decoding is incremental: bytes are fed as they arrive off the transport
//! and whole frames are pulled out once their payload is buffered.

use super::error::{Error, Result};
use super::frames::*;
use super::stream::StreamId;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
pub struct FrameCodec {
    /// Bytes received but not yet consumed as frames
    read_buffer: BytesMut,
    /// Largest payload we accept (our advertised SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec accepting frames up to the RFC default size
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    /// Change the largest accepted payload
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size.min(MAX_FRAME_SIZE);
    }

    /// Encode a frame header into a buffer
    pub fn encode_header(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        let stream_id = stream_id & 0x7FFFFFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header from bytes
    ///
    /// The type is `None` for extension frame types, which callers ignore.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (Option<FrameType>, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16)
            | ((bytes[1] as usize) << 8)
            | (bytes[2] as usize);

        let frame_type = FrameType::from_u8(bytes[3]);
        let flags = FrameFlags::from_u8(bytes[4]);

        // Stream ID (31 bits, ignore reserved bit)
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        (frame_type, flags, stream_id, length)
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.data.len());

        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let header = Self::encode_header(FrameType::Data, flags, frame.stream_id, frame.data.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());

        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let header = Self::encode_header(FrameType::Headers, flags, frame.stream_id, frame.header_block.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(frame: &ContinuationFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.header_block.len());

        let flags = if frame.end_headers {
            FrameFlags::from_u8(FrameFlags::END_HEADERS)
        } else {
            FrameFlags::empty()
        };

        let header = Self::encode_header(FrameType::Continuation, flags, frame.stream_id, frame.header_block.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.header_block);

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut buf = BytesMut::new();

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut settings_data = BytesMut::new();
        if !frame.ack {
            frame.settings.encode(&mut settings_data);
        }

        // Stream ID must be 0 for SETTINGS
        let header = Self::encode_header(FrameType::Settings, flags, 0, settings_data.len());
        buf.put_slice(&header);
        buf.put_slice(&settings_data);

        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);

        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let header = Self::encode_header(FrameType::Ping, flags, 0, 8);
        buf.put_slice(&header);
        buf.put_slice(&frame.data);

        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut buf = BytesMut::new();

        // 4 bytes last stream ID + 4 bytes error code + debug data
        let payload_len = 8 + frame.debug_data.len();

        let header = Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_slice(&header);
        buf.put_u32(frame.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(frame.error_code);
        buf.put_slice(&frame.debug_data);

        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);

        // Reserved bit must be 0
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);

        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);

        let header = Self::encode_header(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_slice(&header);
        buf.put_u32(frame.error_code);

        buf.freeze()
    }

    /// Append received bytes to the read buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Take the next complete frame out of the read buffer
    ///
    /// Returns `Ok(None)` until a full frame has been fed. A payload larger
    /// than the accepted maximum is a connection error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.read_buffer[..FRAME_HEADER_SIZE]);
        let (frame_type, flags, stream_id, payload_len) = Self::decode_header(&header);

        if payload_len > self.max_frame_size {
            return Err(Error::FrameSize(format!(
                "Frame payload too large: {} > {}",
                payload_len, self.max_frame_size
            )));
        }

        if self.read_buffer.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove the pad length octet and trailing padding from a PADDED payload
pub fn strip_padding(flags: FrameFlags, mut payload: Bytes) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(Error::Protocol("Padded frame without pad length".to_string()));
    }
    let pad_len = payload[0] as usize;
    payload.advance(1);
    if pad_len > payload.len() {
        return Err(Error::Protocol(format!(
            "Padding length {} exceeds payload length {}",
            pad_len,
            payload.len()
        )));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// Header block fragment of a HEADERS payload, with padding and priority removed
pub fn headers_fragment(flags: FrameFlags, payload: Bytes) -> Result<Bytes> {
    let mut fragment = strip_padding(flags, payload)?;
    if flags.is_priority() {
        if fragment.len() < 5 {
            return Err(Error::FrameSize("HEADERS priority block truncated".to_string()));
        }
        fragment.advance(5);
    }
    Ok(fragment)
}

/// Decode a RST_STREAM payload
pub fn decode_rst_stream(stream_id: StreamId, payload: &[u8]) -> Result<RstStreamFrame> {
    if payload.len() != 4 {
        return Err(Error::FrameSize(format!("RST_STREAM payload length {}", payload.len())));
    }
    Ok(RstStreamFrame {
        stream_id,
        error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
    })
}

/// Decode a GOAWAY payload
pub fn decode_goaway(mut payload: Bytes) -> Result<GoawayFrame> {
    if payload.len() < 8 {
        return Err(Error::FrameSize(format!("GOAWAY payload length {}", payload.len())));
    }
    let last_stream_id = payload.get_u32() & 0x7FFFFFFF;
    let error_code = payload.get_u32();
    Ok(GoawayFrame {
        last_stream_id,
        error_code,
        debug_data: payload,
    })
}

/// Decode a WINDOW_UPDATE payload
pub fn decode_window_update(stream_id: StreamId, payload: &[u8]) -> Result<WindowUpdateFrame> {
    if payload.len() != 4 {
        return Err(Error::FrameSize(format!("WINDOW_UPDATE payload length {}", payload.len())));
    }
    let size_increment = u32::from_be_bytes([payload[0] & 0x7F, payload[1], payload[2], payload[3]]);
    Ok(WindowUpdateFrame::new(stream_id, size_increment))
}

/// Decode a PING payload
pub fn decode_ping(flags: FrameFlags, payload: &[u8]) -> Result<PingFrame> {
    let data: [u8; 8] = payload
        .try_into()
        .map_err(|_| Error::FrameSize(format!("PING payload length {}", payload.len())))?;
    Ok(PingFrame {
        ack: flags.is_ack(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    #[test]
    fn test_encode_decode_header() {
        let frame_type = FrameType::Headers;
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);

        let header = FrameCodec::encode_header(frame_type, flags, 42, 1234);
        let (decoded_type, decoded_flags, decoded_id, decoded_len) = FrameCodec::decode_header(&header);

        assert_eq!(decoded_type, Some(frame_type));
        assert_eq!(decoded_flags, flags);
        assert_eq!(decoded_id, 42);
        assert_eq!(decoded_len, 1234);
    }

    #[test]
    fn test_decode_header_unknown_type() {
        let header = [0, 0, 0, 0xfa, 0, 0, 0, 0, 1];
        let (frame_type, _, stream_id, _) = FrameCodec::decode_header(&header);
        assert_eq!(frame_type, None);
        assert_eq!(stream_id, 1);
    }

    #[test]
    fn test_encode_data_frame() {
        let frame = DataFrame::new(1, Bytes::from("Hello"), true);
        let encoded = FrameCodec::encode_data_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 5]);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[5..9], &[0, 0, 0, 1]);
        assert_eq!(&encoded[9..], b"Hello");
    }

    #[test]
    fn test_encode_settings_frame() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();

        let encoded = FrameCodec::encode_settings_frame(&SettingsFrame::new(settings));

        assert_eq!(encoded[3], FrameType::Settings.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]);
        // 3 settings * 6 bytes
        assert_eq!(encoded[0..3], [0, 0, 18]);
    }

    #[test]
    fn test_encode_settings_ack() {
        let encoded = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
        assert_eq!(encoded[0..3], [0, 0, 0]);
        assert_eq!(encoded[4], FrameFlags::ACK);
    }

    #[test]
    fn test_encode_window_update() {
        let encoded = FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(42, 1000));

        assert_eq!(encoded[0..3], [0, 0, 4]);
        assert_eq!(encoded[3], FrameType::WindowUpdate.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 42]);

        let increment = u32::from_be_bytes([encoded[9], encoded[10], encoded[11], encoded[12]]);
        assert_eq!(increment, 1000);
    }

    #[test]
    fn test_incremental_decode() {
        let ping = FrameCodec::encode_ping_frame(&PingFrame::new([1, 2, 3, 4, 5, 6, 7, 8]));
        let data = FrameCodec::encode_data_frame(&DataFrame::new(3, Bytes::from("body"), true));

        let mut codec = FrameCodec::new();
        codec.feed(&ping[..5]);
        assert!(codec.next_frame().unwrap().is_none());

        codec.feed(&ping[5..]);
        codec.feed(&data[..10]);

        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.frame_type, Some(FrameType::Ping));
        assert_eq!(frame.stream_id, 0);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(codec.next_frame().unwrap().is_none());

        codec.feed(&data[10..]);
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.frame_type, Some(FrameType::Data));
        assert!(frame.flags.is_end_stream());
        assert_eq!(&frame.payload[..], b"body");
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let header = FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 1, 16385);
        codec.feed(&header);
        assert!(matches!(codec.next_frame(), Err(Error::FrameSize(_))));
    }

    #[test]
    fn test_strip_padding_and_priority() {
        // pad length 2, priority block, fragment "ab", 2 bytes padding
        let payload = Bytes::from_static(&[2, 0, 0, 0, 0, 16, b'a', b'b', 0, 0]);
        let flags = FrameFlags::from_u8(FrameFlags::PADDED | FrameFlags::PRIORITY);
        assert_eq!(&headers_fragment(flags, payload).unwrap()[..], b"ab");

        let bad = Bytes::from_static(&[9, b'x']);
        assert!(strip_padding(FrameFlags::from_u8(FrameFlags::PADDED), bad).is_err());
    }

    #[test]
    fn test_decode_control_payloads() {
        let goaway = FrameCodec::encode_goaway_frame(&GoawayFrame {
            last_stream_id: 9,
            error_code: 0xb,
            debug_data: Bytes::from_static(b"calm"),
        });
        let decoded = decode_goaway(goaway.slice(FRAME_HEADER_SIZE..)).unwrap();
        assert_eq!(decoded.last_stream_id, 9);
        assert_eq!(decoded.error_code, 0xb);
        assert_eq!(&decoded.debug_data[..], b"calm");

        let rst = decode_rst_stream(5, &[0, 0, 0, 8]).unwrap();
        assert_eq!(rst.error_code, 8);
        assert!(decode_rst_stream(5, &[0, 0, 8]).is_err());

        let update = decode_window_update(0, &[0x80, 0, 0x01, 0]).unwrap();
        assert_eq!(update.size_increment, 256);

        assert!(decode_ping(FrameFlags::empty(), &[0; 7]).is_err());
        assert!(decode_ping(FrameFlags::from_u8(FrameFlags::ACK), &[0; 8]).unwrap().ack);
    }
}
