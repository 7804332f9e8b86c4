//! Binary multiplexing frames
//!
//! After the `BINARY` verb, the stream carries nothing but frames:
//! `type(1) | channel_id(2) | payload_len(2)` big-endian, then the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload a single frame may carry (the length field is u16)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Frame header size: type(1) + channel_id(2) + payload_len(2)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Read size for socket-to-frame copies, well under the frame limit
pub const CHUNK_SIZE: usize = 32768;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Channel payload bytes
    Data = 0x01,
    /// Relay asks the server to dial a target
    Connect = 0x02,
    /// Target dialed successfully
    ConnectOk = 0x03,
    /// Target unreachable; payload is a diagnostic string
    ConnectFail = 0x04,
    /// Tear down a channel
    Close = 0x05,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Connect),
            0x03 => Some(Self::ConnectOk),
            0x04 => Some(Self::ConnectFail),
            0x05 => Some(Self::Close),
            _ => None,
        }
    }
}

/// One unit of transmission in binary mode
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, channel_id: u16, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            frame_type,
            channel_id,
            payload,
        }
    }

    pub fn data(channel_id: u16, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, channel_id, payload)
    }

    /// CONNECT with payload `host_len(1) | host | port(2)`
    pub fn connect(channel_id: u16, host: &str, port: u16) -> Self {
        let host = host.as_bytes();
        debug_assert!(host.len() <= u8::MAX as usize);
        let mut payload = BytesMut::with_capacity(1 + host.len() + 2);
        payload.put_u8(host.len() as u8);
        payload.extend_from_slice(host);
        payload.put_u16(port);
        Self::new(FrameType::Connect, channel_id, payload.freeze())
    }

    pub fn connect_ok(channel_id: u16) -> Self {
        Self::new(FrameType::ConnectOk, channel_id, Bytes::new())
    }

    pub fn connect_fail(channel_id: u16, reason: &[u8]) -> Self {
        Self::new(FrameType::ConnectFail, channel_id, Bytes::copy_from_slice(reason))
    }

    pub fn close(channel_id: u16) -> Self {
        Self::new(FrameType::Close, channel_id, Bytes::new())
    }

    /// Serialize header + payload
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.channel_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Extract (host, port) from a CONNECT payload.
    ///
    /// Returns `None` for anything but a well-formed payload with no
    /// trailing bytes.
    pub fn parse_connect(&self) -> Option<(String, u16)> {
        if self.frame_type != FrameType::Connect {
            return None;
        }
        let buf = &self.payload[..];
        if buf.is_empty() {
            return None;
        }
        let host_len = buf[0] as usize;
        if buf.len() != 1 + host_len + 2 {
            return None;
        }
        let host = std::str::from_utf8(&buf[1..1 + host_len]).ok()?.to_string();
        let port = u16::from_be_bytes([buf[1 + host_len], buf[2 + host_len]]);
        Some((host, port))
    }
}

/// Streaming codec for binary mode.
///
/// Frames with an unrecognized type code are consumed and dropped, so newer
/// peers can emit types this side does not know about.
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds 65535 bytes",
            ));
        }
        dst.extend_from_slice(&item.serialize());
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let payload_len = u16::from_be_bytes([src[3], src[4]]) as usize;
            let total_len = FRAME_HEADER_SIZE + payload_len;
            if src.len() < total_len {
                src.reserve(total_len - src.len());
                return Ok(None);
            }

            let Some(frame_type) = FrameType::from_u8(src[0]) else {
                // Unknown type: skip the whole frame and keep parsing
                src.advance(total_len);
                continue;
            };

            let mut buf = src.split_to(total_len);
            buf.advance(1);
            let channel_id = buf.get_u16();
            buf.advance(2);

            return Ok(Some(Frame {
                frame_type,
                channel_id,
                payload: buf.freeze(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn roundtrip_recovers_the_triple() {
        let frame = Frame::connect(42, "example.com", 443);
        let mut buf = BytesMut::from(&frame.serialize()[..]);

        let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Connect);
        assert_eq!(decoded.channel_id, 42);
        let (host, port) = decoded.parse_connect().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_and_payload_wait_for_more() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0x01u8, 0x00, 0x01, 0x00, 0x05][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"hello");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.channel_id, 1);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn arbitrary_split_points_deliver_the_same_frames() {
        let frames = vec![
            Frame::connect(1, "127.0.0.1", 9999),
            Frame::connect_ok(1),
            Frame::data(1, &b"HELLO"[..]),
            Frame::data(2, Bytes::from(vec![0u8; 4000])),
            Frame::close(1),
        ];
        let mut wire = BytesMut::new();
        for f in &frames {
            wire.extend_from_slice(&f.serialize());
        }

        for chunk_size in [1usize, 3, 5, 7, 11, 64, 4096] {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                got.extend(decode_all(&mut codec, &mut buf));
            }
            assert_eq!(got.len(), frames.len(), "chunk size {chunk_size}");
            for (a, b) in got.iter().zip(&frames) {
                assert_eq!(a.frame_type, b.frame_type);
                assert_eq!(a.channel_id, b.channel_id);
                assert_eq!(a.payload, b.payload);
            }
        }
    }

    #[test]
    fn unknown_frame_types_are_skipped() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&Frame::data(7, &b"a"[..]).serialize());
        // Fabricated type 0x7f with a 3-byte payload
        wire.extend_from_slice(&[0x7f, 0x00, 0x09, 0x00, 0x03, 1, 2, 3]);
        wire.extend_from_slice(&Frame::close(7).serialize());

        let mut codec = FrameCodec;
        let got = decode_all(&mut codec, &mut wire);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].frame_type, FrameType::Data);
        assert_eq!(got[1].frame_type, FrameType::Close);
    }

    #[test]
    fn connect_payload_rejects_trailing_or_truncated_bytes() {
        let good = Frame::connect(1, "host", 80);
        assert!(good.parse_connect().is_some());

        let mut trailing = BytesMut::from(&good.payload[..]);
        trailing.put_u8(0);
        let bad = Frame::new(FrameType::Connect, 1, trailing.freeze());
        assert!(bad.parse_connect().is_none());

        let truncated = Frame::new(FrameType::Connect, 1, good.payload.slice(..good.payload.len() - 1));
        assert!(truncated.parse_connect().is_none());

        let empty = Frame::new(FrameType::Connect, 1, Bytes::new());
        assert!(empty.parse_connect().is_none());
    }
}
