//! Server-to-client framing.
//!
//! Every frame is `[u32 size][u32 type][payload]` in network byte order, where
//! `size` covers the type field and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the size and type fields
pub const FRAME_HEADER_LEN: usize = 8;

pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(FrameError::MalformedFrame(format!(
                "unknown frame type {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    pub fn response(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Response, payload)
    }

    pub fn ok() -> Self {
        Self::response(Bytes::from_static(OK))
    }

    pub fn heartbeat() -> Self {
        Self::response(Bytes::from_static(HEARTBEAT))
    }

    pub fn error(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Error, payload)
    }

    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Message, payload)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Response && self.payload.as_ref() == HEARTBEAT
    }

    /// Encode a single frame outside of a codec (used before a session exists)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        put_frame(self, &mut buf);
        buf.freeze()
    }
}

fn put_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
    dst.put_u32((frame.payload.len() + 4) as u32);
    dst.put_u32(frame.frame_type as u32);
    dst.extend_from_slice(&frame.payload);
}

/// Codec for [`Frame`]s.
///
/// The broker only encodes; decoding is used by clients and tests and rejects
/// frames whose declared size exceeds `max_frame_size`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(5 * 1024 * 1024 + 30)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the size without consuming it
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 4 {
            return Err(FrameError::MalformedFrame(format!(
                "frame size {} cannot hold a frame type",
                size
            )));
        }
        if size > self.max_frame_size {
            return Err(FrameError::MalformedFrame(format!(
                "frame size {} exceeds maximum {}",
                size, self.max_frame_size
            )));
        }

        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src.get_u32())?;
        let payload = src.split_to(size - 4).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::MalformedFrame(format!(
                "stream closed mid-frame with {} bytes buffered",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() + 4 > u32::MAX as usize {
            return Err(FrameError::MalformedFrame(format!(
                "payload of {} bytes does not fit a frame",
                item.payload.len()
            )));
        }
        put_frame(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let bytes = Frame::ok().to_bytes();
        assert_eq!(&bytes[..], &[0, 0, 0, 6, 0, 0, 0, 0, b'O', b'K']);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let encoded = Frame::error(Bytes::from_static(b"E_INVALID")).to_bytes();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[5..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(frame.payload, Bytes::from_static(b"E_INVALID"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_frame_type_from_wire() {
        assert_eq!(FrameType::try_from(0).unwrap(), FrameType::Response);
        assert_eq!(FrameType::try_from(1).unwrap(), FrameType::Error);
        assert_eq!(FrameType::try_from(2).unwrap(), FrameType::Message);
        assert!(matches!(
            FrameType::try_from(3),
            Err(FrameError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(7);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_eof_mid_frame_is_malformed() {
        let mut codec = FrameCodec::default();
        let encoded = Frame::heartbeat().to_bytes();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::MalformedFrame(_))
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_heartbeat_detection() {
        assert!(Frame::heartbeat().is_heartbeat());
        assert!(!Frame::ok().is_heartbeat());
    }
}
