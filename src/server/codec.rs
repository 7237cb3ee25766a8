//! Length-prefixed UTF-8 framing
//!
//! Each message on the wire is a 2-byte big-endian byte count followed by
//! that many bytes of UTF-8 text:
//!
//! ```text
//! +--------+--------+-------------------------+
//! | len hi | len lo |  len bytes of UTF-8 ... |
//! +--------+--------+-------------------------+
//! ```
//!
//! This is the framing the device clients write with their `writeUTF` style
//! stream helpers, so it has to stay bit-exact.

use super::error::ServerError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix
const LENGTH_PREFIX: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete, valid UTF-8 message
    Text(String),
    /// A complete frame whose payload was not valid UTF-8
    ///
    /// The frame has been consumed from the stream, so reading can continue
    /// with the next one.
    Malformed(std::str::Utf8Error),
}

/// `tokio_util::codec` implementation of the 2-byte length framing
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8FrameCodec;

impl Decoder for Utf8FrameCodec {
    type Item = Frame;
    type Error = ServerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(len);

        match std::str::from_utf8(&payload) {
            Ok(text) => Ok(Some(Frame::Text(text.to_owned()))),
            Err(e) => Ok(Some(Frame::Malformed(e))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ServerError::TruncatedFrame(src.len())),
        }
    }
}

impl Encoder<&str> for Utf8FrameCodec {
    type Error = ServerError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        if len > MAX_FRAME_LEN {
            return Err(ServerError::FrameTooLong(len));
        }

        dst.reserve(LENGTH_PREFIX + len);
        dst.put_u16(len as u16);
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

impl Encoder<String> for Utf8FrameCodec {
    type Error = ServerError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&str>::encode(self, item.as_str(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        Utf8FrameCodec.encode(text, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_wire_layout() {
        let buf = encode("hi");
        assert_eq!(&buf[..], &[0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_round_trip_multibyte() {
        let text = r#"{"id":"AA:BB:CC","note":"café ✓ 🚲"}"#;
        let mut buf = encode(text);
        let frame = Utf8FrameCodec.decode(&mut buf).unwrap();
        assert_eq!(frame, Some(Frame::Text(text.to_string())));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_message() {
        let mut buf = encode("");
        assert_eq!(&buf[..], &[0x00, 0x00]);
        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text(String::new()))
        );
    }

    #[test]
    fn test_max_length_boundary() {
        let text = "x".repeat(MAX_FRAME_LEN);
        let mut buf = encode(&text);
        assert_eq!(&buf[..2], &[0xFF, 0xFF]);
        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text(text))
        );

        let too_long = "x".repeat(MAX_FRAME_LEN + 1);
        let mut out = BytesMut::new();
        let err = Utf8FrameCodec.encode(too_long.as_str(), &mut out).unwrap_err();
        assert!(matches!(err, ServerError::FrameTooLong(65536)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let full = encode("hello");
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&full[..1]);
        assert_eq!(Utf8FrameCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[1..4]);
        assert_eq!(Utf8FrameCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&full[4..]);
        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text("hello".to_string()))
        );
    }

    #[test]
    fn test_back_to_back_frames_keep_order() {
        let mut buf = encode("first");
        buf.extend_from_slice(&encode("second"));

        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text("first".to_string()))
        );
        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text("second".to_string()))
        );
        assert_eq!(Utf8FrameCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_eof_inside_frame_is_truncation() {
        let full = encode("hello");
        let mut buf = BytesMut::from(&full[..4]);
        let err = Utf8FrameCodec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ServerError::TruncatedFrame(4)));

        let mut buf = encode("bye");
        assert_eq!(
            Utf8FrameCodec.decode_eof(&mut buf).unwrap(),
            Some(Frame::Text("bye".to_string()))
        );
        assert_eq!(Utf8FrameCodec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8_is_consumed_and_reported() {
        let mut buf = BytesMut::from(&[0x00, 0x02, 0xC3, 0x28][..]);
        buf.extend_from_slice(&encode("ok"));

        let frame = Utf8FrameCodec.decode(&mut buf).unwrap();
        assert!(matches!(frame, Some(Frame::Malformed(_))));

        assert_eq!(
            Utf8FrameCodec.decode(&mut buf).unwrap(),
            Some(Frame::Text("ok".to_string()))
        );
    }
}
