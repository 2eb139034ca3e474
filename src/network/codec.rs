//! Newline-delimited framing
//!
//! Peers exchange one JSON envelope per line. Reads may split a frame across
//! chunks or carry several frames at once, so bytes are accumulated in a
//! per-peer buffer and complete lines are cut off the front.
//!
//! Frames are handed on as raw bytes. Text validation belongs to the JSON
//! decoder, which rejects invalid UTF-8 instead of patching it.

use crate::network::peer::PeerError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame delimiter
pub const FRAME_DELIMITER: u8 = b'\n';

/// Default cap on a peer's unterminated frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Line codec for gossip frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
    /// Bytes already scanned without finding a delimiter
    next_index: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            next_index: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let scanned = self.next_index.min(src.len());
            let Some(offset) = src[scanned..].iter().position(|b| *b == FRAME_DELIMITER) else {
                if src.len() > self.max_frame_len {
                    return Err(PeerError::FrameTooLong {
                        len: src.len(),
                        max: self.max_frame_len,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            self.next_index = 0;
            let mut line = src.split_to(scanned + offset + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            // Blank lines carry nothing
            if line.is_empty() {
                continue;
            }

            return Ok(Some(line.freeze()));
        }
    }
}

impl Encoder<&str> for FrameCodec {
    type Error = PeerError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":");
        assert!(drain(&mut codec, &mut buf).is_empty());

        buf.extend_from_slice(b"\"X\"}\n{\"ty");
        assert_eq!(drain(&mut codec, &mut buf), vec![&b"{\"type\":\"X\"}"[..]]);
        assert_eq!(&buf[..], b"{\"ty");
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"a\nb\r\n\nc"[..]);

        assert_eq!(drain(&mut codec, &mut buf), vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(&buf[..], b"c");
    }

    #[test]
    fn test_invalid_utf8_passes_through_untouched() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"[\"A\xff\"]\n"[..]);

        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames, vec![&b"[\"A\xff\"]"[..]]);
        assert!(serde_json::from_slice::<Vec<String>>(&frames[0]).is_err());
    }

    #[test]
    fn test_frame_too_long() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&b"abcd"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"e");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PeerError::FrameTooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_encode_appends_delimiter() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("X", &mut buf).unwrap();
        assert_eq!(&buf[..], b"X\n");
    }
}
