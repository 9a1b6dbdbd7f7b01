//! Message framing for the wire protocol.
//!
//! The transport delivers whole payloads, so a frame is always decoded from
//! one complete buffer: header followed by exactly `body_len` bytes.

use crate::header::{body_checksum, FrameHeader, FrameKind, HEADER_SIZE};
use bytes::{Bytes, BytesMut};

/// Default maximum body size (1 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame body
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, body: Bytes) -> Self {
        Self { kind, body }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_body_size: usize) -> Result<Bytes, crate::WireError> {
        if self.body.len() > max_body_size {
            return Err(crate::WireError::Size(self.body.len()));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        FrameHeader::for_body(self.kind, &self.body).encode(&mut buf);
        buf.extend_from_slice(&self.body);

        Ok(buf.freeze())
    }

    /// Decode one frame occupying all of `payload`
    pub fn decode(payload: &[u8], max_body_size: usize) -> Result<Self, crate::WireError> {
        let mut cursor = payload;
        let header = FrameHeader::decode(&mut cursor)?;

        let declared = header.body_len as usize;
        if declared > max_body_size {
            return Err(crate::WireError::Size(declared));
        }
        if cursor.len() != declared {
            return Err(crate::WireError::Length {
                declared,
                actual: cursor.len(),
            });
        }
        if body_checksum(cursor) != header.body_crc {
            return Err(crate::WireError::Checksum);
        }

        Ok(Self {
            kind: header.kind,
            body: Bytes::copy_from_slice(cursor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::new(FrameKind::Chat, Bytes::from_static(b"hello there"));
        let bytes = frame.encode(DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 11);

        let decoded = Frame::decode(&bytes, DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_corrupted_body_detected() {
        let frame = Frame::new(FrameKind::Chat, Bytes::from_static(b"hello"));
        let mut bytes = frame.encode(DEFAULT_MAX_BODY_SIZE).unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert_eq!(
            Frame::decode(&bytes, DEFAULT_MAX_BODY_SIZE),
            Err(WireError::Checksum)
        );
    }

    #[test]
    fn test_truncated_frame() {
        let frame = Frame::new(FrameKind::Chat, Bytes::from_static(b"hello"));
        let bytes = frame.encode(DEFAULT_MAX_BODY_SIZE).unwrap();

        assert_eq!(
            Frame::decode(&bytes[..bytes.len() - 2], DEFAULT_MAX_BODY_SIZE),
            Err(WireError::Length {
                declared: 5,
                actual: 3
            })
        );
        assert_eq!(
            Frame::decode(&bytes[..4], DEFAULT_MAX_BODY_SIZE),
            Err(WireError::Incomplete)
        );
    }

    #[test]
    fn test_size_limit() {
        let frame = Frame::new(FrameKind::Chat, Bytes::from(vec![b'a'; 64]));
        assert_eq!(frame.encode(32), Err(WireError::Size(64)));

        let bytes = frame.encode(DEFAULT_MAX_BODY_SIZE).unwrap();
        assert_eq!(Frame::decode(&bytes, 32), Err(WireError::Size(64)));
    }

    #[test]
    fn test_plain_text_is_not_a_frame() {
        assert_eq!(
            Frame::decode(b"just some text", DEFAULT_MAX_BODY_SIZE),
            Err(WireError::Magic)
        );
    }
}
