//! Fixed frame header for application payloads.
//!
//! Every payload handed to the transport starts with a 12-byte header so a
//! receiver can reject foreign or damaged data before looking at the body.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every frame
pub const WIRE_MAGIC: [u8; 2] = *b"PX";

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Frame kinds carried over a peer session
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// UTF-8 chat text
    Chat = 0x01,
    /// CBOR profile snapshot of the sender
    ProfileSnapshot = 0x02,
    /// Sender asks for the receiver's social links (empty body)
    LinkRequest = 0x03,
    /// Sender approved a link request; body carries the links
    LinkGrant = 0x04,
    /// Sender rejected a link request (empty body)
    LinkDeclined = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Chat),
            0x02 => Ok(FrameKind::ProfileSnapshot),
            0x03 => Ok(FrameKind::LinkRequest),
            0x04 => Ok(FrameKind::LinkGrant),
            0x05 => Ok(FrameKind::LinkDeclined),
            _ => Err(crate::WireError::Kind(value)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Frame kind
    pub kind: FrameKind,
    /// Body length in bytes
    pub body_len: u32,
    /// CRC32 over the body
    pub body_crc: u32,
}

impl FrameHeader {
    /// Build the header describing `body`
    pub fn for_body(kind: FrameKind, body: &[u8]) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
            body_len: body.len() as u32,
            body_crc: body_checksum(body),
        }
    }

    /// Encode the header into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&WIRE_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.body_len);
        buf.put_u32(self.body_crc);
    }

    /// Decode a header from the front of `buf`, advancing past it
    pub fn decode(buf: &mut &[u8]) -> Result<Self, crate::WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let mut magic = [0u8; 2];
        buf.copy_to_slice(&mut magic);
        if magic != WIRE_MAGIC {
            return Err(crate::WireError::Magic);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let kind = FrameKind::try_from(buf.get_u8())?;
        let body_len = buf.get_u32();
        let body_crc = buf.get_u32();

        Ok(Self {
            version,
            kind,
            body_len,
            body_crc,
        })
    }
}

/// CRC32 over a frame body
pub fn body_checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}
