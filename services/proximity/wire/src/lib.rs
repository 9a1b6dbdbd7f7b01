//! Application payload framing and message encoding for proximity sessions.
//!
//! The transport already provides authenticated, encrypted, ordered delivery
//! of opaque payloads. This crate only gives those payloads a small header so
//! that chat text, profile snapshots and social-link messages can share one
//! channel, and so that foreign or damaged payloads are rejected cheaply.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | magic "PX" (2B)      | frame marker               |
//! +----------------------+----------------------------+
//! | u8 version           | WIRE_VERSION               |
//! +----------------------+----------------------------+
//! | u8 kind              | FrameKind                  |
//! +----------------------+----------------------------+
//! | u32 body_len         | big endian                 |
//! +----------------------+----------------------------+
//! | u32 body_crc         | CRC32 over body            |
//! +----------------------+----------------------------+
//! | body                 | UTF-8 text or CBOR         |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod message;

// Re-export main types
pub use error::WireError;
pub use frame::{Frame, DEFAULT_MAX_BODY_SIZE};
pub use header::{body_checksum, FrameHeader, FrameKind, HEADER_SIZE, WIRE_MAGIC, WIRE_VERSION};
pub use message::{AppMessage, LinkGrant, ProfileSnapshot, WireCoordinates, WireLink};
