//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the fixed header
    #[error("incomplete frame")]
    Incomplete,

    /// Payload does not start with the frame magic
    #[error("bad magic")]
    Magic,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown frame kind
    #[error("unknown kind {0}")]
    Kind(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Declared body length disagrees with the bytes received
    #[error("length mismatch: declared {declared}, actual {actual}")]
    Length {
        /// Length written in the header
        declared: usize,
        /// Bytes that followed the header
        actual: usize,
    },

    /// Body checksum mismatch
    #[error("body checksum mismatch")]
    Checksum,

    /// Chat body is not valid UTF-8
    #[error("chat body is not valid utf-8")]
    Utf8,

    /// CBOR body could not be encoded or decoded
    #[error("cbor body invalid: {0}")]
    Cbor(String),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
