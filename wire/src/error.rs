//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Datagram too short to contain a header
    #[error("truncated datagram")]
    Truncated,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Invalid CBOR metadata
    #[error("cbor meta invalid")]
    Meta,

    /// Checksum mismatch
    #[error("checksum mismatch")]
    Checksum,

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown message type
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown abort reason code
    #[error("unknown reason {0}")]
    Reason(u8),

    /// Malformed datagram structure
    #[error("malformed datagram")]
    Malformed,
}
