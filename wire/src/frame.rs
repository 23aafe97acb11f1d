//! Datagram framing for the wire protocol.
//!
//! One encoded `Frame` is exactly one transport datagram: fixed header,
//! CBOR metadata, then the payload. There is no length prefix; the datagram
//! boundary is the frame boundary.

use crate::codec::MetaBuilder;
use crate::header::{crc32_body, AbortReason, Flags, Header, MessageType, HEADER_SIZE};
use bytes::{Bytes, BytesMut};

/// Maximum datagram size accepted by the decoder (64 KiB)
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Maximum metadata size (4 KiB)
pub const MAX_META_SIZE: usize = 4 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header (28 bytes)
    pub head: Header,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Payload bytes (block data for Data, empty otherwise)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(head: Header, meta_raw: Bytes, payload: Bytes) -> Self {
        Self {
            head,
            meta_raw,
            payload,
        }
    }

    /// Total size of the frame when encoded
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.meta_raw.len() + self.payload.len()
    }

    /// Encode the frame into one datagram, filling in meta length and checksum
    pub fn encode(mut self, max_datagram: usize) -> Result<Bytes, crate::WireError> {
        if self.meta_raw.len() > MAX_META_SIZE {
            return Err(crate::WireError::Size(self.meta_raw.len()));
        }

        let total = self.encoded_size();
        if total > max_datagram {
            return Err(crate::WireError::Size(total));
        }

        self.head.meta_len = self.meta_raw.len() as u16;
        self.head.csum = crc32_body(&self.meta_raw, &self.payload);

        let mut buf = BytesMut::with_capacity(total);
        self.head.encode(&mut buf);
        buf.extend_from_slice(&self.meta_raw);
        buf.extend_from_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode one datagram into a frame, verifying the checksum
    pub fn decode(mut datagram: Bytes) -> Result<Frame, crate::WireError> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(crate::WireError::Size(datagram.len()));
        }

        let head = Header::decode(&mut datagram)?;

        let meta_len = head.meta_len as usize;
        if meta_len > MAX_META_SIZE {
            return Err(crate::WireError::Meta);
        }
        if datagram.len() < meta_len {
            return Err(crate::WireError::Malformed);
        }

        let meta_raw = datagram.split_to(meta_len);
        let payload = datagram;

        if crc32_body(&meta_raw, &payload) != head.csum {
            return Err(crate::WireError::Checksum);
        }

        Ok(Frame {
            head,
            meta_raw,
            payload,
        })
    }
}

/// Frame builder for constructing wire datagrams
#[derive(Debug)]
pub struct FrameBuilder {
    head: Header,
    meta: MetaBuilder,
    payload: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(head: Header) -> Self {
        Self {
            head,
            meta: MetaBuilder::new(),
            payload: Bytes::new(),
        }
    }

    /// Set datagram flags
    pub fn flags(mut self, flags: Flags) -> Self {
        self.head.flags = flags;
        self
    }

    /// Set the abort reason
    pub fn reason(mut self, reason: AbortReason) -> Self {
        self.head.reason = reason;
        self
    }

    /// Insert u32 metadata
    pub fn meta_insert_u32(mut self, key: &str, value: u32) -> Self {
        self.meta = self.meta.insert_u32(key, value);
        self
    }

    /// Insert u64 metadata
    pub fn meta_insert_u64(mut self, key: &str, value: u64) -> Self {
        self.meta = self.meta.insert_u64(key, value);
        self
    }

    /// Insert binary metadata
    pub fn meta_insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.meta = self.meta.insert_bytes(key, value);
        self
    }

    /// Insert the explicitly-set fields of a parameter set
    pub fn meta_params(mut self, params: &crate::TransferParams) -> Self {
        self.meta = params.write_meta(self.meta);
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build the encoded datagram
    pub fn build(self, max_datagram: usize) -> Result<Bytes, crate::CodecError> {
        let meta_raw = self.meta.build()?;
        let frame = Frame::new(self.head, meta_raw, self.payload);
        frame.encode(max_datagram).map_err(crate::CodecError::Wire)
    }
}

/// Convenience check used by dispatchers before full decode
pub fn peek_session(datagram: &[u8]) -> Option<u64> {
    // session id sits at offset 8 in the fixed header
    if datagram.len() < HEADER_SIZE {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&datagram[8..16]);
    Some(u64::from_be_bytes(id))
}
