//! Fixed header processing for the wire protocol.
//!
//! This module defines the 28-byte header that prefixes every datagram and
//! lets the dispatcher route on session id and message type without parsing
//! the metadata or payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 28;

/// Message types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Data datagram carrying one block
    Data = 0x00,
    /// Acknowledgment with cumulative base and selective bitmap
    Ack = 0x01,
    /// Session announcement carrying object size and proposed params
    Announce = 0x02,
    /// Live update of the mutable parameter subset
    ParamsUpdate = 0x03,
    /// Session abort notification
    Abort = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Data),
            0x01 => Ok(MessageType::Ack),
            0x02 => Ok(MessageType::Announce),
            0x03 => Ok(MessageType::ParamsUpdate),
            0x04 => Ok(MessageType::Abort),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Datagram flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Announce echoes the negotiated result back to the initiator
        const ECHO = 1 << 0;
        /// Announce restarts a previously failed session
        const RESUME = 1 << 1;
    }
}

/// Abort reason codes carried in the header `reason` field
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// No reason (non-Abort datagrams)
    None = 0,
    /// Application requested the abort
    Application = 1,
    /// Protocol violation detected by the peer
    Protocol = 2,
    /// Peer ran out of resources for window/block bookkeeping
    ResourceExhausted = 3,
}

impl TryFrom<u8> for AbortReason {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AbortReason::None),
            1 => Ok(AbortReason::Application),
            2 => Ok(AbortReason::Protocol),
            3 => Ok(AbortReason::ResourceExhausted),
            _ => Err(crate::WireError::Reason(value)),
        }
    }
}

/// Fixed header structure (28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Message type
    pub typ: MessageType,
    /// Datagram flags
    pub flags: Flags,
    /// Abort reason (zero for every other type)
    pub reason: AbortReason,
    /// Reserved field (must be zero)
    pub reserved0: u8,
    /// Metadata length in bytes
    pub meta_len: u16,
    /// Session identifier shared by both endpoints
    pub session: u64,
    /// Block sequence for Data, cumulative base for Ack, 0 otherwise
    pub seq: u64,
    /// CRC32 over metadata and payload
    pub csum: u32,
}

impl Header {
    /// Create a new header with default values
    pub fn new(typ: MessageType, session: u64, seq: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            reason: AbortReason::None,
            reserved0: 0,
            meta_len: 0,
            session,
            seq,
            csum: 0,
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.reason as u8);
        buf.put_u8(self.reserved0);
        buf.put_u16(self.meta_len);
        buf.put_u64(self.session);
        buf.put_u64(self.seq);
        buf.put_u32(self.csum);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = MessageType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::Reserved)?;
        let reason = AbortReason::try_from(buf.get_u8())?;
        let reserved0 = buf.get_u8();

        if reserved0 != 0 {
            return Err(crate::WireError::Reserved);
        }

        let meta_len = buf.get_u16();
        let session = buf.get_u64();
        let seq = buf.get_u64();
        let csum = buf.get_u32();

        Ok(Self {
            ver,
            typ,
            flags,
            reason,
            reserved0,
            meta_len,
            session,
            seq,
            csum,
        })
    }
}

/// Calculate the CRC32 checksum over metadata and payload
pub fn crc32_body(meta_raw: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(meta_raw);
    hasher.update(payload);
    hasher.finalize()
}
