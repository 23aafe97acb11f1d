//! Wire protocol framing, fixed headers, CBOR metadata, and block
//! segmentation for lot.
//!
//! This crate provides the control-plane encoding for the large object
//! transfer protocol: one encoded frame per transport datagram, a fixed
//! header for cheap dispatch, and a canonical CBOR map for optional fields
//! such as negotiation parameters and selective-ack bitmaps.
//!
//! ## Wire format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Fixed Header (28B)   | type, flags, session, seq  |
//! +----------------------+----------------------------+
//! | meta_bytes           | canonical CBOR map         |
//! +----------------------+----------------------------+
//! | payload              | block data (Data only)     |
//! +----------------------+----------------------------+
//! ```
//!
//! The header carries a CRC32 over metadata and payload; a datagram that
//! fails the checksum is dropped by the decoder.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod params;

// Re-export main types
pub use block::{Reassembler, Segmenter};
pub use codec::{get_meta_bytes, get_meta_u32, get_meta_u64, parse_meta, CodecError, MetaBuilder};
pub use error::WireError;
pub use frame::{peek_session, Frame, FrameBuilder, MAX_DATAGRAM_SIZE, MAX_META_SIZE};
pub use header::{
    crc32_body, AbortReason, Flags, Header, MessageType, HEADER_SIZE, WIRE_VERSION,
};
pub use params::{
    TransferParams, DEFAULT_BLOCK_SIZE, DEFAULT_INACTIVITY_TIMEOUT_MS, DEFAULT_NUM_RETRANSMISSION,
    DEFAULT_TIMEOUT_MS, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
