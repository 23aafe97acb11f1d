//! Block segmentation and reassembly for large objects.
//!
//! This module maps a flat object buffer to and from a sequence of fixed-size
//! blocks addressed by offset. The engine never copies payload on the sender
//! side; blocks are refcounted slices of the object buffer.

use bytes::{Bytes, BytesMut};

/// Segmenter for splitting an object buffer into blocks
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    block_size: usize,
}

impl Segmenter {
    /// Create a segmenter with the given block size (must be nonzero)
    pub fn new(block_size: u32) -> Self {
        debug_assert!(block_size > 0);
        Self {
            block_size: block_size as usize,
        }
    }

    /// Number of blocks the object splits into (last block may be short)
    pub fn block_count(&self, object_size: usize) -> u64 {
        ((object_size + self.block_size - 1) / self.block_size) as u64
    }

    /// Byte offset of the block with the given sequence number
    pub fn offset(&self, seq: u64) -> u64 {
        seq * self.block_size as u64
    }

    /// Payload slice for one block; `None` when seq is past the object end
    pub fn slice(&self, object: &Bytes, seq: u64) -> Option<Bytes> {
        let start = (seq as usize).checked_mul(self.block_size)?;
        if start >= object.len() {
            return None;
        }
        let end = (start + self.block_size).min(object.len());
        Some(object.slice(start..end))
    }
}

/// Reassembler that places received blocks into a caller-provided buffer
#[derive(Debug)]
pub struct Reassembler {
    buf: BytesMut,
    object_size: usize,
    block_size: usize,
}

impl Reassembler {
    /// Wrap a destination buffer; returns `None` when it cannot hold the object
    pub fn new(mut buf: BytesMut, object_size: usize, block_size: u32) -> Option<Self> {
        if buf.capacity() < object_size || block_size == 0 {
            return None;
        }
        buf.resize(object_size, 0);
        Some(Self {
            buf,
            object_size,
            block_size: block_size as usize,
        })
    }

    /// Total number of blocks expected
    pub fn block_count(&self) -> u64 {
        ((self.object_size + self.block_size - 1) / self.block_size) as u64
    }

    /// Expected length of the block with the given sequence number
    pub fn expected_len(&self, seq: u64) -> usize {
        let start = seq as usize * self.block_size;
        self.block_size.min(self.object_size.saturating_sub(start))
    }

    /// Place one block payload at its offset; false when seq or length is bad
    pub fn place(&mut self, seq: u64, payload: &[u8]) -> bool {
        if seq >= self.block_count() || payload.len() != self.expected_len(seq) {
            return false;
        }
        let start = seq as usize * self.block_size;
        self.buf[start..start + payload.len()].copy_from_slice(payload);
        true
    }

    /// Read back the bytes placed for one block
    pub fn block(&self, seq: u64) -> Option<&[u8]> {
        if seq >= self.block_count() {
            return None;
        }
        let start = seq as usize * self.block_size;
        Some(&self.buf[start..start + self.expected_len(seq)])
    }

    /// Extract the assembled object
    pub fn into_object(self) -> Bytes {
        self.buf.freeze()
    }
}
