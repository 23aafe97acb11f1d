//! Transfer parameters carried during negotiation.
//!
//! Every field is optional: a `None` means "not explicitly requested" and the
//! negotiator falls back to the default. Only fields that are `Some` are
//! written to the metadata map, so presence on the wire mirrors presence in
//! the struct.

use crate::codec::{get_meta_u32, MetaBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Default window size in blocks
pub const DEFAULT_WINDOW_SIZE: u32 = 16;

/// Default per-window ack timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u32 = 2_000;

/// Default number of window retransmissions before failing
pub const DEFAULT_NUM_RETRANSMISSION: u32 = 4;

/// Default session inactivity timeout in milliseconds
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u32 = 30_000;

/// Upper bound on the negotiable window size, bounds per-session memory
pub const MAX_WINDOW_SIZE: u32 = 1024;

/// Negotiable transfer parameters with per-field presence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    /// Size of each block in bytes (frozen once transferring)
    pub block_size: Option<u32>,
    /// Max blocks in flight without acknowledgment (frozen once transferring)
    pub window_size: Option<u32>,
    /// Ack timeout for one window of transfer, in milliseconds
    pub timeout_ms: Option<u32>,
    /// Window retransmissions before the session fails
    pub num_retransmission: Option<u32>,
    /// Session inactivity timeout in milliseconds
    pub inactivity_timeout_ms: Option<u32>,
}

impl TransferParams {
    /// Write the explicitly-set fields into a metadata builder
    pub fn write_meta(&self, mut meta: MetaBuilder) -> MetaBuilder {
        if let Some(v) = self.block_size {
            meta = meta.insert_u32("block_size", v);
        }
        if let Some(v) = self.window_size {
            meta = meta.insert_u32("window_size", v);
        }
        if let Some(v) = self.timeout_ms {
            meta = meta.insert_u32("timeout_ms", v);
        }
        if let Some(v) = self.num_retransmission {
            meta = meta.insert_u32("num_retransmission", v);
        }
        if let Some(v) = self.inactivity_timeout_ms {
            meta = meta.insert_u32("inactivity_timeout_ms", v);
        }
        meta
    }

    /// Read the parameter fields present in a parsed metadata map
    pub fn from_meta(meta: &BTreeMap<String, ciborium::Value>) -> Self {
        Self {
            block_size: get_meta_u32(meta, "block_size"),
            window_size: get_meta_u32(meta, "window_size"),
            timeout_ms: get_meta_u32(meta, "timeout_ms"),
            num_retransmission: get_meta_u32(meta, "num_retransmission"),
            inactivity_timeout_ms: get_meta_u32(meta, "inactivity_timeout_ms"),
        }
    }

    /// True when every field is unset
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_meta;

    #[test]
    fn test_partial_params_roundtrip() {
        let params = TransferParams {
            block_size: Some(1000),
            window_size: None,
            timeout_ms: Some(500),
            num_retransmission: None,
            inactivity_timeout_ms: None,
        };

        let meta = params.write_meta(MetaBuilder::new()).build().unwrap();
        let parsed = parse_meta(&meta).unwrap();
        let restored = TransferParams::from_meta(&parsed);

        assert_eq!(restored, params);
        assert_eq!(restored.window_size, None);
    }

    #[test]
    fn test_empty_params() {
        let params = TransferParams::default();
        assert!(params.is_empty());

        let meta = params.write_meta(MetaBuilder::new()).build().unwrap();
        let parsed = parse_meta(&meta).unwrap();
        assert!(TransferParams::from_meta(&parsed).is_empty());
    }
}
