//! CBOR metadata encoding and decoding for the wire protocol.
//!
//! Control-plane fields that are optional or variable-length (negotiation
//! parameters, acknowledgment bitmaps, object size) travel as a canonical
//! CBOR map between the fixed header and the payload.

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert a u64 value
    pub fn insert_u64(mut self, key: &str, value: u64) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    if meta_raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u32> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get u64 value from metadata
pub fn get_meta_u64(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u64> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get binary value from metadata
pub fn get_meta_bytes(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<Vec<u8>> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Bytes(b) = v {
            Some(b.clone())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_u32("block_size", 1000)
            .insert_u64("object_size", 10_000)
            .insert_bytes("sack", &[0b0000_1101])
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(get_meta_u32(&parsed, "block_size"), Some(1000));
        assert_eq!(get_meta_u64(&parsed, "object_size"), Some(10_000));
        assert_eq!(get_meta_bytes(&parsed, "sack"), Some(vec![0b0000_1101]));
        assert_eq!(get_meta_u32(&parsed, "absent"), None);
    }

    #[test]
    fn test_empty_meta() {
        let parsed = parse_meta(&[]).unwrap();
        assert!(parsed.is_empty());
    }
}
