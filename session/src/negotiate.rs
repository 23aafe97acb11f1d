//! Parameter validation, negotiation, and announcement metadata
//!
//! Announcements carry the object size and the announcer's requested
//! parameters. The receiver reconciles both sides into one agreed set and
//! echoes it back; the sender adopts the echo verbatim.

use crate::error::SessionError;
use lot_wire::{
    get_meta_u64, CodecError, Frame, TransferParams, DEFAULT_BLOCK_SIZE,
    DEFAULT_INACTIVITY_TIMEOUT_MS, DEFAULT_NUM_RETRANSMISSION, DEFAULT_TIMEOUT_MS,
    DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
use std::time::Duration;

/// Metadata key carrying the announced object size
pub const META_OBJECT_SIZE: &str = "object_size";

/// Fully-resolved parameter set governing one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreedParams {
    /// Block size in bytes, frozen for the life of the session
    pub block_size: u32,
    /// Window size in blocks, frozen for the life of the session
    pub window_size: u32,
    /// Ack timeout for one window of transfer
    pub timeout: Duration,
    /// Window retransmissions before the attempt fails
    pub num_retransmission: u32,
    /// Inactivity timeout for the whole session
    pub inactivity_timeout: Duration,
}

impl AgreedParams {
    /// Express the agreed set as a fully-populated wire parameter set
    pub fn to_wire(self) -> TransferParams {
        TransferParams {
            block_size: Some(self.block_size),
            window_size: Some(self.window_size),
            timeout_ms: Some(self.timeout.as_millis() as u32),
            num_retransmission: Some(self.num_retransmission),
            inactivity_timeout_ms: Some(self.inactivity_timeout.as_millis() as u32),
        }
    }

    /// Fold a mid-session update into the agreed set
    ///
    /// Only the mutable fields are applied; block and window size requests
    /// must be rejected by the caller before reaching this point.
    pub fn apply_update(&mut self, update: &TransferParams) {
        if let Some(v) = update.timeout_ms {
            self.timeout = Duration::from_millis(v as u64);
        }
        if let Some(v) = update.num_retransmission {
            self.num_retransmission = v;
        }
        if let Some(v) = update.inactivity_timeout_ms {
            self.inactivity_timeout = Duration::from_millis(v as u64);
        }
    }
}

/// Reject zero or out-of-range values in a requested parameter set
pub fn validate(params: &TransferParams) -> Result<(), SessionError> {
    if params.block_size == Some(0)
        || params.window_size == Some(0)
        || params.timeout_ms == Some(0)
        || params.inactivity_timeout_ms == Some(0)
    {
        return Err(SessionError::InvalidParam);
    }
    if matches!(params.window_size, Some(w) if w > MAX_WINDOW_SIZE) {
        return Err(SessionError::InvalidParam);
    }
    Ok(())
}

/// Reject a mid-session update that touches frozen fields
pub fn validate_update(params: &TransferParams) -> Result<(), SessionError> {
    if params.block_size.is_some() || params.window_size.is_some() {
        return Err(SessionError::InvalidParam);
    }
    validate(params)
}

/// Resolve a local request against defaults without a peer proposal
///
/// The sender runs its pre-echo timers off this set.
pub fn resolve_local(local: &TransferParams) -> AgreedParams {
    AgreedParams {
        block_size: local.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        window_size: local.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
        timeout: Duration::from_millis(local.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS) as u64),
        num_retransmission: local
            .num_retransmission
            .unwrap_or(DEFAULT_NUM_RETRANSMISSION),
        inactivity_timeout: Duration::from_millis(
            local
                .inactivity_timeout_ms
                .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MS) as u64,
        ),
    }
}

/// Reconcile receiver and sender requests into one agreed set
///
/// Resource-bound fields follow the receiver when it expressed a preference.
/// Timing fields take the stricter of the two sides. Fields neither side set
/// fall back to defaults.
pub fn negotiate(local: &TransferParams, peer: &TransferParams) -> AgreedParams {
    AgreedParams {
        block_size: local
            .block_size
            .or(peer.block_size)
            .unwrap_or(DEFAULT_BLOCK_SIZE),
        window_size: local
            .window_size
            .or(peer.window_size)
            .unwrap_or(DEFAULT_WINDOW_SIZE),
        timeout: Duration::from_millis(
            min_of(local.timeout_ms, peer.timeout_ms).unwrap_or(DEFAULT_TIMEOUT_MS) as u64,
        ),
        num_retransmission: min_of(local.num_retransmission, peer.num_retransmission)
            .unwrap_or(DEFAULT_NUM_RETRANSMISSION),
        inactivity_timeout: Duration::from_millis(
            min_of(local.inactivity_timeout_ms, peer.inactivity_timeout_ms)
                .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MS) as u64,
        ),
    }
}

fn min_of(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (v @ Some(_), None) | (None, v @ Some(_)) => v,
        (None, None) => None,
    }
}

/// Parsed contents of an announcement frame
#[derive(Debug, Clone)]
pub struct AnnounceInfo {
    /// Total size of the announced object in bytes
    pub object_size: u64,
    /// Parameters the announcer proposes or echoes
    pub params: TransferParams,
    /// True when this announcement echoes an agreed set back
    pub echo: bool,
    /// True when this announcement resumes an earlier attempt
    pub resume: bool,
}

/// Parse the metadata of an announcement frame
pub fn parse_announce(frame: &Frame) -> Result<AnnounceInfo, CodecError> {
    let meta = lot_wire::parse_meta(&frame.meta_raw)?;
    let object_size = get_meta_u64(&meta, META_OBJECT_SIZE).ok_or(CodecError::MetaDecode)?;
    Ok(AnnounceInfo {
        object_size,
        params: TransferParams::from_meta(&meta),
        echo: frame.head.flags.contains(lot_wire::Flags::ECHO),
        resume: frame.head.flags.contains(lot_wire::Flags::RESUME),
    })
}
