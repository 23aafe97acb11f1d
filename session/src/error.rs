//! Session error types and failure reasons

use lot_wire::AbortReason;
use thiserror::Error;

/// Why a transfer attempt stopped making progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The retry budget for the attempt was exhausted
    RetriesExhausted,
    /// No traffic arrived within the inactivity timeout
    InactivityTimeout,
    /// The peer aborted the session
    PeerAborted(AbortReason),
    /// The local application aborted the session
    LocalAbort(AbortReason),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted => write!(f, "retry budget exhausted"),
            FailureReason::InactivityTimeout => write!(f, "inactivity timeout"),
            FailureReason::PeerAborted(r) => write!(f, "aborted by peer ({r:?})"),
            FailureReason::LocalAbort(r) => write!(f, "aborted locally ({r:?})"),
        }
    }
}

/// Errors returned by session operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// A parameter is zero, out of range, or immutable mid-session
    #[error("invalid parameter")]
    InvalidParam,
    /// The session already carries an active transfer
    #[error("session already in progress")]
    SessionInProgress,
    /// No session exists for the given handle
    #[error("session not found")]
    SessionNotFound,
    /// Window or reassembly bookkeeping could not be allocated
    #[error("out of memory")]
    NoMemory,
    /// The receive buffer cannot hold the announced object
    #[error("receive buffer too small")]
    BufferTooSmall,
    /// The operation is not valid in the session's current state
    #[error("operation invalid in current session state")]
    InternalError,
    /// The attempt failed but the session can be resumed
    #[error("transfer failed: {0}")]
    Failed(FailureReason),
    /// The attempt timed out waiting for peer traffic
    #[error("transfer timed out")]
    TimedOut,
    /// The session was aborted and cannot be resumed
    #[error("transfer aborted")]
    Aborted,
}
