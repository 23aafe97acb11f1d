//! Reliable large-object transfer over lossy datagram transports.
//!
//! This crate is the protocol engine: sessions announce an object, negotiate
//! block and window sizes with the peer, then move the object as a sliding
//! window of blocks with cumulative plus selective acknowledgment. Failed
//! attempts keep their window state and resume from the last acknowledged
//! base; aborts tear a session down for good.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lot_session::{memory_pair, SessionConfig, SessionManager};
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (near, far) = memory_pair(1500);
//! let manager = SessionManager::new(Arc::new(near), SessionConfig::default());
//! # let _ = far;
//!
//! let (event_tx, mut events) = mpsc::unbounded_channel();
//! let handle = manager.create(event_tx)?;
//!
//! let object = Bytes::from(vec![7u8; 64 * 1024]);
//! manager.send(handle, object, Default::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("session event: {event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod manager;
pub mod negotiate;
pub mod session;
pub mod timer;
pub mod transport;
pub mod window;

pub use error::{FailureReason, SessionError};
pub use manager::{SessionManager, MIN_DATAGRAM_SIZE};
pub use negotiate::{AgreedParams, AnnounceInfo};
pub use session::{
    BlockDelivery, Outcome, Role, SessionConfig, SessionEvent, SessionPhase, SessionStats,
};
pub use transport::{memory_pair, MemoryTransport, Transport, UdpTransport};

// the negotiable knobs live in the wire crate next to their encoding
pub use lot_wire::TransferParams;
