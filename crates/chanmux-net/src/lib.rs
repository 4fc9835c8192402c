//! # Chanmux Transport
//!
//! Per-remote-host TCP transport layer for Chanmux: one inbound and one
//! outbound socket, bounded message queues, and the read/write loops with
//! dial retry and reconnect-on-write-failure.

#![warn(missing_docs)]

/// Remote transport and its read/write loops
pub mod transport;

/// Transport-specific error types
pub mod error;

pub use error::TransportError;
pub use transport::{InboundConn, RemoteTransport, MAX_DIAL_ATTEMPTS, QUEUE_CAPACITY};
