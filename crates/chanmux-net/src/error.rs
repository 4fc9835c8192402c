//! Transport-specific error types

use std::io;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to dial the remote host
    #[error("failed to dial {addr}: {source}")]
    Dial {
        /// Address the dial attempt targeted
        addr: String,
        /// Underlying connection error
        #[source]
        source: io::Error,
    },

    /// The transport has been closed
    #[error("transport is closed")]
    Closed,

    /// A message queue was closed while sending
    #[error("message queue closed")]
    QueueClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
