//! Error types for the chanmux library

use std::time::Duration;
use thiserror::Error;

/// Main error type for chanmux operations
#[derive(Debug, Error)]
pub enum Error {
    /// The connection registry is already listening
    #[error("registry is already started")]
    AlreadyStarted,

    /// The connection registry has not been started
    #[error("registry was not started")]
    NotStarted,

    /// No channel registered under the given name
    #[error("no channel with the name {name:?}")]
    NoSuchChannel {
        /// Name that was looked up
        name: String,
    },

    /// A channel with the given name is already registered
    #[error("channel with the name {name:?} already exists")]
    ChannelAlreadyExists {
        /// Name that was requested
        name: String,
    },

    /// The channel was closed while sending or receiving
    #[error("channel is closed")]
    ChannelClosed,

    /// A synchronous remote query did not complete in time
    #[error("timed out after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] chanmux_proto::ProtocolError),

    /// Transport-level error
    #[error("transport error: {0}")]
    Transport(#[from] chanmux_net::TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(chanmux_proto::ProtocolError::Format(err.to_string()))
    }
}
