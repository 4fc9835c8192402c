//! # Chanmux
//!
//! Multiplexes many independent, named, bidirectional logical message
//! streams ("channels") over a single persistent TCP connection per remote
//! host, with automatic reconnection on transport failure.
//!
//! Applications start a [`ConnectionRegistry`], obtain a [`RemoteManager`]
//! per remote host, and open named [`Channel`]s on it; the manager's routing
//! loops take care of tagging, framing, and socket management.

#![warn(missing_docs)]

pub use chanmux_net as net;
pub use chanmux_proto as proto;

/// Error types for the chanmux library
pub mod error;

/// Application-facing channel handle
pub mod channel;

/// Per-remote-host channel manager and routing loops
pub mod manager;

/// Connection registry and inbound listener
pub mod listener;

mod registry;

pub use channel::{Channel, ChannelId};
pub use chanmux_proto::{Direction, Message, MessageType};
pub use error::Error;
pub use listener::ConnectionRegistry;
pub use manager::RemoteManager;

/// Result type alias for chanmux operations
pub type Result<T> = std::result::Result<T, Error>;
