//! # Chanmux Protocol
//!
//! Wire message model, validity rule, and the newline-delimited JSON codec
//! for the Chanmux multiplexing system.

#![warn(missing_docs)]

/// Message types and enums
pub mod message;

/// Line codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use message::{Direction, Message, MessageType};
