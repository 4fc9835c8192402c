//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed wire data
    #[error("malformed message line: {0}")]
    Format(String),

    /// Well-formed message with an undefined type
    #[error("message type is not defined")]
    InvalidMessage,

    /// Transport-level read failure
    #[error("failed to read incoming data: {0}")]
    Incoming(#[from] std::io::Error),

    /// Line exceeded the maximum permitted length
    #[error("line too long: {size} bytes (max: {max})")]
    LineTooLarge {
        /// Buffered size so far
        size: usize,
        /// Maximum allowed line length
        max: usize,
    },
}
