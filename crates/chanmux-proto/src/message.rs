//! Message types and enums

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Message type discriminant as carried on the wire.
///
/// Any out-of-range wire value decodes to `Undefined`, which is never valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageType {
    /// Zero value; never valid on the wire
    #[default]
    Undefined,
    /// Application payload for a named channel
    Data,
    /// The peer is closing its side of the link
    Close,
    /// Request for the peer's channel-name list
    ChanListRequest,
    /// Response carrying a JSON-encoded channel-name list
    ChanList,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Data,
            2 => Self::Close,
            3 => Self::ChanListRequest,
            4 => Self::ChanList,
            _ => Self::Undefined,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Undefined => 0,
            MessageType::Data => 1,
            MessageType::Close => 2,
            MessageType::ChanListRequest => 3,
            MessageType::ChanList => 4,
        }
    }
}

/// Local routing tag: `Up` for messages produced on this host, `Down` for
/// messages received from the remote. Never serialized; receivers must tag
/// `Down` immediately after decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Produced locally, waiting to be multiplexed out
    #[default]
    Up,
    /// Received from the remote host
    Down,
}

/// One wire record.
///
/// Field declaration order is the on-wire JSON key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Name of the logical channel this message belongs to
    pub channel_name: String,
    /// Message type discriminant
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Payload: raw text for `Data`, a JSON-encoded name list for `ChanList`
    pub content: String,
    /// Set locally when the message is produced or received
    #[serde(skip)]
    pub direction: Direction,
}

impl Message {
    /// Create a `Data` message carrying the given text. The channel name is
    /// stamped by the multiplex loop when the message leaves its channel.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            channel_name: String::new(),
            msg_type: MessageType::Data,
            content: content.into(),
            direction: Direction::Up,
        }
    }

    /// Create a `Close` control message.
    pub fn close() -> Self {
        Self {
            channel_name: String::new(),
            msg_type: MessageType::Close,
            content: String::new(),
            direction: Direction::Up,
        }
    }

    /// Create a `ChanListRequest` control message.
    pub fn chan_list_request() -> Self {
        Self {
            channel_name: String::new(),
            msg_type: MessageType::ChanListRequest,
            content: String::new(),
            direction: Direction::Up,
        }
    }

    /// Create a `ChanList` reply carrying a JSON-encoded name list.
    pub fn chan_list(content: impl Into<String>) -> Self {
        Self {
            channel_name: String::new(),
            msg_type: MessageType::ChanList,
            content: content.into(),
            direction: Direction::Up,
        }
    }

    /// A message is valid iff its type is defined.
    pub fn is_valid(&self) -> bool {
        self.msg_type != MessageType::Undefined
    }

    /// Serialize to one newline-terminated JSON line.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| ProtocolError::Format(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (without its terminator) into a message.
    ///
    /// The caller is responsible for tagging the result `Down` when it came
    /// off the wire.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let msg: Self =
            serde_json::from_str(line).map_err(|e| ProtocolError::Format(e.to_string()))?;
        if !msg.is_valid() {
            return Err(ProtocolError::InvalidMessage);
        }
        Ok(msg)
    }
}
