//! Line codec for async streams

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, ProtocolError};

/// Maximum accepted line length (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Newline-delimited JSON codec: one [`Message`] per line.
///
/// Runs under `FramedRead`/`FramedWrite`; the decoder buffers partial lines
/// across reads and remembers how far it has scanned for a terminator so a
/// slow trickle of bytes is not rescanned from the start.
#[derive(Debug)]
pub struct MessageCodec {
    /// Maximum line length accepted before the decoder gives up
    max_line_length: usize,
    /// Buffer offset already scanned for a newline
    scanned: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec with the default line limit.
    pub fn new() -> Self {
        Self {
            max_line_length: MAX_LINE_LENGTH,
            scanned: 0,
        }
    }

    /// Create a new codec with a custom maximum line length.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            scanned: 0,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let newline = src[self.scanned..].iter().position(|b| *b == b'\n');

        let end = match newline {
            Some(offset) => self.scanned + offset,
            None => {
                if src.len() > self.max_line_length {
                    return Err(ProtocolError::LineTooLarge {
                        size: src.len(),
                        max: self.max_line_length,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            }
        };

        let line = src.split_to(end + 1);
        self.scanned = 0;

        // strip the terminator, tolerating CRLF
        let mut line = &line[..line.len() - 1];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let text =
            std::str::from_utf8(line).map_err(|e| ProtocolError::Format(e.to_string()))?;
        Message::decode(text).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = msg.encode()?;
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}
