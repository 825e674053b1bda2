//! Wire format for the real-time ticket channel
//!
//! Outbound frames carry nothing but the trimmed message text; the server
//! already knows who is talking and about which ticket from the authenticated
//! connection. Inbound frames are pipe-delimited:
//!
//! ```text
//! <senderId>:<content>|<timestamp>|<senderName>
//! ```

use serde::{Deserialize, Serialize};

/// Separates the three top-level fields of an inbound frame.
pub const FIELD_DELIMITER: char = '|';

/// Separates the sender id from the content inside the first field.
pub const SENDER_DELIMITER: char = ':';

/// A chat message decoded from an inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: i64,
    pub content: String,
    /// Display string as sent by the server, never reparsed here
    pub timestamp: String,
    pub sender_name: String,
}

/// Why an inbound frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is missing the '|' field delimiters")]
    MissingFields,

    #[error("frame is missing the ':' after the sender id")]
    MissingSender,

    #[error("invalid sender id: {0:?}")]
    InvalidSenderId(String),
}

/// Decode one inbound frame.
///
/// The timestamp and sender name are taken from the right so that a `|`
/// inside the message body stays part of the content. The sender id is
/// everything before the first `:`; later colons belong to the content.
pub fn decode_frame(frame: &str) -> Result<InboundMessage, FrameError> {
    let mut fields = frame.rsplitn(3, FIELD_DELIMITER);
    let sender_name = fields.next().ok_or(FrameError::MissingFields)?;
    let timestamp = fields.next().ok_or(FrameError::MissingFields)?;
    let head = fields.next().ok_or(FrameError::MissingFields)?;

    let (sender, content) = head
        .split_once(SENDER_DELIMITER)
        .ok_or(FrameError::MissingSender)?;

    let sender_id = sender
        .trim()
        .parse::<i64>()
        .map_err(|_| FrameError::InvalidSenderId(sender.to_string()))?;

    Ok(InboundMessage {
        sender_id,
        content: content.to_string(),
        timestamp: timestamp.to_string(),
        sender_name: sender_name.to_string(),
    })
}

/// Encode outgoing chat text. Returns `None` when nothing is left after trimming.
pub fn encode_outbound(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Encode a message in the inbound grammar (what the server broadcasts).
pub fn encode_frame(message: &InboundMessage) -> String {
    format!(
        "{}{}{}{}{}{}{}",
        message.sender_id,
        SENDER_DELIMITER,
        message.content,
        FIELD_DELIMITER,
        message.timestamp,
        FIELD_DELIMITER,
        message.sender_name
    )
}
