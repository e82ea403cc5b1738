//! JSON codec for the regapweb message envelope.
//!
//! Wire format:
//! ```text
//! WebSocket: one text frame   = one JSON object
//! TCP:       one line ('\n')  = one JSON object
//! ```
//! Decoding is tolerant of unknown tags (see [`MsgType::Unknown`]) and of
//! missing payload fields; it only fails when the frame is not a JSON object
//! with a string `MsgType`.
//!
//! [`MsgType::Unknown`]: crate::protocol::messages::MsgType::Unknown

use thiserror::Error;

use crate::protocol::messages::Message;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame was empty or contained only whitespace.
    #[error("empty frame")]
    Empty,

    /// The frame is not a valid message envelope.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one text frame or one line (without its terminator) into a [`Message`].
///
/// Trailing `\r` and surrounding whitespace are ignored so that devices
/// writing CRLF line endings are accepted.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for a blank frame and
/// [`CodecError::Malformed`] when the JSON does not form an envelope.
///
/// # Examples
///
/// ```rust
/// use regap_core::protocol::{decode, MsgType};
///
/// let msg = decode(r#"{"MsgType":"lookupReq"}"#).unwrap();
/// assert_eq!(msg.msg_type, MsgType::LookupReq);
/// ```
pub fn decode(frame: &str) -> Result<Message, CodecError> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_str(frame)?)
}

/// Encodes a [`Message`] as a WebSocket text frame body.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_text(msg: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Encodes a [`Message`] as one newline-terminated line for the TCP channel.
///
/// The output never contains an interior newline: `serde_json` escapes
/// control characters inside strings.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_line(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
