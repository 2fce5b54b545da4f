//! Payload codec for bus <-> peripheral translation
//!
//! Bus messages are text. On the way to the peripheral commands become UTF-8
//! with a trailing newline and stream frames are hex-decoded. On the way back
//! notifications are decoded as UTF-8 with trailing whitespace removed.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Line terminator appended to every command
pub const COMMAND_TERMINATOR: u8 = b'\n';

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Invalid hex stream frame: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Notification is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Encode a text command into the bytes written to the command characteristic
pub fn encode_command(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(COMMAND_TERMINATOR);
    buf.freeze()
}

/// Decode a hex stream frame into raw bytes
///
/// ASCII whitespace between byte pairs is ignored, so `"0a 1b"` and `"0a1b"`
/// decode to the same frame. Odd length or non-hex characters are errors.
pub fn decode_stream_frame(text: &str) -> Result<Bytes, CodecError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = hex::decode(compact)?;
    Ok(Bytes::from(bytes))
}

/// Encode raw bytes as lowercase hex
pub fn encode_stream_frame(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode a notification payload into the text published on the bus
pub fn decode_notification(data: &[u8]) -> Result<String, CodecError> {
    let text = std::str::from_utf8(data)?;
    Ok(text.trim_end().to_string())
}
