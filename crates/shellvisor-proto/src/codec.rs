//! NDJSON framing for protocol messages.
//!
//! One message per line. Blank lines are rejected rather than skipped so the
//! reader can decide whether to ignore them.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors from encoding or decoding a protocol line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Empty protocol line")]
    EmptyLine,

    #[error("Malformed protocol line: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize a message into a single newline-terminated line.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line (with or without its terminator) into a message.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }
    Ok(serde_json::from_str(trimmed)?)
}
