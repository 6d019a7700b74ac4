//! Wire Codec
//!
//! Encodes and decodes message bodies to and from the JSON text carried in
//! WebSocket frames. The WebSocket layer already delimits messages, so no
//! additional length prefix is needed; one frame is one JSON document.
//!
//! The serializer choice is internal. The external contract is only that
//! every JSON-representable value round-trips losslessly.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::IpcError;

/// Encode a value as a single JSON text frame body.
///
/// # Errors
///
/// Returns [`IpcError::Serialization`] if the value cannot be represented
/// as JSON (e.g. a map with non-string keys).
pub fn encode<T: Serialize>(value: &T) -> Result<String, IpcError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame body into a value.
///
/// # Errors
///
/// Returns [`IpcError::Serialization`] if the text is not valid JSON or does
/// not match the target shape.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, IpcError> {
    Ok(serde_json::from_str(text)?)
}
