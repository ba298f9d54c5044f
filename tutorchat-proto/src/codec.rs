//! JSON text-frame codec for [`ClientEvent`] and [`ServerEvent`].

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes a client event into a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a client event from a JSON text frame of at most `max_size` bytes.
///
/// # Errors
///
/// Returns [`CodecError::TooLarge`] if the frame exceeds `max_size`, or
/// [`CodecError::Serialization`] if it is not a valid client event.
pub fn decode_client(frame: &str, max_size: usize) -> Result<ClientEvent, CodecError> {
    if frame.len() > max_size {
        return Err(CodecError::TooLarge {
            size: frame.len(),
            max: max_size,
        });
    }
    Ok(serde_json::from_str(frame)?)
}

/// Encodes a server event into a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes a server event from a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame is not a valid server
/// event.
pub fn decode_server(frame: &str) -> Result<ServerEvent, CodecError> {
    Ok(serde_json::from_str(frame)?)
}
