//! Feed Codec
//!
//! JSON encoding of directives and decoding of inbound feed messages.

use super::messages::{FeedMessage, FeedRequest};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is not a JSON object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the upstream feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object, or if a known
    /// message type carries a malformed payload.
    pub fn decode(&self, text: &str) -> Result<FeedMessage, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            let preview: String = trimmed.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {preview}"
            )));
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Encode a directive.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, request: &FeedRequest) -> Result<String, CodecError> {
        Ok(serde_json::to_string(request)?)
    }
}
