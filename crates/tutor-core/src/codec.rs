//! JSON framing for the session channel.
//!
//! Wire format: one JSON document per WebSocket text message.

use crate::error::{TutorError, TutorResult};
use crate::messages::{Request, Response};

/// Largest frame accepted in either direction (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into a text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> TutorResult<String> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(TutorError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(text)
}

/// Decode a client request.
pub fn decode_request(text: &str) -> TutorResult<Request> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| TutorError::InvalidMessage(e.to_string()))
}

/// Decode a server reply.
pub fn decode_response(text: &str) -> TutorResult<Response> {
    check_size(text)?;
    serde_json::from_str(text).map_err(|e| TutorError::InvalidMessage(e.to_string()))
}

fn check_size(text: &str) -> TutorResult<()> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(TutorError::InvalidMessage(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(())
}
