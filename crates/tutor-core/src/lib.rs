//! tutor-core: Shared protocol library for the tutoring session server.
//!
//! Provides the JSON-RPC request/response types spoken over the WebSocket
//! channel, the framing codec, status codes and the error taxonomy shared by
//! the server and any client.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_request, decode_response, encode, MAX_FRAME_SIZE};
pub use error::{TutorError, TutorResult};
pub use messages::{ErrorPayload, Method, Position, Request, Response, Role, Status};
