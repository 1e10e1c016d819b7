//! Protocol codecs.
//!
//! A backend codec converts between the canonical schema and one backend
//! wire protocol; a client codec converts between a client dialect and the
//! canonical schema. `transformer::Bridge` composes one of each.

pub mod chat_client;
pub mod gemini;
pub mod native;
pub mod openai_chat;
pub mod registry;
pub mod responses;
pub mod schema;
pub mod stream;

use serde_json::Value;

use crate::config::Protocol;
use crate::error::TransformError;
use crate::protocol::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::sse::SseEvent;

pub use registry::TransformerRegistry;
pub use stream::StreamContext;

/// Canonical ⇄ backend protocol conversion.
pub trait BackendCodec: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Build the backend request body. `model` is the resolved upstream model.
    fn encode_request(&self, request: &MessagesRequest, model: &str) -> Result<Value, TransformError>;

    /// Parse a buffered backend response into canonical form.
    fn decode_response(&self, body: &[u8]) -> Result<MessagesResponse, TransformError>;

    /// Convert one upstream SSE event into zero or more canonical events.
    fn decode_event(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TransformError>;
}

/// Client dialect ⇄ canonical conversion.
pub trait ClientCodec: Send + Sync {
    fn decode_request(&self, body: &[u8]) -> Result<MessagesRequest, TransformError>;

    fn encode_response(&self, response: &MessagesResponse) -> Result<Vec<u8>, TransformError>;

    /// Render canonical events as client SSE frames.
    fn encode_events(
        &self,
        events: &[StreamEvent],
        ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError>;
}
