//! Request/response transformer contract for ccg-rust.
//!
//! A transformer converts one client dialect to one backend protocol and
//! back. Every transformer is stateless and shared across requests; the
//! only mutable state, the per-stream `StreamContext`, is owned by the
//! caller and passed in for each chunk.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::Protocol;
use crate::error::TransformError;
use crate::sse::SseEvent;
use crate::transform::stream::response_to_events;
use crate::transform::{BackendCodec, ClientCodec, StreamContext};

// ============================================================================
// Transformer Trait
// ============================================================================

/// Core trait for protocol transformers.
pub trait Transformer: Send + Sync {
    /// Registry name, e.g. `claude-to-gemini`.
    fn name(&self) -> &str;

    /// Backend protocol this transformer targets.
    fn backend(&self) -> Protocol;

    /// Convert a client request body into the backend's request body.
    ///
    /// `model_override` replaces the client's model name upstream; backends
    /// that do not speak the client's dialect require one.
    fn transform_request(
        &self,
        body: &[u8],
        model_override: Option<&str>,
    ) -> Result<Vec<u8>, TransformError>;

    /// Convert a buffered backend response. With `streaming` set, the result
    /// is the full client SSE sequence instead of a JSON body.
    fn transform_response(&self, body: &[u8], streaming: bool) -> Result<Vec<u8>, TransformError>;

    /// Convert one upstream SSE event; may produce no output.
    fn transform_response_chunk(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError>;

    /// Called at upstream EOF. Closes the client stream if the backend never
    /// sent a terminal event.
    fn finish_stream(&self, ctx: &mut StreamContext) -> Result<Vec<u8>, TransformError> {
        let _ = ctx;
        Ok(Vec::new())
    }

    /// Called when the upstream body breaks mid-stream. Ends the client
    /// stream with an error event instead of a normal stop.
    fn fail_stream(&self, ctx: &mut StreamContext, message: &str) -> Result<Vec<u8>, TransformError> {
        let mut events = Vec::new();
        ctx.fail(message, &mut events);
        crate::sse::encode_events(&events)
    }
}

/// Dialect spoken by the inbound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientFormat {
    /// Claude Messages API, the canonical schema.
    Claude,
    /// OpenAI Chat Completions.
    OpenaiChat,
}

impl ClientFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenaiChat => "openai-chat",
        }
    }

    /// The backend protocol that speaks this dialect natively.
    pub fn native_protocol(&self) -> Protocol {
        match self {
            Self::Claude => Protocol::Native,
            Self::OpenaiChat => Protocol::OpenaiChat,
        }
    }

    pub const ALL: [ClientFormat; 2] = [ClientFormat::Claude, ClientFormat::OpenaiChat];
}

impl fmt::Display for ClientFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn transformer_name(client: ClientFormat, backend: Protocol) -> String {
    format!("{}-to-{}", client, backend)
}

// ============================================================================
// Bridge: client codec composed with a backend codec
// ============================================================================

/// Routes a client dialect through the canonical form into a backend codec.
///
/// Composition is the only cross-dialect path, so a bridged conversion is
/// by construction identical to converting into and out of canonical form
/// in two explicit steps.
pub struct Bridge {
    name: String,
    client_format: ClientFormat,
    client: Arc<dyn ClientCodec>,
    backend: Arc<dyn BackendCodec>,
}

impl Bridge {
    pub fn new(
        client_format: ClientFormat,
        client: Arc<dyn ClientCodec>,
        backend: Arc<dyn BackendCodec>,
    ) -> Self {
        Self {
            name: transformer_name(client_format, backend.protocol()),
            client_format,
            client,
            backend,
        }
    }

    fn resolve_model(
        &self,
        requested: &str,
        model_override: Option<&str>,
    ) -> Result<String, TransformError> {
        if let Some(model) = model_override.filter(|m| !m.is_empty()) {
            return Ok(model.to_string());
        }
        if self.backend.protocol() == self.client_format.native_protocol() && !requested.is_empty() {
            return Ok(requested.to_string());
        }
        Err(TransformError::MissingModel {
            protocol: self.backend.protocol(),
        })
    }
}

impl Transformer for Bridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Protocol {
        self.backend.protocol()
    }

    fn transform_request(
        &self,
        body: &[u8],
        model_override: Option<&str>,
    ) -> Result<Vec<u8>, TransformError> {
        let request = self.client.decode_request(body)?;
        let model = self.resolve_model(&request.model, model_override)?;
        let encoded = self.backend.encode_request(&request, &model)?;
        debug!(transformer = %self.name, model = %model, "transformed request");
        trace!(body = %encoded, "request after transformation");
        Ok(serde_json::to_vec(&encoded)?)
    }

    fn transform_response(&self, body: &[u8], streaming: bool) -> Result<Vec<u8>, TransformError> {
        let response = self.backend.decode_response(body)?;
        if streaming {
            let events = response_to_events(&response);
            let mut ctx = StreamContext::new(response.model.clone(), false);
            return self.client.encode_events(&events, &mut ctx);
        }
        self.client.encode_response(&response)
    }

    fn transform_response_chunk(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError> {
        let mut events = Vec::new();
        self.backend.decode_event(event, ctx, &mut events)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.client.encode_events(&events, ctx)
    }

    fn finish_stream(&self, ctx: &mut StreamContext) -> Result<Vec<u8>, TransformError> {
        if ctx.finished {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        ctx.finish(None, &mut events);
        self.client.encode_events(&events, ctx)
    }

    fn fail_stream(&self, ctx: &mut StreamContext, message: &str) -> Result<Vec<u8>, TransformError> {
        let mut events = Vec::new();
        ctx.fail(message, &mut events);
        self.client.encode_events(&events, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::chat_client::ChatClient;
    use crate::transform::gemini::GeminiCodec;
    use crate::transform::native::ClaudeClient;
    use crate::transform::openai_chat::OpenAiChatCodec;
    use serde_json::json;

    fn bridge(client: ClientFormat, backend: Arc<dyn BackendCodec>) -> Bridge {
        let codec: Arc<dyn ClientCodec> = match client {
            ClientFormat::Claude => Arc::new(ClaudeClient),
            ClientFormat::OpenaiChat => Arc::new(ChatClient),
        };
        Bridge::new(client, codec, backend)
    }

    #[test]
    fn test_names_follow_client_and_backend() {
        let b = bridge(ClientFormat::Claude, Arc::new(GeminiCodec));
        assert_eq!(b.name(), "claude-to-gemini");
        assert_eq!(b.backend(), Protocol::Gemini);
    }

    #[test]
    fn test_foreign_backend_requires_model_override() {
        let b = bridge(ClientFormat::Claude, Arc::new(OpenAiChatCodec));
        let body = json!({"model": "claude-sonnet", "max_tokens": 10,
                          "messages": [{"role": "user", "content": "hi"}]})
        .to_string();

        let err = b.transform_request(body.as_bytes(), None).unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingModel {
                protocol: Protocol::OpenaiChat
            }
        ));

        let out = b.transform_request(body.as_bytes(), Some("gpt-4o")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "gpt-4o");
    }

    #[test]
    fn test_chat_client_keeps_its_model_on_chat_backend() {
        let b = bridge(ClientFormat::OpenaiChat, Arc::new(OpenAiChatCodec));
        let body = json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]})
            .to_string();
        let out = b.transform_request(body.as_bytes(), None).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_bridged_request_matches_two_step_conversion() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "What is in /tmp?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "ls", "arguments": "{\"path\":\"/tmp\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "a.txt"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "ls", "parameters": {"type": "object", "additionalProperties": false}
            }}]
        })
        .to_string();

        let b = bridge(ClientFormat::OpenaiChat, Arc::new(GeminiCodec));
        let bridged = b.transform_request(body.as_bytes(), Some("gemini-2.5-pro")).unwrap();

        let canonical = ChatClient.decode_request(body.as_bytes()).unwrap();
        let two_step =
            serde_json::to_vec(&GeminiCodec.encode_request(&canonical, "gemini-2.5-pro").unwrap())
                .unwrap();
        assert_eq!(bridged, two_step);
    }

    #[test]
    fn test_buffered_response_can_be_replayed_as_stream() {
        let b = bridge(ClientFormat::Claude, Arc::new(OpenAiChatCodec));
        let upstream = json!({
            "id": "chatcmpl-1", "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        })
        .to_string();

        let out = b.transform_response(upstream.as_bytes(), true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("event: message_start\n"));
        assert!(text.contains(r#""text":"hello""#));
        assert!(text.trim_end().ends_with(r#"data: {"type":"message_stop"}"#));
    }
}
