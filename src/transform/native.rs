//! Claude-native backend and client codecs.
//!
//! The canonical schema is the Claude Messages API, so both directions are
//! plain serde. `NativePassthrough` skips the canonical round-trip entirely
//! for Claude clients talking to Claude backends: bodies and stream frames
//! are relayed as received, with usage read on the side for stats.

use serde_json::Value;
use tracing::trace;

use crate::config::Protocol;
use crate::error::TransformError;
use crate::protocol::{ContentBlock, MessagesRequest, MessagesResponse, StreamEvent};
use crate::sse::{self, SseEvent};
use crate::transform::stream::{response_to_events, OpenBlock};
use crate::transform::{BackendCodec, ClientCodec, StreamContext};
use crate::transformer::{transformer_name, ClientFormat, Transformer};

/// Mirror an already-canonical event into the stream context so the
/// closing sequence and usage accounting stay correct.
pub fn observe_event(event: &StreamEvent, ctx: &mut StreamContext) {
    match event {
        StreamEvent::MessageStart { message } => {
            ctx.message_started = true;
            ctx.message_id = Some(message.id.clone());
            ctx.record_usage(
                Some(message.usage.input_tokens),
                Some(message.usage.output_tokens),
            );
        }
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => {
            ctx.current_index = *index;
            ctx.next_index = ctx.next_index.max(index + 1);
            ctx.open = Some(match content_block {
                ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                    OpenBlock::Thinking
                }
                ContentBlock::ToolUse { .. } => {
                    ctx.saw_tool_use = true;
                    OpenBlock::Tool
                }
                _ => OpenBlock::Text,
            });
        }
        StreamEvent::ContentBlockDelta { delta, .. } => {
            use crate::protocol::BlockDelta;
            ctx.output_chars += match delta {
                BlockDelta::TextDelta { text } => text.chars().count(),
                BlockDelta::ThinkingDelta { thinking } => thinking.chars().count(),
                BlockDelta::InputJsonDelta { partial_json } => partial_json.chars().count(),
                _ => 0,
            };
        }
        StreamEvent::ContentBlockStop { .. } => {
            ctx.open = None;
        }
        StreamEvent::MessageDelta { delta, usage } => {
            if delta.stop_reason.is_some() {
                ctx.stop_reason = delta.stop_reason;
            }
            if let Some(usage) = usage {
                ctx.record_usage(usage.input_tokens, Some(usage.output_tokens));
            }
        }
        StreamEvent::MessageStop | StreamEvent::Error { .. } => {
            ctx.finished = true;
        }
        StreamEvent::Ping => {}
    }
}

// ============================================================================
// Backend codec
// ============================================================================

pub struct NativeCodec;

impl BackendCodec for NativeCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Native
    }

    fn encode_request(&self, request: &MessagesRequest, model: &str) -> Result<Value, TransformError> {
        let mut value = serde_json::to_value(request)?;
        value["model"] = Value::String(model.to_string());
        Ok(value)
    }

    fn decode_response(&self, body: &[u8]) -> Result<MessagesResponse, TransformError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn decode_event(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TransformError> {
        if event.data.trim().is_empty() {
            return Ok(());
        }
        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(error = %err, "skipping unparseable native stream event");
                return Ok(());
            }
        };
        if ctx.finished {
            return Ok(());
        }
        observe_event(&parsed, ctx);
        out.push(parsed);
        Ok(())
    }
}

// ============================================================================
// Client codec
// ============================================================================

pub struct ClaudeClient;

impl ClientCodec for ClaudeClient {
    fn decode_request(&self, body: &[u8]) -> Result<MessagesRequest, TransformError> {
        Ok(serde_json::from_slice(body)?)
    }

    fn encode_response(&self, response: &MessagesResponse) -> Result<Vec<u8>, TransformError> {
        Ok(serde_json::to_vec(response)?)
    }

    fn encode_events(
        &self,
        events: &[StreamEvent],
        _ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError> {
        sse::encode_events(events)
    }
}

// ============================================================================
// Pass-through transformer
// ============================================================================

/// Claude client to Claude backend without re-encoding.
pub struct NativePassthrough {
    name: String,
}

impl NativePassthrough {
    pub fn new() -> Self {
        Self {
            name: transformer_name(ClientFormat::Claude, Protocol::Native),
        }
    }
}

impl Default for NativePassthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for NativePassthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Protocol {
        Protocol::Native
    }

    fn transform_request(
        &self,
        body: &[u8],
        model_override: Option<&str>,
    ) -> Result<Vec<u8>, TransformError> {
        let mut value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(TransformError::malformed("request", "body is not a JSON object"));
        }
        match model_override.filter(|m| !m.is_empty()) {
            Some(model) => {
                value["model"] = Value::String(model.to_string());
                Ok(serde_json::to_vec(&value)?)
            }
            None => Ok(body.to_vec()),
        }
    }

    fn transform_response(&self, body: &[u8], streaming: bool) -> Result<Vec<u8>, TransformError> {
        if !streaming {
            return Ok(body.to_vec());
        }
        let response: MessagesResponse = serde_json::from_slice(body)?;
        sse::encode_events(&response_to_events(&response))
    }

    fn transform_response_chunk(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError> {
        if let Ok(parsed) = serde_json::from_str::<StreamEvent>(&event.data) {
            observe_event(&parsed, ctx);
        }
        Ok(event.to_frame().into_bytes())
    }

    fn finish_stream(&self, ctx: &mut StreamContext) -> Result<Vec<u8>, TransformError> {
        if ctx.finished {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        ctx.finish(None, &mut events);
        sse::encode_events(&events)
    }
}
