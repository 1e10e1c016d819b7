//! Google Gemini backend codec.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::trace;

use crate::config::Protocol;
use crate::error::TransformError;
use crate::protocol::gemini::{
    Blob, Content, FileData, FunctionCall, FunctionCallingConfig, FunctionDeclaration,
    FunctionResponse, GeminiTool, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Part, ThinkingConfig, ToolConfig,
};
use crate::protocol::{
    ContentBlock, ImageSource, MessagesRequest, MessagesResponse, Role, StopReason, StreamEvent,
    ToolChoice, Usage,
};
use crate::sse::SseEvent;
use crate::transform::schema::clean_schema;
use crate::transform::stream::{generate_message_id, generate_tool_id};
use crate::transform::{BackendCodec, StreamContext};

pub struct GeminiCodec;

/// Map a Gemini `finishReason`. `STOP` after a function call means the
/// model is waiting on tool output.
pub fn map_finish_reason(reason: &str, saw_function_call: bool) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        "STOP" if saw_function_call => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

// ============================================================================
// Request
// ============================================================================

fn image_part(source: ImageSource) -> Part {
    match source {
        ImageSource::Base64 { media_type, data } => Part {
            inline_data: Some(Blob {
                mime_type: media_type,
                data,
            }),
            ..Default::default()
        },
        ImageSource::Url { url } => Part {
            file_data: Some(FileData {
                mime_type: None,
                file_uri: url,
            }),
            ..Default::default()
        },
    }
}

fn tool_config(choice: &ToolChoice) -> ToolConfig {
    let (mode, allowed) = match choice {
        ToolChoice::Auto => ("AUTO", None),
        ToolChoice::Any => ("ANY", None),
        ToolChoice::None => ("NONE", None),
        ToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
    };
    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    }
}

pub fn build_gemini_request(request: &MessagesRequest) -> GenerateContentRequest {
    // Gemini keys function responses by function name, not call id.
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        let role = if message.role == Role::Assistant {
            "model"
        } else {
            "user"
        };
        let mut parts = Vec::new();
        for block in message.content.to_blocks() {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => parts.push(Part::text(text)),
                ContentBlock::Text { .. } => {}
                ContentBlock::Image { source } => parts.push(image_part(source)),
                ContentBlock::ToolUse { id, name, input } => {
                    call_names.insert(id, name.clone());
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            id: None,
                            name,
                            args: if input.is_null() { json!({}) } else { input },
                        }),
                        ..Default::default()
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let name = call_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    let key = if is_error.unwrap_or(false) {
                        "error"
                    } else {
                        "content"
                    };
                    let mut response = serde_json::Map::new();
                    response.insert(key.to_string(), Value::String(content.to_text()));
                    parts.push(Part {
                        function_response: Some(FunctionResponse {
                            id: None,
                            name,
                            response: Value::Object(response),
                        }),
                        ..Default::default()
                    });
                }
                ContentBlock::Thinking { .. }
                | ContentBlock::RedactedThinking { .. }
                | ContentBlock::Unknown => {}
            }
        }
        if !parts.is_empty() {
            contents.push(Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        vec![GeminiTool {
            function_declarations: tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(clean_schema(&tool.input_schema)),
                })
                .collect(),
        }]
    });

    let generation_config = GenerationConfig {
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        stop_sequences: request.stop_sequences.clone().filter(|s| !s.is_empty()),
        thinking_config: request.thinking_budget().map(|budget| ThinkingConfig {
            include_thoughts: true,
            thinking_budget: (budget > 0).then_some(budget),
        }),
    };

    GenerateContentRequest {
        contents,
        system_instruction: request.system_text().map(|text| Content {
            role: None,
            parts: vec![Part::text(text)],
        }),
        tools,
        tool_config: request.tool_choice.as_ref().map(tool_config),
        generation_config: (!generation_config.is_empty()).then_some(generation_config),
    }
}

// ============================================================================
// Response
// ============================================================================

fn call_id(call: &FunctionCall) -> String {
    call.id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_tool_id)
}

fn call_arguments(call: &FunctionCall) -> Value {
    if call.args.is_null() {
        json!({})
    } else {
        call.args.clone()
    }
}

pub fn gemini_response_to_canonical(response: GenerateContentResponse) -> MessagesResponse {
    let id = response
        .response_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_message_id);
    let mut out = MessagesResponse::new(id, response.model_version.unwrap_or_default());

    let mut saw_call = false;
    let mut finish = None;
    if let Some(candidate) = response.candidates.into_iter().next() {
        finish = candidate.finish_reason;
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = &part.function_call {
                saw_call = true;
                out.content.push(ContentBlock::ToolUse {
                    id: call_id(call),
                    name: call.name.clone(),
                    input: call_arguments(call),
                });
                continue;
            }
            let Some(text) = part.text.clone() else {
                continue;
            };
            // Adjacent parts of the same kind are merged into one block.
            let merged = match (part.is_thought(), out.content.last_mut()) {
                (true, Some(ContentBlock::Thinking { thinking, .. })) => {
                    thinking.push_str(&text);
                    true
                }
                (false, Some(ContentBlock::Text { text: existing })) => {
                    existing.push_str(&text);
                    true
                }
                _ => false,
            };
            if merged {
                continue;
            }
            out.content.push(if part.is_thought() {
                ContentBlock::Thinking {
                    thinking: text,
                    signature: part.thought_signature.clone(),
                }
            } else {
                ContentBlock::text(text)
            });
        }
    }

    out.stop_reason = Some(match finish.as_deref() {
        Some(reason) => map_finish_reason(reason, saw_call),
        None if saw_call => StopReason::ToolUse,
        None => StopReason::EndTurn,
    });
    if let Some(usage) = response.usage_metadata {
        out.usage = Usage::new(usage.prompt_token_count, usage.output_tokens());
    }
    out
}

impl BackendCodec for GeminiCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    /// The model travels in the URL path, not the body.
    fn encode_request(&self, request: &MessagesRequest, _model: &str) -> Result<Value, TransformError> {
        Ok(serde_json::to_value(build_gemini_request(request))?)
    }

    fn decode_response(&self, body: &[u8]) -> Result<MessagesResponse, TransformError> {
        let response: GenerateContentResponse = serde_json::from_slice(body)?;
        Ok(gemini_response_to_canonical(response))
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
        let chunk: GenerateContentResponse = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                trace!(error = %err, "skipping unparseable gemini chunk");
                return Ok(());
            }
        };

        if let Some(usage) = chunk.usage_metadata {
            ctx.record_usage(Some(usage.prompt_token_count), Some(usage.output_tokens()));
        }
        if ctx.finished {
            return Ok(());
        }
        ctx.ensure_started(out);

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(());
        };
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = &part.function_call {
                let arguments = call_arguments(call).to_string();
                ctx.whole_tool(&call_id(call), &call.name, &arguments, out);
            } else if let Some(text) = part.text.as_deref() {
                if part.is_thought() {
                    ctx.thinking_delta(text, out);
                } else {
                    ctx.text_delta(text, out);
                }
            }
        }
        if let Some(reason) = candidate.finish_reason {
            let stop = map_finish_reason(&reason, ctx.saw_tool_use);
            ctx.finish(Some(stop), out);
        }
        Ok(())
    }
}
