//! OpenAI Chat Completions client dialect.
//!
//! Inbound `/v1/chat/completions` requests are lifted into the canonical
//! schema, and canonical responses/events are rendered back as
//! `chat.completion` bodies and `chat.completion.chunk` SSE frames.
//! Handles:
//! - `system`/`developer` messages → top-level system prompt
//! - `tool` messages → `tool_result` blocks in a user turn
//! - assistant `tool_calls` → `tool_use` blocks
//! - `required` tool choice → `any`, function choice → `tool`
//! - stop reasons → `stop`/`length`/`tool_calls`/`content_filter`

use serde_json::{json, Value};

use crate::error::TransformError;
use crate::protocol::openai_chat::{
    ChatChunk, ChatContent, ChatMessage, ChatPart, ChatRequest, ChatResponse, ChatUsage, Choice,
    ChunkChoice, ChunkDelta, FunctionCall, FunctionDelta, ToolCall, ToolCallDelta,
};
use crate::protocol::{
    BlockDelta, ContentBlock, ImageSource, Message, MessageContent, MessagesRequest,
    MessagesResponse, Role, StopReason, StreamEvent, SystemPrompt, ThinkingConfig, Tool,
    ToolChoice, ToolResultContent,
};
use crate::sse::encode_data;
use crate::transform::openai_chat::{arguments_string, budget_for_effort, parse_arguments};
use crate::transform::{ClientCodec, StreamContext};

pub struct ChatClient;

fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Map a canonical stop reason to an OpenAI `finish_reason`.
fn map_stop_reason(reason: Option<StopReason>) -> &'static str {
    match reason {
        Some(StopReason::MaxTokens) => "length",
        Some(StopReason::ToolUse) => "tool_calls",
        Some(StopReason::Refusal) => "content_filter",
        _ => "stop",
    }
}

// ============================================================================
// Request: OpenAI → canonical
// ============================================================================

fn convert_user_content(content: Option<ChatContent>) -> MessageContent {
    match content {
        None => MessageContent::Text(String::new()),
        Some(ChatContent::Text(text)) => MessageContent::Text(text),
        Some(ChatContent::Parts(parts)) => MessageContent::Blocks(
            parts
                .into_iter()
                .filter_map(|part| match part {
                    ChatPart::Text { text } => Some(ContentBlock::text(text)),
                    ChatPart::ImageUrl { image_url } => Some(ContentBlock::Image {
                        source: ImageSource::from_url(&image_url.url),
                    }),
                    ChatPart::Unknown => None,
                })
                .collect(),
        ),
    }
}

fn convert_assistant(message: ChatMessage) -> Message {
    let mut blocks = Vec::new();
    if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
        blocks.push(ContentBlock::Thinking {
            thinking: reasoning,
            signature: None,
        });
    }
    if let Some(text) = message.content.map(|c| c.to_text()).filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::text(text));
    }
    for call in message.tool_calls.unwrap_or_default() {
        blocks.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input: parse_arguments(&call.function.arguments),
        });
    }
    Message::blocks(Role::Assistant, blocks)
}

/// Append a tool result, merging consecutive results into one user turn.
fn push_tool_result(messages: &mut Vec<Message>, message: ChatMessage) {
    let block = ContentBlock::ToolResult {
        tool_use_id: message.tool_call_id.unwrap_or_default(),
        content: ToolResultContent::Text(message.content.map(|c| c.to_text()).unwrap_or_default()),
        is_error: None,
    };
    if let Some(Message {
        role: Role::User,
        content: MessageContent::Blocks(blocks),
    }) = messages.last_mut()
    {
        if blocks
            .iter()
            .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
        {
            blocks.push(block);
            return;
        }
    }
    messages.push(Message::blocks(Role::User, vec![block]));
}

fn convert_tool_choice(choice: &Value) -> Option<ToolChoice> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Any),
            _ => None,
        },
        Value::Object(obj) => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

pub fn chat_request_to_canonical(request: ChatRequest) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = message.content.map(|c| c.to_text()).filter(|t| !t.is_empty()) {
                    system_parts.push(text);
                }
            }
            "assistant" => messages.push(convert_assistant(message)),
            "tool" => push_tool_result(&mut messages, message),
            _ => messages.push(Message {
                role: Role::User,
                content: convert_user_content(message.content),
            }),
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| Tool {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: if tool.function.parameters.is_null() {
                    json!({"type": "object", "properties": {}})
                } else {
                    tool.function.parameters
                },
            })
            .collect()
    });

    MessagesRequest {
        model: request.model,
        messages,
        system: (!system_parts.is_empty()).then(|| SystemPrompt::Text(system_parts.join("\n\n"))),
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.map(|s| s.into_vec()),
        stream: request.stream,
        tools,
        tool_choice: request.tool_choice.as_ref().and_then(convert_tool_choice),
        thinking: request
            .reasoning_effort
            .as_deref()
            .and_then(budget_for_effort)
            .map(|budget_tokens| ThinkingConfig::Enabled { budget_tokens }),
        metadata: None,
    }
}

// ============================================================================
// Response: canonical → OpenAI
// ============================================================================

pub fn canonical_to_chat_response(response: &MessagesResponse) -> ChatResponse {
    let mut text = Vec::new();
    let mut reasoning = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => text.push(t.as_str()),
            ContentBlock::Thinking { thinking, .. } => reasoning.push(thinking.as_str()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: arguments_string(input),
                },
            }),
            _ => {}
        }
    }

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(ChatContent::Text(text.concat()))
        },
        reasoning_content: (!reasoning.is_empty()).then(|| reasoning.concat()),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    };

    ChatResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: current_timestamp(),
        model: response.model.clone(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: Some(map_stop_reason(response.stop_reason).to_string()),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
    }
}

// ============================================================================
// Streaming: canonical events → chat.completion.chunk frames
// ============================================================================

fn chunk(ctx: &StreamContext, delta: ChunkDelta, finish_reason: Option<String>) -> ChatChunk {
    ChatChunk {
        id: ctx.chat.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: ctx.chat.created,
        model: ctx.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage: None,
    }
}

fn encode_event(event: &StreamEvent, ctx: &mut StreamContext) -> Result<Option<String>, TransformError> {
    if ctx.chat.id.is_empty() {
        ctx.chat.id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        ctx.chat.created = current_timestamp();
    }

    let frame = match event {
        StreamEvent::MessageStart { message } => {
            ctx.record_usage(Some(message.usage.input_tokens), None);
            let delta = ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..Default::default()
            };
            chunk(ctx, delta, None)
        }
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse { id, name, .. },
        } => {
            let tool_index = ctx.chat.next_tool_index;
            ctx.chat.next_tool_index += 1;
            ctx.chat.tool_indices.insert(*index, tool_index);
            let delta = ChunkDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: tool_index,
                    id: Some(id.clone()),
                    kind: Some("function".to_string()),
                    function: Some(FunctionDelta {
                        name: Some(name.clone()),
                        arguments: Some(String::new()),
                    }),
                }]),
                ..Default::default()
            };
            chunk(ctx, delta, None)
        }
        StreamEvent::ContentBlockDelta { index, delta } => {
            let delta = match delta {
                BlockDelta::TextDelta { text } => ChunkDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                },
                BlockDelta::ThinkingDelta { thinking } => ChunkDelta {
                    reasoning_content: Some(thinking.clone()),
                    ..Default::default()
                },
                BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    let Some(tool_index) = ctx.chat.tool_indices.get(index).copied() else {
                        return Ok(None);
                    };
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_index,
                            function: Some(FunctionDelta {
                                name: None,
                                arguments: Some(partial_json.clone()),
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }
                }
                _ => return Ok(None),
            };
            chunk(ctx, delta, None)
        }
        StreamEvent::MessageDelta { delta, usage } => {
            let mut frame = chunk(
                ctx,
                ChunkDelta::default(),
                Some(map_stop_reason(delta.stop_reason).to_string()),
            );
            let prompt = usage
                .as_ref()
                .and_then(|u| u.input_tokens)
                .unwrap_or(ctx.input_tokens);
            let completion = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0);
            frame.usage = Some(ChatUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            });
            frame
        }
        StreamEvent::MessageStop => return Ok(Some("data: [DONE]\n\n".to_string())),
        StreamEvent::Error { error } => {
            let body = json!({"error": {"message": error.message, "type": error.kind}});
            return Ok(Some(encode_data(&body)?));
        }
        StreamEvent::ContentBlockStart { .. } | StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => {
            return Ok(None)
        }
    };
    Ok(Some(encode_data(&frame)?))
}

impl ClientCodec for ChatClient {
    fn decode_request(&self, body: &[u8]) -> Result<MessagesRequest, TransformError> {
        let request: ChatRequest = serde_json::from_slice(body)?;
        Ok(chat_request_to_canonical(request))
    }

    fn encode_response(&self, response: &MessagesResponse) -> Result<Vec<u8>, TransformError> {
        Ok(serde_json::to_vec(&canonical_to_chat_response(response))?)
    }

    fn encode_events(
        &self,
        events: &[StreamEvent],
        ctx: &mut StreamContext,
    ) -> Result<Vec<u8>, TransformError> {
        let mut out = String::new();
        for event in events {
            if let Some(frame) = encode_event(event, ctx)? {
                out.push_str(&frame);
            }
        }
        Ok(out.into_bytes())
    }
}

// ============================================================================
// Tests
// ============================================================================
