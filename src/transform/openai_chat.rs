//! OpenAI Chat Completions backend codec.
//!
//! Request side flattens canonical blocks into OpenAI's role-based message
//! list. Response side maps `choices[0]` back into blocks, and the stream
//! side drives the shared `StreamContext` state machine from chunk deltas.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::Protocol;
use crate::error::TransformError;
use crate::protocol::openai_chat::{
    ChatChunk, ChatContent, ChatMessage, ChatPart, ChatRequest, ChatResponse, ChatTool,
    FunctionCall, FunctionDef, ImageUrl, StopSpec, StreamOptions, ToolCall,
};
use crate::protocol::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, Role, StopReason, StreamEvent,
    ToolChoice, Usage,
};
use crate::sse::SseEvent;
use crate::transform::stream::{generate_message_id, generate_tool_id};
use crate::transform::{BackendCodec, StreamContext};

/// Map OpenAI `finish_reason` to a canonical stop reason.
///
/// Unknown values (including `content_filter`) are treated as a normal stop.
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Parse tool-call argument JSON; unparseable text is preserved under
/// `_raw_arguments` instead of failing the response.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "tool arguments are not valid JSON");
            json!({ "_raw_arguments": raw })
        }
    }
}

/// Thinking budget → OpenAI `reasoning_effort`.
pub fn effort_for_budget(budget: u32) -> &'static str {
    match budget {
        0..=4095 => "low",
        4096..=16383 => "medium",
        _ => "high",
    }
}

/// OpenAI `reasoning_effort` → thinking budget.
pub fn budget_for_effort(effort: &str) -> Option<u32> {
    match effort {
        "minimal" | "low" => Some(2048),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}

/// Tool input as an OpenAI `arguments` string.
pub fn arguments_string(input: &Value) -> String {
    if input.is_null() {
        "{}".to_string()
    } else {
        input.to_string()
    }
}

pub struct OpenAiChatCodec;

// ============================================================================
// Request
// ============================================================================

fn push_user_parts(messages: &mut Vec<ChatMessage>, parts: Vec<ChatPart>) {
    if parts.is_empty() {
        return;
    }
    let only_text = parts.iter().all(|p| matches!(p, ChatPart::Text { .. }));
    let content = if only_text {
        ChatContent::Text(
            parts
                .iter()
                .filter_map(|p| match p {
                    ChatPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    } else {
        ChatContent::Parts(parts)
    };
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: Some(content),
        ..Default::default()
    });
}

fn convert_user(message: &Message, seen_calls: &HashSet<String>, out: &mut Vec<ChatMessage>) {
    let mut parts = Vec::new();
    for block in message.content.to_blocks() {
        match block {
            ContentBlock::Text { text } => parts.push(ChatPart::Text { text }),
            ContentBlock::Image { source } => parts.push(ChatPart::ImageUrl {
                image_url: ImageUrl {
                    url: source.to_url(),
                    detail: None,
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                if seen_calls.contains(&tool_use_id) {
                    out.push(ChatMessage {
                        role: "tool".to_string(),
                        content: Some(ChatContent::Text(content.to_text())),
                        tool_call_id: Some(tool_use_id),
                        ..Default::default()
                    });
                } else {
                    parts.push(ChatPart::Text {
                        text: format!("[tool_result {}] {}", tool_use_id, content.to_text()),
                    });
                }
            }
            // Thinking and tool-use only appear in assistant turns.
            ContentBlock::Thinking { .. }
            | ContentBlock::RedactedThinking { .. }
            | ContentBlock::ToolUse { .. }
            | ContentBlock::Unknown => {}
        }
    }
    push_user_parts(out, parts);
}

fn convert_assistant(message: &Message, seen_calls: &mut HashSet<String>, out: &mut Vec<ChatMessage>) {
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in message.content.to_blocks() {
        match block {
            ContentBlock::Text { text: t } => text.push(t),
            ContentBlock::ToolUse { id, name, input } => {
                seen_calls.insert(id.clone());
                tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name,
                        arguments: arguments_string(&input),
                    },
                });
            }
            _ => {}
        }
    }
    if text.is_empty() && tool_calls.is_empty() {
        return;
    }
    out.push(ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| ChatContent::Text(text.join(""))),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    });
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

pub fn build_chat_request(request: &MessagesRequest, model: &str) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = request.system_text() {
        messages.push(ChatMessage::text("system", system));
    }

    let mut seen_calls = HashSet::new();
    for message in &request.messages {
        match message.role {
            Role::Assistant => convert_assistant(message, &mut seen_calls, &mut messages),
            Role::System => {
                let text = message
                    .content
                    .to_blocks()
                    .into_iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if !text.is_empty() {
                    messages.push(ChatMessage::text("system", text));
                }
            }
            Role::User | Role::Tool => convert_user(message, &seen_calls, &mut messages),
        }
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|tool| ChatTool {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect()
    });

    let stream = request.is_stream();
    ChatRequest {
        model: model.to_string(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request
            .stop_sequences
            .clone()
            .filter(|s| !s.is_empty())
            .map(StopSpec::Many),
        stream: stream.then_some(true),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools,
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        reasoning_effort: request
            .thinking_budget()
            .map(|budget| effort_for_budget(budget).to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Response
// ============================================================================

pub fn chat_response_to_canonical(response: ChatResponse) -> Result<MessagesResponse, TransformError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TransformError::malformed("chat completion", "missing choices"))?;

    let id = if response.id.is_empty() {
        generate_message_id()
    } else {
        response.id
    };
    let mut out = MessagesResponse::new(id, response.model);

    let message = choice.message;
    if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
        out.content.push(ContentBlock::Thinking {
            thinking: reasoning,
            signature: None,
        });
    }
    if let Some(text) = message.content.map(|c| c.to_text()).filter(|t| !t.is_empty()) {
        out.content.push(ContentBlock::text(text));
    }
    for call in message.tool_calls.unwrap_or_default() {
        out.content.push(ContentBlock::ToolUse {
            id: if call.id.is_empty() {
                generate_tool_id()
            } else {
                call.id
            },
            name: call.function.name,
            input: parse_arguments(&call.function.arguments),
        });
    }

    let finish = choice.finish_reason.as_deref().unwrap_or("stop");
    out.stop_reason = Some(map_finish_reason(finish));
    if let Some(usage) = response.usage {
        out.usage = Usage::new(usage.prompt_tokens, usage.completion_tokens);
    }
    Ok(out)
}

impl BackendCodec for OpenAiChatCodec {
    fn protocol(&self) -> Protocol {
        Protocol::OpenaiChat
    }

    fn encode_request(&self, request: &MessagesRequest, model: &str) -> Result<Value, TransformError> {
        Ok(serde_json::to_value(build_chat_request(request, model))?)
    }

    fn decode_response(&self, body: &[u8]) -> Result<MessagesResponse, TransformError> {
        let response: ChatResponse = serde_json::from_slice(body)?;
        chat_response_to_canonical(response)
    }

    fn decode_event(
        &self,
        event: &SseEvent,
        ctx: &mut StreamContext,
        out: &mut Vec<StreamEvent>,
    ) -> Result<(), TransformError> {
        if event.is_done() {
            ctx.finish(None, out);
            return Ok(());
        }
        if event.data.trim().is_empty() {
            return Ok(());
        }
        let chunk: ChatChunk = match serde_json::from_str(&event.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                trace!(error = %err, "skipping unparseable chat chunk");
                return Ok(());
            }
        };

        let has_usage = chunk.usage.is_some();
        if let Some(usage) = chunk.usage {
            ctx.record_usage(Some(usage.prompt_tokens), Some(usage.completion_tokens));
        }
        if ctx.finished {
            return Ok(());
        }
        if chunk.choices.is_empty() {
            if has_usage && ctx.finish_deferred {
                ctx.finish(None, out);
            }
            return Ok(());
        }
        if ctx.message_id.is_none() && !chunk.id.is_empty() {
            ctx.message_id = Some(chunk.id);
        }
        ctx.ensure_started(out);

        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            let delta = choice.delta;

            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if ctx.thinking_enabled {
                    ctx.thinking_delta(&reasoning, out);
                }
            }
            if let Some(text) = delta.content {
                ctx.text_delta(&text, out);
            }

            for call in delta.tool_calls.unwrap_or_default() {
                let id = call.id.as_deref().filter(|id| !id.is_empty());
                let (name, fragment) = match call.function {
                    Some(f) => (f.name, f.arguments.unwrap_or_default()),
                    None => (None, String::new()),
                };
                if ctx.is_current_tool(Some(call.index), id) {
                    ctx.tool_arguments_delta(&fragment, out);
                } else if id.is_some() || name.is_some() {
                    let id = id.map(str::to_string).unwrap_or_else(generate_tool_id);
                    ctx.start_tool(
                        Some(call.index),
                        &id,
                        name.as_deref().unwrap_or_default(),
                        "",
                        out,
                    );
                    ctx.tool_arguments_delta(&fragment, out);
                } else {
                    trace!(index = call.index, "dropping fragment for unknown tool call");
                }
            }

            // Usage arrives in a trailing chunk when include_usage is set.
            if let Some(reason) = choice.finish_reason {
                ctx.defer_finish(map_finish_reason(&reason), out);
            }
        }
        if has_usage && ctx.finish_deferred {
            ctx.finish(None, out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BlockDelta;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn chunk(value: Value) -> SseEvent {
        SseEvent::data(value.to_string())
    }

    #[test]
    fn test_request_maps_system_tools_and_results() {
        let req = request(json!({
            "model": "claude",
            "max_tokens": 100,
            "system": [{"type": "text", "text": "You are terse."}],
            "stream": true,
            "messages": [
                {"role": "user", "content": "list files"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Sure."},
                    {"type": "tool_use", "id": "call_1", "name": "ls", "input": {"path": "."}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": [
                        {"type": "text", "text": "a.txt"}, {"type": "text", "text": "b.txt"}
                    ]},
                    {"type": "tool_result", "tool_use_id": "call_missing", "content": "lost"}
                ]}
            ],
            "tools": [{"name": "ls", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"},
            "thinking": {"type": "enabled", "budget_tokens": 8000}
        }));

        let value = OpenAiChatCodec.encode_request(&req, "gpt-4o").unwrap();
        let messages = value["messages"].as_array().unwrap();
        assert_eq!(messages[0], json!({"role": "system", "content": "You are terse."}));
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"path":"."}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(messages[3]["content"], "a.txt\nb.txt");
        assert_eq!(messages[4]["role"], "user");
        assert_eq!(messages[4]["content"], "[tool_result call_missing] lost");

        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tool_choice"], "required");
        assert_eq!(value["reasoning_effort"], "medium");
        assert_eq!(value["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_named_tool_choice_becomes_function_object() {
        let req = request(json!({
            "model": "m", "messages": [],
            "tool_choice": {"type": "tool", "name": "search"}
        }));
        let value = OpenAiChatCodec.encode_request(&req, "gpt").unwrap();
        assert_eq!(
            value["tool_choice"],
            json!({"type": "function", "function": {"name": "search"}})
        );
    }

    #[test]
    fn test_text_survives_request_and_response() {
        let req = request(json!({
            "model": "m", "messages": [{"role": "user", "content": "Grüße, 世界"}]
        }));
        let value = OpenAiChatCodec.encode_request(&req, "gpt").unwrap();
        assert_eq!(value["messages"][0]["content"], "Grüße, 世界");

        let body = json!({
            "id": "chatcmpl-1", "model": "gpt",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Grüße, 世界"},
                         "finish_reason": "stop"}]
        })
        .to_string();
        let response = OpenAiChatCodec.decode_response(body.as_bytes()).unwrap();
        assert_eq!(response.content, vec![ContentBlock::text("Grüße, 世界")]);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn test_response_maps_reasoning_tools_and_bad_arguments() {
        let body = json!({
            "id": "chatcmpl-2", "model": "gpt",
            "choices": [{"index": 0, "finish_reason": "tool_calls", "message": {
                "role": "assistant", "content": null, "reasoning_content": "thinking...",
                "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "a", "arguments": "{\"x\":1}"}},
                    {"id": "c2", "type": "function", "function": {"name": "b", "arguments": "{oops"}}
                ]
            }}],
            "usage": {"prompt_tokens": 11, "completion_tokens": 4, "total_tokens": 15}
        })
        .to_string();

        let response = OpenAiChatCodec.decode_response(body.as_bytes()).unwrap();
        assert!(matches!(&response.content[0], ContentBlock::Thinking { thinking, .. } if thinking == "thinking..."));
        assert!(matches!(&response.content[1], ContentBlock::ToolUse { input, .. } if input == &json!({"x": 1})));
        assert!(
            matches!(&response.content[2], ContentBlock::ToolUse { input, .. } if input == &json!({"_raw_arguments": "{oops"}))
        );
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(response.usage, Usage::new(11, 4));
    }

    #[test]
    fn test_finish_reasons_map() {
        assert_eq!(map_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("length"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("content_filter"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("something_new"), StopReason::EndTurn);
    }

    #[test]
    fn test_empty_choices_is_malformed() {
        let err = OpenAiChatCodec
            .decode_response(br#"{"id":"x","choices":[]}"#)
            .unwrap_err();
        assert!(matches!(err, TransformError::Malformed { .. }));
    }

    #[test]
    fn test_five_argument_fragments_reassemble() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        let codec = OpenAiChatCodec;

        codec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_9", "type": "function",
                     "function": {"name": "weather", "arguments": ""}}
                ]}}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        for fragment in [r#"{"ci"#, r#"ty": "#, r#""Par"#, r#"is", "days""#, r#": 3}"#] {
            codec
                .decode_event(
                    &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                        {"index": 0, "function": {"arguments": fragment}}
                    ]}}]})),
                    &mut ctx,
                    &mut out,
                )
                .unwrap();
        }
        codec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();

        let fragments: Vec<&str> = out
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } if !partial_json.is_empty() => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments.len(), 5);
        let joined = fragments.concat();
        let parsed: Value = serde_json::from_str(&joined).unwrap();
        assert_eq!(parsed, json!({"city": "Paris", "days": 3}));

        // Block start is followed immediately by an empty argument delta.
        let start = out
            .iter()
            .position(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
            .unwrap();
        assert!(matches!(
            &out[start + 1],
            StreamEvent::ContentBlockDelta { delta: BlockDelta::InputJsonDelta { partial_json }, .. }
                if partial_json.is_empty()
        ));
        assert_eq!(ctx.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn test_finish_then_done_closes_once() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        let codec = OpenAiChatCodec;
        codec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "hi"}}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        codec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        codec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [],
                              "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        codec.decode_event(&SseEvent::data("[DONE]"), &mut ctx, &mut out).unwrap();

        let stops = out.iter().filter(|e| matches!(e, StreamEvent::MessageStop)).count();
        let deltas = out
            .iter()
            .filter(|e| matches!(e, StreamEvent::MessageDelta { .. }))
            .count();
        assert_eq!((stops, deltas), (1, 1));
        assert_eq!((ctx.input_tokens, ctx.output_tokens), (9, 2));
    }

    #[test]
    fn test_message_delta_carries_trailing_usage() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        let codec = OpenAiChatCodec;
        for value in [
            json!({"id": "chatcmpl-42", "choices": [{"index": 0, "delta": {"content": "Hello there"}}]}),
            json!({"id": "chatcmpl-42", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ] {
            codec.decode_event(&chunk(value), &mut ctx, &mut out).unwrap();
        }
        assert!(!out.iter().any(|e| matches!(e, StreamEvent::MessageDelta { .. })));
        assert!(matches!(out.last(), Some(StreamEvent::ContentBlockStop { .. })));

        codec
            .decode_event(
                &chunk(json!({"id": "chatcmpl-42", "choices": [],
                              "usage": {"prompt_tokens": 1200, "completion_tokens": 42, "total_tokens": 1242}})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        codec.decode_event(&SseEvent::data("[DONE]"), &mut ctx, &mut out).unwrap();

        match &out[0] {
            StreamEvent::MessageStart { message } => assert_eq!(message.id, "chatcmpl-42"),
            other => panic!("expected message_start, got {:?}", other),
        }
        let deltas: Vec<&StreamEvent> = out
            .iter()
            .filter(|e| matches!(e, StreamEvent::MessageDelta { .. }))
            .collect();
        assert_eq!(deltas.len(), 1);
        match deltas[0] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                let usage = usage.as_ref().unwrap();
                assert_eq!(usage.input_tokens, Some(1200));
                assert_eq!(usage.output_tokens, 42);
            }
            _ => unreachable!(),
        }
        assert!(matches!(out.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn test_finish_chunk_with_inline_usage_closes_immediately() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        OpenAiChatCodec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "ok"},
                    "finish_reason": "length"}],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6}})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        assert!(ctx.finished);
        assert!(matches!(out.last(), Some(StreamEvent::MessageStop)));
        assert_eq!(ctx.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn test_deferred_finish_closes_at_eof() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        OpenAiChatCodec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "x"},
                    "finish_reason": "tool_calls"}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        assert!(!ctx.finished);
        ctx.finish(None, &mut out);
        assert_eq!(ctx.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(out.last(), Some(StreamEvent::MessageStop)));
    }

    #[test]
    fn test_done_without_finish_reason_closes_stream() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        OpenAiChatCodec
            .decode_event(
                &chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "partial"}}]})),
                &mut ctx,
                &mut out,
            )
            .unwrap();
        OpenAiChatCodec
            .decode_event(&SseEvent::data("[DONE]"), &mut ctx, &mut out)
            .unwrap();
        assert!(matches!(out.last(), Some(StreamEvent::MessageStop)));
        assert!(ctx.finished);
    }

    #[test]
    fn test_reasoning_is_dropped_unless_thinking_enabled() {
        let reasoning = chunk(json!({"id": "c", "choices": [{"index": 0,
            "delta": {"reasoning_content": "let me think"}}]}));
        let text = chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "ok"}}]}));

        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        OpenAiChatCodec.decode_event(&reasoning, &mut ctx, &mut out).unwrap();
        assert!(!out
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentBlockDelta { delta: BlockDelta::ThinkingDelta { .. }, .. })));

        let mut ctx = StreamContext::new("gpt", true);
        let mut out = Vec::new();
        OpenAiChatCodec.decode_event(&reasoning, &mut ctx, &mut out).unwrap();
        OpenAiChatCodec.decode_event(&text, &mut ctx, &mut out).unwrap();
        let kinds: Vec<&str> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta"
            ]
        );
    }

    #[test]
    fn test_parallel_tool_calls_get_increasing_indices() {
        let mut ctx = StreamContext::new("gpt", false);
        let mut out = Vec::new();
        let calls = chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "a", "function": {"name": "one", "arguments": "{}"}},
            {"index": 1, "id": "b", "function": {"name": "two", "arguments": "{}"}}
        ]}}]}));
        OpenAiChatCodec.decode_event(&calls, &mut ctx, &mut out).unwrap();
        OpenAiChatCodec.decode_event(&SseEvent::data("[DONE]"), &mut ctx, &mut out).unwrap();

        let starts: Vec<usize> = out
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1]);
        let stops = out
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStop { .. }))
            .count();
        assert_eq!(stops, 2);
    }
}
