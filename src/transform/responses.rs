//! OpenAI Responses backend codec.
//!
//! Canonical messages flatten into `input` items; output items map back to
//! blocks. The stream side dispatches on the event `type` and feeds the
//! shared `StreamContext`.

use serde_json::{json, Value};
use tracing::{trace, warn};

use crate::config::Protocol;
use crate::error::TransformError;
use crate::protocol::responses::{
    InputContent, InputItem, OutputContent, OutputItem, ReasoningConfig, ResponseObject,
    ResponsesRequest, ResponsesStreamEvent, ResponsesTool, SummaryPart,
};
use crate::protocol::{
    ContentBlock, MessagesRequest, MessagesResponse, Role, StopReason, StreamEvent, ToolChoice,
    Usage,
};
use crate::sse::SseEvent;
use crate::transform::openai_chat::{arguments_string, effort_for_budget, parse_arguments};
use crate::transform::stream::generate_message_id;
use crate::transform::{BackendCodec, StreamContext};

pub struct ResponsesCodec;

// ============================================================================
// Request
// ============================================================================

fn flush_message(role: &str, content: &mut Vec<InputContent>, input: &mut Vec<InputItem>) {
    if content.is_empty() {
        return;
    }
    input.push(InputItem::Message {
        role: role.to_string(),
        content: std::mem::take(content),
    });
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "name": name}),
    }
}

pub fn build_responses_request(request: &MessagesRequest, model: &str) -> ResponsesRequest {
    let mut input = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::User | Role::Tool => "user",
        };
        let mut content = Vec::new();
        for block in message.content.to_blocks() {
            match block {
                ContentBlock::Text { text } if message.role == Role::Assistant => {
                    content.push(InputContent::OutputText { text })
                }
                ContentBlock::Text { text } => content.push(InputContent::InputText { text }),
                ContentBlock::Image { source } => content.push(InputContent::InputImage {
                    image_url: source.to_url(),
                }),
                ContentBlock::ToolUse { id, name, input: args } => {
                    flush_message(role, &mut content, &mut input);
                    input.push(InputItem::FunctionCall {
                        call_id: id,
                        name,
                        arguments: arguments_string(&args),
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content: result,
                    ..
                } => {
                    flush_message(role, &mut content, &mut input);
                    input.push(InputItem::FunctionCallOutput {
                        call_id: tool_use_id,
                        output: result.to_text(),
                    });
                }
                ContentBlock::Thinking { .. }
                | ContentBlock::RedactedThinking { .. }
                | ContentBlock::Unknown => {}
            }
        }
        flush_message(role, &mut content, &mut input);
    }

    let tools = request.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|tool| ResponsesTool {
                kind: "function".to_string(),
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect()
    });

    ResponsesRequest {
        model: model.to_string(),
        input,
        instructions: request.system_text(),
        tools,
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.is_stream().then_some(true),
        reasoning: request.thinking_budget().map(|budget| ReasoningConfig {
            effort: Some(effort_for_budget(budget).to_string()),
            summary: Some("auto".to_string()),
        }),
        store: Some(false),
    }
}

// ============================================================================
// Response
// ============================================================================

fn summary_text(summary: &[SummaryPart]) -> String {
    summary
        .iter()
        .filter_map(|part| match part {
            SummaryPart::SummaryText { text } => Some(text.as_str()),
            SummaryPart::Unknown => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn response_object_to_canonical(response: ResponseObject) -> MessagesResponse {
    let hit_limit = response.hit_token_limit();
    let id = if response.id.is_empty() {
        generate_message_id()
    } else {
        response.id
    };
    let mut out = MessagesResponse::new(id, response.model);
    let mut saw_tool = false;

    for item in response.output {
        match item {
            OutputItem::Reasoning { summary, .. } => {
                let thinking = summary_text(&summary);
                if !thinking.is_empty() {
                    out.content.push(ContentBlock::Thinking {
                        thinking,
                        signature: None,
                    });
                }
            }
            OutputItem::Message { content, .. } => {
                for part in content {
                    let text = match part {
                        OutputContent::OutputText { text } => text,
                        OutputContent::Refusal { refusal } => refusal,
                        OutputContent::Unknown => continue,
                    };
                    if !text.is_empty() {
                        out.content.push(ContentBlock::text(text));
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                saw_tool = true;
                out.content.push(ContentBlock::ToolUse {
                    id: call_id,
                    name,
                    input: parse_arguments(&arguments),
                });
            }
            OutputItem::Unknown => {}
        }
    }

    out.stop_reason = Some(if hit_limit {
        StopReason::MaxTokens
    } else if saw_tool {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    });
    if let Some(usage) = response.usage {
        out.usage = Usage::new(usage.input_tokens, usage.output_tokens);
    }
    out
}

// ============================================================================
// Streaming
// ============================================================================

fn record_response_usage(response: &ResponseObject, ctx: &mut StreamContext) {
    if let Some(usage) = response.usage {
        ctx.record_usage(Some(usage.input_tokens), Some(usage.output_tokens));
    }
}

fn on_item_added(item: OutputItem, ctx: &mut StreamContext, out: &mut Vec<StreamEvent>) {
    match item {
        OutputItem::FunctionCall {
            call_id,
            name,
            arguments,
            ..
        } => ctx.start_tool(None, &call_id, &name, &arguments, out),
        // Text and reasoning blocks open lazily on their first delta.
        _ => ctx.ensure_started(out),
    }
}

fn on_arguments_done(arguments: &str, ctx: &mut StreamContext, out: &mut Vec<StreamEvent>) {
    if !ctx.is_current_tool(None, None) {
        return;
    }
    // Some servers send only the final arguments without deltas.
    if ctx.tool_arguments().is_some_and(str::is_empty) {
        ctx.tool_arguments_delta(arguments, out);
    }
}

fn on_terminal(
    response: &ResponseObject,
    default_stop: Option<StopReason>,
    ctx: &mut StreamContext,
    out: &mut Vec<StreamEvent>,
) {
    record_response_usage(response, ctx);
    let stop = if response.hit_token_limit() {
        Some(StopReason::MaxTokens)
    } else {
        default_stop
    };
    ctx.finish(stop, out);
}

impl BackendCodec for ResponsesCodec {
    fn protocol(&self) -> Protocol {
        Protocol::OpenaiResponses
    }

    fn encode_request(&self, request: &MessagesRequest, model: &str) -> Result<Value, TransformError> {
        Ok(serde_json::to_value(build_responses_request(request, model))?)
    }

    fn decode_response(&self, body: &[u8]) -> Result<MessagesResponse, TransformError> {
        let response: ResponseObject = serde_json::from_slice(body)?;
        Ok(response_object_to_canonical(response))
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
        let parsed: ResponsesStreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(error = %err, "skipping unparseable responses event");
                return Ok(());
            }
        };
        if ctx.finished {
            return Ok(());
        }

        match parsed {
            ResponsesStreamEvent::Created { response } => {
                record_response_usage(&response, ctx);
                ctx.ensure_started(out);
            }
            ResponsesStreamEvent::OutputItemAdded { item, .. } => on_item_added(item, ctx, out),
            ResponsesStreamEvent::ReasoningDelta { delta } => ctx.thinking_delta(&delta, out),
            ResponsesStreamEvent::OutputTextDelta { delta } => ctx.text_delta(&delta, out),
            ResponsesStreamEvent::FunctionCallArgumentsDelta { delta, .. } => {
                ctx.tool_arguments_delta(&delta, out)
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone { arguments, .. } => {
                on_arguments_done(&arguments, ctx, out)
            }
            ResponsesStreamEvent::OutputItemDone { .. } => ctx.close_open(out),
            ResponsesStreamEvent::Completed { response } => on_terminal(&response, None, ctx, out),
            ResponsesStreamEvent::Incomplete { response } => {
                on_terminal(&response, Some(StopReason::EndTurn), ctx, out)
            }
            ResponsesStreamEvent::Failed { response } => {
                warn!(response_id = %response.id, "upstream response failed");
                ctx.fail("upstream response failed", out);
            }
            ResponsesStreamEvent::Error { message } => {
                warn!(error = %message, "upstream stream error");
                ctx.fail(&message, out);
            }
            ResponsesStreamEvent::Other => {}
        }
        Ok(())
    }
}
