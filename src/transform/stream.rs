//! Per-stream conversion state and the canonical event builders shared by
//! every backend codec.
//!
//! A `StreamContext` is created by the task that pumps one upstream stream
//! and is passed by `&mut` into each chunk conversion. Transformers never
//! hold one, so a single transformer instance serves any number of
//! concurrent streams.

use std::collections::HashMap;

use serde_json::json;

use crate::protocol::{
    BlockDelta, ContentBlock, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse,
    StopReason, StreamEvent, Usage,
};

/// The single content block currently open in the canonical output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBlock {
    Text,
    Thinking,
    Tool,
}

/// Tool call whose arguments are still streaming.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolAccumulator {
    /// Backend-side index (OpenAI `tool_calls[].index`), when the dialect has one.
    pub backend_index: Option<u32>,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Encoder state for clients speaking OpenAI Chat.
#[derive(Debug, Clone, Default)]
pub struct ChatEncodeState {
    pub id: String,
    pub created: u64,
    /// Canonical block index → OpenAI tool_calls index.
    pub tool_indices: HashMap<usize, u32>,
    pub next_tool_index: u32,
}

#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Model name reported to the client in `message_start`.
    pub model: String,
    pub thinking_enabled: bool,
    pub message_id: Option<String>,
    pub message_started: bool,
    /// Set once the closing `message_delta`/`message_stop` pair is emitted.
    pub finished: bool,
    /// Stop reason seen; the closing pair waits for trailing usage.
    pub finish_deferred: bool,
    pub open: Option<OpenBlock>,
    pub current_index: usize,
    pub next_index: usize,
    pub tool: Option<ToolAccumulator>,
    pub saw_tool_use: bool,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Visible characters emitted, for estimating output when usage is missing.
    pub output_chars: usize,
    pub chat: ChatEncodeState,
}

impl StreamContext {
    pub fn new(model: impl Into<String>, thinking_enabled: bool) -> Self {
        Self {
            model: model.into(),
            thinking_enabled,
            message_id: None,
            message_started: false,
            finished: false,
            finish_deferred: false,
            open: None,
            current_index: 0,
            next_index: 0,
            tool: None,
            saw_tool_use: false,
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            output_chars: 0,
            chat: ChatEncodeState::default(),
        }
    }

    /// Record backend-reported usage; zero or absent values keep prior counts.
    pub fn record_usage(&mut self, input: Option<u64>, output: Option<u64>) {
        if let Some(input) = input.filter(|v| *v > 0) {
            self.input_tokens = input;
        }
        if let Some(output) = output.filter(|v| *v > 0) {
            self.output_tokens = output;
        }
    }

    pub fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        let id = self
            .message_id
            .get_or_insert_with(generate_message_id)
            .clone();
        let mut message = MessagesResponse::new(id, self.model.clone());
        message.usage = Usage::new(self.input_tokens, 0);
        out.push(StreamEvent::MessageStart { message });
        self.message_started = true;
    }

    fn open_block(&mut self, kind: OpenBlock, content_block: ContentBlock, out: &mut Vec<StreamEvent>) {
        self.close_open(out);
        self.current_index = self.next_index;
        self.next_index += 1;
        self.open = Some(kind);
        out.push(StreamEvent::ContentBlockStart {
            index: self.current_index,
            content_block,
        });
    }

    /// Close whichever block is open, if any.
    pub fn close_open(&mut self, out: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            out.push(StreamEvent::ContentBlockStop {
                index: self.current_index,
            });
        }
        self.tool = None;
    }

    pub fn text_delta(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.ensure_started(out);
        if self.open != Some(OpenBlock::Text) {
            self.open_block(OpenBlock::Text, ContentBlock::text(""), out);
        }
        self.output_chars += text.chars().count();
        out.push(StreamEvent::ContentBlockDelta {
            index: self.current_index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    pub fn thinking_delta(&mut self, thinking: &str, out: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        self.ensure_started(out);
        if self.open != Some(OpenBlock::Thinking) {
            self.open_block(
                OpenBlock::Thinking,
                ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
                out,
            );
        }
        self.output_chars += thinking.chars().count();
        out.push(StreamEvent::ContentBlockDelta {
            index: self.current_index,
            delta: BlockDelta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    /// Open a tool-use block: start event plus an initial argument delta
    /// (empty unless the first fragment arrived with the header).
    pub fn start_tool(
        &mut self,
        backend_index: Option<u32>,
        id: &str,
        name: &str,
        first_fragment: &str,
        out: &mut Vec<StreamEvent>,
    ) {
        self.ensure_started(out);
        self.open_block(
            OpenBlock::Tool,
            ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: json!({}),
            },
            out,
        );
        self.saw_tool_use = true;
        self.tool = Some(ToolAccumulator {
            backend_index,
            id: id.to_string(),
            name: name.to_string(),
            arguments: first_fragment.to_string(),
        });
        self.output_chars += first_fragment.chars().count();
        out.push(StreamEvent::ContentBlockDelta {
            index: self.current_index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: first_fragment.to_string(),
            },
        });
    }

    /// Whether the open tool block belongs to `backend_index`/`id`.
    pub fn is_current_tool(&self, backend_index: Option<u32>, id: Option<&str>) -> bool {
        if self.open != Some(OpenBlock::Tool) {
            return false;
        }
        let Some(tool) = &self.tool else {
            return false;
        };
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if id != tool.id {
                return false;
            }
        }
        backend_index.is_none() || tool.backend_index.is_none() || tool.backend_index == backend_index
    }

    /// Append an argument fragment to the open tool block; ignored otherwise.
    pub fn tool_arguments_delta(&mut self, fragment: &str, out: &mut Vec<StreamEvent>) {
        if fragment.is_empty() || self.open != Some(OpenBlock::Tool) {
            return;
        }
        if let Some(tool) = self.tool.as_mut() {
            tool.arguments.push_str(fragment);
        }
        self.output_chars += fragment.chars().count();
        out.push(StreamEvent::ContentBlockDelta {
            index: self.current_index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: fragment.to_string(),
            },
        });
    }

    /// Arguments accumulated so far for the open tool block.
    pub fn tool_arguments(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.arguments.as_str())
    }

    /// Emit a complete tool-use block in one go (Gemini delivers whole calls).
    pub fn whole_tool(&mut self, id: &str, name: &str, arguments: &str, out: &mut Vec<StreamEvent>) {
        self.start_tool(None, id, name, arguments, out);
        self.close_open(out);
    }

    /// Close open blocks and remember `stop_reason` without emitting the
    /// closing pair. A later `finish(None, ..)` reports it with final usage.
    pub fn defer_finish(&mut self, stop_reason: StopReason, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);
        self.close_open(out);
        self.stop_reason = Some(stop_reason);
        self.finish_deferred = true;
    }

    /// Close everything and emit `message_delta` + `message_stop`, once.
    pub fn finish(&mut self, stop_reason: Option<StopReason>, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);
        self.close_open(out);
        let stop_reason = stop_reason.or(self.stop_reason).unwrap_or(if self.saw_tool_use {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        self.stop_reason = Some(stop_reason);
        if self.output_tokens == 0 && self.output_chars > 0 {
            // Backend sent no usage (yet); a later usage chunk still overrides this.
            self.output_tokens = self.output_chars.div_ceil(4) as u64;
        }
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Some(DeltaUsage {
                input_tokens: (self.input_tokens > 0).then_some(self.input_tokens),
                output_tokens: self.output_tokens,
            }),
        });
        out.push(StreamEvent::MessageStop);
        self.finished = true;
    }

    /// Terminate the stream with an error event instead of a normal stop.
    pub fn fail(&mut self, message: &str, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.close_open(out);
        out.push(StreamEvent::Error {
            error: ErrorBody {
                kind: "api_error".to_string(),
                message: message.to_string(),
            },
        });
        self.finished = true;
    }
}

pub fn generate_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn generate_tool_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

/// Replay a complete response as the canonical event sequence a streaming
/// backend would have produced.
pub fn response_to_events(response: &MessagesResponse) -> Vec<StreamEvent> {
    let mut start = response.clone();
    start.content = Vec::new();
    start.stop_reason = None;
    start.stop_sequence = None;
    start.usage = Usage::new(response.usage.input_tokens, 0);

    let mut events = vec![StreamEvent::MessageStart { message: start }];
    let blocks = response
        .content
        .iter()
        .filter(|block| !matches!(block, ContentBlock::Unknown));
    for (index, block) in blocks.enumerate() {
        let (head, delta) = match block {
            ContentBlock::Text { text } => (
                ContentBlock::text(""),
                Some(BlockDelta::TextDelta { text: text.clone() }),
            ),
            ContentBlock::Thinking { thinking, signature } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: thinking.clone(),
                    },
                });
                if let Some(signature) = signature.as_ref().filter(|s| !s.is_empty()) {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::SignatureDelta {
                            signature: signature.clone(),
                        },
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
                continue;
            }
            ContentBlock::ToolUse { id, name, input } => (
                ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: json!({}),
                },
                Some(BlockDelta::InputJsonDelta {
                    partial_json: if input.is_null() {
                        "{}".to_string()
                    } else {
                        input.to_string()
                    },
                }),
            ),
            other => (other.clone(), None),
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: head,
        });
        if let Some(delta) = delta {
            events.push(StreamEvent::ContentBlockDelta { index, delta });
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    events.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: Some(response.stop_reason.unwrap_or(StopReason::EndTurn)),
            stop_sequence: response.stop_sequence.clone(),
        },
        usage: Some(DeltaUsage {
            input_tokens: None,
            output_tokens: response.usage.output_tokens,
        }),
    });
    events.push(StreamEvent::MessageStop);
    events
}
