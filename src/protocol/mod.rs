//! Typed wire models for the canonical (Claude) schema and each backend dialect.

pub mod claude;
pub mod gemini;
pub mod openai_chat;
pub mod responses;

pub use claude::{
    BlockDelta, ContentBlock, DeltaUsage, ErrorBody, ImageSource, Message, MessageContent,
    MessageDeltaBody, MessagesRequest, MessagesResponse, Role, StopReason, StreamEvent,
    SystemPrompt, ThinkingConfig, Tool, ToolChoice, ToolResultContent, Usage,
};
