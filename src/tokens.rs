//! Heuristic token estimation.
//!
//! Used by the count-tokens endpoint and as the fallback when a backend
//! reports no usage. Text density is interpolated between ASCII-heavy
//! (~4 chars/token) and CJK-heavy (~1.5 chars/token) content.

use base64::Engine;

use crate::protocol::{ContentBlock, ImageSource, Message, MessagesRequest, MessagesResponse, Tool};

const BASE_OVERHEAD: u64 = 3;
const PER_MESSAGE_OVERHEAD: u64 = 4;

const ASCII_CHARS_PER_TOKEN: f64 = 4.0;
const CJK_CHARS_PER_TOKEN: f64 = 1.5;
/// Only the head of a text is sampled for its CJK share.
const CJK_SAMPLE_CHARS: usize = 500;

const IMAGE_FALLBACK_TOKENS: u64 = 1500;
const IMAGE_MIN_TOKENS: u64 = 85;
const IMAGE_PIXELS_PER_TOKEN: u64 = 750;

/// Per-bucket tool overheads; larger tool sets amortise their framing.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ToolBucket {
    shared: u64,
    per_tool: u64,
    schema_bytes_per_token: f64,
    schema_floor: u64,
}

fn tool_bucket(count: usize) -> ToolBucket {
    match count {
        0 | 1 => ToolBucket {
            shared: 120,
            per_tool: 40,
            schema_bytes_per_token: 2.5,
            schema_floor: 30,
        },
        2..=5 => ToolBucket {
            shared: 90,
            per_tool: 30,
            schema_bytes_per_token: 3.0,
            schema_floor: 20,
        },
        _ => ToolBucket {
            shared: 60,
            per_tool: 20,
            schema_bytes_per_token: 3.5,
            schema_floor: 15,
        },
    }
}

pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x11FF     // Hangul Jamo
        | 0x3000..=0x303F   // CJK punctuation
        | 0x3040..=0x309F   // Hiragana
        | 0x30A0..=0x30FF   // Katakana
        | 0x3400..=0x4DBF   // CJK Extension A
        | 0x4E00..=0x9FFF   // CJK Unified Ideographs
        | 0xAC00..=0xD7AF   // Hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0xFF00..=0xFFEF   // Fullwidth forms
        | 0x20000..=0x2A6DF // CJK Extension B
    )
}

/// Characters per token for `text`, from the CJK share of its first 500 chars.
pub fn chars_per_token(text: &str) -> f64 {
    let mut sampled = 0usize;
    let mut cjk = 0usize;
    for c in text.chars().take(CJK_SAMPLE_CHARS) {
        sampled += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    if sampled == 0 {
        return ASCII_CHARS_PER_TOKEN;
    }
    let share = cjk as f64 / sampled as f64;
    ASCII_CHARS_PER_TOKEN - (ASCII_CHARS_PER_TOKEN - CJK_CHARS_PER_TOKEN) * share
}

pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f64;
    (chars / chars_per_token(text)).ceil() as u64
}

pub fn estimate_image_tokens(source: &ImageSource) -> u64 {
    match source {
        ImageSource::Base64 { data, .. } => image_dimensions(data)
            .map(|(w, h)| (w * h / IMAGE_PIXELS_PER_TOKEN).max(IMAGE_MIN_TOKENS))
            .unwrap_or(IMAGE_FALLBACK_TOKENS),
        ImageSource::Url { .. } => IMAGE_FALLBACK_TOKENS,
    }
}

/// Read width/height from a PNG or GIF header without decoding the image.
fn image_dimensions(base64_data: &str) -> Option<(u64, u64)> {
    // 32 base64 chars decode to 24 bytes, enough for both headers.
    let head = base64_data.get(..32)?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(head).ok()?;

    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") && bytes.len() >= 24 {
        let w = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let h = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return Some((w as u64, h as u64));
    }
    if bytes.starts_with(b"GIF8") && bytes.len() >= 10 {
        let w = u16::from_le_bytes([bytes[6], bytes[7]]);
        let h = u16::from_le_bytes([bytes[8], bytes[9]]);
        return Some((w as u64, h as u64));
    }
    None
}

pub fn estimate_block_tokens(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => estimate_text_tokens(text),
        ContentBlock::Thinking { thinking, .. } => estimate_text_tokens(thinking),
        ContentBlock::RedactedThinking { data } => estimate_text_tokens(data),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => {
            let images: u64 = match content {
                crate::protocol::ToolResultContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Image { source } => Some(estimate_image_tokens(source)),
                        _ => None,
                    })
                    .sum(),
                crate::protocol::ToolResultContent::Text(_) => 0,
            };
            estimate_text_tokens(&content.to_text()) + images
        }
        ContentBlock::Image { source } => estimate_image_tokens(source),
        ContentBlock::Unknown => 0,
    }
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    PER_MESSAGE_OVERHEAD
        + message
            .content
            .to_blocks()
            .iter()
            .map(estimate_block_tokens)
            .sum::<u64>()
}

pub fn estimate_tools_tokens(tools: &[Tool]) -> u64 {
    if tools.is_empty() {
        return 0;
    }
    let bucket = tool_bucket(tools.len());
    let per_tool: u64 = tools
        .iter()
        .map(|tool| {
            let bytes = tool.name.len()
                + tool.description.as_deref().map_or(0, str::len)
                + tool.input_schema.to_string().len();
            let schema_tokens = (bytes as f64 / bucket.schema_bytes_per_token).ceil() as u64;
            bucket.per_tool + schema_tokens.max(bucket.schema_floor)
        })
        .sum();
    bucket.shared + per_tool
}

/// Estimated input tokens for a whole canonical request.
pub fn estimate_request_tokens(request: &MessagesRequest) -> u64 {
    let system = request
        .system_text()
        .map(|s| estimate_text_tokens(&s))
        .unwrap_or(0);
    let messages: u64 = request.messages.iter().map(estimate_message_tokens).sum();
    let tools = request
        .tools
        .as_deref()
        .map(estimate_tools_tokens)
        .unwrap_or(0);
    BASE_OVERHEAD + system + messages + tools
}

/// Estimated output tokens for a canonical response.
pub fn estimate_response_tokens(response: &MessagesResponse) -> u64 {
    response.content.iter().map(estimate_block_tokens).sum()
}
