//! Server-sent events: parsing upstream streams, encoding client frames and
//! relaying a converted stream to the client.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::TransformError;
use crate::protocol::StreamEvent;
use crate::rotation::InFlightGuard;
use crate::stats::StatsCollector;
use crate::transform::StreamContext;
use crate::transformer::Transformer;

/// One server-sent event: optional `event:` name and joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.to_string()),
            data: data.into(),
        }
    }

    /// OpenAI-style `[DONE]` sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Re-encode as wire bytes.
    pub fn to_frame(&self) -> String {
        let mut frame = String::new();
        if let Some(event) = &self.event {
            frame.push_str("event: ");
            frame.push_str(event);
            frame.push('\n');
        }
        for line in self.data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}

/// Incremental SSE line parser.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }

        events
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.push_bytes(chunk.as_bytes())
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }
        self.finish_event(&mut events);
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.finish_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // id:, retry: and unknown fields are ignored.
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// `event: <name>\ndata: <json>\n\n`
pub fn encode_named<T: Serialize>(name: &str, payload: &T) -> Result<String, TransformError> {
    Ok(format!(
        "event: {}\ndata: {}\n\n",
        name,
        serde_json::to_string(payload)?
    ))
}

/// `data: <json>\n\n`
pub fn encode_data<T: Serialize>(payload: &T) -> Result<String, TransformError> {
    Ok(format!("data: {}\n\n", serde_json::to_string(payload)?))
}

/// Serialize canonical events as Claude-style SSE frames.
pub fn encode_events(events: &[StreamEvent]) -> Result<Vec<u8>, TransformError> {
    let mut out = String::new();
    for event in events {
        out.push_str(&encode_named(event.name(), event)?);
    }
    Ok(out.into_bytes())
}

pub fn into_bytes(frames: Vec<u8>) -> Option<Bytes> {
    (!frames.is_empty()).then(|| Bytes::from(frames))
}

// ============================================================================
// Relay
// ============================================================================

type Chunk = Result<Bytes, std::io::Error>;

/// Everything the relay task owns for one stream.
pub struct StreamJob {
    pub endpoint: String,
    pub transformer: Arc<dyn Transformer>,
    pub ctx: StreamContext,
    pub stats: Arc<StatsCollector>,
    /// Keeps the endpoint marked in flight until the stream ends.
    pub guard: InFlightGuard,
    /// Local input estimate, used when the backend reports none.
    pub input_estimate: u64,
    pub buffer_size: usize,
}

fn sse_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ]
}

/// A complete, already-converted SSE body.
pub fn sse_body(frames: Vec<u8>) -> Response {
    (StatusCode::OK, sse_headers(), Body::from(frames)).into_response()
}

/// Convert an upstream SSE response chunk by chunk and relay it to the client.
///
/// The pump runs in its own task. A client disconnect closes the channel,
/// which drops the upstream response and releases the in-flight guard.
pub fn stream_response(resp: reqwest::Response, job: StreamJob) -> Response {
    let (tx, rx) = mpsc::channel::<Chunk>(job.buffer_size.max(1));
    tokio::spawn(pump(resp, job, tx));
    let body = Body::from_stream(ReceiverStream::new(rx));
    (StatusCode::OK, sse_headers(), body).into_response()
}

async fn send(tx: &mpsc::Sender<Chunk>, frames: Vec<u8>) -> bool {
    match into_bytes(frames) {
        Some(bytes) => tx.send(Ok(bytes)).await.is_ok(),
        None => true,
    }
}

async fn pump(resp: reqwest::Response, job: StreamJob, tx: mpsc::Sender<Chunk>) {
    let StreamJob {
        endpoint,
        transformer,
        mut ctx,
        stats,
        guard,
        input_estimate,
        ..
    } = job;
    let _stream = stats.track_stream();
    let _guard = guard;

    let mut parser = SseParser::new();
    let mut upstream = resp.bytes_stream();
    let mut connected = true;
    let mut upstream_error = None;

    'relay: loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                connected = false;
                break;
            }
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                for event in parser.push_bytes(&bytes) {
                    match transformer.transform_response_chunk(&event, &mut ctx) {
                        Ok(frames) => {
                            if !send(&tx, frames).await {
                                connected = false;
                                break 'relay;
                            }
                        }
                        Err(e) => warn!(endpoint = %endpoint, error = %e, "skipping bad stream event"),
                    }
                }
            }
            Some(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "upstream stream error");
                upstream_error = Some(e.to_string());
                break;
            }
            None => break,
        }
    }

    if let (true, Some(message)) = (connected, upstream_error.as_deref()) {
        // A partial trailing event is not trustworthy after a broken body.
        match transformer.fail_stream(&mut ctx, &format!("upstream stream interrupted: {}", message)) {
            Ok(frames) => {
                send(&tx, frames).await;
            }
            Err(e) => warn!(endpoint = %endpoint, error = %e, "failed to report stream error"),
        }
        stats.record_error(&endpoint, "stream_error");
    } else if connected {
        let mut frames = Vec::new();
        for event in parser.finish() {
            match transformer.transform_response_chunk(&event, &mut ctx) {
                Ok(out) => frames.extend(out),
                Err(e) => warn!(endpoint = %endpoint, error = %e, "skipping bad stream event"),
            }
        }
        match transformer.finish_stream(&mut ctx) {
            Ok(out) => frames.extend(out),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "failed to close stream"),
        }
        send(&tx, frames).await;
    } else {
        debug!(endpoint = %endpoint, "client disconnected, dropping upstream stream");
    }

    let input = if ctx.input_tokens > 0 {
        ctx.input_tokens
    } else {
        input_estimate
    };
    let output = if ctx.output_tokens > 0 {
        ctx.output_tokens
    } else {
        ctx.output_chars.div_ceil(4) as u64
    };
    stats.record_tokens(&endpoint, input, output);
    debug!(endpoint = %endpoint, input, output, "stream finished");
}
