//! Request pipeline: convert, dispatch, classify, convert back, and fail
//! over across endpoints.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, Protocol};
use crate::error::GatewayError;
use crate::protocol::{MessagesRequest, MessagesResponse};
use crate::router::AppState;
use crate::rotation::InFlightGuard;
use crate::sse::{self, SseParser, StreamJob};
use crate::tokens;
use crate::transform::StreamContext;
use crate::transformer::{ClientFormat, Transformer};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ENDPOINT_HEADER: &str = "x-ccg-endpoint";

/// Inbound headers never forwarded upstream. Credentials are replaced with
/// the endpoint's own; the rest are per-connection.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
];

/// One inbound request as received by a handler.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub client: ClientFormat,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

/// Parsed view of an inbound request shared by every attempt.
struct Prepared {
    client: ClientFormat,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
    model: String,
    stream: bool,
    thinking: bool,
    input_estimate: u64,
}

/// Result of one attempt against one endpoint.
enum Attempt {
    /// Success or terminal upstream status; returned to the client as is.
    Done(Response),
    /// Counts against the endpoint; `reason` labels the error metric.
    Retry { reason: String, detail: String },
}

impl Attempt {
    fn retry(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Run one inbound request through the retry loop.
pub async fn handle(state: &AppState, inbound: Inbound) -> Response {
    match forward(state, inbound).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "request failed");
            e.into_response()
        }
    }
}

async fn forward(state: &AppState, inbound: Inbound) -> Result<Response, GatewayError> {
    let prepared = prepare(state, inbound)?;

    let threshold = state.rotation.config().threshold();
    let enabled = state.rotation.enabled_count() as u32;
    if enabled == 0 {
        return Err(GatewayError::NoEndpoints);
    }
    let max_attempts = threshold * enabled;

    let mut failing: Option<String> = None;
    let mut consecutive = 0u32;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let endpoint = state
            .rotation
            .current_endpoint()
            .ok_or(GatewayError::NoEndpoints)?;

        // Another request may have rotated in between; failures only count
        // consecutively against the same endpoint.
        if failing.as_deref() != Some(endpoint.name.as_str()) {
            failing = Some(endpoint.name.clone());
            consecutive = 0;
        }

        debug!(
            endpoint = %endpoint.name,
            protocol = %endpoint.protocol,
            attempt,
            max_attempts,
            "dispatching request"
        );
        let guard = state.rotation.mark_active(&endpoint.name);
        state.stats.record_request(&endpoint.name);

        match try_endpoint(state, &prepared, &endpoint, guard).await {
            Attempt::Done(response) => return Ok(response),
            Attempt::Retry { reason, detail } => {
                warn!(
                    endpoint = %endpoint.name,
                    attempt,
                    reason = %reason,
                    error = %detail,
                    "attempt failed"
                );
                state.stats.record_error(&endpoint.name, &reason);
                last_error = format!("{}: {}", endpoint.name, detail);
                consecutive += 1;
                if consecutive >= threshold {
                    // The guard for this attempt is already released, so the
                    // drain only waits for other requests.
                    state.rotation.rotate_from(&endpoint.name).await;
                    consecutive = 0;
                }
            }
        }
    }

    Err(GatewayError::Exhausted {
        attempts: max_attempts,
        last_error,
    })
}

fn prepare(state: &AppState, inbound: Inbound) -> Result<Prepared, GatewayError> {
    let Inbound {
        client,
        headers,
        query,
        body,
    } = inbound;

    let body = if client == ClientFormat::Claude {
        let mut value: Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        if repair_trailing_tool_use(&mut value) {
            info!("dropped trailing tool_use block without input");
            Bytes::from(
                serde_json::to_vec(&value)
                    .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?,
            )
        } else {
            body
        }
    } else {
        body
    };

    let request: MessagesRequest = state
        .registry
        .client(client)
        .decode_request(&body)
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

    info!(
        client = %client,
        model = %request.model,
        stream = request.is_stream(),
        "incoming request"
    );

    Ok(Prepared {
        client,
        headers,
        query,
        model: request.model.clone(),
        stream: request.is_stream(),
        thinking: request.thinking_enabled(),
        input_estimate: tokens::estimate_request_tokens(&request),
        body,
    })
}

// ============================================================================
// Single attempt
// ============================================================================

async fn try_endpoint(
    state: &AppState,
    prepared: &Prepared,
    endpoint: &Endpoint,
    guard: InFlightGuard,
) -> Attempt {
    let Some(transformer) = state.registry.for_route(prepared.client, endpoint.protocol) else {
        return Attempt::retry(
            "transform_error",
            format!("no transformer for {} -> {}", prepared.client, endpoint.protocol),
        );
    };

    let upstream_body = match transformer.transform_request(&prepared.body, endpoint.model.as_deref()) {
        Ok(body) => body,
        Err(e) => return Attempt::retry("transform_error", e.to_string()),
    };

    let model = endpoint.model.as_deref().unwrap_or(&prepared.model);
    let url = upstream_url(endpoint, model, prepared.stream, prepared.query.as_deref());
    let headers = forward_headers(&prepared.headers, prepared.stream);
    let request = apply_auth(state.config.http_client().post(&url), endpoint, &headers)
        .headers(headers)
        .body(upstream_body);

    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => return Attempt::retry("network_error", e.to_string()),
    };

    let status = resp.status();
    if status == StatusCode::OK {
        if is_event_stream(resp.headers()) {
            let job = StreamJob {
                endpoint: endpoint.name.clone(),
                transformer,
                ctx: StreamContext::new(prepared.model.clone(), prepared.thinking),
                stats: Arc::clone(&state.stats),
                guard,
                input_estimate: prepared.input_estimate,
                buffer_size: state.config.sse_buffer_size(),
            };
            info!(endpoint = %endpoint.name, "streaming response");
            let mut response = sse::stream_response(resp, job);
            tag_endpoint(&mut response, &endpoint.name);
            return Attempt::Done(response);
        }
        return buffered(state, prepared, endpoint, transformer.as_ref(), resp).await;
    }

    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        return terminal(state, endpoint, resp).await;
    }

    let detail = match resp.text().await {
        Ok(text) if !text.is_empty() => format!("HTTP {}: {}", status.as_u16(), truncate(&text, 512)),
        _ => format!("HTTP {}", status.as_u16()),
    };
    Attempt::retry(format!("status_{}", status.as_u16()), detail)
}

async fn buffered(
    state: &AppState,
    prepared: &Prepared,
    endpoint: &Endpoint,
    transformer: &dyn Transformer,
    resp: reqwest::Response,
) -> Attempt {
    let encoding = resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw = match resp.bytes().await {
        Ok(raw) => raw,
        Err(e) => return Attempt::retry("network_error", e.to_string()),
    };
    let body = match decode_body(encoding.as_deref(), raw) {
        Ok(body) => body,
        Err(e) => return Attempt::retry("decode_error", e.to_string()),
    };
    let converted = match transformer.transform_response(&body, prepared.stream) {
        Ok(converted) => converted,
        Err(e) => return Attempt::retry("transform_error", e.to_string()),
    };

    let (input, output) = usage_or_estimate(&converted, prepared.input_estimate);
    state.stats.record_tokens(&endpoint.name, input, output);
    info!(endpoint = %endpoint.name, input, output, "request completed");

    let mut response = if prepared.stream {
        sse::sse_body(converted)
    } else {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            converted,
        )
            .into_response()
    };
    tag_endpoint(&mut response, &endpoint.name);
    Attempt::Done(response)
}

/// 400/401 mean the request or credentials are wrong; another endpoint
/// would not help, so the upstream answer is relayed as received.
async fn terminal(state: &AppState, endpoint: &Endpoint, resp: reqwest::Response) -> Attempt {
    let status = resp.status();
    let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
    let body = resp.bytes().await.unwrap_or_default();
    state
        .stats
        .record_error(&endpoint.name, &format!("status_{}", status.as_u16()));
    warn!(endpoint = %endpoint.name, status = status.as_u16(), "terminal upstream status");

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    tag_endpoint(&mut response, &endpoint.name);
    Attempt::Done(response)
}

fn tag_endpoint(response: &mut Response, name: &str) {
    if let Ok(value) = HeaderValue::from_str(name) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ENDPOINT_HEADER), value);
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Request building
// ============================================================================

/// `base` with `version` appended unless it already ends with it.
fn versioned(base: &str, version: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(version) {
        base.to_string()
    } else {
        format!("{}{}", base, version)
    }
}

/// Upstream URL for an endpoint. Gemini's API key is added separately as a
/// query parameter.
pub fn upstream_url(endpoint: &Endpoint, model: &str, stream: bool, query: Option<&str>) -> String {
    match endpoint.protocol {
        Protocol::Native => {
            let url = format!("{}/messages", versioned(&endpoint.base_url, "/v1"));
            match query.filter(|q| !q.is_empty()) {
                Some(query) => format!("{}?{}", url, query),
                None => url,
            }
        }
        Protocol::OpenaiChat => format!("{}/chat/completions", versioned(&endpoint.base_url, "/v1")),
        Protocol::OpenaiResponses => format!("{}/responses", versioned(&endpoint.base_url, "/v1")),
        Protocol::Gemini => {
            let method = if stream {
                "streamGenerateContent?alt=sse"
            } else {
                "generateContent"
            };
            let model = model.trim_start_matches("models/");
            format!(
                "{}/models/{}:{}",
                versioned(&endpoint.base_url, "/v1beta"),
                urlencoding::encode(model),
                method
            )
        }
    }
}

/// Inbound headers minus credentials and hop-by-hop headers. Streams ask
/// for an uncompressed body so frames can be parsed as they arrive.
pub fn forward_headers(inbound: &HeaderMap, stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static(if stream { "identity" } else { "gzip, zstd" }),
    );
    headers
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    endpoint: &Endpoint,
    forwarded: &HeaderMap,
) -> reqwest::RequestBuilder {
    match endpoint.protocol {
        Protocol::Native => {
            let request = request.header("x-api-key", &endpoint.api_key);
            if forwarded.contains_key("anthropic-version") {
                request
            } else {
                request.header("anthropic-version", ANTHROPIC_VERSION)
            }
        }
        Protocol::OpenaiChat | Protocol::OpenaiResponses => request.bearer_auth(&endpoint.api_key),
        Protocol::Gemini => request.query(&[("key", endpoint.api_key.as_str())]),
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Undo `content-encoding` on a buffered body.
pub fn decode_body(encoding: Option<&str>, body: Bytes) -> std::io::Result<Bytes> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body.as_ref()).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        Some("deflate") => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(body.as_ref()).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        Some("zstd") => Ok(Bytes::from(zstd::stream::decode_all(body.as_ref())?)),
        _ => Ok(body),
    }
}

/// Drop a trailing `tool_use` block that has no `input` from the last
/// assistant message, and the message itself if nothing is left.
/// Returns whether anything changed.
pub fn repair_trailing_tool_use(body: &mut Value) -> bool {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };
    let Some(position) = messages
        .iter()
        .rposition(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
    else {
        return false;
    };
    let Some(content) = messages[position]
        .get_mut("content")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let broken = content.last().is_some_and(|block| {
        block.get("type").and_then(Value::as_str) == Some("tool_use") && block.get("input").is_none()
    });
    if !broken {
        return false;
    }
    content.pop();
    if content.is_empty() {
        messages.remove(position);
    }
    true
}

// ============================================================================
// Usage
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct UsageBody {
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: Option<u64>,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: Option<u64>,
}

fn collect_usage(value: &Value, totals: &mut (u64, u64)) {
    let candidates = [
        value.get("usage"),
        value.get("message").and_then(|m| m.get("usage")),
    ];
    for usage in candidates.into_iter().flatten() {
        if let Ok(usage) = UsageBody::deserialize(usage) {
            totals.0 = totals.0.max(usage.input_tokens.unwrap_or(0));
            totals.1 = totals.1.max(usage.output_tokens.unwrap_or(0));
        }
    }
}

/// Usage reported in a converted client body, JSON or SSE, accepting both
/// Claude and OpenAI key spellings. `(0, 0)` when none is present.
pub fn extract_usage(body: &[u8]) -> (u64, u64) {
    let mut totals = (0, 0);
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        collect_usage(&value, &mut totals);
        return totals;
    }
    let mut parser = SseParser::new();
    let mut events = parser.push_bytes(body);
    events.extend(parser.finish());
    for event in events.iter().filter(|e| !e.is_done()) {
        if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
            collect_usage(&value, &mut totals);
        }
    }
    totals
}

fn usage_or_estimate(converted: &[u8], input_estimate: u64) -> (u64, u64) {
    let (input, output) = extract_usage(converted);
    let input = if input > 0 { input } else { input_estimate };
    let output = if output > 0 {
        output
    } else {
        match serde_json::from_slice::<MessagesResponse>(converted) {
            Ok(response) => tokens::estimate_response_tokens(&response),
            Err(_) => tokens::estimate_text_tokens(&String::from_utf8_lossy(converted)),
        }
    };
    (input, output)
}
