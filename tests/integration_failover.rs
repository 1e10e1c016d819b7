//! Integration tests for endpoint failover, exhaustion and terminal statuses.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ccg_rust::config::Config;
use ccg_rust::Gateway;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_gateway(endpoints: serde_json::Value) -> Gateway {
    let config = json!({
        "Endpoints": endpoints,
        "Rotation": {"failures_before_rotate": 2, "drain_timeout_ms": 200, "drain_poll_ms": 10},
        "API_TIMEOUT_MS": 5000
    });
    let config = Config::from_json_str(&config.to_string()).unwrap();
    Gateway::new(config, None).unwrap()
}

fn messages_request() -> Request<Body> {
    let body = json!({
        "model": "claude-sonnet-4",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "say hello"}]
    });
    Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("x-api-key", "client-key")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

fn chat_hello() -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
    })
}

#[tokio::test]
async fn test_failover_from_native_to_openai_chat() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .expect(2)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer key-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_hello()))
        .expect(1)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a", "protocol": "native"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "protocol": "openai-chat", "model": "gpt-4o"}
    ]));
    let app = gateway.router();

    let (status, body) = send(&app, messages_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 9);

    let stats = gateway.get_stats();
    assert_eq!(stats.endpoints["B"].requests, 1);
    assert_eq!(stats.endpoints["A"].errors, 2);
    assert_eq!(stats.endpoints["A"].requests, 2);
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.endpoints["B"].input_tokens, 9);
    assert_eq!(gateway.current_endpoint_name().as_deref(), Some("B"));
}

#[tokio::test]
async fn test_rotation_sticks_for_later_requests() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_hello()))
        .expect(2)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "protocol": "openai-chat", "model": "gpt-4o"}
    ]));
    let app = gateway.router();

    let (first, _) = send(&app, messages_request()).await;
    let (second, _) = send(&app, messages_request()).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(gateway.get_stats().endpoints["A"].requests, 2);
}

#[tokio::test]
async fn test_all_endpoints_failing_returns_503() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(2)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b"}
    ]));
    let (status, body) = send(&gateway.router(), messages_request()).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("4 attempt(s)"));

    let stats = gateway.get_stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.total_errors, 4);
}

#[tokio::test]
async fn test_bad_request_is_relayed_without_retry() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    let upstream_error = json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "message": "max_tokens too large"}
    });
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "key-a"))
        .respond_with(ResponseTemplate::new(400).set_body_json(upstream_error.clone()))
        .expect(1)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_hello()))
        .expect(0)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "protocol": "openai-chat", "model": "gpt-4o"}
    ]));
    let (status, body) = send(&gateway.router(), messages_request()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, upstream_error);
    let stats = gateway.get_stats();
    assert_eq!(stats.endpoints["A"].requests, 1);
    assert_eq!(stats.endpoints["A"].errors, 1);
    assert_eq!(gateway.current_endpoint_name().as_deref(), Some("A"));
}

#[tokio::test]
async fn test_missing_model_override_counts_as_failure() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    // A speaks OpenAI Chat but has no model for a Claude client, so conversion fails locally.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a", "protocol": "openai-chat"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b"}
    ]));
    let (status, body) = send(&gateway.router(), messages_request()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "hi");
    assert_eq!(gateway.get_stats().endpoints["A"].errors, 2);
    assert_eq!(gateway.state().rotation.in_flight("A"), 0);
}

#[tokio::test]
async fn test_no_enabled_endpoints() {
    let gateway = build_gateway(json!([
        {"name": "A", "base_url": "http://127.0.0.1:9", "enabled": false}
    ]));
    let (status, body) = send(&gateway.router(), messages_request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["message"], "no enabled endpoints configured");
}

#[tokio::test]
async fn test_malformed_request_is_rejected() {
    let gateway = build_gateway(json!([
        {"name": "A", "base_url": "http://127.0.0.1:9"}
    ]));
    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&gateway.router(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(gateway.get_stats().total_requests, 0);
}

#[tokio::test]
async fn test_manual_endpoint_selection_routes_requests() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_hello()))
        .expect(1)
        .mount(&b)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "protocol": "openai-chat", "model": "gpt-4o"}
    ]));
    gateway.set_current_endpoint("B").unwrap();
    let (status, _) = send(&gateway.router(), messages_request()).await;
    assert_eq!(status, StatusCode::OK);
}

fn claude_hi() -> serde_json::Value {
    json!({
        "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4",
        "content": [{"type": "text", "text": "hi"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 5, "output_tokens": 1}
    })
}

#[tokio::test]
async fn test_rotation_skips_disabled_endpoint_and_wraps() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_hi()))
        .expect(1)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_hi()))
        .expect(0)
        .mount(&b)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&c)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "enabled": false},
        {"name": "C", "base_url": c.uri(), "api_key": "key-c", "protocol": "openai-chat", "model": "gpt-4o"}
    ]));
    // Start on the last enabled endpoint so a rotation has to wrap around.
    gateway.set_current_endpoint("C").unwrap();
    let (status, body) = send(&gateway.router(), messages_request()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "hi");
    assert_eq!(gateway.current_endpoint_name().as_deref(), Some("A"));
    let stats = gateway.get_stats();
    assert_eq!(stats.endpoints["C"].errors, 2);
    assert_eq!(stats.endpoints["A"].requests, 1);
    assert_eq!(stats.endpoints["A"].errors, 0);
    assert!(!stats.endpoints.contains_key("B"));
}

#[tokio::test]
async fn test_three_endpoints_exhaust_after_threshold_per_enabled() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&a)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(claude_hi()))
        .expect(0)
        .mount(&b)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&c)
        .await;

    let gateway = build_gateway(json!([
        {"name": "A", "base_url": a.uri(), "api_key": "key-a"},
        {"name": "B", "base_url": b.uri(), "api_key": "key-b", "enabled": false},
        {"name": "C", "base_url": c.uri(), "api_key": "key-c"}
    ]));
    let (status, body) = send(&gateway.router(), messages_request()).await;

    // Two enabled endpoints at two failures each: four attempts in total.
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("4 attempt(s)"));
    let stats = gateway.get_stats();
    assert_eq!((stats.endpoints["A"].requests, stats.endpoints["A"].errors), (2, 2));
    assert_eq!((stats.endpoints["C"].requests, stats.endpoints["C"].errors), (2, 2));
    assert!(!stats.endpoints.contains_key("B"));
    assert_eq!(stats.total_requests, 4);
    // A → C → back to A.
    assert_eq!(gateway.current_endpoint_name().as_deref(), Some("A"));
    assert_eq!(gateway.state().rotation.in_flight("A"), 0);
    assert_eq!(gateway.state().rotation.in_flight("C"), 0);
}
