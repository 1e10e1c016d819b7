//! Integration tests for the auxiliary routes and the OpenAI Chat client surface.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ccg_rust::config::Config;
use ccg_rust::stats::{MemoryStatsStorage, StatsStorage};
use ccg_rust::Gateway;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_gateway(endpoints: serde_json::Value) -> Gateway {
    let config = json!({"Endpoints": endpoints, "API_TIMEOUT_MS": 5000});
    Gateway::new(Config::from_json_str(&config.to_string()).unwrap(), None).unwrap()
}

async fn get(gateway: &Gateway, uri: &str) -> (StatusCode, String) {
    let response = gateway
        .router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn post(gateway: &Gateway, uri: &str, body: serde_json::Value) -> (StatusCode, String) {
    let response = gateway
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_count_tokens() {
    let gateway = build_gateway(json!([]));
    let (status, body) = post(
        &gateway,
        "/v1/messages/count_tokens",
        json!({
            "model": "claude-sonnet-4",
            "system": "abcd",
            "messages": [{"role": "user", "content": "abcdabcd"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["input_tokens"], 10);

    let (status, _) = post(&gateway, "/v1/messages/count_tokens", json!({"messages": 3})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_current_endpoint() {
    let gateway = build_gateway(json!([
        {"name": "off", "base_url": "http://127.0.0.1:9", "enabled": false},
        {"name": "primary", "base_url": "http://127.0.0.1:9"}
    ]));
    let (status, body) = get(&gateway, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["enabled_endpoints"], 1);
    assert_eq!(value["current_endpoint"], "primary");

    let empty = build_gateway(json!([]));
    let (_, body) = get(&empty, "/health").await;
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "no_endpoints");
    assert!(value["current_endpoint"].is_null());
}

#[tokio::test]
async fn test_chat_client_against_native_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "model": "claude-sonnet-4",
            "system": "Be brief.",
            "max_tokens": 32
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "Hi there"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 12, "output_tokens": 32}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = build_gateway(json!([
        {"name": "claude", "base_url": server.uri(), "api_key": "k", "model": "claude-sonnet-4"}
    ]));
    let (status, body) = post(
        &gateway,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "max_tokens": 32,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hello"}
            ]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["choices"][0]["message"]["role"], "assistant");
    assert_eq!(value["choices"][0]["message"]["content"], "Hi there");
    assert_eq!(value["choices"][0]["finish_reason"], "length");
    assert_eq!(value["usage"]["prompt_tokens"], 12);

    let stats = gateway.get_stats();
    assert_eq!(stats.endpoints["claude"].input_tokens, 12);
    assert_eq!(stats.endpoints["claude"].output_tokens, 32);
}

#[tokio::test]
async fn test_chat_client_streams_from_gemini() {
    let server = MockServer::start().await;
    let sse = format!(
        "data: {}\n\ndata: {}\n\n",
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Bon"}]}}]}),
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "jour"}]}, "finishReason": "STOP"}],
               "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}})
    );
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = build_gateway(json!([
        {"name": "gem", "base_url": server.uri(), "api_key": "g", "protocol": "gemini", "model": "gemini-2.5-flash"}
    ]));
    let (status, body) = post(
        &gateway,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o", "stream": true,
            "messages": [{"role": "user", "content": "greet me in French"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let payloads: Vec<&str> = body
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let chunks: Vec<serde_json::Value> = payloads
        .iter()
        .filter(|p| **p != "[DONE]")
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Bonjour");
    assert!(chunks
        .iter()
        .any(|c| c["choices"][0]["finish_reason"] == "stop"));
}

#[tokio::test]
async fn test_chat_client_keeps_model_on_openai_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer oai"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1", "object": "chat.completion", "created": 1, "model": "gpt-4o-mini",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = build_gateway(json!([
        {"name": "oai", "base_url": server.uri(), "api_key": "oai", "protocol": "openai-chat"}
    ]));
    let (status, body) = post(
        &gateway,
        "/v1/chat/completions",
        json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "ping"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn test_stats_and_metrics_routes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 1}
        })))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStatsStorage::new());
    let config = json!({
        "Endpoints": [{"name": "main", "base_url": server.uri(), "api_key": "k"}],
        "API_TIMEOUT_MS": 5000
    });
    let gateway = Gateway::new(
        Config::from_json_str(&config.to_string()).unwrap(),
        Some(storage.clone()),
    )
    .unwrap();

    let (status, _) = post(
        &gateway,
        "/v1/messages",
        json!({"model": "claude-sonnet-4", "max_tokens": 8, "messages": [{"role": "user", "content": "ping"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get(&gateway, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["total_requests"], 1);
    assert_eq!(stats["endpoints"]["main"]["requests"], 1);
    assert_eq!(stats["endpoints"]["main"]["output_tokens"], 1);

    let (status, text) = get(&gateway, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("ccg_requests_total{endpoint=\"main\"} 1"));
    assert!(text.contains("ccg_input_tokens_total{endpoint=\"main\"} 3"));

    assert_eq!(gateway.flush_stats().unwrap(), 1);
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    assert_eq!(storage.get_daily_stats(&today).unwrap()[0].requests, 1);

    let (status, body) = get(&gateway, &format!("/stats/daily?date={}", today)).await;
    assert_eq!(status, StatusCode::OK);
    let rows: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(rows[0]["endpoint"], "main");
    assert_eq!(rows[0]["input_tokens"], 3);
}
