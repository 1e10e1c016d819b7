use axum::{
    body::Bytes,
    extract::{Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::config::Config;
use crate::error::GatewayError;
use crate::protocol::MessagesRequest;
use crate::proxy::{self, Inbound};
use crate::rotation::RotationController;
use crate::stats::StatsCollector;
use crate::tokens;
use crate::transform::TransformerRegistry;
use crate::transformer::ClientFormat;

/// Shared application state threaded through Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub rotation: Arc<RotationController>,
    pub registry: Arc<TransformerRegistry>,
    pub stats: Arc<StatsCollector>,
}

impl AppState {
    /// State for `config` with a fresh rotation controller and registry.
    pub fn new(config: Config, stats: Arc<StatsCollector>) -> Self {
        let rotation = RotationController::new(config.endpoints().to_vec(), config.rotation().clone());
        Self {
            config,
            rotation: Arc::new(rotation),
            registry: Arc::new(TransformerRegistry::with_defaults()),
            stats,
        }
    }
}

/// All routes with request tracing and permissive CORS.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/health", get(health))
        .route("/stats", get(stats_handler))
        .route("/stats/daily", get(daily_stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub async fn handle_messages(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound {
        client: ClientFormat::Claude,
        headers,
        query,
        body,
    };
    proxy::handle(&state, inbound).await
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound = Inbound {
        client: ClientFormat::OpenaiChat,
        headers,
        query: None,
        body,
    };
    proxy::handle(&state, inbound).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u64,
}

pub async fn handle_count_tokens(body: Bytes) -> Response {
    match serde_json::from_slice::<MessagesRequest>(&body) {
        Ok(request) => {
            let input_tokens = tokens::estimate_request_tokens(&request);
            debug!(model = %request.model, input_tokens, "counted tokens");
            Json(CountTokensResponse { input_tokens }).into_response()
        }
        Err(e) => GatewayError::InvalidRequest(e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub enabled_endpoints: usize,
    pub current_endpoint: Option<String>,
    pub version: String,
    pub commit: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let enabled_endpoints = state.rotation.enabled_count();
    Json(HealthResponse {
        status: if enabled_endpoints > 0 { "ok" } else { "no_endpoints" }.to_string(),
        enabled_endpoints,
        current_endpoint: state.rotation.current_endpoint().map(|e| e.name),
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: env!("GIT_COMMIT").to_string(),
    })
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    /// `YYYY-MM-DD`; defaults to today (UTC).
    pub date: Option<String>,
}

pub async fn daily_stats_handler(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Response {
    let date = query
        .date
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    match state.stats.daily(&date) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!(error = %e, date = %date, "failed to read daily stats");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.stats.render_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
