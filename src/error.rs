use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::config::Protocol;

/// Failure while converting between the canonical schema and a backend dialect.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{protocol} endpoint has no target model configured")]
    MissingModel { protocol: Protocol },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

impl TransformError {
    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RotationError {
    #[error("unknown or disabled endpoint: {0}")]
    UnknownEndpoint(String),
}

/// Errors surfaced to the client by the gateway itself (not relayed upstream errors).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no enabled endpoints configured")]
    NoEndpoints,

    #[error("all endpoints failed after {attempts} attempt(s); last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoEndpoints | Self::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::NoEndpoints | Self::Exhausted { .. } => "overloaded_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
