use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/* ============================= ERROR KINDS ============================= */

/// Errors surfaced on the request path, each mapping to one HTTP class.
///
/// `Config` never reaches a client: it is produced while validating custom
/// resources and stays inside the reconcilers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no route for model {0:?}")]
    Route(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("scheduling failed: {0}")]
    Scheduling(String),

    #[error("input token budget exhausted for model {model:?}")]
    InputRateLimit { model: String, retry_after: Duration },

    #[error("output token budget exhausted for model {model:?}")]
    OutputRateLimit { model: String, retry_after: Duration },

    #[error("admission queue full for model {0:?}")]
    QueueFull(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("client disconnected")]
    ClientCancelled,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Route(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Scheduling(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InputRateLimit { .. } | GatewayError::OutputRateLimit { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream(_) | GatewayError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // 499 is the de-facto "client closed request" status; the client
            // is gone, so the value only shows up in access logs.
            GatewayError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
        }
    }

    /// OpenAI-style machine-readable error type for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "internal_error",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Route(_) => "model_not_found",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Scheduling(_) => "no_capacity",
            GatewayError::InputRateLimit { .. } | GatewayError::OutputRateLimit { .. } => {
                "rate_limit_exceeded"
            }
            GatewayError::QueueFull(_) => "rate_limit_exceeded",
            GatewayError::Upstream(_)
            | GatewayError::UpstreamStatus(_)
            | GatewayError::UpstreamTimeout(_) => "upstream_error",
            GatewayError::ClientCancelled => "client_cancelled",
        }
    }

    /// Refill-derived hint for 429 responses, rounded up to whole seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::InputRateLimit { retry_after, .. }
            | GatewayError::OutputRateLimit { retry_after, .. } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16(),
            }
        }));

        let mut resp = (status, body).into_response();
        if let Some(secs) = self.retry_after()
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            resp.headers_mut().insert(http::header::RETRY_AFTER, value);
        }
        resp
    }
}

/* ============================= TESTS ============================= */
