use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ratelimit::LimitsError;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Rate limit exceeded for client {client_id}")]
    RateLimitExceeded { client_id: String },

    #[error("No backend available")]
    NoBackendAvailable,

    #[error("Upstream error from backend {backend_id}: {message}")]
    Upstream { backend_id: String, message: String },

    #[error("Upstream timeout from backend {backend_id}")]
    UpstreamTimeout { backend_id: String },

    #[error("Proxy instance is shutting down")]
    ShuttingDown,

    #[error("Rate limit administration: {0}")]
    Limits(#[from] LimitsError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Limits(LimitsError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            ProxyError::Limits(LimitsError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ProxyError::Limits(LimitsError::NotFound(_)) => StatusCode::NOT_FOUND,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ProxyError::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            ProxyError::Upstream { .. } => "UPSTREAM_ERROR",
            ProxyError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            ProxyError::ShuttingDown => "SHUTTING_DOWN",
            ProxyError::Limits(LimitsError::Invalid { .. }) => "INVALID_LIMITS",
            ProxyError::Limits(LimitsError::AlreadyExists(_)) => "LIMITS_ALREADY_EXIST",
            ProxyError::Limits(LimitsError::NotFound(_)) => "LIMITS_NOT_FOUND",
            ProxyError::BadRequest(_) => "BAD_REQUEST",
            ProxyError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outward_signals_are_distinct() {
        let rate_limited = ProxyError::RateLimitExceeded { client_id: "10.0.0.1".to_string() };
        let no_backend = ProxyError::NoBackendAvailable;
        let upstream = ProxyError::Upstream {
            backend_id: "b1".to_string(),
            message: "connection refused".to_string(),
        };

        assert_eq!(rate_limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(no_backend.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        assert_ne!(rate_limited.error_code(), no_backend.error_code());
        assert_ne!(no_backend.error_code(), upstream.error_code());
    }

    #[test]
    fn test_limits_errors_map_to_admin_statuses() {
        let conflict: ProxyError = LimitsError::AlreadyExists("u1".to_string()).into();
        let missing: ProxyError = LimitsError::NotFound("u1".to_string()).into();
        let invalid: ProxyError = LimitsError::Invalid { rate: 0.0, burst: 1 }.into();

        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        use http_body_util::BodyExt;

        let response = ProxyError::ShuttingDown.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "SHUTTING_DOWN");
        assert_eq!(body["error"]["status"], 503);
        assert_eq!(
            ProxyError::BadRequest("missing field".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::NotFound("x".to_string()).error_code(), "NOT_FOUND");
    }
}
