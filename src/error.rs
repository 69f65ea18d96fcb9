//! API error kinds and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced at the HTTP boundary. Each variant carries a stable
/// machine-readable kind used in the `{error: {kind, message}}` body.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    /// Invalid or missing LLM credentials.
    #[error("{0}")]
    UnauthorizedLlm(String),

    /// The LLM provider rate-limited us past the retry budget.
    #[error("{0}")]
    RateLimitedLlm(String),

    /// The source host rate-limited us past the retry budget.
    #[error("{0}")]
    RateLimitedHost(String),

    /// The LLM provider failed in a non-rate-limit way.
    #[error("{0}")]
    LlmFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::NotFound(_) => "not_found",
            ApiError::UnauthorizedLlm(_) => "unauthorized_llm",
            ApiError::RateLimitedLlm(_) => "rate_limited_llm",
            ApiError::RateLimitedHost(_) => "rate_limited_host",
            ApiError::LlmFailure(_) => "llm_failure",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) | ApiError::UnauthorizedLlm(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimitedLlm(_) | ApiError::RateLimitedHost(_) | ApiError::LlmFailure(_) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}
