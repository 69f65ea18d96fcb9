//! Axum HTTP handlers. Thin: request validation, context resolution, and
//! delegation into the pipeline, search, and query modules.

pub mod query;
pub mod repos;
pub mod sessions;

use axum::http::HeaderMap;

/// The caller's LLM API key, passed as `X-API-Key`. Required outside
/// development; in development the environment fallback applies downstream.
pub fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
