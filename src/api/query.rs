use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::QueryRequest;
use crate::query::{self, QueryDeps};
use crate::state::AppState;

use super::api_key_from_headers;

/// POST /api/query/ - RAG query with SSE streaming.
///
/// Each event is one JSON object on a `data:` line; the stream terminates
/// with `data: [DONE]`.
pub async fn stream_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let query_text = req.query.trim().to_string();
    if query_text.is_empty() {
        return Err(ApiError::InvalidInput("query is required".into()));
    }

    let session = state
        .store
        .get_session(&req.session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", req.session_id)))?;
    let repo = state
        .store
        .get_repository(&req.repo_id)
        .ok_or_else(|| ApiError::NotFound(format!("repository not found: {}", req.repo_id)))?;

    let api_key = api_key_from_headers(&headers);
    if api_key.is_none() && !state.config.is_development() {
        return Err(ApiError::UnauthorizedLlm(
            "X-API-Key header required".into(),
        ));
    }

    let chat_ctx = crate::llm::LlmContext::resolve(
        session.preferences.as_ref(),
        api_key.clone(),
        &state.config,
    )
    .map_err(|e| ApiError::UnauthorizedLlm(e.to_string()))?;
    let embed_ctx = crate::llm::LlmContext::resolve_embedding(
        session.preferences.as_ref(),
        api_key,
        &state.config,
    )
    .map_err(|e| ApiError::UnauthorizedLlm(e.to_string()))?;

    let deps = QueryDeps {
        store: state.store.clone(),
        http: state.http_client.clone(),
        llm_semaphore: state.chat_limiter(&chat_ctx),
        chat_ctx,
        embed_ctx,
    };

    let events = query::stream_query(deps, req.session_id, repo.repo_id, query_text);

    let sse_stream = events
        .map(|event| {
            Ok(Event::default()
                .data(serde_json::to_string(&event).unwrap_or_else(|_| {
                    json!({"type": "error", "error": "event serialization failed"}).to_string()
                })))
        })
        .chain(stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(sse_stream))
}

#[derive(Deserialize)]
pub struct ConversationQuery {
    pub session_id: String,
    pub repo_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/conversations/current?session_id=&repo_id=&limit=
pub async fn current_conversation(
    State(state): State<AppState>,
    Query(params): Query<ConversationQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conversation = state
        .store
        .get_conversation_for_pair(&params.session_id, &params.repo_id)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "no conversation for session {} and repo {}",
                params.session_id, params.repo_id
            ))
        })?;

    let limit = params.limit.unwrap_or(50);
    let messages = state
        .store
        .recent_messages(&conversation.conversation_id, limit);
    let total_messages = state.store.total_messages(&conversation.conversation_id);

    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
        "total_messages": total_messages,
    })))
}
