use axum::extract::{Path, State};
use axum::Json;

use crate::error::ApiError;
use crate::models::{PreferencesUpdate, Session, SessionPreferences};
use crate::state::AppState;

/// POST /api/sessions/init - create a session
pub async fn init_session(State(state): State<AppState>) -> Json<Session> {
    let session = state.store.create_session();
    tracing::info!("created session {}", session.session_id);
    Json(session)
}

/// GET /api/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .store
        .get_session(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))
}

/// PATCH /api/sessions/{id}/preferences
pub async fn update_preferences(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<PreferencesUpdate>,
) -> Result<Json<Session>, ApiError> {
    if update.ai_provider.trim().is_empty() || update.ai_model.trim().is_empty() {
        return Err(ApiError::InvalidInput(
            "ai_provider and ai_model are required".into(),
        ));
    }
    if crate::llm::Provider::from_name(&update.ai_provider).is_none() {
        return Err(ApiError::InvalidInput(format!(
            "unknown provider: {}",
            update.ai_provider
        )));
    }

    let preferences = SessionPreferences {
        ai_provider: update.ai_provider,
        ai_model: update.ai_model,
        embedding_provider: update.embedding_provider,
        embedding_model: update.embedding_model,
        theme: update.theme,
    };

    state
        .store
        .update_preferences(&id, preferences)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))
}
