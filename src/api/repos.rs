use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::github::{self, FetchError};
use crate::models::{CreateRepositoryRequest, RepoStatus, Repository, Task};
use crate::pipeline::{self, PipelineContext};
use crate::state::AppState;

use super::api_key_from_headers;

/// POST /api/repositories/ - fetch metadata and tree synchronously, then
/// start background file processing
pub async fn create_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRepositoryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .store
        .get_session(&req.session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", req.session_id)))?;

    let api_key = api_key_from_headers(&headers);
    if api_key.is_none() && !state.config.is_development() {
        return Err(ApiError::UnauthorizedLlm(
            "X-API-Key header required".into(),
        ));
    }

    // Resolve provider contexts up front so credential problems surface
    // before any work starts
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

    let (owner, name) = github::parse_github_url(&req.github_url).map_err(map_fetch_error)?;

    let metadata = state
        .github
        .metadata(&owner, &name)
        .await
        .map_err(map_fetch_error)?;

    // A failed tree fetch leaves an empty tree rather than failing the
    // request; the repo then completes as empty
    let file_tree = match state
        .github
        .tree(&metadata.owner, &metadata.name, &metadata.default_branch)
        .await
    {
        Ok(tree) => tree,
        Err(FetchError::RateLimited) => return Err(ApiError::RateLimitedHost(
            "source host rate limit exceeded".into(),
        )),
        Err(e) => {
            tracing::warn!("tree fetch failed for {owner}/{name}: {e}");
            Default::default()
        }
    };

    let file_count = github::flatten_tree(&file_tree).len();
    let languages_breakdown = github::languages_breakdown(&file_tree);

    let now = Utc::now();
    let repo = Repository {
        repo_id: Uuid::new_v4().to_string(),
        session_id: req.session_id.clone(),
        source_url: req.github_url.clone(),
        owner: metadata.owner.clone(),
        name: metadata.name.clone(),
        full_name: metadata.full_name.clone(),
        description: metadata.description.clone(),
        default_branch: metadata.default_branch.clone(),
        language: metadata.language.clone(),
        stars: metadata.stars,
        forks: metadata.forks,
        file_tree,
        status: RepoStatus::Fetched,
        task_id: None,
        error_message: None,
        file_count,
        languages_breakdown: languages_breakdown.clone(),
        overview: None,
        overview_embedding: None,
        embedding_dim: None,
        created_at: now,
        updated_at: now,
    };
    let repo_id = repo.repo_id.clone();

    state.store.insert_repository(repo);
    state
        .store
        .add_repository_to_session(&req.session_id, &repo_id);

    let task_id = state.store.create_task("process_files");
    state.store.update_repository(&repo_id, |r| {
        r.task_id = Some(task_id.clone());
    });

    // Background ingestion; progress is observable via the task record
    let ctx = PipelineContext {
        store: state.store.clone(),
        http: state.http_client.clone(),
        github: state.github.clone(),
        llm_semaphore: state.chat_limiter(&chat_ctx),
        embed_semaphore: state.embed_limiter(&embed_ctx),
        fetch_semaphore: state.fetch_semaphore.clone(),
        parse_semaphore: state.parse_semaphore.clone(),
        chat_ctx,
        embed_ctx,
    };
    tokio::spawn(pipeline::run(ctx, repo_id.clone(), task_id.clone()));

    Ok(Json(json!({
        "repo_id": repo_id,
        "task_id": task_id,
        "status": "fetched",
        "message": "Repository metadata fetched. File processing will begin in background.",
        "metadata": {
            "owner": metadata.owner,
            "name": metadata.name,
            "full_name": metadata.full_name,
            "description": metadata.description,
            "default_branch": metadata.default_branch,
            "language": metadata.language,
            "stars": metadata.stars,
            "forks": metadata.forks,
            "file_count": file_count,
            "languages_breakdown": languages_breakdown,
        }
    })))
}

/// GET /api/repositories/{repo_id}
pub async fn get_repository(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<Repository>, ApiError> {
    state
        .store
        .get_repository(&repo_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("repository not found: {repo_id}")))
}

/// GET /api/repositories/{repo_id}/tree
pub async fn get_repository_tree(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let repo = state
        .store
        .get_repository(&repo_id)
        .ok_or_else(|| ApiError::NotFound(format!("repository not found: {repo_id}")))?;
    Ok(Json(serde_json::to_value(&repo.file_tree).map_err(|e| {
        ApiError::Internal(format!("tree serialization failed: {e}"))
    })?))
}

#[derive(Deserialize)]
pub struct FileQuery {
    pub path: String,
}

/// GET /api/repositories/{repo_id}/file?path=...
pub async fn get_repository_file(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = query.path.trim_start_matches('/');
    let file = state
        .store
        .get_file_by_path(&repo_id, path)
        .ok_or_else(|| ApiError::NotFound(format!("file not found: {path}")))?;

    // View without vectors: embedding payloads are internal
    Ok(Json(json!({
        "file_id": file.file_id,
        "repo_id": file.repo_id,
        "path": file.path,
        "filename": file.filename,
        "language": file.language,
        "content": file.content,
        "size": file.size,
        "parsed": file.parsed,
        "embedded": file.embedded,
        "functions": file.functions,
        "classes": file.classes,
        "imports": file.imports,
        "dependencies": file.dependencies,
        "summary": file.summary,
    })))
}

/// GET /api/tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .get_task(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {task_id}")))
}

fn map_fetch_error(e: FetchError) -> ApiError {
    match e {
        FetchError::InvalidUrl(url) => ApiError::InvalidInput(format!("invalid source URL: {url}")),
        FetchError::RepoNotFound(repo) => {
            ApiError::NotFound(format!("repository not found: {repo}"))
        }
        FetchError::RateLimited => {
            ApiError::RateLimitedHost("source host rate limit exceeded".into())
        }
        FetchError::Transport(e) => ApiError::Internal(format!("source host error: {e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_mapping() {
        assert_eq!(
            map_fetch_error(FetchError::InvalidUrl("x".into())).kind(),
            "invalid_input"
        );
        assert_eq!(
            map_fetch_error(FetchError::RepoNotFound("a/b".into())).kind(),
            "not_found"
        );
        assert_eq!(
            map_fetch_error(FetchError::RateLimited).kind(),
            "rate_limited_host"
        );
        assert_eq!(
            map_fetch_error(FetchError::Transport(anyhow::anyhow!("boom"))).kind(),
            "internal"
        );
    }
}
