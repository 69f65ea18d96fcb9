use axum::routing::{get, patch, post};
use axum::Router;
use tracing_subscriber::EnvFilter;

use repo_chat::api;
use repo_chat::config::Config;
use repo_chat::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("store: {}", config.database_dir().display());
    tracing::info!("environment: {:?}", config.env);

    let state = AppState::new(config.clone())?;

    let app = Router::new()
        .route("/api/sessions/init", post(api::sessions::init_session))
        .route("/api/sessions/{id}", get(api::sessions::get_session))
        .route(
            "/api/sessions/{id}/preferences",
            patch(api::sessions::update_preferences),
        )
        .route("/api/repositories/", post(api::repos::create_repository))
        .route("/api/repositories/{repo_id}", get(api::repos::get_repository))
        .route(
            "/api/repositories/{repo_id}/tree",
            get(api::repos::get_repository_tree),
        )
        .route(
            "/api/repositories/{repo_id}/file",
            get(api::repos::get_repository_file),
        )
        .route("/api/tasks/{task_id}", get(api::repos::get_task))
        .route("/api/query/", post(api::query::stream_query))
        .route(
            "/api/conversations/current",
            get(api::query::current_conversation),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
