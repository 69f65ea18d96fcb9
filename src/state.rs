use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::github::GitHubClient;
use crate::llm::LlmContext;
use crate::store::Store;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub http_client: reqwest::Client,
    pub github: Arc<GitHubClient>,
    /// Bounds the parser worker pool process-wide (CPU count)
    pub parse_semaphore: Arc<Semaphore>,
    /// Bounds in-flight blob fetches process-wide
    pub fetch_semaphore: Arc<Semaphore>,
    /// One chat limiter per {provider, api_key} pair, shared process-wide
    chat_limiters: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    /// One embedding-batch limiter per {provider, api_key} pair
    embed_limiters: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&config.database_dir())?);

        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        let github = Arc::new(GitHubClient::new(
            http_client.clone(),
            config.source_host_token.clone(),
            config.limits.max_blob_size,
        ));

        Ok(Self {
            parse_semaphore: Arc::new(Semaphore::new(config.limits.c_parse)),
            fetch_semaphore: Arc::new(Semaphore::new(config.limits.c_fetch)),
            chat_limiters: Arc::new(Mutex::new(HashMap::new())),
            embed_limiters: Arc::new(Mutex::new(HashMap::new())),
            config,
            store,
            http_client,
            github,
        })
    }

    /// The chat-call limiter for this provider/key pair (C_llm permits).
    pub fn chat_limiter(&self, ctx: &LlmContext) -> Arc<Semaphore> {
        let mut limiters = self.chat_limiters.lock();
        limiters
            .entry(ctx.limiter_key())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limits.c_llm)))
            .clone()
    }

    /// The embedding-batch limiter for this provider/key pair (C_embed permits).
    pub fn embed_limiter(&self, ctx: &LlmContext) -> Arc<Semaphore> {
        let mut limiters = self.embed_limiters.lock();
        limiters
            .entry(ctx.limiter_key())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limits.c_embed)))
            .clone()
    }
}
