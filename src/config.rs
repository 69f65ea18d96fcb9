use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the document store (directory path or file:// URI)
    pub store_uri: String,
    /// Database name; collections live under `store_uri/database_name`
    pub database_name: String,
    /// Server bind address
    pub bind_addr: String,
    /// "development" or "production"
    pub env: Environment,
    /// Optional source-host bearer token (raises API rate limits)
    pub source_host_token: Option<String>,
    /// Development-fallback LLM settings
    pub ai: AiConfig,
    /// Pipeline concurrency bounds
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Fallback API key, used only in development when no X-API-Key is sent
    pub api_key: Option<String>,
    /// Fallback provider name
    pub provider: Option<String>,
    /// Fallback model name
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// In-flight blob fetches per repository
    pub c_fetch: usize,
    /// Parser workers (defaults to CPU count)
    pub c_parse: usize,
    /// Concurrent LLM calls per provider/key pair
    pub c_llm: usize,
    /// Concurrent embedding batches
    pub c_embed: usize,
    /// Blob size ceiling in bytes
    pub max_blob_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_uri: "./data".to_string(),
            database_name: "repo_chat".to_string(),
            bind_addr: "127.0.0.1:8000".to_string(),
            env: Environment::Development,
            source_host_token: None,
            ai: AiConfig {
                api_key: None,
                provider: None,
                model: None,
            },
            limits: Limits::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            c_fetch: 8,
            c_parse: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            c_llm: 6,
            c_embed: 4,
            max_blob_size: 1_048_576, // 1 MiB
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(uri) = std::env::var("STORE_URI") {
            config.store_uri = uri;
        }
        if let Ok(name) = std::env::var("DATABASE_NAME") {
            config.database_name = name;
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(env) = std::env::var("ENV") {
            config.env = match env.to_lowercase().as_str() {
                "production" => Environment::Production,
                _ => Environment::Development,
            };
        }
        if let Ok(token) = std::env::var("SOURCE_HOST_TOKEN") {
            if !token.is_empty() {
                config.source_host_token = Some(token);
            }
        }
        if let Ok(key) = std::env::var("AI_API_KEY") {
            if !key.is_empty() {
                config.ai.api_key = Some(key);
            }
        }
        if let Ok(provider) = std::env::var("AI_PROVIDER") {
            config.ai.provider = Some(provider);
        }
        if let Ok(model) = std::env::var("AI_MODEL") {
            config.ai.model = Some(model);
        }
        if let Ok(val) = std::env::var("C_FETCH") {
            if let Ok(v) = val.parse() {
                config.limits.c_fetch = v;
            }
        }
        if let Ok(val) = std::env::var("C_LLM") {
            if let Ok(v) = val.parse() {
                config.limits.c_llm = v;
            }
        }
        if let Ok(val) = std::env::var("C_EMBED") {
            if let Ok(v) = val.parse() {
                config.limits.c_embed = v;
            }
        }
        if let Ok(val) = std::env::var("MAX_BLOB_SIZE") {
            if let Ok(v) = val.parse() {
                config.limits.max_blob_size = v;
            }
        }

        config
    }

    pub fn is_development(&self) -> bool {
        self.env == Environment::Development
    }

    /// Directory holding this database's collections.
    pub fn database_dir(&self) -> PathBuf {
        let root = self
            .store_uri
            .strip_prefix("file://")
            .unwrap_or(&self.store_uri);
        PathBuf::from(root).join(&self.database_name)
    }
}
