//! Provider-agnostic LLM access: chat completions (streaming and not),
//! summarization, and embeddings, dispatched per request through a
//! provider strategy carrying the base URL and wire protocol.

pub mod client;
pub mod embeddings;
pub mod gemini;
pub mod summarize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::models::{SessionPreferences, ToolCallRecord};

/// Supported LLM providers. All but Gemini speak the industry-standard
/// chat-completions protocol against a swapped base URL; Gemini has its
/// own adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Fireworks,
    Together,
    Groq,
    Grok,
    OpenRouter,
    Gemini,
}

impl Provider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "fireworks" => Some(Provider::Fireworks),
            "together" => Some(Provider::Together),
            "groq" => Some(Provider::Groq),
            "grok" => Some(Provider::Grok),
            "openrouter" => Some(Provider::OpenRouter),
            "gemini" => Some(Provider::Gemini),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Fireworks => "fireworks",
            Provider::Together => "together",
            Provider::Groq => "groq",
            Provider::Grok => "grok",
            Provider::OpenRouter => "openrouter",
            Provider::Gemini => "gemini",
        }
    }

    /// Chat-completions base URL for OpenAI-compatible providers.
    pub fn base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Fireworks => "https://api.fireworks.ai/inference/v1",
            Provider::Together => "https://api.together.xyz/v1",
            Provider::Groq => "https://api.groq.com/openai/v1",
            Provider::Grok => "https://api.x.ai/v1",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Gemini => gemini::BASE_URL,
        }
    }

    pub fn is_openai_compatible(&self) -> bool {
        !matches!(self, Provider::Gemini)
    }

    /// Default embedding model when the session does not name one.
    pub fn default_embedding_model(&self) -> &'static str {
        match self {
            Provider::OpenAi | Provider::Groq | Provider::Grok | Provider::OpenRouter => {
                "text-embedding-3-small"
            }
            Provider::Fireworks => "nomic-ai/nomic-embed-text-v1.5",
            Provider::Together => "togethercomputer/m2-bert-80M-8k-retrieval",
            Provider::Gemini => "text-embedding-004",
        }
    }
}

/// Per-request LLM context resolved from session preferences (or the
/// development fallback). Carried explicitly so concurrent sessions can use
/// different providers.
#[derive(Debug, Clone)]
pub struct LlmContext {
    pub provider: Provider,
    pub model: String,
    pub api_key: String,
}

impl LlmContext {
    /// Resolve chat context from session preferences, falling back to the
    /// environment only in development.
    pub fn resolve(
        preferences: Option<&SessionPreferences>,
        api_key: Option<String>,
        config: &Config,
    ) -> Result<Self, LlmError> {
        let (provider_name, model) = match preferences {
            Some(p) => (p.ai_provider.clone(), p.ai_model.clone()),
            None if config.is_development() => {
                let provider = config
                    .ai
                    .provider
                    .clone()
                    .unwrap_or_else(|| "openai".to_string());
                let model = config.ai.model.clone().ok_or_else(|| {
                    LlmError::Unauthorized("no model configured for development fallback".into())
                })?;
                (provider, model)
            }
            None => {
                return Err(LlmError::Unauthorized(
                    "session preferences not set; configure provider and model".into(),
                ))
            }
        };

        let provider = Provider::from_name(&provider_name)
            .ok_or_else(|| LlmError::Unauthorized(format!("unknown provider: {provider_name}")))?;

        let api_key = api_key
            .or_else(|| {
                if config.is_development() {
                    config.ai.api_key.clone()
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::Unauthorized("API key required".into()))?;

        Ok(Self {
            provider,
            model,
            api_key,
        })
    }

    /// Resolve the embedding context: the session's embedding provider when
    /// set, otherwise the chat provider with its default embedding model.
    pub fn resolve_embedding(
        preferences: Option<&SessionPreferences>,
        api_key: Option<String>,
        config: &Config,
    ) -> Result<Self, LlmError> {
        let chat = Self::resolve(preferences, api_key, config)?;

        let provider = preferences
            .and_then(|p| p.embedding_provider.as_deref())
            .and_then(Provider::from_name)
            .unwrap_or(chat.provider);

        let model = preferences
            .and_then(|p| p.embedding_model.clone())
            .unwrap_or_else(|| provider.default_embedding_model().to_string());

        Ok(Self {
            provider,
            model,
            api_key: chat.api_key,
        })
    }

    /// Key identifying the shared rate-limiter bucket for this context.
    pub fn limiter_key(&self) -> String {
        format!("{}:{}", self.provider.name(), self.api_key)
    }
}

// ─── Chat protocol types ─────────────────────────────────

/// A chat message in the provider-neutral shape. `tool_calls` appears on
/// assistant turns that requested tools; `tool_call_id`/`name` appear on
/// tool-result turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Option<Vec<ToolCallRecord>>) -> Self {
        Self {
            role: "assistant".into(),
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, name: impl Into<String>, content: String) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// A tool offered to the model, described by a JSON-schema parameter object.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// The chat-completions wire shape.
    pub fn to_openai(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other(String),
}

/// Events surfaced by the streaming chat client. Tool-call arguments are
/// buffered internally and emitted whole.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    ContentDelta(String),
    ToolCallRequest {
        id: String,
        name: String,
        arguments: String,
    },
    Finish(FinishReason),
}

// ─── Errors ──────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LlmError {
    /// Invalid or missing credentials, or a request the provider rejected
    /// as malformed. Not retried.
    #[error("{0}")]
    Unauthorized(String),

    /// Rate limit persisted through the whole retry budget.
    #[error("provider rate limit exceeded: {0}")]
    RateLimited(String),

    /// Transport or provider failure after retries.
    #[error("{0}")]
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn test_provider_base_urls_are_exact() {
        assert_eq!(Provider::OpenAi.base_url(), "https://api.openai.com/v1");
        assert_eq!(
            Provider::Fireworks.base_url(),
            "https://api.fireworks.ai/inference/v1"
        );
        assert_eq!(Provider::Together.base_url(), "https://api.together.xyz/v1");
        assert_eq!(Provider::Groq.base_url(), "https://api.groq.com/openai/v1");
        assert_eq!(Provider::Grok.base_url(), "https://api.x.ai/v1");
        assert_eq!(
            Provider::OpenRouter.base_url(),
            "https://openrouter.ai/api/v1"
        );
    }

    #[test]
    fn test_provider_round_trip_names() {
        for name in [
            "openai",
            "fireworks",
            "together",
            "groq",
            "grok",
            "openrouter",
            "gemini",
        ] {
            let provider = Provider::from_name(name).unwrap();
            assert_eq!(provider.name(), name);
        }
        assert!(Provider::from_name("anthropic-ish").is_none());
    }

    #[test]
    fn test_gemini_is_not_openai_compatible() {
        assert!(!Provider::Gemini.is_openai_compatible());
        assert!(Provider::Fireworks.is_openai_compatible());
    }

    fn prefs(provider: &str, model: &str) -> SessionPreferences {
        SessionPreferences {
            ai_provider: provider.to_string(),
            ai_model: model.to_string(),
            embedding_provider: None,
            embedding_model: None,
            theme: None,
        }
    }

    #[test]
    fn test_resolve_from_preferences() {
        let config = Config::default();
        let p = prefs("fireworks", "qwen3-30b");
        let ctx = LlmContext::resolve(Some(&p), Some("sk-x".into()), &config).unwrap();
        assert_eq!(ctx.provider, Provider::Fireworks);
        assert_eq!(ctx.model, "qwen3-30b");
        assert_eq!(ctx.api_key, "sk-x");
    }

    #[test]
    fn test_resolve_rejects_without_preferences_in_production() {
        let config = Config {
            env: Environment::Production,
            ..Config::default()
        };
        assert!(matches!(
            LlmContext::resolve(None, Some("k".into()), &config),
            Err(LlmError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_resolve_dev_fallback() {
        let mut config = Config::default();
        config.ai.provider = Some("groq".into());
        config.ai.model = Some("llama-3.1-70b".into());
        config.ai.api_key = Some("dev-key".into());

        let ctx = LlmContext::resolve(None, None, &config).unwrap();
        assert_eq!(ctx.provider, Provider::Groq);
        assert_eq!(ctx.api_key, "dev-key");
    }

    #[test]
    fn test_resolve_rejects_unknown_provider() {
        let config = Config::default();
        let p = prefs("nonsense", "m");
        assert!(matches!(
            LlmContext::resolve(Some(&p), Some("k".into()), &config),
            Err(LlmError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_resolve_embedding_defaults_to_chat_provider() {
        let config = Config::default();
        let p = prefs("fireworks", "qwen3-30b");
        let ctx = LlmContext::resolve_embedding(Some(&p), Some("k".into()), &config).unwrap();
        assert_eq!(ctx.provider, Provider::Fireworks);
        assert_eq!(ctx.model, "nomic-ai/nomic-embed-text-v1.5");
    }

    #[test]
    fn test_resolve_embedding_honors_explicit_settings() {
        let config = Config::default();
        let mut p = prefs("groq", "llama-3.1-70b");
        p.embedding_provider = Some("openai".into());
        p.embedding_model = Some("text-embedding-3-large".into());
        let ctx = LlmContext::resolve_embedding(Some(&p), Some("k".into()), &config).unwrap();
        assert_eq!(ctx.provider, Provider::OpenAi);
        assert_eq!(ctx.model, "text-embedding-3-large");
    }

    #[test]
    fn test_tool_definition_wire_shape() {
        let tool = ToolDefinition {
            name: "search_code",
            description: "Search code",
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let json = tool.to_openai();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "search_code");
    }

    #[test]
    fn test_chat_message_constructors() {
        let msg = ChatMessage::tool("call_1", "search_code", "{}".into());
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("search_code"));

        let msg = ChatMessage::assistant(None, None);
        assert_eq!(msg.role, "assistant");
        assert!(msg.content.is_none());
    }
}
