//! Generation Provider Abstraction
//!
//! One streaming interface for every backend the pipeline talks to. Stages never
//! see provider-specific types: they hand over chat messages plus
//! [`GenerationParams`] and receive a stream of token deltas whose errors are
//! already mapped into [`ProviderErrorKind`](crate::error::ProviderErrorKind).

use crate::cancel::CancelToken;
use crate::error::{PipelineError, ProviderError};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub mod openai;
pub mod scripted;

pub use openai::OpenAiCompatibleClient;
pub use scripted::{ScriptStep, ScriptedProvider};

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Per-call sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Unit the call belongs to; forwarded for tracing and routing.
    pub unit_id: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Token deltas; the stream ending without an error is the `ok` terminal status.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Generation provider client trait
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Start a streaming generation.
    ///
    /// Implementations should stop producing tokens once `cancel` fires; callers
    /// also stop polling the stream, so honoring it is an optimisation.
    async fn submit(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> Result<TokenStream, ProviderError>;

    fn provider_name(&self) -> &str;
}

/// Provider backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any `/chat/completions` endpoint speaking the OpenAI streaming protocol.
    OpenaiCompatible,
    /// Local Ollama server through its OpenAI-compatible API.
    Ollama,
    /// Deterministic echo provider for dry runs.
    Echo,
}

/// Provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenaiCompatible,
            endpoint: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("Invalid endpoint URL: {}", endpoint));
            }
        }
        if let Some(var) = &self.api_key_env {
            if var.trim().is_empty() {
                return Err("api_key_env cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create(config: &ProviderConfig) -> Result<Arc<dyn GenerationProvider>, PipelineError> {
        match config.kind {
            ProviderKind::OpenaiCompatible => {
                let api_key = match &config.api_key_env {
                    Some(var) => Some(std::env::var(var).map_err(|_| {
                        PipelineError::ConfigError(format!(
                            "Environment variable {} is not set",
                            var
                        ))
                    })?),
                    None => None,
                };
                let endpoint = config
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                Ok(Arc::new(OpenAiCompatibleClient::new(
                    "openai", endpoint, api_key,
                )?))
            }
            ProviderKind::Ollama => {
                let endpoint = config
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434/v1".to_string());
                Ok(Arc::new(OpenAiCompatibleClient::new("ollama", endpoint, None)?))
            }
            ProviderKind::Echo => Ok(Arc::new(ScriptedProvider::echo())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_validation() {
        let mut config = ProviderConfig::default();
        assert!(config.validate().is_ok());

        config.endpoint = Some("not-a-url".to_string());
        assert!(config.validate().is_err());

        config.endpoint = Some("http://localhost:8080/v1".to_string());
        config.api_key_env = Some(" ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn factory_builds_local_and_echo_providers() {
        let ollama = ProviderFactory::create(&ProviderConfig {
            kind: ProviderKind::Ollama,
            endpoint: None,
            api_key_env: None,
        })
        .unwrap();
        assert_eq!(ollama.provider_name(), "ollama");

        let echo = ProviderFactory::create(&ProviderConfig {
            kind: ProviderKind::Echo,
            endpoint: None,
            api_key_env: None,
        })
        .unwrap();
        assert_eq!(echo.provider_name(), "scripted");
    }

    #[test]
    fn factory_requires_api_key_variable() {
        let result = ProviderFactory::create(&ProviderConfig {
            kind: ProviderKind::OpenaiCompatible,
            endpoint: None,
            api_key_env: Some("BLUEPRINT_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
        });
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
