//! LLM integration for personalization.
//!
//! Supports:
//! - **OpenAI**: Direct API access via rig-core (default)
//! - **Anthropic**: Direct API access via rig-core
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    fn key_var(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Build config from `OUTREACH_LLM_BACKEND`, the backend's API key
    /// variable and `OUTREACH_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("OUTREACH_LLM_BACKEND")
            .unwrap_or_else(|_| "openai".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmBackend::OpenAi,
            "anthropic" => LlmBackend::Anthropic,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "OUTREACH_LLM_BACKEND".into(),
                    message: format!("unknown backend '{other}' (expected openai or anthropic)"),
                });
            }
        };

        let api_key = std::env::var(backend.key_var())
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(backend.key_var().to_string()))?;

        let model =
            std::env::var("OUTREACH_MODEL").unwrap_or_else(|_| backend.default_model().to_string());

        Ok(Self {
            backend,
            api_key: secrecy::SecretString::from(api_key),
            model,
        })
    }
}

/// Create an LLM provider from configuration. Client setup failures are
/// configuration errors.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let provider = match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config)?,
        LlmBackend::OpenAi => create_openai_provider(config)?,
    };
    Ok(provider)
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "openai")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_openai_provider() {
        // rig-core clients accept any string as API key at construction time.
        // The actual auth failure happens when making a request.
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            api_key: secrecy::SecretString::from("sk-test"),
            model: "gpt-4o-mini".to_string(),
        };
        let provider = create_provider(&config);
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_create_anthropic_provider() {
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-3-5-haiku-latest".to_string(),
        };
        let provider = create_provider(&config);
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().model_name(), "claude-3-5-haiku-latest");
    }

    #[test]
    fn backend_defaults() {
        assert_eq!(LlmBackend::OpenAi.key_var(), "OPENAI_API_KEY");
        assert_eq!(LlmBackend::Anthropic.default_model(), "claude-3-5-haiku-latest");
    }
}
