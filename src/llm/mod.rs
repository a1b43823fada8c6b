//! Completion backends for triage and drafting.
//!
//! Both backends go through rig-core; `RigAdapter` turns a rig completion
//! model into a `CompletionService` so the pipeline never sees rig types.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use rig::providers::{anthropic, openai};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::LlmError;

/// Which hosted model family serves completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn name(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

/// Build the completion service the pipeline talks to.
///
/// No request is made here; a bad key surfaces on the first completion.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionService>, LlmError> {
    let key = config.api_key.expose_secret();
    let service: Arc<dyn CompletionService> = match config.backend {
        LlmBackend::Anthropic => {
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(client.completion_model(&config.model), &config.model))
        }
        LlmBackend::OpenAi => {
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(client.completion_model(&config.model), &config.model))
        }
    };
    info!(backend = config.backend.name(), model = %config.model, "Completion backend ready");
    Ok(service)
}

fn client_error(backend: LlmBackend, e: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.name().to_string(),
        reason: format!("client setup failed: {e}"),
    }
}

/// Extract a JSON value from LLM output (handles markdown wrapping).
///
/// `open`/`close` select the outermost delimiters: `{`/`}` for objects,
/// `[`/`]` for arrays.
pub fn extract_json(text: &str, open: char, close: char) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with(open) {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with(open) {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: SecretString::from("placeholder"),
            model: model.to_string(),
        }
    }

    #[test]
    fn builds_each_backend_without_network() {
        for (backend, model) in [
            (LlmBackend::Anthropic, "claude-sonnet-4-20250514"),
            (LlmBackend::OpenAi, "gpt-4o"),
        ] {
            let service = create_provider(&config(backend, model)).unwrap();
            assert_eq!(service.model_name(), model);
        }
    }

    #[test]
    fn extract_json_plain_object() {
        assert_eq!(extract_json(r#"{"a":1}"#, '{', '}'), r#"{"a":1}"#);
    }

    #[test]
    fn extract_json_markdown_fence() {
        let raw = "Here you go:\n```json\n{\"label\": \"no_action\"}\n```";
        assert_eq!(extract_json(raw, '{', '}'), "{\"label\": \"no_action\"}");
    }

    #[test]
    fn extract_json_embedded_array() {
        let raw = "Result: [{\"id\": \"1\"}] done";
        assert_eq!(extract_json(raw, '[', ']'), "[{\"id\": \"1\"}]");
    }

    #[test]
    fn extract_json_no_delimiters_returns_trimmed() {
        assert_eq!(extract_json("  nope  ", '{', '}'), "nope");
    }
}
