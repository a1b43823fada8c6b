//! Bridges rig-core's `CompletionModel` to our `CompletionService` trait.

use async_trait::async_trait;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, Message};
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionService, FinishReason, Role,
};

/// Default output budget when the caller does not set one (Anthropic requires it).
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Adapter from a rig completion model to `CompletionService`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> CompletionService for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let SplitConversation {
            preamble,
            history,
            prompt,
        } = split_conversation(&request.messages);

        let history: Vec<Message> = history
            .into_iter()
            .map(|m| match m.role {
                Role::Assistant => Message::assistant(m.content.clone()),
                _ => Message::user(m.content.clone()),
            })
            .collect();

        let mut builder = self
            .model
            .completion_request(Message::user(prompt))
            .messages(history)
            .max_tokens(request.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_TOKENS));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(&self.model_name, e))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let finish_reason = serde_json::to_value(&response.raw_response)
            .map(|raw| finish_reason_from_raw(&raw))
            .unwrap_or(FinishReason::Unknown);

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason,
        })
    }
}

struct SplitConversation<'a> {
    preamble: Option<String>,
    history: Vec<&'a ChatMessage>,
    prompt: String,
}

/// System messages become the preamble, the last user message the prompt,
/// everything in between the chat history.
fn split_conversation(messages: &[ChatMessage]) -> SplitConversation<'_> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let preamble = (!system.is_empty()).then(|| system.join("\n\n"));

    let mut rest: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let prompt = match rest.last() {
        Some(last) if last.role == Role::User => {
            let content = last.content.clone();
            rest.pop();
            content
        }
        _ => String::new(),
    };

    SplitConversation {
        preamble,
        history: rest,
        prompt,
    }
}

/// Read the stop reason out of the provider's raw response body.
///
/// rig flattens OpenAI refusal parts into plain text, so they are only
/// visible here.
fn finish_reason_from_raw(raw: &Value) -> FinishReason {
    // Anthropic Messages API
    if let Some(reason) = raw.get("stop_reason").and_then(Value::as_str) {
        return match reason {
            "end_turn" | "stop_sequence" | "tool_use" | "pause_turn" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "refusal" => FinishReason::Refusal,
            _ => FinishReason::Unknown,
        };
    }

    // OpenAI Responses API
    let refused = raw
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .any(|part| part.get("type").and_then(Value::as_str) == Some("refusal"));
    if refused {
        return FinishReason::Refusal;
    }
    match raw
        .get("incomplete_details")
        .and_then(|d| d.get("reason"))
        .and_then(Value::as_str)
    {
        Some("max_output_tokens") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Unknown,
        None if raw.get("status").and_then(Value::as_str) == Some("completed") => {
            FinishReason::Stop
        }
        None => FinishReason::Unknown,
    }
}

fn map_completion_error(provider: &str, error: CompletionError) -> LlmError {
    let reason = error.to_string();
    let lower = reason.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("authentication") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}
