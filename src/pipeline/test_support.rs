//! Fixtures shared by the pipeline unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::error::LlmError;
use crate::llm::{CompletionRequest, CompletionResponse, CompletionService, FinishReason};
use crate::pipeline::types::{BodyFormat, Message};

/// A plain-text message from `sender` with sensible defaults.
pub fn message(id: &str, sender: &str) -> Message {
    Message {
        id: id.into(),
        thread_id: format!("thread-{id}"),
        message_id: format!("{id}@example.com"),
        sender: sender.into(),
        sender_name: None,
        to: vec!["me@example.com".into()],
        cc: vec![],
        subject: "Hello".into(),
        timestamp: Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap(),
        body_text: "Hi there".into(),
        body_html: None,
        body_format: BodyFormat::PlainText,
        references: vec![],
        headers: vec![],
        decoding_degraded: false,
    }
}

pub fn response(content: &str) -> CompletionResponse {
    CompletionResponse {
        content: content.into(),
        input_tokens: 10,
        output_tokens: 10,
        finish_reason: FinishReason::Stop,
    }
}

/// One scripted completion outcome.
pub enum Scripted {
    Reply(String),
    Refuse,
    Fail(String),
    Hang(Duration),
}

/// Completion service that answers from a queue, then repeats `fallback`.
pub struct ScriptedLlm {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: String,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn always(content: &str) -> Self {
        Self::new(vec![], content)
    }

    pub fn new(script: Vec<Scripted>, fallback: &str) -> Self {
        Self {
            queue: Mutex::new(script.into()),
            fallback: fallback.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> CompletionRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            None => Ok(response(&self.fallback)),
            Some(Scripted::Reply(content)) => Ok(response(&content)),
            Some(Scripted::Refuse) => Ok(CompletionResponse {
                finish_reason: FinishReason::Refusal,
                ..response("")
            }),
            Some(Scripted::Fail(reason)) => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason,
            }),
            Some(Scripted::Hang(after)) => {
                tokio::time::sleep(after).await;
                Ok(response(&self.fallback))
            }
        }
    }
}
