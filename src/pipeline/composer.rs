//! Draft composer: turns a `needs_reply` message into a reply draft.
//!
//! The model writes the body only. Greeting, sign-off, subject, recipients
//! and threading headers are applied by a deterministic template so that a
//! draft is always addressable even when the model misbehaves.
//!
//! Failures never surface as errors: timeouts, refusals and explicit
//! `NO_DRAFT:` answers produce a `Discarded` draft carrying the reason.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ComposeConfig;
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionService, ResponseContract, Role,
};
use crate::memory::ConversationThread;
use crate::pipeline::parser::strip_quoted_text;
use crate::pipeline::types::{DraftContent, DraftState, Message};

/// Max tokens for a draft body.
const DRAFT_MAX_TOKENS: u32 = 1024;

/// Temperature for drafting.
const DRAFT_TEMPERATURE: f32 = 0.4;

/// Prefix the model uses to decline drafting.
const NO_DRAFT_SENTINEL: &str = "NO_DRAFT:";

const EMPTY_SUBJECT: &str = "(no subject)";

static REFUSAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(i'?m sorry,? but|i am sorry,? but|i can(no|')t (help|assist|write|draft)|i am unable to|i'?m unable to|as an ai\b)",
    )
    .unwrap()
});

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|dear|greetings|good (morning|afternoon|evening))\b").unwrap()
});

static SIGN_OFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(best|best regards|kind regards|warm regards|regards|thanks|thank you|many thanks|cheers|sincerely|all the best|talk soon)[,.!]?\s*$",
    )
    .unwrap()
});

static RE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*re\s*:").unwrap());

/// Generates reply drafts with a fixed tone policy.
pub struct DraftComposer {
    llm: Arc<dyn CompletionService>,
    config: ComposeConfig,
    timeout: Duration,
}

/// What the model's answer amounts to.
#[derive(Debug, PartialEq)]
enum ModelAnswer {
    Body(String),
    Declined(String),
}

impl DraftComposer {
    pub fn new(llm: Arc<dyn CompletionService>, config: ComposeConfig, timeout: Duration) -> Self {
        Self {
            llm,
            config,
            timeout,
        }
    }

    /// Compose a reply to `message` using prior turns of its thread.
    pub async fn compose(&self, message: &Message, thread: &ConversationThread) -> DraftContent {
        let draft = self.skeleton(message);
        let request = self.build_request(message, thread);

        let answer = match self.generate(request).await {
            Ok(response) => interpret(&response.content),
            Err(e) => {
                warn!(id = %message.id, error = %e, "Draft generation failed");
                return draft.discard(failure_reason(&e));
            }
        };

        match answer {
            ModelAnswer::Body(body) => {
                info!(
                    id = %message.id,
                    thread_id = %message.thread_id,
                    chars = body.len(),
                    "Composed reply draft"
                );
                DraftContent {
                    body: self.wrap(message, &body),
                    ..draft
                }
            }
            ModelAnswer::Declined(reason) => {
                info!(id = %message.id, reason = %reason, "Model declined to draft a reply");
                draft.discard(reason)
            }
        }
    }

    /// Subject, recipients and threading headers; body left empty.
    fn skeleton(&self, message: &Message) -> DraftContent {
        let mut references = message.references.clone();
        if !message.message_id.is_empty() && references.last() != Some(&message.message_id) {
            references.push(message.message_id.clone());
        }

        DraftContent {
            id: Uuid::new_v4(),
            thread_id: message.thread_id.clone(),
            reply_to_message: message.id.clone(),
            in_reply_to: message.message_id.clone(),
            references,
            to: vec![message.sender.clone()],
            cc: if self.config.reply_all {
                reply_all_cc(message, self.config.user_address.as_deref())
            } else {
                Vec::new()
            },
            subject: reply_subject(&message.subject),
            body: String::new(),
            generated_at: Utc::now(),
            state: DraftState::Composed,
        }
    }

    fn build_request(&self, message: &Message, thread: &ConversationThread) -> CompletionRequest {
        let mut messages = vec![ChatMessage::system(build_draft_system_prompt())];
        messages.extend(bounded_context(
            thread,
            self.config.max_context_turns,
            self.config.max_context_chars,
        ));
        messages.push(ChatMessage::user(build_draft_user_prompt(
            message,
            self.config.max_body_chars,
        )));

        CompletionRequest::new(messages)
            .with_temperature(DRAFT_TEMPERATURE)
            .with_max_tokens(DRAFT_MAX_TOKENS)
            .with_contract(ResponseContract::FreeText)
    }

    async fn generate(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LlmError::Timeout {
                    provider: self.llm.model_name().to_string(),
                    after: self.timeout,
                });
            }
        };
        if response.is_refusal() {
            return Err(LlmError::Refused {
                provider: self.llm.model_name().to_string(),
                reason: format!("finish reason {:?}", response.finish_reason),
            });
        }
        Ok(response)
    }

    /// Add the greeting and sign-off the model left out.
    fn wrap(&self, message: &Message, body: &str) -> String {
        let lines: Vec<&str> = body.trim().lines().collect();

        let mut out = String::with_capacity(body.len() + 64);
        if !lines.first().is_some_and(|l| GREETING.is_match(l)) {
            out.push_str(&format!("Hi {},\n\n", greeting_name(message)));
        }
        out.push_str(body.trim_end());

        let tail = lines.iter().rev().find(|l| !l.trim().is_empty());
        match tail {
            Some(last) if SIGN_OFF.is_match(last) => {
                out.push('\n');
                out.push_str(&self.config.signature);
            }
            Some(last) if last.trim() == self.config.signature.trim() => {}
            _ => {
                out.push_str("\n\nBest regards,\n");
                out.push_str(&self.config.signature);
            }
        }
        out
    }
}

/// A leading `Subject:` line the model echoed back, removed.
fn without_subject_line(text: &str) -> &str {
    let (first, rest) = text.split_once('\n').unwrap_or((text, ""));
    if first.trim_start().to_lowercase().starts_with("subject:") {
        rest.trim()
    } else {
        text
    }
}

/// Classify the raw model output.
fn interpret(raw: &str) -> ModelAnswer {
    let text = without_subject_line(raw.trim());
    if text.is_empty() {
        return ModelAnswer::Declined("model returned an empty draft".to_string());
    }
    if let Some(reason) = text.strip_prefix(NO_DRAFT_SENTINEL) {
        let reason = reason.trim();
        return ModelAnswer::Declined(if reason.is_empty() {
            "model declined to draft a reply".to_string()
        } else {
            format!("model declined: {reason}")
        });
    }
    if REFUSAL.is_match(text) {
        return ModelAnswer::Declined("model declined to draft a reply".to_string());
    }
    ModelAnswer::Body(text.to_string())
}

fn failure_reason(error: &LlmError) -> String {
    match error {
        LlmError::Timeout { .. } => "draft timeout".to_string(),
        LlmError::Refused { .. } => "draft refused".to_string(),
        other => format!("draft generation failed: {other}"),
    }
}

/// `Re: <subject>` without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return format!("Re: {EMPTY_SUBJECT}");
    }
    if RE_PREFIX.is_match(subject) {
        return subject.to_string();
    }
    format!("Re: {subject}")
}

/// Original To + Cc minus the user and the sender, deduplicated.
fn reply_all_cc(message: &Message, user_address: Option<&str>) -> Vec<String> {
    let mut cc: Vec<String> = Vec::new();
    for addr in message.to.iter().chain(&message.cc) {
        let excluded = addr.eq_ignore_ascii_case(&message.sender)
            || user_address.is_some_and(|me| addr.eq_ignore_ascii_case(me))
            || cc.iter().any(|c| c.eq_ignore_ascii_case(addr));
        if !excluded {
            cc.push(addr.clone());
        }
    }
    cc
}

fn greeting_name(message: &Message) -> String {
    message
        .sender_name
        .as_deref()
        .and_then(|n| n.split_whitespace().next())
        .map(|n| n.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "there".to_string())
}

/// The most recent `max_turns` turns whose combined length fits `max_chars`.
fn bounded_context(
    thread: &ConversationThread,
    max_turns: usize,
    max_chars: usize,
) -> Vec<ChatMessage> {
    let mut budget = max_chars;
    let mut kept: Vec<ChatMessage> = Vec::new();
    for turn in thread.last_n(max_turns).iter().rev() {
        let len = turn.content.chars().count();
        if len > budget {
            break;
        }
        budget -= len;
        kept.push(turn.to_chat_message());
    }
    kept.reverse();
    debug!(
        thread_id = %thread.thread_id,
        turns = kept.len(),
        "Bounded thread context for draft"
    );
    kept
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the draft system prompt (tone policy).
fn build_draft_system_prompt() -> String {
    format!(
        "You write email replies on behalf of the user. Respond as the user.\n\n\
         Tone and structure:\n\
         - Warm but professional; match the formality of the sender\n\
         - Concise: briefly acknowledge the context, answer every question or request, \
         then state next steps\n\
         - Plain, polished language with correct grammar; no slang or jargon\n\
         - If key details are missing, ask for them politely instead of inventing facts\n\n\
         Output:\n\
         - Return ONLY the email body, from greeting to closing line\n\
         - Do not include a subject line, a signature block, or any commentary\n\
         - If you cannot or should not reply, answer with `{NO_DRAFT_SENTINEL} <short reason>`"
    )
}

/// Build the draft user prompt from the message being answered.
fn build_draft_user_prompt(message: &Message, max_body_chars: usize) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str("Write a reply to this email.\n\n");
    prompt.push_str(&format!("From: {}", message.sender));
    if let Some(ref name) = message.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    if !message.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", message.subject));
    }
    prompt.push_str(&format!("Date: {}\n", message.timestamp.to_rfc2822()));

    let body: String = message.body_text.chars().take(max_body_chars).collect();
    prompt.push_str(&format!("\n<email>\n{}\n</email>", body));
    prompt
}

/// The memory turn recorded for a message that was answered.
pub fn user_turn_for(message: &Message) -> (Role, String) {
    let mut content = String::new();
    content.push_str(&format!("From: {}\n", message.sender));
    if !message.subject.is_empty() {
        content.push_str(&format!("Subject: {}\n", message.subject));
    }
    content.push('\n');
    let unquoted = strip_quoted_text(&message.body_text);
    if unquoted.trim().is_empty() {
        content.push_str(message.body_text.trim());
    } else {
        content.push_str(unquoted.trim());
    }
    (Role::User, content)
}
