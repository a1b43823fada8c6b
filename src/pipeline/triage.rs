//! Triage classifier: decides which messages warrant a reply.
//!
//! Flow:
//! 1. Rules engine (fast, no LLM) → may short-circuit
//! 2. LLM triage → strict JSON `{"label", "rationale"}` contract
//! 3. Any LLM failure degrades to `no_action` with the failure recorded
//!
//! Classification never returns an error: a message the model could not
//! judge is simply not answered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionService, ResponseContract,
    extract_json,
};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{DecisionSource, Message, TriageDecision, TriageLabel};

/// Max tokens for the triage LLM call (runs on every message).
const TRIAGE_MAX_TOKENS: u32 = 512;

/// Temperature for triage (deterministic-ish).
const TRIAGE_TEMPERATURE: f32 = 0.1;

/// Body characters sent to the model per message.
const BODY_PREVIEW_CHARS: usize = 1000;

/// Body characters per message in a batched prompt.
const BATCH_BODY_PREVIEW_CHARS: usize = 400;

/// Rule pre-filter plus one model call per message.
pub struct TriageClassifier {
    llm: Arc<dyn CompletionService>,
    rules: RulesEngine,
    timeout: Duration,
}

impl TriageClassifier {
    pub fn new(llm: Arc<dyn CompletionService>, rules: RulesEngine, timeout: Duration) -> Self {
        Self {
            llm,
            rules,
            timeout,
        }
    }

    /// Classify a single message.
    pub async fn classify(&self, message: &Message) -> TriageDecision {
        if let Some(decision) = self.rules.evaluate(message) {
            debug!(
                id = %message.id,
                label = decision.label.label(),
                "Rules engine matched, skipping LLM triage"
            );
            return decision;
        }

        match self.classify_with_model(message).await {
            Ok(decision) => {
                debug!(id = %message.id, label = decision.label.label(), "Model triage decision");
                decision
            }
            Err(e) => {
                warn!(id = %message.id, error = %e, "Triage failed, degrading to no_action");
                TriageDecision::degraded(&message.id, failure_reason(&e))
            }
        }
    }

    /// Classify several messages with a single model call.
    ///
    /// Rule matches never reach the model. Messages the batched answer
    /// omits or mislabels are classified individually.
    pub async fn classify_batch(&self, messages: &[Message]) -> Vec<TriageDecision> {
        let mut decisions: Vec<Option<TriageDecision>> =
            messages.iter().map(|m| self.rules.evaluate(m)).collect();

        let pending: Vec<&Message> = messages
            .iter()
            .zip(&decisions)
            .filter(|(_, d)| d.is_none())
            .map(|(m, _)| m)
            .collect();

        if !pending.is_empty() {
            let mut answered = match self.classify_many_with_model(&pending).await {
                Ok(answered) => answered,
                Err(e) => {
                    warn!(
                        count = pending.len(),
                        error = %e,
                        "Batched triage failed, falling back to per-message calls"
                    );
                    HashMap::new()
                }
            };

            let mut fallbacks = Vec::new();
            for (i, slot) in decisions.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                match answered.remove(&messages[i].id) {
                    Some(decision) => *slot = Some(decision),
                    None => fallbacks.push(i),
                }
            }

            if !fallbacks.is_empty() {
                info!(count = fallbacks.len(), "Classifying messages missing from batched answer");
                let results =
                    join_all(fallbacks.iter().map(|&i| self.classify(&messages[i]))).await;
                for (i, decision) in fallbacks.into_iter().zip(results) {
                    decisions[i] = Some(decision);
                }
            }
        }

        decisions
            .into_iter()
            .zip(messages)
            .map(|(d, m)| d.unwrap_or_else(|| TriageDecision::degraded(&m.id, "classification failed")))
            .collect()
    }

    async fn classify_with_model(&self, message: &Message) -> Result<TriageDecision, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_triage_system_prompt()),
            ChatMessage::user(build_triage_user_prompt(message)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(TRIAGE_MAX_TOKENS)
        .with_contract(ResponseContract::JsonObject);

        let response = self.complete(request).await?;
        let (label, rationale) = parse_triage_response(&response.content)?;
        Ok(TriageDecision::new(
            &message.id,
            label,
            rationale,
            DecisionSource::Model,
        ))
    }

    async fn classify_many_with_model(
        &self,
        messages: &[&Message],
    ) -> Result<HashMap<String, TriageDecision>, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_batch_system_prompt()),
            ChatMessage::user(build_batch_user_prompt(messages)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(TRIAGE_MAX_TOKENS * messages.len().min(16) as u32)
        .with_contract(ResponseContract::JsonArray);

        let response = self.complete(request).await?;
        let entries = parse_batch_response(&response.content)?;

        let known: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        let mut decisions = HashMap::with_capacity(entries.len());
        for entry in entries {
            if !known.contains(entry.id.as_str()) {
                debug!(id = %entry.id, "Batched triage answered an unknown id");
                continue;
            }
            let Some(label) = TriageLabel::parse(&entry.label) else {
                debug!(id = %entry.id, label = %entry.label, "Batched triage returned unknown label");
                continue;
            };
            let rationale = Some(entry.rationale).filter(|r| !r.trim().is_empty());
            let decision = TriageDecision::new(&entry.id, label, rationale, DecisionSource::Model);
            decisions.entry(entry.id).or_insert(decision);
        }
        Ok(decisions)
    }

    /// Run one completion under the configured timeout, mapping refusals.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
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
}

/// Human-readable failure recorded on a degraded decision.
fn failure_reason(error: &LlmError) -> String {
    match error {
        LlmError::Timeout { .. } => "classification timeout".to_string(),
        LlmError::Refused { .. } => "classification refused".to_string(),
        LlmError::ContractViolation { .. } | LlmError::Json(_) => {
            "classification contract violation".to_string()
        }
        other => format!("classification failed: {other}"),
    }
}

// ── Prompt construction ─────────────────────────────────────────────

const LABEL_CRITERIA: &str = "Labels:\n\
     - \"needs_reply\": a real person wrote to the user and the message asks a question, \
     makes a request, proposes a task or invitation, or otherwise genuinely invites a textual reply.\n\
     - \"no_action\": FYI only. Transactional or informational mail (order confirmations, \
     shipping notices, receipts, password resets), calendar notices that only need Accept/Decline, \
     messages the user sent themselves, or anything with no actionable content.\n\
     - \"spam_or_automated\": spam, newsletters, marketing blasts, automated alerts, and mail \
     from no-reply or system addresses.\n\n\
     Rules:\n\
     - When in doubt between needs_reply and no_action, choose no_action\n\
     - The rationale is one short sentence";

/// Build the triage system prompt.
fn build_triage_system_prompt() -> String {
    format!(
        "You are an email triage engine. Classify one incoming email into exactly one label.\n\n\
         {LABEL_CRITERIA}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"label\": \"needs_reply\" | \"no_action\" | \"spam_or_automated\", \"rationale\": \"...\"}}"
    )
}

fn build_batch_system_prompt() -> String {
    format!(
        "You are an email triage engine. Classify each email below into exactly one label.\n\n\
         {LABEL_CRITERIA}\n\n\
         Respond with ONLY a JSON array containing one object per email, using the id given:\n\
         [{{\"id\": \"...\", \"label\": \"needs_reply\" | \"no_action\" | \"spam_or_automated\", \"rationale\": \"...\"}}]"
    )
}

fn push_headline(prompt: &mut String, message: &Message) {
    prompt.push_str(&format!("From: {}", message.sender));
    if let Some(ref name) = message.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    if !message.to.is_empty() {
        prompt.push_str(&format!("To: {}\n", message.to.join(", ")));
    }
    if !message.cc.is_empty() {
        prompt.push_str(&format!("Cc: {}\n", message.cc.join(", ")));
    }
    if !message.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", message.subject));
    }
    prompt.push_str(&format!("Date: {}\n", message.timestamp.to_rfc2822()));
}

/// Build the triage user prompt from a parsed message.
fn build_triage_user_prompt(message: &Message) -> String {
    let mut prompt = String::with_capacity(512);
    push_headline(&mut prompt, message);

    // Message content (truncated for token efficiency)
    let content_preview: String = message.body_text.chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nMessage:\n{}", content_preview));
    prompt
}

fn build_batch_user_prompt(messages: &[&Message]) -> String {
    let mut prompt = String::with_capacity(512 * messages.len());
    for message in messages {
        prompt.push_str(&format!("<email id=\"{}\">\n", message.id));
        push_headline(&mut prompt, message);
        let content_preview: String = message
            .body_text
            .chars()
            .take(BATCH_BODY_PREVIEW_CHARS)
            .collect();
        prompt.push_str(&format!("\n{}\n</email>\n\n", content_preview));
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// LLM triage response structure.
#[derive(Debug, serde::Deserialize)]
struct TriageResponse {
    label: String,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, serde::Deserialize)]
struct BatchEntry {
    id: String,
    label: String,
    #[serde(default)]
    rationale: String,
}

fn violation(contract: ResponseContract, reason: impl Into<String>) -> LlmError {
    LlmError::ContractViolation {
        contract: contract.label().to_string(),
        reason: reason.into(),
    }
}

/// Parse the LLM triage response into a label and optional rationale.
fn parse_triage_response(raw: &str) -> Result<(TriageLabel, Option<String>), LlmError> {
    let contract = ResponseContract::JsonObject;
    let json_str = extract_json(raw, '{', '}');
    let response: TriageResponse = serde_json::from_str(&json_str)
        .map_err(|e| violation(contract, format!("JSON parse error: {e}")))?;

    let label = TriageLabel::parse(&response.label)
        .ok_or_else(|| violation(contract, format!("unknown triage label: '{}'", response.label)))?;
    let rationale = Some(response.rationale).filter(|r| !r.trim().is_empty());
    Ok((label, rationale))
}

fn parse_batch_response(raw: &str) -> Result<Vec<BatchEntry>, LlmError> {
    let json_str = extract_json(raw, '[', ']');
    let values: Vec<serde_json::Value> = serde_json::from_str(&json_str).map_err(|e| {
        violation(ResponseContract::JsonArray, format!("JSON parse error: {e}"))
    })?;

    // Malformed entries are dropped; their messages fall back individually.
    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{ScriptedLlm, Scripted, message};

    fn classifier(llm: Arc<ScriptedLlm>) -> TriageClassifier {
        TriageClassifier::new(llm, RulesEngine::default_rules(), Duration::from_secs(5))
    }

    // ── Prompt construction tests ───────────────────────────────────

    #[test]
    fn triage_system_prompt_contains_labels() {
        let prompt = build_triage_system_prompt();
        assert!(prompt.contains("needs_reply"));
        assert!(prompt.contains("no_action"));
        assert!(prompt.contains("spam_or_automated"));
    }

    #[test]
    fn triage_user_prompt_includes_metadata() {
        let mut msg = message("m1", "alice@company.com");
        msg.sender_name = Some("Alice".into());
        msg.subject = "Team sync".into();
        msg.body_text = "Can we reschedule the meeting?".into();

        let prompt = build_triage_user_prompt(&msg);
        assert!(prompt.contains("alice@company.com"));
        assert!(prompt.contains("Alice"));
        assert!(prompt.contains("Team sync"));
        assert!(prompt.contains("Can we reschedule"));
    }

    #[test]
    fn triage_user_prompt_truncates_content() {
        let mut msg = message("m1", "bob@company.com");
        msg.body_text = "x".repeat(5000);
        let prompt = build_triage_user_prompt(&msg);
        assert!(prompt.len() < 1400);
    }

    // ── Response parsing tests ──────────────────────────────────────

    #[test]
    fn parse_needs_reply_response() {
        let raw = r#"{"label": "needs_reply", "rationale": "asks to reschedule"}"#;
        let (label, rationale) = parse_triage_response(raw).unwrap();
        assert_eq!(label, TriageLabel::NeedsReply);
        assert_eq!(rationale.as_deref(), Some("asks to reschedule"));
    }

    #[test]
    fn parse_markdown_wrapped_response() {
        let raw = "```json\n{\"label\": \"no_action\"}\n```";
        let (label, rationale) = parse_triage_response(raw).unwrap();
        assert_eq!(label, TriageLabel::NoAction);
        assert!(rationale.is_none());
    }

    #[test]
    fn parse_unknown_label_is_contract_violation() {
        let raw = r#"{"label": "urgent"}"#;
        let err = parse_triage_response(raw).unwrap_err();
        assert!(matches!(err, LlmError::ContractViolation { .. }));
    }

    #[test]
    fn parse_garbage_is_contract_violation() {
        let err = parse_triage_response("I think you should reply.").unwrap_err();
        assert!(matches!(err, LlmError::ContractViolation { .. }));
    }

    #[test]
    fn parse_batch_drops_malformed_entries() {
        let raw = r#"[{"id": "a", "label": "no_action"}, {"label": "needs_reply"}, 7]"#;
        let entries = parse_batch_response(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }

    // ── Classification tests ────────────────────────────────────────

    #[tokio::test]
    async fn rules_short_circuit_the_model() {
        let llm = Arc::new(ScriptedLlm::always(r#"{"label": "needs_reply"}"#));
        let decision = classifier(llm.clone())
            .classify(&message("m1", "noreply@shop.com"))
            .await;
        assert_eq!(decision.label, TriageLabel::SpamOrAutomated);
        assert_eq!(decision.source, DecisionSource::Rules);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn model_decision_uses_json_contract() {
        let llm = Arc::new(ScriptedLlm::always(
            r#"{"label": "needs_reply", "rationale": "direct question"}"#,
        ));
        let decision = classifier(llm.clone())
            .classify(&message("m1", "alice@company.com"))
            .await;
        assert!(decision.needs_reply);
        assert_eq!(decision.source, DecisionSource::Model);

        let request = llm.last_request();
        assert_eq!(request.contract, ResponseContract::JsonObject);
        assert_eq!(request.temperature, Some(TRIAGE_TEMPERATURE));
    }

    #[tokio::test]
    async fn classify_is_idempotent_for_stable_model() {
        let llm = Arc::new(ScriptedLlm::always(
            r#"{"label": "no_action", "rationale": "fyi"}"#,
        ));
        let classifier = classifier(llm);
        let msg = message("m1", "alice@company.com");
        let first = classifier.classify(&msg).await;
        let second = classifier.classify(&msg).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn timeout_degrades_to_no_action() {
        let llm = Arc::new(ScriptedLlm::new(
            vec![Scripted::Hang(Duration::from_secs(5))],
            r#"{"label": "needs_reply"}"#,
        ));
        let classifier =
            TriageClassifier::new(llm, RulesEngine::empty(), Duration::from_millis(20));
        let decision = classifier.classify(&message("m1", "alice@company.com")).await;
        assert_eq!(decision.label, TriageLabel::NoAction);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert_eq!(decision.skip_reason(), "classification timeout");
    }

    #[tokio::test]
    async fn refusal_degrades_to_no_action() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::Refuse], ""));
        let decision = classifier(llm)
            .classify(&message("m1", "alice@company.com"))
            .await;
        assert_eq!(decision.failure.as_deref(), Some("classification refused"));
    }

    #[tokio::test]
    async fn contract_violation_degrades_to_no_action() {
        let llm = Arc::new(ScriptedLlm::always(r#"{"label": "maybe"}"#));
        let decision = classifier(llm)
            .classify(&message("m1", "alice@company.com"))
            .await;
        assert_eq!(decision.label, TriageLabel::NoAction);
        assert_eq!(
            decision.failure.as_deref(),
            Some("classification contract violation")
        );
    }

    #[tokio::test]
    async fn request_failure_is_recorded() {
        let llm = Arc::new(ScriptedLlm::new(vec![Scripted::Fail("boom".into())], ""));
        let decision = classifier(llm)
            .classify(&message("m1", "alice@company.com"))
            .await;
        let failure = decision.failure.unwrap();
        assert!(failure.starts_with("classification failed"));
        assert!(failure.contains("boom"));
    }

    #[tokio::test]
    async fn batch_uses_one_call_when_complete() {
        let llm = Arc::new(ScriptedLlm::always(
            r#"[{"id": "a", "label": "needs_reply", "rationale": "question"},
                {"id": "b", "label": "no_action", "rationale": "fyi"}]"#,
        ));
        let messages = vec![
            message("a", "alice@company.com"),
            message("b", "bob@company.com"),
            message("c", "noreply@shop.com"),
        ];
        let decisions = classifier(llm.clone()).classify_batch(&messages).await;

        assert_eq!(llm.call_count(), 1);
        assert_eq!(llm.last_request().contract, ResponseContract::JsonArray);
        let labels: Vec<_> = decisions.iter().map(|d| d.label).collect();
        assert_eq!(
            labels,
            vec![
                TriageLabel::NeedsReply,
                TriageLabel::NoAction,
                TriageLabel::SpamOrAutomated
            ]
        );
        assert_eq!(decisions[2].source, DecisionSource::Rules);
    }

    #[tokio::test]
    async fn batch_falls_back_for_missing_entries() {
        let llm = Arc::new(ScriptedLlm::new(
            vec![Scripted::Reply(
                r#"[{"id": "a", "label": "no_action"}, {"id": "b", "label": "bogus"}]"#.into(),
            )],
            r#"{"label": "needs_reply", "rationale": "asked directly"}"#,
        ));
        let messages = vec![
            message("a", "alice@company.com"),
            message("b", "bob@company.com"),
        ];
        let decisions = classifier(llm.clone()).classify_batch(&messages).await;

        assert_eq!(llm.call_count(), 2);
        assert_eq!(decisions[0].message_id, "a");
        assert_eq!(decisions[0].label, TriageLabel::NoAction);
        assert_eq!(decisions[1].message_id, "b");
        assert_eq!(decisions[1].label, TriageLabel::NeedsReply);
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_single_calls() {
        let llm = Arc::new(ScriptedLlm::new(
            vec![Scripted::Reply("not json".into())],
            r#"{"label": "no_action"}"#,
        ));
        let messages = vec![
            message("a", "alice@company.com"),
            message("b", "bob@company.com"),
        ];
        let decisions = classifier(llm.clone()).classify_batch(&messages).await;
        assert_eq!(llm.call_count(), 3);
        assert!(decisions.iter().all(|d| d.source == DecisionSource::Model));
    }
}
