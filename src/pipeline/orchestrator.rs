//! Batch orchestrator: one run over the unread mailbox.
//!
//! Stages: fetch → parse → classify → compose → persist. Each message is
//! isolated: a parse failure, a model timeout or a discarded draft only
//! affects that message. Only an authentication failure at the mail
//! provider stops the batch, and even then the partial report survives.
//!
//! Invariant: every fetched message ends the run as `skipped`, `drafted`
//! or `failed`, so the three counts always add up to the batch size.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AssistConfig, PipelineConfig};
use crate::error::{ConfigError, PipelineError, ProviderError};
use crate::llm::{CompletionService, Role};
use crate::mail::{DraftRequest, MailProvider, RawPayload};
use crate::memory::ConversationStore;
use crate::pipeline::composer::{DraftComposer, user_turn_for};
use crate::pipeline::ledger::DraftLedger;
use crate::pipeline::parser;
use crate::pipeline::retry::{RetryPolicy, with_backoff};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::triage::TriageClassifier;
use crate::pipeline::types::{DraftContent, DraftState, Message, TriageDecision, TriageLabel};

/// Reason reported for messages left unprocessed by cancellation.
pub const CANCELLED_REASON: &str = "batch cancelled";

/// Reason reported for messages drafted in an earlier run.
pub const ALREADY_DRAFTED_REASON: &str = "already drafted";

// ── Report ──────────────────────────────────────────────────────────

/// Last stage a batch reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    Fetching,
    Parsing,
    Classifying,
    Composing,
    Persisting,
    Done,
}

/// Per-message status within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Skipped,
    Drafted,
    Failed,
}

/// Final outcome for one fetched message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageOutcome {
    pub provider_id: String,
    pub status: MessageStatus,
    /// Human-readable reason for `skipped` and `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<TriageLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
}

/// Terminal report for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub stage: BatchStage,
    /// One entry per fetched message, in fetch order.
    pub outcomes: Vec<MessageOutcome>,
    /// Provider draft IDs created by this run, in persistence order.
    pub draft_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    fn new(provider_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            stage: BatchStage::Fetching,
            outcomes: provider_ids
                .into_iter()
                .map(|provider_id| MessageOutcome {
                    provider_id,
                    status: MessageStatus::Pending,
                    reason: None,
                    label: None,
                    draft_id: None,
                })
                .collect(),
            draft_ids: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn count(&self, status: MessageStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn drafted(&self) -> usize {
        self.count(MessageStatus::Drafted)
    }

    pub fn skipped(&self) -> usize {
        self.count(MessageStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(MessageStatus::Failed)
    }

    pub fn outcome(&self, provider_id: &str) -> Option<&MessageOutcome> {
        self.outcomes.iter().find(|o| o.provider_id == provider_id)
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} messages: {} drafted, {} skipped, {} failed (stage: {:?})",
            self.total(),
            self.drafted(),
            self.skipped(),
            self.failed(),
            self.stage
        )
    }

    fn is_pending(&self, idx: usize) -> bool {
        self.outcomes[idx].status == MessageStatus::Pending
    }

    fn skip(&mut self, idx: usize, reason: impl Into<String>) {
        let outcome = &mut self.outcomes[idx];
        outcome.status = MessageStatus::Skipped;
        outcome.reason = Some(reason.into());
    }

    fn fail(&mut self, idx: usize, reason: impl Into<String>) {
        let outcome = &mut self.outcomes[idx];
        outcome.status = MessageStatus::Failed;
        outcome.reason = Some(reason.into());
    }

    fn drafted_as(&mut self, idx: usize, draft_id: String) {
        let outcome = &mut self.outcomes[idx];
        outcome.status = MessageStatus::Drafted;
        outcome.reason = None;
        outcome.draft_id = Some(draft_id.clone());
        self.draft_ids.push(draft_id);
    }

    fn skip_pending(&mut self, reason: &str) {
        for idx in 0..self.outcomes.len() {
            if self.is_pending(idx) {
                self.skip(idx, reason);
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for idx in 0..self.outcomes.len() {
            if self.is_pending(idx) {
                self.fail(idx, reason);
            }
        }
    }

    fn finish(mut self, stage: BatchStage) -> Self {
        self.stage = stage;
        self.finished_at = Some(Utc::now());
        self
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

/// Runs the triage → draft pipeline over one batch of unread mail.
pub struct Orchestrator {
    provider: Arc<dyn MailProvider>,
    classifier: TriageClassifier,
    composer: DraftComposer,
    memory: Arc<ConversationStore>,
    ledger: Arc<DraftLedger>,
    retry: RetryPolicy,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        classifier: TriageClassifier,
        composer: DraftComposer,
        memory: Arc<ConversationStore>,
        ledger: Arc<DraftLedger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            provider,
            classifier,
            composer,
            memory,
            ledger,
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    /// Wire the classifier and composer from the full configuration.
    pub fn from_config(
        provider: Arc<dyn MailProvider>,
        llm: Arc<dyn CompletionService>,
        memory: Arc<ConversationStore>,
        ledger: Arc<DraftLedger>,
        config: &AssistConfig,
    ) -> Result<Self, ConfigError> {
        let rules = RulesEngine::from_config(&config.triage).map_err(|e| {
            ConfigError::InvalidValue {
                key: "ASSIST_IGNORE_SENDERS / ASSIST_ALWAYS_CLASSIFY_SENDERS".into(),
                message: e.to_string(),
            }
        })?;
        let timeout = config.pipeline.llm_timeout;
        let classifier = TriageClassifier::new(Arc::clone(&llm), rules, timeout);
        let composer = DraftComposer::new(llm, config.compose.clone(), timeout);
        Ok(Self::new(
            provider,
            classifier,
            composer,
            memory,
            ledger,
            config.pipeline.clone(),
        ))
    }

    /// Process one batch of unread messages.
    ///
    /// Returns the terminal report. `PipelineError::Fetch` means nothing was
    /// processed; `PipelineError::Aborted` carries the partial report of a
    /// batch stopped by an authentication failure.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BatchReport, PipelineError> {
        let pruned = self.memory.prune_idle().await;
        if pruned > 0 {
            debug!(pruned, "Pruned idle conversation threads before batch");
        }

        // ── Fetching ──
        if cancel.is_cancelled() {
            info!("Batch cancelled before fetching");
            return Ok(BatchReport::empty().finish(BatchStage::Fetching));
        }
        let payloads = match self.fetch(&cancel).await {
            Ok(payloads) => payloads,
            Err(e) if e.is_batch_fatal() => {
                error!(error = %e, "Mail provider rejected credentials, aborting batch");
                return Err(PipelineError::Aborted {
                    report: Box::new(BatchReport::empty().finish(BatchStage::Fetching)),
                    source: e,
                });
            }
            Err(e) => return Err(PipelineError::Fetch(e)),
        };

        let mut report = BatchReport::new(payloads.iter().map(|p| p.provider_id.clone()));
        info!(
            count = payloads.len(),
            provider = self.provider.name(),
            "Fetched unread batch"
        );

        // ── Parsing ──
        report.stage = BatchStage::Parsing;
        let mut messages: Vec<(usize, Message)> = Vec::with_capacity(payloads.len());
        for (idx, payload) in payloads.iter().enumerate() {
            if self.ledger.contains(&payload.provider_id).await {
                debug!(id = %payload.provider_id, "Message already drafted, skipping");
                report.skip(idx, ALREADY_DRAFTED_REASON);
                continue;
            }
            match parser::parse(payload) {
                Ok(message) => messages.push((idx, message)),
                Err(e) => {
                    warn!(id = %payload.provider_id, error = %e, "Failed to parse message");
                    report.fail(idx, e.to_string());
                }
            }
        }

        // ── Classifying ──
        report.stage = BatchStage::Classifying;
        if cancel.is_cancelled() {
            return Ok(self.cancelled(report));
        }
        let decisions = self.classify_all(&messages, &cancel).await;

        let mut to_compose: Vec<(usize, &Message)> = Vec::new();
        for (idx, message) in &messages {
            match decisions.get(idx) {
                Some(decision) => {
                    report.outcomes[*idx].label = Some(decision.label);
                    if decision.needs_reply {
                        to_compose.push((*idx, message));
                    } else {
                        report.skip(*idx, decision.skip_reason());
                    }
                }
                None => report.skip(*idx, CANCELLED_REASON),
            }
        }

        // ── Composing ──
        report.stage = BatchStage::Composing;
        if cancel.is_cancelled() {
            return Ok(self.cancelled(report));
        }
        let mut drafts = self.compose_all(&to_compose, &cancel).await;
        drafts.sort_by_key(|(idx, _)| *idx);

        // ── Persisting ──
        report.stage = BatchStage::Persisting;
        let by_index: HashMap<usize, &Message> = to_compose.iter().copied().collect();

        // Settle cancelled and discarded drafts first so a provider failure
        // below only touches drafts that were really headed for the mailbox.
        let mut ready: Vec<(usize, &Message, DraftContent)> = Vec::with_capacity(drafts.len());
        for (idx, draft) in drafts {
            let Some(message) = by_index.get(&idx).copied() else {
                continue;
            };
            match draft {
                None => report.skip(idx, CANCELLED_REASON),
                Some(draft) => match draft.state {
                    DraftState::Discarded { ref reason } => {
                        info!(id = %message.id, reason = %reason, "Draft discarded");
                        report.skip(idx, reason.clone());
                        self.remember(message, None).await;
                    }
                    _ => ready.push((idx, message, draft)),
                },
            }
        }

        for (idx, message, draft) in ready {
            if cancel.is_cancelled() {
                report.skip(idx, CANCELLED_REASON);
                continue;
            }

            match self.persist(&draft, &cancel).await {
                Ok(draft_id) => {
                    info!(id = %message.id, draft_id = %draft_id, "Draft persisted");
                    self.ledger.record(&message.id).await;
                    report.drafted_as(idx, draft_id.clone());
                    let draft = draft.submit(draft_id);
                    self.remember(message, Some(&draft)).await;
                }
                Err(_) if cancel.is_cancelled() => {
                    report.skip(idx, CANCELLED_REASON);
                }
                Err(e) if e.is_batch_fatal() => {
                    error!(id = %message.id, error = %e, "Mail provider rejected credentials, aborting batch");
                    report.fail(idx, e.to_string());
                    report.fail_pending(&format!("batch aborted: {e}"));
                    return Err(PipelineError::Aborted {
                        report: Box::new(report.finish(BatchStage::Persisting)),
                        source: e,
                    });
                }
                Err(e @ ProviderError::RateLimited { .. }) => {
                    warn!(id = %message.id, error = %e, "Rate limit persisted after retries, failing remaining drafts");
                    report.fail(idx, e.to_string());
                    report.fail_pending("not persisted: mail provider rate limit");
                    break;
                }
                Err(e) => {
                    warn!(id = %message.id, error = %e, "Failed to persist draft");
                    report.fail(idx, e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled(report));
        }
        // Nothing should remain pending here; keep the count invariant regardless.
        report.fail_pending("not processed");
        let report = report.finish(BatchStage::Done);
        let drafted_total = self.ledger.len().await;
        info!(
            summary = %report.summary(),
            drafted_total = drafted_total,
            "Batch complete"
        );
        Ok(report)
    }

    fn cancelled(&self, mut report: BatchReport) -> BatchReport {
        report.skip_pending(CANCELLED_REASON);
        let stage = report.stage;
        let report = report.finish(stage);
        info!(summary = %report.summary(), "Batch cancelled");
        report
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<RawPayload>, ProviderError> {
        let max = self.config.max_batch_size;
        let after = self.config.provider_timeout;
        with_backoff(&self.retry, cancel, || {
            let provider = Arc::clone(&self.provider);
            async move {
                match tokio::time::timeout(after, provider.list_unread(max)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: provider.name().to_string(),
                        after,
                    }),
                }
            }
        })
        .await
    }

    async fn persist(
        &self,
        draft: &DraftContent,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = Arc::new(DraftRequest::from(draft));
        let after = self.config.provider_timeout;
        with_backoff(&self.retry, cancel, || {
            let provider = Arc::clone(&self.provider);
            let request = Arc::clone(&request);
            async move {
                match tokio::time::timeout(after, provider.create_draft(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: provider.name().to_string(),
                        after,
                    }),
                }
            }
        })
        .await
    }

    /// Triage decisions by batch index. Messages cut off by cancellation
    /// have no entry.
    async fn classify_all(
        &self,
        messages: &[(usize, Message)],
        cancel: &CancellationToken,
    ) -> HashMap<usize, TriageDecision> {
        if messages.is_empty() {
            return HashMap::new();
        }

        if self.config.batch_classify {
            let batch: Vec<Message> = messages.iter().map(|(_, m)| m.clone()).collect();
            return tokio::select! {
                _ = cancel.cancelled() => HashMap::new(),
                decisions = self.classifier.classify_batch(&batch) => messages
                    .iter()
                    .map(|(idx, _)| *idx)
                    .zip(decisions)
                    .collect(),
            };
        }

        // Futures are built eagerly so the stream holds no borrowing closure.
        let calls: Vec<_> = messages
            .iter()
            .map(|(idx, message)| self.classify_one(*idx, message, cancel))
            .collect();
        let results: Vec<(usize, Option<TriageDecision>)> = stream::iter(calls)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        results
            .into_iter()
            .filter_map(|(idx, decision)| decision.map(|d| (idx, d)))
            .collect()
    }

    async fn classify_one(
        &self,
        idx: usize,
        message: &Message,
        cancel: &CancellationToken,
    ) -> (usize, Option<TriageDecision>) {
        if cancel.is_cancelled() {
            return (idx, None);
        }
        tokio::select! {
            _ = cancel.cancelled() => (idx, None),
            decision = self.classifier.classify(message) => (idx, Some(decision)),
        }
    }

    /// Drafts by batch index; `None` when cancellation cut the call off.
    async fn compose_all(
        &self,
        targets: &[(usize, &Message)],
        cancel: &CancellationToken,
    ) -> Vec<(usize, Option<DraftContent>)> {
        let calls: Vec<_> = targets
            .iter()
            .map(|&(idx, message)| self.compose_one(idx, message, cancel))
            .collect();
        stream::iter(calls)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }

    async fn compose_one(
        &self,
        idx: usize,
        message: &Message,
        cancel: &CancellationToken,
    ) -> (usize, Option<DraftContent>) {
        if cancel.is_cancelled() {
            return (idx, None);
        }
        let thread = self.memory.get_or_create(&message.thread_id).await;
        tokio::select! {
            _ = cancel.cancelled() => (idx, None),
            draft = self.composer.compose(message, &thread) => (idx, Some(draft)),
        }
    }

    /// Record the answered message, and the reply when one was persisted.
    async fn remember(&self, message: &Message, draft: Option<&DraftContent>) {
        let mut turns = vec![user_turn_for(message)];
        if let Some(draft) = draft {
            turns.push((Role::Assistant, draft.body.clone()));
        }
        self.memory.append_all(&message.thread_id, turns).await;
    }
}
