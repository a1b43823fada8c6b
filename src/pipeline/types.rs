//! Shared types for the triage pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Message ─────────────────────────────────────────────────────────

/// How the body arrived on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    /// Single-part text/plain.
    PlainText,
    /// Single-part text/html; `body_text` is a tag-stripped rendition.
    HtmlOnly,
    /// multipart/* with at least one readable part.
    Multipart,
    /// No readable body.
    Empty,
}

/// A parsed email. Immutable once built by the parser; later stages derive
/// new values instead of annotating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Provider message ID (unique within the mailbox).
    pub id: String,
    /// Provider thread ID, or one derived from the threading headers.
    pub thread_id: String,
    /// RFC 5322 Message-ID, without angle brackets.
    pub message_id: String,
    /// Sender address.
    pub sender: String,
    /// Sender display name, if any.
    pub sender_name: Option<String>,
    /// To recipients.
    pub to: Vec<String>,
    /// CC recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Subject line (may be empty).
    pub subject: String,
    /// Date header.
    pub timestamp: DateTime<Utc>,
    /// Preferred plain-text body.
    pub body_text: String,
    /// Rich-text body, when one was sent.
    pub body_html: Option<String>,
    pub body_format: BodyFormat,
    /// Message-IDs this message references, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Raw header name/value pairs in wire order (unfolded).
    pub headers: Vec<(String, String)>,
    /// A header used an encoding we could not decode; values may be raw.
    pub decoding_degraded: bool,
}

// ── Triage ──────────────────────────────────────────────────────────

/// The fixed label set of the triage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageLabel {
    NeedsReply,
    NoAction,
    SpamOrAutomated,
}

impl TriageLabel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NeedsReply => "needs_reply",
            Self::NoAction => "no_action",
            Self::SpamOrAutomated => "spam_or_automated",
        }
    }

    /// Parse a contract label. Anything outside the fixed set is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "needs_reply" => Some(Self::NeedsReply),
            "no_action" => Some(Self::NoAction),
            "spam_or_automated" => Some(Self::SpamOrAutomated),
            _ => None,
        }
    }
}

/// Where a triage decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Deterministic rule pre-filter; no model call was made.
    Rules,
    /// The model answered within the contract.
    Model,
    /// The model call failed and the decision degraded to `no_action`.
    Fallback,
}

/// Triage verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageDecision {
    pub message_id: String,
    pub label: TriageLabel,
    pub needs_reply: bool,
    pub rationale: Option<String>,
    pub source: DecisionSource,
    /// Human-readable failure when `source` is `Fallback`.
    pub failure: Option<String>,
}

impl TriageDecision {
    pub fn new(
        message_id: impl Into<String>,
        label: TriageLabel,
        rationale: Option<String>,
        source: DecisionSource,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            label,
            needs_reply: label == TriageLabel::NeedsReply,
            rationale,
            source,
            failure: None,
        }
    }

    /// A degraded `no_action` decision recording why the model call failed.
    pub fn degraded(message_id: impl Into<String>, failure: impl Into<String>) -> Self {
        Self {
            failure: Some(failure.into()),
            ..Self::new(message_id, TriageLabel::NoAction, None, DecisionSource::Fallback)
        }
    }

    /// Reason reported when the message is skipped.
    pub fn skip_reason(&self) -> String {
        if let Some(ref failure) = self.failure {
            return failure.clone();
        }
        match (self.label, self.rationale.as_deref()) {
            (label, Some(r)) if !r.is_empty() => format!("{}: {}", label.label(), r),
            (label, _) => label.label().to_string(),
        }
    }
}

// ── Drafts ──────────────────────────────────────────────────────────

/// Lifecycle of a composed draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DraftState {
    /// Generated, not yet persisted.
    Composed,
    /// Persisted by the mail provider.
    Submitted { draft_id: String },
    /// Not persisted: the composer declined or generation failed.
    Discarded { reason: String },
}

/// A generated reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftContent {
    pub id: Uuid,
    pub thread_id: String,
    /// Provider ID of the message being answered.
    pub reply_to_message: String,
    /// RFC Message-ID for `In-Reply-To`.
    pub in_reply_to: String,
    /// Full `References` chain, oldest first.
    pub references: Vec<String>,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: DraftState,
}

impl DraftContent {
    pub fn is_discarded(&self) -> bool {
        matches!(self.state, DraftState::Discarded { .. })
    }

    pub fn discard(mut self, reason: impl Into<String>) -> Self {
        self.state = DraftState::Discarded {
            reason: reason.into(),
        };
        self
    }

    pub fn submit(mut self, draft_id: impl Into<String>) -> Self {
        self.state = DraftState::Submitted {
            draft_id: draft_id.into(),
        };
        self
    }
}
