//! Mail provider adapters: pure I/O, no triage logic.
//!
//! An adapter lists unread messages as raw RFC 822 payloads and persists
//! drafts. Parsing, triage and composition live in `pipeline`.

pub mod gmail;
pub mod local;

pub use gmail::GmailProvider;
pub use local::LocalMailbox;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;

use crate::error::ProviderError;
use crate::pipeline::types::DraftContent;

/// An unread message as the provider returned it.
#[derive(Debug, Clone)]
pub struct RawPayload {
    /// Provider message ID.
    pub provider_id: String,
    /// Provider thread ID, when the provider has one.
    pub thread_id: Option<String>,
    /// The full RFC 822 message.
    pub raw: Vec<u8>,
    /// Set when the provider listed the message but could not return it.
    pub fetch_error: Option<String>,
}

impl RawPayload {
    /// A listed message whose content could not be retrieved.
    pub fn unreadable(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            thread_id: None,
            raw: Vec::new(),
            fetch_error: Some(reason.into()),
        }
    }
}

/// Everything a provider needs to store a reply draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRequest {
    pub thread_id: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Message-ID being answered, without angle brackets.
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl From<&DraftContent> for DraftRequest {
    fn from(draft: &DraftContent) -> Self {
        Self {
            thread_id: draft.thread_id.clone(),
            to: draft.to.clone(),
            cc: draft.cc.clone(),
            subject: draft.subject.clone(),
            body: draft.body.clone(),
            in_reply_to: (!draft.in_reply_to.is_empty()).then(|| draft.in_reply_to.clone()),
            references: draft.references.clone(),
        }
    }
}

/// Mail provider adapter.
///
/// De-duplication of drafts across runs is not guaranteed by this trait;
/// the orchestrator keeps its own ledger of drafted message IDs.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider name (e.g. "gmail", "local").
    fn name(&self) -> &str;

    /// Fetch up to `max` unread messages without marking them read.
    async fn list_unread(&self, max: usize) -> Result<Vec<RawPayload>, ProviderError>;

    /// Store a reply draft and return the provider's draft ID.
    async fn create_draft(&self, draft: &DraftRequest) -> Result<String, ProviderError>;
}

/// Render a draft as an RFC 822 message with threading headers.
pub fn render_rfc822(from: &str, draft: &DraftRequest) -> Result<Vec<u8>, ProviderError> {
    let invalid = |what: &str, e: &dyn std::fmt::Display| {
        ProviderError::InvalidDraft(format!("invalid {what} address: {e}"))
    };

    let from: Mailbox = from.parse().map_err(|e| invalid("from", &e))?;
    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(draft.subject.clone());

    for to in &draft.to {
        let mailbox: Mailbox = to.parse().map_err(|e| invalid("to", &e))?;
        builder = builder.to(mailbox);
    }
    for cc in &draft.cc {
        let mailbox: Mailbox = cc.parse().map_err(|e| invalid("cc", &e))?;
        builder = builder.cc(mailbox);
    }

    if let Some(ref id) = draft.in_reply_to {
        builder = builder.in_reply_to(format!("<{id}>"));
    }
    if !draft.references.is_empty() {
        let refs = draft
            .references
            .iter()
            .map(|r| format!("<{r}>"))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.references(refs);
    }

    let message = builder
        .header(ContentType::TEXT_PLAIN)
        .body(draft.body.clone())
        .map_err(|e| ProviderError::InvalidDraft(format!("failed to build draft: {e}")))?;

    Ok(message.formatted())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DraftRequest {
        DraftRequest {
            thread_id: "t-1".into(),
            to: vec!["alice@example.com".into()],
            cc: vec!["carol@example.com".into()],
            subject: "Re: Lunch".into(),
            body: "Hi Alice,\n\nTuesday works.\n".into(),
            in_reply_to: Some("abc123@example.com".into()),
            references: vec!["root@example.com".into(), "abc123@example.com".into()],
        }
    }

    #[test]
    fn render_includes_threading_headers() {
        let raw = render_rfc822("me@example.com", &request()).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("In-Reply-To: <abc123@example.com>"));
        assert!(text.contains("References: <root@example.com> <abc123@example.com>"));
        assert!(text.contains("Subject: Re: Lunch"));
        assert!(text.contains("alice@example.com"));
        assert!(text.contains("carol@example.com"));
    }

    #[test]
    fn render_rejects_bad_recipient() {
        let mut req = request();
        req.to = vec!["not an address".into()];
        let err = render_rfc822("me@example.com", &req).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidDraft(_)));
    }

    #[test]
    fn render_round_trips_through_mail_parser() {
        let raw = render_rfc822("me@example.com", &request()).unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&raw).unwrap();
        assert_eq!(parsed.subject(), Some("Re: Lunch"));
        assert!(parsed.body_text(0).unwrap().contains("Tuesday works."));
    }
}
