//! Gmail REST adapter.
//!
//! Unread messages come from `messages.list` (`q=is:unread`) followed by
//! `messages.get?format=raw`; drafts are created with `drafts.create` on the
//! original thread. The OAuth access token is supplied by the caller;
//! acquiring and refreshing it is out of scope, so a 401/403 surfaces as
//! `ProviderError::AuthFailed`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::mail::{DraftRequest, MailProvider, RawPayload, render_rfc822};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com";
const PROVIDER: &str = "gmail";

/// Gmail emits base64url with or without padding.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Gmail API mail provider.
pub struct GmailProvider {
    client: reqwest::Client,
    base_url: String,
    access_token: SecretString,
    user_address: String,
}

impl GmailProvider {
    pub fn new(access_token: SecretString, user_address: impl Into<String>) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, access_token, user_address)
    }

    /// Point the adapter at a different API host (used by tests).
    pub fn with_base_url(
        base_url: impl Into<String>,
        access_token: SecretString,
        user_address: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
            user_address: user_address.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/gmail/v1/users/me/{}", self.base_url, path)
    }

    async fn fetch_raw(&self, id: &str) -> Result<RawPayload, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("messages/{id}")))
            .query(&[("format", "raw")])
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(request_failed)?;
        let message: RawMessage = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_failed)?;

        let raw = URL_SAFE_LENIENT
            .decode(message.raw.as_bytes())
            .map_err(|e| ProviderError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("message {id} has invalid base64 payload: {e}"),
            })?;

        Ok(RawPayload {
            provider_id: message.id,
            thread_id: message.thread_id,
            raw,
            fetch_error: None,
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    thread_id: Option<String>,
    raw: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DraftMessage {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateDraftBody {
    message: DraftMessage,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    id: String,
}

// ── Provider trait ──────────────────────────────────────────────────

#[async_trait]
impl MailProvider for GmailProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_unread(&self, max: usize) -> Result<Vec<RawPayload>, ProviderError> {
        let response = self
            .client
            .get(self.url("messages"))
            .query(&[("q", "is:unread".to_string()), ("maxResults", max.to_string())])
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(request_failed)?;
        let list: ListResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_failed)?;

        debug!(count = list.messages.len(), "Gmail listed unread message ids");

        let mut payloads = Vec::with_capacity(list.messages.len());
        for message in list.messages.into_iter().take(max) {
            match self.fetch_raw(&message.id).await {
                Ok(payload) => payloads.push(payload),
                Err(e @ (ProviderError::AuthFailed { .. } | ProviderError::RateLimited { .. })) => {
                    return Err(e);
                }
                Err(e) => {
                    // Kept in the batch so the report accounts for it.
                    warn!(id = %message.id, error = %e, "Gmail message could not be fetched");
                    payloads.push(RawPayload::unreadable(message.id, e.to_string()));
                }
            }
        }

        info!(count = payloads.len(), "Fetched unread Gmail messages");
        Ok(payloads)
    }

    async fn create_draft(&self, draft: &DraftRequest) -> Result<String, ProviderError> {
        let rendered = render_rfc822(&self.user_address, draft)?;
        let body = CreateDraftBody {
            message: DraftMessage {
                raw: URL_SAFE.encode(rendered),
                thread_id: (!draft.thread_id.is_empty()).then(|| draft.thread_id.clone()),
            },
        };

        let response = self
            .client
            .post(self.url("drafts"))
            .bearer_auth(self.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(request_failed)?;
        let created: DraftResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(request_failed)?;

        info!(draft_id = %created.id, thread_id = %draft.thread_id, "Created Gmail draft");
        Ok(created.id)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn request_failed(e: reqwest::Error) -> ProviderError {
    ProviderError::RequestFailed {
        provider: PROVIDER.into(),
        reason: e.to_string(),
    }
}

/// Map HTTP status codes onto the provider error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::AuthFailed {
            provider: PROVIDER.into(),
            reason: format!("HTTP {status}"),
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(ProviderError::RateLimited {
                provider: PROVIDER.into(),
                retry_after,
            })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            Err(ProviderError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("HTTP {status}: {preview}"),
            })
        }
    }
}
