//! Local directory mailbox: `inbox/*.eml` in, `drafts/*.eml` out.
//!
//! Lets the pipeline run offline against exported messages.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::mail::{DraftRequest, MailProvider, RawPayload, render_rfc822};

/// Directory-backed mailbox.
pub struct LocalMailbox {
    root: PathBuf,
    user_address: String,
}

impl LocalMailbox {
    pub fn new(root: impl Into<PathBuf>, user_address: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            user_address: user_address.into(),
        }
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }

    pub fn drafts_dir(&self) -> PathBuf {
        self.root.join("drafts")
    }
}

fn is_eml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("eml"))
}

#[async_trait]
impl MailProvider for LocalMailbox {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_unread(&self, max: usize) -> Result<Vec<RawPayload>, ProviderError> {
        let inbox = self.inbox_dir();
        let mut entries = tokio::fs::read_dir(&inbox).await?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_eml(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        paths.truncate(max);

        let mut payloads = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = tokio::fs::read(&path).await?;
            let provider_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            debug!(id = %provider_id, bytes = raw.len(), "Read local message");
            payloads.push(RawPayload {
                provider_id,
                thread_id: None,
                raw,
                fetch_error: None,
            });
        }

        info!(count = payloads.len(), inbox = %inbox.display(), "Listed local unread messages");
        Ok(payloads)
    }

    async fn create_draft(&self, draft: &DraftRequest) -> Result<String, ProviderError> {
        let rendered = render_rfc822(&self.user_address, draft)?;

        let drafts = self.drafts_dir();
        tokio::fs::create_dir_all(&drafts).await?;

        let draft_id = Uuid::new_v4().to_string();
        let path = drafts.join(format!("{draft_id}.eml"));
        tokio::fs::write(&path, rendered).await?;

        info!(draft_id = %draft_id, thread_id = %draft.thread_id, "Saved local draft");
        Ok(draft_id)
    }
}
