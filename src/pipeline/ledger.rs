//! Record of messages that already have a persisted draft.
//!
//! Shared across batch runs so a message still unread on the next poll is
//! not drafted twice.

use std::collections::HashSet;

use tokio::sync::RwLock;

/// Provider message IDs with a submitted draft.
#[derive(Debug, Default)]
pub struct DraftLedger {
    drafted: RwLock<HashSet<String>>,
}

impl DraftLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, provider_id: &str) -> bool {
        self.drafted.read().await.contains(provider_id)
    }

    /// Returns `false` when the message was already recorded.
    pub async fn record(&self, provider_id: &str) -> bool {
        self.drafted.write().await.insert(provider_id.to_string())
    }

    pub async fn len(&self) -> usize {
        self.drafted.read().await.len()
    }
}
