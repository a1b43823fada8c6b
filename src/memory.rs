//! Conversation memory: per-thread ordered turns shared across batch runs.
//!
//! The store is an explicit object handed around by `Arc`. Appends to one
//! thread are serialized by that thread's async mutex, so concurrent
//! writers never lose or duplicate turns; different threads never contend
//! beyond the short map lookup.
//!
//! Retention:
//! - at most `max_turns_per_thread` turns per thread, oldest dropped first
//!   (a leading system turn is kept)
//! - at most `max_threads` threads, least recently active evicted first
//! - threads idle longer than `idle_ttl` are dropped by [`ConversationStore::prune_idle`]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::llm::{ChatMessage, Role};

/// One turn of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Never earlier than the previous turn's timestamp.
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing within a thread, never reused after trimming.
    pub sequence: u64,
}

impl ConversationTurn {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Ordered turns for one mail thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub thread_id: String,
    turns: Vec<ConversationTurn>,
    next_sequence: u64,
}

impl ConversationThread {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            turns: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Get all turns, oldest first.
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Get the last N turns.
    pub fn last_n(&self, n: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub(crate) fn push(
        &mut self,
        role: Role,
        content: String,
        now: DateTime<Utc>,
        max_turns: usize,
    ) -> ConversationTurn {
        let timestamp = match self.turns.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let turn = ConversationTurn {
            role,
            content,
            timestamp,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.turns.push(turn.clone());

        // Trim old turns if needed (keeping system turn if present)
        while self.turns.len() > max_turns.max(1) {
            if self.turns.first().map(|t| t.role) == Some(Role::System) {
                if self.turns.len() > 1 {
                    self.turns.remove(1);
                } else {
                    break;
                }
            } else {
                self.turns.remove(0);
            }
        }
        turn
    }
}

struct ThreadSlot {
    thread: Mutex<ConversationThread>,
    /// Unix millis of the last append or creation.
    last_active: AtomicI64,
}

impl ThreadSlot {
    fn new(thread_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            thread: Mutex::new(ConversationThread::new(thread_id)),
            last_active: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_active
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }
}

/// Process-wide store of conversation threads keyed by thread id.
pub struct ConversationStore {
    threads: RwLock<HashMap<String, Arc<ThreadSlot>>>,
    config: MemoryConfig,
}

impl ConversationStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Snapshot of a thread, creating it empty on first reference.
    pub async fn get_or_create(&self, thread_id: &str) -> ConversationThread {
        let slot = self.slot(thread_id).await;
        let thread = slot.thread.lock().await;
        thread.clone()
    }

    /// Append one turn and return it with its assigned sequence number.
    pub async fn append(
        &self,
        thread_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> ConversationTurn {
        let content = content.into();
        let slot = self.slot(thread_id).await;
        let mut thread = slot.thread.lock().await;
        let now = Utc::now();
        let turn = thread.push(role, content, now, self.config.max_turns_per_thread);
        slot.touch(now);
        turn
    }

    /// Append several turns back to back, with no other writer in between.
    pub async fn append_all(
        &self,
        thread_id: &str,
        turns: Vec<(Role, String)>,
    ) -> Vec<ConversationTurn> {
        let slot = self.slot(thread_id).await;
        let mut thread = slot.thread.lock().await;
        let now = Utc::now();
        let appended = turns
            .into_iter()
            .map(|(role, content)| {
                thread.push(role, content, now, self.config.max_turns_per_thread)
            })
            .collect();
        slot.touch(now);
        appended
    }

    /// Number of threads currently held.
    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }

    /// Drop threads idle for longer than the configured TTL.
    ///
    /// Returns the number of threads removed. A store without a TTL keeps
    /// every thread.
    pub async fn prune_idle(&self) -> usize {
        let Some(ttl) = self.config.idle_ttl else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        self.prune_inactive_since(Utc::now() - ttl).await
    }

    async fn prune_inactive_since(&self, cutoff: DateTime<Utc>) -> usize {
        let cutoff = cutoff.timestamp_millis();
        let mut threads = self.threads.write().await;
        let before = threads.len();
        threads.retain(|_, slot| slot.last_active() >= cutoff);
        let removed = before - threads.len();
        if removed > 0 {
            debug!(removed, remaining = threads.len(), "Pruned idle conversation threads");
        }
        removed
    }

    async fn slot(&self, thread_id: &str) -> Arc<ThreadSlot> {
        if let Some(slot) = self.threads.read().await.get(thread_id) {
            return Arc::clone(slot);
        }

        let mut threads = self.threads.write().await;
        if let Some(slot) = threads.get(thread_id) {
            return Arc::clone(slot);
        }

        while threads.len() >= self.config.max_threads.max(1) {
            let Some(oldest) = threads
                .iter()
                .min_by_key(|(_, slot)| slot.last_active())
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!(thread_id = %oldest, "Evicting least recently active conversation thread");
            threads.remove(&oldest);
        }

        let slot = Arc::new(ThreadSlot::new(thread_id, Utc::now()));
        threads.insert(thread_id.to_string(), Arc::clone(&slot));
        slot
    }
}
