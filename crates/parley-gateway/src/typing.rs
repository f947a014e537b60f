use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use parley_types::models::ConversationId;

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(300);

/// Expiring "is composing" flags keyed by (conversation, user).
///
/// There is no stop message: a flag reads as expired once `expires_at`
/// passes, so a client that vanishes mid-burst clears itself.
pub struct TypingIndicators {
    ttl: Duration,
    debounce: Duration,
    entries: Mutex<HashMap<(ConversationId, Uuid), TypingEntry>>,
}

struct TypingEntry {
    published_at: Instant,
    expires_at: Instant,
}

impl TypingIndicators {
    pub fn new(ttl: Duration, debounce: Duration) -> Self {
        Self {
            ttl,
            debounce,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a keystroke burst. Returns the wall-clock expiry to push to the
    /// partner, or `None` when a push already went out inside the debounce
    /// window (the server-side expiry is still extended).
    pub fn start(&self, conversation_id: ConversationId, user_id: Uuid) -> Option<DateTime<Utc>> {
        let now = Instant::now();
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(&(conversation_id, user_id)) {
            if entry.expires_at > now && now.duration_since(entry.published_at) < self.debounce {
                entry.expires_at = now + self.ttl;
                return None;
            }
        }

        entries.insert(
            (conversation_id, user_id),
            TypingEntry {
                published_at: now,
                expires_at: now + self.ttl,
            },
        );
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(5));
        Some(Utc::now() + ttl)
    }

    pub fn is_typing(&self, conversation_id: ConversationId, user_id: Uuid) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&(conversation_id, user_id))
            .is_some_and(|e| e.expires_at > now)
    }

    /// Drop the flag early, e.g. when the user actually sends.
    pub fn clear(&self, conversation_id: ConversationId, user_id: Uuid) {
        self.lock().remove(&(conversation_id, user_id));
    }

    /// Prune expired flags. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(ConversationId, Uuid), TypingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TypingIndicators {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TTL, DEFAULT_TYPING_DEBOUNCE)
    }
}
