use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use parley_types::models::PresenceState;

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Heartbeat-driven online/last-seen state. Purely in memory: a restart
/// forgets everyone, and the next heartbeat brings them back.
pub struct PresenceTracker {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, PresenceEntry>>,
}

struct PresenceEntry {
    last_beat: Instant,
    last_seen: DateTime<Utc>,
    /// Whether watchers were last told this user is online.
    announced_online: bool,
}

impl PresenceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat. Returns `true` when this beat brings the user
    /// online (first beat, or first beat after the TTL lapsed).
    pub fn heartbeat(&self, user_id: Uuid) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        let came_online = match entries.get(&user_id) {
            Some(entry) => !entry.announced_online || now.duration_since(entry.last_beat) >= self.ttl,
            None => true,
        };

        entries.insert(
            user_id,
            PresenceEntry {
                last_beat: now,
                last_seen: Utc::now(),
                announced_online: true,
            },
        );
        came_online
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        let now = Instant::now();
        self.lock()
            .get(&user_id)
            .is_some_and(|e| now.duration_since(e.last_beat) < self.ttl)
    }

    pub fn state(&self, user_id: Uuid) -> PresenceState {
        let now = Instant::now();
        let entries = self.lock();
        match entries.get(&user_id) {
            Some(entry) => PresenceState {
                user_id,
                online: now.duration_since(entry.last_beat) < self.ttl,
                last_seen: Some(entry.last_seen),
            },
            None => PresenceState {
                user_id,
                online: false,
                last_seen: None,
            },
        }
    }

    /// Users whose TTL lapsed since they were last announced online. Each
    /// user is reported once per online period.
    pub fn sweep(&self) -> Vec<PresenceState> {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut went_offline = Vec::new();

        for (user_id, entry) in entries.iter_mut() {
            if entry.announced_online && now.duration_since(entry.last_beat) >= self.ttl {
                entry.announced_online = false;
                went_offline.push(PresenceState {
                    user_id: *user_id,
                    online: false,
                    last_seen: Some(entry.last_seen),
                });
            }
        }
        went_offline
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PresenceEntry>> {
        // Entries are plain data; a panic mid-update cannot leave them half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TTL)
    }
}
