use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::{RealtimeEvent, ServerEvent};

/// A live gateway session: one per connected device.
pub struct Subscription {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub events: mpsc::UnboundedReceiver<RealtimeEvent>,
}

/// Routes events to the sessions of the users they concern.
///
/// Delivery is at-least-once from the client's point of view: a session that
/// reconnects resyncs from a snapshot and may see events it already applied.
#[derive(Clone, Default)]
pub struct RealtimeBus {
    inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    /// session_id -> session
    sessions: HashMap<Uuid, SessionEntry>,
    /// user_id -> session ids (multiple devices)
    by_user: HashMap<Uuid, HashSet<Uuid>>,
    /// watched user_id -> session ids following their presence
    watchers: HashMap<Uuid, HashSet<Uuid>>,
}

struct SessionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<RealtimeEvent>,
    watching: HashSet<Uuid>,
}

impl RealtimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `user_id`. Events arrive on the returned receiver
    /// until `unregister` is called with its session id.
    pub async fn register(&self, user_id: Uuid) -> Subscription {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.inner.write().await;
        registry.sessions.insert(
            session_id,
            SessionEntry {
                user_id,
                tx,
                watching: HashSet::new(),
            },
        );
        registry.by_user.entry(user_id).or_default().insert(session_id);

        Subscription {
            session_id,
            user_id,
            events: rx,
        }
    }

    pub async fn unregister(&self, session_id: Uuid) {
        let mut registry = self.inner.write().await;
        registry.remove_session(session_id);
    }

    /// Deliver `event` to every session of `user_id`. Returns how many
    /// sessions received it.
    pub async fn publish_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.publish_to_users(&[user_id], event).await
    }

    /// Deliver one event to several users; each session receives it once
    /// even if its user is listed twice.
    pub async fn publish_to_users(&self, user_ids: &[Uuid], event: ServerEvent) -> usize {
        let envelope = RealtimeEvent::now(event);
        let registry = self.inner.read().await;

        let targets: HashSet<Uuid> = user_ids
            .iter()
            .filter_map(|uid| registry.by_user.get(uid))
            .flatten()
            .copied()
            .collect();

        let delivered = registry.send_to_sessions(targets.iter(), &envelope);
        debug!(
            "{} -> {} session(s) of {} user(s)",
            envelope.event.type_name(),
            delivered,
            user_ids.len()
        );
        delivered
    }

    /// Replace the set of users whose presence `session_id` follows.
    pub async fn watch_presence(&self, session_id: Uuid, user_ids: &[Uuid]) {
        let mut registry = self.inner.write().await;
        let Some(entry) = registry.sessions.get_mut(&session_id) else {
            return;
        };

        let previous = std::mem::replace(&mut entry.watching, user_ids.iter().copied().collect());
        for uid in previous {
            registry.unwatch(uid, session_id);
        }
        for uid in user_ids {
            registry.watchers.entry(*uid).or_default().insert(session_id);
        }
    }

    /// Deliver a presence event about `user_id` to the sessions watching them.
    pub async fn publish_presence(&self, user_id: Uuid, event: ServerEvent) -> usize {
        let envelope = RealtimeEvent::now(event);
        let registry = self.inner.read().await;
        match registry.watchers.get(&user_id) {
            Some(sessions) => registry.send_to_sessions(sessions.iter(), &envelope),
            None => 0,
        }
    }

    /// Deliver an event to exactly one session.
    pub async fn publish_to_session(&self, session_id: Uuid, event: ServerEvent) -> bool {
        let envelope = RealtimeEvent::now(event);
        let registry = self.inner.read().await;
        registry.send_to_sessions(std::iter::once(&session_id), &envelope) == 1
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map_or(0, HashSet::len)
    }
}

impl Registry {
    fn send_to_sessions<'a>(
        &self,
        session_ids: impl Iterator<Item = &'a Uuid>,
        envelope: &RealtimeEvent,
    ) -> usize {
        let mut delivered = 0;
        for sid in session_ids {
            if let Some(entry) = self.sessions.get(sid) {
                // A closed receiver means the connection task is tearing down;
                // it unregisters itself, nothing to do here.
                if entry.tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn remove_session(&mut self, session_id: Uuid) {
        let Some(entry) = self.sessions.remove(&session_id) else {
            return;
        };

        if let Some(sessions) = self.by_user.get_mut(&entry.user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                self.by_user.remove(&entry.user_id);
            }
        }
        for uid in entry.watching {
            self.unwatch(uid, session_id);
        }
    }

    fn unwatch(&mut self, watched: Uuid, session_id: Uuid) {
        if let Some(sessions) = self.watchers.get_mut(&watched) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                self.watchers.remove(&watched);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(user_id: Uuid, online: bool) -> ServerEvent {
        ServerEvent::PresenceUpdate {
            user_id,
            online,
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_device_of_a_user() {
        let bus = RealtimeBus::new();
        let user = Uuid::new_v4();
        let mut phone = bus.register(user).await;
        let mut laptop = bus.register(user).await;
        let mut stranger = bus.register(Uuid::new_v4()).await;

        let delivered = bus.publish_to_user(user, presence(user, true)).await;
        assert_eq!(delivered, 2);
        assert!(phone.events.try_recv().is_ok());
        assert!(laptop.events.try_recv().is_ok());
        assert!(stranger.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_targets_deliver_once() {
        let bus = RealtimeBus::new();
        let user = Uuid::new_v4();
        let mut sub = bus.register(user).await;

        bus.publish_to_users(&[user, user], presence(user, true)).await;
        assert!(sub.events.try_recv().is_ok());
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_stops_delivery_and_watching() {
        let bus = RealtimeBus::new();
        let (user, watched) = (Uuid::new_v4(), Uuid::new_v4());
        let sub = bus.register(user).await;
        bus.watch_presence(sub.session_id, &[watched]).await;
        assert_eq!(bus.publish_presence(watched, presence(watched, true)).await, 1);

        bus.unregister(sub.session_id).await;
        assert_eq!(bus.session_count(user).await, 0);
        assert_eq!(bus.publish_to_user(user, presence(user, true)).await, 0);
        assert_eq!(bus.publish_presence(watched, presence(watched, false)).await, 0);
    }

    #[tokio::test]
    async fn watch_set_is_replaced_not_merged() {
        let bus = RealtimeBus::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = bus.register(Uuid::new_v4()).await;

        bus.watch_presence(sub.session_id, &[first]).await;
        bus.watch_presence(sub.session_id, &[second]).await;

        assert_eq!(bus.publish_presence(first, presence(first, true)).await, 0);
        assert_eq!(bus.publish_presence(second, presence(second, true)).await, 1);
        let event = sub.events.try_recv().unwrap();
        assert_eq!(event.event, presence(second, true));
    }
}
