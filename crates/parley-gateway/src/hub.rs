use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::ConversationId;

use crate::bus::RealtimeBus;
use crate::presence::PresenceTracker;
use crate::typing::TypingIndicators;

/// Realtime state shared by the HTTP handlers and the gateway connections.
#[derive(Clone)]
pub struct Hub {
    pub bus: RealtimeBus,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingIndicators>,
}

impl Hub {
    pub fn new(presence: PresenceTracker, typing: TypingIndicators) -> Self {
        Self {
            bus: RealtimeBus::new(),
            presence: Arc::new(presence),
            typing: Arc::new(typing),
        }
    }

    /// Presence keep-alive. Watchers hear about it only on the offline → online edge.
    pub async fn heartbeat(&self, user_id: Uuid) {
        if self.presence.heartbeat(user_id) {
            info!("{} is online", user_id);
            let state = self.presence.state(user_id);
            self.bus
                .publish_presence(
                    user_id,
                    ServerEvent::PresenceUpdate {
                        user_id,
                        online: true,
                        last_seen: state.last_seen,
                    },
                )
                .await;
        }
    }

    /// Typing burst from `user_id` towards `partner_id`. Pushed to the partner
    /// only, never broadcast. Returns whether a push went out.
    pub async fn start_typing(&self, user_id: Uuid, partner_id: Uuid) -> bool {
        if user_id == partner_id {
            return false;
        }
        let conversation_id = ConversationId::between(user_id, partner_id);
        let Some(expires_at) = self.typing.start(conversation_id, user_id) else {
            return false;
        };

        debug!("{} typing to {}", user_id, partner_id);
        self.bus
            .publish_to_user(
                partner_id,
                ServerEvent::TypingStart {
                    conversation_id,
                    user_id,
                    expires_at,
                },
            )
            .await;
        true
    }

    /// Replace a session's presence watch set and send it the current state
    /// of everyone it now follows.
    pub async fn watch_presence(&self, session_id: Uuid, user_ids: &[Uuid]) {
        self.bus.watch_presence(session_id, user_ids).await;
        for uid in user_ids {
            let state = self.presence.state(*uid);
            self.bus
                .publish_to_session(
                    session_id,
                    ServerEvent::PresenceUpdate {
                        user_id: state.user_id,
                        online: state.online,
                        last_seen: state.last_seen,
                    },
                )
                .await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(PresenceTracker::default(), TypingIndicators::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typing_reaches_only_the_partner() {
        let hub = Hub::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut own = hub.bus.register(a).await;
        let mut partner = hub.bus.register(b).await;
        let mut bystander = hub.bus.register(c).await;

        assert!(hub.start_typing(a, b).await);

        let event = partner.events.try_recv().unwrap();
        assert!(matches!(event.event, ServerEvent::TypingStart { user_id, .. } if user_id == a));
        assert!(own.events.try_recv().is_err());
        assert!(bystander.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_announces_once_to_watchers() {
        let hub = Hub::default();
        let (watcher, user) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = hub.bus.register(watcher).await;

        hub.watch_presence(sub.session_id, &[user]).await;
        let initial = sub.events.try_recv().unwrap();
        assert!(matches!(initial.event, ServerEvent::PresenceUpdate { online: false, .. }));

        hub.heartbeat(user).await;
        hub.heartbeat(user).await;
        let online = sub.events.try_recv().unwrap();
        assert!(matches!(online.event, ServerEvent::PresenceUpdate { online: true, .. }));
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_to_self_is_ignored() {
        let hub = Hub::default();
        let a = Uuid::new_v4();
        assert!(!hub.start_typing(a, a).await);
    }
}
