use std::time::Duration;

use tracing::{debug, info};

use parley_types::events::ServerEvent;

use crate::hub::Hub;

/// Background task that expires ephemeral state.
///
/// Runs on an interval: users whose heartbeat TTL lapsed are announced
/// offline to their watchers, and stale typing flags are pruned.
pub async fn run_sweeper(hub: Hub, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        sweep_once(&hub).await;
    }
}

pub async fn sweep_once(hub: &Hub) {
    for state in hub.presence.sweep() {
        info!("{} went offline", state.user_id);
        hub.bus
            .publish_presence(
                state.user_id,
                ServerEvent::PresenceUpdate {
                    user_id: state.user_id,
                    online: false,
                    last_seen: state.last_seen,
                },
            )
            .await;
    }

    let pruned = hub.typing.sweep();
    if pruned > 0 {
        debug!("Sweep: pruned {} expired typing flags", pruned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceTracker;
    use crate::typing::TypingIndicators;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn lapsed_users_are_announced_offline() {
        let hub = Hub::new(
            PresenceTracker::new(Duration::from_secs(60)),
            TypingIndicators::default(),
        );
        let (watcher, user) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = hub.bus.register(watcher).await;
        hub.bus.watch_presence(sub.session_id, &[user]).await;

        hub.heartbeat(user).await;
        let _online = sub.events.try_recv().unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        sweep_once(&hub).await;

        let event = sub.events.try_recv().unwrap();
        assert!(matches!(event.event, ServerEvent::PresenceUpdate { online: false, .. }));
    }
}
