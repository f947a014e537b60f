use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{ClientCommand, RealtimeEvent, ServerEvent};

use crate::hub::Hub;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a WebSocket whose JWT was already validated at the HTTP upgrade.
pub async fn handle_connection(socket: WebSocket, hub: Hub, user_id: Uuid, username: String) {
    let (mut sender, receiver) = socket.split();

    let subscription = hub.bus.register(user_id).await;
    let session_id = subscription.session_id;
    info!("{} ({}) connected to gateway, session {}", username, user_id, session_id);

    let ready = RealtimeEvent::now(ServerEvent::Ready { user_id, session_id });
    if send_event(&mut sender, &ready).await.is_err() {
        hub.bus.unregister(session_id).await;
        return;
    }

    // Being connected is evidence of being foregrounded.
    hub.heartbeat(user_id).await;

    run_connection_loop(sender, receiver, subscription.events, hub.clone(), user_id, session_id).await;

    hub.bus.unregister(session_id).await;
    info!("{} ({}) disconnected from gateway, session {}", username, user_id, session_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<RealtimeEvent>,
    hub: Hub,
    user_id: Uuid,
    session_id: Uuid,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward bus events -> client, with ping heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => handle_command(&hub, user_id, session_id, cmd).await,
                    Err(e) => {
                        let raw = text.as_str();
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            raw.get(..raw.len().min(200)).unwrap_or(raw)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(hub: &Hub, user_id: Uuid, session_id: Uuid, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Heartbeat => hub.heartbeat(user_id).await,

        ClientCommand::StartTyping { partner_id } => {
            hub.start_typing(user_id, partner_id).await;
        }

        ClientCommand::WatchPresence { user_ids } => {
            info!("{} watching presence of {} users", user_id, user_ids.len());
            hub.watch_presence(session_id, &user_ids).await;
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RealtimeEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.event.type_name(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
