use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::api::{
    ListConversationsQuery, MAX_PAGE_LIMIT, MarkReadRequest, MarkReadResponse, SendMessageRequest,
    ThreadQuery,
};
use parley_types::events::{ClientCommand, RealtimeEvent, ServerEvent};
use parley_types::models::{ConversationPage, Message, MessageContent, ThreadCursor};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::delivery::{DeliveryClient, LocalId};
use crate::error::ClientError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// At most one typing push per partner per window.
#[derive(Debug)]
pub struct TypingThrottle {
    window: Duration,
    last: HashMap<Uuid, Instant>,
}

impl TypingThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    pub fn allow(&mut self, partner_id: Uuid) -> bool {
        let now = Instant::now();
        match self.last.get(&partner_id) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                self.last.insert(partner_id, now);
                true
            }
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

struct Shared {
    config: ClientConfig,
    token: String,
    http: reqwest::Client,
    delivery: Mutex<DeliveryClient>,
    commands: mpsc::UnboundedSender<ClientCommand>,
    watched: Mutex<Vec<Uuid>>,
    typing: Mutex<TypingThrottle>,
    changes: watch::Sender<u64>,
}

impl Shared {
    fn delivery(&self) -> MutexGuard<'_, DeliveryClient> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        Err(ClientError::from_status(status, message))
    }

    async fn fetch_snapshot(&self) -> Result<ConversationPage, ClientError> {
        let query = ListConversationsQuery {
            cursor: None,
            limit: Some(MAX_PAGE_LIMIT),
            include_hidden: false,
        };
        self.execute(self.http.get(self.config.api_url("/conversations")).query(&query))
            .await
    }

    async fn fetch_thread(
        &self,
        partner_id: Uuid,
        before: Option<ThreadCursor>,
    ) -> Result<Vec<Message>, ClientError> {
        let query = ThreadQuery {
            before,
            after: None,
            limit: None,
        };
        let url = self
            .config
            .api_url(&format!("/conversations/{}/messages", partner_id));
        self.execute(self.http.get(url).query(&query)).await
    }
}

/// Connection manager for one signed-in user.
///
/// Owns a single gateway subscription for its whole lifetime, reconnecting
/// with backoff and re-running the sync handshake after every reconnect.
/// Dropping the session or calling [`Session::close`] tears it down.
pub struct Session {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawn the connection loop. Must be called inside a tokio runtime.
    pub fn start(
        config: ClientConfig,
        token: impl Into<String>,
        viewer: Uuid,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        // Fail fast on a bad origin instead of inside the loop.
        config.gateway_url()?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            typing: Mutex::new(TypingThrottle::new(config.typing_throttle)),
            config,
            token: token.into(),
            http,
            delivery: Mutex::new(DeliveryClient::new(viewer)),
            commands,
            watched: Mutex::new(Vec::new()),
            changes,
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), commands_rx, cancel.clone()));
        info!("session started for {}", viewer);

        Ok(Self {
            shared,
            cancel,
            task: Some(task),
        })
    }

    /// Read the merged cache. Don't block inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&DeliveryClient) -> R) -> R {
        f(&self.shared.delivery())
    }

    /// Ticks whenever the cache changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    pub async fn send_message(
        &self,
        partner_id: Uuid,
        content: MessageContent,
    ) -> Result<Message, ClientError> {
        let local_id = self
            .shared
            .delivery()
            .queue_outgoing(partner_id, content.clone())?;
        self.shared.notify();
        self.deliver(local_id, partner_id, content).await
    }

    /// Resend a failed message. `Ok(None)` if `local_id` isn't a failed entry.
    pub async fn retry(&self, local_id: LocalId) -> Result<Option<Message>, ClientError> {
        let Some((partner_id, content)) = self.shared.delivery().retry_outgoing(local_id) else {
            return Ok(None);
        };
        self.shared.notify();
        self.deliver(local_id, partner_id, content).await.map(Some)
    }

    async fn deliver(
        &self,
        local_id: LocalId,
        partner_id: Uuid,
        content: MessageContent,
    ) -> Result<Message, ClientError> {
        let url = self
            .shared
            .config
            .api_url(&format!("/conversations/{}/messages", partner_id));
        let request = self.shared.http.post(url).json(&SendMessageRequest { content });

        let result = self.shared.execute::<Message>(request).await;
        match &result {
            Ok(message) => self.shared.delivery().confirm_sent(local_id, message.clone()),
            Err(e) => {
                warn!("send to {} failed: {}", partner_id, e);
                self.shared.delivery().mark_failed(local_id, e.to_string());
            }
        }
        self.shared.notify();
        result
    }

    /// Load one window of a thread into the cache. Returns false when a
    /// newer load for the same partner superseded this one.
    pub async fn load_thread(
        &self,
        partner_id: Uuid,
        before: Option<ThreadCursor>,
    ) -> Result<bool, ClientError> {
        let ticket = self.shared.delivery().begin_thread_fetch(partner_id);
        let messages = self.shared.fetch_thread(partner_id, before).await?;
        let applied = self.shared.delivery().complete_thread_fetch(ticket, messages);
        if applied {
            self.shared.notify();
        }
        Ok(applied)
    }

    pub async fn mark_read(&self, message_ids: Vec<i64>) -> Result<usize, ClientError> {
        let request = self
            .shared
            .http
            .post(self.shared.config.api_url("/messages/read"))
            .json(&MarkReadRequest { message_ids });
        let response: MarkReadResponse = self.shared.execute(request).await?;
        Ok(response.updated)
    }

    pub async fn mark_thread_read(&self, partner_id: Uuid) -> Result<usize, ClientError> {
        let url = self
            .shared
            .config
            .api_url(&format!("/conversations/{}/read", partner_id));
        let response: MarkReadResponse = self.shared.execute(self.shared.http.post(url)).await?;
        Ok(response.updated)
    }

    pub async fn hide(&self, partner_id: Uuid) -> Result<(), ClientError> {
        let url = self
            .shared
            .config
            .api_url(&format!("/conversations/{}/hide", partner_id));
        self.shared.send(self.shared.http.post(url)).await.map(|_| ())
    }

    pub async fn unhide(&self, partner_id: Uuid) -> Result<(), ClientError> {
        let url = self
            .shared
            .config
            .api_url(&format!("/conversations/{}/hide", partner_id));
        self.shared.send(self.shared.http.delete(url)).await.map(|_| ())
    }

    /// Signal a typing burst. Throttled locally; returns whether a command
    /// went out.
    pub fn start_typing(&self, partner_id: Uuid) -> bool {
        let allowed = self
            .shared
            .typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow(partner_id);
        allowed && self.shared.commands.send(ClientCommand::StartTyping { partner_id }).is_ok()
    }

    /// Follow presence of `user_ids`. Re-sent after every reconnect.
    pub fn watch_presence(&self, user_ids: Vec<Uuid>) {
        *self.shared.watched.lock().unwrap_or_else(PoisonError::into_inner) = user_ids.clone();
        let _ = self.shared.commands.send(ClientCommand::WatchPresence { user_ids });
    }

    /// False once the connection loop has given up or been closed.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Close the subscription and wait for the connection loop to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("session task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(shared.config.backoff_initial, shared.config.backoff_max);

    loop {
        let outcome = connect_once(&shared, &mut commands, &cancel, &mut backoff).await;
        shared.delivery().disconnect();
        shared.notify();

        if cancel.is_cancelled() {
            break;
        }
        match outcome {
            Ok(()) => info!("gateway closed the subscription"),
            Err(e) if e.is_retryable() => warn!("gateway connection lost: {}", e),
            Err(ClientError::Authorization(reason)) => {
                error!("gateway rejected credentials, giving up: {}", reason);
                break;
            }
            Err(e) => {
                error!("gateway failed permanently, giving up: {}", e);
                break;
            }
        }

        let delay = backoff.next_delay();
        info!("reconnecting in {:?} (attempt {})", delay, backoff.attempt());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("session closed");
}

async fn connect_once(
    shared: &Arc<Shared>,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<(), ClientError> {
    let mut request = shared.config.gateway_url()?.into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", shared.token))
        .map_err(|e| ClientError::Protocol(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = tokio_tungstenite::connect_async(request) => connected?.0,
    };
    let (mut sink, mut frames) = stream.split();
    info!("gateway connected");

    // Buffer from here on: anything arriving before the snapshot is replayed.
    let sync = shared.delivery().begin_sync();
    shared.notify();

    let watched = shared
        .watched
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if !watched.is_empty() {
        send_command(&mut sink, &ClientCommand::WatchPresence { user_ids: watched }).await?;
    }

    let snapshot = shared.fetch_snapshot();
    tokio::pin!(snapshot);
    let mut synced = false;

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    let mut refresh = tokio::time::interval(shared.config.refresh_debounce);
    refresh.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(());
            }

            result = &mut snapshot, if !synced => {
                synced = true;
                let page = result?;
                let applied = shared.delivery().complete_sync(sync, page);
                if applied {
                    backoff.reset();
                    info!("synced");
                    shared.notify();
                }
            }

            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => handle_frame(shared, &text),
                Some(Ok(WsMessage::Close(frame))) => {
                    return Err(ClientError::Transient(format!("gateway closed: {:?}", frame)));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ClientError::Transient("gateway stream ended".into())),
            },

            _ = heartbeat.tick() => send_command(&mut sink, &ClientCommand::Heartbeat).await?,

            Some(command) = commands.recv() => send_command(&mut sink, &command).await?,

            _ = refresh.tick(), if synced => spawn_refresh(shared),
        }
    }
}

fn handle_frame(shared: &Shared, text: &str) {
    let event = match serde_json::from_str::<RealtimeEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("unreadable gateway frame: {}", e);
            return;
        }
    };

    if let ServerEvent::Ready { session_id, .. } = &event.event {
        debug!("gateway session {}", session_id);
        return;
    }

    let outcome = shared.delivery().on_event(event);
    debug!("gateway event {:?}", outcome);
    shared.notify();
}

async fn send_command(sink: &mut WsSink, command: &ClientCommand) -> Result<(), ClientError> {
    let text = serde_json::to_string(command)?;
    sink.send(WsMessage::text(text)).await?;
    Ok(())
}

/// Refresh stale partners off the event path so a slow fetch never delays
/// incoming frames.
fn spawn_refresh(shared: &Arc<Shared>) {
    let dirty = shared.delivery().take_dirty();
    if dirty.is_empty() {
        return;
    }

    let shared = shared.clone();
    tokio::spawn(async move {
        debug!("refreshing {} stale conversations", dirty.len());
        match shared.fetch_snapshot().await {
            Ok(page) => shared.delivery().refresh_conversations(page),
            Err(e) => {
                warn!("background refresh failed: {}", e);
                let mut delivery = shared.delivery();
                for partner_id in &dirty {
                    delivery.mark_dirty(*partner_id);
                }
                return;
            }
        }

        for partner_id in dirty {
            let ticket = shared.delivery().begin_thread_fetch(partner_id);
            match shared.fetch_thread(partner_id, None).await {
                Ok(messages) => {
                    shared.delivery().complete_thread_fetch(ticket, messages);
                }
                Err(e) => warn!("thread refresh for {} failed: {}", partner_id, e),
            }
        }
        shared.notify();
    });
}
