//! Client-side merge of snapshots and realtime events.
//!
//! [`DeliveryClient`] is a synchronous state machine with no I/O of its own.
//! The [`Session`](crate::session::Session) feeds it frames and HTTP results;
//! everything here is deterministic and testable without a server.
//!
//! Lifecycle: `Disconnected → Syncing → Live`. While syncing, realtime events
//! are buffered. Once the snapshot lands they are replayed on top of it,
//! skipping anything the snapshot already reflects, so no mutation is lost
//! or double-applied across a reconnect.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use parley_types::events::{RealtimeEvent, ServerEvent};
use parley_types::models::{
    Conversation, ConversationId, ConversationPage, Message, MessageContent, PresenceState,
    ThreadCursor, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Syncing,
    Live,
}

/// Identifies one sync attempt. A snapshot is only accepted for the most
/// recent token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncToken(u64);

/// Identifies one thread fetch. For each partner only the newest ticket may
/// apply its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    partner_id: Uuid,
    seq: u64,
}

impl FetchTicket {
    pub fn partner_id(&self) -> Uuid {
        self.partner_id
    }
}

/// What happened to an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Buffered,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingStatus {
    Sending,
    Failed { reason: String },
}

/// A message the user sent that the server has not confirmed yet.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub local_id: LocalId,
    pub partner_id: Uuid,
    pub content: MessageContent,
    pub status: OutgoingStatus,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Thread {
    /// Ascending by `(created_at, id)`.
    messages: Vec<Message>,
    ids: HashSet<i64>,
}

impl Thread {
    /// Sorted insert. Returns false for a message already present.
    fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.thread_order(&message).is_lt());
        self.messages.insert(at, message);
        true
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut Message> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

pub struct DeliveryClient {
    viewer: Uuid,
    state: SyncState,
    sync_seq: u64,
    buffer: Vec<RealtimeEvent>,
    conversations: HashMap<Uuid, Conversation>,
    /// Per partner, the newest message position whose unread state the
    /// server summary already accounts for.
    baselines: HashMap<Uuid, ThreadCursor>,
    threads: HashMap<Uuid, Thread>,
    fetch_seq: u64,
    latest_fetch: HashMap<Uuid, u64>,
    next_local_id: u64,
    outgoing: Vec<PendingMessage>,
    dirty: BTreeSet<Uuid>,
    typing: HashMap<Uuid, DateTime<Utc>>,
    presence: HashMap<Uuid, PresenceState>,
}

impl DeliveryClient {
    pub fn new(viewer: Uuid) -> Self {
        Self {
            viewer,
            state: SyncState::Disconnected,
            sync_seq: 0,
            buffer: Vec::new(),
            conversations: HashMap::new(),
            baselines: HashMap::new(),
            threads: HashMap::new(),
            fetch_seq: 0,
            latest_fetch: HashMap::new(),
            next_local_id: 0,
            outgoing: Vec::new(),
            dirty: BTreeSet::new(),
            typing: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    // -- Lifecycle --

    /// Start buffering. Call as soon as the subscription is open, before the
    /// snapshot request goes out.
    pub fn begin_sync(&mut self) -> SyncToken {
        self.sync_seq += 1;
        self.state = SyncState::Syncing;
        self.buffer.clear();
        SyncToken(self.sync_seq)
    }

    /// Install a snapshot and replay buffered events. Returns false, and
    /// changes nothing, if `token` is no longer current.
    pub fn complete_sync(&mut self, token: SyncToken, snapshot: ConversationPage) -> bool {
        if self.state != SyncState::Syncing || token.0 != self.sync_seq {
            debug!("ignoring stale snapshot (token {}, current {})", token.0, self.sync_seq);
            return false;
        }

        let snapshot_time = snapshot.server_time;
        self.conversations = snapshot
            .conversations
            .into_iter()
            .map(|c| (c.partner_id, c))
            .collect();
        self.baselines = self
            .conversations
            .values()
            .map(|c| (c.partner_id, c.last_message.cursor()))
            .collect();
        for conversation in self.conversations.values() {
            let thread = self.threads.entry(conversation.partner_id).or_default();
            thread.insert(conversation.last_message.clone());
        }

        let buffered = std::mem::take(&mut self.buffer);
        let mut replayed = 0;
        for event in buffered {
            if self.apply(event, Some(snapshot_time)) {
                replayed += 1;
            }
        }
        debug!("sync complete, {} buffered events replayed", replayed);

        self.state = SyncState::Live;
        true
    }

    /// Subscription lost. Buffered events are dropped; the next sync
    /// starts from a fresh snapshot.
    pub fn disconnect(&mut self) {
        self.state = SyncState::Disconnected;
        self.buffer.clear();
        self.typing.clear();
    }

    pub fn on_event(&mut self, event: RealtimeEvent) -> EventOutcome {
        match self.state {
            SyncState::Disconnected => EventOutcome::Ignored,
            SyncState::Syncing => {
                self.buffer.push(event);
                EventOutcome::Buffered
            }
            SyncState::Live => {
                if self.apply(event, None) {
                    EventOutcome::Applied
                } else {
                    EventOutcome::Ignored
                }
            }
        }
    }

    // -- Views --

    /// Visible conversations, newest first.
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self
            .conversations
            .values()
            .filter(|c| !c.is_hidden_for_viewer)
            .collect();
        list.sort_by(|a, b| b.last_message.thread_order(&a.last_message));
        list
    }

    pub fn conversation(&self, partner_id: Uuid) -> Option<&Conversation> {
        self.conversations.get(&partner_id)
    }

    /// Cached messages with `partner_id`, oldest first.
    pub fn thread(&self, partner_id: Uuid) -> &[Message] {
        self.threads
            .get(&partner_id)
            .map(|t| t.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .values()
            .filter(|c| !c.is_hidden_for_viewer)
            .map(|c| c.unread_count)
            .sum()
    }

    pub fn is_typing(&self, partner_id: Uuid, now: DateTime<Utc>) -> bool {
        self.typing.get(&partner_id).is_some_and(|exp| *exp > now)
    }

    pub fn presence(&self, user_id: Uuid) -> Option<&PresenceState> {
        self.presence.get(&user_id)
    }

    // -- Thread fetches --

    pub fn begin_thread_fetch(&mut self, partner_id: Uuid) -> FetchTicket {
        self.fetch_seq += 1;
        self.latest_fetch.insert(partner_id, self.fetch_seq);
        FetchTicket {
            partner_id,
            seq: self.fetch_seq,
        }
    }

    /// Merge a fetched window. A superseded ticket is dropped so a slow
    /// response can never overwrite a newer one.
    pub fn complete_thread_fetch(&mut self, ticket: FetchTicket, messages: Vec<Message>) -> bool {
        if self.latest_fetch.get(&ticket.partner_id) != Some(&ticket.seq) {
            debug!("dropping superseded fetch for {}", ticket.partner_id);
            return false;
        }
        self.latest_fetch.remove(&ticket.partner_id);

        let thread = self.threads.entry(ticket.partner_id).or_default();
        for message in messages {
            if let Some(existing) = thread.get_mut(message.id) {
                // Fetched rows carry authoritative read state.
                existing.is_read = message.is_read;
            } else {
                thread.insert(message);
            }
        }
        true
    }

    /// Merge summaries from a background refresh without touching the sync
    /// state. Partners absent from `page` keep their cached summary.
    ///
    /// A page computed before a live message arrived never rolls the summary
    /// back: the newer local `last_message` wins, unread inbound messages past
    /// the page are added on top of the server count, and the partner stays
    /// dirty so a later refresh can confirm.
    pub fn refresh_conversations(&mut self, page: ConversationPage) {
        for mut conversation in page.conversations {
            let partner_id = conversation.partner_id;
            let page_position = conversation.last_message.cursor();

            let thread = self.threads.entry(partner_id).or_default();
            thread.insert(conversation.last_message.clone());

            let baseline = self.baselines.entry(partner_id).or_insert(page_position);
            if page_position > *baseline {
                *baseline = page_position;
            }

            let cached = self
                .conversations
                .get(&partner_id)
                .filter(|c| c.last_message.cursor() > page_position);
            match cached {
                Some(cached) => {
                    let newer_unread = thread
                        .messages
                        .iter()
                        .filter(|m| {
                            m.cursor() > page_position
                                && m.recipient_id == self.viewer
                                && !m.is_read
                        })
                        .count() as u32;
                    debug!(
                        "refresh for {} predates {}, keeping local summary",
                        partner_id, cached.last_message.id
                    );
                    conversation.unread_count += newer_unread;
                    conversation.last_message = cached.last_message.clone();
                    conversation.last_message_time = cached.last_message_time;
                    conversation.is_hidden_for_viewer = cached.is_hidden_for_viewer;
                    if conversation.partner_profile.is_none() {
                        conversation.partner_profile = cached.partner_profile.clone();
                    }
                    self.dirty.insert(partner_id);
                }
                None => {
                    self.dirty.remove(&partner_id);
                }
            }
            self.conversations.insert(partner_id, conversation);
        }
    }

    /// Partners whose summaries or read flags are stale. Drains the set.
    pub fn take_dirty(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// Put a partner back after a failed refresh.
    pub fn mark_dirty(&mut self, partner_id: Uuid) {
        self.dirty.insert(partner_id);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    // -- Outgoing --

    /// Validate and track a message before it goes on the wire.
    pub fn queue_outgoing(
        &mut self,
        partner_id: Uuid,
        content: MessageContent,
    ) -> Result<LocalId, ValidationError> {
        if partner_id == self.viewer {
            return Err(ValidationError::SelfMessage);
        }
        content.validate()?;

        self.next_local_id += 1;
        let local_id = LocalId(self.next_local_id);
        self.outgoing.push(PendingMessage {
            local_id,
            partner_id,
            content,
            status: OutgoingStatus::Sending,
            queued_at: Utc::now(),
        });
        Ok(local_id)
    }

    /// Server accepted the message. The echo may already have arrived over
    /// the subscription; the merge is idempotent either way.
    pub fn confirm_sent(&mut self, local_id: LocalId, message: Message) {
        self.outgoing.retain(|p| p.local_id != local_id);
        self.merge_message(message);
    }

    pub fn mark_failed(&mut self, local_id: LocalId, reason: impl Into<String>) {
        if let Some(pending) = self.outgoing.iter_mut().find(|p| p.local_id == local_id) {
            pending.status = OutgoingStatus::Failed {
                reason: reason.into(),
            };
        }
    }

    /// Flip a failed entry back to sending and hand back what to resend.
    pub fn retry_outgoing(&mut self, local_id: LocalId) -> Option<(Uuid, MessageContent)> {
        let pending = self
            .outgoing
            .iter_mut()
            .find(|p| p.local_id == local_id && matches!(p.status, OutgoingStatus::Failed { .. }))?;
        pending.status = OutgoingStatus::Sending;
        Some((pending.partner_id, pending.content.clone()))
    }

    pub fn discard_outgoing(&mut self, local_id: LocalId) {
        self.outgoing.retain(|p| p.local_id != local_id);
    }

    pub fn pending(&self, partner_id: Uuid) -> Vec<&PendingMessage> {
        self.outgoing
            .iter()
            .filter(|p| p.partner_id == partner_id)
            .collect()
    }

    // -- Event application --

    /// Apply one event. `reflected_at` is set during replay: events the
    /// snapshot already contains are skipped.
    fn apply(&mut self, event: RealtimeEvent, reflected_at: Option<DateTime<Utc>>) -> bool {
        trace!("applying {}", event.event.type_name());
        match event.event {
            ServerEvent::Ready { .. } => false,

            ServerEvent::MessageCreated { message, .. } => {
                if message.involves(self.viewer) {
                    self.merge_message(message)
                } else {
                    false
                }
            }

            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
                message_ids,
            } => {
                if reflected_at.is_some_and(|snapshot| event.server_time <= snapshot) {
                    return false;
                }
                self.apply_read(conversation_id, reader_id, &message_ids)
            }

            ServerEvent::TypingStart {
                user_id,
                expires_at,
                ..
            } => {
                if user_id == self.viewer {
                    return false;
                }
                self.typing.insert(user_id, expires_at);
                true
            }

            ServerEvent::PresenceUpdate {
                user_id,
                online,
                last_seen,
            } => {
                self.presence.insert(
                    user_id,
                    PresenceState {
                        user_id,
                        online,
                        last_seen,
                    },
                );
                true
            }

            ServerEvent::ConversationVisibility {
                partner_id, hidden, ..
            } => {
                if reflected_at.is_some_and(|snapshot| event.server_time <= snapshot) {
                    return false;
                }
                match self.conversations.get_mut(&partner_id) {
                    Some(conversation) => conversation.is_hidden_for_viewer = hidden,
                    None if !hidden => {
                        self.dirty.insert(partner_id);
                    }
                    None => {}
                }
                true
            }
        }
    }

    /// Insert into the thread cache and move the summary forward. Returns
    /// whether anything changed.
    fn merge_message(&mut self, message: Message) -> bool {
        let partner_id = message.partner_of(self.viewer);
        let inbound = message.recipient_id == self.viewer;

        if inbound {
            self.typing.remove(&partner_id);
        }

        let inserted = self
            .threads
            .entry(partner_id)
            .or_default()
            .insert(message.clone());

        // Messages at or before the baseline are already in the server's
        // unread count, whether they arrive by replay or late delivery.
        let already_counted = self
            .baselines
            .get(&partner_id)
            .is_some_and(|baseline| message.cursor() <= *baseline);
        let counts_unread = inserted && inbound && !message.is_read && !already_counted;

        match self.conversations.get_mut(&partner_id) {
            Some(conversation) => {
                let mut changed = inserted;
                if counts_unread {
                    conversation.unread_count += 1;
                    changed = true;
                }
                if message.thread_order(&conversation.last_message).is_gt() {
                    conversation.last_message_time = message.created_at;
                    conversation.last_message = message;
                    // The server clears the hide on every new message.
                    conversation.is_hidden_for_viewer = false;
                    changed = true;
                }
                changed
            }
            None => {
                if !inserted {
                    return false;
                }
                // First sight of this partner: no profile yet.
                self.dirty.insert(partner_id);
                self.conversations.insert(
                    partner_id,
                    Conversation {
                        conversation_id: message.conversation_id,
                        partner_id,
                        partner_profile: None,
                        last_message_time: message.created_at,
                        unread_count: u32::from(counts_unread),
                        is_hidden_for_viewer: false,
                        last_message: message,
                    },
                );
                true
            }
        }
    }

    fn apply_read(&mut self, conversation_id: ConversationId, reader_id: Uuid, ids: &[i64]) -> bool {
        let partner_id = if reader_id == self.viewer {
            // Read on another of our devices: find the partner by conversation.
            match self.partner_for(conversation_id) {
                Some(partner) => partner,
                None => {
                    trace!("read receipt for unknown conversation {}", conversation_id);
                    return false;
                }
            }
        } else {
            reader_id
        };

        let mut flipped_inbound = 0u32;
        let mut missing = false;
        let thread = self.threads.entry(partner_id).or_default();
        for id in ids {
            match thread.get_mut(*id) {
                Some(message) if !message.is_read => {
                    message.is_read = true;
                    if message.recipient_id == self.viewer {
                        flipped_inbound += 1;
                    }
                }
                Some(_) => {}
                None => missing = true,
            }
        }

        if let Some(conversation) = self.conversations.get_mut(&partner_id) {
            if ids.contains(&conversation.last_message.id) {
                conversation.last_message.is_read = true;
            }
            if reader_id == self.viewer {
                conversation.unread_count = conversation.unread_count.saturating_sub(flipped_inbound);
            }
        }

        // Uncached ids mean the local unread count may be off; refresh later.
        if missing {
            self.dirty.insert(partner_id);
        }
        true
    }

    fn partner_for(&self, conversation_id: ConversationId) -> Option<Uuid> {
        self.conversations
            .values()
            .find(|c| c.conversation_id == conversation_id)
            .map(|c| c.partner_id)
            .or_else(|| {
                self.threads.iter().find_map(|(partner, thread)| {
                    thread
                        .messages
                        .first()
                        .filter(|m| m.conversation_id == conversation_id)
                        .map(|_| *partner)
                })
            })
    }
}
