use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationId, Message};

/// Envelope for everything pushed over the realtime gateway:
/// `{ "type": ..., "payload": {...}, "serverTime": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(rename = "serverTime")]
    pub server_time: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn now(event: ServerEvent) -> Self {
        Self {
            event,
            server_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    /// First frame on every connection.
    #[serde(rename = "ready")]
    Ready { user_id: Uuid, session_id: Uuid },

    /// A message was appended to the ledger.
    #[serde(rename = "message.created")]
    MessageCreated {
        conversation_id: ConversationId,
        message: Message,
    },

    /// The recipient flipped one or more messages to read.
    #[serde(rename = "message.read")]
    MessageRead {
        conversation_id: ConversationId,
        reader_id: Uuid,
        message_ids: Vec<i64>,
    },

    /// Partner is composing; treat as stopped once `expires_at` passes.
    #[serde(rename = "typing.start")]
    TypingStart {
        conversation_id: ConversationId,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[serde(rename = "presence.update")]
    PresenceUpdate {
        user_id: Uuid,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    },

    /// One of the viewer's own devices hid or unhid a conversation.
    #[serde(rename = "conversation.visibility")]
    ConversationVisibility {
        conversation_id: ConversationId,
        partner_id: Uuid,
        hidden: bool,
    },
}

impl ServerEvent {
    /// Conversation this event belongs to, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::MessageCreated { conversation_id, .. }
            | Self::MessageRead { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. }
            | Self::ConversationVisibility { conversation_id, .. } => Some(*conversation_id),
            Self::Ready { .. } | Self::PresenceUpdate { .. } => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::MessageCreated { .. } => "message.created",
            Self::MessageRead { .. } => "message.read",
            Self::TypingStart { .. } => "typing.start",
            Self::PresenceUpdate { .. } => "presence.update",
            Self::ConversationVisibility { .. } => "conversation.visibility",
        }
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Presence keep-alive while the app is foregrounded.
    Heartbeat,

    /// Composition burst in the conversation with `partner_id`.
    StartTyping { partner_id: Uuid },

    /// Replace the set of users whose presence this session follows.
    WatchPresence { user_ids: Vec<Uuid> },
}
