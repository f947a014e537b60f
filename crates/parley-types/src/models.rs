use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Longest accepted text body, in characters.
pub const MAX_TEXT_LEN: usize = 4000;

/// 50 MB, same ceiling the attachment store enforces on upload.
pub const MAX_ATTACHMENT_SIZE: u64 = 50 * 1024 * 1024;

const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_8a3b_4b7f_9e21_5d0c_a7f3_1b88);

// -- Conversation identity --

/// Canonical id of the unordered pair of users in a direct conversation.
///
/// Derived, never allocated: `between(a, b) == between(b, a)`, so two clients
/// sending their first message at the same time always agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn between(a: Uuid, b: Uuid) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(low.as_bytes());
        name[16..].copy_from_slice(high.as_bytes());
        Self(Uuid::new_v5(&CONVERSATION_NAMESPACE, &name))
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// -- Validation --

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message has no content")]
    Empty,
    #[error("text exceeds {max} characters")]
    TextTooLong { max: usize },
    #[error("attachment exceeds {max} bytes")]
    AttachmentTooLarge { max: u64 },
    #[error("attachment is missing its {0}")]
    AttachmentIncomplete(&'static str),
    #[error("{kind} message cannot carry a {mime} attachment")]
    MimeMismatch { kind: MessageKind, mime: String },
    #[error("sender and recipient are the same user")]
    SelfMessage,
}

impl ValidationError {
    /// Payload-size failures, reported as 413 rather than 400.
    pub fn is_oversized(&self) -> bool {
        matches!(self, Self::TextTooLong { .. } | Self::AttachmentTooLarge { .. })
    }
}

// -- Message content --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Voice,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown message kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "voice" => Ok(Self::Voice),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Uploaded blob reference, as returned by the attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

impl Attachment {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.url.trim().is_empty() {
            return Err(ValidationError::AttachmentIncomplete("url"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::AttachmentIncomplete("name"));
        }
        if self.size > MAX_ATTACHMENT_SIZE {
            return Err(ValidationError::AttachmentTooLarge {
                max: MAX_ATTACHMENT_SIZE,
            });
        }
        Ok(())
    }
}

/// Message body. Each kind carries exactly the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        attachment: Attachment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    File {
        attachment: Attachment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Voice {
        attachment: Attachment,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
            Self::Voice { .. } => MessageKind::Voice,
        }
    }

    /// Text body for text messages, caption for attachments that have one.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { caption, .. } | Self::File { caption, .. } => caption.as_deref(),
            Self::Voice { .. } => None,
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Text { .. } => None,
            Self::Image { attachment, .. }
            | Self::File { attachment, .. }
            | Self::Voice { attachment } => Some(attachment),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(body) = self.body() {
            if body.chars().count() > MAX_TEXT_LEN {
                return Err(ValidationError::TextTooLong { max: MAX_TEXT_LEN });
            }
        }

        match self {
            Self::Text { text } => {
                if text.trim().is_empty() {
                    return Err(ValidationError::Empty);
                }
                Ok(())
            }
            Self::Image { attachment, .. } => {
                attachment.validate()?;
                require_mime(MessageKind::Image, attachment, "image/")
            }
            Self::File { attachment, .. } => attachment.validate(),
            Self::Voice { attachment } => {
                attachment.validate()?;
                require_mime(MessageKind::Voice, attachment, "audio/")
            }
        }
    }

    /// Rebuild content from its flattened storage columns.
    pub fn from_parts(
        kind: MessageKind,
        body: Option<String>,
        attachment: Option<Attachment>,
    ) -> Result<Self, ValidationError> {
        let body = body.filter(|b| !b.is_empty());
        match (kind, attachment) {
            (MessageKind::Text, _) => Ok(Self::Text {
                text: body.ok_or(ValidationError::Empty)?,
            }),
            (MessageKind::Image, Some(attachment)) => Ok(Self::Image {
                attachment,
                caption: body,
            }),
            (MessageKind::File, Some(attachment)) => Ok(Self::File {
                attachment,
                caption: body,
            }),
            (MessageKind::Voice, Some(attachment)) => Ok(Self::Voice { attachment }),
            (_, None) => Err(ValidationError::Empty),
        }
    }
}

fn require_mime(
    kind: MessageKind,
    attachment: &Attachment,
    prefix: &str,
) -> Result<(), ValidationError> {
    if attachment.mime.starts_with(prefix) {
        Ok(())
    } else {
        Err(ValidationError::MimeMismatch {
            kind,
            mime: attachment.mime.clone(),
        })
    }
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Position of this message in its thread.
    pub fn cursor(&self) -> ThreadCursor {
        ThreadCursor {
            created_at_ms: self.created_at.timestamp_millis(),
            id: self.id,
        }
    }

    /// The other participant, from `viewer`'s point of view.
    pub fn partner_of(&self, viewer: Uuid) -> Uuid {
        if self.sender_id == viewer {
            self.recipient_id
        } else {
            self.sender_id
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id || self.recipient_id == user_id
    }

    /// Total thread order: `created_at`, tie-broken by `id`.
    pub fn thread_order(&self, other: &Self) -> Ordering {
        self.cursor().cmp(&other.cursor())
    }
}

/// Keyset position `(created_at, id)` inside a thread or a message scan.
///
/// Field order matters: the derived `Ord` is the thread order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThreadCursor {
    pub created_at_ms: i64,
    pub id: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed cursor '{0}'")]
pub struct CursorParseError(pub String);

impl fmt::Display for ThreadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.created_at_ms, self.id)
    }
}

impl FromStr for ThreadCursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CursorParseError(s.to_string());
        let (ms, id) = s.rsplit_once('-').ok_or_else(err)?;
        Ok(Self {
            created_at_ms: ms.parse().map_err(|_| err())?,
            id: id.parse().map_err(|_| err())?,
        })
    }
}

impl TryFrom<String> for ThreadCursor {
    type Error = CursorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThreadCursor> for String {
    fn from(cursor: ThreadCursor) -> Self {
        cursor.to_string()
    }
}

// -- Profiles & presence --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: Uuid,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

// -- Conversations --

/// Per-viewer summary of one direct conversation. Computed, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub partner_id: Uuid,
    pub partner_profile: Option<Profile>,
    pub last_message: Message,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
    pub is_hidden_for_viewer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<Conversation>,
    pub next_cursor: Option<ThreadCursor>,
    pub server_time: DateTime<Utc>,
}
