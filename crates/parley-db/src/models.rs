/// Database row types. These map directly to SQLite rows and stay
/// distinct from the parley-types models to keep the DB layer independent.
use chrono::{DateTime, Utc};
use parley_types::models::{
    Attachment, ConversationId, Message, MessageContent, MessageKind,
};
use uuid::Uuid;

use crate::DbError;

pub(crate) const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, recipient_id, message_type, \
     content, attachment_url, attachment_name, attachment_size, attachment_mime, created_at, is_read";

pub struct MessageRow {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub message_type: String,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_size: Option<i64>,
    pub attachment_mime: Option<String>,
    pub created_at: i64,
    pub is_read: bool,
}

impl MessageRow {
    /// Reads a row selected with `MESSAGE_COLUMNS`.
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            recipient_id: row.get(3)?,
            message_type: row.get(4)?,
            content: row.get(5)?,
            attachment_url: row.get(6)?,
            attachment_name: row.get(7)?,
            attachment_size: row.get(8)?,
            attachment_mime: row.get(9)?,
            created_at: row.get(10)?,
            is_read: row.get(11)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = DbError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| DbError::Corrupt {
            id: row.id.to_string(),
            reason,
        };

        let kind: MessageKind = row
            .message_type
            .parse()
            .map_err(|e| corrupt(format!("{}", e)))?;

        let attachment = match (
            row.attachment_url.clone(),
            row.attachment_name.clone(),
            row.attachment_size,
            row.attachment_mime.clone(),
        ) {
            (Some(url), Some(name), Some(size), Some(mime)) => Some(Attachment {
                url,
                name,
                size: size.max(0) as u64,
                mime,
            }),
            _ => None,
        };

        let content = MessageContent::from_parts(kind, row.content.clone(), attachment)
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Message {
            id: row.id,
            conversation_id: ConversationId(parse_uuid(&row.conversation_id, row.id)?),
            sender_id: parse_uuid(&row.sender_id, row.id)?,
            recipient_id: parse_uuid(&row.recipient_id, row.id)?,
            content,
            created_at: from_millis(row.created_at, row.id)?,
            is_read: row.is_read,
        })
    }
}

/// A message flipped to read, with enough context to notify its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFlip {
    pub message_id: i64,
    pub sender_id: Uuid,
    pub conversation_id: ConversationId,
}

pub(crate) fn parse_uuid(raw: &str, row_id: impl ToString) -> Result<Uuid, DbError> {
    raw.parse().map_err(|e| DbError::Corrupt {
        id: row_id.to_string(),
        reason: format!("bad uuid '{}': {}", raw, e),
    })
}

pub(crate) fn from_millis(ms: i64, row_id: impl ToString) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| DbError::Corrupt {
        id: row_id.to_string(),
        reason: format!("timestamp out of range: {}", ms),
    })
}
