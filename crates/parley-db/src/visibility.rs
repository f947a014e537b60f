use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parley_types::models::ConversationId;
use rusqlite::params_from_iter;
use uuid::Uuid;

use crate::error::OptionalExt;
use crate::models::parse_uuid;
use crate::{Database, DbError, placeholders};

impl Database {
    /// Hide `conversation_id` for `user_id` only. The partner's row is never read or written.
    pub fn hide_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO conversation_visibility (conversation_id, user_id, deleted_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET deleted_at = excluded.deleted_at",
                rusqlite::params![
                    conversation_id.to_string(),
                    user_id.to_string(),
                    now.timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    pub fn unhide_conversation(&self, conversation_id: ConversationId, user_id: Uuid) -> Result<(), DbError> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE conversation_visibility SET deleted_at = NULL
                 WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![conversation_id.to_string(), user_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn is_hidden(&self, conversation_id: ConversationId, user_id: Uuid) -> Result<bool, DbError> {
        self.with_conn(|conn| {
            let deleted_at: Option<Option<i64>> = conn
                .query_row(
                    "SELECT deleted_at FROM conversation_visibility
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    rusqlite::params![conversation_id.to_string(), user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(matches!(deleted_at, Some(Some(_))))
        })
    }

    /// Which of `conversation_ids` are hidden for `user_id`, in one query.
    pub fn hidden_conversations(
        &self,
        user_id: Uuid,
        conversation_ids: &[ConversationId],
    ) -> Result<HashSet<ConversationId>, DbError> {
        if conversation_ids.is_empty() {
            return Ok(HashSet::new());
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT conversation_id FROM conversation_visibility
                 WHERE user_id = ?1 AND deleted_at IS NOT NULL AND conversation_id IN ({})",
                placeholders(2, conversation_ids.len())
            );
            let mut params = vec![user_id.to_string()];
            params.extend(conversation_ids.iter().map(ConversationId::to_string));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|raw| Ok(ConversationId(parse_uuid(raw, "visibility")?)))
                .collect()
        })
    }
}
