use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parley_types::api::ThreadQuery;
use parley_types::models::{ConversationId, Message, MessageContent, ThreadCursor, ValidationError};
use rusqlite::{Connection, params_from_iter, types::Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OptionalExt;
use crate::models::{MESSAGE_COLUMNS, MessageRow, ReadFlip, parse_uuid};
use crate::{Database, DbError, placeholders};

/// Conflicting appends are retried this many times before giving up.
const MAX_APPEND_ATTEMPTS: u32 = 3;

impl Database {
    // -- Append --

    /// Append a message and clear any hide marker on the conversation, in
    /// one transaction.
    ///
    /// The recipient's marker is always cleared, so a hide can never suppress
    /// later inbound traffic. The sender's own marker is cleared as well:
    /// writing into a conversation is an explicit intent to see it.
    pub fn append_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        content: &MessageContent,
        now: DateTime<Utc>,
    ) -> Result<Message, DbError> {
        if sender_id == recipient_id {
            return Err(ValidationError::SelfMessage.into());
        }
        content.validate()?;

        let mut attempt = 1;
        loop {
            // Re-derived on every attempt: the canonical id is the only
            // coordination point between two simultaneous first sends.
            let conversation_id = ConversationId::between(sender_id, recipient_id);
            let result = self.with_tx(|tx| {
                insert_and_unhide(tx, conversation_id, sender_id, recipient_id, content, now)
            });

            match result {
                Err(DbError::Conflict(e)) if attempt < MAX_APPEND_ATTEMPTS => {
                    warn!(
                        "append conflict in {} (attempt {}): {}",
                        conversation_id, attempt, e
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // -- Thread reads --

    /// One window of the thread between `user_a` and `user_b`, ascending by
    /// `(created_at, id)`. `viewer` must be one of the two.
    pub fn fetch_thread(
        &self,
        viewer: Uuid,
        user_a: Uuid,
        user_b: Uuid,
        query: &ThreadQuery,
    ) -> Result<Vec<Message>, DbError> {
        if viewer != user_a && viewer != user_b {
            return Err(DbError::NotParticipant);
        }
        let conversation_id = ConversationId::between(user_a, user_b);
        self.with_conn(|conn| query_thread(conn, conversation_id, query))
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>, DbError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
            let row = conn
                .query_row(&sql, [id], MessageRow::from_row)
                .optional()?;
            row.map(Message::try_from).transpose()
        })
    }

    // -- Read state --

    /// Flip `message_ids` to read for `reader_id`. Ids addressed to someone
    /// else, unknown ids and already-read messages are skipped silently.
    pub fn mark_read(&self, message_ids: &[i64], reader_id: Uuid) -> Result<Vec<ReadFlip>, DbError> {
        let mut ids = message_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_tx(|tx| {
            let sql = format!(
                "SELECT id, sender_id, conversation_id FROM messages
                 WHERE recipient_id = ?1 AND is_read = 0 AND id IN ({})",
                placeholders(2, ids.len())
            );
            let mut params: Vec<Value> = vec![Value::Text(reader_id.to_string())];
            params.extend(ids.iter().map(|id| Value::Integer(*id)));

            let flips = select_flips(tx, &sql, params)?;
            flip_to_read(tx, &flips)?;
            Ok(flips)
        })
    }

    /// Flip every unread message from `partner_id` to `reader_id`.
    pub fn mark_thread_read(&self, reader_id: Uuid, partner_id: Uuid) -> Result<Vec<ReadFlip>, DbError> {
        self.with_tx(|tx| {
            let sql = "SELECT id, sender_id, conversation_id FROM messages
                       WHERE recipient_id = ?1 AND sender_id = ?2 AND is_read = 0";
            let params = vec![
                Value::Text(reader_id.to_string()),
                Value::Text(partner_id.to_string()),
            ];

            let flips = select_flips(tx, sql, params)?;
            flip_to_read(tx, &flips)?;
            Ok(flips)
        })
    }

    // -- Index support --

    /// Messages sent or received by `viewer`, newest first, strictly older
    /// than `before` when given.
    pub fn scan_viewer_messages(
        &self,
        viewer: Uuid,
        before: Option<ThreadCursor>,
        limit: u32,
    ) -> Result<Vec<Message>, DbError> {
        self.with_conn(|conn| {
            let viewer = viewer.to_string();
            let rows = match before {
                Some(cursor) => {
                    let sql = format!(
                        "SELECT {} FROM messages
                         WHERE (sender_id = ?1 OR recipient_id = ?1)
                           AND (created_at, id) < (?2, ?3)
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?4",
                        MESSAGE_COLUMNS
                    );
                    collect_messages(
                        conn,
                        &sql,
                        rusqlite::params![viewer, cursor.created_at_ms, cursor.id, limit],
                    )?
                }
                None => {
                    let sql = format!(
                        "SELECT {} FROM messages
                         WHERE sender_id = ?1 OR recipient_id = ?1
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?2",
                        MESSAGE_COLUMNS
                    );
                    collect_messages(conn, &sql, rusqlite::params![viewer, limit])?
                }
            };
            Ok(rows)
        })
    }

    /// Unread counts for `viewer`, keyed by partner, in one grouped query.
    /// Partners with nothing unread are absent from the map.
    pub fn unread_counts(&self, viewer: Uuid, partners: &[Uuid]) -> Result<HashMap<Uuid, u32>, DbError> {
        if partners.is_empty() {
            return Ok(HashMap::new());
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT sender_id, COUNT(*) FROM messages
                 WHERE recipient_id = ?1 AND is_read = 0 AND sender_id IN ({})
                 GROUP BY sender_id",
                placeholders(2, partners.len())
            );
            let mut params = vec![viewer.to_string()];
            params.extend(partners.iter().map(Uuid::to_string));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(sender, count)| Ok((parse_uuid(&sender, "unread")?, count)))
                .collect()
        })
    }

    pub fn unread_count(&self, viewer: Uuid, partner: Uuid) -> Result<u32, DbError> {
        Ok(self
            .unread_counts(viewer, &[partner])?
            .get(&partner)
            .copied()
            .unwrap_or(0))
    }

    /// Which of `conversation_ids` hold a message at or after `since`.
    pub fn active_since(
        &self,
        conversation_ids: &[ConversationId],
        since: ThreadCursor,
    ) -> Result<HashSet<ConversationId>, DbError> {
        if conversation_ids.is_empty() {
            return Ok(HashSet::new());
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT DISTINCT conversation_id FROM messages
                 WHERE (created_at, id) >= (?1, ?2) AND conversation_id IN ({})",
                placeholders(3, conversation_ids.len())
            );
            let mut params: Vec<Value> = vec![
                Value::Integer(since.created_at_ms),
                Value::Integer(since.id),
            ];
            params.extend(conversation_ids.iter().map(|id| Value::Text(id.to_string())));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|raw| Ok(ConversationId(parse_uuid(raw, "active")?)))
                .collect()
        })
    }
}

fn insert_and_unhide(
    conn: &Connection,
    conversation_id: ConversationId,
    sender_id: Uuid,
    recipient_id: Uuid,
    content: &MessageContent,
    now: DateTime<Utc>,
) -> Result<Message, DbError> {
    let attachment = content.attachment();
    conn.execute(
        "INSERT INTO messages (conversation_id, sender_id, recipient_id, message_type, content,
             attachment_url, attachment_name, attachment_size, attachment_mime, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            conversation_id.to_string(),
            sender_id.to_string(),
            recipient_id.to_string(),
            content.kind().as_str(),
            content.body(),
            attachment.map(|a| a.url.as_str()),
            attachment.map(|a| a.name.as_str()),
            attachment.map(|a| a.size as i64),
            attachment.map(|a| a.mime.as_str()),
            now.timestamp_millis(),
        ],
    )?;
    let id = conn.last_insert_rowid();

    let unhidden = conn.execute(
        "UPDATE conversation_visibility SET deleted_at = NULL
         WHERE conversation_id = ?1 AND user_id IN (?2, ?3) AND deleted_at IS NOT NULL",
        rusqlite::params![
            conversation_id.to_string(),
            recipient_id.to_string(),
            sender_id.to_string()
        ],
    )?;
    if unhidden > 0 {
        debug!("append {} unhid {} visibility row(s) in {}", id, unhidden, conversation_id);
    }

    // Millisecond precision is what the row stores; hand back the same value.
    let created_at = crate::models::from_millis(now.timestamp_millis(), id)?;

    Ok(Message {
        id,
        conversation_id,
        sender_id,
        recipient_id,
        content: content.clone(),
        created_at,
        is_read: false,
    })
}

fn query_thread(
    conn: &Connection,
    conversation_id: ConversationId,
    query: &ThreadQuery,
) -> Result<Vec<Message>, DbError> {
    let mut clauses = vec!["conversation_id = ?1".to_string()];
    let mut params: Vec<Value> = vec![Value::Text(conversation_id.to_string())];

    if let Some(after) = query.after {
        clauses.push(format!(
            "(created_at, id) > (?{}, ?{})",
            params.len() + 1,
            params.len() + 2
        ));
        params.push(Value::Integer(after.created_at_ms));
        params.push(Value::Integer(after.id));
    }
    if let Some(before) = query.before {
        clauses.push(format!(
            "(created_at, id) < (?{}, ?{})",
            params.len() + 1,
            params.len() + 2
        ));
        params.push(Value::Integer(before.created_at_ms));
        params.push(Value::Integer(before.id));
    }

    // Forward paging reads oldest-first from the `after` bound; every other
    // window is the newest slice, flipped back to ascending below.
    let ascending = query.after.is_some();
    let order = if ascending { "ASC" } else { "DESC" };
    let sql = format!(
        "SELECT {} FROM messages WHERE {} ORDER BY created_at {}, id {} LIMIT ?{}",
        MESSAGE_COLUMNS,
        clauses.join(" AND "),
        order,
        order,
        params.len() + 1
    );
    params.push(Value::Integer(query.effective_limit() as i64));

    let mut messages = collect_messages(conn, &sql, params_from_iter(params))?;
    if !ascending {
        messages.reverse();
    }
    Ok(messages)
}

fn collect_messages<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Message>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, MessageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(Message::try_from).collect()
}

fn select_flips(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<ReadFlip>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, sender, conversation)| {
            Ok(ReadFlip {
                message_id: id,
                sender_id: parse_uuid(&sender, id)?,
                conversation_id: ConversationId(parse_uuid(&conversation, id)?),
            })
        })
        .collect()
}

fn flip_to_read(conn: &Connection, flips: &[ReadFlip]) -> Result<(), DbError> {
    if flips.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE messages SET is_read = 1 WHERE id IN ({})",
        placeholders(1, flips.len())
    );
    conn.execute(&sql, params_from_iter(flips.iter().map(|f| f.message_id)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn text(s: &str) -> MessageContent {
        MessageContent::text(s)
    }

    #[test]
    fn thread_is_ascending_and_shared_by_both_sides() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        db.append_message(a, b, &text("hi"), at(1_000)).unwrap();
        db.append_message(b, a, &text("hello"), at(2_000)).unwrap();

        let from_a = db.fetch_thread(a, a, b, &ThreadQuery::default()).unwrap();
        let from_b = db.fetch_thread(b, b, a, &ThreadQuery::default()).unwrap();

        let bodies: Vec<_> = from_a.iter().map(|m| m.content.body().unwrap()).collect();
        assert_eq!(bodies, ["hi", "hello"]);
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn same_millisecond_ties_break_on_id() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = db.append_message(a, b, &text("one"), at(5_000)).unwrap();
        let second = db.append_message(b, a, &text("two"), at(5_000)).unwrap();
        assert!(first.id < second.id);

        let thread = db.fetch_thread(a, a, b, &ThreadQuery::default()).unwrap();
        assert_eq!(thread[0].id, first.id);
        assert_eq!(thread[1].id, second.id);
    }

    #[test]
    fn outsiders_cannot_read_a_thread() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.append_message(a, b, &text("private"), at(1)).unwrap();

        let err = db.fetch_thread(c, a, b, &ThreadQuery::default()).unwrap_err();
        assert!(matches!(err, DbError::NotParticipant));
    }

    #[test]
    fn rejects_empty_and_self_messages() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = db.append_message(a, b, &text(""), at(1)).unwrap_err();
        assert!(matches!(err, DbError::Validation(ValidationError::Empty)));

        let err = db.append_message(a, a, &text("me"), at(1)).unwrap_err();
        assert!(matches!(err, DbError::Validation(ValidationError::SelfMessage)));
    }

    #[test]
    fn cursor_pages_are_stable_under_inserts() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..10 {
            db.append_message(a, b, &text(&format!("m{}", i)), at(1_000 + i))
                .unwrap();
        }

        let latest = db
            .fetch_thread(a, a, b, &ThreadQuery { limit: Some(4), ..Default::default() })
            .unwrap();
        assert_eq!(latest.first().unwrap().content.body(), Some("m6"));
        assert_eq!(latest.last().unwrap().content.body(), Some("m9"));

        // New traffic lands while the user scrolls back.
        db.append_message(b, a, &text("late"), at(9_999)).unwrap();

        let older = db
            .fetch_thread(
                a,
                a,
                b,
                &ThreadQuery {
                    before: Some(latest[0].cursor()),
                    limit: Some(4),
                    ..Default::default()
                },
            )
            .unwrap();
        let bodies: Vec<_> = older.iter().map(|m| m.content.body().unwrap()).collect();
        assert_eq!(bodies, ["m2", "m3", "m4", "m5"]);

        let newer = db
            .fetch_thread(
                a,
                a,
                b,
                &ThreadQuery {
                    after: Some(latest[3].cursor()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].content.body(), Some("late"));
    }

    #[test]
    fn mark_read_only_touches_the_readers_messages() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let to_b = db.append_message(a, b, &text("for b"), at(1)).unwrap();
        let to_a = db.append_message(b, a, &text("for a"), at(2)).unwrap();

        // a tries to read a message addressed to b: ignored, not an error.
        let flips = db.mark_read(&[to_b.id], a).unwrap();
        assert!(flips.is_empty());
        assert_eq!(db.unread_count(b, a).unwrap(), 1);

        let flips = db.mark_read(&[to_a.id, to_a.id, 9_999], a).unwrap();
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].sender_id, b);
        assert_eq!(db.unread_count(a, b).unwrap(), 0);

        // Second call is a no-op.
        assert!(db.mark_read(&[to_a.id], a).unwrap().is_empty());
    }

    #[test]
    fn mark_thread_read_clears_partner_backlog() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for i in 0..3 {
            db.append_message(b, a, &text("ping"), at(i)).unwrap();
        }
        db.append_message(c, a, &text("other"), at(10)).unwrap();

        let flips = db.mark_thread_read(a, b).unwrap();
        assert_eq!(flips.len(), 3);
        assert_eq!(db.unread_count(a, b).unwrap(), 0);
        assert_eq!(db.unread_count(a, c).unwrap(), 1);
    }

    #[test]
    fn attachments_round_trip_through_storage() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let content = MessageContent::Image {
            attachment: parley_types::models::Attachment {
                url: "/attachments/abc".into(),
                name: "cat.png".into(),
                size: 2048,
                mime: "image/png".into(),
            },
            caption: Some("look".into()),
        };

        let sent = db.append_message(a, b, &content, at(42)).unwrap();
        let stored = db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(stored, sent);
    }

    #[test]
    fn active_since_reports_conversations_with_later_traffic() {
        let db = Database::open_in_memory().unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        db.append_message(c, a, &text("early"), at(1_000)).unwrap();
        let marker = db.append_message(b, a, &text("middle"), at(2_000)).unwrap();
        db.append_message(b, a, &text("late"), at(3_000)).unwrap();

        let ab = ConversationId::between(a, b);
        let ac = ConversationId::between(a, c);
        let active = db.active_since(&[ab, ac], marker.cursor()).unwrap();
        assert!(active.contains(&ab));
        assert!(!active.contains(&ac));
        assert!(db.active_since(&[], marker.cursor()).unwrap().is_empty());
    }
}
