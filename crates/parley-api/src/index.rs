use std::collections::{HashMap, HashSet};

use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::{Claims, ListConversationsQuery};
use parley_types::models::{Conversation, ConversationId, ConversationPage, Message, Profile};

use crate::error::ApiError;
use crate::profiles::ProfileDirectory;
use crate::state::{AppState, blocking};

/// Bounds for one conversation-list computation.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Messages pulled from the ledger per scan step.
    pub scan_batch: u32,
    /// Hard ceiling on messages examined for one page.
    pub max_scan: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            scan_batch: 200,
            max_scan: 5000,
        }
    }
}

/// Fold the viewer's messages into one summary per partner.
///
/// The scan walks the ledger newest first from `query.cursor`, so the first
/// message seen for a partner is that conversation's latest below the cursor.
/// Partners with any message at or after the cursor were served by an earlier
/// page and are skipped. Hidden filtering runs after grouping: a hide is only
/// ever cleared by a new message, and that message is what the grouping picks
/// up.
///
/// A page cut short by `max_scan` still carries a `next_cursor`: the scan
/// position, so the next call resumes below it.
///
/// Visibility and earlier-page checks are looked up once per scan batch.
/// Unread counts and profiles are one batched call each for the whole page.
pub fn list_conversations(
    db: &Database,
    profiles: &dyn ProfileDirectory,
    viewer: Uuid,
    query: &ListConversationsQuery,
    config: &IndexConfig,
) -> Result<ConversationPage, ApiError> {
    let server_time = Utc::now();
    let limit = query.effective_limit() as usize;

    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut surfaced: Vec<(Message, bool)> = Vec::with_capacity(limit);
    let mut scanned = 0usize;
    let mut before = query.cursor;
    let mut exhausted = false;

    while surfaced.len() < limit && scanned < config.max_scan {
        let batch = db.scan_viewer_messages(viewer, before, config.scan_batch)?;
        exhausted = batch.len() < config.scan_batch as usize;
        scanned += batch.len();
        if let Some(last) = batch.last() {
            before = Some(last.cursor());
        }

        let mut latest: Vec<Message> = batch
            .into_iter()
            .filter(|message| seen.insert(message.partner_of(viewer)))
            .collect();

        if let Some(cursor) = query.cursor {
            let ids: Vec<ConversationId> = latest.iter().map(|m| m.conversation_id).collect();
            let served = db.active_since(&ids, cursor)?;
            latest.retain(|m| !served.contains(&m.conversation_id));
        }

        if !latest.is_empty() {
            let ids: Vec<ConversationId> = latest.iter().map(|m| m.conversation_id).collect();
            let hidden = db.hidden_conversations(viewer, &ids)?;
            for message in latest {
                let is_hidden = hidden.contains(&message.conversation_id);
                if is_hidden && !query.include_hidden {
                    continue;
                }
                surfaced.push((message, is_hidden));
            }
        }

        if exhausted {
            break;
        }
    }

    let cut_short = !exhausted && surfaced.len() < limit;
    if cut_short {
        debug!("conversation scan for {} stopped at {} messages", viewer, scanned);
    }

    surfaced.truncate(limit);
    let partners: Vec<Uuid> = surfaced.iter().map(|(m, _)| m.partner_of(viewer)).collect();

    let unread = db.unread_counts(viewer, &partners)?;
    let mut directory = fetch_profiles(profiles, &partners);

    let mut conversations: Vec<Conversation> = surfaced
        .into_iter()
        .map(|(message, is_hidden)| {
            let partner_id = message.partner_of(viewer);
            Conversation {
                conversation_id: message.conversation_id,
                partner_id,
                partner_profile: directory.remove(&partner_id),
                last_message_time: message.created_at,
                unread_count: unread.get(&partner_id).copied().unwrap_or(0),
                is_hidden_for_viewer: is_hidden,
                last_message: message,
            }
        })
        .collect();

    conversations.sort_by(|a, b| b.last_message.thread_order(&a.last_message));

    let next_cursor = if conversations.len() == limit {
        conversations.last().map(|c| c.last_message.cursor())
    } else if cut_short {
        before
    } else {
        None
    };

    Ok(ConversationPage {
        conversations,
        next_cursor,
        server_time,
    })
}

/// Profiles are display data: a directory outage degrades the listing
/// instead of failing it.
fn fetch_profiles(profiles: &dyn ProfileDirectory, partners: &[Uuid]) -> HashMap<Uuid, Profile> {
    if partners.is_empty() {
        return HashMap::new();
    }
    match profiles.profiles(partners) {
        Ok(found) => found.into_iter().map(|p| (p.user_id, p)).collect(),
        Err(e) => {
            warn!("profile lookup for {} partners failed: {:#}", partners.len(), e);
            HashMap::new()
        }
    }
}

/// GET /conversations?cursor&limit&include_hidden
pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let viewer = claims.sub;
    let page = blocking(&state, move |s| {
        list_conversations(&s.db, s.profiles.as_ref(), viewer, &query, &s.index)
    })
    .await?;

    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Duration, TimeZone};
    use parley_types::models::MessageContent;

    use super::*;
    use crate::profiles::SqliteProfileDirectory;

    struct CountingDirectory {
        inner: SqliteProfileDirectory,
        calls: AtomicUsize,
    }

    impl ProfileDirectory for CountingDirectory {
        fn profiles(&self, user_ids: &[Uuid]) -> anyhow::Result<Vec<Profile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.profiles(user_ids)
        }
    }

    struct FailingDirectory;

    impl ProfileDirectory for FailingDirectory {
        fn profiles(&self, _: &[Uuid]) -> anyhow::Result<Vec<Profile>> {
            anyhow::bail!("directory offline")
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn setup() -> (Arc<Database>, CountingDirectory) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let directory = CountingDirectory {
            inner: SqliteProfileDirectory::new(db.clone()),
            calls: AtomicUsize::new(0),
        };
        (db, directory)
    }

    fn send(db: &Database, from: Uuid, to: Uuid, text: &str, at: DateTime<Utc>) -> Message {
        db.append_message(from, to, &MessageContent::text(text), at).unwrap()
    }

    fn list(db: &Database, dir: &dyn ProfileDirectory, viewer: Uuid) -> ConversationPage {
        list_conversations(db, dir, viewer, &ListConversationsQuery::default(), &IndexConfig::default())
            .unwrap()
    }

    #[test]
    fn thread_scenario_reports_latest_message_and_unread() {
        let (db, dir) = setup();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        send(&db, a, b, "hi", t(0));
        let hello = send(&db, b, a, "hello", t(1));

        let page = list(&db, &dir, a);
        assert_eq!(page.conversations.len(), 1);
        let conv = &page.conversations[0];
        assert_eq!(conv.partner_id, b);
        assert_eq!(conv.last_message.content, MessageContent::text("hello"));
        assert_eq!(conv.unread_count, 1);

        db.mark_read(&[hello.id], a).unwrap();
        assert_eq!(list(&db, &dir, a).conversations[0].unread_count, 0);
    }

    #[test]
    fn one_directory_call_per_listing() {
        let (db, dir) = setup();
        let viewer = Uuid::new_v4();
        for i in 0..10 {
            let partner = Uuid::new_v4();
            db.upsert_profile(
                &Profile {
                    user_id: partner,
                    name: format!("partner {}", i),
                    avatar_url: None,
                },
                t(0),
            )
            .unwrap();
            send(&db, partner, viewer, "ping", t(i));
        }

        let page = list(&db, &dir, viewer);
        assert_eq!(page.conversations.len(), 10);
        assert!(page.conversations.iter().all(|c| c.partner_profile.is_some()));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ordered_newest_first() {
        let (db, dir) = setup();
        let viewer = Uuid::new_v4();
        let (old, mid, new) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&db, viewer, old, "1", t(0));
        send(&db, mid, viewer, "2", t(5));
        send(&db, viewer, new, "3", t(10));
        send(&db, old, viewer, "4", t(15));

        let partners: Vec<Uuid> = list(&db, &dir, viewer)
            .conversations
            .iter()
            .map(|c| c.partner_id)
            .collect();
        assert_eq!(partners, vec![old, new, mid]);
    }

    #[test]
    fn hiding_is_per_participant() {
        let (db, dir) = setup();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        send(&db, b, a, "one", t(0));
        send(&db, b, a, "two", t(1));
        db.hide_conversation(ConversationId::between(a, b), a, t(2)).unwrap();

        assert!(list(&db, &dir, a).conversations.is_empty());

        // B's list is untouched, and so is the unread count B's messages carry for A.
        let b_view = list(&db, &dir, b);
        assert_eq!(b_view.conversations.len(), 1);
        assert!(!b_view.conversations[0].is_hidden_for_viewer);
        assert_eq!(db.unread_count(a, b).unwrap(), 2);

        // B can still write, and A's list resurfaces it.
        send(&db, b, a, "three", t(3));
        let a_view = list(&db, &dir, a);
        assert_eq!(a_view.conversations.len(), 1);
        assert_eq!(a_view.conversations[0].unread_count, 3);
        assert!(!a_view.conversations[0].is_hidden_for_viewer);
    }

    #[test]
    fn hidden_conversation_does_not_block_older_ones() {
        let (db, dir) = setup();
        let (viewer, loud, quiet) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&db, quiet, viewer, "older", t(0));
        send(&db, loud, viewer, "newer", t(1));
        db.hide_conversation(ConversationId::between(viewer, loud), viewer, t(2)).unwrap();

        let page = list(&db, &dir, viewer);
        assert_eq!(page.conversations.len(), 1);
        assert_eq!(page.conversations[0].partner_id, quiet);
    }

    #[test]
    fn archive_view_flags_hidden_conversations() {
        let (db, dir) = setup();
        let (viewer, p1, p2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&db, p1, viewer, "a", t(0));
        send(&db, p2, viewer, "b", t(1));
        db.hide_conversation(ConversationId::between(viewer, p1), viewer, t(2)).unwrap();

        let query = ListConversationsQuery {
            include_hidden: true,
            ..Default::default()
        };
        let page = list_conversations(&db, &dir, viewer, &query, &IndexConfig::default()).unwrap();
        assert_eq!(page.conversations.len(), 2);
        let hidden: Vec<_> = page
            .conversations
            .iter()
            .filter(|c| c.is_hidden_for_viewer)
            .map(|c| c.partner_id)
            .collect();
        assert_eq!(hidden, vec![p1]);
    }

    #[test]
    fn cursor_pages_cover_every_partner_once() {
        let (db, dir) = setup();
        let viewer = Uuid::new_v4();
        let partners: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        // Several messages per partner so batches split conversations.
        for round in 0..3 {
            for (i, p) in partners.iter().enumerate() {
                send(&db, *p, viewer, "x", t(round * 10 + i as i64));
            }
        }

        let config = IndexConfig {
            scan_batch: 2,
            max_scan: 1000,
        };
        let mut collected = Vec::new();
        let mut cursor = None;
        loop {
            let query = ListConversationsQuery {
                cursor,
                limit: Some(2),
                include_hidden: false,
            };
            let page = list_conversations(&db, &dir, viewer, &query, &config).unwrap();
            collected.extend(page.conversations.iter().map(|c| c.partner_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let expected: Vec<Uuid> = partners.iter().rev().copied().collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn busy_thread_past_the_scan_ceiling_does_not_bury_older_conversations() {
        let (db, dir) = setup();
        let (viewer, quiet, busy) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&db, quiet, viewer, "long ago", t(0));
        for i in 0..6 {
            send(&db, busy, viewer, "again", t(10 + i));
        }

        let config = IndexConfig {
            scan_batch: 2,
            max_scan: 4,
        };
        let mut collected = Vec::new();
        let mut cursor = None;
        for _ in 0..10 {
            let query = ListConversationsQuery {
                cursor,
                limit: None,
                include_hidden: false,
            };
            let page = list_conversations(&db, &dir, viewer, &query, &config).unwrap();
            collected.extend(page.conversations.iter().map(|c| c.partner_id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(collected, vec![busy, quiet]);
    }

    #[test]
    fn directory_failure_degrades_to_missing_profiles() {
        let (db, _) = setup();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        send(&db, a, b, "hi", t(0));

        let page = list(&db, &FailingDirectory, a);
        assert_eq!(page.conversations.len(), 1);
        assert!(page.conversations[0].partner_profile.is_none());
    }

    #[test]
    fn empty_ledger_lists_nothing() {
        let (db, dir) = setup();
        let page = list(&db, &dir, Uuid::new_v4());
        assert!(page.conversations.is_empty());
        assert!(page.next_cursor.is_none());
        assert_eq!(dir.calls.load(Ordering::SeqCst), 0);
    }
}
