use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageContent, ThreadCursor};

// -- JWT Claims --

/// Identity claims issued by the external identity provider. Shared by the
/// REST middleware and the gateway upgrade so both agree on who the caller is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: MessageContent,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Thread window. With neither cursor set, the latest page is returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadQuery {
    /// Messages strictly older than this position.
    pub before: Option<ThreadCursor>,
    /// Messages strictly newer than this position.
    pub after: Option<ThreadCursor>,
    pub limit: Option<u32>,
}

impl ThreadQuery {
    pub fn effective_limit(&self) -> u32 {
        clamp_limit(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

// -- Conversations --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListConversationsQuery {
    pub cursor: Option<ThreadCursor>,
    pub limit: Option<u32>,
    /// Archive view: include conversations the viewer has hidden.
    #[serde(default)]
    pub include_hidden: bool,
}

impl ListConversationsQuery {
    pub fn effective_limit(&self) -> u32 {
        clamp_limit(self.limit)
    }
}

// -- Profiles --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub name: String,
    pub avatar_url: Option<String>,
}

/// `?ids=a,b,c`
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesQuery {
    pub ids: String,
}

// -- Attachments --

/// Upload metadata passed next to the raw body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAttachmentQuery {
    pub name: String,
    pub mime: String,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}
