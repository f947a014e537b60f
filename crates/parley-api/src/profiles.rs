use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::{Claims, ProfilesQuery, UpdateProfileRequest};
use parley_types::models::Profile;

use crate::error::ApiError;
use crate::state::{AppState, blocking};

const MAX_NAME_LEN: usize = 64;
const MAX_PROFILE_BATCH: usize = 200;

/// Identity collaborator: display data for a batch of users.
///
/// Always called once per batch. Implementations should answer with a single
/// round trip; unknown ids are left out of the result.
pub trait ProfileDirectory: Send + Sync {
    fn profiles(&self, user_ids: &[Uuid]) -> anyhow::Result<Vec<Profile>>;
}

/// Directory backed by the local `profiles` mirror table.
pub struct SqliteProfileDirectory {
    db: Arc<Database>,
}

impl SqliteProfileDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl ProfileDirectory for SqliteProfileDirectory {
    fn profiles(&self, user_ids: &[Uuid]) -> anyhow::Result<Vec<Profile>> {
        Ok(self.db.get_profiles(user_ids)?)
    }
}

/// PUT /profiles/me: sync the caller's display data into the mirror.
pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "name must be 1..={} characters",
            MAX_NAME_LEN
        )));
    }

    let profile = Profile {
        user_id: claims.sub,
        name,
        avatar_url: req.avatar_url.filter(|u| !u.trim().is_empty()),
    };
    let stored = profile.clone();
    blocking(&state, move |s| {
        s.db.upsert_profile(&stored, chrono::Utc::now())?;
        Ok(())
    })
    .await?;

    Ok(Json(profile))
}

/// GET /profiles?ids=a,b,c
pub async fn get_profiles(
    State(state): State<AppState>,
    Query(query): Query<ProfilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ids = query
        .ids
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().parse::<Uuid>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(format!("bad user id: {}", e)))?;
    if ids.len() > MAX_PROFILE_BATCH {
        return Err(ApiError::BadRequest(format!(
            "at most {} ids per request",
            MAX_PROFILE_BATCH
        )));
    }

    let profiles = blocking(&state, move |s| {
        s.profiles.profiles(&ids).map_err(ApiError::internal)
    })
    .await?;

    Ok(Json(profiles))
}
