use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_types::api::Claims;

use crate::error::ApiError;
use crate::state::AppState;

/// POST /presence/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> StatusCode {
    state.hub.heartbeat(claims.sub).await;
    StatusCode::NO_CONTENT
}

/// GET /users/{user_id}/presence
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    Json(state.hub.presence.state(user_id))
}

/// POST /conversations/{partner_id}/typing
///
/// Accepted even when debounced; the partner just doesn't get a second push.
pub async fn start_typing(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    if claims.sub == partner_id {
        return Err(ApiError::BadRequest("cannot type to yourself".into()));
    }
    state.hub.start_typing(claims.sub, partner_id).await;
    Ok(StatusCode::ACCEPTED)
}
