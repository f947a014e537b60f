use axum::{
    Extension,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::events::ServerEvent;
use parley_types::models::{ConversationId, ValidationError};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// POST /conversations/{partner_id}/hide
///
/// Hides the conversation for the caller only. The partner's view, unread
/// count and ability to send are untouched.
pub async fn hide(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    set_hidden(&state, claims.sub, partner_id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /conversations/{partner_id}/hide
pub async fn unhide(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, ApiError> {
    set_hidden(&state, claims.sub, partner_id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_hidden(
    state: &AppState,
    viewer: Uuid,
    partner_id: Uuid,
    hidden: bool,
) -> Result<(), ApiError> {
    if viewer == partner_id {
        return Err(ValidationError::SelfMessage.into());
    }
    let conversation_id = ConversationId::between(viewer, partner_id);

    blocking(state, move |s| {
        if hidden {
            s.db.hide_conversation(conversation_id, viewer, Utc::now())?;
        } else {
            s.db.unhide_conversation(conversation_id, viewer)?;
        }
        Ok(())
    })
    .await?;

    info!(
        "{} {} conversation {}",
        viewer,
        if hidden { "hid" } else { "unhid" },
        conversation_id
    );

    // Keep the caller's other devices in step.
    state
        .hub
        .bus
        .publish_to_user(
            viewer,
            ServerEvent::ConversationVisibility {
                conversation_id,
                partner_id,
                hidden,
            },
        )
        .await;
    Ok(())
}
