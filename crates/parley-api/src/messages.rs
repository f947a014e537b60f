use std::collections::BTreeMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use parley_db::models::ReadFlip;
use parley_gateway::Hub;
use parley_types::api::{Claims, MarkReadRequest, MarkReadResponse, SendMessageRequest, ThreadQuery};
use parley_types::events::ServerEvent;
use parley_types::models::{ConversationId, ValidationError};

use crate::error::ApiError;
use crate::state::{AppState, blocking};

/// Upper bound on ids accepted by one mark-read call.
const MAX_READ_BATCH: usize = 500;

/// POST /conversations/{partner_id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender_id = claims.sub;
    if sender_id == partner_id {
        return Err(ValidationError::SelfMessage.into());
    }
    req.content.validate()?;

    let content = req.content;
    let message = blocking(&state, move |s| {
        Ok(s.db.append_message(sender_id, partner_id, &content, Utc::now())?)
    })
    .await?;

    // A sent message ends the sender's typing burst.
    state.hub.typing.clear(message.conversation_id, sender_id);

    let delivered = state
        .hub
        .bus
        .publish_to_users(
            &[partner_id, sender_id],
            ServerEvent::MessageCreated {
                conversation_id: message.conversation_id,
                message: message.clone(),
            },
        )
        .await;
    info!(
        "{} -> {}: message {} ({}), {} sessions notified",
        sender_id,
        partner_id,
        message.id,
        message.content.kind().as_str(),
        delivered
    );

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /conversations/{partner_id}/messages?before&after&limit
pub async fn get_thread(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ThreadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.before.is_some() && query.after.is_some() {
        return Err(ApiError::BadRequest("use either before or after, not both".into()));
    }

    let viewer = claims.sub;
    let messages = blocking(&state, move |s| {
        Ok(s.db.fetch_thread(viewer, viewer, partner_id, &query)?)
    })
    .await?;

    Ok(Json(messages))
}

/// POST /messages/read
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message_ids.len() > MAX_READ_BATCH {
        return Err(ApiError::BadRequest(format!(
            "at most {} message ids per call",
            MAX_READ_BATCH
        )));
    }
    if req.message_ids.is_empty() {
        return Ok(Json(MarkReadResponse { updated: 0 }));
    }

    let reader_id = claims.sub;
    let ids = req.message_ids;
    let flips = blocking(&state, move |s| Ok(s.db.mark_read(&ids, reader_id)?)).await?;

    let updated = flips.len();
    publish_reads(&state.hub, reader_id, flips).await;

    Ok(Json(MarkReadResponse { updated }))
}

/// POST /conversations/{partner_id}/read
pub async fn mark_thread_read(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let reader_id = claims.sub;
    let flips = blocking(&state, move |s| {
        Ok(s.db.mark_thread_read(reader_id, partner_id)?)
    })
    .await?;

    let updated = flips.len();
    publish_reads(&state.hub, reader_id, flips).await;

    Ok(Json(MarkReadResponse { updated }))
}

/// Tell each sender which of their messages were read, and mirror the same
/// event to the reader's other devices.
pub(crate) async fn publish_reads(hub: &Hub, reader_id: Uuid, flips: Vec<ReadFlip>) {
    let mut grouped: BTreeMap<(ConversationId, Uuid), Vec<i64>> = BTreeMap::new();
    for flip in flips {
        grouped
            .entry((flip.conversation_id, flip.sender_id))
            .or_default()
            .push(flip.message_id);
    }

    for ((conversation_id, sender_id), message_ids) in grouped {
        debug!(
            "{} read {} messages from {}",
            reader_id,
            message_ids.len(),
            sender_id
        );
        hub.bus
            .publish_to_users(
                &[sender_id, reader_id],
                ServerEvent::MessageRead {
                    conversation_id,
                    reader_id,
                    message_ids,
                },
            )
            .await;
    }
}
