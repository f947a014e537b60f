use axum::{
    Extension,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use parley_gateway::connection;
use parley_types::api::Claims;

use crate::state::AppState;

/// GET /gateway: realtime subscription. Identity was checked by the auth
/// layer before the upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, hub, claims.sub, claims.username)
    })
}
