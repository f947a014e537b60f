pub mod attachments;
pub mod conversations;
pub mod error;
pub mod gateway;
pub mod index;
pub mod messages;
pub mod middleware;
pub mod presence;
pub mod profiles;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post, put},
};

use parley_types::models::MAX_ATTACHMENT_SIZE;

pub use error::ApiError;
pub use state::{AppState, AppStateInner};

/// Every route requires a valid token.
pub fn router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/attachments", post(attachments::upload))
        .layer(DefaultBodyLimit::max(MAX_ATTACHMENT_SIZE as usize));

    Router::new()
        .route("/conversations", get(index::list))
        .route(
            "/conversations/{partner_id}/messages",
            get(messages::get_thread).post(messages::send_message),
        )
        .route("/conversations/{partner_id}/read", post(messages::mark_thread_read))
        .route(
            "/conversations/{partner_id}/hide",
            post(conversations::hide).delete(conversations::unhide),
        )
        .route("/conversations/{partner_id}/typing", post(presence::start_typing))
        .route("/messages/read", post(messages::mark_read))
        .route("/presence/heartbeat", post(presence::heartbeat))
        .route("/users/{user_id}/presence", get(presence::get_presence))
        .route("/profiles", get(profiles::get_profiles))
        .route("/profiles/me", put(profiles::update_me))
        .route("/attachments/{id}", get(attachments::download))
        .route("/gateway", get(gateway::ws_upgrade))
        .merge(uploads)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
