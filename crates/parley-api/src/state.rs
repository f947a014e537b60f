use std::sync::Arc;

use tracing::error;

use parley_db::Database;
use parley_gateway::Hub;

use crate::attachments::AttachmentStore;
use crate::error::ApiError;
use crate::index::IndexConfig;
use crate::profiles::ProfileDirectory;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub hub: Hub,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub attachments: AttachmentStore,
    pub jwt_secret: String,
    pub index: IndexConfig,
}

/// Run blocking DB work off the async runtime.
pub async fn blocking<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppStateInner) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::internal(e)
        })?
}
