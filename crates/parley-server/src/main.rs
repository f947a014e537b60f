mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::attachments::AttachmentStore;
use parley_api::index::IndexConfig;
use parley_api::profiles::SqliteProfileDirectory;
use parley_api::{AppState, AppStateInner};
use parley_db::Database;
use parley_gateway::Hub;
use parley_gateway::presence::PresenceTracker;
use parley_gateway::sweeper;
use parley_gateway::typing::{DEFAULT_TYPING_DEBOUNCE, TypingIndicators};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Realtime state
    let hub = Hub::new(
        PresenceTracker::new(config.presence_ttl),
        TypingIndicators::new(config.typing_ttl, DEFAULT_TYPING_DEBOUNCE),
    );
    tokio::spawn(sweeper::run_sweeper(hub.clone(), config.sweep_interval));

    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        hub,
        profiles: Arc::new(SqliteProfileDirectory::new(db)),
        attachments: AttachmentStore::new(&config.attachment_dir, &config.public_url),
        jwt_secret: config.jwt_secret.clone(),
        index: IndexConfig::default(),
    });

    let app = parley_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Parley server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
