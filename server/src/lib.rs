mod auth;
mod error;
mod handlers;

pub use error::{ApiError, ApiResult};

use crate::handlers::{
    get_chat, health, list_characters, list_chats, store_character, store_chat, sync_all,
};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use backend::Storage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Default port of the sync server.
pub const DEFAULT_PORT: u16 = 4041;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub api_key: Arc<str>,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, api_key: impl Into<Arc<str>>) -> Self {
        Self {
            storage,
            api_key: api_key.into(),
        }
    }
}

pub fn init(router: Router<AppState>, state: AppState) -> Router<()> {
    router
        .route("/api/health", get(health))
        .route("/api/sync", post(sync_all))
        .route("/api/character", get(list_characters).post(store_character))
        .route("/api/chat", get(list_chats).post(store_chat))
        .route("/api/chat/{chat_id}", get(get_chat))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the sync API on `listener` until the process stops.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let router = init(Router::new(), state);
    tracing::info!(addr = ?listener.local_addr().ok(), "sync server listening");
    axum::serve(listener, router).await
}
