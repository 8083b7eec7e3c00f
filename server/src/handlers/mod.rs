mod characters;
mod chats;
mod sync;

pub use characters::{list_characters, store_character};
pub use chats::{get_chat, list_chats, store_chat};
pub use sync::sync_all;

use axum::Json;
use serde::Deserialize;
use shared::models::{HealthResponse, HealthStatus};

/// Identifies the device a push came from; only used for logging.
#[derive(Debug, Deserialize)]
pub struct ClientIdQuery {
    pub client_id: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Ok,
    })
}
