use super::ClientIdQuery;
use crate::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use backend::dbs::TieBreak;
use shared::models::{Character, SyncPayload};

/// Every character the server knows, tombstones included.
pub async fn list_characters(State(state): State<AppState>) -> ApiResult<Json<Vec<Character>>> {
    let snapshot = state.storage.sync_snapshot().await?;
    Ok(Json(snapshot.characters))
}

pub async fn store_character(
    State(state): State<AppState>,
    Query(query): Query<ClientIdQuery>,
    Json(character): Json<Character>,
) -> ApiResult<StatusCode> {
    let report = state
        .storage
        .merge(
            SyncPayload {
                characters: vec![character],
                chats: Vec::new(),
            },
            TieBreak::PreferExisting,
        )
        .await?;
    if let Some(rejected) = report.rejected.into_iter().next() {
        return Err(ApiError::BadRequest(rejected.reason));
    }
    tracing::debug!(client_id = %query.client_id, written = report.characters_written, "character stored");
    Ok(StatusCode::NO_CONTENT)
}
