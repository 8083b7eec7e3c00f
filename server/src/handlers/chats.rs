use super::ClientIdQuery;
use crate::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use backend::StorageError;
use backend::dbs::TieBreak;
use shared::models::{Chat, SyncPayload};
use uuid::Uuid;

pub async fn list_chats(State(state): State<AppState>) -> ApiResult<Json<Vec<Chat>>> {
    let snapshot = state.storage.sync_snapshot().await?;
    Ok(Json(snapshot.chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<Json<Chat>> {
    let chat = state
        .storage
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("Chat {chat_id}")))?;
    Ok(Json(chat))
}

pub async fn store_chat(
    State(state): State<AppState>,
    Query(query): Query<ClientIdQuery>,
    Json(chat): Json<Chat>,
) -> ApiResult<StatusCode> {
    let report = state
        .storage
        .merge(
            SyncPayload {
                characters: Vec::new(),
                chats: vec![chat],
            },
            TieBreak::PreferExisting,
        )
        .await?;
    if let Some(rejected) = report.rejected.into_iter().next() {
        return Err(ApiError::BadRequest(rejected.reason));
    }
    tracing::debug!(client_id = %query.client_id, written = report.chats_written, "chat stored");
    Ok(StatusCode::NO_CONTENT)
}
