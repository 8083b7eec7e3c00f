use super::ClientIdQuery;
use crate::AppState;
use crate::error::ApiResult;
use axum::{
    Json,
    extract::{Query, State},
};
use backend::dbs::TieBreak;
use shared::models::SyncPayload;

/// Merges a client's full snapshot and answers with the resulting canonical view.
pub async fn sync_all(
    State(state): State<AppState>,
    Query(query): Query<ClientIdQuery>,
    Json(payload): Json<SyncPayload>,
) -> ApiResult<Json<SyncPayload>> {
    let report = state
        .storage
        .merge(payload, TieBreak::PreferExisting)
        .await?;
    tracing::info!(
        client_id = %query.client_id,
        characters = report.characters_written,
        chats = report.chats_written,
        rejected = report.rejected.len(),
        "client synced"
    );
    Ok(Json(state.storage.sync_snapshot().await?))
}
