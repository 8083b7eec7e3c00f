use super::{SyncError, SyncOptions, SyncOutcome, SyncState};
use crate::dbs::{Storage, TieBreak};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::models::{
    Character, Chat, ErrorResponse, HealthResponse, HealthStatus, SyncCredentials, SyncPayload,
};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

pub struct SyncClient {
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
    pub(super) options: SyncOptions,
    in_flight: Mutex<()>,
    state: watch::Sender<SyncState>,
}

impl SyncClient {
    pub fn new(storage: Arc<dyn Storage>, options: SyncOptions) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.health_timeout)
            .build()?;
        let (state, _) = watch::channel(SyncState::Disabled);
        Ok(Self {
            storage,
            http,
            options,
            in_flight: Mutex::new(()),
            state,
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "sync state changed");
        }
    }

    /// Current endpoint, read from the stored config so edits apply on the next pass.
    async fn credentials(&self) -> Result<Option<SyncCredentials>, SyncError> {
        Ok(self.storage.get_config().await?.sync.credentials())
    }

    /// `true` only when the server answers `{"status":"ok"}` in time.
    pub async fn health_check(&self) -> bool {
        let creds = match self.credentials().await {
            Ok(Some(creds)) => creds,
            Ok(None) => {
                self.set_state(SyncState::Disabled);
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read sync settings");
                self.set_state(SyncState::Disabled);
                return false;
            }
        };

        self.set_state(SyncState::HealthChecking);
        let healthy = match self
            .http
            .get(format!("{}/api/health", creds.server_url))
            .bearer_auth(&creds.api_key)
            .timeout(self.options.health_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<HealthResponse>()
                .await
                .is_ok_and(|h| h.status == HealthStatus::Ok),
            Ok(response) => {
                tracing::warn!(status = %response.status(), "sync server unhealthy");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync server unreachable");
                false
            }
        };

        self.set_state(if healthy {
            SyncState::Idle
        } else {
            SyncState::Unreachable
        });
        healthy
    }

    /// Runs one sync pass unless another one is in progress.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("sync already in progress");
            return Ok(SyncOutcome::Skipped);
        };
        let Some(creds) = self.credentials().await? else {
            self.set_state(SyncState::Disabled);
            return Ok(SyncOutcome::Disabled);
        };

        self.set_state(SyncState::Syncing);
        let result = self.pass(&creds).await;
        self.set_state(SyncState::Idle);
        result.map(SyncOutcome::Completed)
    }

    async fn pass(&self, creds: &SyncCredentials) -> Result<crate::dbs::MergeReport, SyncError> {
        let local = self.storage.sync_snapshot().await?;
        tracing::debug!(
            characters = local.characters.len(),
            chats = local.chats.len(),
            "pushing local snapshot"
        );

        // the whole reply is decoded before local storage is touched
        let remote: SyncPayload = self.post_json(creds, "/api/sync", &local).await?;
        let report = self.storage.merge(remote, TieBreak::PreferIncoming).await?;
        tracing::info!(
            characters = report.characters_written,
            chats = report.chats_written,
            rejected = report.rejected.len(),
            "sync pass finished"
        );
        Ok(report)
    }

    pub async fn store_character(&self, character: &Character) -> Result<(), SyncError> {
        let creds = self.credentials().await?.ok_or(SyncError::Disabled)?;
        self.post_empty(&creds, "/api/character", character).await
    }

    pub async fn store_chat(&self, chat: &Chat) -> Result<(), SyncError> {
        let creds = self.credentials().await?.ok_or(SyncError::Disabled)?;
        self.post_empty(&creds, "/api/chat", chat).await
    }

    pub async fn fetch_characters(&self) -> Result<Vec<Character>, SyncError> {
        let creds = self.credentials().await?.ok_or(SyncError::Disabled)?;
        self.get_json(&creds, "/api/character").await
    }

    pub async fn fetch_chats(&self) -> Result<Vec<Chat>, SyncError> {
        let creds = self.credentials().await?.ok_or(SyncError::Disabled)?;
        self.get_json(&creds, "/api/chat").await
    }

    fn post(&self, creds: &SyncCredentials, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{path}", creds.server_url))
            .query(&[("client_id", creds.client_id.as_str())])
            .bearer_auth(&creds.api_key)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        creds: &SyncCredentials,
        path: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let response = self.post(creds, path).json(body).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post_empty<B: Serialize>(
        &self,
        creds: &SyncCredentials,
        path: &str,
        body: &B,
    ) -> Result<(), SyncError> {
        let response = self.post(creds, path).json(body).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        creds: &SyncCredentials,
        path: &str,
    ) -> Result<T, SyncError> {
        let response = self
            .http
            .get(format!("{}{path}", creds.server_url))
            .bearer_auth(&creds.api_key)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

/// Turns a non-2xx reply into `SyncError::Server`, keeping the server's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    Err(SyncError::Server {
        status: status.as_u16(),
        message,
    })
}
