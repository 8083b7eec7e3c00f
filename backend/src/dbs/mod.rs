use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::ValidationError;
use shared::models::{
    Character, Chat, ChatHistoryItem, Config, ConfigDefaults, NewCharacter, NewChat, SyncPayload,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod local;
pub mod merge;
mod migrations;
pub mod sqlite;

pub use local::LocalStorage;
pub use merge::TieBreak;
pub use sqlite::SqliteStorage;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Clone, Debug)]
pub enum StorageConfig {
    /// Single JSON document on disk
    Local { path: PathBuf },
    /// Embedded SQLite database
    Sqlite { path: PathBuf },
}

impl StorageConfig {
    pub fn path(&self) -> &Path {
        match self {
            StorageConfig::Local { path } | StorageConfig::Sqlite { path } => path,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid data: {0}")]
    Validation(#[from] ValidationError),
    #[error("Stored data does not match the expected shape: {0}")]
    SchemaMismatch(String),
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("File error: {0}")]
    File(#[from] std::io::Error),
}

impl StorageError {
    /// Transient faults worth retrying; everything else needs the caller's attention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Sqlx(_) | StorageError::File(_))
    }

    pub(crate) fn character_not_found(id: Uuid) -> Self {
        StorageError::NotFound(format!("Character {id}"))
    }

    pub(crate) fn chat_not_found(id: Uuid) -> Self {
        StorageError::NotFound(format!("Chat {id}"))
    }
}

/// What happens to a character's chats when the character is deleted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CascadePolicy {
    /// Chats stay in place and are no longer reachable from the character
    #[default]
    Orphan,
    /// Chats are deleted with the character
    Cascade,
}

#[derive(Clone)]
pub struct StorageOptions {
    pub defaults: ConfigDefaults,
    pub cascade: CascadePolicy,
    pub clock: Arc<dyn Clock>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            defaults: ConfigDefaults::for_host(),
            cascade: CascadePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// A single entity left out of a merge.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejected {
    pub id: Uuid,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeReport {
    pub characters_written: usize,
    pub chats_written: usize,
    pub rejected: Vec<Rejected>,
}

impl MergeReport {
    pub fn written(&self) -> usize {
        self.characters_written + self.chats_written
    }
}

/// A character a batch insert could not store, with the reason.
#[derive(Debug)]
pub struct PersistFailure {
    pub uuid: Uuid,
    pub error: StorageError,
}

/// Outcome of `Storage::persist_characters`. Items fail one by one; the rest are stored.
#[derive(Debug, Default)]
pub struct PersistReport {
    pub created: Vec<Character>,
    pub failed: Vec<PersistFailure>,
}

impl PersistReport {
    /// Validates every item, recording the invalid ones, and returns the rest.
    pub(crate) fn validate(&mut self, characters: Vec<NewCharacter>) -> Vec<NewCharacter> {
        characters
            .into_iter()
            .filter(|new| match new.validate() {
                Ok(()) => true,
                Err(e) => {
                    self.fail(new.uuid, e.into());
                    false
                }
            })
            .collect()
    }

    pub(crate) fn fail(&mut self, uuid: Uuid, error: StorageError) {
        tracing::debug!(%uuid, error = %error, "character not persisted");
        self.failed.push(PersistFailure { uuid, error });
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_character(&self, id: Uuid) -> StorageResult<Option<Character>>;
    async fn list_characters(&self) -> StorageResult<Vec<Character>>;
    /// Inserts each character with its caller-minted uuid. An invalid name or a taken
    /// uuid fails only that item; `Err` is reserved for faults of the store itself.
    async fn persist_characters(
        &self,
        characters: Vec<NewCharacter>,
    ) -> StorageResult<PersistReport>;
    /// Whether a live character other than `exclude_id` already uses `uuid` or `name`.
    async fn character_exists(
        &self,
        name: &str,
        uuid: Uuid,
        exclude_id: Option<Uuid>,
    ) -> StorageResult<bool>;
    async fn update_character(&self, character: Character) -> StorageResult<Character>;
    async fn delete_character(&self, id: Uuid) -> StorageResult<()>;

    async fn save_new_chat(&self, chat: NewChat) -> StorageResult<Uuid>;
    async fn get_chat(&self, id: Uuid) -> StorageResult<Option<Chat>>;
    async fn update_chat_history(
        &self,
        id: Uuid,
        history: Vec<ChatHistoryItem>,
    ) -> StorageResult<()>;
    async fn update_chat_title(&self, id: Uuid, title: Option<String>) -> StorageResult<()>;
    async fn set_chat_archived(&self, id: Uuid, archived: bool) -> StorageResult<()>;
    async fn delete_chat(&self, id: Uuid) -> StorageResult<()>;
    async fn list_chats_for_character(
        &self,
        character_id: Uuid,
        archived: Option<bool>,
    ) -> StorageResult<Vec<Chat>>;
    async fn list_archived_chats(&self) -> StorageResult<Vec<Chat>>;
    async fn list_all_chats(&self) -> StorageResult<Vec<Chat>>;

    async fn get_config(&self) -> StorageResult<Config>;
    async fn save_config(&self, config: &Config) -> StorageResult<()>;

    /// Writes a consistent copy of the store next to it and returns its path.
    async fn backup_database(&self) -> StorageResult<PathBuf>;

    /// Every character and chat, tombstones included.
    async fn sync_snapshot(&self) -> StorageResult<SyncPayload>;
    /// Applies incoming entities in one write, last writer wins.
    async fn merge(&self, incoming: SyncPayload, ties: TieBreak) -> StorageResult<MergeReport>;

    async fn close(&self);
}

pub async fn open(config: &StorageConfig, options: StorageOptions) -> StorageResult<Arc<dyn Storage>> {
    tracing::info!(path = %config.path().display(), "opening storage");
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Local { path } => Arc::new(LocalStorage::open(path, options).await?),
        StorageConfig::Sqlite { path } => Arc::new(SqliteStorage::open(path, options).await?),
    };
    Ok(storage)
}

/// `<stem>-<timestamp>.backup.<ext>` next to `path`.
pub(crate) fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("store");
    let timestamp = now.format("%Y-%m-%dT%H-%M-%S%.3fZ");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{timestamp}.backup.{ext}"),
        None => format!("{stem}-{timestamp}.backup"),
    };
    path.with_file_name(name)
}

/// Case-insensitive by name, with exact name and uuid as tie breakers so the order is stable.
pub(crate) fn sort_characters(characters: &mut [Character]) {
    characters.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.uuid.cmp(&b.uuid))
    });
}

pub(crate) fn sort_chats(chats: &mut [Chat]) {
    chats.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
