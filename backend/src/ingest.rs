//! Turning character cards from outside sources into stored characters.

use crate::dbs::{Storage, StorageError};
use async_trait::async_trait;
use futures::future::join_all;
use shared::ValidationError;
use shared::models::{Character, CharacterPayload, NewCharacter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const AVATAR_DIR: &str = "avatars";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid character data: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Could not write avatar: {0}")]
    Avatar(#[from] std::io::Error),
}

/// Where character cards come from.
#[async_trait]
pub trait CharacterSource: Send + Sync {
    async fn fetch_character_from_url(&self, url: &str) -> Result<CharacterPayload, SourceError>;
    /// Reads the card embedded in an image, e.g. the metadata chunk of a PNG card.
    async fn extract_character_from_image(
        &self,
        image: &[u8],
    ) -> Result<CharacterPayload, SourceError>;
}

/// A card plus the image it came with, if any.
#[derive(Clone, Debug, Default)]
pub struct ImportedCharacter {
    pub payload: CharacterPayload,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct ImportFailure {
    /// The URL or position of the item that failed
    pub item: String,
    pub error: IngestError,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub created: Vec<Character>,
    pub failures: Vec<ImportFailure>,
}

impl ImportReport {
    fn fail(&mut self, item: impl Into<String>, error: impl Into<IngestError>) {
        let item = item.into();
        let error = error.into();
        tracing::warn!(%item, error = %error, "character import failed");
        self.failures.push(ImportFailure { item, error });
    }
}

/// Avatar files under `<root>/avatars`, referenced from characters by their
/// path relative to `root`.
#[derive(Clone, Debug)]
pub struct AvatarStore {
    root: PathBuf,
}

impl AvatarStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn relative_path(name: &str, uuid: uuid::Uuid, format: image::ImageFormat) -> String {
        let ext = format.extensions_str().first().copied().unwrap_or("img");
        format!("{AVATAR_DIR}/{}-{uuid}.{ext}", slug(name))
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(Path::new(relative))
    }

    pub async fn write(&self, relative: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "character".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct CharacterIngestor {
    storage: Arc<dyn Storage>,
    source: Arc<dyn CharacterSource>,
    avatars: AvatarStore,
}

impl CharacterIngestor {
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<dyn CharacterSource>,
        avatars: AvatarStore,
    ) -> Self {
        Self {
            storage,
            source,
            avatars,
        }
    }

    /// Stores each card. The row is written before its avatar file so a crash in
    /// between leaves a character with a missing image, never an orphan image.
    pub async fn create_from_imported_payloads(
        &self,
        items: Vec<ImportedCharacter>,
    ) -> ImportReport {
        let mut report = ImportReport::default();
        for (index, item) in items.into_iter().enumerate() {
            self.import_one(&mut report, format!("item {index}"), item, None)
                .await;
        }
        report
    }

    pub async fn create_from_images(&self, images: Vec<Vec<u8>>) -> ImportReport {
        let mut report = ImportReport::default();
        for (index, image) in images.into_iter().enumerate() {
            let label = format!("image {index}");
            match self.source.extract_character_from_image(&image).await {
                Ok(payload) => {
                    let item = ImportedCharacter {
                        payload,
                        image: Some(image),
                    };
                    self.import_one(&mut report, label, item, None).await;
                }
                Err(e) => report.fail(label, e),
            }
        }
        report
    }

    /// Fetches every URL concurrently; one bad URL never stops the others.
    pub async fn create_from_remote_urls(&self, urls: Vec<String>) -> ImportReport {
        let fetched = join_all(urls.into_iter().map(|url| async move {
            let result = self.source.fetch_character_from_url(&url).await;
            (url, result)
        }))
        .await;

        let mut report = ImportReport::default();
        for (url, result) in fetched {
            match result {
                Ok(payload) => {
                    let item = ImportedCharacter {
                        payload,
                        image: None,
                    };
                    self.import_one(&mut report, url.clone(), item, Some(url))
                        .await;
                }
                Err(e) => report.fail(url, e),
            }
        }
        report
    }

    async fn import_one(
        &self,
        report: &mut ImportReport,
        label: String,
        item: ImportedCharacter,
        source_url: Option<String>,
    ) {
        let ImportedCharacter { payload, image } = item;
        let mut new = NewCharacter::new(payload, source_url);
        if let Err(e) = new.validate() {
            report.fail(label, e);
            return;
        }

        let avatar = image.and_then(|bytes| match image::guess_format(&bytes) {
            Ok(format) => Some((AvatarStore::relative_path(&new.payload.name, new.uuid, format), bytes)),
            Err(e) => {
                tracing::debug!(item = %label, error = %e, "image not recognized, importing without avatar");
                new.payload.avatar = None;
                None
            }
        });
        if let Some((path, _)) = &avatar {
            new.payload.avatar = Some(path.clone());
        }

        let character = match self.storage.persist_characters(vec![new]).await {
            Ok(mut persisted) => match (persisted.created.pop(), persisted.failed.pop()) {
                (Some(character), _) => character,
                (None, Some(failure)) => {
                    report.fail(label, failure.error);
                    return;
                }
                (None, None) => return,
            },
            Err(e) => {
                report.fail(label, e);
                return;
            }
        };

        if let Some((path, bytes)) = avatar {
            if let Err(e) = self.avatars.write(&path, &bytes).await {
                report.fail(label, e);
            }
        }
        tracing::info!(uuid = %character.uuid, name = %character.name, "character imported");
        report.created.push(character);
    }
}
