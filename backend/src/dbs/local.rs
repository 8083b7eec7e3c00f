use super::merge::{self, TieBreak};
use super::{
    CascadePolicy, MergeReport, PersistReport, Storage, StorageError, StorageOptions,
    StorageResult, backup_path, sort_characters, sort_chats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::models::*;
use shared::time::next_update;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

const FORMAT_VERSION: u32 = 1;

/// On-disk shape of the JSON store.
#[derive(Serialize, Deserialize, Default)]
struct StoredDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    characters: Vec<Value>,
    #[serde(default)]
    chats: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
}

/// A record that no longer decodes. It is written back untouched.
#[derive(Clone, Debug)]
struct Unreadable {
    id: Option<Uuid>,
    raw: Value,
}

#[derive(Clone, Debug, Default)]
pub struct LocalDatabase {
    characters: BTreeMap<Uuid, Character>,
    chats: BTreeMap<Uuid, Chat>,
    config: Option<Value>,
    unreadable_characters: Vec<Unreadable>,
    unreadable_chats: Vec<Unreadable>,
}

impl LocalDatabase {
    async fn load(path: &Path) -> StorageResult<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredDocument = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::SchemaMismatch(format!("{}: {e}", path.display())))?;
        if stored.version > FORMAT_VERSION {
            return Err(StorageError::SchemaMismatch(format!(
                "{} was written by a newer version (format {})",
                path.display(),
                stored.version
            )));
        }

        let mut db = Self {
            config: stored.config,
            ..Default::default()
        };
        for raw in stored.characters {
            match serde_json::from_value::<Character>(raw.clone()) {
                Ok(character) => {
                    db.characters.insert(character.uuid, character);
                }
                Err(e) => {
                    let id = raw_id(&raw, "uuid");
                    tracing::warn!(?id, error = %e, "keeping undecodable character as is");
                    db.unreadable_characters.push(Unreadable { id, raw });
                }
            }
        }
        for raw in stored.chats {
            match serde_json::from_value::<Chat>(raw.clone()) {
                Ok(chat) => {
                    db.chats.insert(chat.id, chat);
                }
                Err(e) => {
                    let id = raw_id(&raw, "id");
                    tracing::warn!(?id, error = %e, "keeping undecodable chat as is");
                    db.unreadable_chats.push(Unreadable { id, raw });
                }
            }
        }
        Ok(Some(db))
    }

    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        let characters = self
            .characters
            .values()
            .map(encode)
            .chain(self.unreadable_characters.iter().map(|u| Ok(u.raw.clone())))
            .collect::<StorageResult<Vec<_>>>()?;
        let chats = self
            .chats
            .values()
            .map(encode)
            .chain(self.unreadable_chats.iter().map(|u| Ok(u.raw.clone())))
            .collect::<StorageResult<Vec<_>>>()?;
        let stored = StoredDocument {
            version: FORMAT_VERSION,
            characters,
            chats,
            config: self.config.clone(),
        };
        serde_json::to_vec_pretty(&stored).map_err(|e| StorageError::SchemaMismatch(e.to_string()))
    }

    /// Writes the whole document to a temporary sibling and renames it over `path`.
    async fn save(&self, path: &Path) -> StorageResult<()> {
        let bytes = self.to_bytes()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn config(&self) -> StorageResult<Option<Config>> {
        self.config
            .as_ref()
            .map(|raw| decode::<Config>(raw, "config"))
            .transpose()
    }

    fn tombstones_enabled(&self) -> StorageResult<bool> {
        Ok(self.config()?.is_some_and(|c| c.sync.is_enabled()))
    }

    fn chat_count(&self, character_id: Uuid) -> usize {
        self.chats
            .values()
            .filter(|c| c.character_id == character_id && !c.archived && !c.is_deleted())
            .count()
    }

    fn with_count(&self, character: &Character) -> Character {
        Character {
            chat_count: self.chat_count(character.uuid),
            ..character.clone()
        }
    }

    fn live_character(&self, id: Uuid) -> StorageResult<Option<&Character>> {
        match self.characters.get(&id) {
            Some(c) if c.is_deleted() => Ok(None),
            Some(c) => Ok(Some(c)),
            None if self.unreadable_characters.iter().any(|u| u.id == Some(id)) => Err(
                StorageError::SchemaMismatch(format!("character {id} cannot be decoded")),
            ),
            None => Ok(None),
        }
    }

    fn live_chat(&self, id: Uuid) -> StorageResult<Option<&Chat>> {
        match self.chats.get(&id) {
            Some(c) if c.is_deleted() => Ok(None),
            Some(c) => Ok(Some(c)),
            None if self.unreadable_chats.iter().any(|u| u.id == Some(id)) => Err(
                StorageError::SchemaMismatch(format!("chat {id} cannot be decoded")),
            ),
            None => Ok(None),
        }
    }

    fn live_chat_mut(&mut self, id: Uuid) -> StorageResult<&mut Chat> {
        match self.chats.get_mut(&id) {
            Some(c) if !c.is_deleted() => Ok(c),
            _ => Err(StorageError::chat_not_found(id)),
        }
    }

    fn remove_chat(&mut self, id: Uuid, tombstone: bool, now: DateTime<Utc>) {
        if tombstone {
            if let Some(chat) = self.chats.get_mut(&id) {
                chat.deleted_at = Some(now);
                chat.updated_at = next_update(chat.updated_at, now);
            }
        } else {
            self.chats.remove(&id);
        }
    }

    fn put_character(&mut self, character: Character) {
        self.unreadable_characters
            .retain(|u| u.id != Some(character.uuid));
        self.characters.insert(character.uuid, character);
    }

    fn put_chat(&mut self, chat: Chat) {
        self.unreadable_chats.retain(|u| u.id != Some(chat.id));
        self.chats.insert(chat.id, chat);
    }
}

fn raw_id(raw: &Value, field: &str) -> Option<Uuid> {
    raw.get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn encode<T: Serialize>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value).map_err(|e| StorageError::SchemaMismatch(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &Value, what: &str) -> StorageResult<T> {
    serde_json::from_value(raw.clone())
        .map_err(|e| StorageError::SchemaMismatch(format!("{what}: {e}")))
}

/// Storage backed by a single JSON document.
///
/// Writers hold the lock across the file write and only replace the in-memory
/// copy once the new document is on disk, so a failed write leaves both unchanged.
pub struct LocalStorage {
    path: PathBuf,
    options: StorageOptions,
    db: RwLock<LocalDatabase>,
}

impl LocalStorage {
    pub async fn open(path: &Path, options: StorageOptions) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = match LocalDatabase::load(path).await? {
            Some(db) => db,
            None => {
                let db = LocalDatabase::default();
                db.save(path).await?;
                db
            }
        };
        tracing::debug!(
            characters = db.characters.len(),
            chats = db.chats.len(),
            "loaded json store"
        );
        Ok(Self {
            path: path.to_path_buf(),
            options,
            db: RwLock::new(db),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.options.clock.now()
    }

    /// Applies `change` to a copy of the document, persists it, then publishes it.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut LocalDatabase, DateTime<Utc>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.db.write().await;
        let mut next = guard.clone();
        let out = change(&mut next, self.now())?;
        next.save(&self.path).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get_character(&self, id: Uuid) -> StorageResult<Option<Character>> {
        let db = self.db.read().await;
        Ok(db.live_character(id)?.map(|c| db.with_count(c)))
    }

    async fn list_characters(&self) -> StorageResult<Vec<Character>> {
        let db = self.db.read().await;
        let mut characters: Vec<Character> = db
            .characters
            .values()
            .filter(|c| !c.is_deleted())
            .map(|c| db.with_count(c))
            .collect();
        sort_characters(&mut characters);
        Ok(characters)
    }

    async fn persist_characters(
        &self,
        characters: Vec<NewCharacter>,
    ) -> StorageResult<PersistReport> {
        let mut report = PersistReport::default();
        let valid = report.validate(characters);
        if valid.is_empty() {
            return Ok(report);
        }
        self.mutate(|db, now| {
            for new in valid {
                let known = db.characters.contains_key(&new.uuid)
                    || db.unreadable_characters.iter().any(|u| u.id == Some(new.uuid));
                if known {
                    let error =
                        StorageError::Conflict(format!("character {} already exists", new.uuid));
                    report.fail(new.uuid, error);
                    continue;
                }
                let character = Character::from_new(new, now);
                db.put_character(character.clone());
                report.created.push(character);
            }
            Ok(report)
        })
        .await
    }

    async fn character_exists(
        &self,
        name: &str,
        uuid: Uuid,
        exclude_id: Option<Uuid>,
    ) -> StorageResult<bool> {
        let db = self.db.read().await;
        Ok(db.characters.values().any(|c| {
            !c.is_deleted() && Some(c.uuid) != exclude_id && (c.uuid == uuid || c.name == name)
        }))
    }

    async fn update_character(&self, character: Character) -> StorageResult<Character> {
        character.validate()?;
        self.mutate(|db, now| {
            let existing = db
                .live_character(character.uuid)?
                .ok_or_else(|| StorageError::character_not_found(character.uuid))?;
            let updated = Character {
                created_at: existing.created_at,
                updated_at: next_update(existing.updated_at, now),
                deleted_at: None,
                chat_count: 0,
                ..character
            };
            db.put_character(updated.clone());
            Ok(db.with_count(&updated))
        })
        .await
    }

    async fn delete_character(&self, id: Uuid) -> StorageResult<()> {
        let cascade = self.options.cascade;
        self.mutate(|db, now| {
            if db.live_character(id)?.is_none() {
                return Err(StorageError::character_not_found(id));
            }
            let tombstone = db.tombstones_enabled()?;
            if cascade == CascadePolicy::Cascade {
                let chat_ids: Vec<Uuid> = db
                    .chats
                    .values()
                    .filter(|c| c.character_id == id && !c.is_deleted())
                    .map(|c| c.id)
                    .collect();
                for chat_id in chat_ids {
                    db.remove_chat(chat_id, tombstone, now);
                }
            }
            if tombstone {
                if let Some(character) = db.characters.get_mut(&id) {
                    character.deleted_at = Some(now);
                    character.updated_at = next_update(character.updated_at, now);
                }
            } else {
                db.characters.remove(&id);
            }
            Ok(())
        })
        .await
    }

    async fn save_new_chat(&self, chat: NewChat) -> StorageResult<Uuid> {
        validate_history(&chat.initial_history)?;
        self.mutate(|db, now| {
            if db.live_character(chat.character_id)?.is_none() {
                return Err(StorageError::character_not_found(chat.character_id));
            }
            let id = Uuid::new_v4();
            db.put_chat(Chat::from_new(id, chat, now));
            Ok(id)
        })
        .await
    }

    async fn get_chat(&self, id: Uuid) -> StorageResult<Option<Chat>> {
        let db = self.db.read().await;
        Ok(db.live_chat(id)?.cloned())
    }

    async fn update_chat_history(
        &self,
        id: Uuid,
        history: Vec<ChatHistoryItem>,
    ) -> StorageResult<()> {
        validate_history(&history)?;
        self.mutate(|db, now| {
            let chat = db.live_chat_mut(id)?;
            chat.history = history;
            chat.updated_at = next_update(chat.updated_at, now);
            Ok(())
        })
        .await
    }

    async fn update_chat_title(&self, id: Uuid, title: Option<String>) -> StorageResult<()> {
        self.mutate(|db, now| {
            let chat = db.live_chat_mut(id)?;
            chat.title = title;
            chat.updated_at = next_update(chat.updated_at, now);
            Ok(())
        })
        .await
    }

    async fn set_chat_archived(&self, id: Uuid, archived: bool) -> StorageResult<()> {
        self.mutate(|db, now| {
            let chat = db.live_chat_mut(id)?;
            chat.archived = archived;
            chat.updated_at = next_update(chat.updated_at, now);
            Ok(())
        })
        .await
    }

    async fn delete_chat(&self, id: Uuid) -> StorageResult<()> {
        self.mutate(|db, now| {
            db.live_chat_mut(id)?;
            let tombstone = db.tombstones_enabled()?;
            db.remove_chat(id, tombstone, now);
            Ok(())
        })
        .await
    }

    async fn list_chats_for_character(
        &self,
        character_id: Uuid,
        archived: Option<bool>,
    ) -> StorageResult<Vec<Chat>> {
        let db = self.db.read().await;
        let mut chats: Vec<Chat> = db
            .chats
            .values()
            .filter(|c| c.character_id == character_id && !c.is_deleted())
            .filter(|c| archived.is_none_or(|a| c.archived == a))
            .cloned()
            .collect();
        sort_chats(&mut chats);
        Ok(chats)
    }

    async fn list_archived_chats(&self) -> StorageResult<Vec<Chat>> {
        let db = self.db.read().await;
        let mut chats: Vec<Chat> = db
            .chats
            .values()
            .filter(|c| c.archived && !c.is_deleted())
            .cloned()
            .collect();
        sort_chats(&mut chats);
        Ok(chats)
    }

    async fn list_all_chats(&self) -> StorageResult<Vec<Chat>> {
        let db = self.db.read().await;
        let mut chats: Vec<Chat> = db.chats.values().filter(|c| !c.is_deleted()).cloned().collect();
        sort_chats(&mut chats);
        Ok(chats)
    }

    async fn get_config(&self) -> StorageResult<Config> {
        if let Some(config) = self.db.read().await.config()? {
            return Ok(config);
        }
        let defaults = self.options.defaults.clone();
        // another writer may have created it between the two locks
        self.mutate(move |db, _| match db.config()? {
            Some(config) => Ok(config),
            None => {
                let config = Config::from_defaults(&defaults);
                db.config = Some(encode(&config)?);
                Ok(config)
            }
        })
        .await
    }

    async fn save_config(&self, config: &Config) -> StorageResult<()> {
        let raw = encode(config)?;
        self.mutate(move |db, _| {
            db.config = Some(raw);
            Ok(())
        })
        .await
    }

    async fn backup_database(&self) -> StorageResult<PathBuf> {
        let db = self.db.read().await;
        let target = backup_path(&self.path, self.now());
        tokio::fs::write(&target, db.to_bytes()?).await?;
        tracing::info!(path = %target.display(), "json store backed up");
        Ok(target)
    }

    async fn sync_snapshot(&self) -> StorageResult<SyncPayload> {
        let db = self.db.read().await;
        Ok(SyncPayload {
            characters: db.characters.values().cloned().collect(),
            chats: db.chats.values().cloned().collect(),
        })
    }

    async fn merge(&self, incoming: SyncPayload, ties: TieBreak) -> StorageResult<MergeReport> {
        let mut guard = self.db.write().await;
        let plan = merge::plan(&guard.characters, &guard.chats, incoming, ties);
        for rejected in &plan.rejected {
            tracing::warn!(id = %rejected.id, reason = %rejected.reason, "merge rejected entity");
        }
        let report = plan.report();
        if plan.is_empty() {
            return Ok(report);
        }

        let mut next = guard.clone();
        for character in plan.characters {
            next.put_character(Character {
                chat_count: 0,
                ..character
            });
        }
        for chat in plan.chats {
            next.put_chat(chat);
        }
        next.save(&self.path).await?;
        *guard = next;
        tracing::debug!(written = report.written(), "merged into json store");
        Ok(report)
    }

    async fn close(&self) {
        // every write is flushed before it returns
        tracing::debug!(path = %self.path.display(), "json store closed");
    }
}
