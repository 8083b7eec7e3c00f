use super::merge::{self, TieBreak};
use super::{
    CascadePolicy, MergeReport, PersistReport, Storage, StorageError, StorageOptions,
    StorageResult, backup_path, migrations, sort_characters, sort_chats,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::models::*;
use shared::time::next_update;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const CHARACTER_COLUMNS: &str = "c.uuid, c.name, c.description, c.personality, c.first_messages, \
     c.tags, c.system_prompt, c.avatar, c.source_url, c.created_at, c.updated_at, c.deleted_at";

const CHAT_COUNT: &str = "(SELECT COUNT(*) FROM chats h \
     WHERE h.character_id = c.uuid AND h.archived = 0 AND h.deleted_at IS NULL) AS chat_count";

const CHAT_COLUMNS: &str =
    "id, character_id, title, archived, history, created_at, updated_at, deleted_at";

const UPSERT_CHARACTER: &str = r#"
    INSERT INTO characters (uuid, name, description, personality, first_messages, tags,
        system_prompt, avatar, source_url, created_at, updated_at, deleted_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(uuid) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        personality = excluded.personality,
        first_messages = excluded.first_messages,
        tags = excluded.tags,
        system_prompt = excluded.system_prompt,
        avatar = excluded.avatar,
        source_url = excluded.source_url,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        deleted_at = excluded.deleted_at
"#;

const UPSERT_CHAT: &str = r#"
    INSERT INTO chats (id, character_id, title, archived, history, created_at, updated_at, deleted_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        title = excluded.title,
        archived = excluded.archived,
        history = excluded.history,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        deleted_at = excluded.deleted_at
"#;

/// Storage backed by an embedded SQLite database.
///
/// Logical writes are serialized in-process so a transaction never has to
/// upgrade from a read lock while another connection holds the write lock.
pub struct SqliteStorage {
    pool: SqlitePool,
    path: PathBuf,
    options: StorageOptions,
    write_lock: Mutex<()>,
}

impl SqliteStorage {
    pub async fn open(path: &Path, options: StorageOptions) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(connect)
            .await?;
        migrations::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            options,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now(&self) -> DateTime<Utc> {
        self.options.clock.now()
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::SchemaMismatch(format!("timestamp {raw:?}: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::SchemaMismatch(format!("uuid {raw:?}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::SchemaMismatch(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> StorageResult<T> {
    serde_json::from_str(raw).map_err(|e| StorageError::SchemaMismatch(format!("{column}: {e}")))
}

fn character_from_row(row: &SqliteRow) -> StorageResult<Character> {
    let chat_count = match row.try_get::<i64, _>("chat_count") {
        Ok(count) => usize::try_from(count).unwrap_or(0),
        Err(_) => 0,
    };
    Ok(Character {
        uuid: parse_uuid(row.try_get("uuid")?)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        personality: row.try_get("personality")?,
        first_messages: from_json(row.try_get("first_messages")?, "first_messages")?,
        tags: from_json(row.try_get("tags")?, "tags")?,
        system_prompt: row.try_get("system_prompt")?,
        avatar: row.try_get("avatar")?,
        source_url: row.try_get("source_url")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
        deleted_at: parse_opt_ts(row.try_get("deleted_at")?)?,
        chat_count,
    })
}

fn chat_from_row(row: &SqliteRow) -> StorageResult<Chat> {
    Ok(Chat {
        id: parse_uuid(row.try_get("id")?)?,
        character_id: parse_uuid(row.try_get("character_id")?)?,
        title: row.try_get("title")?,
        archived: row.try_get("archived")?,
        history: from_json(row.try_get("history")?, "history")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
        deleted_at: parse_opt_ts(row.try_get("deleted_at")?)?,
    })
}

/// Decodes every row, skipping the ones whose stored shape no longer fits.
fn decode_rows<T>(
    rows: &[SqliteRow],
    what: &str,
    decode: impl Fn(&SqliteRow) -> StorageResult<T>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable {what}");
                None
            }
        })
        .collect()
}

async fn fetch_character(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> StorageResult<Option<Character>> {
    let sql = format!(
        "SELECT {CHARACTER_COLUMNS}, {CHAT_COUNT} FROM characters c \
         WHERE c.uuid = ? AND c.deleted_at IS NULL"
    );
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(character_from_row).transpose()
}

async fn fetch_chat(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Option<Chat>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ? AND deleted_at IS NULL");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(chat_from_row).transpose()
}

async fn fetch_chats(
    conn: &mut SqliteConnection,
    filter: &str,
    character_id: Option<Uuid>,
) -> StorageResult<Vec<Chat>> {
    let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE deleted_at IS NULL {filter}");
    let mut query = sqlx::query(&sql);
    if let Some(id) = character_id {
        query = query.bind(id.to_string());
    }
    let rows = query.fetch_all(&mut *conn).await?;
    let mut chats = decode_rows(&rows, "chat", chat_from_row);
    sort_chats(&mut chats);
    Ok(chats)
}

async fn load_config(conn: &mut SqliteConnection) -> StorageResult<Option<Config>> {
    let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM config WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    payload.as_deref().map(|p| from_json(p, "config")).transpose()
}

async fn tombstones_enabled(conn: &mut SqliteConnection) -> StorageResult<bool> {
    Ok(load_config(conn)
        .await?
        .is_some_and(|config| config.sync.is_enabled()))
}

async fn insert_character(conn: &mut SqliteConnection, c: &Character) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO characters (uuid, name, description, personality, first_messages, tags,
            system_prompt, avatar, source_url, created_at, updated_at, deleted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(c.uuid.to_string())
    .bind(&c.name)
    .bind(&c.description)
    .bind(&c.personality)
    .bind(to_json(&c.first_messages)?)
    .bind(to_json(&c.tags)?)
    .bind(&c.system_prompt)
    .bind(&c.avatar)
    .bind(&c.source_url)
    .bind(ts(c.created_at))
    .bind(ts(c.updated_at))
    .bind(c.deleted_at.map(ts))
    .execute(&mut *conn)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StorageError::Conflict(
            format!("character {} already exists", c.uuid),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn upsert_character(conn: &mut SqliteConnection, c: &Character) -> StorageResult<()> {
    sqlx::query(UPSERT_CHARACTER)
        .bind(c.uuid.to_string())
        .bind(&c.name)
        .bind(&c.description)
        .bind(&c.personality)
        .bind(to_json(&c.first_messages)?)
        .bind(to_json(&c.tags)?)
        .bind(&c.system_prompt)
        .bind(&c.avatar)
        .bind(&c.source_url)
        .bind(ts(c.created_at))
        .bind(ts(c.updated_at))
        .bind(c.deleted_at.map(ts))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn upsert_chat(conn: &mut SqliteConnection, chat: &Chat) -> StorageResult<()> {
    sqlx::query(UPSERT_CHAT)
        .bind(chat.id.to_string())
        .bind(chat.character_id.to_string())
        .bind(&chat.title)
        .bind(chat.archived)
        .bind(to_json(&chat.history)?)
        .bind(ts(chat.created_at))
        .bind(ts(chat.updated_at))
        .bind(chat.deleted_at.map(ts))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn remove_chat(
    conn: &mut SqliteConnection,
    mut chat: Chat,
    tombstone: bool,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    if tombstone {
        chat.deleted_at = Some(now);
        chat.updated_at = next_update(chat.updated_at, now);
        upsert_chat(conn, &chat).await
    } else {
        sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat.id.to_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

impl SqliteStorage {
    /// Loads a live chat, applies `change` and writes it back with a bumped `updatedAt`.
    async fn modify_chat(&self, id: Uuid, change: impl FnOnce(&mut Chat)) -> StorageResult<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut chat = fetch_chat(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::chat_not_found(id))?;
        change(&mut chat);
        chat.updated_at = next_update(chat.updated_at, self.now());
        upsert_chat(&mut tx, &chat).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_character(&self, id: Uuid) -> StorageResult<Option<Character>> {
        let mut conn = self.pool.acquire().await?;
        fetch_character(&mut conn, id).await
    }

    async fn list_characters(&self) -> StorageResult<Vec<Character>> {
        let sql = format!(
            "SELECT {CHARACTER_COLUMNS}, {CHAT_COUNT} FROM characters c WHERE c.deleted_at IS NULL"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut characters = decode_rows(&rows, "character", character_from_row);
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
        let _write = self.write_lock.lock().await;
        let now = self.now();
        let mut tx = self.pool.begin().await?;
        for new in valid {
            let character = Character::from_new(new, now);
            // a constraint failure only undoes its own statement
            match insert_character(&mut tx, &character).await {
                Ok(()) => report.created.push(character),
                Err(e @ StorageError::Conflict(_)) => report.fail(character.uuid, e),
                Err(e) => return Err(e),
            }
        }
        tx.commit().await?;
        tracing::debug!(
            created = report.created.len(),
            failed = report.failed.len(),
            "characters persisted"
        );
        Ok(report)
    }

    async fn character_exists(
        &self,
        name: &str,
        uuid: Uuid,
        exclude_id: Option<Uuid>,
    ) -> StorageResult<bool> {
        let found: Option<String> = sqlx::query_scalar(
            r#"
            SELECT uuid FROM characters
            WHERE deleted_at IS NULL AND (uuid = ? OR name = ?) AND (? IS NULL OR uuid != ?)
            LIMIT 1
            "#,
        )
        .bind(uuid.to_string())
        .bind(name)
        .bind(exclude_id.map(|id| id.to_string()))
        .bind(exclude_id.map(|id| id.to_string()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn update_character(&self, character: Character) -> StorageResult<Character> {
        character.validate()?;
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let existing = fetch_character(&mut tx, character.uuid)
            .await?
            .ok_or_else(|| StorageError::character_not_found(character.uuid))?;
        let updated = Character {
            created_at: existing.created_at,
            updated_at: next_update(existing.updated_at, self.now()),
            deleted_at: None,
            chat_count: existing.chat_count,
            ..character
        };
        upsert_character(&mut tx, &updated).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_character(&self, id: Uuid) -> StorageResult<()> {
        let _write = self.write_lock.lock().await;
        let now = self.now();
        let mut tx = self.pool.begin().await?;
        let mut character = fetch_character(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::character_not_found(id))?;
        let tombstone = tombstones_enabled(&mut tx).await?;

        if self.options.cascade == CascadePolicy::Cascade {
            let chats = fetch_chats(&mut tx, "AND character_id = ?", Some(id)).await?;
            for chat in chats {
                remove_chat(&mut tx, chat, tombstone, now).await?;
            }
        }
        if tombstone {
            character.deleted_at = Some(now);
            character.updated_at = next_update(character.updated_at, now);
            upsert_character(&mut tx, &character).await?;
        } else {
            sqlx::query("DELETE FROM characters WHERE uuid = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::debug!(%id, tombstone, "character deleted");
        Ok(())
    }

    async fn save_new_chat(&self, chat: NewChat) -> StorageResult<Uuid> {
        validate_history(&chat.initial_history)?;
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        if fetch_character(&mut tx, chat.character_id).await?.is_none() {
            return Err(StorageError::character_not_found(chat.character_id));
        }
        let chat = Chat::from_new(Uuid::new_v4(), chat, self.now());
        upsert_chat(&mut tx, &chat).await?;
        tx.commit().await?;
        Ok(chat.id)
    }

    async fn get_chat(&self, id: Uuid) -> StorageResult<Option<Chat>> {
        let mut conn = self.pool.acquire().await?;
        fetch_chat(&mut conn, id).await
    }

    async fn update_chat_history(
        &self,
        id: Uuid,
        history: Vec<ChatHistoryItem>,
    ) -> StorageResult<()> {
        validate_history(&history)?;
        self.modify_chat(id, |chat| chat.history = history).await
    }

    async fn update_chat_title(&self, id: Uuid, title: Option<String>) -> StorageResult<()> {
        self.modify_chat(id, |chat| chat.title = title).await
    }

    async fn set_chat_archived(&self, id: Uuid, archived: bool) -> StorageResult<()> {
        self.modify_chat(id, |chat| chat.archived = archived).await
    }

    async fn delete_chat(&self, id: Uuid) -> StorageResult<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let chat = fetch_chat(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::chat_not_found(id))?;
        let tombstone = tombstones_enabled(&mut tx).await?;
        remove_chat(&mut tx, chat, tombstone, self.now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_chats_for_character(
        &self,
        character_id: Uuid,
        archived: Option<bool>,
    ) -> StorageResult<Vec<Chat>> {
        let mut conn = self.pool.acquire().await?;
        let filter = match archived {
            None => "AND character_id = ?",
            Some(true) => "AND character_id = ? AND archived = 1",
            Some(false) => "AND character_id = ? AND archived = 0",
        };
        fetch_chats(&mut conn, filter, Some(character_id)).await
    }

    async fn list_archived_chats(&self) -> StorageResult<Vec<Chat>> {
        let mut conn = self.pool.acquire().await?;
        fetch_chats(&mut conn, "AND archived = 1", None).await
    }

    async fn list_all_chats(&self) -> StorageResult<Vec<Chat>> {
        let mut conn = self.pool.acquire().await?;
        fetch_chats(&mut conn, "", None).await
    }

    async fn get_config(&self) -> StorageResult<Config> {
        {
            let mut conn = self.pool.acquire().await?;
            if let Some(config) = load_config(&mut conn).await? {
                return Ok(config);
            }
        }
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let defaults = Config::from_defaults(&self.options.defaults);
        sqlx::query("INSERT INTO config (id, payload) VALUES (1, ?) ON CONFLICT(id) DO NOTHING")
            .bind(to_json(&defaults)?)
            .execute(&mut *tx)
            .await?;
        let config = load_config(&mut tx)
            .await?
            .ok_or_else(|| StorageError::NotFound("Config".to_string()))?;
        tx.commit().await?;
        Ok(config)
    }

    async fn save_config(&self, config: &Config) -> StorageResult<()> {
        let _write = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO config (id, payload) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(to_json(config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn backup_database(&self) -> StorageResult<PathBuf> {
        let target = backup_path(&self.path, self.now());
        sqlx::query("VACUUM INTO ?")
            .bind(target.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;
        tracing::info!(path = %target.display(), "sqlite store backed up");
        Ok(target)
    }

    async fn sync_snapshot(&self) -> StorageResult<SyncPayload> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("SELECT {CHARACTER_COLUMNS} FROM characters c");
        let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
        let characters = decode_rows(&rows, "character", character_from_row);
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats");
        let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
        let chats = decode_rows(&rows, "chat", chat_from_row);
        tx.commit().await?;
        Ok(SyncPayload { characters, chats })
    }

    async fn merge(&self, incoming: SyncPayload, ties: TieBreak) -> StorageResult<MergeReport> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {CHARACTER_COLUMNS} FROM characters c");
        let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
        let existing_characters: BTreeMap<Uuid, Character> =
            decode_rows(&rows, "character", character_from_row)
                .into_iter()
                .map(|c| (c.uuid, c))
                .collect();
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats");
        let rows = sqlx::query(&sql).fetch_all(&mut *tx).await?;
        let existing_chats: BTreeMap<Uuid, Chat> = decode_rows(&rows, "chat", chat_from_row)
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let plan = merge::plan(&existing_characters, &existing_chats, incoming, ties);
        for rejected in &plan.rejected {
            tracing::warn!(id = %rejected.id, reason = %rejected.reason, "merge rejected entity");
        }
        for character in &plan.characters {
            upsert_character(&mut tx, character).await?;
        }
        for chat in &plan.chats {
            upsert_chat(&mut tx, chat).await?;
        }
        tx.commit().await?;

        let report = plan.report();
        tracing::debug!(written = report.written(), "merged into sqlite store");
        Ok(report)
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::debug!(path = %self.path.display(), "sqlite store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn corrupt_rows_are_skipped_in_lists_and_reported_on_point_reads() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(&dir.path().join("parlor.sqlite3"), StorageOptions::default())
            .await
            .unwrap();
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO characters (uuid, name, first_messages, created_at, updated_at) \
             VALUES (?, 'Broken', 'not json', 'yesterday', 'yesterday')",
        )
        .bind(id.to_string())
        .execute(storage.pool())
        .await
        .unwrap();

        assert!(storage.list_characters().await.unwrap().is_empty());
        assert!(matches!(
            storage.get_character(id).await,
            Err(StorageError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let now = shared::time::normalize(Utc::now());
        assert_eq!(parse_ts(&ts(now)).unwrap(), now);
        assert!(ts(now).ends_with('Z'));
    }
}
