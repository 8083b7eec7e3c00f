//! Versioned schema for the SQLite store.

use super::{StorageError, StorageResult};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;

/// Schema version this build writes.
pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current = current_version(pool).await?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaMismatch(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    tracing::debug!(current, target = SCHEMA_VERSION, "checking migrations");

    for version in (current + 1)..=SCHEMA_VERSION {
        run_migration(pool, version).await?;
    }
    Ok(())
}

async fn current_version(pool: &SqlitePool) -> StorageResult<i64> {
    let row = sqlx::query("SELECT MAX(version) AS version FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<Option<i64>, _>("version")?.unwrap_or(0))
}

async fn run_migration(pool: &SqlitePool, version: i64) -> StorageResult<()> {
    let (name, sql) = match version {
        1 => ("initial_schema", MIGRATION_V1),
        _ => {
            return Err(StorageError::SchemaMismatch(format!(
                "no migration for v{version}"
            )));
        }
    };
    tracing::info!(version, name, "applying migration");

    let mut tx = pool.begin().await?;
    for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
        sqlx::query(statement.trim()).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(version)
        .bind(name)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS characters (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    personality TEXT NOT NULL DEFAULT '',
    first_messages TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    system_prompt TEXT NOT NULL DEFAULT '',
    avatar TEXT,
    source_url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_characters_name ON characters(name);
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY,
    character_id TEXT NOT NULL,
    title TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    history TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_chats_character ON chats(character_id);
CREATE TABLE IF NOT EXISTS config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    payload TEXT NOT NULL
)
"#;
