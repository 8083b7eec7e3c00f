mod cli;
mod source;

use backend::clock::SystemClock;
use backend::dbs::{self, CascadePolicy, StorageConfig, StorageOptions};
use backend::ingest::{AvatarStore, CharacterIngestor};
use backend::model::{FixedModel, ModelResolver, OpenAiModels};
use backend::sync::{SyncClient, SyncOptions, SyncOutcome};
use backend::{Storage, history};
use clap::Parser;
use cli::{CascadeArg, ChatCommand, Cli, Command, ConfigCommand, LocalCommand, StoreKind};
use source::HttpCharacterSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
    let cli = Cli::parse();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => dirs::data_dir()
            .map(|dir| dir.join("parlor"))
            .ok_or("could not determine a data directory, pass --data-dir")?,
    };
    let options = StorageOptions {
        cascade: match cli.cascade {
            CascadeArg::Orphan => CascadePolicy::Orphan,
            CascadeArg::Cascade => CascadePolicy::Cascade,
        },
        ..Default::default()
    };

    let command = match cli.command {
        Command::Serve {
            addr,
            port,
            api_key,
            database,
        } => {
            let path = database.unwrap_or_else(|| data_dir.join(cli.store.file_name("server")));
            let storage = dbs::open(&storage_config(cli.store, path), options).await?;
            let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;
            let state = server::AppState::new(storage.clone(), api_key);
            let served = server::serve(listener, state).await;
            storage.close().await;
            served?;
            return Ok(());
        }
        Command::Local(command) => command,
    };

    let path = data_dir.join(cli.store.file_name("parlor"));
    let storage = dbs::open(&storage_config(cli.store, path), options).await?;
    // bootstrap the settings before anything else reads them
    let config = storage.get_config().await?;
    let result = run(command, storage.clone(), &data_dir, config).await;
    storage.close().await;
    result
}

fn storage_config(kind: StoreKind, path: PathBuf) -> StorageConfig {
    match kind {
        StoreKind::Sqlite => StorageConfig::Sqlite { path },
        StoreKind::Json => StorageConfig::Local { path },
    }
}

async fn run(
    command: LocalCommand,
    storage: Arc<dyn Storage>,
    data_dir: &Path,
    mut config: shared::models::Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        LocalCommand::Sync {
            once,
            interval_secs,
        } => {
            let client = Arc::new(SyncClient::new(
                storage,
                SyncOptions {
                    interval: Duration::from_secs(interval_secs.max(1)),
                    ..Default::default()
                },
            )?);
            if once {
                if !client.health_check().await {
                    return Err("sync server is disabled or unreachable".into());
                }
                match client.sync().await? {
                    SyncOutcome::Completed(report) => println!(
                        "synced: {} characters and {} chats written, {} rejected",
                        report.characters_written,
                        report.chats_written,
                        report.rejected.len()
                    ),
                    SyncOutcome::Skipped => println!("a sync pass is already running"),
                    SyncOutcome::Disabled => println!("sync is not configured"),
                }
            } else {
                let handle = client.spawn();
                tokio::signal::ctrl_c().await?;
                handle.shutdown().await;
            }
        }
        LocalCommand::Backup => {
            let path = storage.backup_database().await?;
            println!("{}", path.display());
        }
        LocalCommand::Import { urls } => {
            let source = Arc::new(HttpCharacterSource::new(HTTP_TIMEOUT)?);
            let ingestor = CharacterIngestor::new(storage, source, AvatarStore::new(data_dir));
            let report = ingestor.create_from_remote_urls(urls).await;
            for character in &report.created {
                println!("imported {} ({})", character.name, character.uuid);
            }
            for failure in &report.failures {
                eprintln!("failed {}: {}", failure.item, failure.error);
            }
            if report.created.is_empty() && !report.failures.is_empty() {
                return Err("no character could be imported".into());
            }
        }
        LocalCommand::Characters => {
            for character in storage.list_characters().await? {
                println!(
                    "{}  {}  ({} chats)",
                    character.uuid, character.name, character.chat_count
                );
            }
        }
        LocalCommand::Chat(ChatCommand::Open {
            character_id,
            model,
        }) => {
            let models: Box<dyn ModelResolver> = match model {
                Some(id) => Box::new(FixedModel(id)),
                None => Box::new(OpenAiModels::new(HTTP_TIMEOUT)?),
            };
            let chat_id = history::open_or_start_chat(
                storage.as_ref(),
                models.as_ref(),
                &SystemClock,
                character_id,
            )
            .await?;
            if let Some(chat) = storage.get_chat(chat_id).await? {
                println!("{}  {}", chat.id, chat.display_title());
            }
        }
        LocalCommand::Config(ConfigCommand::Show) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        LocalCommand::Config(ConfigCommand::Sync {
            server_url,
            client_id,
            api_key,
        }) => {
            config.sync = shared::models::SyncSettings {
                server_url: Some(server_url),
                client_id: Some(client_id),
                api_key: Some(api_key),
            };
            storage.save_config(&config).await?;
            tracing::info!("sync settings saved");
        }
    }
    Ok(())
}
