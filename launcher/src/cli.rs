use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "parlor", version, about = "Character chat storage and sync")]
pub struct Cli {
    /// Where the store, backups and avatars live [default: platform data dir]/parlor
    #[arg(long, env = "PARLOR_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,
    #[arg(long, value_enum, env = "PARLOR_STORE", default_value_t = StoreKind::Sqlite, global = true)]
    pub store: StoreKind,
    /// What deleting a character does to its chats
    #[arg(long, value_enum, env = "PARLOR_CASCADE", default_value_t = CascadeArg::Orphan, global = true)]
    pub cascade: CascadeArg,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Sqlite,
    Json,
}

impl StoreKind {
    pub fn file_name(self, stem: &str) -> String {
        match self {
            StoreKind::Sqlite => format!("{stem}.sqlite3"),
            StoreKind::Json => format!("{stem}.json"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CascadeArg {
    Orphan,
    Cascade,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the sync server
    Serve {
        #[arg(long, env = "PARLOR_ADDR", default_value = "127.0.0.1")]
        addr: String,
        #[arg(long, env = "PORT", default_value_t = server::DEFAULT_PORT)]
        port: u16,
        #[arg(long, env = "PARLOR_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Server store [default: <data-dir>/server.<ext>]
        #[arg(long)]
        database: Option<PathBuf>,
    },
    #[command(flatten)]
    Local(LocalCommand),
}

/// Commands that work on the local store.
#[derive(Subcommand)]
pub enum LocalCommand {
    /// Sync the local store with the configured server
    Sync {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
    /// Write a timestamped copy of the store next to it
    Backup,
    /// Import characters from card URLs
    Import {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// List stored characters
    Characters,
    #[command(subcommand)]
    Chat(ChatCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum ChatCommand {
    /// Print the character's first chat, starting one if it has none
    Open {
        character_id: Uuid,
        /// Use this model id instead of asking the model backend
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the stored settings
    Show,
    /// Set the sync endpoint; all three values are needed for sync to run
    Sync {
        #[arg(long)]
        server_url: String,
        #[arg(long)]
        client_id: String,
        #[arg(long, env = "PARLOR_SYNC_KEY", hide_env_values = true)]
        api_key: String,
    },
}
