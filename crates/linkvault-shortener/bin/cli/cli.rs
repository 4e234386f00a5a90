use clap::{Parser, Subcommand, ValueEnum};
use linkvault_core::BatchItem;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const STORAGE_BACKEND_ENV: &str = "LINKVAULT_STORAGE";
pub const FILE_PATH_ENV: &str = "LINKVAULT_FILE_PATH";
pub const MYSQL_DSN_ENV: &str = "LINKVAULT_MYSQL_DSN";
pub const MAX_CONNECTIONS_ENV: &str = "LINKVAULT_MAX_CONNECTIONS";
pub const RECONCILE_INTERVAL_ENV: &str = "LINKVAULT_RECONCILE_INTERVAL_SECS";
pub const CANDIDATES_ENV: &str = "LINKVAULT_CANDIDATES";
pub const OWNER_ENV: &str = "LINKVAULT_OWNER";
pub const LOG_FORMAT_ENV: &str = "LINKVAULT_LOG_FORMAT";
pub const BASE_URL_ENV: &str = "LINKVAULT_BASE_URL";

pub const DEFAULT_FILE_PATH: &str = "linkvault.jsonl";
pub const DEFAULT_OWNER: &str = "cli";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "memory")]
    Memory,
    #[value(name = "file")]
    File,
    #[value(name = "mysql")]
    Mysql,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::Memory => write!(f, "memory"),
            StorageBackendArg::File => write!(f, "file"),
            StorageBackendArg::Mysql => write!(f, "mysql"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "linkvault", about = "Shorten, resolve and delete links")]
pub struct Cli {
    #[arg(
        long,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::File,
        global = true
    )]
    pub storage: StorageBackendArg,

    /// Append-only link log used by the file backend.
    #[arg(long, env = FILE_PATH_ENV, default_value = DEFAULT_FILE_PATH, global = true)]
    pub file_path: PathBuf,

    #[arg(long, env = MYSQL_DSN_ENV, required_if_eq("storage", "mysql"), global = true)]
    pub mysql_dsn: Option<String>,

    #[arg(long, env = MAX_CONNECTIONS_ENV, default_value_t = 10, global = true)]
    pub max_connections: u32,

    /// Pause of the deletion reconciler when its queue is empty.
    #[arg(long, env = RECONCILE_INTERVAL_ENV, default_value_t = 10, global = true)]
    pub reconcile_interval_secs: u64,

    /// Candidate codes generated per link.
    #[arg(long, env = CANDIDATES_ENV, default_value_t = 5, global = true)]
    pub candidates: usize,

    /// Owner recorded on created links and checked on deletion.
    #[arg(long, env = OWNER_ENV, default_value = DEFAULT_OWNER, global = true)]
    pub owner: String,

    /// Print full short URLs under this base instead of bare codes.
    #[arg(long, env = BASE_URL_ENV, global = true)]
    pub base_url: Option<String>,

    #[arg(
        long,
        env = LOG_FORMAT_ENV,
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten one URL.
    Shorten { url: String },
    /// Shorten several URLs at once, given as `ID=URL`.
    Batch {
        #[arg(required = true, value_parser = parse_batch_item)]
        items: Vec<BatchItem>,
    },
    /// Print the URL behind a short code.
    Resolve { code: String },
    /// List the live links of the owner.
    List,
    /// Delete short codes owned by the owner.
    Delete {
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Check that the durable backend is reachable.
    Ping,
    /// Apply queued deletions until interrupted.
    Reconcile,
}

fn parse_batch_item(raw: &str) -> Result<BatchItem, String> {
    match raw.split_once('=') {
        Some((id, url)) if !id.is_empty() && !url.is_empty() => Ok(BatchItem::new(id, url)),
        _ => Err(format!("expected ID=URL, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_item_splits_on_first_equals() {
        let item = parse_batch_item("a=https://example.com/?q=1").unwrap();
        assert_eq!(item.correlation_id, "a");
        assert_eq!(item.original_url, "https://example.com/?q=1");
    }

    #[test]
    fn batch_item_requires_id_and_url() {
        assert!(parse_batch_item("https://example.com").is_err());
        assert!(parse_batch_item("=https://example.com").is_err());
        assert!(parse_batch_item("a=").is_err());
    }

    #[test]
    fn mysql_requires_dsn() {
        let result = Cli::try_parse_from(["linkvault", "--storage", "mysql", "ping"]);
        assert!(result.is_err());
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["linkvault", "list"]).unwrap();
        assert_eq!(cli.storage, StorageBackendArg::File);
        assert_eq!(cli.candidates, 5);
        assert_eq!(cli.reconcile_interval_secs, 10);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Command::List));
    }
}
