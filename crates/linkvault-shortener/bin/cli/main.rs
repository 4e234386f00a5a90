mod cli;

use crate::cli::{Cli, Command, LogFormat, StorageBackendArg};
use anyhow::{bail, Context};
use clap::Parser;
use linkvault_core::{OwnerId, RepositoryError, ShortCode, Shortener};
use linkvault_generator::RandomGenerator;
use linkvault_shortener::LinkService;
use linkvault_storage::{ReconcilerConfig, Repository, StorageConfig, StorageKind};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Service = LinkService<Repository, RandomGenerator>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        storage = %cli.storage,
        candidates = cli.candidates,
        owner = %cli.owner,
        "starting linkvault"
    );

    let repository = Repository::open(storage_config(&cli)?)
        .await
        .context("failed to open repository")?;
    let service = LinkService::new(repository, RandomGenerator::new())
        .with_candidates(cli.candidates);

    let result = run(&cli, &service).await;
    service.repository().close().await;
    result
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn storage_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let kind = match cli.storage {
        StorageBackendArg::Memory => StorageKind::Memory,
        StorageBackendArg::File => StorageKind::File(cli.file_path.clone()),
        StorageBackendArg::Mysql => {
            let dsn = cli
                .mysql_dsn
                .clone()
                .context("mysql dsn is required when storage backend is mysql")?;
            StorageKind::MySql { dsn }
        }
    };

    Ok(StorageConfig::builder()
        .kind(kind)
        .max_connections(cli.max_connections)
        .reconciler(
            ReconcilerConfig::builder()
                .interval(Duration::from_secs(cli.reconcile_interval_secs))
                .build(),
        )
        .build())
}

async fn run(cli: &Cli, service: &Service) -> anyhow::Result<()> {
    let owner = OwnerId::new(cli.owner.as_str());

    match &cli.command {
        Command::Shorten { url } => match service.create_link(url, &owner).await {
            Ok(code) => println!("{}", display_code(cli, &code)),
            Err(RepositoryError::AlreadyExists(code)) => {
                info!(code = %code, "url was already shortened");
                println!("{}", display_code(cli, &code));
            }
            Err(err) => return Err(err.into()),
        },
        Command::Batch { items } => match service.create_links_batch(items, &owner).await {
            Ok(links) => println!("{}", serde_json::to_string_pretty(&links)?),
            Err(RepositoryError::BatchAlreadyExists { links, conflicts }) => {
                let report = serde_json::json!({ "links": links, "conflicts": conflicts });
                println!("{}", serde_json::to_string_pretty(&report)?);
                bail!("{} url(s) were already shortened, nothing stored", conflicts.len());
            }
            Err(err) => return Err(err.into()),
        },
        Command::Resolve { code } => {
            let url = service.get_original_url(code).await?;
            println!("{url}");
        }
        Command::List => {
            for link in service.list_links_of_owner(&owner).await? {
                println!("{}", serde_json::to_string(&link)?);
            }
        }
        Command::Delete { codes } => {
            service.delete_links(codes, &owner).await?;
            info!(codes = codes.len(), "deletion requested");
        }
        Command::Ping => {
            service.ping().await?;
            println!("ok");
        }
        Command::Reconcile => {
            if service.repository().as_mysql().is_none() {
                bail!("reconcile needs the mysql storage backend");
            }
            info!("reconciling deletions, press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
        }
    }

    Ok(())
}

fn display_code(cli: &Cli, code: &ShortCode) -> String {
    match &cli.base_url {
        Some(base_url) => code.to_url(base_url),
        None => code.to_string(),
    }
}
