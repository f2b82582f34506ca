#![allow(clippy::print_stdout)]

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use cache_assistant::config::Config;
use cache_assistant::migration::{ensure_configs_migrated, ensure_watched_keys_migrated};
use cache_assistant::store::DomainStore;
use cache_assistant::types::{StorageData, StorageType, domain_key};
use cache_assistant::{kv, ui_state};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "cache-assistant-store")]
#[command(about = "Inspect and edit a cache-assistant JSON store without the browser")]
struct Cli {
    /// Store file. Defaults to CACHE_ASSISTANT_STORE_PATH.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move legacy flat entries into per-domain partitions.
    Migrate(DomainArgs),
    #[command(subcommand)]
    Watched(WatchedCommand),
    #[command(subcommand)]
    Configs(ConfigsCommand),
    #[command(name = "last-tool", subcommand)]
    LastTool(LastToolCommand),
}

#[derive(Args)]
struct DomainArgs {
    /// Site hostname; empty selects the default partition.
    #[arg(long, default_value = "")]
    domain: String,
}

#[derive(Subcommand)]
enum WatchedCommand {
    List(DomainArgs),
    Add {
        #[command(flatten)]
        domain: DomainArgs,
        key: String,
        #[arg(long, default_value = "localStorage")]
        storage_type: String,
    },
    Remove {
        #[command(flatten)]
        domain: DomainArgs,
        key: String,
    },
}

#[derive(Subcommand)]
enum ConfigsCommand {
    List(DomainArgs),
    Save {
        #[command(flatten)]
        domain: DomainArgs,
        name: String,
        /// Snapshot as a JSON object.
        #[arg(long, conflicts_with = "data_file")]
        data: Option<String>,
        #[arg(long)]
        data_file: Option<PathBuf>,
    },
    Load {
        #[command(flatten)]
        domain: DomainArgs,
        config_id: String,
    },
    Delete {
        #[command(flatten)]
        domain: DomainArgs,
        config_id: String,
    },
}

#[derive(Subcommand)]
enum LastToolCommand {
    Get,
    Set { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to read configuration")?;
    if config.store_quota_bytes.is_some() {
        bail!("CACHE_ASSISTANT_STORE_QUOTA_BYTES does not apply to a store file");
    }
    let Some(path) = cli.store.or(config.store_path) else {
        bail!("no store file: pass --store or set CACHE_ASSISTANT_STORE_PATH");
    };
    let kv = kv::json_file(path);
    let store = DomainStore::new(kv.clone());

    let output = match cli.command {
        Commands::Migrate(args) => {
            let requesting = domain_key(Some(args.domain.as_str()));
            let seeded = ensure_watched_keys_migrated(kv.as_ref(), &requesting)
                .await
                .context("watched keys migration failed")?;
            let configs = ensure_configs_migrated(kv.as_ref())
                .await
                .context("configs migration failed")?;
            json!({
                "watchedKeysMigrated": seeded.is_some(),
                "configsMigrated": configs,
            })
        }
        Commands::Watched(command) => run_watched(&store, command).await?,
        Commands::Configs(command) => run_configs(&store, command).await?,
        Commands::LastTool(LastToolCommand::Get) => {
            json!({ "lastTool": ui_state::get_last_tool(kv.as_ref()).await })
        }
        Commands::LastTool(LastToolCommand::Set { path }) => {
            if !ui_state::is_tool_route(&path) {
                bail!(
                    "unknown tool route {path}; expected one of {:?}",
                    ui_state::TOOL_ROUTES
                );
            }
            ui_state::set_last_tool(kv.as_ref(), &path).await;
            json!({ "lastTool": path })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_watched(store: &DomainStore, command: WatchedCommand) -> Result<Value> {
    match command {
        WatchedCommand::List(args) => {
            let watched = store
                .get_watched_keys(&args.domain)
                .await
                .context("failed to read watched keys")?;
            Ok(json!({ "keys": watched.items, "migrated": watched.migrated }))
        }
        WatchedCommand::Add {
            domain,
            key,
            storage_type,
        } => {
            let added = store
                .add_watched_key(&domain.domain, &key, StorageType::parse_lenient(&storage_type))
                .await
                .with_context(|| format!("failed to watch {key}"))?;
            Ok(json!({ "added": added }))
        }
        WatchedCommand::Remove { domain, key } => {
            let removed = store
                .remove_watched_key(&domain.domain, &key)
                .await
                .with_context(|| format!("failed to unwatch {key}"))?;
            Ok(json!({ "removed": removed }))
        }
    }
}

async fn run_configs(store: &DomainStore, command: ConfigsCommand) -> Result<Value> {
    match command {
        ConfigsCommand::List(args) => {
            let configs = store
                .get_all_configs(&args.domain)
                .await
                .context("failed to read configs")?;
            Ok(json!({ "configs": configs }))
        }
        ConfigsCommand::Save {
            domain,
            name,
            data,
            data_file,
        } => {
            let raw = match (data, data_file) {
                (Some(data), _) => data,
                (None, Some(path)) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => "{}".to_string(),
            };
            let data: StorageData =
                serde_json::from_str(&raw).context("snapshot data must be a JSON object")?;
            let config_id = store
                .save_config(&domain.domain, &name, data)
                .await
                .context("failed to save config")?;
            Ok(json!({ "configId": config_id }))
        }
        ConfigsCommand::Load { domain, config_id } => {
            let data = store
                .load_config(&domain.domain, &config_id)
                .await
                .with_context(|| format!("failed to load {config_id}"))?;
            Ok(json!({ "data": data }))
        }
        ConfigsCommand::Delete { domain, config_id } => {
            store
                .delete_config(&domain.domain, &config_id)
                .await
                .with_context(|| format!("failed to delete {config_id}"))?;
            Ok(json!({ "deleted": config_id }))
        }
    }
}
