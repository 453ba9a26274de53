//! lbstate-admin: inspect and prune persisted load-balancer states.
//!
//! # Usage
//! ```bash
//! lbstate-admin --persistence "file /var/lib/grid/lb_persistence" list-channels
//! lbstate-admin --config lb.json list-algorithms <channel>
//! LBSTATE_PERSISTENCE="database load_balancer lbDS" lbstate-admin --config lb.json delete-all
//! ```
//!
//! Results are printed as JSON on stdout; logs go to stderr (`RUST_LOG`).

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lbstate_server::{BackendRegistry, PersistenceManager, PersistenceSettings};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// Inspect and prune persisted load-balancer states.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend configuration string, e.g. "file ./lb_persistence".
    /// Overrides the `persistence` entry of the settings file.
    #[arg(long, env = "LBSTATE_PERSISTENCE")]
    persistence: Option<String>,

    /// JSON settings file (backend, hash function, datasources).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hash function used for algorithm identifiers (SHA-256, SHA-512, BLAKE3).
    #[arg(long)]
    hash: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every channel with a stored state.
    ListChannels,
    /// List the algorithms stored for a channel.
    ListAlgorithms { channel: String },
    /// List the channels that have a state for an algorithm.
    ListChannelsWith { algorithm: String },
    /// Check whether a state exists for a channel and algorithm.
    Has { channel: String, algorithm: String },
    /// Delete every stored state.
    DeleteAll,
    /// Delete every state of a channel.
    DeleteChannel { channel: String },
    /// Delete an algorithm's state on every channel.
    DeleteAlgorithm { algorithm: String },
    /// Delete one state.
    Delete { channel: String, algorithm: String },
    /// Show whether persistence is enabled and with which backend.
    Status,
}

fn load_settings(args: &Args) -> anyhow::Result<PersistenceSettings> {
    let mut settings = match &args.config {
        Some(path) => PersistenceSettings::from_json_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => PersistenceSettings::default(),
    };
    if let Some(persistence) = &args.persistence {
        settings.persistence = Some(persistence.clone());
    }
    if let Some(hash) = &args.hash {
        settings.hash.clone_from(hash);
    }
    Ok(settings)
}

async fn run(manager: &PersistenceManager, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::ListChannels => json!(manager.list_all_channels().await?),
        Command::ListAlgorithms { channel } => json!(manager.list_algorithms(&channel).await?),
        Command::ListChannelsWith { algorithm } => {
            json!(manager.list_all_channels_with_algorithm(&algorithm).await?)
        }
        Command::Has { channel, algorithm } => {
            json!(manager.has_algorithm(&channel, &algorithm).await?)
        }
        Command::DeleteAll => {
            manager.delete_all().await?;
            json!({ "deleted": "all" })
        }
        Command::DeleteChannel { channel } => {
            manager.delete_channel(&channel).await?;
            json!({ "deleted": { "channel": channel } })
        }
        Command::DeleteAlgorithm { algorithm } => {
            manager.delete_algorithm(&algorithm).await?;
            json!({ "deleted": { "algorithm": algorithm } })
        }
        Command::Delete { channel, algorithm } => {
            manager.delete(&channel, &algorithm).await?;
            json!({ "deleted": { "channel": channel, "algorithm": algorithm } })
        }
        Command::Status => json!({
            "enabled": manager.is_persistence_enabled(),
            "backend": manager.backend().name(),
            "hash": manager.hash_function().as_str(),
        }),
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    let settings = load_settings(&args)?;
    let registry = BackendRegistry::new(settings.datasources.clone());
    // Unlike the grid, the tool reports a broken configuration instead of
    // running with persistence disabled.
    let manager = PersistenceManager::try_from_settings(&settings, &registry)
        .await
        .context("configuring persistence")?;
    if !manager.is_persistence_enabled() && !matches!(args.command, Command::Status) {
        bail!("persistence is not configured: pass --persistence or --config");
    }

    let result = run(&manager, args.command).await;
    manager.close().await.context("closing persistence backend")?;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
