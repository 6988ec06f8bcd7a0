//! collection-sync: rebuild an account's card collection from transfer history
//!
//! Subcommands:
//! - `sync <address>`: scan, reconcile, fetch details and checkpoint
//! - `show <address>`: print the stored checkpoint
//! - `invalidate <address>`: drop the stored checkpoint
//! - `packs <address>`: list pending packs

use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use collection_sync::metadata::{CardDetailSource, GatewayFetcher, PlayerCatalog};
use collection_sync::packs::PendingPackTracker;
use collection_sync::{CheckpointStore, Config, JsonRpcLedger, SqliteCheckpointStore, SyncEngine};

#[derive(Parser)]
#[command(name = "collection-sync")]
#[command(about = "Rebuild a wallet's card collection from on-chain transfer history")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "collection-sync.toml")]
    config: PathBuf,

    /// Directory for the checkpoint database
    #[arg(short, long, env = "COLLECTION_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON-RPC endpoint (overrides config file)
    #[arg(long, env = "COLLECTION_SYNC_RPC_URL")]
    rpc_url: Option<String>,

    /// Card NFT contract address (overrides config file)
    #[arg(long, env = "CARD_NFT_ADDRESS")]
    card_contract: Option<Address>,

    /// Pack manager contract address (overrides config file)
    #[arg(long, env = "PACK_MANAGER_ADDRESS")]
    pack_contract: Option<Address>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize an account's holdings and update its checkpoint
    Sync { subject: Address },
    /// Print the stored checkpoint for an account
    Show { subject: Address },
    /// Delete the stored checkpoint for an account
    Invalidate { subject: Address },
    /// List an account's pending packs
    Packs { subject: Address },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("collection_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(data_dir) = cli.data_dir {
        config.cache.data_dir = data_dir;
    }
    if let Some(rpc_url) = cli.rpc_url {
        config.ledger.rpc_url = Some(rpc_url);
    }
    if let Some(card_contract) = cli.card_contract {
        config.ledger.card_contract = Some(card_contract);
    }
    if let Some(pack_contract) = cli.pack_contract {
        config.ledger.pack_contract = Some(pack_contract);
    }

    match cli.command {
        Command::Sync { subject } => sync(&config, subject).await,
        Command::Show { subject } => show(&config, subject),
        Command::Invalidate { subject } => {
            let store = open_store(&config)?;
            store.invalidate(&subject)?;
            info!(%subject, "Checkpoint invalidated");
            Ok(())
        }
        Command::Packs { subject } => packs(&config, subject).await,
    }
}

fn open_store(config: &Config) -> anyhow::Result<SqliteCheckpointStore> {
    SqliteCheckpointStore::open(&config.cache.data_dir)
        .with_context(|| format!("opening checkpoint store in {}", config.cache.data_dir.display()))
}

fn connect(config: &Config) -> anyhow::Result<Arc<JsonRpcLedger>> {
    let (rpc_url, card_contract) = config.ledger_endpoint()?;
    info!(rpc_url, %card_contract, "Connecting to ledger");
    let ledger = JsonRpcLedger::new(
        rpc_url,
        card_contract,
        config.ledger.pack_contract,
        config.request_timeout(),
    )?;
    Ok(Arc::new(ledger))
}

async fn sync(config: &Config, subject: Address) -> anyhow::Result<()> {
    let ledger = connect(config)?;
    let store = Arc::new(open_store(config)?);

    let gateway = if config.metadata.gateways.is_empty() {
        None
    } else {
        Some(GatewayFetcher::new(config.metadata.gateways.clone(), config.fetch_timeout())?)
    };
    let details = Arc::new(CardDetailSource::new(ledger.clone(), PlayerCatalog::builtin(), gateway));
    let engine = SyncEngine::new(ledger, store, details, config.sync_policy());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current window");
            let _ = cancel_tx.send(true);
        }
    });

    let report = engine.sync_with_cancel(subject, cancel_rx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show(config: &Config, subject: Address) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match store.load(&subject) {
        Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint.to_blob())?),
        None => println!("No checkpoint for {}", subject),
    }
    Ok(())
}

async fn packs(config: &Config, subject: Address) -> anyhow::Result<()> {
    let ledger = connect(config)?;
    let tracker = PendingPackTracker::new(ledger);
    let packs = tracker.pending_packs(subject).await?;
    println!("{}", serde_json::to_string_pretty(&packs)?);
    Ok(())
}
