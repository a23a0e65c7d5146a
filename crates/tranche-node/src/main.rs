use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tranche_chain::{JsonRpcGateway, TokenEntry};
use tranche_core::{EngineConfig, EscrowEngine, ReconcileConfig, ReleaseConfig};
use tranche_store::{EscrowStore, MemoryStore};
use tranche_types::WalletAddress;

use tranche_node::{api, logging, metrics, NodeConfig};

#[derive(Parser)]
#[command(name = "tranche")]
#[command(about = "Tranche - milestone escrow and payment release node", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the escrow node
    Start {
        /// Port for the HTTP API, overriding the config file
        #[arg(long)]
        api_port: Option<u16>,
    },

    /// Write a default configuration file
    Init {
        /// Output directory for the configuration
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Commands::Start { api_port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(port) = api_port {
                config.api.port = port;
            }
            run_node(config).await
        }
        Commands::Init { output } => {
            std::fs::create_dir_all(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            let path = output.join("tranche-config.toml");
            NodeConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "⚙️ Wrote default configuration");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    if let Some(path) = path {
        return NodeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default_path = Path::new("./tranche-config.toml");
    if default_path.exists() {
        info!(path = %default_path.display(), "Loading configuration");
        return NodeConfig::from_file(default_path);
    }
    warn!("No configuration file found, using defaults");
    Ok(NodeConfig::default())
}

fn build_store(config: &NodeConfig) -> Result<Arc<dyn EscrowStore>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => {
            let path = config.node.data_dir.join("escrow");
            std::fs::create_dir_all(&config.node.data_dir)?;
            let store = tranche_store::RocksStore::new(
                path.to_str()
                    .ok_or_else(|| anyhow::anyhow!("non-utf8 data dir"))?,
            )?;
            Ok(Arc::new(store))
        }
        other => bail!(
            "unsupported storage backend '{}' (is the rocksdb feature enabled?)",
            other
        ),
    }
}

async fn run_node(config: NodeConfig) -> Result<()> {
    info!(
        name = %config.node.name,
        network = %config.chain.network,
        backend = %config.storage.backend,
        "🚀 Starting tranche node"
    );

    let store = build_store(&config)?;

    let custody: WalletAddress = config
        .chain
        .custody_address
        .parse()
        .map_err(|e| anyhow::anyhow!("bad custody address: {}", e))?;

    let gateway = Arc::new(JsonRpcGateway::new(
        config.chain.rpc_url.clone(),
        custody,
        config.chain.lookback_blocks,
    ));

    let mut tokens = Vec::new();
    for token in &config.chain.tokens {
        tokens.push(TokenEntry {
            symbol: token.symbol.clone(),
            network: token.network.clone(),
            address: token
                .address
                .parse()
                .map_err(|e| anyhow::anyhow!("bad contract address for {}: {}", token.symbol, e))?,
        });
    }
    let registry = tranche_chain::ContractRegistry::new(tokens);
    if registry.is_empty() {
        warn!("No token contracts configured; payment release will reject every call");
    }

    let engine_config = EngineConfig {
        release: ReleaseConfig {
            network: config.chain.network.clone(),
            custody,
            confirmation_depth: config.chain.confirmation_depth,
            confirm_timeout: Duration::from_secs(config.chain.confirm_timeout_secs),
            poll_interval: Duration::from_secs(config.chain.poll_interval_secs),
            backoff: Default::default(),
        },
        reconcile: ReconcileConfig {
            network: config.chain.network.clone(),
            match_window: chrono::Duration::hours(config.reconcile.match_window_hours),
        },
    };
    let engine = Arc::new(EscrowEngine::new(store, gateway, registry, engine_config));

    let node_metrics = metrics::Metrics::new();
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let api_handle = api::start_api_server(engine.clone(), node_metrics.clone(), addr);

    if config.reconcile.enabled {
        spawn_reconcile_task(
            engine.clone(),
            node_metrics.clone(),
            Duration::from_secs(config.reconcile.interval_secs),
        );
    }
    if config.anchor.enabled {
        spawn_anchor_task(engine.clone(), Duration::from_secs(config.anchor.interval_secs));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    api_handle.abort();
    Ok(())
}

fn spawn_reconcile_task(engine: Arc<EscrowEngine>, node_metrics: metrics::Metrics, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.reconciler.sweep().await {
                Ok(report) => {
                    for _ in 0..(report.healed + report.pending_resolved) {
                        node_metrics.payments_reconciled.inc();
                    }
                }
                Err(e) => warn!(error = %e, "Reconciliation sweep failed"),
            }
        }
    });
}

fn spawn_anchor_task(engine: Arc<EscrowEngine>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.anchors.anchor_pending().await {
                warn!(error = %e, "Anchoring failed");
            }
        }
    });
}
