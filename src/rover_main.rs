//! Chain indexer daemon
//!
//! Follows every configured network, filters transactions against the
//! registry, backfills new registrations, reconciles lock ownership, scans
//! for keys due for renewal, and accepts signed webhook deliveries.

use anyhow::{Context, Result};
use clap::Parser;
use rover::backfill::{BackfillTrigger, BackfillWorker, BACKFILL_QUEUE};
use rover::config::{load_registry_seed, Config};
use rover::events::{Event, EventDispatcher, EventLogger};
use rover::fetcher::BlockFetcher;
use rover::notify::{ExpirationNotifier, HttpNotifier};
use rover::reconciler::{OwnershipReconciler, RenewalScanner};
use rover::registry::{Registry, RegistrationHook};
use rover::rpc::{ChainProvider, RpcClient};
use rover::subgraph::SubgraphClient;
use rover::watcher::{NetworkWatcher, WatcherSettings};
use rover::websub::{self, WebhookIngress};
use rover::{Persistence, RocksStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Chain indexing and reconciliation daemon
#[derive(Parser)]
#[command(name = "rover")]
#[command(about = "Index registered addresses across chains and reconcile lock state")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "rover.toml")]
    config: PathBuf,

    /// Path to RocksDB database directory (overrides the configuration)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Path to registry seed file, one address per line (overrides the configuration)
    #[arg(short, long)]
    registry: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(registry) = args.registry {
        config.registry_file = Some(registry);
    }
    if config.networks.is_empty() {
        anyhow::bail!("No networks configured in {:?}", args.config);
    }

    info!("Starting rover");
    info!("Database: {:?}", config.db_path);
    for network in &config.networks {
        info!(network = network.id, "RPC URL: {}", network.rpc_url);
    }

    let store: Arc<dyn Persistence> = Arc::new(
        RocksStore::open(&config.db_path)
            .with_context(|| format!("Failed to open database at {:?}", config.db_path))?,
    );
    let registry = Arc::new(Registry::load(store.clone())?);

    let providers: Vec<(u64, Arc<dyn ChainProvider>)> = config
        .networks
        .iter()
        .map(|network| {
            let provider: Arc<dyn ChainProvider> =
                Arc::new(RpcClient::new(network.rpc_url.clone(), config.rpc_timeout()));
            (network.id, provider)
        })
        .collect();

    // Subscribers are fixed before anything is emitted.
    let (backfill_tx, backfill_rx) = mpsc::channel(BACKFILL_QUEUE);
    let mut builder = EventDispatcher::builder()
        .subscribe(Arc::new(EventLogger))
        .subscribe(Arc::new(RegistrationHook::new(registry.clone())))
        .subscribe(Arc::new(BackfillTrigger::new(backfill_tx)));
    match &config.notifier_url {
        Some(url) => {
            let notifier = HttpNotifier::new(url.clone(), config.rpc_timeout())?;
            builder = builder.subscribe(Arc::new(ExpirationNotifier::new(
                store.clone(),
                Arc::new(notifier),
            )));
        }
        None => warn!("No notifier_url configured; expiration notices are disabled"),
    }
    let dispatcher = Arc::new(builder.build());

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let mut worker = BackfillWorker::new(
        store.clone(),
        dispatcher.clone(),
        config.backfill_window,
        config.log_chunk,
    );
    for (network, provider) in &providers {
        worker = worker.with_network(*network, Some(provider.clone()));
    }
    tasks.push(tokio::spawn(worker.run(backfill_rx, cancel.clone())));

    // Seed the registry, then backfill every entry missing a completed
    // backfill on some network.
    if let Some(path) = &config.registry_file {
        let seed = load_registry_seed(path).context("Failed to load registry seed")?;
        info!("Loaded {} seed addresses", seed.len());
        for address in seed {
            registry.register(address)?;
        }
    }
    for entry in store.list_registry()? {
        let pending = config
            .networks
            .iter()
            .any(|network| !entry.backfilled_through.contains_key(&network.id));
        if pending {
            dispatcher
                .emit(Event::Registration {
                    address: entry.address,
                })
                .await;
        }
    }

    for ((network, provider), network_config) in providers.iter().zip(&config.networks) {
        let fetcher = BlockFetcher::new(
            *network,
            network_config.start_block,
            provider.clone(),
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
        );
        let watcher = NetworkWatcher::new(
            fetcher,
            provider.clone(),
            store.clone(),
            dispatcher.clone(),
            WatcherSettings::from_config(&config, network_config),
        );
        tasks.push(tokio::spawn(watcher.run(cancel.clone())));
    }

    let mut reconciler = OwnershipReconciler::new(store.clone());
    for (network, provider) in &providers {
        reconciler = reconciler.with_network(*network, provider.clone());
    }
    tasks.push(tokio::spawn(Arc::new(reconciler).run(
        registry.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
        cancel.clone(),
    )));

    let mut scanner = RenewalScanner::new(dispatcher.clone());
    let mut indexed = 0;
    for network in &config.networks {
        if let Some(url) = &network.subgraph_url {
            scanner = scanner.with_network(
                network.id,
                Arc::new(SubgraphClient::new(url.clone(), config.rpc_timeout())),
            );
            indexed += 1;
        }
    }
    if indexed > 0 {
        tasks.push(tokio::spawn(Arc::new(scanner).run(
            config.renewal_within(),
            Duration::from_secs(config.renewal_interval_secs),
            cancel.clone(),
        )));
    } else {
        warn!("No subgraph_url configured; renewal scans are disabled");
    }

    if config.webhook.secret.is_empty() {
        warn!("No webhook secret configured; webhook ingress is disabled");
    } else {
        let listener = tokio::net::TcpListener::bind(config.webhook.listen)
            .await
            .with_context(|| format!("Failed to bind webhook listener on {}", config.webhook.listen))?;
        let ingress = Arc::new(WebhookIngress::new(
            config.webhook.secret.clone().into_bytes(),
            dispatcher.clone(),
        ));
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = websub::serve(ingress, listener, cancel).await {
                error!("Webhook ingress stopped: {:#}", e);
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down gracefully...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed to stop cleanly: {}", e);
        }
    }

    info!("Rover stopped");
    Ok(())
}
