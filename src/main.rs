mod chain;
mod config;
mod confirmation;
mod contracts;
mod db;
mod engine;
mod events;
mod keys;
mod observer;
mod registry;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use eyre::eyre;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use chain::ChainContext;
use config::Config;
use engine::{PairEngine, RetryEngine, SwapEngine};
use observer::ChainObserver;
use registry::PairRegistry;
use types::Direction;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting swap bridge engine");

    // Load configuration; configuration-level faults are fatal.
    let config = Config::load()?;
    info!(
        chains = config.chains.len(),
        directions = config.directions().len(),
        "Configuration loaded"
    );

    // Connect to database and run migrations
    let db = db::create_pool(&config.database.url).await?;
    info!("Database connected");
    db::run_migrations(&db).await?;
    info!("Database migrations complete");

    // Fetch signing keys once; they live only in process memory.
    let key_source = keys::from_config(&config.keys)?;
    let chain_names: Vec<String> = config.chains.iter().map(|c| c.name.clone()).collect();
    let key_material = key_source.signing_keys(&chain_names).await?;

    // One chain context per watched chain; a bad agent address or key
    // aborts startup here.
    let mut chains: HashMap<String, Arc<ChainContext>> = HashMap::new();
    for chain_cfg in &config.chains {
        let key = key_material
            .get(&chain_cfg.name)
            .ok_or_else(|| eyre!("no signing key for chain {}", chain_cfg.name))?;
        let ctx = Arc::new(ChainContext::new(chain_cfg, &config.engine, key)?);
        info!(
            chain = %ctx.name,
            chain_id = ctx.chain_id,
            agent = %ctx.agent,
            operator = %ctx.operator,
            "Chain context ready"
        );
        chains.insert(chain_cfg.name.clone(), ctx);
    }

    // Rebuild the pair registry from finalized records.
    let registry = Arc::new(PairRegistry::new());
    let loaded = registry.bootstrap(&db).await?;
    info!(pairs = loaded, "Pair registry bootstrapped");

    // Shutdown flag, flipped by SIGINT/SIGTERM. Loops check it between
    // ticks so in-flight calls finish or time out naturally.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut join_set: JoinSet<eyre::Result<()>> = JoinSet::new();

    // One observer per chain.
    for chain_cfg in &config.chains {
        let ctx = chains[&chain_cfg.name].clone();
        let observer = ChainObserver::new(ctx, db.clone(), chain_cfg, &config.engine, &config);
        let rx = shutdown_rx.clone();
        join_set.spawn(async move { observer.run(rx).await });
    }

    // Swap pipelines: one per ordered chain pair.
    let swap_engine = Arc::new(SwapEngine::new(
        db.clone(),
        registry.clone(),
        chains.clone(),
        config.engine.clone(),
    ));
    swap_engine.spawn(config.directions(), &mut join_set, &shutdown_rx);

    // Registration pipelines: one per chain with a counterpart.
    let pair_directions: Vec<Direction> = config
        .chains
        .iter()
        .filter_map(|c| {
            c.counterpart
                .as_ref()
                .map(|cp| Direction::new(c.name.clone(), cp.clone()))
        })
        .collect();
    let pair_engine = Arc::new(PairEngine::new(
        db.clone(),
        registry.clone(),
        chains.clone(),
        config.engine.clone(),
    ));
    pair_engine.spawn(pair_directions, &mut join_set, &shutdown_rx);

    // Retry pipeline for administratively re-queued swaps.
    let retry_engine = Arc::new(RetryEngine::new(db, registry, chains, config.engine.clone()));
    retry_engine.spawn(&mut join_set, &shutdown_rx);

    info!(tasks = join_set.len(), "All pipelines running");

    // The engine never returns on its own; a loop exiting outside shutdown
    // is fatal.
    while let Some(result) = join_set.join_next().await {
        let stopping = *shutdown_rx.borrow();
        match result {
            Ok(Ok(())) if stopping => continue,
            Ok(Ok(())) => {
                error!("A pipeline exited unexpectedly");
                return Err(eyre!("pipeline exited unexpectedly"));
            }
            Ok(Err(err)) => {
                error!(error = %err, "A pipeline stopped with error");
                return Err(err);
            }
            Err(err) => {
                error!(error = %err, "A pipeline task panicked");
                return Err(eyre!("pipeline task panicked: {err}"));
            }
        }
    }

    info!("Swap bridge engine stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_operator=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
