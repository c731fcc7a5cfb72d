//! Ledger Engine
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────────┐    ┌──────────┐
//! │  Service │───▶│ Dispatcher │───▶│ StateMachine │───▶│  Store   │
//! │  (calls) │    │ (strategy) │    │  (handlers)  │    │ (PG/Mem) │
//! └──────────┘    └────────────┘    └──────────────┘    └────┬─────┘
//!                       ▲                                    │ outbox
//!                       └──────── QueuePoller ◀──────────────┘
//! ```
//!
//! Usage: `ledger_engine [--env <name>] [--in-memory]`

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ledger_engine::config::AppConfig;
use ledger_engine::db::Database;
use ledger_engine::fsm::{
    Dispatcher, MessageHandler, ProviderWorker, QueuePoller, RecoveryWorker, StrategyRegistry,
};
use ledger_engine::ledger::Provider;
use ledger_engine::logging::init_logging;
use ledger_engine::processor::TransactionProcessor;
use ledger_engine::provider::loopback::LoopbackProvider;
use ledger_engine::shutdown::ShutdownSignal;
use ledger_engine::store::{MemoryStore, PgStore, Store};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_in_memory() -> bool {
    std::env::args().any(|a| a == "--in-memory")
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for env '{env}'"))?;
    let _log_guard = init_logging(&config);

    info!(env = %env, git_hash = env!("GIT_HASH"), "Ledger engine starting");

    let store: Arc<dyn Store> = match (&config.postgres_url, use_in_memory()) {
        (Some(url), false) => {
            let db = Database::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check")?;
            db.migrate().await.context("applying ledger schema")?;
            Arc::new(PgStore::new(db.pool().clone()))
        }
        (None, false) => {
            warn!("No postgres_url configured, running on the in-memory store");
            Arc::new(MemoryStore::new())
        }
        (_, true) => {
            info!("Running on the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = Arc::new(StrategyRegistry::standard());
    info!(
        invoice_strategies = ?registry.invoice_strategies(),
        transaction_strategies = ?registry.transaction_strategies(),
        "Strategies registered"
    );

    let processor = TransactionProcessor::new(store.clone(), config.processor.queue_capacity);
    let processor_thread = processor
        .start(Handle::current())
        .context("spawning processor thread")?;

    let dispatcher: Arc<dyn MessageHandler> =
        Arc::new(Dispatcher::new(store.clone(), registry.clone()));

    // No production card gateway is wired yet; the loopback answers locally.
    warn!("Card provider is the loopback implementation");
    let provider_worker = ProviderWorker::new(store.clone())
        .with_provider(Arc::new(LoopbackProvider::new(Provider::Card)));
    let provider_topics = provider_worker.topics();
    let provider_worker: Arc<dyn MessageHandler> = Arc::new(provider_worker);

    let poll_interval = config.dispatcher.poll_interval();
    let mut pollers: Vec<QueuePoller> = config
        .dispatcher
        .topics
        .iter()
        .map(|topic| QueuePoller::new(topic.as_str(), store.clone(), dispatcher.clone()))
        .collect();
    pollers.extend(
        provider_topics
            .into_iter()
            .map(|topic| QueuePoller::new(topic, store.clone(), provider_worker.clone())),
    );

    let shutdown = Arc::new(ShutdownSignal::new());
    let mut loops: Vec<JoinHandle<()>> = Vec::new();
    for poller in pollers {
        let poller = poller.with_poll_interval(poll_interval);
        let shutdown = shutdown.clone();
        loops.push(tokio::spawn(async move { poller.run(shutdown).await }));
    }

    let recovery = RecoveryWorker::new(store.clone(), config.recovery.worker_config());
    {
        let shutdown = shutdown.clone();
        loops.push(tokio::spawn(async move { recovery.run(shutdown).await }));
    }

    info!(loops = loops.len(), "Ledger engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutdown requested");
    shutdown.request_shutdown();
    processor.shutdown();

    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background loop ended abnormally");
        }
    }
    let joined = tokio::task::spawn_blocking(move || processor_thread.join())
        .await
        .context("joining processor thread")?;
    if joined.is_err() {
        warn!("Processor thread panicked");
    }

    info!(stats = %processor.stats().snapshot(), "Ledger engine stopped");
    Ok(())
}
