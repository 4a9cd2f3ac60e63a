// =============================================================================
// Meridian Equity Fleet — Worker Entry Point
// =============================================================================
//
// One process is one worker. The fleet coordinates purely through the store:
// symbol locks, worker rows, and the shared order ledger. Exit codes:
//   0 success, 1 configuration error, 2 infrastructure error, 130 SIGINT.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod broker;
mod clock;
mod config;
mod error;
mod lifecycle;
mod lock;
mod notify;
mod orders;
mod pnl;
mod poller;
mod recovery;
mod session;
mod store;
mod strategy;
mod types;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerPort, RateLimiter, RestBroker};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Credentials};
use crate::error::TradeError;
use crate::lifecycle::WorkerLifecycleService;
use crate::lock::LockService;
use crate::notify::Notifier;
use crate::orders::OrderService;
use crate::pnl::DailySummaryService;
use crate::store::PgStore;
use crate::strategy::{build_strategy, StrategyExecutor};
use crate::worker::{Worker, WorkerServices, WorkerShared};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "meridian-bot", about = "Equity trading worker fleet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Worker process management
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Probe a running worker's health endpoint
    Health {
        /// Address of the worker API (defaults to the local bind address)
        #[arg(long, default_value = "127.0.0.1:3701")]
        addr: String,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Start a trading worker
    Start {
        /// Worker identity; generated from host + uuid when omitted
        #[arg(long)]
        worker_id: Option<String>,

        /// Optional JSON config file (env still overrides)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log filter, e.g. "info" or "meridian_bot=debug"
        #[arg(long)]
        log_level: Option<String>,

        /// Shorthand for --log-level debug
        #[arg(long)]
        debug: bool,
    },
}

// ── Entry ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenv::dotenv();

    let code = match cli.command {
        Command::Worker {
            action:
                WorkerAction::Start {
                    worker_id,
                    config,
                    log_level,
                    debug,
                },
        } => {
            init_tracing(log_level.as_deref(), debug);
            run_worker(worker_id, config.as_deref()).await
        }
        Command::Health { addr } => {
            init_tracing(None, false);
            run_health_probe(&addr).await
        }
    };

    std::process::exit(code);
}

fn init_tracing(log_level: Option<&str>, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if let Some(level) = log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ── Worker start ─────────────────────────────────────────────────────────────

async fn run_worker(worker_id: Option<String>, config_path: Option<&std::path::Path>) -> i32 {
    let interrupted = Arc::new(AtomicBool::new(false));

    match try_run_worker(worker_id, config_path, interrupted.clone()).await {
        Ok(()) => {
            if interrupted.load(Ordering::SeqCst) {
                130
            } else {
                0
            }
        }
        Err(e) => {
            error!(error = %e, "worker failed");
            e.exit_code()
        }
    }
}

async fn try_run_worker(
    worker_id: Option<String>,
    config_path: Option<&std::path::Path>,
    interrupted: Arc<AtomicBool>,
) -> Result<(), TradeError> {
    // ── 1. Configuration & credentials ───────────────────────────────────
    let config = Config::load(config_path)?;
    let creds = Credentials::from_env()?;

    let worker_id = worker_id.unwrap_or_else(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".into());
        format!("{host}-{}", uuid::Uuid::new_v4())
    });

    info!(
        worker_id = %worker_id,
        trading_mode = %config.trading_mode,
        universe = ?config.universe,
        strategy = %config.strategy_name,
        "Meridian worker starting"
    );

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = PgStore::connect(&config.database_url).await?;

    // ── 3. Broker adapter ────────────────────────────────────────────────
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_sec));
    let account_id = creds.account_number.clone();
    let broker: Arc<dyn BrokerPort> =
        Arc::new(RestBroker::new(&config, creds, limiter)?);

    // ── 4. Service graph ─────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier = Arc::new(Notifier::from_config(&config));
    let locks = Arc::new(LockService::new(Arc::new(store.clone()), clock.clone()));
    let lifecycle = Arc::new(WorkerLifecycleService::new(
        Arc::new(store.clone()),
        locks.clone(),
        clock.clone(),
    ));
    let orders = Arc::new(OrderService::new(
        Arc::new(store.clone()),
        broker.clone(),
        notifier.clone(),
        clock.clone(),
        account_id.clone(),
    ));
    let summaries = Arc::new(DailySummaryService::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        clock.clone(),
    ));
    let strategy = Arc::new(StrategyExecutor::new(
        build_strategy(&config.strategy_name, &config.strategy_params)?,
        config.min_buy_confidence,
    ));

    // ── 5. Shared state, shutdown & API server ───────────────────────────
    let shared = Arc::new(WorkerShared::new(&worker_id, clock.now()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx, interrupted);

    let api_shared = shared.clone();
    let api_clock = clock.clone();
    let api_shutdown = shutdown_rx.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::rest::serve(&bind_addr, api_shared, api_clock, api_shutdown).await {
            warn!(error = %e, "API server stopped");
        }
    });

    // ── 6. Run the worker ────────────────────────────────────────────────
    let shutdown_deadline = config.shutdown_deadline();
    let worker = Worker::new(
        worker_id.clone(),
        account_id,
        config,
        WorkerServices {
            clock,
            broker,
            locks,
            lifecycle,
            orders,
            order_store: Arc::new(store.clone()),
            strategy,
            summaries,
            notifier,
        },
        shared,
        shutdown_rx.clone(),
    );

    let mut handle = tokio::spawn(worker.run());
    let mut shutdown_watch = shutdown_rx;

    let outcome = tokio::select! {
        res = &mut handle => res,
        _ = shutdown_watch.wait_for(|stopped| *stopped) => {
            // Cooperative teardown, bounded by the shutdown deadline; past it
            // the process leaves cleanup to lock TTL and the fleet sweepers.
            warn!("shutdown signal received — draining within deadline");
            match tokio::time::timeout(shutdown_deadline, &mut handle).await {
                Ok(res) => res,
                Err(_) => {
                    error!(
                        deadline_secs = shutdown_deadline.as_secs(),
                        "shutdown deadline exceeded — aborting worker task"
                    );
                    handle.abort();
                    return Err(TradeError::Invariant(
                        "worker did not drain before the shutdown deadline".into(),
                    ));
                }
            }
        }
    };

    match outcome {
        Ok(result) => result,
        Err(join_err) => Err(TradeError::Invariant(format!(
            "worker task panicked: {join_err}"
        ))),
    }
}

/// SIGINT/SIGTERM handler: only flips the shared shutdown flag.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    interrupted.store(true, Ordering::SeqCst);
                    warn!("SIGINT received");
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            interrupted.store(true, Ordering::SeqCst);
            warn!("interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });
}

// ── Health probe ─────────────────────────────────────────────────────────────

async fn run_health_probe(addr: &str) -> i32 {
    let url = format!("http://{addr}/api/v1/health");
    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build http client");
            return 2;
        }
    };

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.text().await.unwrap_or_default();
            println!("{body}");
            0
        }
        Ok(resp) => {
            error!(status = %resp.status(), url, "worker unhealthy");
            2
        }
        Err(e) => {
            error!(error = %e, url, "worker unreachable");
            2
        }
    }
}
