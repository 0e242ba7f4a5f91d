//! Phoenix governance runner - PAPER TRADING ONLY
//!
//! Runs the full governance stack (supervisor, tier derivation, lifecycle
//! book, reconciliation, halt propagation) against the simulated brokerage
//! and serves `/metrics`, `/status` and `/health` over HTTP.
//!
//! Optionally drives a trickle of small demo orders so the lifecycle and
//! reconciliation paths see traffic. Every order goes through the same
//! tier and halt gates a live strategy would.

use anyhow::{Context, Result};
use clap::Parser;
use phoenix_bins::common::{log_status, CommonArgs};
use phoenix_core::core::{CancelToken, Clock, LifecycleError, Side, SystemClock};
use phoenix_core::monitoring::{MetricsRegistry, StatusServer, StatusServerConfig, StatusSource};
use phoenix_core::resilience::install_panic_handler;
use phoenix_core::PhoenixRuntime;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Phoenix governance runner (paper trading)")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Demo orders to place over the run (0 = governance only)
    #[arg(long, default_value = "0")]
    orders: u32,

    /// Seconds between demo orders
    #[arg(long, default_value = "10")]
    order_interval_secs: u64,

    /// Symbols the demo orders rotate through
    #[arg(long, value_delimiter = ',', default_value = "AAPL,MSFT,SPY")]
    symbols: Vec<String>,

    /// Seconds between status log lines
    #[arg(long, default_value = "30")]
    status_interval_secs: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.common.init()?;

    install_panic_handler();

    info!("=== Phoenix: governance runner + PAPER TRADING ===");
    warn!("PAPER TRADING MODE - simulated brokerage, no real orders");
    info!("Account: {}", config.broker.account_id);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics_enabled = config.metrics.enabled;
    let listen_addr = config.metrics.listen_addr.clone();
    let install_signals = config.halt.install_signal_handlers;

    let runtime = PhoenixRuntime::from_config(config, clock.clone())?;

    info!("Connecting to brokerage...");
    runtime.connect().context("Initial connection failed")?;
    runtime.spawn().context("Failed to start supervisor threads")?;
    info!("Supervisor and engine threads running");

    if install_signals {
        runtime
            .install_signal_handlers()
            .context("Failed to install halt signal handlers")?;
        info!("SIGTERM -> EXIT_ONLY cascade, SIGUSR1 -> FREEZE cascade");
    }

    // Status server on a small tokio runtime; the governance threads stay sync
    let server_rt = if metrics_enabled {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("phoenix-status")
            .enable_all()
            .build()
            .context("Failed to build status server runtime")?;
        let registry = Arc::new(MetricsRegistry::new()?);
        let source: Arc<dyn StatusSource> = runtime.clone();
        let server = StatusServer::new(
            StatusServerConfig {
                listen_addr: listen_addr.parse().context("Invalid metrics.listen_addr")?,
            },
            registry,
            source,
        );
        rt.spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Status server stopped: {:#}", e);
            }
        });
        Some(rt)
    } else {
        info!("Metrics disabled");
        None
    };

    let stop = CancelToken::new();
    let stop_ctrlc = stop.clone();
    ctrlc::set_handler(move || {
        warn!("Received Ctrl+C, initiating graceful shutdown...");
        stop_ctrlc.cancel();
    })?;

    info!("Press Ctrl+C to stop gracefully");
    run_loop(&runtime, &args, clock.as_ref(), &stop);

    log_status(&runtime.status());
    runtime.shutdown();
    if let Some(rt) = server_rt {
        rt.shutdown_timeout(Duration::from_secs(1));
    }

    match runtime.audit().verify() {
        Ok(()) => info!("Audit chain verified ({} records)", runtime.audit().len()),
        Err(e) => error!("Audit chain verification failed: {}", e),
    }
    Ok(())
}

fn run_loop(runtime: &Arc<PhoenixRuntime>, args: &Args, clock: &dyn Clock, stop: &CancelToken) {
    let status_every = Duration::from_secs(args.status_interval_secs.max(1));
    let order_every = Duration::from_secs(args.order_interval_secs.max(1));
    let mut next_status = clock.now() + status_every;
    let mut next_order = clock.now() + order_every;
    let mut placed = 0u32;

    while !stop.wait_for(Duration::from_millis(250)) {
        let now = clock.now();
        if now >= next_status {
            next_status = now + status_every;
            log_status(&runtime.status());
        }
        if placed < args.orders && !args.symbols.is_empty() && now >= next_order {
            next_order = now + order_every;
            let symbol = &args.symbols[placed as usize % args.symbols.len()];
            let side = if placed % 2 == 0 { Side::Buy } else { Side::Sell };
            place_demo_order(runtime, symbol, side);
            placed += 1;
        }
    }
}

fn place_demo_order(runtime: &PhoenixRuntime, symbol: &str, side: Side) {
    let book = runtime.book();
    let id = match book.propose(symbol, side, Decimal::ONE, None) {
        Ok(id) => id,
        Err(e) => {
            warn!("Demo proposal refused: {}", e);
            return;
        }
    };
    if let Err(e) = book.approve(id, "demo auto-approval") {
        warn!("{} approval refused: {}", id, e);
        return;
    }
    match book.submit(id) {
        Ok(()) => info!("{} submitted: {} 1 {}", id, side, symbol),
        Err(LifecycleError::TierGated(tier)) => {
            warn!("{} held at tier {}; cancelling", id, tier);
            if let Err(e) = book.cancel(id, "tier gated demo order") {
                warn!("{} cancel failed: {}", id, e);
            }
        }
        Err(e) => warn!("{} submit failed: {}", id, e),
    }
}
