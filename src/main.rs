// =============================================================================
// Bandline — Bollinger band-cross futures trading daemon
// =============================================================================
//
// Wiring only: every long-lived value is constructed here and threaded into
// the tasks that need it. Three tasks run for the life of the process: the
// market feed (stream socket), the engine (sole writer of positions/trades),
// and the dashboard HTTP server (read-only).
//
// Exit codes: 0 clean shutdown, 2 fatal config error, 3 exchange unreachable
// after bootstrap retries, 4 storage open failure.
// =============================================================================

mod adapter;
mod binance;
mod config;
mod engine;
mod feed;
mod indicator;
mod store;
mod types;
mod web;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter::{LiveAdapter, SimAdapter, TradeAdapter};
use crate::binance::BinanceClient;
use crate::config::BotConfig;
use crate::engine::Engine;
use crate::feed::{MarketFeed, BAR_CHANNEL_CAPACITY};
use crate::store::Store;
use crate::types::Mode;
use crate::web::AppState;

const EXIT_CONFIG: i32 = 2;
const EXIT_EXCHANGE: i32 = 3;
const EXIT_STORAGE: i32 = 4;

/// REST bootstrap attempts before the engine refuses to start.
const BOOTSTRAP_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = run().await;
    if code != 0 {
        std::process::exit(code);
    }
}

async fn run() -> i32 {
    info!("bandline starting up");

    // ── 1. Config ────────────────────────────────────────────────────────
    let config_path =
        std::env::var("BANDLINE_CONFIG").unwrap_or_else(|_| "bandline.json".to_string());
    let config = match BotConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "fatal config error");
            return EXIT_CONFIG;
        }
    };

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = match Store::open(&config.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, path = %config.db_path, "failed to open store");
            return EXIT_STORAGE;
        }
    };

    // ── 3. Exchange client + trading adapter ─────────────────────────────
    let client = BinanceClient::new(config.api_key.clone(), config.api_secret.clone());
    let sim_price = Arc::new(parking_lot::Mutex::new(0.0_f64));

    let adapter: Arc<dyn TradeAdapter> = match config.mode {
        Mode::Live => {
            match LiveAdapter::connect(client.clone(), &config.symbol, config.fee_rate).await {
                Ok(live) => Arc::new(live),
                Err(e) => {
                    error!(error = %e, "cannot reach exchange to set up the live adapter");
                    return EXIT_EXCHANGE;
                }
            }
        }
        Mode::Sim => {
            let sim = Arc::new(SimAdapter::new(
                config.symbol.clone(),
                config.sim_balance,
                config.fee_rate,
                config.lot_step,
                sim_price.clone(),
            ));
            // The store's position row is canonical; replay it into the
            // fresh adapter so closes keep working across restarts.
            match store.get_position(&config.symbol) {
                Ok(Some(pos)) => sim.restore_position(pos.side, pos.qty, pos.entry_price),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "failed to read stored position");
                    return EXIT_STORAGE;
                }
            }
            sim
        }
    };

    // ── 4. Market feed + bootstrap ───────────────────────────────────────
    let last_price = Arc::new(parking_lot::RwLock::new(0.0_f64));
    let (bar_tx, bar_rx) = tokio::sync::mpsc::channel(BAR_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let market_feed = MarketFeed::new(
        client,
        store.clone(),
        config.symbol.clone(),
        config.interval,
        config.boll_period,
        last_price.clone(),
        bar_tx,
    );

    let mut attempt = 0;
    loop {
        match market_feed.bootstrap().await {
            Ok(_) => break,
            Err(e) => {
                attempt += 1;
                if attempt >= BOOTSTRAP_ATTEMPTS {
                    error!(error = %e, attempts = attempt, "bootstrap failed, refusing to start");
                    return EXIT_EXCHANGE;
                }
                let backoff = Duration::from_secs(1 << attempt.min(4));
                warn!(error = %e, attempt, backoff_s = backoff.as_secs(), "bootstrap failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }

    // ── 5. Engine + state recovery ───────────────────────────────────────
    let sim_cell = (config.mode == Mode::Sim).then(|| sim_price.clone());
    let (mut engine, engine_handle) =
        Engine::new(config.clone(), store.clone(), adapter, sim_cell);
    if let Err(e) = engine.recover_state().await {
        error!(error = %e, "startup state recovery failed");
        return EXIT_EXCHANGE;
    }

    // ── 6. Dashboard ─────────────────────────────────────────────────────
    let app_state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        engine: engine_handle,
        last_price: last_price.clone(),
    });
    let bind_addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind dashboard listener");
            return 1;
        }
    };
    info!(addr = %bind_addr, "dashboard listening");

    let mut web_shutdown = shutdown_rx.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, web::router(app_state))
            .with_graceful_shutdown(async move {
                let _ = web_shutdown.changed().await;
            })
            .await
        {
            error!(error = %e, "dashboard server failed");
        }
    });

    // ── 7. Feed + engine tasks ───────────────────────────────────────────
    let feed_task = tokio::spawn(market_feed.run(shutdown_rx.clone()));
    let mut engine_task = tokio::spawn(engine.run(bar_rx, shutdown_rx));

    info!("all tasks running; press Ctrl+C to stop");

    // ── 8. Shutdown ──────────────────────────────────────────────────────
    let mut code = 0;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            let _ = shutdown_tx.send(true);
            // The engine drains pending bars under its own 3 s deadline.
            match (&mut engine_task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "engine failed while draining");
                    code = 1;
                }
                Err(e) => {
                    error!(error = %e, "engine task panicked during shutdown");
                    code = 1;
                }
            }
        }
        result = &mut engine_task => {
            match result {
                Ok(Ok(())) => info!("engine exited"),
                Ok(Err(e)) => {
                    // Fatal store error or invariant violation: restart and
                    // re-derive state from the venue.
                    error!(error = %e, "engine halted on a fatal error");
                    code = 1;
                }
                Err(e) => {
                    error!(error = %e, "engine task panicked");
                    code = 1;
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = feed_task.await;
    if tokio::time::timeout(Duration::from_secs(5), web_task)
        .await
        .is_err()
    {
        warn!("dashboard did not stop within its deadline");
    }

    info!("bandline shut down complete");
    code
}
