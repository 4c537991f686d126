// =============================================================================
// Pulse Bot — Main Entry Point
// =============================================================================
//
// Perpetual-futures scalper: per-symbol market-data streams feed a
// probabilistic signal analyser; a supervisor ranks and opens entries; a
// protection loop walks every position through the averaging / trailing-stop
// regime machine. Paper mode simulates fills locally and never touches the
// protection machinery.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod config;
mod lock;
mod market_data;
mod position;
mod protection;
mod risk;
mod session;
mod signal;
mod supervisor;
mod trader;
mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::client::FuturesClient;
use crate::binance::Backoff;
use crate::config::BotConfig;
use crate::lock::LockFile;
use crate::market_data::MarketDataEngine;
use crate::risk::RiskEngine;
use crate::signal::SignalAnalyzer;
use crate::supervisor::Supervisor;
use crate::trader::{LiveTrader, PaperTrader, Trader};
use crate::types::TradeMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let config = BotConfig::load("config.json").unwrap_or_else(|e| {
        eprintln!("failed to load config.json ({e}), using defaults");
        BotConfig::default()
    });

    std::fs::create_dir_all("logs")?;
    let file_appender = tracing_appender::rolling::daily("logs", "pulse-bot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!("Pulse Bot starting up");

    let mut config = config;
    // Env credentials take precedence over the config file.
    if let Ok(key) = std::env::var("PULSE_API_KEY") {
        config.api.key = key;
    }
    if let Ok(secret) = std::env::var("PULSE_API_SECRET") {
        config.api.secret = secret;
    }
    config.validate()?;

    // ── 2. Duplicate-process prevention ──────────────────────────────────
    let _lock = LockFile::acquire("bot.lock", config.safety.auto_terminate_duplicates)?;

    info!(
        mode = %config.mode,
        pairs = ?config.pairs,
        testnet = config.api.testnet,
        "configuration active"
    );

    // ── 3. Core subsystems ───────────────────────────────────────────────
    let client = Arc::new(FuturesClient::new(
        config.api.key.clone(),
        config.api.secret.clone(),
        config.api.testnet,
    ));
    let analyzer = Arc::new(SignalAnalyzer::new(&config));
    let mode = config.mode;
    let pairs = config.pairs.clone();
    let config = Arc::new(RwLock::new(config));

    let market_data = Arc::new(MarketDataEngine::new());
    let risk = Arc::new(RiskEngine::new(client.clone(), config.clone()));

    let (trader, live_trader): (Arc<dyn Trader>, Option<Arc<LiveTrader>>) = match mode {
        TradeMode::LiveTrading => {
            risk.load_symbol_limits().await?;
            let live = LiveTrader::init(client.clone(), risk.clone(), config.clone()).await?;
            (live.clone(), Some(live))
        }
        TradeMode::PaperTrading => {
            let paper = Arc::new(PaperTrader::new(&config.read()));
            (paper, None)
        }
    };

    let state = Arc::new(AppState::new(
        config.clone(),
        client.clone(),
        market_data.clone(),
        analyzer,
        risk.clone(),
        trader,
        live_trader.clone(),
    ));

    // Startup hygiene: clear orphans left over from a previous run.
    if let Some(ref live) = live_trader {
        let cancelled = protection::run_order_hygiene(live).await;
        if cancelled > 0 {
            state.push_event(format!("Startup cleanup removed {cancelled} orders"), "info");
        }
    }

    // ── 4. Market-data streams ───────────────────────────────────────────
    for symbol in &pairs {
        spawn_stream(state.clone(), symbol.clone(), StreamKind::Depth);
        spawn_stream(state.clone(), symbol.clone(), StreamKind::AggTrade);
        spawn_stream(state.clone(), symbol.clone(), StreamKind::BookTicker);
    }
    info!(count = pairs.len() * 3, "market data streams launched");

    // ── 5. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("PULSE_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3400".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 6. Supervisor loop (every 500 ms) ────────────────────────────────
    let supervisor_state = state.clone();
    tokio::spawn(async move {
        // Let the streams warm up before the first pass.
        tokio::time::sleep(Duration::from_secs(5)).await;
        info!("supervisor loop starting");

        let supervisor = Supervisor::new(supervisor_state.clone());
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            if !supervisor_state.is_running() {
                continue;
            }
            supervisor.tick().await;
        }
    });

    // ── 7. Periodic statistics log (every 60 s) ──────────────────────────
    let stats_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;

            let signals = stats_state.current_signals.read();
            let long_count = signals
                .values()
                .filter(|s| s.direction == signal::Direction::Long)
                .count();
            let short_count = signals
                .values()
                .filter(|s| s.direction == signal::Direction::Short)
                .count();
            let tracked = signals.len();
            drop(signals);

            let balance = stats_state.trader.balance();
            let pnl = balance - stats_state.trader.starting_balance();
            let stats = stats_state.connection_stats.read().clone();

            info!(
                long_signals = long_count,
                short_signals = short_count,
                pairs = tracked,
                balance = format!("{balance:.2}").as_str(),
                pnl = format!("{pnl:+.2}").as_str(),
                reconnects = stats.reconnects,
                last_error = stats.last_error.as_deref().unwrap_or("none"),
                "periodic status"
            );
        }
    });

    // ── 8. Protection loop (live mode only) ──────────────────────────────
    if let Some(live) = live_trader.clone() {
        let protection_state = state.clone();
        tokio::spawn(async move {
            let (refresh_secs, cleanup_secs) = {
                let cfg = &protection_state.config.read().risk;
                (cfg.protective_refresh_interval, cfg.order_cleanup_interval)
            };
            let mut interval = tokio::time::interval(Duration::from_secs_f64(refresh_secs));
            let cleanup_interval = Duration::from_secs_f64(cleanup_secs);
            let mut last_cleanup = Instant::now();

            loop {
                interval.tick().await;
                if !protection_state.is_running() {
                    continue;
                }

                // Refresh first so the regime machine sees fresh marks and
                // never clobbers order ids.
                if let Err(e) = live.refresh_all_positions().await {
                    warn!(error = %e, "position refresh failed");
                    continue;
                }

                protection::run_protection_tick(&live, protection_state.single_order_mode()).await;

                if last_cleanup.elapsed() >= cleanup_interval {
                    protection::run_order_hygiene(&live).await;
                    match live.client.open_orders(None).await {
                        Ok(orders) => {
                            *protection_state.open_orders_cache.write() = orders;
                            protection_state.increment_version();
                        }
                        Err(e) => warn!(error = %e, "open-order cache refresh failed"),
                    }
                    last_cleanup = Instant::now();
                }
            }
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");
    state.set_running(false);

    let close_on_stop = state.config.read().bot_behavior.close_positions_on_stop;
    let open_positions = state.trader.positions();
    if !open_positions.is_empty() {
        if close_on_stop {
            info!(count = open_positions.len(), "closing all open positions");
            let mut prices = std::collections::HashMap::new();
            for position in &open_positions {
                let price = market_data.current_price(&client, &position.symbol).await;
                if price > 0.0 {
                    prices.insert(position.symbol.clone(), price);
                }
            }
            let closed = state.trader.close_all_positions(&prices).await;
            info!(count = closed.len(), "positions closed on shutdown");
        } else {
            info!(
                count = open_positions.len(),
                "leaving open positions on the exchange"
            );
        }
    }

    if state.config.read().logging.save_session {
        if let Err(e) = session::save_session(&state, session::default_session_path()) {
            error!(error = %e, "failed to save session summary");
        }
    }

    let stats = state.trader.statistics();
    info!(
        starting_balance = state.trader.starting_balance(),
        final_balance = state.trader.balance(),
        total_trades = stats.total_trades,
        win_rate = format!("{:.1}%", stats.win_rate).as_str(),
        profit_factor = format!("{:.2}", stats.profit_factor).as_str(),
        "final statistics"
    );
    info!("Pulse Bot shut down complete");
    Ok(())
}

// =============================================================================
// Stream supervision
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Depth,
    AggTrade,
    BookTicker,
}

/// Run one market-data stream forever, reconnecting with exponential backoff
/// on failure and resetting the backoff after a healthy connection.
fn spawn_stream(state: Arc<AppState>, symbol: String, kind: StreamKind) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        loop {
            let result = match kind {
                StreamKind::Depth => {
                    market_data::streams::run_depth_stream(
                        &symbol,
                        &state.client,
                        &state.market_data,
                    )
                    .await
                }
                StreamKind::AggTrade => {
                    market_data::streams::run_agg_trade_stream(
                        &symbol,
                        &state.client,
                        &state.market_data,
                    )
                    .await
                }
                StreamKind::BookTicker => {
                    market_data::streams::run_book_ticker_stream(
                        &symbol,
                        &state.client,
                        &state.market_data,
                    )
                    .await
                }
            };

            let delay = match result {
                Ok(()) => {
                    // Clean disconnect: quick reconnect, backoff reset.
                    backoff.reset();
                    Duration::from_millis(500)
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        symbol = %symbol,
                        kind = ?kind,
                        error = %e,
                        retry_in = ?delay,
                        "stream error, reconnecting"
                    );
                    let mut stats = state.connection_stats.write();
                    stats.reconnects += 1;
                    stats.last_error = Some(e.to_string());
                    stats.backoff_secs = delay.as_secs_f64();
                    drop(stats);
                    delay
                }
            };

            tokio::time::sleep(delay).await;
        }
    });
}
