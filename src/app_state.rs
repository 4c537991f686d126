// =============================================================================
// Central Application State — Pulse Trading Engine
// =============================================================================
//
// The single source of truth tying the subsystems together. Every async task
// holds an Arc<AppState>; the GUI surface reads serialisable snapshots built
// here and pushed over the WebSocket feed whenever the version counter moves.
//
// Thread safety: parking_lot::RwLock for shared collections, atomics for the
// version counter. No lock is held across an await.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::client::FuturesClient;
use crate::binance::models::OrderInfo;
use crate::config::BotConfig;
use crate::market_data::MarketDataEngine;
use crate::position::{ClosedTrade, Position, TradeStatistics};
use crate::risk::RiskEngine;
use crate::signal::{Signal, SignalAnalyzer};
use crate::trader::{LiveTrader, Trader};
use crate::types::TradeMode;

/// Maximum number of event lines retained for the GUI log.
const MAX_EVENTS: usize = 200;

/// One line in the GUI event log.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub message: String,
    /// "info" | "success" | "error".
    pub kind: String,
    pub at: String,
}

/// Connection health counters surfaced as the GUI status dot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub reconnects: u64,
    pub last_error: Option<String>,
    pub backoff_secs: f64,
}

pub struct AppState {
    /// Bumped on every meaningful mutation; drives the WebSocket push feed.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<BotConfig>>,
    pub mode: TradeMode,

    pub client: Arc<FuturesClient>,
    pub market_data: Arc<MarketDataEngine>,
    pub analyzer: Arc<SignalAnalyzer>,
    pub risk: Arc<RiskEngine>,

    pub trader: Arc<dyn Trader>,
    /// Present only in live mode; the protection loop needs the concrete type.
    pub live_trader: Option<Arc<LiveTrader>>,

    /// Latest signal per symbol, kept for the GUI.
    pub current_signals: RwLock<HashMap<String, Signal>>,
    /// Highest-priority signal parked while eco mode blocks new entries.
    pub pending_signal: RwLock<Option<Signal>>,
    pub single_order_mode: RwLock<bool>,
    /// Connection toggle from the GUI; false pauses the supervisor.
    pub running: RwLock<bool>,

    pub events: RwLock<Vec<EventRecord>>,
    pub connection_stats: RwLock<ConnectionStats>,
    /// Refreshed by the order-hygiene sweep for the GUI order table.
    pub open_orders_cache: RwLock<Vec<OrderInfo>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<BotConfig>>,
        client: Arc<FuturesClient>,
        market_data: Arc<MarketDataEngine>,
        analyzer: Arc<SignalAnalyzer>,
        risk: Arc<RiskEngine>,
        trader: Arc<dyn Trader>,
        live_trader: Option<Arc<LiveTrader>>,
    ) -> Self {
        let mode = config.read().mode;
        Self {
            state_version: AtomicU64::new(1),
            config,
            mode,
            client,
            market_data,
            analyzer,
            risk,
            trader,
            live_trader,
            current_signals: RwLock::new(HashMap::new()),
            pending_signal: RwLock::new(None),
            single_order_mode: RwLock::new(false),
            running: RwLock::new(true),
            events: RwLock::new(Vec::new()),
            connection_stats: RwLock::new(ConnectionStats {
                backoff_secs: 0.5,
                ..Default::default()
            }),
            open_orders_cache: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Flags ───────────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    pub fn set_running(&self, running: bool) {
        *self.running.write() = running;
        self.increment_version();
    }

    pub fn single_order_mode(&self) -> bool {
        *self.single_order_mode.read()
    }

    pub fn set_single_order_mode(&self, active: bool) {
        *self.single_order_mode.write() = active;
        self.increment_version();
    }

    // ── Event log ───────────────────────────────────────────────────────

    pub fn push_event(&self, message: impl Into<String>, kind: &str) {
        let record = EventRecord {
            message: message.into(),
            kind: kind.to_string(),
            at: Utc::now().to_rfc3339(),
        };
        let mut events = self.events.write();
        events.push(record);
        while events.len() > MAX_EVENTS {
            events.remove(0);
        }
        drop(events);
        self.increment_version();
    }

    pub fn record_signal(&self, signal: Signal) {
        self.current_signals
            .write()
            .insert(signal.symbol.clone(), signal);
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the complete serialisable snapshot for the GUI surface.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let trader = &self.trader;
        let balance = trader.balance();
        let starting_balance = trader.starting_balance();
        let stats = trader.statistics();

        let positions: HashMap<String, Position> = trader
            .positions()
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let closed_trades = trader.closed_trades();
        let total_commission: f64 = closed_trades.iter().map(|t| t.total_commission).sum();
        let pnl = balance - starting_balance;

        let account = AccountSnapshot {
            balance,
            starting_balance,
            pnl,
            net_profit: pnl - total_commission,
            win_rate: stats.win_rate,
            max_drawdown: trader.max_drawdown(),
            open_positions: positions.len(),
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            mode: self.mode.to_string(),
            running: self.is_running(),
            single_order_mode: self.single_order_mode(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            account,
            statistics: stats,
            signals: self.current_signals.read().clone(),
            positions,
            closed_trades,
            open_orders: self.open_orders_cache.read().clone(),
            events: self.events.read().clone(),
            connection: self.connection_stats.read().clone(),
        }
    }

    // ── Hot config update ───────────────────────────────────────────────

    /// Update the averaging distance (GUI slider), persist the config, and
    /// recreate live averaging orders in the background.
    pub fn set_averaging_distance_pct(&self, distance_pct: f64) {
        let distance_pct = (distance_pct.max(0.0) * 10_000.0).round() / 10_000.0;
        {
            let mut config = self.config.write();
            config.risk.averaging_distance_from_liq_pct = distance_pct;
        }
        self.increment_version();
        self.push_event(
            format!("Averaging distance set to {distance_pct:.2}% from liquidation"),
            "info",
        );

        let config_snapshot = self.config.read().clone();
        if let Err(e) = config_snapshot.save("config.json") {
            tracing::warn!(error = %e, "failed to persist averaging distance");
        }

        if let Some(live) = self.live_trader.clone() {
            tokio::spawn(async move {
                live.recreate_averaging_orders(distance_pct).await;
            });
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub starting_balance: f64,
    pub pnl: f64,
    pub net_profit: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub open_positions: usize,
}

/// Full engine snapshot pushed to the GUI.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub mode: String,
    pub running: bool,
    pub single_order_mode: bool,
    pub uptime_secs: u64,
    pub account: AccountSnapshot,
    pub statistics: TradeStatistics,
    pub signals: HashMap<String, Signal>,
    pub positions: HashMap<String, Position>,
    pub closed_trades: Vec<ClosedTrade>,
    pub open_orders: Vec<OrderInfo>,
    pub events: Vec<EventRecord>,
    pub connection: ConnectionStats,
}
