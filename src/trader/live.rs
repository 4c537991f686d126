// =============================================================================
// Live Trader — UM-futures execution behind the Trader capability set
// =============================================================================
//
// Owns the authoritative map of live positions. The exchange is the source of
// truth: reconciliation adopts externally opened positions, detects averaging
// fills by size jump, and closes out positions the venue reports flat.
//
// Order-id and protection fields on a Position are only ever written by the
// protection tick and the averaging-fill path; mark-price refreshes never
// touch them.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::binance::client::FuturesClient;
use crate::binance::error::ExchangeError;
use crate::binance::models::PositionInfo;
use crate::config::BotConfig;
use crate::market_data::BookTop;
use crate::position::{ClosedTrade, Position, TradeStatistics};
use crate::risk::{round_to_step, RiskEngine};
use crate::signal::Signal;
use crate::types::Side;

use super::{leverage_for_confidence, Trader};

/// Exchange size above this multiple of the stored size is read as a filled
/// averaging order.
const AVERAGING_FILL_RATIO: f64 = 1.5;
/// Position amounts below this are treated as flat.
const FLAT_EPSILON: f64 = 1e-8;

pub struct LiveTrader {
    pub(crate) client: Arc<FuturesClient>,
    pub(crate) risk: Arc<RiskEngine>,
    pub(crate) config: Arc<RwLock<BotConfig>>,
    pub(crate) positions: RwLock<HashMap<String, Position>>,
    closed_trades: RwLock<Vec<ClosedTrade>>,
    trade_counter: AtomicU64,

    starting_balance: f64,
    wallet_balance: RwLock<f64>,
    max_balance: RwLock<f64>,
    max_drawdown: RwLock<f64>,

    balance_cache: RwLock<Option<(f64, Instant)>>,

    /// Serialises the place-new-then-cancel-old triple per symbol.
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Non-blocking guard for slider-triggered averaging recreation.
    recreate_lock: Mutex<()>,
}

impl LiveTrader {
    /// Connect, read the wallet, and adopt whatever the exchange already has.
    pub async fn init(
        client: Arc<FuturesClient>,
        risk: Arc<RiskEngine>,
        config: Arc<RwLock<BotConfig>>,
    ) -> Result<Arc<Self>> {
        let balances = client
            .account_balances()
            .await
            .context("failed to read futures account at startup")?;

        let trader = Arc::new(Self {
            client,
            risk,
            config,
            positions: RwLock::new(HashMap::new()),
            closed_trades: RwLock::new(Vec::new()),
            trade_counter: AtomicU64::new(0),
            starting_balance: balances.wallet,
            wallet_balance: RwLock::new(balances.wallet),
            max_balance: RwLock::new(balances.wallet),
            max_drawdown: RwLock::new(0.0),
            balance_cache: RwLock::new(None),
            symbol_locks: Mutex::new(HashMap::new()),
            recreate_lock: Mutex::new(()),
        });

        trader.load_existing_positions().await;
        info!(
            balance = balances.wallet,
            positions = trader.positions.read().len(),
            "live trader initialised"
        );
        Ok(trader)
    }

    /// Balance accessor for the protection sweep (same TTL cache).
    pub(crate) async fn available_balance_for_protection(&self) -> f64 {
        self.fetch_available_balance().await
    }

    /// Reduce-only path used by the eco-mode margin reset.
    pub(crate) async fn reduce_to_initial_for_protection(
        &self,
        symbol: &str,
        target_size: f64,
    ) -> Result<bool> {
        self.reduce_position_inner(symbol, target_size).await
    }

    /// Per-symbol mutation lock for the protection tick.
    pub(crate) async fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        let mut locks = self.symbol_locks.lock().await;
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Startup adoption
    // -------------------------------------------------------------------------

    /// Load nonzero exchange positions and adopt their resting orders.
    async fn load_existing_positions(&self) {
        let open_orders = match self.client.open_orders(None).await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "failed to list open orders at startup");
                Vec::new()
            }
        };

        let rows = match self.client.position_information(None).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to load positions at startup");
                return;
            }
        };

        let mut loaded = 0usize;
        for row in rows.iter().filter(|r| r.position_amt.abs() > FLAT_EPSILON) {
            let mut position = self.adopt_position(row);
            let symbol = position.symbol.clone();

            let mut averaging_order = None;
            let mut stop_order = None;
            for order in open_orders.iter().filter(|o| o.symbol == symbol) {
                match order.order_type.as_str() {
                    "LIMIT" if order.side == position.side.entry_order_side() => {
                        averaging_order = Some(order.order_id);
                    }
                    "STOP" | "STOP_MARKET"
                        if order.side == position.side.close_order_side() =>
                    {
                        stop_order = Some(order.order_id);
                    }
                    // The system runs on trailing stops only; take-profit
                    // orders are leftovers from older runs.
                    "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => {
                        if self.risk.cancel_order(&symbol, order.order_id).await {
                            info!(symbol = %symbol, order_id = order.order_id, "legacy take-profit cancelled");
                        }
                    }
                    _ => {}
                }
            }

            if let Some(stop_id) = stop_order {
                position.stepped_stop_order_id = Some(stop_id);
                position.stepped_stop_active = true;
                position.is_protected = true;
                info!(symbol = %symbol, order_id = stop_id, "adopted existing stop order");

                // A protected position has no business averaging.
                if let Some(avg_id) = averaging_order {
                    if self.risk.cancel_order(&symbol, avg_id).await {
                        info!(symbol = %symbol, order_id = avg_id, "averaging order cancelled (position protected)");
                    }
                }
            } else if let Some(avg_id) = averaging_order {
                position.averaging_order_id = Some(avg_id);
                info!(symbol = %symbol, order_id = avg_id, "adopted existing averaging order");
            }

            info!(
                symbol = %symbol,
                side = %position.side,
                entry_price = position.entry_price,
                "adopted existing position"
            );
            self.positions.write().insert(symbol, position);
            loaded += 1;
        }

        if loaded > 0 {
            info!(count = loaded, "existing positions loaded from exchange");
        }
    }

    /// Build a Position from an exchange row with unknown original targets.
    fn adopt_position(&self, row: &PositionInfo) -> Position {
        let side = if row.position_amt > 0.0 {
            Side::Long
        } else {
            Side::Short
        };
        let quantity = row.position_amt.abs();
        let leverage = row.leverage.max(1);

        // The original TP levels are unknown; approximate at +/-1 %.
        let tp_distance = row.entry_price * 0.01;
        let (take_profit_1, take_profit_2) = match side {
            Side::Long => (
                row.entry_price + tp_distance,
                row.entry_price + tp_distance * 2.0,
            ),
            Side::Short => (
                row.entry_price - tp_distance,
                row.entry_price - tp_distance * 2.0,
            ),
        };

        let position_value = quantity * row.entry_price;
        let margin = position_value / leverage as f64;
        let liquidation_price = self.risk.liquidation_for(row.entry_price, side, leverage);

        let mut position = Position {
            id: format!("{}_{}", row.symbol, Utc::now().timestamp()),
            symbol: row.symbol.clone(),
            side,
            entry_price: row.entry_price,
            size: quantity,
            leverage,
            entry_time: Utc::now(),
            stop_loss: 0.0,
            take_profit_1,
            take_profit_2,
            confidence: 75.0,
            initial_entry_price: row.entry_price,
            initial_size: quantity,
            initial_margin: margin,
            margin,
            position_value,
            liquidation_price,
            averaging_count: 0,
            averaging_order_id: None,
            stepped_stop_order_id: None,
            stepped_stop_level_pnl: None,
            stepped_stop_active: false,
            is_protected: false,
            current_price: row.mark_price,
            unrealized_pnl: row.unrealized_pnl,
            unrealized_pnl_percent: 0.0,
        };
        position.update_mark(row.mark_price, row.unrealized_pnl);
        position
    }

    // -------------------------------------------------------------------------
    // Balances
    // -------------------------------------------------------------------------

    async fn fetch_available_balance(&self) -> f64 {
        let ttl = self.config.read().risk.balance_cache_ttl;
        if let Some((balance, at)) = *self.balance_cache.read() {
            if at.elapsed().as_secs_f64() < ttl {
                debug!(balance, "using cached available balance");
                return balance;
            }
        }

        match self.client.account_balances().await {
            Ok(balances) => {
                *self.balance_cache.write() = Some((balances.available, Instant::now()));
                balances.available
            }
            Err(e) => {
                error!(error = %e, "failed to fetch available balance");
                self.balance_cache.read().map(|(b, _)| b).unwrap_or(0.0)
            }
        }
    }

    /// Refresh the wallet balance and drawdown tracking after a close.
    async fn refresh_wallet_balance(&self) {
        if let Ok(balances) = self.client.account_balances().await {
            let mut wallet = self.wallet_balance.write();
            *wallet = balances.wallet;
            let mut max_balance = self.max_balance.write();
            if *wallet > *max_balance {
                *max_balance = *wallet;
            }
            if *max_balance > 0.0 {
                let drawdown = (*max_balance - *wallet) / *max_balance * 100.0;
                let mut max_dd = self.max_drawdown.write();
                if drawdown > *max_dd {
                    *max_dd = drawdown;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Margin / leverage setup
    // -------------------------------------------------------------------------

    async fn ensure_isolated_margin(&self, symbol: &str) {
        let margin_type = self.config.read().account.margin_type.clone();
        if let Err(e) = self.client.set_margin_type(symbol, &margin_type).await {
            warn!(symbol, error = %e, "failed to set margin type");
        }
    }

    async fn ensure_leverage(&self, symbol: &str, leverage: u32) {
        if let Err(e) = self.client.set_leverage(symbol, leverage).await {
            warn!(symbol, leverage, error = %e, "failed to set leverage");
        }
    }

    // -------------------------------------------------------------------------
    // Close-out bookkeeping
    // -------------------------------------------------------------------------

    /// Remove a closed position, fetch its commissions, and record the trade.
    async fn finalize_trade(
        &self,
        position: Position,
        close_price: f64,
        realized_pnl: f64,
        reason: &str,
    ) -> ClosedTrade {
        self.positions.write().remove(&position.symbol);
        self.refresh_wallet_balance().await;

        let mut total_commission = 0.0;
        match self
            .client
            .account_trades_after(&position.symbol, position.entry_time.timestamp_millis())
            .await
        {
            Ok(fills) => {
                total_commission = fills.iter().map(|f| f.commission).sum();
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "failed to fetch commissions");
            }
        }

        let pnl_percent = if position.margin > 0.0 {
            realized_pnl / position.margin * 100.0
        } else {
            0.0
        };
        let net_pnl = realized_pnl - total_commission;

        let now = Utc::now();
        let trade = ClosedTrade {
            id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: close_price,
            size: position.size,
            leverage: position.leverage,
            entry_time: position.entry_time,
            exit_time: now,
            duration_seconds: (now - position.entry_time).num_milliseconds() as f64 / 1000.0,
            pnl: realized_pnl,
            pnl_percent,
            total_commission,
            close_reason: reason.to_string(),
            confidence: position.confidence,
        };
        self.closed_trades.write().push(trade.clone());

        info!(
            symbol = %position.symbol,
            side = %position.side,
            pnl = format!("{realized_pnl:+.2}").as_str(),
            commission = total_commission,
            net = format!("{net_pnl:+.2}").as_str(),
            reason,
            "position closed"
        );
        trade
    }

    /// Handle a detected averaging fill: absorb the new size and, when the
    /// policy allows, chain the next averaging order.
    async fn absorb_averaging_fill(&self, symbol: &str, info: &PositionInfo) {
        let updated = {
            let mut positions = self.positions.write();
            let Some(position) = positions.get_mut(symbol) else {
                return;
            };

            info!(
                symbol,
                old_size = position.size,
                new_size = info.position_amt.abs(),
                "averaging order filled"
            );

            position.size = info.position_amt.abs();
            position.averaging_count += 1;
            // The exchange computes the blended entry.
            position.entry_price = info.entry_price;
            position.averaging_order_id = None;
            position.position_value = position.size * position.entry_price;
            position.margin = position.position_value / position.leverage as f64;
            position.liquidation_price =
                self.risk
                    .liquidation_for(position.entry_price, position.side, position.leverage);
            position.update_mark(info.mark_price, info.unrealized_pnl);

            info!(
                symbol,
                count = position.averaging_count,
                entry_price = position.entry_price,
                liquidation = position.liquidation_price,
                "position updated after averaging"
            );
            position.clone()
        };

        let defer = self.config.read().risk.averaging_require_negative_roi;
        if defer && updated.unrealized_pnl_percent >= 0.0 {
            info!(
                symbol,
                roi = updated.unrealized_pnl_percent,
                "averaging paused until position returns to loss"
            );
            return;
        }

        let balance = self.fetch_available_balance().await;
        if let Some(order_id) = self
            .risk
            .place_averaging_order(&updated, updated.liquidation_price, Some(balance))
            .await
        {
            if let Some(position) = self.positions.write().get_mut(symbol) {
                position.averaging_order_id = Some(order_id);
            }
            info!(symbol, order_id, "next averaging order placed");
        } else {
            warn!(symbol, "could not place next averaging order");
        }
    }

    // -------------------------------------------------------------------------
    // Slider-driven averaging recreation
    // -------------------------------------------------------------------------

    /// Recreate every active averaging order at the new distance. Skipped
    /// entirely when another recreation is already running.
    pub async fn recreate_averaging_orders(&self, distance_pct: f64) {
        let Ok(_guard) = self.recreate_lock.try_lock() else {
            info!("averaging recreation already in progress, skipping");
            return;
        };

        let snapshot: Vec<Position> = self.positions.read().values().cloned().collect();
        if snapshot.is_empty() {
            info!("no positions to update for averaging distance change");
            return;
        }

        info!(
            count = snapshot.len(),
            distance_pct, "recreating averaging orders"
        );

        for position in snapshot {
            let Some(order_id) = position.averaging_order_id else {
                continue;
            };
            if position.unrealized_pnl_percent >= 0.0 {
                debug!(symbol = %position.symbol, "position not in loss, averaging order left alone");
                continue;
            }

            self.risk.cancel_order(&position.symbol, order_id).await;
            if let Some(p) = self.positions.write().get_mut(&position.symbol) {
                p.averaging_order_id = None;
            }

            let liquidation =
                self.risk
                    .liquidation_for(position.entry_price, position.side, position.leverage);
            let balance = self.fetch_available_balance().await;
            match self
                .risk
                .place_averaging_order(&position, liquidation, Some(balance))
                .await
            {
                Some(new_id) => {
                    if let Some(p) = self.positions.write().get_mut(&position.symbol) {
                        p.averaging_order_id = Some(new_id);
                    }
                    info!(
                        symbol = %position.symbol,
                        order_id = new_id,
                        distance_pct,
                        "averaging order recreated"
                    );
                }
                None => {
                    warn!(symbol = %position.symbol, "could not recreate averaging order");
                }
            }
        }
    }
}

#[async_trait]
impl Trader for LiveTrader {
    async fn open_position(&self, signal: &Signal, _book: &BookTop) -> Result<Option<Position>> {
        let Some(side) = signal.direction.side() else {
            return Ok(None);
        };
        let symbol = &signal.symbol;

        if self.positions.read().contains_key(symbol) {
            return Ok(None);
        }

        let balance = self.fetch_available_balance().await;
        let entry_price = signal.entry_price;
        if entry_price <= 0.0 || balance <= 0.0 {
            return Ok(None);
        }

        let (leverage_min, leverage_max, size_pct) = {
            let account = &self.config.read().account;
            (
                account.leverage_min,
                account.leverage_max,
                account.position_size_percent,
            )
        };
        let leverage = leverage_for_confidence(leverage_min, leverage_max, signal.confidence);
        info!(
            symbol,
            confidence = signal.confidence,
            leverage,
            "leverage derived from confidence"
        );

        // Margin mode first, then leverage; both idempotent.
        self.ensure_isolated_margin(symbol).await;
        self.ensure_leverage(symbol, leverage).await;

        let notional = balance * leverage as f64 * size_pct / 100.0;
        let mut quantity = notional / entry_price;

        if let Some(rules) = self.risk.symbol_limits(symbol).await {
            let (min_margin, min_qty) = crate::risk::minimum_margin(&rules, entry_price, leverage);
            if quantity < min_qty {
                warn!(
                    symbol,
                    quantity, min_qty, "quantity below minimum, lifting to floor"
                );
                quantity = min_qty;
                if min_margin > balance {
                    warn!(
                        symbol,
                        required = min_margin,
                        balance,
                        "insufficient balance for minimum quantity"
                    );
                    return Ok(None);
                }
            }
            quantity = round_to_step(quantity, rules.step_size);
        }

        if quantity <= 0.0 {
            return Ok(None);
        }

        info!(
            symbol,
            balance,
            leverage,
            notional,
            quantity,
            "submitting market entry"
        );

        let ack = match self
            .client
            .submit_market_order(symbol, side.entry_order_side(), quantity, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                error!(symbol, error = %e, "market order submission failed");
                return Ok(None);
            }
        };

        let avg_price = ack.fill_price_or(entry_price);
        let position_value = avg_price * quantity;
        let margin = position_value / leverage as f64;
        let liquidation_price = self.risk.liquidation_for(avg_price, side, leverage);

        info!(
            symbol,
            side = %side,
            entry = avg_price,
            liquidation = liquidation_price,
            margin,
            "live position opened"
        );

        let counter = self.trade_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut position = Position {
            id: format!("L{counter:04}"),
            symbol: symbol.clone(),
            side,
            entry_price: avg_price,
            size: quantity,
            leverage,
            entry_time: Utc::now(),
            stop_loss: signal.stop_loss,
            take_profit_1: signal.take_profit_1,
            take_profit_2: signal.take_profit_2,
            confidence: signal.confidence,
            initial_entry_price: avg_price,
            initial_size: quantity,
            initial_margin: margin,
            margin,
            position_value,
            liquidation_price,
            averaging_count: 0,
            averaging_order_id: None,
            stepped_stop_order_id: None,
            stepped_stop_level_pnl: None,
            stepped_stop_active: false,
            is_protected: false,
            current_price: avg_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
        };

        // Protective orders are not placed at open; they emerge from the
        // protection tick. The first averaging order only goes in up front
        // when the policy does not defer it to the loss regime.
        let defer = self.config.read().risk.averaging_require_negative_roi;
        if !defer {
            let balance = self.fetch_available_balance().await;
            if let Some(order_id) = self
                .risk
                .place_averaging_order(&position, liquidation_price, Some(balance))
                .await
            {
                position.averaging_order_id = Some(order_id);
                info!(symbol, order_id, "initial averaging order placed");
            }
        }

        self.positions
            .write()
            .insert(symbol.clone(), position.clone());
        Ok(Some(position))
    }

    async fn update_positions(
        &self,
        symbol: &str,
        current_price: f64,
    ) -> Result<Option<ClosedTrade>> {
        let stored = {
            let positions = self.positions.read();
            match positions.get(symbol) {
                Some(p) => p.clone(),
                None => return Ok(None),
            }
        };
        if stored.entry_price <= 0.0 {
            // Corrupted record: drop it and let reconciliation re-adopt.
            self.positions.write().remove(symbol);
            return Err(ExchangeError::Invariant(format!(
                "position {symbol} has no entry price"
            ))
            .into());
        }

        let rows = self
            .client
            .position_information(Some(symbol))
            .await
            .context("position information fetch failed")?;
        let Some(info) = rows.first() else {
            return Ok(None);
        };

        {
            let mut positions = self.positions.write();
            if let Some(position) = positions.get_mut(symbol) {
                position.update_mark(current_price, info.unrealized_pnl);
            }
        }

        // Averaging fill: the venue shows a materially larger position.
        if info.position_amt.abs() > stored.size * AVERAGING_FILL_RATIO {
            self.absorb_averaging_fill(symbol, info).await;
            return Ok(None);
        }

        // Position gone on the venue: settle it.
        if info.position_amt.abs() < FLAT_EPSILON {
            let fills = self
                .client
                .account_trades_after(symbol, stored.entry_time.timestamp_millis())
                .await
                .unwrap_or_default();
            let close_price = fills.last().map(|f| f.price).unwrap_or(current_price);
            let realized: f64 = if fills.is_empty() {
                stored.unrealized_pnl
            } else {
                fills.iter().map(|f| f.realized_pnl).sum()
            };
            let trade = self
                .finalize_trade(stored, close_price, realized, "Exchange Close")
                .await;
            return Ok(Some(trade));
        }

        Ok(None)
    }

    async fn close_position_manually(
        &self,
        symbol: &str,
        current_price: f64,
        reason: &str,
    ) -> Result<Option<ClosedTrade>> {
        let stored = {
            let positions = self.positions.read();
            match positions.get(symbol) {
                Some(p) => p.clone(),
                None => return Ok(None),
            }
        };

        let rows = self.client.position_information(Some(symbol)).await?;
        let Some(info) = rows.first() else {
            return Ok(None);
        };
        if info.position_amt.abs() < FLAT_EPSILON {
            return Ok(None);
        }

        let quantity = info.position_amt.abs();
        let order_side = if info.position_amt > 0.0 {
            "SELL"
        } else {
            "BUY"
        };

        if let Err(e) = self
            .client
            .submit_market_order(symbol, order_side, quantity, true)
            .await
        {
            error!(symbol, error = %e, "manual close failed");
            return Ok(None);
        }

        let trade = self
            .finalize_trade(stored.clone(), current_price, stored.unrealized_pnl, reason)
            .await;
        Ok(Some(trade))
    }

    async fn close_all_positions(&self, current_prices: &HashMap<String, f64>) -> Vec<ClosedTrade> {
        let symbols: Vec<String> = self.positions.read().keys().cloned().collect();
        let mut closed = Vec::new();
        for symbol in symbols {
            let price = current_prices.get(&symbol).copied().unwrap_or_else(|| {
                self.positions
                    .read()
                    .get(&symbol)
                    .map(|p| p.current_price)
                    .unwrap_or(0.0)
            });
            match self
                .close_position_manually(&symbol, price, "Manual Close")
                .await
            {
                Ok(Some(trade)) => closed.push(trade),
                Ok(None) => {}
                Err(e) => error!(symbol = %symbol, error = %e, "close-all failed for symbol"),
            }
        }
        closed
    }

    async fn refresh_all_positions(&self) -> Result<()> {
        let rows = self
            .client
            .position_information(None)
            .await
            .context("position refresh failed")?;

        for row in rows.iter().filter(|r| r.position_amt.abs() > FLAT_EPSILON) {
            let tracked = self.positions.read().contains_key(&row.symbol);
            if tracked {
                // Mark refresh only; order ids and protection flags survive.
                let mut positions = self.positions.write();
                if let Some(position) = positions.get_mut(&row.symbol) {
                    position.update_mark(row.mark_price, row.unrealized_pnl);
                    if position.entry_price <= 0.0 {
                        warn!(symbol = %row.symbol, "position has no entry price");
                    }
                }
            } else {
                let position = self.adopt_position(row);
                info!(
                    symbol = %row.symbol,
                    side = %position.side,
                    entry_price = position.entry_price,
                    "adopted externally opened position"
                );
                self.positions.write().insert(row.symbol.clone(), position);
            }
        }

        Ok(())
    }

    async fn available_balance(&self) -> f64 {
        self.fetch_available_balance().await
    }

    async fn reduce_position_to_initial_size(
        &self,
        symbol: &str,
        target_size: f64,
    ) -> Result<bool> {
        self.reduce_position_inner(symbol, target_size).await
    }

    fn positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    fn has_position(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.closed_trades.read().clone()
    }

    fn statistics(&self) -> TradeStatistics {
        TradeStatistics::from_trades(
            &self.closed_trades.read(),
            self.starting_balance,
            *self.wallet_balance.read(),
        )
    }

    fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    fn balance(&self) -> f64 {
        *self.wallet_balance.read()
    }

    fn max_drawdown(&self) -> f64 {
        *self.max_drawdown.read()
    }
}

impl LiveTrader {
    async fn reduce_position_inner(&self, symbol: &str, target_size: f64) -> Result<bool> {
        let position = {
            let positions = self.positions.read();
            match positions.get(symbol) {
                Some(p) => p.clone(),
                None => {
                    debug!(symbol, "no position to reduce");
                    return Ok(false);
                }
            }
        };

        let mut reduce_qty = position.size - target_size;
        if reduce_qty <= 0.0 {
            debug!(symbol, "position already at target size");
            return Ok(false);
        }

        if let Some(rules) = self.risk.symbol_limits(symbol).await {
            reduce_qty = round_to_step(reduce_qty, rules.step_size);
            if reduce_qty < rules.min_qty {
                reduce_qty = rules.min_qty;
            }
        }
        if reduce_qty <= 0.0 {
            return Ok(false);
        }

        info!(
            symbol,
            reduce_qty,
            target_size,
            "reducing position to initial size"
        );
        self.client
            .submit_market_order(symbol, position.side.close_order_side(), reduce_qty, true)
            .await
            .context("reduce-only order failed")?;

        self.refresh_all_positions().await?;
        Ok(true)
    }
}

impl std::fmt::Debug for LiveTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTrader")
            .field("positions", &self.positions.read().len())
            .field("closed_trades", &self.closed_trades.read().len())
            .finish()
    }
}
