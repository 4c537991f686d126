// =============================================================================
// Risk Engine — symbol limits, liquidation maths, averaging and stop orders
// =============================================================================
//
// All prices submitted to the exchange are integer multiples of tick_size and
// all quantities integer multiples of step_size, with price x qty >= the
// symbol's minimum notional. Rounding strips float artefacts by re-rounding to
// the filter's decimal precision.
//
// Order replacement rule: a protective order is always placed BEFORE its
// predecessor is cancelled, so the position is never momentarily unprotected.
// Averaging orders are the opposite: stale same-direction limits are cleared
// first so at most one averaging order ever rests on the book.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::binance::client::FuturesClient;
use crate::binance::models::SymbolRules;
use crate::config::BotConfig;
use crate::position::Position;
use crate::types::Side;

/// Slippage applied to a stop's limit leg to improve the fill (0.2 %).
const STOP_LIMIT_SLIPPAGE: f64 = 0.002;
/// Trailing-stop ladder step and its floor, in PNL percent.
const STOP_LADDER_STEP: f64 = 10.0;

// =============================================================================
// Pure rounding / sizing helpers
// =============================================================================

/// Decimal places implied by a filter step (e.g. 0.001 -> 3).
fn decimal_places(step: f64) -> u32 {
    let s = format!("{step:.10}");
    let trimmed = s.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

fn round_to_precision(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Round a price to the nearest multiple of `tick`, artefact-free.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    let rounded = (price / tick).round() * tick;
    round_to_precision(rounded, decimal_places(tick))
}

/// Round a quantity to the nearest multiple of `step`, artefact-free.
pub fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    let rounded = (qty / step).round() * step;
    round_to_precision(rounded, decimal_places(step))
}

/// Smallest multiple of `step` that is >= `qty`.
pub fn ceil_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    let steps = (qty / step).ceil();
    round_to_precision(steps * step, decimal_places(step))
}

/// Clamp an order to the symbol filters: round to step, lift to min_qty, then
/// bump by whole steps until the minimum notional holds.
pub fn clamp_order_qty(rules: &SymbolRules, price: f64, qty: f64) -> f64 {
    let mut qty = round_to_step(qty, rules.step_size);
    if qty < rules.min_qty {
        qty = rules.min_qty;
    }

    if rules.min_notional > 0.0 && price > 0.0 {
        let mut notional = price * qty;
        if notional < rules.min_notional {
            let needed = ceil_to_step(rules.min_notional / price, rules.step_size);
            if needed > qty {
                qty = needed;
                notional = price * qty;
            }
            // One more step covers any residual rounding shortfall.
            if notional < rules.min_notional {
                qty = round_to_step(qty + rules.step_size, rules.step_size);
            }
        }
    }

    if rules.max_qty > 0.0 && qty > rules.max_qty {
        qty = round_to_step(rules.max_qty, rules.step_size);
    }

    qty
}

/// Minimum viable quantity and the margin it requires.
pub fn minimum_margin(rules: &SymbolRules, price: f64, leverage: u32) -> (f64, f64) {
    let min_qty_from_notional = if price > 0.0 {
        rules.min_notional / price
    } else {
        0.0
    };
    let min_qty = ceil_to_step(rules.min_qty.max(min_qty_from_notional), rules.step_size);
    let min_margin = price * min_qty / leverage.max(1) as f64;
    (min_margin, min_qty)
}

/// Isolated-margin liquidation price.
pub fn liquidation_price(entry_price: f64, side: Side, leverage: u32, mmr: f64) -> f64 {
    let inv = 1.0 / leverage.max(1) as f64;
    match side {
        Side::Long => entry_price * (1.0 - inv + mmr),
        Side::Short => entry_price * (1.0 + inv - mmr),
    }
}

/// Averaging-order price: a fixed percentage of the liquidation price away
/// from it, strictly on the entry side of liquidation.
pub fn averaging_order_price(
    liquidation: f64,
    side: Side,
    distance_pct: f64,
) -> f64 {
    let distance_pct = if distance_pct > 0.0 { distance_pct } else { 0.5 };
    let offset = liquidation * (distance_pct / 100.0);

    match side {
        Side::Long => {
            let mut price = liquidation + offset;
            if price <= liquidation {
                price = liquidation * (1.0 + distance_pct / 100.0);
                error!(
                    price,
                    liquidation, "averaging price forced above liquidation"
                );
            }
            price
        }
        Side::Short => {
            let mut price = liquidation - offset;
            if price >= liquidation {
                price = liquidation * (1.0 - distance_pct / 100.0);
                error!(
                    price,
                    liquidation, "averaging price forced below liquidation"
                );
            }
            price
        }
    }
}

/// Trailing-stop ladder: `None` below the activation PNL, otherwise one full
/// step below the last crossed 10 %-rung, floored at +10 %.
pub fn stepped_stop_level(pnl_percent: f64, activation_pnl: f64) -> Option<f64> {
    if pnl_percent < activation_pnl {
        return None;
    }
    let trigger = (pnl_percent / STOP_LADDER_STEP).floor() * STOP_LADDER_STEP;
    Some((trigger - STOP_LADDER_STEP).max(STOP_LADDER_STEP))
}

/// Price at which a position's PNL (leverage-scaled) equals `stop_pnl_pct`.
pub fn stop_price_from_pnl(entry_price: f64, side: Side, stop_pnl_pct: f64, leverage: u32) -> f64 {
    let price_change_pct = stop_pnl_pct / leverage.max(1) as f64;
    match side {
        Side::Long => entry_price * (1.0 + price_change_pct / 100.0),
        Side::Short => entry_price * (1.0 - price_change_pct / 100.0),
    }
}

/// Limit leg of a stop order, worsened by the slippage allowance.
pub fn stop_limit_price(stop_price: f64, side: Side) -> f64 {
    match side {
        Side::Long => stop_price * (1.0 - STOP_LIMIT_SLIPPAGE),
        Side::Short => stop_price * (1.0 + STOP_LIMIT_SLIPPAGE),
    }
}

// =============================================================================
// RiskEngine
// =============================================================================

pub struct RiskEngine {
    client: Arc<FuturesClient>,
    config: Arc<RwLock<BotConfig>>,
    limits: RwLock<HashMap<String, SymbolRules>>,
}

impl RiskEngine {
    pub fn new(client: Arc<FuturesClient>, config: Arc<RwLock<BotConfig>>) -> Self {
        Self {
            client,
            config,
            limits: RwLock::new(HashMap::new()),
        }
    }

    /// Load filter rules for the configured pairs from exchangeInfo.
    pub async fn load_symbol_limits(&self) -> anyhow::Result<()> {
        let pairs: Vec<String> = self.config.read().pairs.clone();
        let all = self.client.exchange_info().await?;

        let mut limits = self.limits.write();
        for rules in all {
            if pairs.contains(&rules.symbol) {
                info!(
                    symbol = %rules.symbol,
                    min_qty = rules.min_qty,
                    min_notional = rules.min_notional,
                    step_size = rules.step_size,
                    tick_size = rules.tick_size,
                    "symbol limits loaded"
                );
                limits.insert(rules.symbol.clone(), rules);
            }
        }
        Ok(())
    }

    /// Rules from the cache, fetching on demand for symbols outside the
    /// configured pairs (e.g. positions adopted from the exchange).
    pub async fn symbol_limits(&self, symbol: &str) -> Option<SymbolRules> {
        if let Some(rules) = self.limits.read().get(symbol) {
            return Some(rules.clone());
        }

        match self.client.symbol_rules(symbol).await {
            Ok(rules) => {
                info!(symbol, "symbol limits fetched on demand");
                self.limits
                    .write()
                    .insert(symbol.to_string(), rules.clone());
                Some(rules)
            }
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch symbol limits");
                None
            }
        }
    }

    pub fn cached_limits(&self, symbol: &str) -> Option<SymbolRules> {
        self.limits.read().get(symbol).cloned()
    }

    pub fn maintenance_margin_rate(&self) -> f64 {
        self.config.read().risk.maintenance_margin_rate
    }

    pub fn averaging_distance_pct(&self) -> f64 {
        self.config.read().risk.averaging_distance_from_liq_pct
    }

    /// Liquidation price under the configured maintenance-margin rate.
    pub fn liquidation_for(&self, entry_price: f64, side: Side, leverage: u32) -> f64 {
        liquidation_price(entry_price, side, leverage, self.maintenance_margin_rate())
    }

    /// Averaging target for a position at the current liquidation level.
    pub fn averaging_target(&self, liquidation: f64, side: Side) -> f64 {
        averaging_order_price(liquidation, side, self.averaging_distance_pct())
    }

    pub fn stop_activation_pnl(&self) -> f64 {
        self.config.read().risk.stepped_stop_activation_pnl
    }

    /// Cancel an order, treating "unknown order" as an already-clean state.
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> bool {
        match self.client.cancel_order(symbol, order_id).await {
            Ok(()) => {
                info!(symbol, order_id, "order cancelled");
                true
            }
            Err(e) if e.is_unknown_order() => {
                debug!(symbol, order_id, "order already gone");
                true
            }
            Err(e) => {
                warn!(symbol, order_id, error = %e, "failed to cancel order");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Averaging orders
    // -------------------------------------------------------------------------

    /// Place the averaging limit order for a position near its liquidation.
    ///
    /// Returns the new order id, or `None` when the policy forbids it
    /// (disabled, count exhausted, sizing failure, insufficient balance).
    pub async fn place_averaging_order(
        &self,
        position: &Position,
        liquidation: f64,
        available_balance: Option<f64>,
    ) -> Option<u64> {
        let (enabled, max_count, martingale) = {
            let cfg = &self.config.read().risk;
            (
                cfg.averaging_down_enabled,
                cfg.averaging_max_count,
                cfg.averaging_martingale_enabled,
            )
        };
        if !enabled {
            debug!(symbol = %position.symbol, "averaging disabled in config");
            return None;
        }
        if position.averaging_count >= max_count {
            warn!(
                symbol = %position.symbol,
                max_count,
                "max averaging count reached"
            );
            return None;
        }

        let mut order_price = self.averaging_target(liquidation, position.side);

        // Quantity: replicate the current size, or double from the initial
        // size when the martingale branch is configured.
        let mut quantity = if martingale {
            position.initial_size * 2f64.powi(position.averaging_count as i32)
        } else {
            position.size
        };
        if quantity <= 0.0 {
            error!(
                symbol = %position.symbol,
                size = position.size,
                "cannot size averaging order"
            );
            return None;
        }

        if let Some(rules) = self.symbol_limits(&position.symbol).await {
            order_price = round_to_tick(order_price, rules.tick_size);
            quantity = clamp_order_qty(&rules, order_price, quantity);

            if rules.min_notional > 0.0 && order_price * quantity < rules.min_notional {
                error!(
                    symbol = %position.symbol,
                    notional = order_price * quantity,
                    min_notional = rules.min_notional,
                    "averaging notional below minimum after adjustment"
                );
                return None;
            }
        }

        let required_margin = order_price * quantity / position.leverage.max(1) as f64;
        if let Some(balance) = available_balance {
            if required_margin > balance {
                warn!(
                    symbol = %position.symbol,
                    required_margin,
                    balance,
                    "insufficient balance for averaging order"
                );
                return None;
            }
        }

        // Clear stale same-direction limit orders so only one averaging order
        // ever rests on the book.
        self.cancel_stale_averaging_orders(position).await;

        let order_side = position.side.entry_order_side();
        info!(
            symbol = %position.symbol,
            side = %position.side,
            price = order_price,
            qty = quantity,
            margin = required_margin,
            count = position.averaging_count + 1,
            "placing averaging order"
        );

        match self
            .client
            .submit_limit_order(&position.symbol, order_side, order_price, quantity, false)
            .await
        {
            Ok(ack) => {
                info!(
                    symbol = %position.symbol,
                    order_id = ack.order_id,
                    price = order_price,
                    "averaging order placed"
                );
                Some(ack.order_id)
            }
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "failed to place averaging order");
                None
            }
        }
    }

    async fn cancel_stale_averaging_orders(&self, position: &Position) {
        let open_orders = match self.client.open_orders(Some(&position.symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                debug!(symbol = %position.symbol, error = %e, "failed to list open orders");
                return;
            }
        };

        let order_side = position.side.entry_order_side();
        for order in open_orders {
            if order.order_type != "LIMIT" || order.side != order_side {
                continue;
            }
            if position.averaging_order_id == Some(order.order_id) {
                continue;
            }
            if self.cancel_order(&position.symbol, order.order_id).await {
                info!(
                    symbol = %position.symbol,
                    order_id = order.order_id,
                    "stale averaging order cancelled"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trailing stop orders
    // -------------------------------------------------------------------------

    /// Place the trailing stop at `stop_pnl_pct`, then cancel the previous
    /// stop. The new order goes in first so the position is never naked.
    pub async fn place_stepped_stop_order(
        &self,
        position: &Position,
        stop_pnl_pct: f64,
    ) -> Option<u64> {
        if !self.config.read().risk.stepped_stop_enabled {
            debug!(symbol = %position.symbol, "stepped stop disabled in config");
            return None;
        }

        let mut stop_price = stop_price_from_pnl(
            position.entry_price,
            position.side,
            stop_pnl_pct,
            position.leverage,
        );
        let mut limit_price = stop_limit_price(stop_price, position.side);
        let mut quantity = position.size;

        if let Some(rules) = self.symbol_limits(&position.symbol).await {
            stop_price = round_to_tick(stop_price, rules.tick_size);
            limit_price = round_to_tick(limit_price, rules.tick_size);
            quantity = round_to_step(quantity, rules.step_size);
        }

        let old_order_id = position.stepped_stop_order_id;
        let order_side = position.side.close_order_side();

        info!(
            symbol = %position.symbol,
            stop_pnl = stop_pnl_pct,
            stop_price,
            limit_price,
            "placing trailing stop"
        );

        let new_order_id = match self
            .client
            .submit_stop_limit_order(
                &position.symbol,
                order_side,
                stop_price,
                limit_price,
                quantity,
                true,
            )
            .await
        {
            Ok(ack) => ack.order_id,
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "failed to place trailing stop");
                return None;
            }
        };

        info!(
            symbol = %position.symbol,
            order_id = new_order_id,
            target_pnl = stop_pnl_pct,
            "trailing stop placed"
        );

        // Only now is the predecessor removed.
        if let Some(old_id) = old_order_id {
            if old_id != new_order_id && self.cancel_order(&position.symbol, old_id).await {
                info!(
                    symbol = %position.symbol,
                    old_order_id = old_id,
                    new_order_id,
                    "previous trailing stop cancelled"
                );
            }
        }

        Some(new_order_id)
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("cached_symbols", &self.limits.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "XRPUSDT".into(),
            min_qty: 0.1,
            max_qty: 1_000_000.0,
            step_size: 0.1,
            min_notional: 5.0,
            tick_size: 0.0001,
        }
    }

    #[test]
    fn tick_rounding_strips_float_artifacts() {
        assert_eq!(round_to_tick(98.89200000001, 0.001), 98.892);
        assert_eq!(round_to_tick(0.56789, 0.0001), 0.5679);
        assert_eq!(round_to_tick(100.0, 0.0), 100.0);
    }

    #[test]
    fn step_rounding_matches_tick_rounding_semantics() {
        assert_eq!(round_to_step(1.2499999, 0.001), 1.25);
        assert_eq!(round_to_step(0.44, 0.1), 0.4);
        assert_eq!(ceil_to_step(0.31, 0.1), 0.4);
        assert_eq!(ceil_to_step(0.30, 0.1), 0.3);
    }

    #[test]
    fn clamp_lifts_quantity_to_minimum_notional() {
        let r = rules();
        // 0.5 XRP at $0.60 = $0.30 notional; needs >= $5.
        let qty = clamp_order_qty(&r, 0.60, 0.5);
        assert!(qty >= r.min_qty);
        assert!(0.60 * qty >= r.min_notional);
        // Quantity is still a step multiple.
        let steps = qty / r.step_size;
        assert!((steps - steps.round()).abs() < 1e-6);
    }

    #[test]
    fn minimum_margin_uses_effective_min_qty() {
        let r = rules();
        // min_notional/price = 5/0.5 = 10 XRP, above min_qty 0.1.
        let (margin, qty) = minimum_margin(&r, 0.5, 50);
        assert_eq!(qty, 10.0);
        assert!((margin - 0.5 * 10.0 / 50.0).abs() < 1e-9);
    }

    #[test]
    fn liquidation_bounds_entry_price() {
        let long = liquidation_price(100.0, Side::Long, 50, 0.004);
        assert!((long - 98.40).abs() < 1e-9);
        assert!(long < 100.0);

        let short = liquidation_price(100.0, Side::Short, 50, 0.004);
        assert!((short - 101.60).abs() < 1e-9);
        assert!(short > 100.0);
    }

    #[test]
    fn averaging_price_sits_on_entry_side_of_liquidation() {
        // LONG at 100, 50x: liq 98.40, order 0.5 % above it = 98.892.
        let liq = liquidation_price(100.0, Side::Long, 50, 0.004);
        let price = averaging_order_price(liq, Side::Long, 0.5);
        assert!((price - 98.892).abs() < 1e-9);
        assert!(price > liq);

        let liq_s = liquidation_price(100.0, Side::Short, 50, 0.004);
        let price_s = averaging_order_price(liq_s, Side::Short, 0.5);
        assert!(price_s < liq_s);
        assert!((price_s - (101.60 - 101.60 * 0.005)).abs() < 1e-9);
    }

    #[test]
    fn averaging_price_defaults_invalid_distance() {
        let liq = 98.40;
        let price = averaging_order_price(liq, Side::Long, 0.0);
        assert!((price - (liq + liq * 0.005)).abs() < 1e-9);
    }

    #[test]
    fn stop_ladder_follows_ten_percent_steps() {
        // Activation at the default 20 %.
        assert_eq!(stepped_stop_level(5.0, 20.0), None);
        assert_eq!(stepped_stop_level(19.9, 20.0), None);
        assert_eq!(stepped_stop_level(20.0, 20.0), Some(10.0));
        assert_eq!(stepped_stop_level(25.0, 20.0), Some(10.0));
        assert_eq!(stepped_stop_level(35.0, 20.0), Some(20.0));
        assert_eq!(stepped_stop_level(45.0, 20.0), Some(30.0));
        assert_eq!(stepped_stop_level(100.0, 20.0), Some(90.0));
        // The floor holds even with an early activation threshold.
        assert_eq!(stepped_stop_level(12.0, 10.0), Some(10.0));
    }

    #[test]
    fn stop_price_inverts_the_leverage_scaling() {
        // +10 % PNL at 50x is +0.2 % in price.
        let long = stop_price_from_pnl(100.0, Side::Long, 10.0, 50);
        assert!((long - 100.2).abs() < 1e-9);

        let short = stop_price_from_pnl(100.0, Side::Short, 10.0, 50);
        assert!((short - 99.8).abs() < 1e-9);
    }

    #[test]
    fn stop_limit_leg_is_worsened() {
        assert!(stop_limit_price(100.0, Side::Long) < 100.0);
        assert!(stop_limit_price(100.0, Side::Short) > 100.0);
    }

    proptest! {
        #[test]
        fn tick_rounding_is_idempotent(
            price in 0.0001f64..100_000.0,
            tick_exp in 0u32..6,
        ) {
            let tick = 10f64.powi(-(tick_exp as i32));
            let once = round_to_tick(price, tick);
            let twice = round_to_tick(once, tick);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn step_rounding_is_idempotent(
            qty in 0.0001f64..1_000_000.0,
            step_exp in 0u32..6,
        ) {
            let step = 10f64.powi(-(step_exp as i32));
            let once = round_to_step(qty, step);
            let twice = round_to_step(once, step);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn clamped_orders_satisfy_symbol_filters(
            price in 0.01f64..10_000.0,
            qty in 0.0f64..100.0,
        ) {
            let r = rules();
            let clamped = clamp_order_qty(&r, price, qty);
            prop_assert!(clamped >= r.min_qty);
            prop_assert!(price * clamped >= r.min_notional - 1e-9);
            let steps = clamped / r.step_size;
            prop_assert!((steps - steps.round()).abs() < 1e-6);
        }

        #[test]
        fn ladder_level_is_at_least_ten_and_below_pnl(
            pnl in 20.0f64..500.0,
        ) {
            let level = stepped_stop_level(pnl, 20.0).unwrap();
            prop_assert!(level >= 10.0);
            prop_assert!(level <= pnl);
            // Levels are whole ladder steps.
            prop_assert_eq!(level % 10.0, 0.0);
        }

        #[test]
        fn liquidation_and_averaging_keep_their_ordering(
            entry in 1.0f64..100_000.0,
            leverage in 2u32..125,
            distance in 0.1f64..5.0,
        ) {
            let liq_long = liquidation_price(entry, Side::Long, leverage, 0.004);
            prop_assert!(liq_long < entry);
            let avg_long = averaging_order_price(liq_long, Side::Long, distance);
            prop_assert!(avg_long > liq_long);

            let liq_short = liquidation_price(entry, Side::Short, leverage, 0.004);
            prop_assert!(liq_short > entry);
            let avg_short = averaging_order_price(liq_short, Side::Short, distance);
            prop_assert!(avg_short < liq_short);
        }
    }
}
