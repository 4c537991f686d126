// =============================================================================
// Protection Tick — per-position regime machine and order hygiene
// =============================================================================
//
// Every tick classifies each live position into one of three regimes:
//
//   Loss            (pnl < 0)               — keep exactly one averaging order
//                                             priced at the current target;
//                                             no trailing stop.
//   Small profit    (0 <= pnl < activation) — averaging off; an already-active
//                                             trailing stop is left alone.
//   Trailing profit (pnl >= activation)     — averaging off for good; the
//                                             stepped stop ladder rises and
//                                             never falls.
//
// Within one symbol the order of operations is fixed: compute target, place
// the new order, then cancel the old one. Failures for one symbol never stop
// the sweep for the others.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::binance::models::OrderInfo;
use crate::position::Position;
use crate::risk::{round_to_tick, stepped_stop_level};
use crate::trader::{LiveTrader, Trader};
use crate::types::Side;

/// Legacy emergency stops sat at roughly -85 % ROI; anything within this band
/// of that level is treated as one and removed.
const LEGACY_EMERGENCY_ROI: f64 = -85.0;
const LEGACY_EMERGENCY_BAND: f64 = 5.0;

// =============================================================================
// Pure regime / stop planning
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Loss,
    SmallProfit,
    TrailingProfit,
}

pub fn classify_regime(pnl_percent: f64, activation_pnl: f64) -> Regime {
    if pnl_percent < 0.0 {
        Regime::Loss
    } else if pnl_percent < activation_pnl {
        Regime::SmallProfit
    } else {
        Regime::TrailingProfit
    }
}

/// What to do with the trailing stop given the ladder target and the level the
/// active stop currently protects. The stop only ever moves up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopAction {
    Place(f64),
    Raise { from: f64, to: f64 },
    Keep,
}

pub fn plan_stop_action(target: Option<f64>, active_level: Option<f64>) -> StopAction {
    match (target, active_level) {
        (None, _) => StopAction::Keep,
        (Some(to), None) => StopAction::Place(to),
        (Some(to), Some(from)) if to > from => StopAction::Raise { from, to },
        (Some(_), Some(_)) => StopAction::Keep,
    }
}

// =============================================================================
// Protection tick
// =============================================================================

/// Sweep every live position through its regime. `eco_mode` enables the
/// margin-reset path after a recovered averaging cycle.
pub async fn run_protection_tick(trader: &LiveTrader, eco_mode: bool) {
    let snapshot: Vec<Position> = trader.positions.read().values().cloned().collect();
    debug!(count = snapshot.len(), "protection tick");

    for position in snapshot {
        let symbol = position.symbol.clone();
        let lock = trader.symbol_lock(&symbol).await;
        let _guard = lock.lock().await;

        // Re-read under the lock; the map may have moved on.
        let Some(position) = trader.position(&symbol) else {
            continue;
        };
        let pnl = position.unrealized_pnl_percent;
        let activation = trader.risk.stop_activation_pnl();
        debug!(symbol = %symbol, pnl = format!("{pnl:.2}").as_str(), "checking protection");

        match classify_regime(pnl, activation) {
            Regime::Loss => protect_loss(trader, &position).await,
            Regime::SmallProfit => protect_small_profit(trader, &position, eco_mode).await,
            Regime::TrailingProfit => protect_trailing(trader, &position, eco_mode).await,
        }
    }
}

// -----------------------------------------------------------------------------
// Regime 1: loss
// -----------------------------------------------------------------------------

async fn protect_loss(trader: &LiveTrader, position: &Position) {
    let symbol = &position.symbol;

    // Back in loss: the trailing stop no longer applies.
    if position.stepped_stop_active {
        if let Some(stop_id) = position.stepped_stop_order_id {
            if trader.risk.cancel_order(symbol, stop_id).await {
                info!(symbol = %symbol, "trailing stop cancelled (position in loss)");
            }
        }
        if let Some(p) = trader.positions.write().get_mut(symbol) {
            p.stepped_stop_active = false;
            p.stepped_stop_order_id = None;
            p.stepped_stop_level_pnl = None;
            p.is_protected = false;
        }
    }

    cancel_legacy_emergency_stops(trader, position).await;

    if position.initial_size <= 0.0 {
        debug!(symbol = %symbol, "position too small for averaging");
        return;
    }

    let liquidation =
        trader
            .risk
            .liquidation_for(position.entry_price, position.side, position.leverage);
    let target_price = trader.risk.averaging_target(liquidation, position.side);
    let tick_size = trader
        .risk
        .cached_limits(symbol)
        .map(|r| r.tick_size)
        .filter(|&t| t > 0.0)
        .unwrap_or(0.0001);
    let rounded_target = round_to_tick(target_price, tick_size);

    // An order resting at or beyond liquidation can never fill in time.
    let beyond_liquidation = |price: f64| match position.side {
        Side::Long => price <= liquidation,
        Side::Short => price >= liquidation,
    };

    // 1. Is the assigned order still the right one?
    let mut cancel_existing = false;
    if let Some(order_id) = position.averaging_order_id {
        match trader.client.get_order(symbol, order_id).await {
            Ok(order) if order.is_working() && order.price > 0.0 => {
                let price_diff = (order.price - rounded_target).abs();
                if beyond_liquidation(order.price) {
                    error!(
                        symbol = %symbol,
                        order_id,
                        price = order.price,
                        liquidation,
                        "averaging order sits beyond liquidation, recreating"
                    );
                    cancel_existing = true;
                } else if price_diff <= tick_size {
                    debug!(
                        symbol = %symbol,
                        order_id,
                        price = order.price,
                        target = rounded_target,
                        "averaging order still on target"
                    );
                    return;
                } else {
                    info!(
                        symbol = %symbol,
                        order_id,
                        price = order.price,
                        target = rounded_target,
                        "averaging order off target, recreating"
                    );
                    cancel_existing = true;
                }
            }
            Ok(order) => {
                info!(
                    symbol = %symbol,
                    order_id,
                    status = %order.status,
                    "averaging order no longer working, recreating"
                );
                cancel_existing = true;
            }
            Err(e) => {
                info!(symbol = %symbol, order_id, error = %e, "averaging order lookup failed, recreating");
                cancel_existing = true;
            }
        }
    }

    // 2. A matching order may already rest on the book under a stale id.
    match trader.client.open_orders(Some(symbol)).await {
        Ok(orders) => {
            let entry_side = position.side.entry_order_side();
            for order in &orders {
                if order.order_type != "LIMIT" || order.side != entry_side || order.price <= 0.0 {
                    continue;
                }
                if beyond_liquidation(order.price) {
                    warn!(
                        symbol = %symbol,
                        order_id = order.order_id,
                        price = order.price,
                        "resting averaging order beyond liquidation, ignoring"
                    );
                    continue;
                }
                if (order.price - rounded_target).abs() <= tick_size
                    && position.averaging_order_id != Some(order.order_id)
                {
                    info!(
                        symbol = %symbol,
                        order_id = order.order_id,
                        price = order.price,
                        "adopting matching averaging order"
                    );
                    if let Some(p) = trader.positions.write().get_mut(symbol) {
                        p.averaging_order_id = Some(order.order_id);
                    }
                    return;
                }
            }
        }
        Err(e) => debug!(symbol = %symbol, error = %e, "open-order scan failed"),
    }

    if cancel_existing {
        if let Some(order_id) = position.averaging_order_id {
            trader.risk.cancel_order(symbol, order_id).await;
            if let Some(p) = trader.positions.write().get_mut(symbol) {
                p.averaging_order_id = None;
            }
        }
    }

    // 3. Place the order at the current target.
    let balance = trader.available_balance_for_protection().await;
    info!(
        symbol = %symbol,
        entry = position.entry_price,
        liquidation,
        target = rounded_target,
        balance,
        "placing averaging order at target"
    );
    match trader
        .risk
        .place_averaging_order(position, liquidation, Some(balance))
        .await
    {
        Some(order_id) => {
            if let Some(p) = trader.positions.write().get_mut(symbol) {
                p.averaging_order_id = Some(order_id);
            }
            let distance_pct = if liquidation > 0.0 {
                (rounded_target - liquidation).abs() / liquidation * 100.0
            } else {
                0.0
            };
            info!(
                symbol = %symbol,
                order_id,
                distance_from_liq = format!("{distance_pct:.2}%").as_str(),
                "averaging order placed"
            );
        }
        None => {
            warn!(symbol = %symbol, "averaging order not placed, see preceding logs");
        }
    }
}

// -----------------------------------------------------------------------------
// Regime 2: small profit
// -----------------------------------------------------------------------------

async fn protect_small_profit(trader: &LiveTrader, position: &Position, eco_mode: bool) {
    let symbol = &position.symbol;

    cancel_legacy_emergency_stops(trader, position).await;

    // No averaging while in profit.
    if let Some(order_id) = position.averaging_order_id {
        if trader.risk.cancel_order(symbol, order_id).await {
            info!(symbol = %symbol, "averaging order cancelled (position in profit)");
        }
        if let Some(p) = trader.positions.write().get_mut(symbol) {
            p.averaging_order_id = None;
        }
    }

    maybe_reset_margin(trader, position, eco_mode).await;

    // An active trailing stop stays exactly where it is; it only moves up and
    // it only disappears by filling or by the position returning to loss.
    if position.stepped_stop_active {
        debug!(
            symbol = %symbol,
            level = position.stepped_stop_level_pnl.unwrap_or(0.0),
            "trailing stop kept through profit dip"
        );
    }
}

// -----------------------------------------------------------------------------
// Regime 3: trailing profit
// -----------------------------------------------------------------------------

async fn protect_trailing(trader: &LiveTrader, position: &Position, eco_mode: bool) {
    let symbol = &position.symbol;
    let pnl = position.unrealized_pnl_percent;
    let activation = trader.risk.stop_activation_pnl();

    // Averaging is permanently done for this position.
    if let Some(order_id) = position.averaging_order_id {
        if trader.risk.cancel_order(symbol, order_id).await {
            info!(symbol = %symbol, "averaging order cancelled (trailing stop active)");
        }
        if let Some(p) = trader.positions.write().get_mut(symbol) {
            p.averaging_order_id = None;
        }
    }

    maybe_reset_margin(trader, position, eco_mode).await;

    let Some(target) = stepped_stop_level(pnl, activation) else {
        return;
    };

    if !position.is_protected {
        if let Some(p) = trader.positions.write().get_mut(symbol) {
            p.is_protected = true;
        }
        info!(
            symbol = %symbol,
            pnl = format!("{pnl:.1}").as_str(),
            stop = target,
            "trailing stop activated"
        );
    }

    let active_level = if position.stepped_stop_active {
        position.stepped_stop_level_pnl
    } else {
        None
    };

    match plan_stop_action(Some(target), active_level) {
        StopAction::Place(level) => {
            info!(symbol = %symbol, level, "placing first trailing stop");
            if let Some(order_id) = trader.risk.place_stepped_stop_order(position, level).await {
                if let Some(p) = trader.positions.write().get_mut(symbol) {
                    p.stepped_stop_active = true;
                    p.stepped_stop_level_pnl = Some(level);
                    p.stepped_stop_order_id = Some(order_id);
                }
            } else {
                warn!(symbol = %symbol, level, "failed to place initial trailing stop");
            }
        }
        StopAction::Raise { from, to } => {
            info!(symbol = %symbol, from, to, "raising trailing stop");
            if let Some(order_id) = trader.risk.place_stepped_stop_order(position, to).await {
                if let Some(p) = trader.positions.write().get_mut(symbol) {
                    p.stepped_stop_level_pnl = Some(to);
                    p.stepped_stop_order_id = Some(order_id);
                }
            } else {
                warn!(symbol = %symbol, from, to, "failed to raise trailing stop, keeping previous");
            }
        }
        StopAction::Keep => {
            debug!(
                symbol = %symbol,
                level = active_level.unwrap_or(0.0),
                "trailing stop unchanged"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Eco-mode margin reset
// -----------------------------------------------------------------------------

/// After a recovered averaging cycle in eco mode, shrink the position back to
/// its initial size.
async fn maybe_reset_margin(trader: &LiveTrader, position: &Position, eco_mode: bool) {
    let (enabled, trigger_roi) = {
        let cfg = &trader.config.read().risk.reset_margin_after_averaging;
        (cfg.enabled, cfg.trigger_roi_pct)
    };
    if !enabled || !eco_mode {
        return;
    }
    if position.averaging_count == 0 {
        return;
    }
    if position.unrealized_pnl_percent < trigger_roi {
        return;
    }

    let tolerance = trader
        .risk
        .cached_limits(&position.symbol)
        .map(|r| r.step_size)
        .filter(|&s| s > 0.0)
        .unwrap_or(1e-6);
    if position.size <= position.initial_size + tolerance {
        return;
    }

    info!(
        symbol = %position.symbol,
        roi = position.unrealized_pnl_percent,
        initial_size = position.initial_size,
        "resetting margin to initial size after averaging"
    );

    match trader
        .reduce_to_initial_for_protection(&position.symbol, position.initial_size)
        .await
    {
        Ok(true) => {
            if let Some(p) = trader.positions.write().get_mut(&position.symbol) {
                p.size = p.initial_size;
                p.margin = p.initial_margin;
                p.position_value = p.initial_margin * p.leverage as f64;
                p.averaging_count = 0;
                p.averaging_order_id = None;
            }
        }
        Ok(false) => {}
        Err(e) => error!(symbol = %position.symbol, error = %e, "margin reset failed"),
    }
}

// -----------------------------------------------------------------------------
// Legacy emergency stops
// -----------------------------------------------------------------------------

/// Remove stop orders from older runs that sat at roughly -85 % ROI.
async fn cancel_legacy_emergency_stops(trader: &LiveTrader, position: &Position) {
    let orders = match trader.client.open_orders(Some(&position.symbol)).await {
        Ok(orders) => orders,
        Err(e) => {
            debug!(symbol = %position.symbol, error = %e, "emergency-stop scan failed");
            return;
        }
    };

    let close_side = position.side.close_order_side();
    for order in orders {
        if !matches!(order.order_type.as_str(), "STOP" | "STOP_MARKET") || order.side != close_side
        {
            continue;
        }
        if order.stop_price <= 0.0 || position.entry_price <= 0.0 {
            continue;
        }

        let stop_roi = ((order.stop_price - position.entry_price) / position.entry_price)
            * 100.0
            * position.leverage as f64
            * position.side.sign();
        if (stop_roi - LEGACY_EMERGENCY_ROI).abs() < LEGACY_EMERGENCY_BAND {
            if trader
                .risk
                .cancel_order(&position.symbol, order.order_id)
                .await
            {
                info!(
                    symbol = %position.symbol,
                    order_id = order.order_id,
                    stop_roi = format!("{stop_roi:.1}").as_str(),
                    "legacy emergency stop cancelled"
                );
            }
        }
    }
}

// =============================================================================
// Order hygiene
// =============================================================================

/// Sweep all open orders: drop legacy take-profits, deduplicate averaging and
/// stop orders, and cancel anything with no backing position.
pub async fn run_order_hygiene(trader: &LiveTrader) -> usize {
    let orders = match trader.client.open_orders(None).await {
        Ok(orders) => orders,
        Err(e) => {
            warn!(error = %e, "order hygiene sweep failed to list orders");
            return 0;
        }
    };
    info!(count = orders.len(), "order hygiene sweep");

    let mut by_symbol: HashMap<String, Vec<OrderInfo>> = HashMap::new();
    for order in orders {
        by_symbol.entry(order.symbol.clone()).or_default().push(order);
    }

    let mut cancelled = 0usize;
    for (symbol, symbol_orders) in by_symbol {
        match trader.position(&symbol) {
            Some(position) => {
                cancelled += clean_position_orders(trader, &position, symbol_orders).await;
            }
            None => {
                // No backing position: nothing here should exist.
                for order in symbol_orders {
                    if trader.risk.cancel_order(&symbol, order.order_id).await {
                        cancelled += 1;
                        info!(
                            symbol = %symbol,
                            order_id = order.order_id,
                            "orphan order cancelled (no position)"
                        );
                    }
                }
            }
        }
    }

    if cancelled > 0 {
        info!(cancelled, "order hygiene sweep complete");
    }
    cancelled
}

async fn clean_position_orders(
    trader: &LiveTrader,
    position: &Position,
    orders: Vec<OrderInfo>,
) -> usize {
    let symbol = &position.symbol;
    let entry_side = position.side.entry_order_side();
    let close_side = position.side.close_order_side();

    let mut cancelled = 0usize;
    let mut averaging: Vec<OrderInfo> = Vec::new();
    let mut stops: Vec<OrderInfo> = Vec::new();

    for order in orders {
        match order.order_type.as_str() {
            "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => {
                if trader.risk.cancel_order(symbol, order.order_id).await {
                    cancelled += 1;
                    info!(symbol = %symbol, order_id = order.order_id, "legacy take-profit cancelled");
                }
            }
            "LIMIT" if order.side == entry_side => averaging.push(order),
            "STOP" | "STOP_MARKET" if order.side == close_side => stops.push(order),
            _ => {}
        }
    }

    cancelled += dedupe_order_group(
        trader,
        symbol,
        averaging,
        position.averaging_order_id,
        OrderGroup::Averaging,
    )
    .await;
    cancelled += dedupe_order_group(
        trader,
        symbol,
        stops,
        position.stepped_stop_order_id,
        OrderGroup::Stop,
    )
    .await;

    cancelled
}

#[derive(Debug, Clone, Copy)]
enum OrderGroup {
    Averaging,
    Stop,
}

/// Keep exactly one order of the group alive: the assigned one when it still
/// exists, otherwise the newest; clear a stale assignment.
async fn dedupe_order_group(
    trader: &LiveTrader,
    symbol: &str,
    mut group: Vec<OrderInfo>,
    assigned: Option<u64>,
    kind: OrderGroup,
) -> usize {
    let mut cancelled = 0usize;

    if let Some(assigned_id) = assigned {
        let assigned_exists = group.iter().any(|o| o.order_id == assigned_id);
        if assigned_exists {
            for order in group.iter().filter(|o| o.order_id != assigned_id) {
                if trader.risk.cancel_order(symbol, order.order_id).await {
                    cancelled += 1;
                    info!(
                        symbol,
                        order_id = order.order_id,
                        kind = ?kind,
                        "duplicate order cancelled (assigned order kept)"
                    );
                }
            }
            return cancelled;
        }

        // The assignment is stale; forget it.
        if let Some(p) = trader.positions.write().get_mut(symbol) {
            match kind {
                OrderGroup::Averaging => p.averaging_order_id = None,
                OrderGroup::Stop => {
                    p.stepped_stop_order_id = None;
                    p.stepped_stop_active = false;
                }
            }
        }
    }

    // No valid assignment: keep only the newest order of the group.
    if group.len() > 1 {
        group.sort_by_key(|o| std::cmp::Reverse(o.time));
        for order in &group[1..] {
            if trader.risk.cancel_order(symbol, order.order_id).await {
                cancelled += 1;
                info!(
                    symbol,
                    order_id = order.order_id,
                    kind = ?kind,
                    "duplicate order cancelled (kept newest)"
                );
            }
        }
    }

    cancelled
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_boundaries() {
        assert_eq!(classify_regime(-0.01, 20.0), Regime::Loss);
        assert_eq!(classify_regime(0.0, 20.0), Regime::SmallProfit);
        assert_eq!(classify_regime(19.99, 20.0), Regime::SmallProfit);
        assert_eq!(classify_regime(20.0, 20.0), Regime::TrailingProfit);
        assert_eq!(classify_regime(45.0, 20.0), Regime::TrailingProfit);
    }

    #[test]
    fn stop_plan_never_demotes() {
        assert_eq!(plan_stop_action(None, None), StopAction::Keep);
        assert_eq!(plan_stop_action(Some(10.0), None), StopAction::Place(10.0));
        assert_eq!(
            plan_stop_action(Some(20.0), Some(10.0)),
            StopAction::Raise {
                from: 10.0,
                to: 20.0
            }
        );
        assert_eq!(plan_stop_action(Some(20.0), Some(20.0)), StopAction::Keep);
        assert_eq!(plan_stop_action(Some(10.0), Some(30.0)), StopAction::Keep);
    }

    /// PNL path 5 -> 25 -> 35 -> 45 -> 30 with activation at 20 %: the stop
    /// goes nowhere, then +10, +20, +30, and holds +30 on the dip.
    #[test]
    fn ladder_trajectory_is_monotonic() {
        let activation = 20.0;
        let mut active: Option<f64> = None;

        for (pnl, expected) in [
            (5.0, None),
            (25.0, Some(10.0)),
            (35.0, Some(20.0)),
            (45.0, Some(30.0)),
            (30.0, Some(30.0)),
        ] {
            let target = match classify_regime(pnl, activation) {
                Regime::TrailingProfit => stepped_stop_level(pnl, activation),
                _ => None,
            };
            match plan_stop_action(target, active) {
                StopAction::Place(level) => active = Some(level),
                StopAction::Raise { to, .. } => active = Some(to),
                StopAction::Keep => {}
            }
            assert_eq!(active, expected, "at pnl {pnl}");
        }

        // The level never decreased along the way.
        assert_eq!(active, Some(30.0));
    }
}
