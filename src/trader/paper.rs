// =============================================================================
// Paper Trader — local simulator behind the Trader capability set
// =============================================================================
//
// Fills are instant at the signal's entry price and nothing rests on any
// exchange; the protection machinery does not run in paper mode.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BotConfig;
use crate::market_data::BookTop;
use crate::position::{ClosedTrade, Position, TradeStatistics};
use crate::signal::Signal;
use crate::types::Side;

use super::{leverage_for_confidence, Trader};

pub struct PaperTrader {
    starting_balance: f64,
    balance: RwLock<f64>,
    max_balance: RwLock<f64>,
    max_drawdown: RwLock<f64>,
    leverage_min: u32,
    leverage_max: u32,
    position_size_percent: f64,
    positions: RwLock<HashMap<String, Position>>,
    closed_trades: RwLock<Vec<ClosedTrade>>,
    trade_counter: AtomicU64,
}

impl PaperTrader {
    pub fn new(config: &BotConfig) -> Self {
        let starting_balance = config.account.starting_balance;
        info!(starting_balance, "paper trader initialised");
        Self {
            starting_balance,
            balance: RwLock::new(starting_balance),
            max_balance: RwLock::new(starting_balance),
            max_drawdown: RwLock::new(0.0),
            leverage_min: config.account.leverage_min,
            leverage_max: config.account.leverage_max,
            position_size_percent: config.account.position_size_percent,
            positions: RwLock::new(HashMap::new()),
            closed_trades: RwLock::new(Vec::new()),
            trade_counter: AtomicU64::new(0),
        }
    }

    fn settle(&self, position: &Position, exit_price: f64, reason: &str) -> ClosedTrade {
        let pnl = position.side.sign() * (exit_price - position.entry_price) * position.size;
        let pnl_percent = if position.margin > 0.0 {
            pnl / position.margin * 100.0
        } else {
            0.0
        };

        {
            let mut balance = self.balance.write();
            *balance += position.margin + pnl;
            let mut max_balance = self.max_balance.write();
            if *balance > *max_balance {
                *max_balance = *balance;
            }
            if *max_balance > 0.0 {
                let drawdown = (*max_balance - *balance) / *max_balance * 100.0;
                let mut max_dd = self.max_drawdown.write();
                if drawdown > *max_dd {
                    *max_dd = drawdown;
                }
            }
        }

        let now = Utc::now();
        let trade = ClosedTrade {
            id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            leverage: position.leverage,
            entry_time: position.entry_time,
            exit_time: now,
            duration_seconds: (now - position.entry_time).num_milliseconds() as f64 / 1000.0,
            pnl,
            pnl_percent,
            total_commission: 0.0,
            close_reason: reason.to_string(),
            confidence: position.confidence,
        };
        self.closed_trades.write().push(trade.clone());

        info!(
            symbol = %position.symbol,
            side = %position.side,
            pnl = format!("{pnl:+.2}").as_str(),
            reason,
            "paper position closed"
        );
        trade
    }
}

#[async_trait]
impl Trader for PaperTrader {
    async fn open_position(&self, signal: &Signal, book: &BookTop) -> Result<Option<Position>> {
        let Some(side) = signal.direction.side() else {
            return Ok(None);
        };
        let symbol = &signal.symbol;

        if self.positions.read().contains_key(symbol) {
            return Ok(None);
        }

        let entry_price = match side {
            Side::Long => book.best_ask().unwrap_or(signal.entry_price),
            Side::Short => book.best_bid().unwrap_or(signal.entry_price),
        };
        if entry_price <= 0.0 {
            warn!(symbol, "no valid entry price");
            return Ok(None);
        }

        let leverage = leverage_for_confidence(self.leverage_min, self.leverage_max, signal.confidence);
        let balance = *self.balance.read();
        let notional = balance * leverage as f64 * self.position_size_percent / 100.0;
        let quantity = notional / entry_price;
        let margin = notional / leverage as f64;

        if quantity <= 0.0 || margin > balance {
            warn!(symbol, margin, balance, "insufficient paper balance");
            return Ok(None);
        }

        self.trade_counter.fetch_add(1, Ordering::Relaxed);
        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            side,
            entry_price,
            size: quantity,
            leverage,
            entry_time: Utc::now(),
            stop_loss: signal.stop_loss,
            take_profit_1: signal.take_profit_1,
            take_profit_2: signal.take_profit_2,
            confidence: signal.confidence,
            initial_entry_price: entry_price,
            initial_size: quantity,
            initial_margin: margin,
            margin,
            position_value: notional,
            liquidation_price: 0.0,
            averaging_count: 0,
            averaging_order_id: None,
            stepped_stop_order_id: None,
            stepped_stop_level_pnl: None,
            stepped_stop_active: false,
            is_protected: false,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
        };

        *self.balance.write() -= margin;
        self.positions
            .write()
            .insert(symbol.clone(), position.clone());

        info!(
            symbol,
            side = %side,
            entry_price,
            quantity,
            leverage,
            "paper position opened"
        );
        Ok(Some(position))
    }

    async fn update_positions(
        &self,
        symbol: &str,
        current_price: f64,
    ) -> Result<Option<ClosedTrade>> {
        if current_price <= 0.0 {
            return Ok(None);
        }
        if let Some(position) = self.positions.write().get_mut(symbol) {
            let pnl = position.side.sign() * (current_price - position.entry_price) * position.size;
            position.update_mark(current_price, pnl);
        }
        Ok(None)
    }

    async fn close_position_manually(
        &self,
        symbol: &str,
        current_price: f64,
        reason: &str,
    ) -> Result<Option<ClosedTrade>> {
        let Some(position) = self.positions.write().remove(symbol) else {
            return Ok(None);
        };
        Ok(Some(self.settle(&position, current_price, reason)))
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
            if let Ok(Some(trade)) = self
                .close_position_manually(&symbol, price, "Emergency close")
                .await
            {
                closed.push(trade);
            }
        }
        closed
    }

    async fn refresh_all_positions(&self) -> Result<()> {
        // Nothing external to reconcile against.
        Ok(())
    }

    async fn available_balance(&self) -> f64 {
        *self.balance.read()
    }

    async fn reduce_position_to_initial_size(
        &self,
        symbol: &str,
        target_size: f64,
    ) -> Result<bool> {
        let mut positions = self.positions.write();
        let Some(position) = positions.get_mut(symbol) else {
            return Ok(false);
        };
        if position.size <= target_size {
            return Ok(false);
        }
        position.size = target_size;
        position.margin = position.initial_margin;
        position.position_value = position.initial_margin * position.leverage as f64;
        Ok(true)
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
            *self.balance.read(),
        )
    }

    fn starting_balance(&self) -> f64 {
        self.starting_balance
    }

    fn balance(&self) -> f64 {
        *self.balance.read()
    }

    fn max_drawdown(&self) -> f64 {
        *self.max_drawdown.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Direction, FactorScores};

    fn long_signal(symbol: &str) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            confidence: 80.0,
            entry_price: 100.02,
            stop_loss: 99.52,
            take_profit_1: 101.02,
            take_profit_2: 103.16,
            risk_reward: 2.0,
            reasons: vec![],
            factor_scores: FactorScores::default(),
            timestamp: Utc::now(),
        }
    }

    fn book() -> BookTop {
        BookTop {
            bids: vec![(100.00, 5.0)],
            asks: vec![(100.02, 5.0)],
            last_update_id: 1,
        }
    }

    #[tokio::test]
    async fn open_then_close_round_trip() {
        let trader = PaperTrader::new(&BotConfig::default());

        let position = trader
            .open_position(&long_signal("BTCUSDT"), &book())
            .await
            .unwrap()
            .expect("position should open");
        assert_eq!(position.entry_price, 100.02);
        assert!(trader.has_position("BTCUSDT"));
        assert!(trader.balance() < trader.starting_balance());

        // Duplicate open is refused.
        let dup = trader
            .open_position(&long_signal("BTCUSDT"), &book())
            .await
            .unwrap();
        assert!(dup.is_none());

        let closed = trader
            .close_position_manually("BTCUSDT", 101.02, "Manual")
            .await
            .unwrap()
            .expect("close should settle");
        assert!(closed.pnl > 0.0);
        assert!(!trader.has_position("BTCUSDT"));
        assert!(trader.balance() > trader.starting_balance());

        let stats = trader.statistics();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winners, 1);
    }

    #[tokio::test]
    async fn wait_signals_are_ignored() {
        let trader = PaperTrader::new(&BotConfig::default());
        let signal = Signal::wait("BTCUSDT", "test");
        let result = trader.open_position(&signal, &book()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn mark_updates_scale_pnl_by_leverage() {
        let trader = PaperTrader::new(&BotConfig::default());
        trader
            .open_position(&long_signal("BTCUSDT"), &book())
            .await
            .unwrap();

        trader.update_positions("BTCUSDT", 100.52).await.unwrap();
        let position = trader.position("BTCUSDT").unwrap();
        // ~0.5 % price move scaled by the interpolated leverage.
        assert!(position.unrealized_pnl_percent > 30.0);
        assert!(position.unrealized_pnl > 0.0);
    }
}
