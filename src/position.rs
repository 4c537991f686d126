// =============================================================================
// Position & Closed-Trade models
// =============================================================================
//
// A `Position` exists exactly while the exchange reports a nonzero position
// for its symbol. Closing produces exactly one `ClosedTrade`.
//
// Two P&L-percent definitions coexist on purpose:
//   - `unrealized_pnl_percent` is leverage-scaled price change; the regime
//     machine and the trailing-stop ladder consume this number.
//   - `ClosedTrade::pnl_percent` is realised pnl over margin.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Side;

/// One tracked position.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Current open quantity (grows on averaging fills).
    pub size: f64,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,

    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub confidence: f64,

    /// Captured once at first open; never touched by averaging.
    pub initial_entry_price: f64,
    pub initial_size: f64,
    pub initial_margin: f64,

    pub margin: f64,
    pub position_value: f64,
    pub liquidation_price: f64,

    /// Number of averaging fills absorbed so far.
    pub averaging_count: u32,
    pub averaging_order_id: Option<u64>,

    pub stepped_stop_order_id: Option<u64>,
    /// PNL level (percent) the active trailing stop protects.
    pub stepped_stop_level_pnl: Option<f64>,
    pub stepped_stop_active: bool,
    /// Set once the trailing stop first activates; protected positions do not
    /// count against the open-position limit.
    pub is_protected: bool,

    pub current_price: f64,
    pub unrealized_pnl: f64,
    /// Leverage-scaled price change, percent.
    pub unrealized_pnl_percent: f64,
}

impl Position {
    /// Recompute the dynamic fields from a fresh mark price.
    pub fn update_mark(&mut self, mark_price: f64, unrealized_pnl: f64) {
        self.current_price = mark_price;
        self.unrealized_pnl = unrealized_pnl;
        self.unrealized_pnl_percent = if self.entry_price > 0.0 {
            let price_change_pct =
                ((mark_price - self.entry_price) / self.entry_price) * 100.0 * self.side.sign();
            price_change_pct * self.leverage as f64
        } else {
            0.0
        };
    }
}

/// Immutable record produced when a position closes.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedTrade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub pnl: f64,
    /// Realised pnl over margin, percent.
    pub pnl_percent: f64,
    pub total_commission: f64,
    pub close_reason: String,
    pub confidence: f64,
}

/// Aggregate trade statistics over the closed-trade list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStatistics {
    pub total_trades: usize,
    pub winners: usize,
    pub losers: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub avg_duration_seconds: f64,
    pub avg_pnl: f64,
    pub long_count: usize,
    pub short_count: usize,
    pub roi_pct: f64,
}

impl TradeStatistics {
    pub fn from_trades(trades: &[ClosedTrade], starting_balance: f64, balance: f64) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let winners: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
        let losers: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl <= 0.0).collect();

        let total_profit: f64 = winners.iter().map(|t| t.pnl).sum();
        let total_loss: f64 = losers.iter().map(|t| t.pnl).sum::<f64>().abs();

        let long_count = trades.iter().filter(|t| t.side == Side::Long).count();

        Self {
            total_trades: trades.len(),
            winners: winners.len(),
            losers: losers.len(),
            win_rate: winners.len() as f64 / trades.len() as f64 * 100.0,
            avg_win: if winners.is_empty() {
                0.0
            } else {
                total_profit / winners.len() as f64
            },
            avg_loss: if losers.is_empty() {
                0.0
            } else {
                total_loss / losers.len() as f64
            },
            profit_factor: if total_loss > 0.0 {
                total_profit / total_loss
            } else {
                0.0
            },
            best_trade: trades.iter().map(|t| t.pnl).fold(f64::MIN, f64::max),
            worst_trade: trades.iter().map(|t| t.pnl).fold(f64::MAX, f64::min),
            avg_duration_seconds: trades.iter().map(|t| t.duration_seconds).sum::<f64>()
                / trades.len() as f64,
            avg_pnl: trades.iter().map(|t| t.pnl).sum::<f64>() / trades.len() as f64,
            long_count,
            short_count: trades.len() - long_count,
            roi_pct: if starting_balance > 0.0 {
                (balance - starting_balance) / starting_balance * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(side: Side, entry: f64, leverage: u32) -> Position {
        Position {
            id: "T1".into(),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: entry,
            size: 1.0,
            leverage,
            entry_time: Utc::now(),
            stop_loss: 0.0,
            take_profit_1: 0.0,
            take_profit_2: 0.0,
            confidence: 75.0,
            initial_entry_price: entry,
            initial_size: 1.0,
            initial_margin: entry / leverage as f64,
            margin: entry / leverage as f64,
            position_value: entry,
            liquidation_price: 0.0,
            averaging_count: 0,
            averaging_order_id: None,
            stepped_stop_order_id: None,
            stepped_stop_level_pnl: None,
            stepped_stop_active: false,
            is_protected: false,
            current_price: entry,
            unrealized_pnl: 0.0,
            unrealized_pnl_percent: 0.0,
        }
    }

    #[test]
    fn pnl_percent_is_leverage_scaled() {
        let mut long = position(Side::Long, 100.0, 50);
        long.update_mark(100.5, 0.5);
        // +0.5 % price change at 50x = +25 %.
        assert!((long.unrealized_pnl_percent - 25.0).abs() < 1e-9);

        let mut short = position(Side::Short, 100.0, 50);
        short.update_mark(100.5, -0.5);
        assert!((short.unrealized_pnl_percent + 25.0).abs() < 1e-9);
    }

    #[test]
    fn statistics_aggregate_wins_and_losses() {
        let now = Utc::now();
        let mk = |pnl: f64, side: Side| ClosedTrade {
            id: "x".into(),
            symbol: "BTCUSDT".into(),
            side,
            entry_price: 100.0,
            exit_price: 101.0,
            size: 1.0,
            leverage: 50,
            entry_time: now,
            exit_time: now,
            duration_seconds: 60.0,
            pnl,
            pnl_percent: 0.0,
            total_commission: 0.0,
            close_reason: "test".into(),
            confidence: 75.0,
        };

        let trades = vec![
            mk(10.0, Side::Long),
            mk(-5.0, Side::Short),
            mk(20.0, Side::Long),
        ];
        let stats = TradeStatistics::from_trades(&trades, 1000.0, 1025.0);

        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.winners, 2);
        assert_eq!(stats.losers, 1);
        assert!((stats.win_rate - 66.666).abs() < 0.01);
        assert!((stats.avg_win - 15.0).abs() < 1e-9);
        assert!((stats.avg_loss - 5.0).abs() < 1e-9);
        assert!((stats.profit_factor - 6.0).abs() < 1e-9);
        assert_eq!(stats.long_count, 2);
        assert_eq!(stats.short_count, 1);
        assert!((stats.roi_pct - 2.5).abs() < 1e-9);
    }

    #[test]
    fn empty_trades_give_zeroed_statistics() {
        let stats = TradeStatistics::from_trades(&[], 1000.0, 1000.0);
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.win_rate, 0.0);
    }
}
