// =============================================================================
// Trader capability set — the supervisor is polymorphic over this surface
// =============================================================================

pub mod live;
pub mod paper;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::market_data::BookTop;
use crate::position::{ClosedTrade, Position, TradeStatistics};
use crate::signal::Signal;

pub use live::LiveTrader;
pub use paper::PaperTrader;

/// Operations shared by the live implementation and the simulator.
#[async_trait]
pub trait Trader: Send + Sync {
    /// Open a position for an actionable signal; `None` when refused.
    async fn open_position(&self, signal: &Signal, book: &BookTop) -> Result<Option<Position>>;

    /// Refresh one symbol against the venue; returns the closed trade when the
    /// position turned out to be gone.
    async fn update_positions(
        &self,
        symbol: &str,
        current_price: f64,
    ) -> Result<Option<ClosedTrade>>;

    async fn close_position_manually(
        &self,
        symbol: &str,
        current_price: f64,
        reason: &str,
    ) -> Result<Option<ClosedTrade>>;

    async fn close_all_positions(
        &self,
        current_prices: &HashMap<String, f64>,
    ) -> Vec<ClosedTrade>;

    /// Pull authoritative position state; adopts externally opened positions.
    async fn refresh_all_positions(&self) -> Result<()>;

    /// Balance available for new margin.
    async fn available_balance(&self) -> f64;

    /// Reduce a position back to `target_size` with a reduce-only market
    /// order; true when an order was actually sent.
    async fn reduce_position_to_initial_size(&self, symbol: &str, target_size: f64)
        -> Result<bool>;

    fn positions(&self) -> Vec<Position>;
    fn position(&self, symbol: &str) -> Option<Position>;
    fn has_position(&self, symbol: &str) -> bool;
    fn closed_trades(&self) -> Vec<ClosedTrade>;
    fn statistics(&self) -> TradeStatistics;
    fn starting_balance(&self) -> f64;
    fn balance(&self) -> f64;
    fn max_drawdown(&self) -> f64;
}

/// Map signal confidence to leverage: linear in [65, 100] between the bounds,
/// truncated and clamped.
pub fn leverage_for_confidence(leverage_min: u32, leverage_max: u32, confidence: f64) -> u32 {
    let (lo, hi) = (leverage_min as f64, leverage_max as f64);
    let leverage = if confidence <= 65.0 {
        lo
    } else if confidence >= 100.0 {
        hi
    } else {
        lo + (confidence - 65.0) * ((hi - lo) / 35.0)
    };
    (leverage as u32).clamp(leverage_min, leverage_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leverage_interpolates_between_bounds() {
        assert_eq!(leverage_for_confidence(50, 100, 60.0), 50);
        assert_eq!(leverage_for_confidence(50, 100, 65.0), 50);
        assert_eq!(leverage_for_confidence(50, 100, 100.0), 100);
        assert_eq!(leverage_for_confidence(50, 100, 120.0), 100);

        // 80 % confidence: 50 + 15 * (50/35) = 71.43 -> 71.
        assert_eq!(leverage_for_confidence(50, 100, 80.0), 71);
    }

    #[test]
    fn degenerate_bounds_collapse() {
        assert_eq!(leverage_for_confidence(20, 20, 90.0), 20);
    }
}
