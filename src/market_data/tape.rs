// =============================================================================
// Trade Tape & Best Quote — recent prints and live spread per symbol
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

/// Capacity of the per-symbol trade FIFO.
const TAPE_CAPACITY: usize = 100;

/// One aggregate trade from the stream.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AggTrade {
    pub price: f64,
    pub qty: f64,
    pub time_ms: i64,
    /// true: the passive side was the buyer, i.e. an aggressive sell.
    pub buyer_is_maker: bool,
}

impl AggTrade {
    pub fn is_aggressive_buy(&self) -> bool {
        !self.buyer_is_maker
    }
}

/// Bounded FIFO of the most recent aggregate trades.
///
/// Timestamps are kept monotonic non-decreasing: a trade arriving with an
/// earlier timestamp than the newest entry is clamped to it.
#[derive(Debug, Default)]
pub struct TradeTape {
    trades: VecDeque<AggTrade>,
}

impl TradeTape {
    pub fn new() -> Self {
        Self {
            trades: VecDeque::with_capacity(TAPE_CAPACITY),
        }
    }

    pub fn push(&mut self, mut trade: AggTrade) {
        if let Some(last) = self.trades.back() {
            if trade.time_ms < last.time_ms {
                trade.time_ms = last.time_ms;
            }
        }
        if self.trades.len() == TAPE_CAPACITY {
            self.trades.pop_front();
        }
        self.trades.push_back(trade);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn newest_time_ms(&self) -> Option<i64> {
        self.trades.back().map(|t| t.time_ms)
    }

    /// Trades within `window_seconds` of `now_ms`, oldest first, capped at
    /// `max_count` of the most recent.
    pub fn recent(&self, max_count: usize, window_seconds: f64, now_ms: i64) -> Vec<AggTrade> {
        let window_ms = (window_seconds * 1000.0) as i64;
        let mut out: Vec<AggTrade> = self
            .trades
            .iter()
            .rev()
            .take_while(|t| now_ms - t.time_ms <= window_ms)
            .take(max_count)
            .copied()
            .collect();
        out.reverse();
        out
    }
}

/// Best bid/ask from the bookTicker stream.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BestQuote {
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

impl BestQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, time_ms: i64) -> AggTrade {
        AggTrade {
            price,
            qty: 1.0,
            time_ms,
            buyer_is_maker: false,
        }
    }

    #[test]
    fn tape_is_bounded() {
        let mut tape = TradeTape::new();
        for i in 0..250 {
            tape.push(trade(100.0, i));
        }
        assert_eq!(tape.len(), TAPE_CAPACITY);
        assert_eq!(tape.newest_time_ms(), Some(249));
    }

    #[test]
    fn timestamps_stay_monotonic() {
        let mut tape = TradeTape::new();
        tape.push(trade(100.0, 1000));
        tape.push(trade(100.1, 900)); // out-of-order arrival
        assert_eq!(tape.newest_time_ms(), Some(1000));
    }

    #[test]
    fn recent_filters_by_window_and_count() {
        let mut tape = TradeTape::new();
        for i in 0..10 {
            tape.push(trade(100.0 + i as f64, i * 1000));
        }

        // 5-second window from t=9000 keeps t in [4000, 9000].
        let recent = tape.recent(100, 5.0, 9000);
        assert_eq!(recent.len(), 6);
        assert_eq!(recent.first().unwrap().time_ms, 4000);
        assert_eq!(recent.last().unwrap().time_ms, 9000);

        let capped = tape.recent(3, 5.0, 9000);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped.first().unwrap().time_ms, 7000);
    }
}
