// =============================================================================
// Market-Data Engine — per-symbol books, tapes, quotes, and price view
// =============================================================================
//
// One instance serves every subscribed symbol. Stream tasks are the single
// writers for their symbol's state; all readers get cloned snapshots. No lock
// is held across an await — the REST price fallback runs after every guard is
// dropped.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::binance::client::FuturesClient;
use crate::binance::models::DepthSnapshot;

use super::book::{BookManager, BookTop, DeltaOutcome, DepthEvent};
use super::tape::{AggTrade, BestQuote, TradeTape};

/// A trade price older than this falls back to the quote mid.
const TRADE_FRESHNESS: Duration = Duration::from_secs(3);
/// Minimum tape length before a symbol is considered tradeable.
const MIN_READY_TRADES: usize = 5;

#[derive(Debug, Clone, Copy)]
struct LastTrade {
    price: f64,
    seen_at: Instant,
}

pub struct MarketDataEngine {
    books: BookManager,
    tapes: RwLock<HashMap<String, TradeTape>>,
    quotes: RwLock<HashMap<String, BestQuote>>,
    last_trades: RwLock<HashMap<String, LastTrade>>,
}

impl MarketDataEngine {
    pub fn new() -> Self {
        Self {
            books: BookManager::new(),
            tapes: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            last_trades: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Writers (called from the stream tasks)
    // -------------------------------------------------------------------------

    pub fn apply_snapshot(&self, symbol: &str, snapshot: &DepthSnapshot) {
        self.books.apply_snapshot(symbol, snapshot);
    }

    pub fn apply_depth(&self, symbol: &str, event: &DepthEvent) -> DeltaOutcome {
        self.books.apply_delta(symbol, event)
    }

    pub fn mark_unsynced(&self, symbol: &str) {
        self.books.mark_unsynced(symbol);
    }

    pub fn push_trade(&self, symbol: &str, trade: AggTrade) {
        if trade.price <= 0.0 || trade.qty <= 0.0 {
            debug!(symbol, price = trade.price, qty = trade.qty, "invalid trade dropped");
            return;
        }
        self.tapes
            .write()
            .entry(symbol.to_string())
            .or_default()
            .push(trade);
        self.last_trades.write().insert(
            symbol.to_string(),
            LastTrade {
                price: trade.price,
                seen_at: Instant::now(),
            },
        );
    }

    pub fn update_quote(&self, symbol: &str, bid: f64, ask: f64, ts_ms: i64) {
        if bid <= 0.0 || ask <= 0.0 || bid >= ask {
            debug!(symbol, bid, ask, "invalid quote dropped");
            return;
        }
        let mut quotes = self.quotes.write();
        if let Some(existing) = quotes.get(symbol) {
            if ts_ms < existing.ts_ms {
                return;
            }
        }
        quotes.insert(symbol.to_string(), BestQuote { bid, ask, ts_ms });
    }

    // -------------------------------------------------------------------------
    // Readers
    // -------------------------------------------------------------------------

    pub fn book_top(&self, symbol: &str) -> Option<BookTop> {
        self.books.top(symbol)
    }

    pub fn best_quote(&self, symbol: &str) -> Option<BestQuote> {
        self.quotes.read().get(symbol).copied()
    }

    pub fn tape_len(&self, symbol: &str) -> usize {
        self.tapes.read().get(symbol).map(|t| t.len()).unwrap_or(0)
    }

    /// Recent trades within the window, oldest first.
    pub fn recent_trades(
        &self,
        symbol: &str,
        max_count: usize,
        window_seconds: f64,
    ) -> Vec<AggTrade> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.tapes
            .read()
            .get(symbol)
            .map(|t| t.recent(max_count, window_seconds, now_ms))
            .unwrap_or_default()
    }

    /// Price from local stream data only: fresh trade price, else quote mid.
    pub fn local_price(&self, symbol: &str) -> Option<f64> {
        if let Some(last) = self.last_trades.read().get(symbol) {
            if last.seen_at.elapsed() <= TRADE_FRESHNESS && last.price > 0.0 {
                return Some(last.price);
            }
        }
        self.quotes
            .read()
            .get(symbol)
            .map(|q| q.mid())
            .filter(|&m| m > 0.0)
    }

    /// Price view with REST fallback for symbols whose streams are stale or
    /// were never subscribed (e.g. positions adopted from the exchange).
    pub async fn current_price(&self, client: &FuturesClient, symbol: &str) -> f64 {
        if let Some(price) = self.local_price(symbol) {
            return price;
        }

        match client.ticker_price(symbol).await {
            Ok(price) if price > 0.0 => {
                debug!(symbol, price, "REST fallback price");
                price
            }
            Ok(_) => 0.0,
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch REST fallback price");
                0.0
            }
        }
    }

    /// A symbol is tradeable when its book is synced, the tape has enough
    /// fresh prints, and the live spread is valid.
    pub fn is_symbol_ready(&self, symbol: &str) -> bool {
        if !self.books.is_synced(symbol) {
            return false;
        }
        if self.tape_len(symbol) < MIN_READY_TRADES {
            return false;
        }

        match self.last_trades.read().get(symbol) {
            Some(last) if last.seen_at.elapsed() <= TRADE_FRESHNESS => {}
            _ => return false,
        }

        matches!(
            self.quotes.read().get(symbol),
            Some(q) if q.bid > 0.0 && q.ask > 0.0
        )
    }
}

impl Default for MarketDataEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_engine(symbol: &str) -> MarketDataEngine {
        let engine = MarketDataEngine::new();
        engine.apply_snapshot(
            symbol,
            &DepthSnapshot {
                last_update_id: 10,
                bids: vec![(100.0, 5.0)],
                asks: vec![(100.02, 1.0)],
            },
        );
        engine
    }

    fn push_trades(engine: &MarketDataEngine, symbol: &str, count: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        for i in 0..count {
            engine.push_trade(
                symbol,
                AggTrade {
                    price: 100.01,
                    qty: 1.0,
                    time_ms: now + i as i64,
                    buyer_is_maker: false,
                },
            );
        }
    }

    #[test]
    fn readiness_requires_sync_tape_and_quote() {
        let engine = seeded_engine("BTCUSDT");
        assert!(!engine.is_symbol_ready("BTCUSDT"));

        push_trades(&engine, "BTCUSDT", 5);
        assert!(!engine.is_symbol_ready("BTCUSDT"));

        engine.update_quote("BTCUSDT", 100.0, 100.02, 1);
        assert!(engine.is_symbol_ready("BTCUSDT"));

        engine.mark_unsynced("BTCUSDT");
        assert!(!engine.is_symbol_ready("BTCUSDT"));
    }

    #[test]
    fn local_price_prefers_fresh_trade_over_mid() {
        let engine = seeded_engine("BTCUSDT");
        engine.update_quote("BTCUSDT", 100.0, 100.02, 1);

        // No trades yet: quote mid.
        assert_eq!(engine.local_price("BTCUSDT"), Some(100.01));

        engine.push_trade(
            "BTCUSDT",
            AggTrade {
                price: 100.05,
                qty: 1.0,
                time_ms: chrono::Utc::now().timestamp_millis(),
                buyer_is_maker: false,
            },
        );
        assert_eq!(engine.local_price("BTCUSDT"), Some(100.05));
    }

    #[test]
    fn invalid_trades_and_quotes_are_dropped() {
        let engine = seeded_engine("BTCUSDT");
        engine.push_trade(
            "BTCUSDT",
            AggTrade {
                price: 0.0,
                qty: 1.0,
                time_ms: 1,
                buyer_is_maker: false,
            },
        );
        assert_eq!(engine.tape_len("BTCUSDT"), 0);

        engine.update_quote("BTCUSDT", 100.02, 100.0, 1); // crossed quote
        assert!(engine.best_quote("BTCUSDT").is_none());
    }

    #[test]
    fn quote_timestamps_are_monotonic() {
        let engine = seeded_engine("BTCUSDT");
        engine.update_quote("BTCUSDT", 100.0, 100.02, 10);
        engine.update_quote("BTCUSDT", 99.0, 99.02, 5); // older frame
        let quote = engine.best_quote("BTCUSDT").unwrap();
        assert_eq!(quote.bid, 100.0);
        assert_eq!(quote.ts_ms, 10);
    }
}
