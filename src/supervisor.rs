// =============================================================================
// Trading Supervisor — analyse, rank, open
// =============================================================================
//
// One pass per tick (typically 500 ms):
//   1. Refresh tracked positions against the venue.
//   2. Analyse every ready symbol; cache the latest signal for the GUI.
//   3. Rank actionable signals by confidence x expected move.
//   4. Open candidates while under the unprotected-position limit. Eco mode
//      admits at most one unprotected position and parks the best signal
//      while blocked.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::app_state::AppState;
use crate::signal::Signal;
use crate::trader::Trader;

/// Confidence above which a signal skips the price-drift re-check.
const DRIFT_EXEMPT_CONFIDENCE: f64 = 90.0;

// =============================================================================
// Pure policy helpers
// =============================================================================

/// Entry-filter parameters for a strictness setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrictnessTier {
    pub min_confidence: f64,
    pub min_trades: usize,
    /// Allowed |current - signal entry| / entry before an entry is stale.
    pub max_price_diff: f64,
}

/// Conservative (<=25), moderate (<=75), aggressive (>75) tiers.
pub fn strictness_tier(strictness_percent: f64) -> StrictnessTier {
    if strictness_percent <= 25.0 {
        StrictnessTier {
            min_confidence: 95.0,
            min_trades: 2,
            max_price_diff: 0.001,
        }
    } else if strictness_percent <= 75.0 {
        StrictnessTier {
            min_confidence: 50.0,
            min_trades: 6,
            max_price_diff: 0.002,
        }
    } else {
        StrictnessTier {
            min_confidence: 30.0,
            min_trades: 12,
            max_price_diff: 0.005,
        }
    }
}

/// Prints required on the tape before a signal of this confidence may fire.
pub fn trades_required(confidence: f64) -> usize {
    if confidence >= 70.0 {
        3
    } else if confidence >= 60.0 {
        4
    } else {
        5
    }
}

pub fn rank_signals(signals: &mut [Signal]) {
    signals.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
}

/// Effective entry limits: `None` when eco mode blocks any new entry,
/// otherwise `(limit, already_counted)`.
pub fn entry_limits(
    single_order_mode: bool,
    unprotected: usize,
    max_positions: usize,
) -> Option<(usize, usize)> {
    if single_order_mode {
        if unprotected > 0 {
            return None;
        }
        Some((1, 0))
    } else {
        Some((max_positions, unprotected))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

pub struct Supervisor {
    state: Arc<AppState>,
}

impl Supervisor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// One full supervisor pass.
    pub async fn tick(&self) {
        self.update_positions().await;
        let signals = self.analyze_signals().await;
        self.open_best_positions(signals).await;
    }

    // -------------------------------------------------------------------------
    // Position refresh
    // -------------------------------------------------------------------------

    async fn update_positions(&self) {
        let state = &self.state;
        let symbols: Vec<String> = state
            .trader
            .positions()
            .into_iter()
            .map(|p| p.symbol)
            .collect();

        for symbol in symbols {
            let price = state
                .market_data
                .current_price(&state.client, &symbol)
                .await;
            if price <= 0.0 {
                continue;
            }
            match state.trader.update_positions(&symbol, price).await {
                Ok(Some(closed)) => {
                    let sign = if closed.pnl >= 0.0 { "+" } else { "" };
                    state.push_event(
                        format!(
                            "CLOSED {} {}: P&L {sign}${:.2} ({sign}{:.2}%) [{}]",
                            closed.symbol,
                            closed.side,
                            closed.pnl,
                            closed.pnl_percent,
                            closed.close_reason
                        ),
                        if closed.pnl > 0.0 { "success" } else { "error" },
                    );
                }
                Ok(None) => {}
                Err(e) => error!(symbol = %symbol, error = %e, "position update failed"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    async fn analyze_signals(&self) -> Vec<Signal> {
        let state = &self.state;
        let (pairs, window_seconds, min_conf_long, min_conf_short) = {
            let config = state.config.read();
            (
                config.pairs.clone(),
                config.signals.tape_window_seconds,
                config.signals.min_confidence,
                config.signals.min_confidence_short,
            )
        };

        let strictness = state.analyzer.strictness();
        let tier = strictness_tier(strictness);
        let mut candidates = Vec::new();
        let mut processed = 0usize;

        for symbol in &pairs {
            if !state.market_data.is_symbol_ready(symbol) {
                debug!(symbol = %symbol, "symbol not ready");
                continue;
            }
            let Some(book) = state.market_data.book_top(symbol) else {
                continue;
            };
            if book.is_empty() {
                debug!(symbol = %symbol, "empty order book");
                continue;
            }

            let trades = state
                .market_data
                .recent_trades(symbol, 500, window_seconds.max(60.0));
            processed += 1;

            let signal = state.analyzer.analyze(symbol, &book, &trades);
            let actionable = signal.direction.is_actionable();
            state.record_signal(signal.clone());
            if !actionable {
                continue;
            }

            // Confidence floor: the configured per-direction threshold,
            // except that the aggressive tier relies on its own floor alone.
            let configured = match signal.direction.side() {
                Some(crate::types::Side::Short) => min_conf_short,
                _ => min_conf_long,
            };
            let min_confidence = if strictness > 75.0 {
                tier.min_confidence
            } else {
                configured.max(tier.min_confidence)
            };
            if signal.confidence < min_confidence - 0.01 {
                info!(
                    symbol = %symbol,
                    direction = %signal.direction,
                    confidence = signal.confidence,
                    min_confidence,
                    "signal below confidence floor"
                );
                continue;
            }

            let required = trades_required(signal.confidence);
            if trades.len() < required {
                info!(
                    symbol = %symbol,
                    trades = trades.len(),
                    required,
                    "not enough prints behind signal"
                );
                continue;
            }

            if state.trader.has_position(symbol) {
                continue;
            }

            candidates.push(signal);
        }

        info!(
            processed,
            pairs = pairs.len(),
            candidates = candidates.len(),
            "analysis pass complete"
        );
        candidates
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    async fn open_best_positions(&self, mut signals: Vec<Signal>) {
        let state = &self.state;
        rank_signals(&mut signals);

        // A parked eco-mode signal goes to the head of the queue.
        if let Some(pending) = state.pending_signal.write().take() {
            info!(
                symbol = %pending.symbol,
                priority = pending.priority(),
                "retrying parked signal"
            );
            signals.insert(0, pending);
        }

        if signals.is_empty() {
            return;
        }

        let single_order_mode = state.single_order_mode();
        let unprotected = state
            .trader
            .positions()
            .iter()
            .filter(|p| !p.is_protected)
            .count();
        let max_positions = state.config.read().account.max_positions as usize;

        let Some((limit, mut current)) =
            entry_limits(single_order_mode, unprotected, max_positions)
        else {
            // Eco mode with an unprotected position: park the best and wait.
            let best = signals.remove(0);
            info!(
                symbol = %best.symbol,
                priority = best.priority(),
                unprotected,
                "eco mode blocked, signal parked"
            );
            *state.pending_signal.write() = Some(best);
            return;
        };

        let (strictness, max_price_change_pct) = {
            let config = state.config.read();
            (
                state.analyzer.strictness(),
                config.signals.max_price_change_pct,
            )
        };
        let tier = strictness_tier(strictness);

        for signal in signals {
            if current >= limit {
                info!(current, limit, "position limit reached");
                break;
            }

            let Some(book) = state.market_data.book_top(&signal.symbol) else {
                continue;
            };
            if book.is_empty() {
                info!(symbol = %signal.symbol, "no live order book for entry");
                continue;
            }

            // Reject entries whose price already ran away from the signal.
            if strictness <= 75.0 && signal.confidence < DRIFT_EXEMPT_CONFIDENCE {
                let allowed = if max_price_change_pct > 0.0 {
                    max_price_change_pct / 100.0
                } else {
                    tier.max_price_diff
                };
                let current_price = state
                    .market_data
                    .current_price(&state.client, &signal.symbol)
                    .await;
                if current_price <= 0.0 {
                    info!(symbol = %signal.symbol, "no current price for drift check");
                    continue;
                }
                let drift = (current_price - signal.entry_price).abs() / signal.entry_price;
                if drift > allowed {
                    info!(
                        symbol = %signal.symbol,
                        drift_pct = drift * 100.0,
                        allowed_pct = allowed * 100.0,
                        "entry price drifted, signal rejected"
                    );
                    continue;
                }
            }

            if state.trader.has_position(&signal.symbol) {
                continue;
            }

            match state.trader.open_position(&signal, &book).await {
                Ok(Some(position)) => {
                    current += 1;
                    state.push_event(
                        format!(
                            "OPEN {} {} @ ${:.4} ({}x, confidence {:.1}%)",
                            position.symbol,
                            position.side,
                            position.entry_price,
                            position.leverage,
                            signal.confidence
                        ),
                        "success",
                    );
                }
                Ok(None) => {
                    info!(symbol = %signal.symbol, "position not opened");
                }
                Err(e) => {
                    error!(symbol = %signal.symbol, error = %e, "open failed");
                    state.push_event(
                        format!("Failed to open {}: {e}", signal.symbol),
                        "error",
                    );
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Direction, FactorScores};
    use chrono::Utc;

    fn signal(symbol: &str, confidence: f64, entry: f64, tp1: f64) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            confidence,
            entry_price: entry,
            stop_loss: entry * 0.995,
            take_profit_1: tp1,
            take_profit_2: tp1 * 1.01,
            risk_reward: 2.0,
            reasons: vec![],
            factor_scores: FactorScores::default(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn tiers_match_strictness_bands() {
        assert_eq!(strictness_tier(20.0).min_confidence, 95.0);
        assert_eq!(strictness_tier(50.0).min_trades, 6);
        assert_eq!(strictness_tier(80.0).max_price_diff, 0.005);
    }

    #[test]
    fn trades_required_scales_with_confidence() {
        assert_eq!(trades_required(75.0), 3);
        assert_eq!(trades_required(65.0), 4);
        assert_eq!(trades_required(55.0), 5);
    }

    #[test]
    fn ranking_orders_by_priority() {
        // Same confidence, wider expected move wins.
        let mut signals = vec![
            signal("A", 80.0, 100.0, 100.5),
            signal("B", 80.0, 100.0, 102.0),
            signal("C", 95.0, 100.0, 100.5),
        ];
        rank_signals(&mut signals);
        assert_eq!(signals[0].symbol, "B");
        // C beats A on confidence at equal expected move.
        assert_eq!(signals[1].symbol, "C");
        assert_eq!(signals[2].symbol, "A");
    }

    #[test]
    fn eco_mode_blocks_while_unprotected() {
        // Eco mode with an unprotected position: no entries at all.
        assert_eq!(entry_limits(true, 1, 10), None);
        // Eco mode and all clear: exactly one slot.
        assert_eq!(entry_limits(true, 0, 10), Some((1, 0)));
        // Normal mode counts only unprotected positions against the cap.
        assert_eq!(entry_limits(false, 3, 10), Some((10, 3)));
        assert_eq!(entry_limits(false, 0, 10), Some((10, 0)));
    }

    // -------------------------------------------------------------------------
    // Eco-mode queueing against the simulator
    // -------------------------------------------------------------------------

    use crate::app_state::AppState;
    use crate::binance::client::FuturesClient;
    use crate::binance::models::DepthSnapshot;
    use crate::config::BotConfig;
    use crate::market_data::MarketDataEngine;
    use crate::risk::RiskEngine;
    use crate::signal::SignalAnalyzer;
    use crate::trader::{PaperTrader, Trader};
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn test_state() -> Arc<AppState> {
        let config = Arc::new(RwLock::new(BotConfig::default()));
        let client = Arc::new(FuturesClient::new("", "", true));
        let market_data = Arc::new(MarketDataEngine::new());
        let analyzer = Arc::new(SignalAnalyzer::new(&config.read()));
        let risk = Arc::new(RiskEngine::new(client.clone(), config.clone()));
        let trader = Arc::new(PaperTrader::new(&config.read()));

        for symbol in ["BTCUSDT", "ETHUSDT"] {
            market_data.apply_snapshot(
                symbol,
                &DepthSnapshot {
                    last_update_id: 1,
                    bids: vec![(100.00, 5.0)],
                    asks: vec![(100.02, 5.0)],
                },
            );
        }

        Arc::new(AppState::new(
            config,
            client,
            market_data,
            analyzer,
            risk,
            trader,
            None,
        ))
    }

    #[tokio::test]
    async fn eco_mode_parks_the_best_signal_until_protection_clears() {
        let state = test_state();
        state.set_single_order_mode(true);
        let supervisor = Supervisor::new(state.clone());

        // One unprotected position already exists.
        let first = signal("BTCUSDT", 95.0, 100.02, 101.02);
        let book = state.market_data.book_top("BTCUSDT").unwrap();
        state
            .trader
            .open_position(&first, &book)
            .await
            .unwrap()
            .expect("first position should open");

        // Feed higher-priority signals over several ticks: nothing opens and
        // the best candidate stays parked.
        let second = signal("ETHUSDT", 95.0, 100.02, 102.02);
        for _ in 0..3 {
            supervisor.open_best_positions(vec![second.clone()]).await;
            assert!(!state.trader.has_position("ETHUSDT"));
            assert_eq!(
                state.pending_signal.read().as_ref().map(|s| s.symbol.clone()),
                Some("ETHUSDT".to_string())
            );
        }

        // Close the blocking position; the parked signal opens on the next pass.
        state
            .trader
            .close_position_manually("BTCUSDT", 100.50, "Manual")
            .await
            .unwrap();
        supervisor.open_best_positions(Vec::new()).await;

        assert!(state.trader.has_position("ETHUSDT"));
        assert!(state.pending_signal.read().is_none());
    }
}
