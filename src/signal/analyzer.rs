// =============================================================================
// Signal Analyser — probabilistic LONG / SHORT / WAIT decisions
// =============================================================================
//
// Pure function of (book top, recent tape, config) apart from the per-symbol
// cooldown clock. Pipeline:
//   1. Hard spread filter (> 0.1 % rejects before any scoring).
//   2. Six factor scores.
//   3. Reach probabilities to the nearest fib-weighted support/resistance,
//      scaled by a bullish/bearish strength tally.
//   4. Liquidity gate + key-condition gate.
//   5. Strictness-derived thresholds decide the direction; cooldown suppresses
//      repeat fires per symbol.
// =============================================================================

use std::collections::HashMap;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::BotConfig;
use crate::market_data::{AggTrade, BookTop};

use super::factors::{
    aggression_score, estimate_horizon, estimate_volatility, fibonacci_score, imbalance_score,
    momentum_score, probability_levels, probability_to_level, spread_score, wall_score,
    FactorScores,
};
use super::{Direction, Signal};

/// Relative spread above which a symbol is rejected outright (percent).
const MAX_SPREAD_PERCENT: f64 = 0.1;

/// Named presets for the strictness slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingStyle {
    Conservative,
    Moderate,
    Aggressive,
}

impl TradingStyle {
    pub fn strictness_percent(&self) -> f64 {
        match self {
            Self::Conservative => 30.0,
            Self::Moderate => 50.0,
            Self::Aggressive => 80.0,
        }
    }
}

pub struct SignalAnalyzer {
    depth_confirm_share: f64,
    large_order_threshold: f64,
    stop_loss_percent: f64,
    take_profit_multiplier: f64,
    cooldown: Duration,
    strictness_percent: RwLock<f64>,
    last_signal: RwLock<HashMap<String, Instant>>,
}

impl SignalAnalyzer {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            depth_confirm_share: config.signals.min_imbalance,
            large_order_threshold: config.signals.large_order_threshold,
            stop_loss_percent: config.risk.stop_loss_percent,
            take_profit_multiplier: config.risk.take_profit_multiplier,
            cooldown: Duration::from_secs_f64(config.signals.cooldown_seconds),
            strictness_percent: RwLock::new(config.signals.strictness_percent.clamp(1.0, 100.0)),
            last_signal: RwLock::new(HashMap::new()),
        }
    }

    pub fn strictness(&self) -> f64 {
        *self.strictness_percent.read()
    }

    pub fn set_strictness(&self, value: f64) {
        *self.strictness_percent.write() = value.clamp(1.0, 100.0);
    }

    pub fn set_trading_style(&self, style: TradingStyle) {
        self.set_strictness(style.strictness_percent());
        debug!(style = ?style, strictness = self.strictness(), "trading style applied");
    }

    /// Probability thresholds derived from strictness:
    /// 10 % -> ~0.50, 50 % -> ~0.57, 100 % -> ~0.66. Short is one point laxer.
    fn probability_thresholds(&self) -> (f64, f64) {
        let s = self.strictness();
        let long = (0.48 + (s / 100.0) * 0.18).clamp(0.50, 0.70);
        let short = (long - 0.01).clamp(0.48, 0.68);
        (long, short)
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    pub fn analyze(&self, symbol: &str, book: &BookTop, trades: &[AggTrade]) -> Signal {
        if book.is_empty() {
            return Signal::wait(symbol, "empty order book");
        }

        let best_bid = book.best_bid().unwrap_or(0.0);
        let best_ask = book.best_ask().unwrap_or(0.0);
        let current_price = (best_bid + best_ask) / 2.0;
        if current_price <= 0.0 {
            return Signal::wait(symbol, "empty order book");
        }
        let spread_percent = ((best_ask - best_bid) / current_price) * 100.0;

        if spread_percent > MAX_SPREAD_PERCENT {
            return Signal::wait(
                symbol,
                format!("wide spread ({spread_percent:.3}% > {MAX_SPREAD_PERCENT}%)"),
            );
        }

        // ── Factor scores ────────────────────────────────────────────────
        let (imbalance, bid_share, reasons_imbalance) =
            imbalance_score(book, self.depth_confirm_share);
        let (wall, reasons_walls) = wall_score(book, current_price, self.large_order_threshold);
        let (aggression, reasons_aggression) = aggression_score(trades);
        let (fib, reasons_fib) = fibonacci_score(book, current_price);
        let (spread, reasons_spread) = spread_score(spread_percent);
        let (momentum, reasons_momentum) = momentum_score(trades);

        let scores = FactorScores {
            wall,
            spread,
            imbalance,
            aggression,
            momentum,
            fib,
        };

        // ── Probability model ────────────────────────────────────────────
        let (support, resistance) = probability_levels(book, current_price);
        let strictness = self.strictness();

        let mut sigma = estimate_volatility(trades, current_price);
        let mut horizon = estimate_horizon(trades);
        sigma *= 1.0 + (strictness - 50.0) / 200.0;
        horizon *= 1.0 - (strictness - 50.0) / 250.0;

        let base_prob_up =
            probability_to_level(resistance - current_price, sigma, horizon, current_price);
        let base_prob_down =
            probability_to_level(current_price - support, sigma, horizon, current_price);

        // ── Liquidity gate ───────────────────────────────────────────────
        if wall < 40.0 || spread < 40.0 {
            return Signal::wait(symbol, "insufficient liquidity");
        }

        // ── Strength tally ───────────────────────────────────────────────
        let mut key_conditions = 0u32;
        if wall >= 65.0 && spread >= 60.0 {
            key_conditions += 1;
        }
        if imbalance >= 60.0 {
            key_conditions += 1;
        }
        if aggression >= 60.0 {
            key_conditions += 1;
        }
        if momentum >= 60.0 {
            key_conditions += 1;
        }

        let mut bullish = 0u32;
        let mut bearish = 0u32;

        let ask_share = 1.0 - bid_share;
        if bid_share >= 0.70 {
            bullish += 3;
        } else if bid_share >= 0.60 {
            bullish += 2;
        } else if bid_share >= 0.55 {
            bullish += 1;
        }
        if ask_share >= 0.70 {
            bearish += 3;
        } else if ask_share >= 0.60 {
            bearish += 2;
        } else if ask_share >= 0.55 {
            bearish += 1;
        }

        if aggression >= 75.0 {
            bullish += 2;
        } else if aggression >= 60.0 {
            bullish += 1;
        }
        if aggression <= 25.0 {
            bearish += 2;
        } else if aggression <= 40.0 {
            bearish += 1;
        }

        if momentum >= 75.0 {
            bullish += 2;
        } else if momentum >= 60.0 {
            bullish += 1;
        }
        if momentum <= 25.0 {
            bearish += 2;
        } else if momentum <= 40.0 {
            bearish += 1;
        }

        if wall >= 65.0 {
            bullish += 1;
        }
        if wall <= 35.0 {
            bearish += 1;
        }

        let adjust_long = (0.8 + bullish as f64 * 0.05).min(1.2);
        let adjust_short = (0.8 + bearish as f64 * 0.05).min(1.2);
        let prob_up = (base_prob_up * adjust_long).clamp(0.0, 0.99);
        let prob_down = (base_prob_down * adjust_short).clamp(0.0, 0.99);

        debug!(
            symbol,
            prob_up, prob_down, bullish, bearish, key_conditions, "signal probabilities"
        );

        // ── Decision ─────────────────────────────────────────────────────
        let (threshold_long, threshold_short) = self.probability_thresholds();

        let (direction, mut confidence) = if prob_up >= threshold_long
            && prob_up > prob_down
            && bullish > bearish
            && key_conditions >= 2
        {
            let mut c = prob_up * 100.0;
            if bullish >= 5 {
                c += 3.0;
            }
            if key_conditions >= 3 {
                c += 2.0;
            }
            (Direction::Long, c)
        } else if prob_down >= threshold_short
            && prob_down > prob_up
            && bearish > bullish
            && key_conditions >= 2
        {
            let mut c = prob_down * 100.0;
            if bearish >= 5 {
                c += 3.0;
            }
            if key_conditions >= 3 {
                c += 2.0;
            }
            (Direction::Short, c)
        } else {
            return Signal::wait(
                symbol,
                format!("P(up)={prob_up:.2}, P(down)={prob_down:.2}"),
            );
        };

        confidence = confidence.min(99.0);

        // ── Entry / exit levels ──────────────────────────────────────────
        let sl = self.stop_loss_percent;
        let tp = sl * self.take_profit_multiplier;

        let (entry_price, stop_loss, take_profit_1, take_profit_2) = match direction {
            Direction::Long => {
                let entry = best_ask;
                (
                    entry,
                    entry * (1.0 - sl / 100.0),
                    entry * (1.0 + tp / 100.0),
                    entry * (1.0 + tp * PI / 100.0),
                )
            }
            Direction::Short => {
                let entry = best_bid;
                (
                    entry,
                    entry * (1.0 + sl / 100.0),
                    entry * (1.0 - tp / 100.0),
                    entry * (1.0 - tp * PI / 100.0),
                )
            }
            Direction::Wait => unreachable!(),
        };

        let risk = (entry_price - stop_loss).abs();
        let reward = (take_profit_1 - entry_price).abs();
        let risk_reward = if risk > 0.0 { reward / risk } else { 0.0 };

        // ── Cooldown ─────────────────────────────────────────────────────
        {
            let last = self.last_signal.read();
            if let Some(at) = last.get(symbol) {
                let elapsed = at.elapsed();
                if elapsed < self.cooldown {
                    let remaining = (self.cooldown - elapsed).as_secs();
                    return Signal::wait(symbol, format!("cooldown ({remaining}s remaining)"));
                }
            }
        }
        self.last_signal
            .write()
            .insert(symbol.to_string(), Instant::now());

        let mut reasons = Vec::new();
        reasons.extend(reasons_imbalance);
        reasons.extend(reasons_walls);
        reasons.extend(reasons_aggression);
        reasons.extend(reasons_fib);
        reasons.extend(reasons_spread);
        reasons.extend(reasons_momentum);
        reasons.push(format!(
            "support={support:.4}, resistance={resistance:.4}"
        ));
        reasons.push(format!("P(up)={prob_up:.2}, P(down)={prob_down:.2}"));

        info!(
            symbol,
            direction = %direction,
            confidence = format!("{confidence:.1}").as_str(),
            wall,
            spread,
            imbalance,
            "signal emitted"
        );

        Signal {
            symbol: symbol.to_string(),
            direction,
            confidence,
            entry_price,
            stop_loss,
            take_profit_1,
            take_profit_2,
            risk_reward,
            reasons,
            factor_scores: scores,
            timestamp: chrono::Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SignalAnalyzer {
        let mut config = BotConfig::default();
        config.signals.cooldown_seconds = 45.0;
        SignalAnalyzer::new(&config)
    }

    /// Tight spread, heavy bid side, buyer-aggressive tape, and a fib cluster
    /// above mid for the resistance target.
    fn bullish_book() -> BookTop {
        let mut bids = Vec::new();
        for i in 0..10 {
            let price = 100.00 - i as f64 * 0.01;
            let qty = if i % 2 == 0 { 5.0 } else { 3.0 };
            bids.push((price, qty));
        }
        let mut asks: Vec<(f64, f64)> = vec![
            (100.02, 1.0),
            (100.03, 1.0),
            (100.04, 1.0),
            (100.05, 1.0),
            (100.06, 1.0),
            (100.07, 1.0),
            (100.08, 6.2),
            (100.09, 1.0),
            (100.10, 1.0),
            (100.11, 1.0),
            (100.12, 10.0),
        ];
        asks.sort_by(|a, b| a.0.total_cmp(&b.0));
        BookTop {
            bids,
            asks,
            last_update_id: 1,
        }
    }

    /// 20 prints, 16 buyer-aggressive, constant price, tight time span.
    fn bullish_tape() -> Vec<AggTrade> {
        let now = chrono::Utc::now().timestamp_millis();
        (0..20)
            .map(|i| AggTrade {
                price: 100.01,
                qty: 1.0,
                time_ms: now - 10_000 + i * 500,
                buyer_is_maker: i % 5 == 0, // 4 of 20 are aggressive sells
            })
            .collect()
    }

    #[test]
    fn bullish_book_emits_long() {
        let analyzer = analyzer();
        let signal = analyzer.analyze("BTCUSDT", &bullish_book(), &bullish_tape());

        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence >= 70.0, "confidence {}", signal.confidence);
        assert_eq!(signal.entry_price, 100.02);

        // SL 0.5 % below entry, TP1 at 2x that distance, TP2 scaled by pi.
        assert!((signal.stop_loss - 100.02 * 0.995).abs() < 1e-9);
        assert!((signal.take_profit_1 - 100.02 * 1.01).abs() < 1e-9);
        assert!((signal.take_profit_2 - 100.02 * (1.0 + 0.01 * PI)).abs() < 1e-9);
        assert!((signal.risk_reward - 2.0).abs() < 0.01);
    }

    #[test]
    fn wide_spread_is_rejected_before_scoring() {
        let analyzer = analyzer();
        let book = BookTop {
            bids: vec![(100.00, 5.0), (99.99, 5.0)],
            asks: vec![(100.20, 1.0), (100.21, 1.0)],
            last_update_id: 1,
        };
        let signal = analyzer.analyze("BTCUSDT", &book, &bullish_tape());
        assert_eq!(signal.direction, Direction::Wait);
        assert!(signal.reasons[0].contains("wide spread"));
    }

    #[test]
    fn heavy_resistance_walls_trip_the_liquidity_gate() {
        let mut config = BotConfig::default();
        config.signals.large_order_threshold = 100.0;
        let analyzer = SignalAnalyzer::new(&config);

        // One dominant ask wall, no large bids: wall = 50 - 15 - 20 = 15 < 40.
        let book = BookTop {
            bids: vec![(100.00, 1.0), (99.99, 1.0)],
            asks: vec![(100.02, 200.0), (100.03, 10.0)],
            last_update_id: 1,
        };
        let signal = analyzer.analyze("BTCUSDT", &book, &bullish_tape());
        assert_eq!(signal.direction, Direction::Wait);
        assert!(signal.reasons[0].contains("insufficient liquidity"));
    }

    #[test]
    fn cooldown_suppresses_repeat_signals() {
        let analyzer = analyzer();
        let book = bullish_book();
        let tape = bullish_tape();

        let first = analyzer.analyze("BTCUSDT", &book, &tape);
        assert_eq!(first.direction, Direction::Long);

        let second = analyzer.analyze("BTCUSDT", &book, &tape);
        assert_eq!(second.direction, Direction::Wait);
        assert!(second.reasons[0].contains("cooldown"));

        // A different symbol is unaffected.
        let other = analyzer.analyze("ETHUSDT", &book, &tape);
        assert_eq!(other.direction, Direction::Long);
    }

    #[test]
    fn thresholds_follow_strictness() {
        let analyzer = analyzer();

        analyzer.set_strictness(10.0);
        let (long, short) = analyzer.probability_thresholds();
        assert!((long - 0.50).abs() < 1e-9); // clamped at the floor
        assert!((short - 0.49).abs() < 1e-9);

        analyzer.set_strictness(50.0);
        let (long, _) = analyzer.probability_thresholds();
        assert!((long - 0.57).abs() < 1e-9);

        analyzer.set_strictness(100.0);
        let (long, short) = analyzer.probability_thresholds();
        assert!((long - 0.66).abs() < 1e-9);
        assert!((short - 0.65).abs() < 1e-9);
    }

    #[test]
    fn trading_styles_map_onto_strictness() {
        let analyzer = analyzer();
        analyzer.set_trading_style(TradingStyle::Conservative);
        assert_eq!(analyzer.strictness(), 30.0);
        analyzer.set_trading_style(TradingStyle::Aggressive);
        assert_eq!(analyzer.strictness(), 80.0);
        analyzer.set_trading_style(TradingStyle::Moderate);
        assert_eq!(analyzer.strictness(), 50.0);
    }

    #[test]
    fn empty_book_waits() {
        let analyzer = analyzer();
        let book = BookTop::default();
        let signal = analyzer.analyze("BTCUSDT", &book, &[]);
        assert_eq!(signal.direction, Direction::Wait);
    }
}
