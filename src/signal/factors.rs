// =============================================================================
// Factor scores — six order-book / tape factors, each normalised to [0, 100]
// =============================================================================
//
// Breakpoints follow the Pareto 80/20 split and the golden-ratio levels; depth
// windows are the Fibonacci counts 10 and 21. 50 is neutral everywhere, above
// favours longs, below favours shorts.
// =============================================================================

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::market_data::{AggTrade, BookTop};

pub const FIB_LEVELS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];

/// Momentum looks at the most recent 21 prints, recency-weighted.
const MOMENTUM_WINDOW: usize = 21;
/// Volatility estimate uses the last 50 prints.
const VOLATILITY_WINDOW: usize = 50;

/// The six factor scores attached to every emitted signal.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FactorScores {
    pub wall: f64,
    pub spread: f64,
    pub imbalance: f64,
    pub aggression: f64,
    pub momentum: f64,
    pub fib: f64,
}

// =============================================================================
// Imbalance
// =============================================================================

/// Bid/ask volume imbalance over the near (10) and deep (21) windows.
///
/// Returns `(score, bid_share, reasons)`.
pub fn imbalance_score(book: &BookTop, depth_confirm_share: f64) -> (f64, f64, Vec<String>) {
    let near_bids: f64 = book.bids.iter().take(10).map(|&(_, q)| q).sum();
    let near_asks: f64 = book.asks.iter().take(10).map(|&(_, q)| q).sum();
    let total_near = near_bids + near_asks;

    if total_near == 0.0 {
        return (50.0, 0.5, vec!["no resting volume".to_string()]);
    }

    let far_bids: f64 = if book.bids.len() > 10 {
        book.bids.iter().take(21).map(|&(_, q)| q).sum()
    } else {
        near_bids
    };
    let far_asks: f64 = if book.asks.len() > 10 {
        book.asks.iter().take(21).map(|&(_, q)| q).sum()
    } else {
        near_asks
    };
    let total_far = far_bids + far_asks;

    let bid_share = near_bids / total_near;
    let ask_share = 1.0 - bid_share;
    let bid_share_far = if total_far > 0.0 {
        far_bids / total_far
    } else {
        0.5
    };

    let mut reasons = Vec::new();
    let mut score: f64;

    if bid_share >= 0.80 {
        score = 100.0;
        reasons.push(format!("strong bid imbalance {:.0}%", bid_share * 100.0));
    } else if bid_share >= 0.70 {
        score = 80.0;
        reasons.push(format!("bid imbalance {:.0}%", bid_share * 100.0));
    } else if bid_share >= 0.62 {
        score = 65.0;
        reasons.push(format!("bid share {:.0}%", bid_share * 100.0));
    } else if ask_share >= 0.80 {
        score = 0.0;
        reasons.push(format!("strong ask imbalance {:.0}%", ask_share * 100.0));
    } else if ask_share >= 0.70 {
        score = 20.0;
        reasons.push(format!("ask imbalance {:.0}%", ask_share * 100.0));
    } else if ask_share >= 0.62 {
        score = 35.0;
        reasons.push(format!("ask share {:.0}%", ask_share * 100.0));
    } else {
        score = 50.0;
        reasons.push(format!(
            "balanced book {:.0}/{:.0}",
            bid_share * 100.0,
            ask_share * 100.0
        ));
    }

    // Deep-book confirmation bonus.
    if bid_share >= depth_confirm_share && bid_share_far >= depth_confirm_share {
        score = (score + 10.0).min(100.0);
        reasons.push("depth confirms".to_string());
    }

    (score, bid_share, reasons)
}

// =============================================================================
// Walls
// =============================================================================

/// Large resting orders: quantity above 3x the book average or above the
/// configured notional threshold.
pub fn wall_score(book: &BookTop, current_price: f64, notional_threshold: f64) -> (f64, Vec<String>) {
    let order_count = book.bids.len() + book.asks.len();
    if order_count == 0 || current_price <= 0.0 {
        return (50.0, vec!["no book data".to_string()]);
    }

    let total_qty: f64 = book
        .bids
        .iter()
        .chain(book.asks.iter())
        .map(|&(_, q)| q)
        .sum();
    let avg_qty = total_qty / order_count as f64;
    let large_min = (avg_qty * 3.0).max(notional_threshold / current_price);

    let large_bids: Vec<(f64, f64)> = book
        .bids
        .iter()
        .filter(|&&(_, q)| q >= large_min)
        .copied()
        .collect();
    let large_asks: Vec<(f64, f64)> = book
        .asks
        .iter()
        .filter(|&&(_, q)| q >= large_min)
        .copied()
        .collect();

    let mut reasons = Vec::new();
    let mut score: f64 = 50.0;

    if let Some(&(price, qty)) = large_bids.first() {
        reasons.push(format!("bid wall at {:.4} (${:.0})", price, qty * price));
        score += 15.0;
    }
    if let Some(&(price, qty)) = large_asks.first() {
        reasons.push(format!("ask wall at {:.4} (${:.0})", price, qty * price));
        score -= 15.0;
    }

    if large_bids.len() > large_asks.len() {
        score += 20.0;
        reasons.push(format!(
            "more support walls ({} vs {})",
            large_bids.len(),
            large_asks.len()
        ));
    } else if large_asks.len() > large_bids.len() {
        score -= 20.0;
        reasons.push(format!(
            "more resistance walls ({} vs {})",
            large_asks.len(),
            large_bids.len()
        ));
    }

    (score.clamp(0.0, 100.0), reasons)
}

// =============================================================================
// Aggression
// =============================================================================

/// Taker buy volume as a share of total taker volume in the window.
pub fn aggression_score(trades: &[AggTrade]) -> (f64, Vec<String>) {
    if trades.is_empty() {
        return (50.0, vec!["no trade data".to_string()]);
    }

    let buy_volume: f64 = trades
        .iter()
        .filter(|t| t.is_aggressive_buy())
        .map(|t| t.qty)
        .sum();
    let sell_volume: f64 = trades
        .iter()
        .filter(|t| !t.is_aggressive_buy())
        .map(|t| t.qty)
        .sum();
    let total = buy_volume + sell_volume;

    if total == 0.0 {
        return (50.0, vec!["no aggressive flow".to_string()]);
    }

    let buy_count = trades.iter().filter(|t| t.is_aggressive_buy()).count();
    let buy_share = buy_volume / total;

    let (score, reason) = if buy_share >= 0.75 {
        (
            100.0,
            format!("aggressive buying {buy_count}/{}", trades.len()),
        )
    } else if buy_share >= 0.65 {
        (80.0, format!("buyers dominate {buy_count}/{}", trades.len()))
    } else if buy_share >= 0.55 {
        (60.0, format!("more buying {buy_count}/{}", trades.len()))
    } else if buy_share <= 0.25 {
        (
            0.0,
            format!(
                "aggressive selling {}/{}",
                trades.len() - buy_count,
                trades.len()
            ),
        )
    } else if buy_share <= 0.35 {
        (
            20.0,
            format!(
                "sellers dominate {}/{}",
                trades.len() - buy_count,
                trades.len()
            ),
        )
    } else if buy_share <= 0.45 {
        (
            40.0,
            format!("more selling {}/{}", trades.len() - buy_count, trades.len()),
        )
    } else {
        (50.0, "balanced flow".to_string())
    };

    (score, vec![reason])
}

// =============================================================================
// Fibonacci
// =============================================================================

/// Alignment of book volumes with Fibonacci ratios of the largest order, and
/// proximity of price to that anchor.
pub fn fibonacci_score(book: &BookTop, current_price: f64) -> (f64, Vec<String>) {
    let max_bid = book
        .bids
        .iter()
        .copied()
        .max_by(|a, b| a.1.total_cmp(&b.1));
    let max_ask = book
        .asks
        .iter()
        .copied()
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let anchor = match (max_bid, max_ask) {
        (Some(b), Some(a)) => {
            if b.1 > a.1 {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return (50.0, vec!["no book data".to_string()]),
    };
    let (anchor_price, anchor_qty) = anchor;
    if anchor_qty <= 0.0 || current_price <= 0.0 {
        return (50.0, vec!["no book data".to_string()]);
    }

    let mut reasons = Vec::new();
    let mut score: f64 = 50.0;

    for fib in FIB_LEVELS {
        let level_qty = anchor_qty * fib;
        let matched = book
            .bids
            .iter()
            .chain(book.asks.iter())
            .any(|&(_, q)| ((q - level_qty) / anchor_qty).abs() < 0.1);
        if matched {
            reasons.push(format!("fib {fib} volume cluster"));
            score += 5.0;
        }
    }

    let price_distance = (current_price - anchor_price).abs() / current_price;
    if price_distance < 0.005 {
        reasons.push(format!("price near anchor order {anchor_price:.4}"));
        score += 15.0;
    }

    (score.clamp(0.0, 100.0), reasons)
}

// =============================================================================
// Spread
// =============================================================================

/// Relative spread quality; anything above 0.1 % scores zero (and symbols at
/// that level are rejected before scoring).
pub fn spread_score(spread_percent: f64) -> (f64, Vec<String>) {
    let (score, reason) = if spread_percent <= 0.02 {
        (100.0, format!("excellent spread {spread_percent:.3}%"))
    } else if spread_percent <= 0.03 {
        (80.0, format!("good spread {spread_percent:.3}%"))
    } else if spread_percent <= 0.05 {
        (60.0, format!("average spread {spread_percent:.3}%"))
    } else if spread_percent <= 0.1 {
        (40.0, format!("wide spread {spread_percent:.3}%"))
    } else {
        (0.0, format!("very wide spread {spread_percent:.3}%"))
    };
    (score, vec![reason])
}

// =============================================================================
// Momentum
// =============================================================================

/// Recency-weighted taker buy/sell pressure over the most recent 21 prints.
pub fn momentum_score(trades: &[AggTrade]) -> (f64, Vec<String>) {
    if trades.len() < 5 {
        return (50.0, vec!["insufficient trades for momentum".to_string()]);
    }

    let window = if trades.len() >= MOMENTUM_WINDOW {
        &trades[trades.len() - MOMENTUM_WINDOW..]
    } else {
        trades
    };

    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;
    for (i, trade) in window.iter().enumerate() {
        // Newest trades carry the most weight.
        let weight = (i + 1) as f64 / window.len() as f64;
        let volume = trade.qty * weight;
        if trade.is_aggressive_buy() {
            buy_volume += volume;
        } else {
            sell_volume += volume;
        }
    }

    let total = buy_volume + sell_volume;
    if total == 0.0 {
        return (50.0, vec!["no volume".to_string()]);
    }
    let buy_share = buy_volume / total;

    let (score, reason) = if buy_share >= 0.80 {
        (
            100.0,
            format!("strong momentum up {:.0}%", buy_share * 100.0),
        )
    } else if buy_share >= 0.70 {
        (85.0, format!("momentum up {:.0}%", buy_share * 100.0))
    } else if buy_share >= 0.62 {
        (70.0, format!("weak momentum up {:.0}%", buy_share * 100.0))
    } else if buy_share <= 0.20 {
        (
            0.0,
            format!("strong momentum down {:.0}%", (1.0 - buy_share) * 100.0),
        )
    } else if buy_share <= 0.30 {
        (
            15.0,
            format!("momentum down {:.0}%", (1.0 - buy_share) * 100.0),
        )
    } else if buy_share <= 0.38 {
        (
            30.0,
            format!("weak momentum down {:.0}%", (1.0 - buy_share) * 100.0),
        )
    } else {
        (50.0, "neutral momentum".to_string())
    };

    (score, vec![reason])
}

// =============================================================================
// Probability model
// =============================================================================

/// Nearest support/resistance: the closest level whose volume ratio to the
/// side's maximum sits within 0.08 of a Fibonacci level, clamped to +/-5 % of
/// the current price.
pub fn probability_levels(book: &BookTop, current_price: f64) -> (f64, f64) {
    let mut support = current_price * 0.999;
    let mut resistance = current_price * 1.001;

    if let Some(max_bid_qty) = book
        .bids
        .iter()
        .map(|&(_, q)| q)
        .max_by(f64::total_cmp)
        .filter(|&q| q > 0.0)
    {
        let mut best: Option<(f64, f64)> = None;
        for &(price, qty) in book.bids.iter().take(100) {
            if price > current_price {
                continue;
            }
            let ratio = qty / max_bid_qty;
            if FIB_LEVELS.iter().any(|&fib| (ratio - fib).abs() <= 0.08) {
                let distance = current_price - price;
                if best.map(|(d, _)| distance < d).unwrap_or(true) {
                    best = Some((distance, price));
                }
            }
        }
        support = match best {
            Some((_, price)) => price,
            None => book.best_bid().unwrap_or(support),
        };
    }

    if let Some(max_ask_qty) = book
        .asks
        .iter()
        .map(|&(_, q)| q)
        .max_by(f64::total_cmp)
        .filter(|&q| q > 0.0)
    {
        let mut best: Option<(f64, f64)> = None;
        for &(price, qty) in book.asks.iter().take(100) {
            if price < current_price {
                continue;
            }
            let ratio = qty / max_ask_qty;
            if FIB_LEVELS.iter().any(|&fib| (ratio - fib).abs() <= 0.08) {
                let distance = price - current_price;
                if best.map(|(d, _)| distance < d).unwrap_or(true) {
                    best = Some((distance, price));
                }
            }
        }
        resistance = match best {
            Some((_, price)) => price,
            None => book.best_ask().unwrap_or(resistance),
        };
    }

    (
        support.max(current_price * 0.95),
        resistance.min(current_price * 1.05),
    )
}

/// Standard deviation of consecutive price deltas over the recent tape,
/// floored at 5 bps of price.
pub fn estimate_volatility(trades: &[AggTrade], current_price: f64) -> f64 {
    let fallback = current_price * 0.0008;
    let floor = current_price * 0.0005;

    let start = trades.len().saturating_sub(VOLATILITY_WINDOW);
    let prices: Vec<f64> = trades[start..]
        .iter()
        .map(|t| t.price)
        .filter(|&p| p > 0.0)
        .collect();
    if prices.len() < 2 {
        return fallback;
    }

    let diffs: Vec<f64> = prices.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
    let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
    let sigma = variance.max(1e-12).sqrt();

    sigma.max(floor)
}

/// Horizon in seconds inferred from the tape's time span, floored at 30 s.
pub fn estimate_horizon(trades: &[AggTrade]) -> f64 {
    if trades.len() < 2 {
        return 30.0;
    }
    let min = trades.iter().map(|t| t.time_ms).min().unwrap_or(0);
    let max = trades.iter().map(|t| t.time_ms).max().unwrap_or(0);
    ((max - min) as f64 / 1000.0).max(30.0)
}

/// Normal-CDF estimate for reaching a level `delta` away within `horizon`
/// seconds given volatility `sigma`.
pub fn probability_to_level(delta: f64, sigma: f64, horizon: f64, current_price: f64) -> f64 {
    if delta <= 0.0 {
        return 0.5;
    }
    let mut denom = sigma.max(current_price * 0.0005) * horizon.max(1.0).sqrt();
    if denom <= 0.0 {
        denom = current_price * 0.0005;
    }
    let z = delta / denom;
    let normal = Normal::new(0.0, 1.0).expect("unit normal is well-formed");
    normal.cdf(z)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trade(qty: f64, buy: bool, time_ms: i64) -> AggTrade {
        AggTrade {
            price: 100.0,
            qty,
            time_ms,
            buyer_is_maker: !buy,
        }
    }

    fn book(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> BookTop {
        BookTop {
            bids,
            asks,
            last_update_id: 1,
        }
    }

    #[test]
    fn imbalance_pareto_band_scores_100() {
        let b = book(
            vec![(100.0, 80.0), (99.99, 4.0)],
            vec![(100.02, 10.0), (100.03, 10.0)],
        );
        let (score, bid_share, _) = imbalance_score(&b, 0.65);
        assert!(bid_share > 0.80);
        // 100 base + depth confirmation would exceed the cap; stays at 100.
        assert_eq!(score, 100.0);
    }

    #[test]
    fn imbalance_is_mirrored_for_asks() {
        let b = book(
            vec![(100.0, 10.0), (99.99, 10.0)],
            vec![(100.02, 80.0), (100.03, 4.0)],
        );
        let (score, bid_share, _) = imbalance_score(&b, 0.65);
        assert!(bid_share < 0.20);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn wall_asymmetry_moves_the_score() {
        // One huge bid, small everything else; low threshold so it qualifies.
        let b = book(
            vec![(100.0, 100.0), (99.99, 1.0)],
            vec![(100.02, 1.0), (100.03, 1.0)],
        );
        let (score, reasons) = wall_score(&b, 100.0, 100.0);
        assert!(score > 50.0);
        assert!(reasons.iter().any(|r| r.contains("bid wall")));
    }

    #[test]
    fn aggression_bands_are_symmetric() {
        let now = 1_700_000_000_000;
        let buys: Vec<AggTrade> = (0..8)
            .map(|i| trade(1.0, true, now + i))
            .chain((0..2).map(|i| trade(1.0, false, now + 10 + i)))
            .collect();
        let (buy_score, _) = aggression_score(&buys);
        assert_eq!(buy_score, 100.0);

        let sells: Vec<AggTrade> = (0..8)
            .map(|i| trade(1.0, false, now + i))
            .chain((0..2).map(|i| trade(1.0, true, now + 10 + i)))
            .collect();
        let (sell_score, _) = aggression_score(&sells);
        assert_eq!(sell_score, 0.0);
    }

    #[test]
    fn momentum_weights_recent_trades_heavier() {
        let now = 1_700_000_000_000;
        // 10 old sells then 11 recent buys: weighted share leans buy.
        let mut trades: Vec<AggTrade> = (0..10).map(|i| trade(1.0, false, now + i)).collect();
        trades.extend((0..11).map(|i| trade(1.0, true, now + 100 + i)));
        let (score, _) = momentum_score(&trades);
        assert!(score >= 70.0, "score was {score}");
    }

    #[test]
    fn momentum_needs_five_trades() {
        let now = 1_700_000_000_000;
        let trades: Vec<AggTrade> = (0..4).map(|i| trade(1.0, true, now + i)).collect();
        let (score, reasons) = momentum_score(&trades);
        assert_eq!(score, 50.0);
        assert!(reasons[0].contains("insufficient"));
    }

    #[test]
    fn spread_bands() {
        assert_eq!(spread_score(0.01).0, 100.0);
        assert_eq!(spread_score(0.025).0, 80.0);
        assert_eq!(spread_score(0.04).0, 60.0);
        assert_eq!(spread_score(0.08).0, 40.0);
        assert_eq!(spread_score(0.2).0, 0.0);
    }

    #[test]
    fn probability_levels_pick_fib_clusters() {
        // Ask ladder with a 0.618-ratio cluster at 100.08 (6.2 / 10.0).
        let b = book(
            vec![(100.00, 5.0), (99.99, 2.0)],
            vec![(100.02, 1.0), (100.08, 6.2), (100.12, 10.0)],
        );
        let (support, resistance) = probability_levels(&b, 100.01);
        // Bid ratio 2/5 = 0.4 matches fib 0.382 at 99.99.
        assert!((support - 99.99).abs() < 1e-9);
        assert!((resistance - 100.08).abs() < 1e-9);
    }

    #[test]
    fn probability_levels_clamp_to_five_percent() {
        let b = book(vec![(80.0, 5.0), (79.0, 2.0)], vec![(120.0, 5.0)]);
        let (support, resistance) = probability_levels(&b, 100.0);
        assert!(support >= 95.0);
        assert!(resistance <= 105.0);
    }

    #[test]
    fn probability_to_level_is_half_at_zero_delta() {
        assert_eq!(probability_to_level(0.0, 0.05, 30.0, 100.0), 0.5);
        let p = probability_to_level(0.07, 0.05, 30.0, 100.0);
        assert!(p > 0.5 && p < 1.0);
    }

    #[test]
    fn volatility_has_a_price_floor() {
        let now = 1_700_000_000_000;
        let trades: Vec<AggTrade> = (0..20).map(|i| trade(1.0, true, now + i)).collect();
        let sigma = estimate_volatility(&trades, 100.0);
        assert!((sigma - 0.05).abs() < 1e-9);
    }

    #[test]
    fn horizon_floors_at_thirty_seconds() {
        let now = 1_700_000_000_000;
        let trades: Vec<AggTrade> = (0..10).map(|i| trade(1.0, true, now + i * 500)).collect();
        assert_eq!(estimate_horizon(&trades), 30.0);

        let spread_out: Vec<AggTrade> =
            (0..10).map(|i| trade(1.0, true, now + i * 10_000)).collect();
        assert_eq!(estimate_horizon(&spread_out), 90.0);
    }
}
