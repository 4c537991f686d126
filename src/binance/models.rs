// =============================================================================
// Typed payloads for the UM-Futures REST API
// =============================================================================
//
// Binance serialises most numbers as strings; the parse helpers here accept
// either form so a schema drift on one field does not break the whole payload.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::error::{ExchangeError, ExchangeResult};

/// Trading limits for one symbol, extracted from the exchangeInfo filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub tick_size: f64,
}

/// REST depth snapshot at a fixed point in the update sequence.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// USDT wallet and available balance.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccountBalance {
    pub wallet: f64,
    pub available: f64,
}

/// One row of /fapi/v2/positionRisk.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed: positive = long, negative = short, zero = flat.
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// One open order as reported by /fapi/v1/openOrders or /fapi/v1/order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderInfo {
    pub symbol: String,
    pub order_id: u64,
    pub side: String,
    pub order_type: String,
    pub price: f64,
    pub stop_price: f64,
    pub orig_qty: f64,
    pub status: String,
    pub reduce_only: bool,
    pub time: i64,
}

impl OrderInfo {
    pub fn is_working(&self) -> bool {
        self.status == "NEW" || self.status == "PARTIALLY_FILLED"
    }
}

/// Individual fill reported inside an order acknowledgement.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
}

/// Acknowledgement of a submitted order.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: u64,
    pub status: String,
    /// Average fill price; 0.0 when the exchange has not filled anything yet.
    pub avg_fill_price: f64,
    pub fills: Vec<OrderFill>,
}

impl OrderAck {
    /// Best-effort fill price: explicit average, else volume-weighted fills,
    /// else the caller's fallback.
    pub fn fill_price_or(&self, fallback: f64) -> f64 {
        if self.avg_fill_price > 0.0 {
            return self.avg_fill_price;
        }
        let qty: f64 = self.fills.iter().map(|f| f.qty).sum();
        if qty > 0.0 {
            let notional: f64 = self.fills.iter().map(|f| f.price * f.qty).sum();
            return notional / qty;
        }
        fallback
    }
}

/// One row of /fapi/v1/userTrades.
#[derive(Debug, Clone)]
pub struct AccountTrade {
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub time: i64,
}

// =============================================================================
// Parse helpers
// =============================================================================

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_f64(val: &serde_json::Value) -> ExchangeResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ExchangeError::Protocol(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ExchangeError::Protocol(format!(
            "expected string or number, got: {val}"
        )))
    }
}

/// Like [`parse_f64`] but tolerant of missing fields.
pub(crate) fn parse_f64_or(val: &serde_json::Value, default: f64) -> f64 {
    parse_f64(val).unwrap_or(default)
}

/// Parse a `[["price","qty"], ...]` depth ladder.
pub(crate) fn parse_levels(val: &serde_json::Value) -> ExchangeResult<Vec<(f64, f64)>> {
    let arr = val
        .as_array()
        .ok_or_else(|| ExchangeError::Protocol("depth levels are not an array".into()))?;

    let mut levels = Vec::with_capacity(arr.len());
    for entry in arr {
        let pair = entry
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("depth level is not an array".into()))?;
        if pair.len() < 2 {
            return Err(ExchangeError::Protocol("depth level too short".into()));
        }
        levels.push((parse_f64(&pair[0])?, parse_f64(&pair[1])?));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_f64_accepts_string_and_number() {
        assert_eq!(parse_f64(&json!("42.5")).unwrap(), 42.5);
        assert_eq!(parse_f64(&json!(42.5)).unwrap(), 42.5);
        assert!(parse_f64(&json!(null)).is_err());
        assert!(parse_f64(&json!("abc")).is_err());
    }

    #[test]
    fn parse_levels_reads_price_qty_pairs() {
        let val = json!([["100.5", "2.0"], ["100.4", "1.5"]]);
        let levels = parse_levels(&val).unwrap();
        assert_eq!(levels, vec![(100.5, 2.0), (100.4, 1.5)]);
    }

    #[test]
    fn fill_price_prefers_avg_then_fills() {
        let ack = OrderAck {
            order_id: 1,
            status: "FILLED".into(),
            avg_fill_price: 0.0,
            fills: vec![
                OrderFill {
                    price: 100.0,
                    qty: 1.0,
                    commission: 0.0,
                },
                OrderFill {
                    price: 101.0,
                    qty: 1.0,
                    commission: 0.0,
                },
            ],
        };
        assert!((ack.fill_price_or(99.0) - 100.5).abs() < 1e-9);

        let empty = OrderAck {
            order_id: 2,
            status: "NEW".into(),
            avg_fill_price: 0.0,
            fills: vec![],
        };
        assert_eq!(empty.fill_price_or(99.0), 99.0);
    }
}
