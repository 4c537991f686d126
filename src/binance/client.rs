// =============================================================================
// UM-Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests carry
// X-MBX-APIKEY as a header and a recvWindow of 60 000 ms; the testnet clock in
// particular drifts enough that a tight window produces spurious rejections.
//
// The testnet flag only swaps base URLs. No probe request is made at
// construction time.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use super::error::{ExchangeError, ExchangeResult};
use super::models::{
    parse_f64, parse_f64_or, parse_levels, AccountBalance, AccountTrade, DepthSnapshot, OrderAck,
    OrderFill, OrderInfo, PositionInfo, SymbolRules,
};

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 60_000;

const MAINNET_API: &str = "https://fapi.binance.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_API: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

/// Snapshot fetches are latency-sensitive; orders and account reads less so.
const DEPTH_TIMEOUT: Duration = Duration::from_secs(5);
const ORDER_TIMEOUT: Duration = Duration::from_secs(10);
const ACCOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// UM-futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct FuturesClient {
    secret: String,
    api_base: String,
    ws_base: String,
    client: reqwest::Client,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (api_base, ws_base) = if testnet {
            (TESTNET_API, TESTNET_WS)
        } else {
            (MAINNET_API, MAINNET_WS)
        };

        debug!(api_base, testnet, "FuturesClient initialised");

        Self {
            secret,
            api_base: api_base.to_string(),
            ws_base: ws_base.to_string(),
            client,
        }
    }

    /// Base URL for WebSocket market-data streams.
    pub fn ws_base(&self) -> &str {
        &self.ws_base
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow, and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Format a quantity or price without float artefacts or a trailing dot.
    fn fmt_decimal(value: f64) -> String {
        let mut s = format!("{value:.8}");
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        s
    }

    // -------------------------------------------------------------------------
    // Response handling
    // -------------------------------------------------------------------------

    /// Turn an HTTP response into JSON, mapping exchange rejections to
    /// `ExchangeError::Business` with the Binance error code.
    async fn into_json(resp: reqwest::Response) -> ExchangeResult<serde_json::Value> {
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("failed to parse response body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
        let message = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown exchange error")
            .to_string();
        Err(ExchangeError::Business { code, message })
    }

    async fn get(
        &self,
        path: &str,
        query: &str,
        timeout: Duration,
    ) -> ExchangeResult<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.api_base, path)
        } else {
            format!("{}{}?{}", self.api_base, path, query)
        };
        let resp = self.client.get(&url).timeout(timeout).send().await?;
        Self::into_json(resp).await
    }

    async fn get_signed(
        &self,
        path: &str,
        params: &str,
        timeout: Duration,
    ) -> ExchangeResult<serde_json::Value> {
        let qs = self.signed_query(params);
        self.get(path, &qs, timeout).await
    }

    async fn post_signed(
        &self,
        path: &str,
        params: &str,
        timeout: Duration,
    ) -> ExchangeResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.api_base, path, qs);
        let resp = self.client.post(&url).timeout(timeout).send().await?;
        Self::into_json(resp).await
    }

    async fn delete_signed(
        &self,
        path: &str,
        params: &str,
        timeout: Duration,
    ) -> ExchangeResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.api_base, path, qs);
        let resp = self.client.delete(&url).timeout(timeout).send().await?;
        Self::into_json(resp).await
    }

    // -------------------------------------------------------------------------
    // Exchange info / symbol rules
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo — trading rules for every listed symbol.
    #[instrument(skip(self), name = "binance::exchange_info")]
    pub async fn exchange_info(&self) -> ExchangeResult<Vec<SymbolRules>> {
        let body = self
            .get("/fapi/v1/exchangeInfo", "", ACCOUNT_TIMEOUT)
            .await?;

        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("exchangeInfo missing 'symbols'".into()))?;

        let mut rules = Vec::with_capacity(symbols.len());
        for info in symbols {
            if let Some(r) = Self::parse_symbol_rules(info) {
                rules.push(r);
            }
        }

        debug!(count = rules.len(), "exchange info fetched");
        Ok(rules)
    }

    /// GET /fapi/v1/exchangeInfo?symbol= — rules for a single symbol.
    #[instrument(skip(self), name = "binance::symbol_rules")]
    pub async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let body = self
            .get(
                "/fapi/v1/exchangeInfo",
                &format!("symbol={symbol}"),
                ACCOUNT_TIMEOUT,
            )
            .await?;

        body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Self::parse_symbol_rules)
            .ok_or_else(|| {
                ExchangeError::Protocol(format!("symbol {symbol} not found in exchangeInfo"))
            })
    }

    fn parse_symbol_rules(info: &serde_json::Value) -> Option<SymbolRules> {
        let symbol = info["symbol"].as_str()?.to_string();
        let filters = info["filters"].as_array()?;

        let mut rules = SymbolRules {
            symbol,
            min_qty: 0.0,
            max_qty: 0.0,
            step_size: 0.0,
            min_notional: 0.0,
            tick_size: 0.0,
        };

        for f in filters {
            match f["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    rules.min_qty = parse_f64_or(&f["minQty"], 0.0);
                    rules.max_qty = parse_f64_or(&f["maxQty"], 0.0);
                    rules.step_size = parse_f64_or(&f["stepSize"], 0.0);
                }
                Some("PRICE_FILTER") => {
                    rules.tick_size = parse_f64_or(&f["tickSize"], 0.0);
                }
                Some("MIN_NOTIONAL") => {
                    // Futures uses "notional"; older payloads used "minNotional".
                    rules.min_notional = parse_f64_or(&f["notional"], 0.0);
                    if rules.min_notional == 0.0 {
                        rules.min_notional = parse_f64_or(&f["minNotional"], 0.0);
                    }
                }
                _ => {}
            }
        }

        Some(rules)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/depth — order-book snapshot used to seed the local book.
    #[instrument(skip(self), name = "binance::depth_snapshot")]
    pub async fn depth_snapshot(&self, symbol: &str, limit: u32) -> ExchangeResult<DepthSnapshot> {
        let body = self
            .get(
                "/fapi/v1/depth",
                &format!("symbol={symbol}&limit={limit}"),
                DEPTH_TIMEOUT,
            )
            .await?;

        let last_update_id = body["lastUpdateId"]
            .as_u64()
            .ok_or_else(|| ExchangeError::Protocol("depth missing lastUpdateId".into()))?;
        let bids = parse_levels(&body["bids"])?;
        let asks = parse_levels(&body["asks"])?;

        debug!(symbol, last_update_id, "depth snapshot fetched");
        Ok(DepthSnapshot {
            last_update_id,
            bids,
            asks,
        })
    }

    /// GET /fapi/v1/ticker/price — REST price fallback when streams are stale.
    #[instrument(skip(self), name = "binance::ticker_price")]
    pub async fn ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let body = self
            .get(
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
                DEPTH_TIMEOUT,
            )
            .await?;
        parse_f64(&body["price"])
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/account — USDT wallet and available balance.
    #[instrument(skip(self), name = "binance::account_balances")]
    pub async fn account_balances(&self) -> ExchangeResult<AccountBalance> {
        let body = self
            .get_signed("/fapi/v2/account", "", ACCOUNT_TIMEOUT)
            .await?;

        let assets = body["assets"]
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("account missing 'assets'".into()))?;

        for asset in assets {
            if asset["asset"].as_str() == Some("USDT") {
                return Ok(AccountBalance {
                    wallet: parse_f64_or(&asset["walletBalance"], 0.0),
                    available: parse_f64_or(&asset["availableBalance"], 0.0),
                });
            }
        }

        Ok(AccountBalance {
            wallet: 0.0,
            available: 0.0,
        })
    }

    /// GET /fapi/v2/positionRisk — positions, optionally for one symbol.
    #[instrument(skip(self), name = "binance::position_information")]
    pub async fn position_information(
        &self,
        symbol: Option<&str>,
    ) -> ExchangeResult<Vec<PositionInfo>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .get_signed("/fapi/v2/positionRisk", &params, ACCOUNT_TIMEOUT)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("positionRisk is not an array".into()))?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            positions.push(PositionInfo {
                symbol: row["symbol"].as_str().unwrap_or_default().to_string(),
                position_amt: parse_f64_or(&row["positionAmt"], 0.0),
                entry_price: parse_f64_or(&row["entryPrice"], 0.0),
                mark_price: parse_f64_or(&row["markPrice"], 0.0),
                unrealized_pnl: parse_f64_or(&row["unRealizedProfit"], 0.0),
                leverage: parse_f64_or(&row["leverage"], 1.0) as u32,
            });
        }
        Ok(positions)
    }

    /// GET /fapi/v1/userTrades — fills for a symbol from `start_time_ms`.
    #[instrument(skip(self), name = "binance::account_trades_after")]
    pub async fn account_trades_after(
        &self,
        symbol: &str,
        start_time_ms: i64,
    ) -> ExchangeResult<Vec<AccountTrade>> {
        let params = format!("symbol={symbol}&startTime={start_time_ms}");
        let body = self
            .get_signed("/fapi/v1/userTrades", &params, ACCOUNT_TIMEOUT)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("userTrades is not an array".into()))?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            trades.push(AccountTrade {
                symbol: row["symbol"].as_str().unwrap_or_default().to_string(),
                price: parse_f64_or(&row["price"], 0.0),
                qty: parse_f64_or(&row["qty"], 0.0),
                commission: parse_f64_or(&row["commission"], 0.0),
                realized_pnl: parse_f64_or(&row["realizedPnl"], 0.0),
                time: row["time"].as_i64().unwrap_or(0),
            });
        }
        Ok(trades)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/openOrders — all working orders, optionally one symbol.
    #[instrument(skip(self), name = "binance::open_orders")]
    pub async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderInfo>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .get_signed("/fapi/v1/openOrders", &params, ACCOUNT_TIMEOUT)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("openOrders is not an array".into()))?;

        Ok(rows.iter().map(Self::parse_order_info).collect())
    }

    /// GET /fapi/v1/order — one order by id.
    #[instrument(skip(self), name = "binance::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<OrderInfo> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .get_signed("/fapi/v1/order", &params, ACCOUNT_TIMEOUT)
            .await?;
        Ok(Self::parse_order_info(&body))
    }

    fn parse_order_info(row: &serde_json::Value) -> OrderInfo {
        OrderInfo {
            symbol: row["symbol"].as_str().unwrap_or_default().to_string(),
            order_id: row["orderId"].as_u64().unwrap_or(0),
            side: row["side"].as_str().unwrap_or_default().to_string(),
            order_type: row["type"].as_str().unwrap_or_default().to_string(),
            price: parse_f64_or(&row["price"], 0.0),
            stop_price: parse_f64_or(&row["stopPrice"], 0.0),
            orig_qty: parse_f64_or(&row["origQty"], 0.0),
            status: row["status"].as_str().unwrap_or_default().to_string(),
            reduce_only: row["reduceOnly"].as_bool().unwrap_or(false),
            time: row["time"].as_i64().unwrap_or(0),
        }
    }

    fn parse_order_ack(body: &serde_json::Value) -> OrderAck {
        let fills = body["fills"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|f| OrderFill {
                        price: parse_f64_or(&f["price"], 0.0),
                        qty: parse_f64_or(&f["qty"], 0.0),
                        commission: parse_f64_or(&f["commission"], 0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        OrderAck {
            order_id: body["orderId"].as_u64().unwrap_or(0),
            status: body["status"].as_str().unwrap_or_default().to_string(),
            avg_fill_price: parse_f64_or(&body["avgPrice"], 0.0),
            fills,
        }
    }

    /// POST /fapi/v1/order — MARKET.
    #[instrument(skip(self), name = "binance::submit_market_order")]
    pub async fn submit_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={}&reduceOnly={reduce_only}",
            Self::fmt_decimal(quantity)
        );
        debug!(symbol, side, quantity, reduce_only, "submitting market order");
        let body = self
            .post_signed("/fapi/v1/order", &params, ORDER_TIMEOUT)
            .await?;
        Ok(Self::parse_order_ack(&body))
    }

    /// POST /fapi/v1/order — LIMIT GTC.
    #[instrument(skip(self), name = "binance::submit_limit_order")]
    pub async fn submit_limit_order(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=LIMIT&timeInForce=GTC&price={}&quantity={}&reduceOnly={reduce_only}",
            Self::fmt_decimal(price),
            Self::fmt_decimal(quantity)
        );
        debug!(symbol, side, price, quantity, reduce_only, "submitting limit order");
        let body = self
            .post_signed("/fapi/v1/order", &params, ORDER_TIMEOUT)
            .await?;
        Ok(Self::parse_order_ack(&body))
    }

    /// POST /fapi/v1/order — STOP (stop-limit) GTC.
    #[instrument(skip(self), name = "binance::submit_stop_limit_order")]
    pub async fn submit_stop_limit_order(
        &self,
        symbol: &str,
        side: &str,
        stop_price: f64,
        limit_price: f64,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP&timeInForce=GTC&stopPrice={}&price={}&quantity={}&reduceOnly={reduce_only}",
            Self::fmt_decimal(stop_price),
            Self::fmt_decimal(limit_price),
            Self::fmt_decimal(quantity)
        );
        debug!(
            symbol,
            side, stop_price, limit_price, quantity, "submitting stop-limit order"
        );
        let body = self
            .post_signed("/fapi/v1/order", &params, ORDER_TIMEOUT)
            .await?;
        Ok(Self::parse_order_ack(&body))
    }

    /// DELETE /fapi/v1/order.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.delete_signed("/fapi/v1/order", &params, ORDER_TIMEOUT)
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Margin / leverage setup
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/marginType — idempotent: "already set" is success.
    #[instrument(skip(self), name = "binance::set_margin_type")]
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}&marginType={margin_type}");
        match self
            .post_signed("/fapi/v1/marginType", &params, ORDER_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_margin_type_noop() => {
                debug!(symbol, margin_type, "margin type already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// POST /fapi/v1/leverage.
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.post_signed("/fapi/v1/leverage", &params, ORDER_TIMEOUT)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fmt_decimal_strips_artifacts() {
        assert_eq!(FuturesClient::fmt_decimal(0.001), "0.001");
        assert_eq!(FuturesClient::fmt_decimal(98.892), "98.892");
        assert_eq!(FuturesClient::fmt_decimal(5.0), "5");
        assert_eq!(FuturesClient::fmt_decimal(0.1 + 0.2), "0.3");
    }

    #[test]
    fn parse_symbol_rules_extracts_filters() {
        let info = json!({
            "symbol": "XRPUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.0001" },
                { "filterType": "LOT_SIZE", "minQty": "0.1", "maxQty": "1000000", "stepSize": "0.1" },
                { "filterType": "MIN_NOTIONAL", "notional": "5" }
            ]
        });
        let rules = FuturesClient::parse_symbol_rules(&info).unwrap();
        assert_eq!(rules.symbol, "XRPUSDT");
        assert_eq!(rules.tick_size, 0.0001);
        assert_eq!(rules.min_qty, 0.1);
        assert_eq!(rules.step_size, 0.1);
        assert_eq!(rules.min_notional, 5.0);
    }

    #[test]
    fn parse_order_ack_reads_fills() {
        let body = json!({
            "orderId": 42,
            "status": "FILLED",
            "avgPrice": "100.50",
            "fills": [
                { "price": "100.40", "qty": "1", "commission": "0.01" },
                { "price": "100.60", "qty": "1", "commission": "0.01" }
            ]
        });
        let ack = FuturesClient::parse_order_ack(&body);
        assert_eq!(ack.order_id, 42);
        assert_eq!(ack.fills.len(), 2);
        assert!((ack.avg_fill_price - 100.50).abs() < 1e-9);
    }

    #[test]
    fn parse_order_info_defaults_missing_fields() {
        let body = json!({
            "symbol": "BTCUSDT",
            "orderId": 7,
            "side": "BUY",
            "type": "LIMIT",
            "price": "98.892",
            "status": "NEW"
        });
        let info = FuturesClient::parse_order_info(&body);
        assert_eq!(info.order_id, 7);
        assert_eq!(info.stop_price, 0.0);
        assert!(!info.reduce_only);
        assert!(info.is_working());
    }
}
