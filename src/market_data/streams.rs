// =============================================================================
// Market-Data WebSocket Streams — depth, aggTrade, bookTicker per symbol
// =============================================================================
//
// Each stream fn runs until the socket drops or goes quiet, then returns so
// the caller (main.rs) reconnects after a short sleep. A ping is sent every
// 20 s; a socket with no inbound frames for two ping periods is treated as
// dead.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::binance::client::FuturesClient;
use crate::binance::models::parse_levels;

use super::book::{DeltaOutcome, DepthEvent, ResyncGate};
use super::engine::MarketDataEngine;
use super::tape::AggTrade;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const READ_TIMEOUT: Duration = Duration::from_secs(40);
/// Snapshot depth requested when (re)seeding the local book.
const SNAPSHOT_DEPTH: u32 = 1000;

// =============================================================================
// Depth stream
// =============================================================================

/// Run the diff-depth stream for one symbol: connect, seed from a REST
/// snapshot, then apply deltas under the sequence rules. Sequence gaps mark
/// the book unsynced and trigger a throttled resync.
pub async fn run_depth_stream(
    symbol: &str,
    client: &FuturesClient,
    engine: &Arc<MarketDataEngine>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@depth@100ms", client.ws_base());
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Seed the book after the stream is open so buffered events bridge the
    // snapshot (events sit in the socket until we start reading).
    let snapshot = client
        .depth_snapshot(symbol, SNAPSHOT_DEPTH)
        .await
        .context("initial depth snapshot failed")?;
    engine.apply_snapshot(symbol, &snapshot);
    info!(symbol = %symbol, last_update_id = snapshot.last_update_id, "depth stream synced");

    let mut gate = ResyncGate::new();
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(symbol = %symbol, "depth WebSocket ping failed");
                    return Ok(());
                }
            }
            msg = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(_) => {
                        warn!(symbol = %symbol, "depth WebSocket silent, reconnecting");
                        return Ok(());
                    }
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_depth_event(&text) {
                            Ok(event) => {
                                handle_depth_event(symbol, client, engine, &mut gate, &event).await;
                            }
                            Err(e) => {
                                debug!(symbol = %symbol, error = %e, "depth frame dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol = %symbol, "depth WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_depth_event(
    symbol: &str,
    client: &FuturesClient,
    engine: &Arc<MarketDataEngine>,
    gate: &mut ResyncGate,
    event: &DepthEvent,
) {
    match engine.apply_depth(symbol, event) {
        DeltaOutcome::Applied | DeltaOutcome::Stale => {}
        DeltaOutcome::Gap | DeltaOutcome::NotSynced => {
            if !gate.try_begin(Instant::now()) {
                if gate.exhausted() {
                    debug!(symbol, "resync attempts exhausted, symbol paused");
                }
                return;
            }
            match client.depth_snapshot(symbol, SNAPSHOT_DEPTH).await {
                Ok(snapshot) => {
                    engine.apply_snapshot(symbol, &snapshot);
                    gate.record_success();
                    info!(symbol, last_update_id = snapshot.last_update_id, "book resynced");
                }
                Err(e) => {
                    engine.mark_unsynced(symbol);
                    warn!(symbol, error = %e, "resync snapshot failed");
                }
            }
        }
    }
}

/// Parse a diff-depth frame.
///
/// Expected shape:
/// ```json
/// { "e": "depthUpdate", "U": 100, "u": 105, "pu": 99,
///   "b": [["100.00", "5"]], "a": [["100.02", "1"]] }
/// ```
fn parse_depth_event(text: &str) -> Result<DepthEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let first_id = root["U"].as_u64().context("missing field U")?;
    let final_id = root["u"].as_u64().context("missing field u")?;
    let prev_final_id = root["pu"].as_u64().context("missing field pu")?;
    let bids = parse_levels(&root["b"]).map_err(|e| anyhow::anyhow!("{e}"))?;
    let asks = parse_levels(&root["a"]).map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(DepthEvent {
        first_id,
        final_id,
        prev_final_id,
        bids,
        asks,
    })
}

// =============================================================================
// Aggregate-trade stream
// =============================================================================

/// Run the aggTrade stream for one symbol, feeding validated prints into the
/// engine's tape.
pub async fn run_agg_trade_stream(
    symbol: &str,
    client: &FuturesClient,
    engine: &Arc<MarketDataEngine>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@aggTrade", client.ws_base());
    info!(url = %url, symbol = %symbol, "connecting to aggTrade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to aggTrade WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await;

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(symbol = %symbol, "aggTrade WebSocket ping failed");
                    return Ok(());
                }
            }
            msg = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(_) => {
                        warn!(symbol = %symbol, "aggTrade WebSocket silent, reconnecting");
                        return Ok(());
                    }
                };
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_agg_trade(&text) {
                        Ok(trade) => engine.push_trade(symbol, trade),
                        Err(e) => debug!(symbol = %symbol, error = %e, "aggTrade frame dropped"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(symbol = %symbol, error = %e, "aggTrade WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol = %symbol, "aggTrade WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Parse an aggTrade frame.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "p": "100.01", "q": "0.5", "T": 1700000000000, "m": false }
/// ```
fn parse_agg_trade(text: &str) -> Result<AggTrade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;
    let qty: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;
    let time_ms = root["T"].as_i64().context("missing field T")?;
    let buyer_is_maker = root["m"].as_bool().context("missing field m")?;

    Ok(AggTrade {
        price,
        qty,
        time_ms,
        buyer_is_maker,
    })
}

// =============================================================================
// Book-ticker stream
// =============================================================================

/// Run the bookTicker stream for one symbol, keeping the live best bid/ask.
pub async fn run_book_ticker_stream(
    symbol: &str,
    client: &FuturesClient,
    engine: &Arc<MarketDataEngine>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@bookTicker", client.ws_base());
    info!(url = %url, symbol = %symbol, "connecting to bookTicker WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to bookTicker WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await;

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(symbol = %symbol, "bookTicker WebSocket ping failed");
                    return Ok(());
                }
            }
            msg = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(_) => {
                        warn!(symbol = %symbol, "bookTicker WebSocket silent, reconnecting");
                        return Ok(());
                    }
                };
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_book_ticker(&text) {
                        Ok((bid, ask, ts_ms)) => engine.update_quote(symbol, bid, ask, ts_ms),
                        Err(e) => debug!(symbol = %symbol, error = %e, "bookTicker frame dropped"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(symbol = %symbol, error = %e, "bookTicker WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol = %symbol, "bookTicker WebSocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Parse a bookTicker frame: `{ "b": "100.00", "a": "100.02", "T": ... }`.
fn parse_book_ticker(text: &str) -> Result<(f64, f64, i64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bookTicker JSON")?;

    let bid: f64 = root["b"]
        .as_str()
        .context("missing field b")?
        .parse()
        .context("failed to parse bid")?;
    let ask: f64 = root["a"]
        .as_str()
        .context("missing field a")?
        .parse()
        .context("failed to parse ask")?;
    let ts_ms = root["T"]
        .as_i64()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    Ok((bid, ask, ts_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_depth_event_reads_sequence_fields() {
        let text = r#"{"e":"depthUpdate","U":100,"u":105,"pu":99,
                       "b":[["100.00","5"]],"a":[["100.02","0"]]}"#;
        let ev = parse_depth_event(text).unwrap();
        assert_eq!(ev.first_id, 100);
        assert_eq!(ev.final_id, 105);
        assert_eq!(ev.prev_final_id, 99);
        assert_eq!(ev.bids, vec![(100.00, 5.0)]);
        assert_eq!(ev.asks, vec![(100.02, 0.0)]);
    }

    #[test]
    fn parse_depth_event_rejects_missing_sequence() {
        let text = r#"{"e":"depthUpdate","b":[],"a":[]}"#;
        assert!(parse_depth_event(text).is_err());
    }

    #[test]
    fn parse_agg_trade_reads_fields() {
        let text = r#"{"e":"aggTrade","p":"100.01","q":"0.5","T":1700000000000,"m":true}"#;
        let t = parse_agg_trade(text).unwrap();
        assert_eq!(t.price, 100.01);
        assert_eq!(t.qty, 0.5);
        assert_eq!(t.time_ms, 1_700_000_000_000);
        assert!(t.buyer_is_maker);
        assert!(!t.is_aggressive_buy());
    }

    #[test]
    fn parse_book_ticker_reads_fields() {
        let text = r#"{"b":"100.00","a":"100.02","T":1700000000000}"#;
        let (bid, ask, ts) = parse_book_ticker(text).unwrap();
        assert_eq!(bid, 100.00);
        assert_eq!(ask, 100.02);
        assert_eq!(ts, 1_700_000_000_000);
    }
}
