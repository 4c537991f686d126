// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The control panel is a local single-operator surface: it reads snapshots and
// issues the command set { connection toggle, single-order-mode toggle, close
// position, start position, averaging distance }. Everything lives under
// /api/v1/. CORS is permissive for local development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::trader::Trader;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/history", get(history))
        .route("/api/v1/control/connection", post(control_connection))
        .route(
            "/api/v1/control/single-order-mode",
            post(control_single_order_mode),
        )
        .route("/api/v1/control/close-position", post(control_close_position))
        .route("/api/v1/control/start-position", post(control_start_position))
        .route(
            "/api/v1/control/averaging-distance",
            post(control_averaging_distance),
        )
        .route("/api/v1/control/trading-style", post(control_trading_style))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Read endpoints
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn signals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.current_signals.read().clone())
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trader.positions())
}

async fn history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.trader.closed_trades())
}

// =============================================================================
// Control endpoints
// =============================================================================

#[derive(Deserialize)]
struct ToggleRequest {
    active: bool,
}

#[derive(Serialize)]
struct ToggleResponse {
    active: bool,
}

async fn control_connection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.set_running(req.active);
    if req.active {
        info!("trading resumed via API");
        state.push_event("Trading resumed", "info");
    } else {
        warn!("trading paused via API");
        state.push_event("Trading paused", "info");
    }
    Json(ToggleResponse { active: req.active })
}

async fn control_single_order_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.set_single_order_mode(req.active);

    if req.active {
        let unprotected = state
            .trader
            .positions()
            .iter()
            .filter(|p| !p.is_protected)
            .count();
        if unprotected > 0 {
            warn!(
                unprotected,
                "single-order mode enabled with unprotected positions open"
            );
        }
        state.push_event("Single-order mode enabled", "info");
    } else {
        state.push_event("Single-order mode disabled", "info");
    }
    Json(ToggleResponse { active: req.active })
}

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

async fn control_close_position(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let symbol = req.symbol.to_uppercase();
    if !state.trader.has_position(&symbol) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no open position for {symbol}") })),
        ));
    }

    let price = state.market_data.current_price(&state.client, &symbol).await;
    if price <= 0.0 {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": format!("no current price for {symbol}") })),
        ));
    }

    match state
        .trader
        .close_position_manually(&symbol, price, "Manual")
        .await
    {
        Ok(Some(trade)) => {
            state.push_event(
                format!(
                    "CLOSED {symbol} {} manually: P&L {:+.2}",
                    trade.side, trade.pnl
                ),
                if trade.pnl > 0.0 { "success" } else { "error" },
            );
            Ok(Json(serde_json::json!({ "closed": true, "pnl": trade.pnl })))
        }
        Ok(None) => Ok(Json(serde_json::json!({ "closed": false }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

async fn control_start_position(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let symbol = req.symbol.to_uppercase();

    let signal = state.current_signals.read().get(&symbol).cloned();
    let Some(signal) = signal.filter(|s| s.direction.is_actionable()) else {
        return Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": format!("no actionable signal for {symbol}") })),
        ));
    };

    let Some(book) = state.market_data.book_top(&symbol) else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": format!("no order book for {symbol}") })),
        ));
    };

    match state.trader.open_position(&signal, &book).await {
        Ok(Some(position)) => {
            state.push_event(
                format!(
                    "OPEN {symbol} {} @ ${:.4} (manual start)",
                    position.side, position.entry_price
                ),
                "success",
            );
            Ok(Json(serde_json::json!({ "opened": true, "id": position.id })))
        }
        Ok(None) => Ok(Json(serde_json::json!({ "opened": false }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

#[derive(Deserialize)]
struct TradingStyleRequest {
    style: String,
}

async fn control_trading_style(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradingStyleRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let style = match req.style.to_lowercase().as_str() {
        "conservative" => crate::signal::TradingStyle::Conservative,
        "moderate" => crate::signal::TradingStyle::Moderate,
        "aggressive" => crate::signal::TradingStyle::Aggressive,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("unknown trading style '{other}'"),
                })),
            ));
        }
    };

    state.analyzer.set_trading_style(style);
    state.increment_version();
    info!(style = ?style, "trading style changed via API");
    state.push_event(format!("Trading style set to {}", req.style.to_lowercase()), "info");

    Ok(Json(serde_json::json!({
        "strictness_percent": state.analyzer.strictness(),
    })))
}

#[derive(Deserialize)]
struct AveragingDistanceRequest {
    distance_pct: f64,
}

async fn control_averaging_distance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AveragingDistanceRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !req.distance_pct.is_finite() || req.distance_pct < 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "distance_pct must be a non-negative number" })),
        ));
    }

    info!(distance_pct = req.distance_pct, "averaging distance updated via API");
    state.set_averaging_distance_pct(req.distance_pct);
    Ok(Json(
        serde_json::json!({ "distance_pct": state.config.read().risk.averaging_distance_from_liq_pct }),
    ))
}
