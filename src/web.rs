// =============================================================================
// Dashboard API — read-only axum endpoints over the store + engine snapshot
// =============================================================================
//
// Pure projections: nothing here mutates engine state, and nothing here gates
// engine correctness. The dashboard may render stale data during a stream
// outage; the engine does not care.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::BotConfig;
use crate::engine::EngineHandle;
use crate::indicator::{bollinger_latest, bollinger_series, BollPoint};
use crate::store::Store;

/// Shared state for the dashboard handlers.
pub struct AppState {
    pub config: BotConfig,
    pub store: Arc<Store>,
    pub engine: EngineHandle,
    /// Last streamed price, written by the feed on every kline message.
    pub last_price: Arc<RwLock<f64>>,
}

/// Build the dashboard router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/positions", get(positions))
        .route("/api/trades", get(trades))
        .route("/api/logs", get(logs))
        .route("/api/klines", get(klines))
        .route("/api/price_and_boll", get(price_and_boll))
        .route("/api/profits", get(profits))
        .route("/api/balance", get(balance))
        .layer(cors)
        .with_state(state)
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

// =============================================================================
// Health / status
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snapshot = state.engine.status();
    // The snapshot's running flag is written at bar time; reflect the live
    // control flag between bars.
    snapshot.running = state.engine.is_active();
    Json(snapshot)
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Serialize)]
struct PositionView {
    symbol: String,
    side: String,
    qty: f64,
    entry_price: f64,
    open_amount: f64,
    margin: f64,
    opened_at: i64,
    unrealized_pnl: f64,
}

async fn positions(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let pos = state
        .store
        .get_position(&state.config.symbol)
        .map_err(internal_error)?;

    let items: Vec<PositionView> = pos
        .map(|p| {
            let last = *state.last_price.read();
            let mark = if last > 0.0 { last } else { p.entry_price };
            PositionView {
                symbol: p.symbol.clone(),
                side: p.side.as_str().to_string(),
                qty: p.qty,
                entry_price: p.entry_price,
                open_amount: p.notional(),
                margin: p.notional() / state.config.leverage as f64,
                opened_at: p.opened_at,
                unrealized_pnl: p.unrealized_pnl(mark),
            }
        })
        .into_iter()
        .collect();

    Ok(Json(serde_json::json!({ "items": items })))
}

// =============================================================================
// Trades / logs
// =============================================================================

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn trades(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let limit = q.limit.unwrap_or(50).min(500);
    let rows = state
        .store
        .fetch_trades(&state.config.symbol, limit)
        .map_err(internal_error)?;
    Ok(Json(rows))
}

async fn logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let limit = q.limit.unwrap_or(200).min(1000);
    let rows = state.store.fetch_logs(limit).map_err(internal_error)?;
    Ok(Json(rows))
}

// =============================================================================
// Klines with per-bar bands (chart data)
// =============================================================================

async fn klines(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let cfg = &state.config;
    let limit = q.limit.unwrap_or(100).min(1000);
    let rows = state
        .store
        .fetch_klines(&cfg.symbol, cfg.interval.as_str(), limit)
        .map_err(internal_error)?;

    let closes: Vec<f64> = rows.iter().map(|k| k.close).collect();
    let bands = bollinger_series(&closes, cfg.boll_period, cfg.boll_std);

    let items: Vec<serde_json::Value> = rows
        .iter()
        .zip(bands.iter())
        .map(|(k, b)| {
            serde_json::json!({
                "open_time": k.open_time,
                "open": k.open,
                "high": k.high,
                "low": k.low,
                "close": k.close,
                "volume": k.volume,
                "boll_up": b.map(|p| p.upper),
                "boll_mid": b.map(|p| p.middle),
                "boll_dn": b.map(|p| p.lower),
            })
        })
        .collect();

    Ok(Json(items))
}

// =============================================================================
// Live price + band preview
// =============================================================================

/// Bands with the live price substituted into the last window slot, so the
/// dashboard tracks the forming bar between closes. Pure helper so the math
/// stays testable.
fn live_preview_bands(
    mut closes: Vec<f64>,
    last_price: f64,
    period: usize,
    num_std: f64,
) -> Option<BollPoint> {
    if closes.is_empty() {
        return None;
    }
    if last_price > 0.0 {
        *closes.last_mut().expect("non-empty") = last_price;
    }
    bollinger_latest(&closes, period, num_std)
}

async fn price_and_boll(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let cfg = &state.config;
    let klines = state
        .store
        .fetch_klines(&cfg.symbol, cfg.interval.as_str(), cfg.boll_period)
        .map_err(internal_error)?;

    let last_price = *state.last_price.read();
    let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
    let price = if last_price > 0.0 {
        last_price
    } else {
        closes.last().copied().unwrap_or(0.0)
    };

    let bands = live_preview_bands(closes, last_price, cfg.boll_period, cfg.boll_std);

    Ok(Json(serde_json::json!({
        "price": price,
        "boll_up": bands.map(|b| b.upper),
        "boll_mid": bands.map(|b| b.middle),
        "boll_dn": bands.map(|b| b.lower),
    })))
}

// =============================================================================
// Profits / balance
// =============================================================================

async fn profits(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let summary = state
        .store
        .daily_profit_summary(&state.config.symbol)
        .map_err(internal_error)?;
    Ok(Json(summary))
}

async fn balance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.status();
    Json(serde_json::json!({ "balance": snapshot.balance }))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_substitutes_live_price_into_last_slot() {
        let closes = vec![100.0; 20];
        let flat = live_preview_bands(closes.clone(), 0.0, 20, 2.0).unwrap();
        assert!((flat.upper - 100.0).abs() < 1e-12);

        // A live price away from the flat series widens the bands.
        let moved = live_preview_bands(closes, 105.0, 20, 2.0).unwrap();
        assert!(moved.upper > flat.upper);
        assert!((moved.middle - 100.25).abs() < 1e-12);
    }

    #[test]
    fn preview_requires_full_window() {
        assert!(live_preview_bands(vec![100.0; 5], 101.0, 20, 2.0).is_none());
        assert!(live_preview_bands(Vec::new(), 101.0, 20, 2.0).is_none());
    }

    #[test]
    fn preview_without_live_price_uses_stored_close() {
        let mut closes = vec![100.0; 20];
        closes[19] = 102.0;
        let bands = live_preview_bands(closes, 0.0, 20, 2.0).unwrap();
        // Untouched: middle reflects the stored tail close.
        assert!((bands.middle - 100.1).abs() < 1e-12);
    }
}
