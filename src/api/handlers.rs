use std::sync::Arc;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use log::{debug, error};

use crate::data::{BroadcastDispatcher, SubscriptionRegistry};
use crate::market::SYMBOLS;
use crate::storage::{DurableStore, DEFAULT_SIGNAL_LIMIT};

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<BroadcastDispatcher>,
    pub store: Arc<dyn DurableStore>,
}

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    // Comma separated, e.g. "BTC/USD,ETH/USD"
    pub symbols: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub symbol: Option<String>,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn parse_symbols(raw: Option<&str>) -> Vec<String> {
    let requested: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    if requested.is_empty() {
        SYMBOLS.iter().map(|(symbol, _)| symbol.to_string()).collect()
    } else {
        requested
    }
}

// GET /api/signals - Latest persisted signals
pub async fn get_signals(
    State(state): State<ApiState>,
    Query(query): Query<SignalQuery>,
) -> Result<Json<Value>, ApiError> {
    let symbols = parse_symbols(query.symbols.as_deref());
    let limit = query.limit.unwrap_or(DEFAULT_SIGNAL_LIMIT);
    debug!("Fetching up to {} signals for {:?}", limit, symbols);

    match state.store.latest_signals(&symbols, limit).await {
        Ok(signals) => {
            let total = signals.len();
            Ok(Json(serde_json::json!({
                "signals": signals,
                "total": total,
            })))
        }
        Err(e) => {
            error!("Failed to load signals: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// GET /api/signals/stats - Per-action statistics for one symbol
pub async fn get_signal_stats(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let symbol = match query.symbol.map(|s| s.trim().to_uppercase()) {
        Some(symbol) if !symbol.is_empty() => symbol,
        _ => return Err(api_error(StatusCode::BAD_REQUEST, "symbol query parameter is required")),
    };

    match state.store.signal_stats(&symbol).await {
        Ok(stats) => Ok(Json(serde_json::json!({
            "symbol": symbol,
            "stats": stats,
        }))),
        Err(e) => {
            error!("Failed to load stats for {}: {}", symbol, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// GET /api/subscriptions - Live registry and dispatcher counts
pub async fn get_subscriptions(State(state): State<ApiState>) -> Json<Value> {
    let (symbols, clients) = state.registry.get_stats();
    Json(serde_json::json!({
        "symbols": symbols,
        "clients": clients,
        "activeSymbols": state.dispatcher.active_symbols(),
    }))
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "signal_socket",
        "timestamp": chrono::Utc::now()
    }))
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/signals", get(get_signals))
        .route("/signals/stats", get(get_signal_stats))
        .route("/subscriptions", get(get_subscriptions))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}
