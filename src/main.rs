mod api;
mod config;
mod data;
mod error;
mod market;
mod storage;
mod websocket;

use std::time::Duration;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::interval;
use log::{info, error};
use tower_http::cors::CorsLayer;

use crate::config::{Config, STATS_INTERVAL_SECS};
use crate::data::{BroadcastDispatcher, SubscriptionRegistry};
use crate::market::SignalSampler;
use crate::storage::{open_store, DurableStore, PersistenceGate};
use crate::websocket::ConnectionLifecycleHandler;
use crate::api::{ApiState, create_api_router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    // Log configuration
    config.log_config();

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Initialize storage and the generation pipeline
    let store = open_store(&config.store_url).await?;
    let gate = Arc::new(PersistenceGate::new(store.clone(), config.persist_window()));
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        Arc::new(SignalSampler::new()),
        gate,
        config.tick_range(),
    ));
    let registry = SubscriptionRegistry::new(dispatcher.clone());

    info!("📊 Signal generation starts on first subscription per symbol");

    start_background_tasks(registry.clone(), dispatcher.clone());

    // Start API server
    let api_state = ApiState {
        registry: registry.clone(),
        dispatcher: dispatcher.clone(),
        store: store.clone(),
    };

    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive()); // Enable CORS for web clients

    let api_bind_address = config.api_bind_address.clone();
    let api_listener = TcpListener::bind(&api_bind_address).await?;
    info!("🌐 HTTP API server running at http://{}", api_bind_address);

    let api_server = axum::serve(api_listener, api_router);

    // Start WebSocket server
    let ws_bind_address = config.bind_address.clone();
    let ws_listener = TcpListener::bind(&ws_bind_address).await?;
    info!("🚀 WebSocket server running at ws://{}/ws", ws_bind_address);

    let outbound_queue_size = config.outbound_queue_size;
    let websocket_server = accept_loop(ws_listener, registry.clone(), store, outbound_queue_size);

    // Run both servers until one stops or we are interrupted
    info!("🎯 Starting WebSocket and HTTP API servers...");
    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = websocket_server => {
            error!("WebSocket server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    dispatcher.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn accept_loop(
    ws_listener: TcpListener,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn DurableStore>,
    outbound_queue_size: usize,
) {
    info!("🔗 Ready to accept WebSocket connections");

    while let Ok((stream, addr)) = ws_listener.accept().await {
        let handler = ConnectionLifecycleHandler::new(
            registry.clone(),
            store.clone(),
            addr.to_string(),
            outbound_queue_size,
        );

        tokio::spawn(handler.handle_connection(stream));
    }
}

fn start_background_tasks(registry: Arc<SubscriptionRegistry>, dispatcher: Arc<BroadcastDispatcher>) {
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            interval_timer.tick().await;
            let (symbol_count, client_count) = registry.get_stats();

            if symbol_count > 0 || client_count > 0 {
                info!(
                    "Stats - Symbols: {}, Clients: {}, Active loops: {}, Activations: {}, Deactivations: {}",
                    symbol_count,
                    client_count,
                    dispatcher.active_symbols().len(),
                    dispatcher.activation_count(),
                    dispatcher.deactivation_count()
                );
            }
        }
    });

    info!("📈 Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);
}
