use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::data::{ClientId, SubscriptionRegistry};
use crate::error::{ProtocolError, RegistryError};
use crate::market::is_supported;
use crate::storage::DurableStore;
use crate::websocket::connection::{Connection, WsConnection};
use crate::websocket::message::{ClientMessage, OutboundEvent};

// Per-connection protocol state: turns inbound commands into registry calls
// and answers on the client's own connection.
pub struct ClientSession {
    client_id: ClientId,
    connection: Arc<dyn Connection>,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn DurableStore>,
}

impl ClientSession {
    pub fn new(
        client_id: ClientId,
        connection: Arc<dyn Connection>,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            client_id,
            connection,
            registry,
            store,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn reply(&self, event: OutboundEvent) {
        let kind = event.kind();
        if let Err(e) = self.connection.send(event) {
            warn!("Failed to send {} to client {}: {}", kind, self.client_id.short(), e);
        }
    }

    pub async fn handle_text(&self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(ProtocolError::Malformed(reason)) => {
                warn!("Dropping malformed message from client {}: {}", self.client_id.short(), reason);
                return;
            }
            Err(e) => {
                self.reply(OutboundEvent::error(e.to_string()));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { symbols } => self.subscribe(symbols),
            ClientMessage::Unsubscribe { symbols } => self.unsubscribe(symbols).await,
            ClientMessage::GetSubscriptions => self.send_status(),
            ClientMessage::Ping => self.reply(OutboundEvent::Pong),
            ClientMessage::Echo(payload) => self.reply(OutboundEvent::Echo(payload)),
        }
    }

    fn subscribe(&self, requested: Vec<String>) {
        let (supported, unsupported): (Vec<String>, Vec<String>) =
            requested.into_iter().partition(|symbol| is_supported(symbol));

        for symbol in unsupported {
            self.reply(OutboundEvent::error(ProtocolError::UnsupportedSymbol(symbol).to_string()));
        }
        if supported.is_empty() {
            return;
        }

        match self.registry.subscribe(&self.client_id, &supported) {
            Ok(total) => {
                info!("Client {} subscribed to {:?} ({} total)", self.client_id.short(), supported, total);
                self.reply(OutboundEvent::Subscribed {
                    symbols: supported,
                    total,
                });
                self.persist_subscription();
            }
            Err(e) => self.reply(OutboundEvent::error(e.to_string())),
        }
    }

    async fn unsubscribe(&self, symbols: Option<Vec<String>>) {
        let held = match self.registry.symbols_of(&self.client_id) {
            Some(held) => held,
            None => {
                self.reply(OutboundEvent::error(
                    RegistryError::UnknownClient(self.client_id).to_string(),
                ));
                return;
            }
        };

        // Protocol-level "unsubscribe all" keeps the connection registered
        let symbols = symbols.unwrap_or(held);

        let outcome = self
            .registry
            .unsubscribe(&self.client_id, Some(symbols.as_slice()))
            .await;
        info!(
            "Client {} unsubscribed from {:?} ({} remaining)",
            self.client_id.short(),
            outcome.removed,
            outcome.remaining
        );
        self.reply(OutboundEvent::Unsubscribed {
            symbols: outcome.removed,
            remaining: outcome.remaining,
        });
        self.persist_subscription();
    }

    fn send_status(&self) {
        match self.registry.symbols_of(&self.client_id) {
            Some(symbols) => {
                let total = symbols.len();
                self.reply(OutboundEvent::SubscriptionStatus { symbols, total });
            }
            None => self.reply(OutboundEvent::error(
                RegistryError::UnknownClient(self.client_id).to_string(),
            )),
        }
    }

    // Fire-and-forget; the protocol never waits on storage
    fn persist_subscription(&self) {
        let symbols = match self.registry.symbols_of(&self.client_id) {
            Some(symbols) => symbols,
            None => return,
        };
        let store = self.store.clone();
        let client_id = self.client_id;

        tokio::spawn(async move {
            if let Err(e) = store.upsert_subscription(&client_id, &symbols, Utc::now()).await {
                error!("Failed to persist subscriptions for client {}: {}", client_id.short(), e);
            }
        });
    }
}

pub struct ConnectionLifecycleHandler {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn DurableStore>,
    peer_addr: String,
    outbound_queue_size: usize,
}

impl ConnectionLifecycleHandler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<dyn DurableStore>,
        peer_addr: String,
        outbound_queue_size: usize,
    ) -> Self {
        Self {
            registry,
            store,
            peer_addr,
            outbound_queue_size,
        }
    }

    pub async fn handle_connection(self, stream: TcpStream) {
        let ws_stream = match accept_hdr_async(stream, |req: &Request, response: Response| {
            self.check_path(req, response)
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {:?}", self.peer_addr, e);
                return;
            }
        };

        self.handle_websocket_connection(ws_stream).await;
    }

    fn check_path(&self, req: &Request, response: Response) -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        match path {
            "/" | "/ws" => {
                debug!("WebSocket connection request for path: {} from {}", path, self.peer_addr);
                Ok(response)
            }
            _ => {
                warn!("Unknown WebSocket path '{}' from {}", path, self.peer_addr);
                Err(self.create_error_response(StatusCode::NOT_FOUND, "Invalid WebSocket path"))
            }
        }
    }

    fn create_error_response(&self, status: StatusCode, message: &str) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(message.to_string()));
        *response.status_mut() = status;
        response
    }

    async fn handle_websocket_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, read) = ws_stream.split();

        let client_id = ClientId::new();
        let (connection, outbound_rx) = WsConnection::channel(self.outbound_queue_size);
        let connection: Arc<dyn Connection> = Arc::new(connection);
        self.registry.register(client_id, connection.clone());

        info!("WebSocket connection established - Client: {} from {}", client_id.short(), self.peer_addr);

        let session = ClientSession::new(client_id, connection, self.registry.clone(), self.store.clone());
        session.reply(OutboundEvent::Welcome { client_id });

        // Create channels for coordination
        let (close_tx, close_rx) = mpsc::channel::<()>(1);

        let mut write_task = self.spawn_write_task(write, outbound_rx, close_rx);
        let mut read_task = self.spawn_read_task(read, close_tx, session);

        tokio::select! {
            _ = &mut write_task => {
                info!("Write task completed for client {}", client_id.short());
                read_task.abort();
            }
            _ = &mut read_task => {
                info!("Read task completed for client {}", client_id.short());
            }
        }

        // Cleanup
        let outcome = self.registry.deregister(&client_id).await;
        write_task.abort();

        info!(
            "WebSocket connection closed - Client: {} from {} (dropped {} subscriptions)",
            client_id.short(),
            self.peer_addr,
            outcome.removed.len()
        );
    }

    fn spawn_write_task(
        &self,
        mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbound_rx: mpsc::Receiver<OutboundEvent>,
        mut close_rx: mpsc::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = outbound_rx.recv() => {
                        let json = match event.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to serialize {} event: {}", event.kind(), e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            error!("Error sending message: {:?}", e);
                            break;
                        }
                    }
                    _ = close_rx.recv() => {
                        debug!("Received close signal from read task");
                        break;
                    }
                    else => break,
                }
            }
            let _ = write.close().await;
        })
    }

    fn spawn_read_task(
        &self,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        close_tx: mpsc::Sender<()>,
        session: ClientSession,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let client = session.client_id().short();

            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => session.handle_text(&text).await,
                    Ok(Message::Binary(data)) => {
                        warn!("Ignoring binary message from client {}: {} bytes", client, data.len());
                    }
                    Ok(Message::Close(close_frame)) => {
                        info!("Received close frame from client {}: {:?}", client, close_frame);
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        error!("Error reading message from client {}: {:?}", client, e);
                        break;
                    }
                }
            }

            if close_tx.send(()).await.is_err() {
                debug!("Write task already gone for client {}", client);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use crate::data::BroadcastDispatcher;
    use crate::market::SignalSampler;
    use crate::storage::store::testing::FlakyStore;
    use crate::storage::{MemoryStore, PersistenceGate};
    use crate::websocket::connection::testing::RecordingConnection;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<BroadcastDispatcher>,
        store: Arc<MemoryStore>,
    }

    fn fixture(period: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(PersistenceGate::new(store.clone(), Duration::from_secs(60)));
        let dispatcher = Arc::new(BroadcastDispatcher::new(
            Arc::new(SignalSampler::new()),
            gate,
            (period, period),
        ));
        Fixture {
            registry: SubscriptionRegistry::new(dispatcher.clone()),
            dispatcher,
            store,
        }
    }

    fn session(fx: &Fixture) -> (ClientSession, Arc<RecordingConnection>) {
        let id = ClientId::new();
        let conn = Arc::new(RecordingConnection::new());
        fx.registry.register(id, conn.clone());
        (
            ClientSession::new(id, conn.clone(), fx.registry.clone(), fx.store.clone()),
            conn,
        )
    }

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_subscribe_flow() {
        let fx = fixture(Duration::from_secs(5));
        let (session, conn) = session(&fx);

        session
            .handle_text(r#"{"type":"subscribe","payload":{"symbols":["BTC/USD","DOGE/USD"]}}"#)
            .await;

        assert_eq!(
            conn.events(),
            vec![
                OutboundEvent::error("Unsupported symbol: DOGE/USD"),
                OutboundEvent::Subscribed {
                    symbols: strings(&["BTC/USD"]),
                    total: 1
                },
            ]
        );
        assert!(fx.dispatcher.is_active("BTC/USD"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = fx.store.subscription(&session.client_id()).unwrap();
        assert_eq!(record.symbols, strings(&["BTC/USD"]));

        fx.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_all_keeps_client_registered() {
        let fx = fixture(Duration::from_secs(5));
        let (session, conn) = session(&fx);

        session
            .handle_text(r#"{"type":"subscribe","payload":{"symbols":["ETH/USD","SOL/USD"]}}"#)
            .await;
        session.handle_text(r#"{"type":"unsubscribe"}"#).await;

        assert_eq!(
            conn.events().last(),
            Some(&OutboundEvent::Unsubscribed {
                symbols: strings(&["ETH/USD", "SOL/USD"]),
                remaining: 0
            })
        );
        assert!(fx.registry.is_registered(&session.client_id()));
        assert!(fx.dispatcher.active_symbols().is_empty());

        session.handle_text(r#"{"type":"getSubscriptions"}"#).await;
        assert_eq!(
            conn.events().last(),
            Some(&OutboundEvent::SubscriptionStatus {
                symbols: vec![],
                total: 0
            })
        );
    }

    #[tokio::test]
    async fn test_ping_echo_and_errors() {
        let fx = fixture(Duration::from_secs(5));
        let (session, conn) = session(&fx);

        session.handle_text(r#"{"type":"ping"}"#).await;
        session.handle_text(r#"{"type":"echo","payload":{"hello":"world"}}"#).await;
        session.handle_text(r#"{"type":"teleport"}"#).await;
        session.handle_text("{{{ not json").await;
        session.handle_text(r#"{"type":"subscribe","payload":{"symbols":"BTC/USD"}}"#).await;

        let events = conn.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], OutboundEvent::Pong);
        assert_eq!(events[1], OutboundEvent::Echo(json!({"hello": "world"})));
        assert_eq!(events[2], OutboundEvent::error("Unknown message type: teleport"));
        assert!(matches!(&events[3], OutboundEvent::Error { message } if message.starts_with("Invalid subscribe payload")));
    }

    #[tokio::test]
    async fn test_unknown_client_gets_error_event() {
        let fx = fixture(Duration::from_secs(5));
        let id = ClientId::new();
        let conn = Arc::new(RecordingConnection::new());
        let session = ClientSession::new(id, conn.clone(), fx.registry.clone(), fx.store.clone());

        session
            .handle_text(r#"{"type":"subscribe","payload":{"symbols":["BTC/USD"]}}"#)
            .await;
        session.handle_text(r#"{"type":"getSubscriptions"}"#).await;
        session
            .handle_text(r#"{"type":"unsubscribe","payload":{"symbols":["BTC/USD"]}}"#)
            .await;
        session.handle_text(r#"{"type":"unsubscribe"}"#).await;

        let expected = OutboundEvent::error(format!("unknown client {}", id));
        assert_eq!(conn.events(), vec![expected; 4]);
        assert!(!fx.dispatcher.is_active("BTC/USD"));
        assert!(fx.store.subscription(&id).is_none());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_affect_protocol() {
        let fx = fixture(Duration::from_secs(5));
        let store = Arc::new(FlakyStore::failing());
        let id = ClientId::new();
        let conn = Arc::new(RecordingConnection::new());
        fx.registry.register(id, conn.clone());
        let session = ClientSession::new(id, conn.clone(), fx.registry.clone(), store.clone());

        session
            .handle_text(r#"{"type":"subscribe","payload":{"symbols":["SOL/USD"]}}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.attempts(), 1);
        assert_eq!(
            conn.events(),
            vec![OutboundEvent::Subscribed {
                symbols: strings(&["SOL/USD"]),
                total: 1
            }]
        );

        fx.dispatcher.shutdown().await;
    }

    async fn next_json(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_over_websocket() {
        let fx = fixture(Duration::from_millis(50));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = fx.registry.clone();
        let store: Arc<dyn DurableStore> = fx.store.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let handler = ConnectionLifecycleHandler::new(registry.clone(), store.clone(), peer.to_string(), 16);
                tokio::spawn(handler.handle_connection(stream));
            }
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let welcome = next_json(&mut ws).await;
        assert_eq!(welcome["type"], "welcome");

        ws.send(Message::Text(
            r#"{"type":"subscribe","payload":{"symbols":["BTC/USD"]}}"#.to_string(),
        ))
        .await
        .unwrap();
        let subscribed = next_json(&mut ws).await;
        assert_eq!(subscribed["type"], "subscribed");
        assert_eq!(subscribed["payload"]["total"], 1);

        let signal = next_json(&mut ws).await;
        assert_eq!(signal["type"], "signal");
        assert_eq!(signal["payload"]["symbol"], "BTC/USD");

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if fx.registry.get_stats() == (0, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.registry.get_stats(), (0, 0));
        assert!(fx.dispatcher.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_path() {
        let fx = fixture(Duration::from_secs(5));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = fx.registry.clone();
        let store: Arc<dyn DurableStore> = fx.store.clone();
        tokio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                ConnectionLifecycleHandler::new(registry, store, peer.to_string(), 16)
                    .handle_connection(stream)
                    .await;
            }
        });

        let result = tokio_tungstenite::connect_async(format!("ws://{}/admin", addr)).await;
        assert!(result.is_err());
        assert_eq!(fx.registry.get_stats(), (0, 0));
    }
}
