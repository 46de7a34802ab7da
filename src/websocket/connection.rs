use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::DeliveryError;
use crate::websocket::message::OutboundEvent;

// Outbound half of a client connection. `send` must never block: the
// dispatcher calls it for every subscriber on every tick.
pub trait Connection: Send + Sync {
    fn send(&self, event: OutboundEvent) -> Result<(), DeliveryError>;
}

// Connection backed by the bounded queue drained by a socket's write task.
// A full queue drops the event instead of stalling the sender.
#[derive(Debug, Clone)]
pub struct WsConnection {
    tx: mpsc::Sender<OutboundEvent>,
}

impl WsConnection {
    pub fn new(tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl Connection for WsConnection {
    fn send(&self, event: OutboundEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backpressure,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ws_connection_forwards_events() {
        let (conn, mut rx) = WsConnection::channel(4);
        conn.send(OutboundEvent::Pong).unwrap();
        assert_eq!(rx.recv().await, Some(OutboundEvent::Pong));
    }

    #[tokio::test]
    async fn test_ws_connection_drops_on_backpressure() {
        let (conn, _rx) = WsConnection::channel(1);
        conn.send(OutboundEvent::Pong).unwrap();
        assert_eq!(conn.send(OutboundEvent::Pong), Err(DeliveryError::Backpressure));
    }

    #[tokio::test]
    async fn test_ws_connection_reports_closed() {
        let (conn, rx) = WsConnection::channel(1);
        drop(rx);
        assert_eq!(conn.send(OutboundEvent::Pong), Err(DeliveryError::Closed));
    }
}
