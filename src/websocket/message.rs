use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::ClientId;
use crate::error::ProtocolError;
use crate::market::GeneratedSignal;

// Server -> client events, serialized as {"type": ..., "payload": ...}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum OutboundEvent {
    Welcome {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    Subscribed {
        symbols: Vec<String>,
        total: usize,
    },
    Unsubscribed {
        symbols: Vec<String>,
        remaining: usize,
    },
    SubscriptionStatus {
        symbols: Vec<String>,
        total: usize,
    },
    Signal(GeneratedSignal),
    Error {
        message: String,
    },
    Pong,
    Echo(Value),
}

impl OutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundEvent::Error { message: message.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Welcome { .. } => "welcome",
            OutboundEvent::Subscribed { .. } => "subscribed",
            OutboundEvent::Unsubscribed { .. } => "unsubscribed",
            OutboundEvent::SubscriptionStatus { .. } => "subscriptionStatus",
            OutboundEvent::Signal(_) => "signal",
            OutboundEvent::Error { .. } => "error",
            OutboundEvent::Pong => "pong",
            OutboundEvent::Echo(_) => "echo",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Client -> server commands, validated before they reach the registry
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe { symbols: Vec<String> },
    // None means every symbol the client currently holds
    Unsubscribe { symbols: Option<Vec<String>> },
    GetSubscriptions,
    Ping,
    Echo(Value),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct SymbolsPayload {
    symbols: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OptionalSymbolsPayload {
    #[serde(default)]
    symbols: Option<Vec<String>>,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match envelope.kind.as_str() {
            "subscribe" => {
                let payload: SymbolsPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| invalid("subscribe", e.to_string()))?;
                let symbols = normalize(payload.symbols);
                if symbols.is_empty() {
                    return Err(invalid("subscribe", "symbols cannot be empty"));
                }
                Ok(ClientMessage::Subscribe { symbols })
            }
            "unsubscribe" => {
                let payload = if envelope.payload.is_null() {
                    OptionalSymbolsPayload::default()
                } else {
                    serde_json::from_value::<OptionalSymbolsPayload>(envelope.payload)
                        .map_err(|e| invalid("unsubscribe", e.to_string()))?
                };
                Ok(ClientMessage::Unsubscribe {
                    symbols: payload.symbols.map(normalize),
                })
            }
            "getSubscriptions" => Ok(ClientMessage::GetSubscriptions),
            "ping" => Ok(ClientMessage::Ping),
            "echo" => Ok(ClientMessage::Echo(envelope.payload)),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn invalid(kind: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

// Trim, drop blanks and duplicates while keeping request order
fn normalize(symbols: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let symbol = symbol.trim().to_uppercase();
        if !symbol.is_empty() && !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let msg = ClientMessage::parse(
            r#"{"type":"subscribe","payload":{"symbols":["btc/usd"," ETH/USD","BTC/USD"]}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                symbols: vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_subscribe_requires_symbols() {
        let err = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

        let err = ClientMessage::parse(r#"{"type":"subscribe","payload":{"symbols":[]}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_parse_unsubscribe_variants() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"unsubscribe"}"#).unwrap(),
            ClientMessage::Unsubscribe { symbols: None }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"unsubscribe","payload":{}}"#).unwrap(),
            ClientMessage::Unsubscribe { symbols: None }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"unsubscribe","payload":{"symbols":["SOL/USD"]}}"#).unwrap(),
            ClientMessage::Unsubscribe {
                symbols: Some(vec!["SOL/USD".to_string()])
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage_and_unknown_types() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType("teleport".to_string()))
        );
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#), Ok(ClientMessage::Ping));
    }

    #[test]
    fn test_outbound_wire_format() {
        let pong = serde_json::to_value(OutboundEvent::Pong).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let status = serde_json::to_value(OutboundEvent::SubscriptionStatus {
            symbols: vec!["BTC/USD".to_string()],
            total: 1,
        })
        .unwrap();
        assert_eq!(
            status,
            json!({"type": "subscriptionStatus", "payload": {"symbols": ["BTC/USD"], "total": 1}})
        );

        let error = serde_json::to_value(OutboundEvent::error("boom")).unwrap();
        assert_eq!(error, json!({"type": "error", "payload": {"message": "boom"}}));
    }

    #[test]
    fn test_welcome_carries_client_id() {
        let id = ClientId::new();
        let value = serde_json::to_value(OutboundEvent::Welcome { client_id: id }).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["payload"]["clientId"], id.to_string());
    }
}
