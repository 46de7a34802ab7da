use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::ClientId;
use crate::error::PersistenceError;
use crate::market::{Action, GeneratedSignal};

pub const DEFAULT_TIER: &str = "free";
pub const DEFAULT_SIGNAL_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub action: Action,
    pub price: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&GeneratedSignal> for SignalRecord {
    fn from(signal: &GeneratedSignal) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            action: signal.action,
            price: signal.price,
            confidence: signal.confidence,
            timestamp: DateTime::from_timestamp_millis(signal.timestamp).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub client_id: ClientId,
    pub symbols: Vec<String>,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStats {
    pub action: Action,
    pub count: u64,
    pub avg_confidence: f64,
}

// Durable storage for sampled signals and client subscriptions. Callers treat
// writes as fire-and-forget; errors are logged, never escalated.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn append_signal(&self, record: &SignalRecord) -> Result<(), PersistenceError>;

    async fn upsert_subscription(
        &self,
        client_id: &ClientId,
        symbols: &[String],
        last_active: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    // Newest first across the given symbols
    async fn latest_signals(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> Result<Vec<SignalRecord>, PersistenceError>;

    async fn signal_stats(&self, symbol: &str) -> Result<Vec<ActionStats>, PersistenceError>;
}

#[derive(Default)]
pub struct MemoryStore {
    signals: Mutex<Vec<SignalRecord>>,
    subscriptions: Mutex<HashMap<ClientId, SubscriptionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn subscription(&self, client_id: &ClientId) -> Option<SubscriptionRecord> {
        self.subscriptions.lock().ok()?.get(client_id).cloned()
    }
}

fn poisoned<T>(_: T) -> PersistenceError {
    PersistenceError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn append_signal(&self, record: &SignalRecord) -> Result<(), PersistenceError> {
        self.signals.lock().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        client_id: &ClientId,
        symbols: &[String],
        last_active: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut subscriptions = self.subscriptions.lock().map_err(poisoned)?;
        subscriptions
            .entry(*client_id)
            .and_modify(|record| {
                record.symbols = symbols.to_vec();
                record.last_active = last_active;
            })
            .or_insert_with(|| SubscriptionRecord {
                client_id: *client_id,
                symbols: symbols.to_vec(),
                tier: DEFAULT_TIER.to_string(),
                created_at: last_active,
                last_active,
            });
        Ok(())
    }

    async fn latest_signals(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> Result<Vec<SignalRecord>, PersistenceError> {
        let signals = self.signals.lock().map_err(poisoned)?;
        let mut matching: Vec<SignalRecord> = signals
            .iter()
            .filter(|record| symbols.contains(&record.symbol))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn signal_stats(&self, symbol: &str) -> Result<Vec<ActionStats>, PersistenceError> {
        let signals = self.signals.lock().map_err(poisoned)?;
        let mut totals: Vec<(Action, u64, f64)> = Vec::new();

        for record in signals.iter().filter(|r| r.symbol == symbol) {
            match totals.iter_mut().find(|(action, _, _)| *action == record.action) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 += record.confidence;
                }
                None => totals.push((record.action, 1, record.confidence)),
            }
        }

        Ok(totals
            .into_iter()
            .map(|(action, count, sum)| ActionStats {
                action,
                count,
                avg_confidence: sum / count as f64,
            })
            .collect())
    }
}
