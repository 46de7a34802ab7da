use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::market::GeneratedSignal;
use crate::storage::store::{DurableStore, SignalRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Written,
    Failed,
}

#[derive(Default)]
struct Watermarks {
    last_write: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

// Rate-limits durable signal writes to one per symbol per window, independent
// of how often signals are generated or how many clients receive them.
pub struct PersistenceGate {
    store: Arc<dyn DurableStore>,
    window: Duration,
    watermarks: Mutex<Watermarks>,
}

impl PersistenceGate {
    pub fn new(store: Arc<dyn DurableStore>, window: Duration) -> Self {
        Self {
            store,
            window,
            watermarks: Mutex::new(Watermarks::default()),
        }
    }

    fn watermarks(&self) -> MutexGuard<'_, Watermarks> {
        self.watermarks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_write(&self, symbol: &str) -> Option<Instant> {
        self.watermarks().last_write.get(symbol).copied()
    }

    fn reserve(&self, symbol: &str, now: Instant) -> bool {
        let mut marks = self.watermarks();
        let due = match marks.last_write.get(symbol) {
            Some(last) => now.duration_since(*last) >= self.window,
            None => true,
        };
        due && marks.in_flight.insert(symbol.to_string())
    }

    // Returns None when the symbol's window is still closed or a write is
    // already pending. Otherwise the append runs on its own task, so the
    // caller never waits on storage and cancelling the caller never strands
    // the reservation.
    pub fn offer(self: &Arc<Self>, signal: &GeneratedSignal) -> Option<JoinHandle<GateDecision>> {
        let now = Instant::now();
        if !self.reserve(&signal.symbol, now) {
            return None;
        }

        let gate = self.clone();
        let record = SignalRecord::from(signal);
        Some(tokio::spawn(async move { gate.write(record, now).await }))
    }

    async fn write(&self, record: SignalRecord, reserved_at: Instant) -> GateDecision {
        let result = self.store.append_signal(&record).await;

        let mut marks = self.watermarks();
        marks.in_flight.remove(&record.symbol);
        match result {
            Ok(()) => {
                marks.last_write.insert(record.symbol.clone(), reserved_at);
                debug!("Persisted {} signal at {:.2}", record.symbol, record.price);
                GateDecision::Written
            }
            Err(e) => {
                // Watermark untouched so the next tick retries
                error!("Failed to persist signal for {}: {}", record.symbol, e);
                GateDecision::Failed
            }
        }
    }
}
