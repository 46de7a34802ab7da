use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::data::registry::{ClientId, SubscriptionRegistry};
use crate::market::{GeneratedSignal, SignalSource};
use crate::storage::PersistenceGate;
use crate::websocket::{Connection, OutboundEvent};

struct GenerationLoop {
    period: Duration,
    handle: JoinHandle<()>,
}

// Owns one generation task per symbol that currently has subscribers.
pub struct BroadcastDispatcher {
    source: Arc<dyn SignalSource>,
    gate: Arc<PersistenceGate>,
    period_range: (Duration, Duration),
    loops: Mutex<HashMap<String, GenerationLoop>>,
    closed: AtomicBool,
    activations: AtomicU64,
    deactivations: AtomicU64,
}

impl BroadcastDispatcher {
    pub fn new(
        source: Arc<dyn SignalSource>,
        gate: Arc<PersistenceGate>,
        period_range: (Duration, Duration),
    ) -> Self {
        Self {
            source,
            gate,
            period_range,
            loops: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            activations: AtomicU64::new(0),
            deactivations: AtomicU64::new(0),
        }
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<String, GenerationLoop>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pick_period(&self) -> Duration {
        let (min, max) = self.period_range;
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    // Starts the symbol's generation loop unless one is already running.
    // Must be called from within the tokio runtime.
    pub fn activate(&self, symbol: &str, registry: Weak<SubscriptionRegistry>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Dispatcher shut down, not activating {}", symbol);
            return false;
        }

        let mut loops = self.loops();
        if loops.contains_key(symbol) {
            return false;
        }

        // Fixed for the lifetime of this activation
        let period = self.pick_period();
        let handle = tokio::spawn(run_generation(
            symbol.to_string(),
            period,
            self.source.clone(),
            self.gate.clone(),
            registry,
        ));

        loops.insert(symbol.to_string(), GenerationLoop { period, handle });
        self.activations.fetch_add(1, Ordering::Relaxed);
        info!("Activated signal generation for {} every {}ms", symbol, period.as_millis());
        true
    }

    // Cancels the loop and hands back its handle so the caller can wait for
    // termination without holding any lock.
    pub fn halt(&self, symbol: &str) -> Option<JoinHandle<()>> {
        let generation = self.loops().remove(symbol)?;
        generation.handle.abort();
        self.deactivations.fetch_add(1, Ordering::Relaxed);
        info!("Deactivated signal generation for {}", symbol);
        Some(generation.handle)
    }

    // No tick for the symbol fires after this returns
    pub async fn deactivate(&self, symbol: &str) -> bool {
        match self.halt(symbol) {
            Some(handle) => {
                Self::join(vec![handle]).await;
                true
            }
            None => false,
        }
    }

    pub async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Generation loop ended abnormally: {}", e);
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let symbols: Vec<String> = self.loops().keys().cloned().collect();
        let handles: Vec<JoinHandle<()>> = symbols
            .iter()
            .filter_map(|symbol| self.halt(symbol))
            .collect();

        let count = handles.len();
        Self::join(handles).await;
        info!("Broadcast dispatcher stopped {} generation loops", count);
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.loops().contains_key(symbol)
    }

    pub fn period_of(&self, symbol: &str) -> Option<Duration> {
        self.loops().get(symbol).map(|generation| generation.period)
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.loops().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn activation_count(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    pub fn deactivation_count(&self) -> u64 {
        self.deactivations.load(Ordering::Relaxed)
    }
}

async fn run_generation(
    symbol: String,
    period: Duration,
    source: Arc<dyn SignalSource>,
    gate: Arc<PersistenceGate>,
    registry: Weak<SubscriptionRegistry>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let signal = match source.sample(&symbol) {
            Some(signal) => signal,
            None => {
                warn!("No signal source for {}, skipping tick", symbol);
                continue;
            }
        };

        // Detached; a slow store never delays the broadcast
        gate.offer(&signal);

        let recipients = match registry.upgrade() {
            Some(registry) => registry.recipients(&symbol),
            None => {
                info!("Registry dropped, stopping generation for {}", symbol);
                break;
            }
        };

        fan_out(&signal, &recipients);
    }
}

// Delivers to every recipient; one failed send never stops the rest.
pub fn fan_out(signal: &GeneratedSignal, recipients: &[(ClientId, Arc<dyn Connection>)]) -> usize {
    let mut delivered = 0;

    for (client_id, connection) in recipients {
        match connection.send(OutboundEvent::Signal(signal.clone())) {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!(
                    "Failed to deliver {} signal to client {}: {}",
                    signal.symbol,
                    client_id.short(),
                    e
                );
            }
        }
    }

    if delivered > 0 {
        debug!(
            "Broadcasted {} {} @ {:.2} to {}/{} subscribers",
            signal.symbol,
            signal.action.as_str(),
            signal.price,
            delivered,
            recipients.len()
        );
    }
    delivered
}
