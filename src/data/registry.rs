use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::data::dispatcher::BroadcastDispatcher;
use crate::error::RegistryError;
use crate::websocket::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    // First block of the uuid, enough to tell clients apart in logs
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ClientSubscription {
    pub symbols: HashSet<String>,
    pub connection: Arc<dyn Connection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unsubscription {
    pub removed: Vec<String>,
    pub remaining: usize,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientId, ClientSubscription>,
    // Inverse of every client's symbol set; entries are never empty
    index: HashMap<String, HashSet<ClientId>>,
}

impl RegistryState {
    fn detach(
        &mut self,
        client_id: &ClientId,
        symbol: &str,
        dispatcher: &BroadcastDispatcher,
        halted: &mut Vec<JoinHandle<()>>,
    ) {
        let now_empty = match self.index.get_mut(symbol) {
            Some(subscribers) => {
                subscribers.remove(client_id);
                subscribers.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.index.remove(symbol);
            if let Some(handle) = dispatcher.halt(symbol) {
                halted.push(handle);
            }
        }
    }
}

// Tracks which client wants which symbol. Mapping mutations and the
// activation/deactivation edges they cause happen under one lock, so the
// dispatcher sees exactly one activate per first subscriber and one halt per
// last unsubscriber.
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    dispatcher: Arc<BroadcastDispatcher>,
    this: Weak<SubscriptionRegistry>,
}

impl SubscriptionRegistry {
    pub fn new(dispatcher: Arc<BroadcastDispatcher>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(RegistryState::default()),
            dispatcher,
            this: this.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, client_id: ClientId, connection: Arc<dyn Connection>) {
        let mut state = self.state();
        match state.clients.get_mut(&client_id) {
            Some(existing) => {
                existing.connection = connection;
                info!(
                    "Client {} re-registered, keeping {} subscriptions",
                    client_id.short(),
                    existing.symbols.len()
                );
            }
            None => {
                state.clients.insert(
                    client_id,
                    ClientSubscription {
                        symbols: HashSet::new(),
                        connection,
                    },
                );
                info!("Client {} registered", client_id.short());
            }
        }
    }

    // Returns the client's total symbol count after the call
    pub fn subscribe(&self, client_id: &ClientId, symbols: &[String]) -> Result<usize, RegistryError> {
        let mut state = self.state();
        let RegistryState { clients, index } = &mut *state;

        let client = clients
            .get_mut(client_id)
            .ok_or(RegistryError::UnknownClient(*client_id))?;

        for symbol in symbols {
            if !client.symbols.insert(symbol.clone()) {
                continue;
            }

            let subscribers = index.entry(symbol.clone()).or_default();
            let first = subscribers.is_empty();
            subscribers.insert(*client_id);

            if first {
                self.dispatcher.activate(symbol, self.this.clone());
            }
            debug!("Client {} subscribed to {}", client_id.short(), symbol);
        }

        Ok(client.symbols.len())
    }

    // `None` removes the client entirely. Unknown clients are a no-op.
    pub async fn unsubscribe(&self, client_id: &ClientId, symbols: Option<&[String]>) -> Unsubscription {
        let mut halted = Vec::new();

        let outcome = {
            let mut state = self.state();
            match symbols {
                Some(symbols) => {
                    let removed: Vec<String> = match state.clients.get_mut(client_id) {
                        Some(client) => symbols
                            .iter()
                            .filter(|symbol| client.symbols.remove(symbol.as_str()))
                            .cloned()
                            .collect(),
                        None => return Unsubscription::default(),
                    };

                    for symbol in &removed {
                        state.detach(client_id, symbol, &self.dispatcher, &mut halted);
                    }

                    let remaining = state
                        .clients
                        .get(client_id)
                        .map(|client| client.symbols.len())
                        .unwrap_or(0);
                    Unsubscription { removed, remaining }
                }
                None => {
                    let client = match state.clients.remove(client_id) {
                        Some(client) => client,
                        None => return Unsubscription::default(),
                    };

                    let mut removed: Vec<String> = client.symbols.into_iter().collect();
                    removed.sort();
                    for symbol in &removed {
                        state.detach(client_id, symbol, &self.dispatcher, &mut halted);
                    }

                    info!("Client {} removed from registry", client_id.short());
                    Unsubscription { removed, remaining: 0 }
                }
            }
        };

        // Join outside the lock; generation loops take it for their snapshots
        BroadcastDispatcher::join(halted).await;
        outcome
    }

    pub async fn deregister(&self, client_id: &ClientId) -> Unsubscription {
        self.unsubscribe(client_id, None).await
    }

    pub fn subscribers_of(&self, symbol: &str) -> HashSet<ClientId> {
        self.state().index.get(symbol).cloned().unwrap_or_default()
    }

    // Point-in-time copy of the delivery targets for a symbol
    pub fn recipients(&self, symbol: &str) -> Vec<(ClientId, Arc<dyn Connection>)> {
        let state = self.state();
        state
            .index
            .get(symbol)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter_map(|id| {
                        state
                            .clients
                            .get(id)
                            .map(|client| (*id, client.connection.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn symbols_of(&self, client_id: &ClientId) -> Option<Vec<String>> {
        self.state().clients.get(client_id).map(|client| {
            let mut symbols: Vec<String> = client.symbols.iter().cloned().collect();
            symbols.sort();
            symbols
        })
    }

    pub fn is_registered(&self, client_id: &ClientId) -> bool {
        self.state().clients.contains_key(client_id)
    }

    // (symbols with subscribers, registered clients)
    pub fn get_stats(&self) -> (usize, usize) {
        let state = self.state();
        (state.index.len(), state.clients.len())
    }
}
