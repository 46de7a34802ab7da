pub mod gate;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

use log::info;

use crate::config::MEMORY_STORE_URL;
use crate::error::PersistenceError;

pub use gate::{GateDecision, PersistenceGate};
pub use sqlite::SqliteStore;
pub use store::{ActionStats, DurableStore, MemoryStore, SignalRecord, DEFAULT_SIGNAL_LIMIT};

pub async fn open_store(url: &str) -> Result<Arc<dyn DurableStore>, PersistenceError> {
    if url == MEMORY_STORE_URL {
        info!("Using in-memory signal store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::connect(url).await?))
}
