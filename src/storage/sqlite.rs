use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::data::ClientId;
use crate::error::PersistenceError;
use crate::market::Action;
use crate::storage::store::{ActionStats, DurableStore, SignalRecord, DEFAULT_TIER};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('BUY', 'SELL')),
        price REAL NOT NULL,
        confidence REAL NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_signals_symbol_time
        ON signals (symbol, timestamp DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        client_id TEXT PRIMARY KEY,
        symbols TEXT NOT NULL,
        tier TEXT NOT NULL DEFAULT 'free',
        created_at INTEGER NOT NULL,
        last_active INTEGER NOT NULL
    )
    "#,
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to :memory: opens its own database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("Connected to signal store at {}", url);
        Ok(Self { pool })
    }
}

fn row_to_record(row: &SqliteRow) -> Result<SignalRecord, PersistenceError> {
    let action: String = row.try_get("action")?;
    let millis: i64 = row.try_get("timestamp")?;

    Ok(SignalRecord {
        symbol: row.try_get("symbol")?,
        action: Action::parse(&action)
            .ok_or_else(|| PersistenceError::Corrupt(format!("unknown action {}", action)))?,
        price: row.try_get("price")?,
        confidence: row.try_get("confidence")?,
        timestamp: DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| PersistenceError::Corrupt(format!("bad timestamp {}", millis)))?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn append_signal(&self, record: &SignalRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
                INSERT INTO signals (symbol, action, price, confidence, timestamp)
                VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.symbol.as_str())
        .bind(record.action.as_str())
        .bind(record.price)
        .bind(record.confidence)
        .bind(record.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        client_id: &ClientId,
        symbols: &[String],
        last_active: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let symbols_json = serde_json::to_string(symbols)?;
        let millis = last_active.timestamp_millis();

        sqlx::query(
            r#"
                INSERT INTO subscriptions (client_id, symbols, tier, created_at, last_active)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (client_id) DO UPDATE SET
                    symbols = excluded.symbols,
                    last_active = excluded.last_active
            "#,
        )
        .bind(client_id.to_string())
        .bind(symbols_json)
        .bind(DEFAULT_TIER)
        .bind(millis)
        .bind(millis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_signals(
        &self,
        symbols: &[String],
        limit: usize,
    ) -> Result<Vec<SignalRecord>, PersistenceError> {
        if symbols.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT symbol, action, price, confidence, timestamp FROM signals WHERE symbol IN (",
        );
        {
            let mut separated = builder.separated(", ");
            for symbol in symbols {
                separated.push_bind(symbol.as_str());
            }
        }
        builder.push(") ORDER BY timestamp DESC, id DESC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn signal_stats(&self, symbol: &str) -> Result<Vec<ActionStats>, PersistenceError> {
        let rows: Vec<(String, i64, f64)> = sqlx::query_as(
            r#"
                SELECT action, COUNT(*), AVG(confidence)
                FROM signals
                WHERE symbol = ?
                GROUP BY action
                ORDER BY action
            "#,
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(action, count, avg_confidence)| {
                Ok(ActionStats {
                    action: Action::parse(&action)
                        .ok_or_else(|| PersistenceError::Corrupt(format!("unknown action {}", action)))?,
                    count: count as u64,
                    avg_confidence,
                })
            })
            .collect()
    }
}
