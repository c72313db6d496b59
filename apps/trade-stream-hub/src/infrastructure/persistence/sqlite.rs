//! SQLite trade store.
//!
//! One connection behind a mutex; every statement runs on the blocking pool.
//! Prices and volumes are stored as decimal text, times as epoch
//! milliseconds, and conditions as a JSON array.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};
use rust_decimal::Decimal;

use crate::application::ports::{StoreError, TradeStore};
use crate::domain::trade::{PersistedTrade, TimeRange, Trade};

const TRADES_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS trades (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    c           TEXT    NOT NULL DEFAULT '[]',
    p           TEXT    NOT NULL,
    s           TEXT    NOT NULL,
    t           INTEGER NOT NULL,
    v           TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_t ON trades (t);
";

const SELECT_COLUMNS: &str = "SELECT id, c, p, s, t, v, created_at, updated_at FROM trades";

/// [`TradeStore`] backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteTradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTradeStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the file or its parent directory
    /// cannot be created, or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;

        Self::init(&conn)?;
        tracing::info!(path = %path.display(), "Trade store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<(), StoreError> {
        // journal_mode reports the resulting mode as a row.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::Open(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        conn.execute_batch(TRADES_SCHEMA)
            .map_err(|e| StoreError::Open(e.to_string()))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn insert(&self, trade: &Trade) -> Result<PersistedTrade, StoreError> {
        let pending = PersistedTrade::from_trade(0, trade, Utc::now())
            .map_err(|e| StoreError::InvalidTrade(e.to_string()))?;
        let conditions = serde_json::to_string(&pending.conditions)
            .map_err(|e| StoreError::InvalidTrade(e.to_string()))?;

        self.with_conn(move |conn| {
            let recorded_at = pending.created_at.timestamp_millis();
            conn.execute(
                "INSERT INTO trades (c, p, s, t, v, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    conditions,
                    pending.price.to_string(),
                    pending.symbol,
                    pending.timestamp_millis(),
                    pending.volume.to_string(),
                    recorded_at,
                    recorded_at,
                ],
            )
            .map_err(query_error)?;

            Ok(PersistedTrade {
                id: conn.last_insert_rowid(),
                ..pending
            })
        })
        .await
    }

    async fn find_in_range(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<PersistedTrade>, StoreError> {
        let limit = sql_limit(limit);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{SELECT_COLUMNS} WHERE t >= ?1 AND t <= ?2 ORDER BY t DESC, id DESC LIMIT ?3"
                ))
                .map_err(query_error)?;
            let rows = stmt
                .query_map(params![range.from, range.to, limit], RawRow::read)
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;

            rows.into_iter().map(RawRow::decode).collect()
        })
        .await
    }

    async fn find_latest(&self, limit: usize) -> Result<Vec<PersistedTrade>, StoreError> {
        let limit = sql_limit(limit);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!("{SELECT_COLUMNS} ORDER BY t DESC, id DESC LIMIT ?1"))
                .map_err(query_error)?;
            let rows = stmt
                .query_map(params![limit], RawRow::read)
                .map_err(query_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_error)?;

            rows.into_iter().map(RawRow::decode).collect()
        })
        .await
    }
}

fn query_error(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Columns exactly as stored, before decoding.
struct RawRow {
    id: i64,
    conditions: String,
    price: String,
    symbol: String,
    timestamp: i64,
    volume: String,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conditions: row.get(1)?,
            price: row.get(2)?,
            symbol: row.get(3)?,
            timestamp: row.get(4)?,
            volume: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<PersistedTrade, StoreError> {
        let id = self.id;
        let corrupt = |what: &str, detail: String| {
            StoreError::CorruptRow(format!("row {id}: {what}: {detail}"))
        };

        Ok(PersistedTrade {
            id,
            conditions: serde_json::from_str(&self.conditions)
                .map_err(|e| corrupt("conditions", e.to_string()))?,
            price: Decimal::from_str(&self.price).map_err(|e| corrupt("price", e.to_string()))?,
            symbol: self.symbol,
            timestamp: millis_to_datetime(self.timestamp)
                .ok_or_else(|| corrupt("timestamp", self.timestamp.to_string()))?,
            volume: Decimal::from_str(&self.volume)
                .map_err(|e| corrupt("volume", e.to_string()))?,
            created_at: millis_to_datetime(self.created_at)
                .ok_or_else(|| corrupt("created_at", self.created_at.to_string()))?,
            updated_at: millis_to_datetime(self.updated_at)
                .ok_or_else(|| corrupt("updated_at", self.updated_at.to_string()))?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
