// ===============================
// src/store.rs
// ===============================
//
// Tick persistence:
// - TickStore       : seam used by bindings (one insert per tick, no update/delete)
// - PgTickStore     : Postgres via sqlx PgPool (pool shared by all workers)
// - InMemoryTickStore: dev mode (STORE_MODE=memory) and tests
//
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::Tick;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(&'static str),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Row-insert seam. `Ok(None)` means the insert affected zero rows.
#[async_trait]
pub trait TickStore: Send + Sync {
    async fn insert(&self, tick: &Tick) -> Result<Option<i64>, StoreError>;
}

impl Tick {
    /// Persist this tick once.
    ///
    /// Returns `Ok(false)` without touching the store when an id is already
    /// assigned, and `Ok(false)` when the store reports zero rows affected.
    /// No retries here; the binding's delivery policy decides what happens next.
    pub async fn create(&mut self, store: &dyn TickStore) -> Result<bool, StoreError> {
        if self.id.is_some() {
            return Ok(false);
        }
        if self.symbol.is_empty() {
            return Err(StoreError::Constraint("symbol must not be empty"));
        }
        if self.timestamp.is_none() {
            return Err(StoreError::Constraint("timestamp must not be null"));
        }
        match store.insert(self).await? {
            Some(id) => {
                self.id = Some(id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// -------- Postgres --------

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS ticks (
        id          BIGSERIAL PRIMARY KEY,
        symbol      TEXT NOT NULL,
        timestamp   TIMESTAMPTZ NOT NULL,
        type        TEXT,
        order_type  TEXT,
        side        TEXT,
        bid         DOUBLE PRECISION NOT NULL DEFAULT 0,
        ask         DOUBLE PRECISION NOT NULL DEFAULT 0,
        price       DOUBLE PRECISION NOT NULL DEFAULT 0,
        size        DOUBLE PRECISION NOT NULL DEFAULT 0,
        volume      DOUBLE PRECISION NOT NULL DEFAULT 0,
        liquidity   DOUBLE PRECISION NOT NULL DEFAULT 0
    )";

const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_tick_symbol ON ticks (symbol)",
    "CREATE INDEX IF NOT EXISTS idx_tick_timestamp ON ticks (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_tick_type ON ticks (type)",
    "CREATE INDEX IF NOT EXISTS idx_tick_order_type ON ticks (order_type)",
    "CREATE INDEX IF NOT EXISTS idx_tick_order_side ON ticks (side)",
];

// Append-only table: analyze/vacuum on a fixed row threshold, not a fraction
const AUTOVACUUM_TUNING: [&str; 4] = [
    "ALTER TABLE ticks SET (autovacuum_analyze_scale_factor = 0.0)",
    "ALTER TABLE ticks SET (autovacuum_analyze_threshold = 100000)",
    "ALTER TABLE ticks SET (autovacuum_vacuum_scale_factor = 0.0)",
    "ALTER TABLE ticks SET (autovacuum_vacuum_threshold = 100000)",
];

const INSERT_TICK: &str = r"
    INSERT INTO ticks (
        symbol, timestamp, type, order_type, side,
        bid, ask, price, size, volume, liquidity
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    RETURNING id";

pub struct PgTickStore {
    pool: PgPool,
}

impl PgTickStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(max_connections, "postgres pool initialized");
        Ok(Self { pool })
    }

    /// Schema bootstrap, run once at startup before any worker starts.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        for stmt in CREATE_INDEXES {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        for stmt in AUTOVACUUM_TUNING {
            // storage tuning only; a refusal (e.g. managed PG) must not block ingestion
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                warn!(?e, %stmt, "autovacuum tuning skipped");
            }
        }
        info!("ticks schema migrated");
        Ok(())
    }
}

#[async_trait]
impl TickStore for PgTickStore {
    async fn insert(&self, tick: &Tick) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(INSERT_TICK)
            .bind(&tick.symbol)
            .bind(tick.timestamp)
            .bind(&tick.kind)
            .bind(&tick.order_type)
            .bind(&tick.side)
            .bind(tick.bid)
            .bind(tick.ask)
            .bind(tick.price)
            .bind(tick.size)
            .bind(tick.volume)
            .bind(tick.liquidity)
            .fetch_optional(&self.pool)
            .await?;

        debug!(symbol = %tick.symbol, ?id, "tick inserted");
        Ok(id)
    }
}

// -------- In-memory --------

/// How an [`InMemoryTickStore`] answers inserts.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Every insert succeeds.
    Never,
    /// Every insert returns a query error.
    Always,
    /// Every insert reports zero rows affected.
    ZeroRows,
    /// The first `n` inserts succeed, the rest return a query error.
    AfterN(usize),
}

/// Vec-backed store. Not for production use.
pub struct InMemoryTickStore {
    ticks: Mutex<Vec<Tick>>,
    attempts: AtomicI64,
    next_id: AtomicI64,
    fail_mode: Mutex<FailMode>,
    closed: AtomicBool,
}

impl Default for InMemoryTickStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTickStore {
    pub fn new() -> Self {
        Self::with_fail_mode(FailMode::Never)
    }

    pub fn with_fail_mode(mode: FailMode) -> Self {
        Self {
            ticks: Mutex::new(Vec::new()),
            attempts: AtomicI64::new(0),
            next_id: AtomicI64::new(1),
            fail_mode: Mutex::new(mode),
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn set_fail_mode(&self, mode: FailMode) {
        if let Ok(mut m) = self.fail_mode.lock() {
            *m = mode;
        }
    }

    /// Simulates a lost connection: every later insert fails.
    #[cfg(test)]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn ticks(&self) -> Vec<Tick> {
        self.ticks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ticks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Insert calls seen, successful or not.
    #[cfg(test)]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst) as usize
    }
}

#[async_trait]
impl TickStore for InMemoryTickStore {
    async fn insert(&self, tick: &Tick) -> Result<Option<i64>, StoreError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as usize;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store closed".into()));
        }
        let mode = self
            .fail_mode
            .lock()
            .map(|m| *m)
            .map_err(|_| StoreError::Connection("store lock poisoned".into()))?;
        match mode {
            FailMode::Always => return Err(StoreError::Query("insert rejected".into())),
            FailMode::ZeroRows => return Ok(None),
            FailMode::AfterN(n) if attempt >= n => {
                return Err(StoreError::Query("insert rejected".into()))
            }
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = tick.clone();
        row.id = Some(id);
        self.ticks
            .lock()
            .map_err(|_| StoreError::Connection("store lock poisoned".into()))?
            .push(row);
        Ok(Some(id))
    }
}
