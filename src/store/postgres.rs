// =============================================================================
// PgStore — sqlx/Postgres implementation of the store contracts
// =============================================================================
//
// Conventions:
//   - positional `$n` placeholders only; the non-macro sqlx query API,
//   - every conditional write is one statement; `rows_affected` tells the
//     caller whether it won,
//   - the only multi-statement transaction is fill application, which pairs
//     the fill insert with the order-aggregate update.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{
    FillApply, LockStore, OrderInsert, OrderStore, SummaryStore, WorkerStore,
};
use crate::types::{
    DailySummary, Fill, LockStatus, Order, OrderStatus, OrderType, Side, StockLock,
    WorkerProcess, WorkerStatus,
};

/// Idempotent schema, applied at startup. Five logical tables; the
/// `UNIQUE(symbol)` primary key on `stock_locks` is the correctness-critical
/// constraint for symbol ownership.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        order_id        UUID PRIMARY KEY,
        broker_order_id TEXT,
        idempotency_key VARCHAR(200) NOT NULL UNIQUE,
        worker_id       TEXT NOT NULL,
        symbol          TEXT NOT NULL,
        side            TEXT NOT NULL,
        order_type      TEXT NOT NULL,
        qty             BIGINT NOT NULL CHECK (qty > 0),
        price           NUMERIC(18,4),
        status          TEXT NOT NULL,
        filled_qty      BIGINT NOT NULL DEFAULT 0,
        avg_fill_price  NUMERIC(18,4) NOT NULL DEFAULT 0,
        reject_reason   TEXT,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        CHECK (filled_qty <= qty)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orders_worker_status ON orders (worker_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_orders_broker ON orders (broker_order_id)",
    r#"
    CREATE TABLE IF NOT EXISTS fills (
        fill_id        UUID PRIMARY KEY,
        broker_fill_id TEXT NOT NULL UNIQUE,
        order_id       UUID NOT NULL REFERENCES orders(order_id),
        symbol         TEXT NOT NULL,
        side           TEXT NOT NULL,
        qty            BIGINT NOT NULL CHECK (qty > 0),
        price          NUMERIC(18,4) NOT NULL,
        fill_time      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fills_order ON fills (order_id)",
    "CREATE INDEX IF NOT EXISTS idx_fills_symbol_time ON fills (symbol, fill_time)",
    r#"
    CREATE TABLE IF NOT EXISTS stock_locks (
        symbol       TEXT PRIMARY KEY,
        id           UUID NOT NULL,
        worker_id    TEXT NOT NULL,
        acquired_at  TIMESTAMPTZ NOT NULL,
        expires_at   TIMESTAMPTZ NOT NULL,
        heartbeat_at TIMESTAMPTZ NOT NULL,
        status       TEXT NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_processes (
        worker_id         TEXT PRIMARY KEY,
        status            TEXT NOT NULL,
        current_symbol    TEXT,
        started_at        TIMESTAMPTZ NOT NULL,
        last_heartbeat_at TIMESTAMPTZ NOT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_summaries (
        worker_id      TEXT NOT NULL,
        summary_date   DATE NOT NULL,
        total_trades   INTEGER NOT NULL,
        winning_trades INTEGER NOT NULL,
        losing_trades  INTEGER NOT NULL,
        gross_profit   NUMERIC(18,4) NOT NULL,
        gross_loss     NUMERIC(18,4) NOT NULL,
        net_pnl        NUMERIC(18,4) NOT NULL,
        unrealized_pnl NUMERIC(18,4) NOT NULL,
        max_drawdown   NUMERIC(18,4) NOT NULL,
        win_rate       DOUBLE PRECISION NOT NULL,
        profit_factor  DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (worker_id, summary_date)
    )
    "#,
];

const ORDER_COLS: &str = "order_id, broker_order_id, idempotency_key, worker_id, symbol, side, \
                          order_type, qty, price, status, filled_qty, avg_fill_price, \
                          created_at, updated_at";

const LOCK_COLS: &str =
    "symbol, id, worker_id, acquired_at, expires_at, heartbeat_at, status, created_at, updated_at";

const WORKER_COLS: &str =
    "worker_id, status, current_symbol, started_at, last_heartbeat_at, created_at, updated_at";

/// Production store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply the idempotent schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = SCHEMA.len(), "store schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").finish()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn decode<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> sqlx::Result<T> {
    parse(raw).ok_or_else(|| sqlx::Error::Decode(format!("bad {what} value '{raw}'").into()))
}

fn map_order(row: &PgRow) -> sqlx::Result<Order> {
    Ok(Order {
        order_id: row.try_get("order_id")?,
        broker_order_id: row.try_get("broker_order_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        worker_id: row.try_get("worker_id")?,
        symbol: row.try_get("symbol")?,
        side: decode(row.try_get::<String, _>("side")?.as_str(), Side::parse, "side")?,
        order_type: decode(
            row.try_get::<String, _>("order_type")?.as_str(),
            OrderType::parse,
            "order_type",
        )?,
        qty: row.try_get("qty")?,
        price: row.try_get("price")?,
        status: decode(
            row.try_get::<String, _>("status")?.as_str(),
            OrderStatus::parse,
            "status",
        )?,
        filled_qty: row.try_get("filled_qty")?,
        avg_fill_price: row.try_get("avg_fill_price")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_fill(row: &PgRow) -> sqlx::Result<Fill> {
    Ok(Fill {
        fill_id: row.try_get("fill_id")?,
        broker_fill_id: row.try_get("broker_fill_id")?,
        order_id: row.try_get("order_id")?,
        symbol: row.try_get("symbol")?,
        side: decode(row.try_get::<String, _>("side")?.as_str(), Side::parse, "side")?,
        qty: row.try_get("qty")?,
        price: row.try_get("price")?,
        fill_time: row.try_get("fill_time")?,
    })
}

fn map_lock(row: &PgRow) -> sqlx::Result<StockLock> {
    Ok(StockLock {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        worker_id: row.try_get("worker_id")?,
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        status: decode(
            row.try_get::<String, _>("status")?.as_str(),
            LockStatus::parse,
            "lock status",
        )?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_worker(row: &PgRow) -> sqlx::Result<WorkerProcess> {
    Ok(WorkerProcess {
        worker_id: row.try_get("worker_id")?,
        status: decode(
            row.try_get::<String, _>("status")?.as_str(),
            WorkerStatus::parse,
            "worker status",
        )?,
        current_symbol: row.try_get("current_symbol")?,
        started_at: row.try_get("started_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(&self, lock: &StockLock) -> Result<()> {
        // The takeover condition keeps the upsert correct even when the
        // best-effort cleanup pass failed: an overdue ACTIVE row is fair game.
        let sql = r#"
            INSERT INTO stock_locks
                (symbol, id, worker_id, acquired_at, expires_at, heartbeat_at,
                 status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'ACTIVE', $7, $8)
            ON CONFLICT (symbol) DO UPDATE SET
                id = EXCLUDED.id,
                worker_id = EXCLUDED.worker_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                heartbeat_at = EXCLUDED.heartbeat_at,
                status = 'ACTIVE',
                updated_at = EXCLUDED.updated_at
            WHERE stock_locks.status = 'EXPIRED'
               OR stock_locks.expires_at < EXCLUDED.acquired_at
               OR stock_locks.worker_id = EXCLUDED.worker_id
        "#;
        let outcome = sqlx::query(sql)
            .bind(&lock.symbol)
            .bind(lock.id)
            .bind(&lock.worker_id)
            .bind(lock.acquired_at)
            .bind(lock.expires_at)
            .bind(lock.heartbeat_at)
            .bind(lock.created_at)
            .bind(lock.updated_at)
            .execute(&self.pool)
            .await?;
        debug!(
            symbol = %lock.symbol,
            worker_id = %lock.worker_id,
            rows = outcome.rows_affected(),
            "lock acquire attempt"
        );
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<StockLock>> {
        let sql = format!("SELECT {LOCK_COLS} FROM stock_locks WHERE symbol = $1");
        let row = sqlx::query(&sql).bind(symbol).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(map_lock).transpose()?)
    }

    async fn release(&self, symbol: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = r#"
            UPDATE stock_locks
            SET status = 'EXPIRED', updated_at = $3
            WHERE symbol = $1 AND worker_id = $2 AND status = 'ACTIVE'
        "#;
        let outcome = sqlx::query(sql)
            .bind(symbol)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn renew(
        &self,
        symbol: &str,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<StockLock>> {
        let sql = format!(
            r#"
            UPDATE stock_locks
            SET expires_at = $3, heartbeat_at = $4, updated_at = $4
            WHERE symbol = $1 AND worker_id = $2 AND status = 'ACTIVE'
              AND expires_at >= $4
            RETURNING {LOCK_COLS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(symbol)
            .bind(worker_id)
            .bind(new_expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_lock).transpose()?)
    }

    async fn touch_heartbeat(
        &self,
        symbol: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = r#"
            UPDATE stock_locks
            SET heartbeat_at = $3, updated_at = $3
            WHERE symbol = $1 AND worker_id = $2 AND status = 'ACTIVE'
        "#;
        let outcome = sqlx::query(sql)
            .bind(symbol)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = r#"
            UPDATE stock_locks
            SET status = 'EXPIRED', updated_at = $1
            WHERE status = 'ACTIVE' AND expires_at < $1
        "#;
        let outcome = sqlx::query(sql).bind(now).execute(&self.pool).await?;
        Ok(outcome.rows_affected())
    }

    async fn expire_for_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let sql = r#"
            UPDATE stock_locks
            SET status = 'EXPIRED', updated_at = $2
            WHERE worker_id = $1 AND status = 'ACTIVE'
        "#;
        let outcome = sqlx::query(sql)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected())
    }

    async fn list_active(&self) -> Result<Vec<StockLock>> {
        let sql = format!("SELECT {LOCK_COLS} FROM stock_locks WHERE status = 'ACTIVE'");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_lock).collect::<sqlx::Result<_>>()?)
    }
}

// ---------------------------------------------------------------------------
// WorkerStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkerStore for PgStore {
    async fn register(&self, worker: &WorkerProcess) -> Result<bool> {
        let sql = r#"
            INSERT INTO worker_processes
                (worker_id, status, current_symbol, started_at, last_heartbeat_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (worker_id) DO UPDATE SET
                status = EXCLUDED.status,
                current_symbol = EXCLUDED.current_symbol,
                started_at = EXCLUDED.started_at,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                updated_at = EXCLUDED.updated_at
            WHERE worker_processes.status = 'TERMINATED'
        "#;
        let outcome = sqlx::query(sql)
            .bind(&worker.worker_id)
            .bind(worker.status.as_str())
            .bind(&worker.current_symbol)
            .bind(worker.started_at)
            .bind(worker.last_heartbeat_at)
            .bind(worker.created_at)
            .bind(worker.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerProcess>> {
        let sql = format!("SELECT {WORKER_COLS} FROM worker_processes WHERE worker_id = $1");
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_worker).transpose()?)
    }

    async fn set_status(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        current_symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = r#"
            UPDATE worker_processes
            SET status = $3, current_symbol = $4, updated_at = $5
            WHERE worker_id = $1 AND status = $2
        "#;
        let outcome = sqlx::query(sql)
            .bind(worker_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(current_symbol)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn touch_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let sql = r#"
            UPDATE worker_processes
            SET last_heartbeat_at = $2, updated_at = $2
            WHERE worker_id = $1 AND status <> 'TERMINATED'
        "#;
        let outcome = sqlx::query(sql)
            .bind(worker_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerProcess>> {
        let sql = format!(
            r#"
            SELECT {WORKER_COLS} FROM worker_processes
            WHERE status <> 'TERMINATED' AND last_heartbeat_at < $1
            "#
        );
        let rows = sqlx::query(&sql).bind(cutoff).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_worker).collect::<sqlx::Result<_>>()?)
    }
}

// ---------------------------------------------------------------------------
// OrderStore
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderStore for PgStore {
    async fn insert(&self, order: &Order) -> Result<OrderInsert> {
        let sql = format!(
            r#"
            INSERT INTO orders
                (order_id, broker_order_id, idempotency_key, worker_id, symbol, side,
                 order_type, qty, price, status, filled_qty, avg_fill_price,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {ORDER_COLS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(order.order_id)
            .bind(&order.broker_order_id)
            .bind(&order.idempotency_key)
            .bind(&order.worker_id)
            .bind(&order.symbol)
            .bind(order.side.as_str())
            .bind(order.order_type.as_str())
            .bind(order.qty)
            .bind(order.price)
            .bind(order.status.as_str())
            .bind(order.filled_qty)
            .bind(order.avg_fill_price)
            .bind(order.created_at)
            .bind(order.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(ref r) = row {
            return Ok(OrderInsert::Inserted(map_order(r)?));
        }

        // Lost the conflict: hand back the existing row.
        let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE idempotency_key = $1");
        let existing = sqlx::query(&sql)
            .bind(&order.idempotency_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(OrderInsert::Duplicate(map_order(&existing)?))
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE order_id = $1");
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_order).transpose()?)
    }

    async fn get_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE broker_order_id = $1");
        let row = sqlx::query(&sql)
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_order).transpose()?)
    }

    async fn mark_sent(
        &self,
        order_id: Uuid,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = r#"
            UPDATE orders
            SET broker_order_id = $2, status = 'SENT', updated_at = $3
            WHERE order_id = $1 AND status = 'PENDING'
        "#;
        let outcome = sqlx::query(sql)
            .bind(order_id)
            .bind(broker_order_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_rejected(
        &self,
        order_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = r#"
            UPDATE orders
            SET status = 'REJECTED', reject_reason = $2, updated_at = $3
            WHERE order_id = $1 AND status IN ('PENDING', 'SENT')
        "#;
        let outcome = sqlx::query(sql)
            .bind(order_id)
            .bind(reason)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_canceled(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let sql = r#"
            UPDATE orders
            SET status = 'CANCELED', updated_at = $2
            WHERE order_id = $1 AND status IN ('SENT', 'PARTIAL')
        "#;
        let outcome = sqlx::query(sql)
            .bind(order_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn apply_fill(&self, fill: &Fill) -> Result<FillApply> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO fills
                (fill_id, broker_fill_id, order_id, symbol, side, qty, price, fill_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (broker_fill_id) DO NOTHING
            "#,
        )
        .bind(fill.fill_id)
        .bind(&fill.broker_fill_id)
        .bind(fill.order_id)
        .bind(&fill.symbol)
        .bind(fill.side.as_str())
        .bind(fill.qty)
        .bind(fill.price)
        .bind(fill.fill_time)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(FillApply::DuplicateFill);
        }

        // Column references on the right-hand side read the pre-update row,
        // so the guard and the new aggregates are computed atomically.
        let sql = format!(
            r#"
            UPDATE orders
            SET filled_qty = filled_qty + $2,
                avg_fill_price = ((avg_fill_price * filled_qty) + ($3 * $2))
                                 / (filled_qty + $2),
                status = CASE WHEN filled_qty + $2 = qty THEN 'FILLED' ELSE 'PARTIAL' END,
                updated_at = $4
            WHERE order_id = $1
              AND status IN ('SENT', 'PARTIAL')
              AND filled_qty + $2 <= qty
            RETURNING {ORDER_COLS}
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(fill.order_id)
            .bind(fill.qty)
            .bind(fill.price)
            .bind(fill.fill_time)
            .fetch_optional(&mut *tx)
            .await?;

        match updated {
            Some(ref row) => {
                let order = map_order(row)?;
                tx.commit().await?;
                Ok(FillApply::Applied(order))
            }
            None => {
                // Diagnose, then roll everything back so the fill insert is
                // discarded along with the failed update.
                let sql = format!("SELECT {ORDER_COLS} FROM orders WHERE order_id = $1");
                let row = sqlx::query(&sql)
                    .bind(fill.order_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                let order = row.as_ref().map(map_order).transpose()?;
                tx.rollback().await?;

                Ok(match order {
                    None => FillApply::OrderNotFound,
                    Some(o) if o.filled_qty + fill.qty > o.qty => FillApply::Overflow(o),
                    Some(o) => FillApply::IllegalState(o),
                })
            }
        }
    }

    async fn list_non_terminal(&self, worker_id: Option<&str>) -> Result<Vec<Order>> {
        let rows = match worker_id {
            Some(w) => {
                let sql = format!(
                    r#"
                    SELECT {ORDER_COLS} FROM orders
                    WHERE worker_id = $1 AND status IN ('PENDING', 'SENT', 'PARTIAL')
                    ORDER BY created_at
                    "#
                );
                sqlx::query(&sql).bind(w).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!(
                    r#"
                    SELECT {ORDER_COLS} FROM orders
                    WHERE status IN ('PENDING', 'SENT', 'PARTIAL')
                    ORDER BY created_at
                    "#
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        Ok(rows.iter().map(map_order).collect::<sqlx::Result<_>>()?)
    }

    async fn list_fills_for_symbol(&self, worker_id: &str, symbol: &str) -> Result<Vec<Fill>> {
        let sql = r#"
            SELECT f.fill_id, f.broker_fill_id, f.order_id, f.symbol, f.side,
                   f.qty, f.price, f.fill_time
            FROM fills f
            JOIN orders o ON o.order_id = f.order_id
            WHERE o.worker_id = $1 AND f.symbol = $2
            ORDER BY f.fill_time, f.fill_id
        "#;
        let rows = sqlx::query(sql)
            .bind(worker_id)
            .bind(symbol)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_fill).collect::<sqlx::Result<_>>()?)
    }

    async fn list_fills_for_date(&self, worker_id: &str, date: NaiveDate) -> Result<Vec<Fill>> {
        let from = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let to = from + Duration::days(1);
        let sql = r#"
            SELECT f.fill_id, f.broker_fill_id, f.order_id, f.symbol, f.side,
                   f.qty, f.price, f.fill_time
            FROM fills f
            JOIN orders o ON o.order_id = f.order_id
            WHERE o.worker_id = $1 AND f.fill_time >= $2 AND f.fill_time < $3
            ORDER BY f.fill_time, f.fill_id
        "#;
        let rows = sqlx::query(sql)
            .bind(worker_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(map_fill).collect::<sqlx::Result<_>>()?)
    }
}

// ---------------------------------------------------------------------------
// SummaryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SummaryStore for PgStore {
    async fn upsert(&self, summary: &DailySummary) -> Result<()> {
        let sql = r#"
            INSERT INTO daily_summaries
                (worker_id, summary_date, total_trades, winning_trades, losing_trades,
                 gross_profit, gross_loss, net_pnl, unrealized_pnl, max_drawdown,
                 win_rate, profit_factor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (worker_id, summary_date) DO UPDATE SET
                total_trades = EXCLUDED.total_trades,
                winning_trades = EXCLUDED.winning_trades,
                losing_trades = EXCLUDED.losing_trades,
                gross_profit = EXCLUDED.gross_profit,
                gross_loss = EXCLUDED.gross_loss,
                net_pnl = EXCLUDED.net_pnl,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                max_drawdown = EXCLUDED.max_drawdown,
                win_rate = EXCLUDED.win_rate,
                profit_factor = EXCLUDED.profit_factor
        "#;
        sqlx::query(sql)
            .bind(&summary.worker_id)
            .bind(summary.summary_date)
            .bind(summary.total_trades as i32)
            .bind(summary.winning_trades as i32)
            .bind(summary.losing_trades as i32)
            .bind(summary.gross_profit)
            .bind(summary.gross_loss)
            .bind(summary.net_pnl)
            .bind(summary.unrealized_pnl)
            .bind(summary.max_drawdown)
            .bind(summary.win_rate)
            .bind(summary.profit_factor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &str, date: NaiveDate) -> Result<Option<DailySummary>> {
        let sql = r#"
            SELECT worker_id, summary_date, total_trades, winning_trades, losing_trades,
                   gross_profit, gross_loss, net_pnl, unrealized_pnl, max_drawdown,
                   win_rate, profit_factor
            FROM daily_summaries
            WHERE worker_id = $1 AND summary_date = $2
        "#;
        let row = sqlx::query(sql)
            .bind(worker_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(r) => Some(DailySummary {
                worker_id: r.try_get("worker_id").map_err(sqlx_err)?,
                summary_date: r.try_get("summary_date").map_err(sqlx_err)?,
                total_trades: r.try_get::<i32, _>("total_trades").map_err(sqlx_err)? as u32,
                winning_trades: r.try_get::<i32, _>("winning_trades").map_err(sqlx_err)? as u32,
                losing_trades: r.try_get::<i32, _>("losing_trades").map_err(sqlx_err)? as u32,
                gross_profit: r.try_get::<Decimal, _>("gross_profit").map_err(sqlx_err)?,
                gross_loss: r.try_get::<Decimal, _>("gross_loss").map_err(sqlx_err)?,
                net_pnl: r.try_get::<Decimal, _>("net_pnl").map_err(sqlx_err)?,
                unrealized_pnl: r.try_get::<Decimal, _>("unrealized_pnl").map_err(sqlx_err)?,
                max_drawdown: r.try_get::<Decimal, _>("max_drawdown").map_err(sqlx_err)?,
                win_rate: r.try_get("win_rate").map_err(sqlx_err)?,
                profit_factor: r.try_get("profit_factor").map_err(sqlx_err)?,
            }),
            None => None,
        })
    }
}

fn sqlx_err(e: sqlx::Error) -> crate::error::TradeError {
    e.into()
}
