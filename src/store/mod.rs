// =============================================================================
// Store Port — transactional persistence contract
// =============================================================================
//
// Each trait method is a single atomic conditional statement (uniqueness +
// conditional update), never a read-modify-write loop; cross-process
// correctness leans entirely on these semantics. `PgStore` is the production
// implementation; `MemoryStore` provides the same linearizable behaviour
// under one mutex for tests.
// =============================================================================

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DailySummary, Fill, Order, StockLock, WorkerProcess, WorkerStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of an idempotent order insert.
#[derive(Debug, Clone)]
pub enum OrderInsert {
    Inserted(Order),
    /// A row with the same idempotency key already existed; here it is.
    Duplicate(Order),
}

impl OrderInsert {
    pub fn into_order(self) -> Order {
        match self {
            Self::Inserted(o) | Self::Duplicate(o) => o,
        }
    }
}

/// Result of applying one execution report.
#[derive(Debug, Clone)]
pub enum FillApply {
    /// Fill inserted and aggregates updated; the refreshed order.
    Applied(Order),
    /// `broker_fill_id` was already recorded; nothing changed.
    DuplicateFill,
    /// The fill would push `filled_qty` past `qty`; nothing changed.
    Overflow(Order),
    /// The order is not in a fillable status; nothing changed.
    IllegalState(Order),
    /// No order matches the fill's `order_id`.
    OrderNotFound,
}

// ---------------------------------------------------------------------------
// Lock store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic conditional upsert keyed on `UNIQUE(symbol)`: insert a fresh
    /// ACTIVE row, or take over the existing one iff it is EXPIRED, past its
    /// `expires_at`, or already owned by `lock.worker_id` (idempotent
    /// re-acquire). When another worker holds it, this is a silent no-op —
    /// the caller reads back to learn who won.
    async fn try_acquire(&self, lock: &StockLock) -> Result<()>;

    async fn get(&self, symbol: &str) -> Result<Option<StockLock>>;

    /// ACTIVE -> EXPIRED iff owned by `worker_id`. True when a row changed.
    async fn release(&self, symbol: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Extend `expires_at` and refresh `heartbeat_at`, iff the row is ACTIVE,
    /// owned, and not yet past its deadline. Returns the updated row.
    async fn renew(
        &self,
        symbol: &str,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<StockLock>>;

    /// Refresh `heartbeat_at` only; the TTL is untouched. True when owned.
    async fn touch_heartbeat(
        &self,
        symbol: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark every ACTIVE row with `expires_at < now` as EXPIRED in a single
    /// conditional update. Safe to run from many workers concurrently.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Expire every ACTIVE row owned by `worker_id` (stale-worker reap).
    async fn expire_for_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64>;

    async fn list_active(&self) -> Result<Vec<StockLock>>;
}

// ---------------------------------------------------------------------------
// Worker store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// Register a worker row in its initial status. Overwrites a TERMINATED
    /// row with the same id; returns false when a live row already exists.
    async fn register(&self, worker: &WorkerProcess) -> Result<bool>;

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerProcess>>;

    /// Compare-and-set the status (`from` -> `to`), writing `current_symbol`
    /// alongside. True when the row changed.
    async fn set_status(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        current_symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn touch_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Non-terminated workers whose `last_heartbeat_at` is before `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerProcess>>;
}

// ---------------------------------------------------------------------------
// Order store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert unless the idempotency key exists; either way the caller gets
    /// the authoritative row.
    async fn insert(&self, order: &Order) -> Result<OrderInsert>;

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>>;

    async fn get_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>>;

    /// PENDING -> SENT, writing the broker order id. True when changed.
    async fn mark_sent(
        &self,
        order_id: Uuid,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Non-terminal -> REJECTED with a reason. True when changed.
    async fn mark_rejected(&self, order_id: Uuid, reason: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// SENT|PARTIAL -> CANCELED (set on the broker's terminal cancel event).
    async fn mark_canceled(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Apply one execution report in a single transaction: insert the fill
    /// (dedup on `broker_fill_id`) and conditionally bump the parent order's
    /// aggregates. Overflow leaves everything untouched.
    async fn apply_fill(&self, fill: &Fill) -> Result<FillApply>;

    /// Non-terminal orders, optionally restricted to one worker.
    async fn list_non_terminal(&self, worker_id: Option<&str>) -> Result<Vec<Order>>;

    /// Fills for one worker's orders on `symbol`, oldest first.
    async fn list_fills_for_symbol(&self, worker_id: &str, symbol: &str) -> Result<Vec<Fill>>;

    /// All fills for one worker's orders on a calendar date, oldest first.
    async fn list_fills_for_date(&self, worker_id: &str, date: NaiveDate) -> Result<Vec<Fill>>;
}

// ---------------------------------------------------------------------------
// Summary store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Insert-or-overwrite on `(worker_id, summary_date)`.
    async fn upsert(&self, summary: &DailySummary) -> Result<()>;

    async fn get(&self, worker_id: &str, date: NaiveDate) -> Result<Option<DailySummary>>;
}
