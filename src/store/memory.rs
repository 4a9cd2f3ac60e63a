// =============================================================================
// MemoryStore — in-memory implementation of the store contracts
// =============================================================================
//
// Mirrors the Postgres implementation's conditional-write semantics exactly:
// every operation applies its condition and mutation while holding one mutex,
// which makes each call linearizable — the property the lock protocol needs.
// Used by the test suite; carries no persistence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{
    FillApply, LockStore, OrderInsert, OrderStore, SummaryStore, WorkerStore,
};
use crate::types::{
    to_money, DailySummary, Fill, LockStatus, Order, OrderStatus, StockLock, WorkerProcess,
    WorkerStatus,
};
use rust_decimal::Decimal;

#[derive(Default)]
struct State {
    locks: HashMap<String, StockLock>,
    workers: HashMap<String, WorkerProcess>,
    orders: HashMap<Uuid, Order>,
    /// idempotency_key -> order_id
    order_keys: HashMap<String, Uuid>,
    fills: Vec<Fill>,
    /// broker_fill_id set for dedup
    fill_ids: HashMap<String, Uuid>,
    summaries: HashMap<(String, NaiveDate), DailySummary>,
}

/// Shared in-memory store. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: every fill currently recorded.
    pub fn all_fills(&self) -> Vec<Fill> {
        self.state.lock().fills.clone()
    }

    /// Test helper: every lock row, any status.
    pub fn all_locks(&self) -> Vec<StockLock> {
        self.state.lock().locks.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, lock: &StockLock) -> Result<()> {
        let mut state = self.state.lock();
        match state.locks.get_mut(&lock.symbol) {
            None => {
                state.locks.insert(lock.symbol.clone(), lock.clone());
            }
            Some(existing) => {
                let takeover = existing.status == LockStatus::Expired
                    || existing.expires_at < lock.acquired_at
                    || existing.worker_id == lock.worker_id;
                if takeover {
                    let created_at = existing.created_at;
                    *existing = lock.clone();
                    existing.created_at = created_at;
                    existing.status = LockStatus::Active;
                }
            }
        }
        Ok(())
    }

    async fn get(&self, symbol: &str) -> Result<Option<StockLock>> {
        Ok(self.state.lock().locks.get(symbol).cloned())
    }

    async fn release(&self, symbol: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        match state.locks.get_mut(symbol) {
            Some(lock) if lock.worker_id == worker_id && lock.status == LockStatus::Active => {
                lock.status = LockStatus::Expired;
                lock.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(
        &self,
        symbol: &str,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<StockLock>> {
        let mut state = self.state.lock();
        match state.locks.get_mut(symbol) {
            Some(lock)
                if lock.worker_id == worker_id
                    && lock.status == LockStatus::Active
                    && lock.expires_at >= now =>
            {
                lock.expires_at = new_expires_at;
                lock.heartbeat_at = now;
                lock.updated_at = now;
                Ok(Some(lock.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn touch_heartbeat(
        &self,
        symbol: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.locks.get_mut(symbol) {
            Some(lock) if lock.worker_id == worker_id && lock.status == LockStatus::Active => {
                lock.heartbeat_at = now;
                lock.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let mut expired = 0;
        for lock in state.locks.values_mut() {
            if lock.status == LockStatus::Active && lock.expires_at < now {
                lock.status = LockStatus::Expired;
                lock.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn expire_for_worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let mut expired = 0;
        for lock in state.locks.values_mut() {
            if lock.status == LockStatus::Active && lock.worker_id == worker_id {
                lock.status = LockStatus::Expired;
                lock.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_active(&self) -> Result<Vec<StockLock>> {
        Ok(self
            .state
            .lock()
            .locks
            .values()
            .filter(|l| l.status == LockStatus::Active)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// WorkerStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn register(&self, worker: &WorkerProcess) -> Result<bool> {
        let mut state = self.state.lock();
        match state.workers.get(&worker.worker_id) {
            Some(existing) if existing.status != WorkerStatus::Terminated => Ok(false),
            Some(existing) => {
                let created_at = existing.created_at;
                let mut row = worker.clone();
                row.created_at = created_at;
                state.workers.insert(worker.worker_id.clone(), row);
                Ok(true)
            }
            None => {
                state
                    .workers
                    .insert(worker.worker_id.clone(), worker.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerProcess>> {
        Ok(self.state.lock().workers.get(worker_id).cloned())
    }

    async fn set_status(
        &self,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        current_symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.workers.get_mut(worker_id) {
            Some(w) if w.status == from => {
                w.status = to;
                w.current_symbol = current_symbol.map(str::to_string);
                w.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        match state.workers.get_mut(worker_id) {
            Some(w) if w.status != WorkerStatus::Terminated => {
                w.last_heartbeat_at = now;
                w.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerProcess>> {
        Ok(self
            .state
            .lock()
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Terminated && w.last_heartbeat_at < cutoff)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// OrderStore
// ---------------------------------------------------------------------------

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: &Order) -> Result<OrderInsert> {
        let mut state = self.state.lock();
        if let Some(existing_id) = state.order_keys.get(&order.idempotency_key) {
            let existing = state.orders[existing_id].clone();
            return Ok(OrderInsert::Duplicate(existing));
        }
        state
            .order_keys
            .insert(order.idempotency_key.clone(), order.order_id);
        state.orders.insert(order.order_id, order.clone());
        Ok(OrderInsert::Inserted(order.clone()))
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().orders.get(&order_id).cloned())
    }

    async fn get_by_broker_id(&self, broker_order_id: &str) -> Result<Option<Order>> {
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .find(|o| o.broker_order_id.as_deref() == Some(broker_order_id))
            .cloned())
    }

    async fn mark_sent(
        &self,
        order_id: Uuid,
        broker_order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.orders.get_mut(&order_id) {
            Some(o) if o.status == OrderStatus::Pending => {
                o.broker_order_id = Some(broker_order_id.to_string());
                o.status = OrderStatus::Sent;
                o.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_rejected(
        &self,
        order_id: Uuid,
        _reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.orders.get_mut(&order_id) {
            Some(o) if matches!(o.status, OrderStatus::Pending | OrderStatus::Sent) => {
                o.status = OrderStatus::Rejected;
                o.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_canceled(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        match state.orders.get_mut(&order_id) {
            Some(o) if matches!(o.status, OrderStatus::Sent | OrderStatus::Partial) => {
                o.status = OrderStatus::Canceled;
                o.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_fill(&self, fill: &Fill) -> Result<FillApply> {
        let mut state = self.state.lock();

        if state.fill_ids.contains_key(&fill.broker_fill_id) {
            return Ok(FillApply::DuplicateFill);
        }

        let Some(order) = state.orders.get(&fill.order_id).cloned() else {
            return Ok(FillApply::OrderNotFound);
        };
        if !matches!(order.status, OrderStatus::Sent | OrderStatus::Partial) {
            return Ok(FillApply::IllegalState(order));
        }
        if order.filled_qty + fill.qty > order.qty {
            return Ok(FillApply::Overflow(order));
        }

        // Both the fill append and the aggregate bump happen under the one
        // mutex, the in-memory analogue of the Postgres transaction.
        state
            .fill_ids
            .insert(fill.broker_fill_id.clone(), fill.fill_id);
        state.fills.push(fill.clone());

        let order = state.orders.get_mut(&fill.order_id).expect("checked above");
        let prev_qty = Decimal::from(order.filled_qty);
        let add_qty = Decimal::from(fill.qty);
        order.avg_fill_price = to_money(
            (order.avg_fill_price * prev_qty + fill.price * add_qty) / (prev_qty + add_qty),
        );
        order.filled_qty += fill.qty;
        order.status = if order.filled_qty == order.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        order.updated_at = fill.fill_time;

        Ok(FillApply::Applied(order.clone()))
    }

    async fn list_non_terminal(&self, worker_id: Option<&str>) -> Result<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| worker_id.map_or(true, |w| o.worker_id == w))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn list_fills_for_symbol(&self, worker_id: &str, symbol: &str) -> Result<Vec<Fill>> {
        let state = self.state.lock();
        let mut fills: Vec<Fill> = state
            .fills
            .iter()
            .filter(|f| f.symbol == symbol)
            .filter(|f| {
                state
                    .orders
                    .get(&f.order_id)
                    .map_or(false, |o| o.worker_id == worker_id)
            })
            .cloned()
            .collect();
        fills.sort_by_key(|f| (f.fill_time, f.fill_id));
        Ok(fills)
    }

    async fn list_fills_for_date(&self, worker_id: &str, date: NaiveDate) -> Result<Vec<Fill>> {
        let from = date.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let to = from + Duration::days(1);
        let state = self.state.lock();
        let mut fills: Vec<Fill> = state
            .fills
            .iter()
            .filter(|f| f.fill_time >= from && f.fill_time < to)
            .filter(|f| {
                state
                    .orders
                    .get(&f.order_id)
                    .map_or(false, |o| o.worker_id == worker_id)
            })
            .cloned()
            .collect();
        fills.sort_by_key(|f| (f.fill_time, f.fill_id));
        Ok(fills)
    }
}

// ---------------------------------------------------------------------------
// SummaryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn upsert(&self, summary: &DailySummary) -> Result<()> {
        self.state.lock().summaries.insert(
            (summary.worker_id.clone(), summary.summary_date),
            summary.clone(),
        );
        Ok(())
    }

    async fn get(&self, worker_id: &str, date: NaiveDate) -> Result<Option<DailySummary>> {
        Ok(self
            .state
            .lock()
            .summaries
            .get(&(worker_id.to_string(), date))
            .cloned())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("locks", &state.locks.len())
            .field("workers", &state.workers.len())
            .field("orders", &state.orders.len())
            .field("fills", &state.fills.len())
            .finish()
    }
}
