// =============================================================================
// Worker Main — state machine, event loop, and background tasks
// =============================================================================
//
// One cooperative event loop owns all state transitions:
//
//    IDLE -> SCANNING -> HOLDING -> SCANNING -> ... -> EXITING -> TERMINATED
//
// Sibling tasks (heartbeat, fill consumer, quote consumer, sweeper) never
// transition state; they feed the store and the in-memory caches the loop
// reads. Shutdown is cooperative: the loop finishes its tick, force-exits any
// open position, releases its lock, writes the daily summary, and terminates.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerPort, ExecutionEvent, QuoteEvent};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, TradeError};
use crate::lifecycle::WorkerLifecycleService;
use crate::lock::LockService;
use crate::notify::{AlertLevel, Notifier};
use crate::orders::{NewOrder, OrderService, ProcessedFill};
use crate::pnl::{compute_summary, DailySummaryService};
use crate::poller::{CandidateFilters, MarketDataPoller};
use crate::recovery::{self, RecoveryReport};
use crate::session::TradingSession;
use crate::store::OrderStore;
use crate::strategy::{SellSignal, StrategyContext, StrategyExecutor};
use crate::types::{Order, OrderStatus, OrderType, SellReason, Side, StockLock, WorkerStatus};

/// Cadence at which the exit path re-checks order status while waiting for a
/// terminal state.
const EXIT_POLL_STEP: StdDuration = StdDuration::from_millis(25);
/// Bounded market-order retries when an exit will not complete.
const EXIT_MAX_RETRIES: u32 = 3;
/// Retries for an execution report that arrived before its order was marked
/// SENT (the stream can outrun the placement write).
const UNMATCHED_RETRIES: u32 = 5;
const UNMATCHED_RETRY_DELAY: StdDuration = StdDuration::from_millis(50);
/// Capacity of the stream channels.
const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Shared observable state
// ---------------------------------------------------------------------------

/// State the background tasks and the health API read concurrently with the
/// event loop. The loop is the only writer of `status`/`current_symbol`.
pub struct WorkerShared {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub status: RwLock<WorkerStatus>,
    pub current_symbol: RwLock<Option<String>>,
    pub quotes: RwLock<HashMap<String, QuoteEvent>>,
    pub recovery: RwLock<Option<RecoveryReport>>,
    pub last_error: RwLock<Option<String>>,
}

impl WorkerShared {
    pub fn new(worker_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            started_at,
            status: RwLock::new(WorkerStatus::Idle),
            current_symbol: RwLock::new(None),
            quotes: RwLock::new(HashMap::new()),
            recovery: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            status: *self.status.read(),
            current_symbol: self.current_symbol.read().clone(),
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            tracked_quotes: self.quotes.read().len(),
            recovery: self.recovery.read().clone(),
            last_error: self.last_error.read().clone(),
            server_time: now,
        }
    }

    fn record_error(&self, e: &TradeError) {
        *self.last_error.write() = Some(e.to_string());
    }
}

/// Serialisable operational snapshot served by the health API.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_symbol: Option<String>,
    pub uptime_secs: u64,
    pub tracked_quotes: usize,
    pub recovery: Option<RecoveryReport>,
    pub last_error: Option<String>,
    pub server_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Holding state (loop-local)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Holding {
    symbol: String,
    entry_order_id: Uuid,
    entered_at: DateTime<Utc>,
    high_water: Decimal,
    /// Raised once the forced-window alert has fired, so it fires once.
    stuck_alerted: bool,
}

/// Whether a lock is close enough to expiry that it should be renewed.
pub(crate) fn needs_renewal(lock: &StockLock, now: DateTime<Utc>, threshold: Duration) -> bool {
    lock.expires_at - now < threshold
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// The service graph a worker runs against, composed at startup (or by a
/// test fixture) and injected whole.
pub struct WorkerServices {
    pub clock: Arc<dyn Clock>,
    pub broker: Arc<dyn BrokerPort>,
    pub locks: Arc<LockService>,
    pub lifecycle: Arc<WorkerLifecycleService>,
    pub orders: Arc<OrderService>,
    pub order_store: Arc<dyn OrderStore>,
    pub strategy: Arc<StrategyExecutor>,
    pub summaries: Arc<DailySummaryService>,
    pub notifier: Arc<Notifier>,
}

pub struct Worker {
    id: String,
    account_id: String,
    config: Config,
    session: TradingSession,
    filters: CandidateFilters,
    clock: Arc<dyn Clock>,
    broker: Arc<dyn BrokerPort>,
    locks: Arc<LockService>,
    lifecycle: Arc<WorkerLifecycleService>,
    orders: Arc<OrderService>,
    order_store: Arc<dyn OrderStore>,
    poller: MarketDataPoller,
    strategy: Arc<StrategyExecutor>,
    summaries: Arc<DailySummaryService>,
    notifier: Arc<Notifier>,
    shared: Arc<WorkerShared>,
    shutdown: watch::Receiver<bool>,
    holding: Option<Holding>,
    status: WorkerStatus,
}

impl Worker {
    pub fn new(
        id: String,
        account_id: String,
        config: Config,
        services: WorkerServices,
        shared: Arc<WorkerShared>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let session = config.session();
        let filters = CandidateFilters::from_config(&config);
        let poller = MarketDataPoller::new(services.broker.clone(), services.clock.clone());
        Self {
            id,
            account_id,
            config,
            session,
            filters,
            clock: services.clock,
            broker: services.broker,
            locks: services.locks,
            lifecycle: services.lifecycle,
            orders: services.orders,
            order_store: services.order_store,
            poller,
            strategy: services.strategy,
            summaries: services.summaries,
            notifier: services.notifier,
            shared,
            shutdown,
            holding: None,
            status: WorkerStatus::Idle,
        }
    }

    // -------------------------------------------------------------------------
    // Run
    // -------------------------------------------------------------------------

    /// Register, reconcile, spawn the background tasks, and drive the event
    /// loop until shutdown. Always terminates through EXITING.
    pub async fn run(mut self) -> Result<()> {
        self.lifecycle.start(&self.id).await?;
        self.set_status(WorkerStatus::Idle, None);

        // Startup reconciliation before the first tick: broker truth wins.
        let recovered = recovery::reconcile_startup(
            &self.broker,
            &self.order_store,
            &self.clock,
            &self.account_id,
            &self.id,
            self.config.lost_order_timeout(),
        )
        .await?;
        *self.shared.recovery.write() = Some(recovered.report.clone());

        self.spawn_background_tasks();

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }

            let tick_result = match self.status {
                WorkerStatus::Idle => self.bootstrap_tick().await,
                WorkerStatus::Scanning => self.scan_tick().await,
                WorkerStatus::Holding => self.holding_tick().await,
                // The loop never runs in these states.
                WorkerStatus::Exiting | WorkerStatus::Terminated => break,
            };

            if let Err(e) = tick_result {
                self.shared.record_error(&e);
                if e.is_transient() {
                    warn!(worker_id = %self.id, error = %e, "tick failed — retrying next tick");
                } else {
                    error!(worker_id = %self.id, error = %e, "tick failed");
                }
            }
        }

        self.enter_exiting().await
    }

    // -------------------------------------------------------------------------
    // IDLE
    // -------------------------------------------------------------------------

    async fn bootstrap_tick(&mut self) -> Result<()> {
        self.lifecycle
            .transition(&self.id, WorkerStatus::Scanning, None)
            .await?;
        self.set_status(WorkerStatus::Scanning, None);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SCANNING
    // -------------------------------------------------------------------------

    async fn scan_tick(&mut self) -> Result<()> {
        let now = self.clock.now();
        if !self.session.accepts_entries(now) {
            debug!(worker_id = %self.id, "outside entry window — idling");
            return Ok(());
        }
        if self.daily_loss_reached().await? {
            return Ok(());
        }

        let strategy = self.strategy.clone();
        let score = move |q: &crate::broker::Quote| strategy.score(q);
        let candidates = self
            .poller
            .discover_candidates(
                &self.config.universe,
                &self.filters,
                self.config.max_candidates,
                &score,
            )
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let cash = self.broker.get_cash(&self.account_id).await?;
        let ctx = StrategyContext {
            now,
            cash,
            capital_limit: self.config.capital_limit_per_worker,
            params: self.config.strategy_params.clone(),
            holding_since: None,
            high_water: None,
        };

        for candidate in candidates {
            let Some(buy) = self.strategy.should_buy(&candidate, &ctx) else {
                continue;
            };

            match self
                .locks
                .acquire(&candidate.symbol, &self.id, self.config.lock_ttl())
                .await
            {
                Ok(_) => {}
                Err(TradeError::LockAcquisition { symbol, holder }) => {
                    debug!(symbol, holder, "candidate owned elsewhere — next");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let qty = match buy.qty {
                Some(q) if q > 0 => q,
                _ => {
                    self.locks.release(&candidate.symbol, &self.id).await?;
                    continue;
                }
            };
            let order_type = if buy.price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            };

            let order = self
                .orders
                .create_order(NewOrder {
                    idempotency_key: format!("{}:{}:{}", self.id, candidate.symbol, Uuid::new_v4()),
                    worker_id: self.id.clone(),
                    symbol: candidate.symbol.clone(),
                    side: Side::Buy,
                    order_type,
                    qty,
                    price: buy.price,
                })
                .await?;

            info!(
                worker_id = %self.id,
                symbol = %candidate.symbol,
                qty,
                confidence = buy.confidence,
                reason = %buy.reason,
                "entering position"
            );

            match self.orders.send_order(order.order_id).await {
                Ok(sent) if sent.status == OrderStatus::Rejected => {
                    warn!(symbol = %candidate.symbol, "entry rejected — releasing lock");
                    self.locks.release(&candidate.symbol, &self.id).await?;
                    continue;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    // Outcome unknown: the order may exist at the broker. Keep
                    // the lock, hold, and let the HOLDING path resend/reconcile.
                    warn!(symbol = %candidate.symbol, error = %e, "entry outcome unknown — holding");
                }
                Err(e) => {
                    self.locks.release(&candidate.symbol, &self.id).await?;
                    return Err(e);
                }
            }

            self.lifecycle
                .transition(&self.id, WorkerStatus::Holding, Some(&candidate.symbol))
                .await?;
            self.set_status(WorkerStatus::Holding, Some(candidate.symbol.clone()));
            self.holding = Some(Holding {
                symbol: candidate.symbol,
                entry_order_id: order.order_id,
                entered_at: now,
                high_water: candidate.price,
                stuck_alerted: false,
            });
            return Ok(());
        }

        Ok(())
    }

    /// Realized-PnL guard: once the day's losses breach the configured
    /// limit, the worker stops entering (exits still run).
    async fn daily_loss_reached(&self) -> Result<bool> {
        let today = self.clock.now().date_naive();
        let fills = self.order_store.list_fills_for_date(&self.id, today).await?;
        if fills.is_empty() {
            return Ok(false);
        }
        let summary = compute_summary(&self.id, today, &fills, Decimal::ZERO);
        let breached = summary.net_pnl <= -self.config.daily_loss_limit;
        if breached {
            warn!(
                worker_id = %self.id,
                net_pnl = %summary.net_pnl,
                limit = %self.config.daily_loss_limit,
                "daily loss limit reached — no further entries"
            );
        }
        Ok(breached)
    }

    // -------------------------------------------------------------------------
    // HOLDING
    // -------------------------------------------------------------------------

    async fn holding_tick(&mut self) -> Result<()> {
        let Some(holding) = self.holding.clone() else {
            // State says HOLDING but the loop lost its context (should not
            // happen): fall back to scanning.
            warn!(worker_id = %self.id, "HOLDING without context — rescanning");
            self.back_to_scanning().await?;
            return Ok(());
        };
        let now = self.clock.now();

        // Preemption check: if our lock is gone, we no longer own the symbol.
        let lock_ok = match self.locks.get_lock(&holding.symbol).await? {
            Some(lock) => {
                lock.worker_id == self.id
                    && lock.status == crate::types::LockStatus::Active
                    && !lock.is_expired_at(now)
            }
            None => false,
        };

        let Some(price) = self.current_price(&holding.symbol, now).await? else {
            debug!(symbol = %holding.symbol, "no usable price this tick");
            return Ok(());
        };

        if let Some(h) = self.holding.as_mut() {
            if price > h.high_water {
                h.high_water = price;
            }
        }
        let high_water = self.holding.as_ref().map(|h| h.high_water);

        let position = self
            .orders
            .position(&self.id, &holding.symbol, Some(price))
            .await?;

        if position.net_qty == 0 {
            return self.holding_without_position(&holding, now).await;
        }

        if !lock_ok {
            // Preempted: close out before touching SCANNING again.
            warn!(
                worker_id = %self.id,
                symbol = %holding.symbol,
                "lock preempted while holding — liquidating position"
            );
            self.notifier
                .alert(
                    AlertLevel::Warn,
                    &format!(
                        "worker {} lost lock on {} while holding {} shares",
                        self.id, holding.symbol, position.net_qty
                    ),
                )
                .await;
            let signal = SellSignal {
                confidence: 1.0,
                price: None,
                reason: SellReason::Forced,
            };
            return self.execute_exit(&holding, &signal, position.net_qty).await;
        }

        // Forced-exit window bypasses the strategy entirely.
        let signal = if self.session.in_liquidation_window(now) {
            info!(
                worker_id = %self.id,
                symbol = %holding.symbol,
                "forced-exit window open — liquidating"
            );
            SellSignal {
                confidence: 1.0,
                price: None,
                reason: SellReason::Forced,
            }
        } else {
            let ctx = StrategyContext {
                now,
                cash: Decimal::ZERO,
                capital_limit: self.config.capital_limit_per_worker,
                params: self.config.strategy_params.clone(),
                holding_since: Some(holding.entered_at),
                high_water,
            };
            match self
                .strategy
                .should_sell(&holding.symbol, &position, price, &ctx)
            {
                Some(signal) => signal,
                None => return Ok(()),
            }
        };

        self.execute_exit(&holding, &signal, position.net_qty).await
    }

    /// HOLDING with a flat position: the entry has not (fully) materialised.
    async fn holding_without_position(
        &mut self,
        holding: &Holding,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(entry) = self.orders.get_order(holding.entry_order_id).await? else {
            self.abandon_holding("entry order vanished").await?;
            return Ok(());
        };

        match entry.status {
            OrderStatus::Pending => {
                // Unknown placement outcome earlier; the idempotency key makes
                // this retry safe.
                debug!(order_id = %entry.order_id, "re-sending pending entry");
                match self.orders.send_order(entry.order_id).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_transient() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            OrderStatus::Sent | OrderStatus::Partial => {
                // Waiting on fills. Inside the forced window an unfilled entry
                // is cancelled rather than waited out.
                if self.session.in_liquidation_window(now) {
                    warn!(order_id = %entry.order_id, "cancelling unfilled entry in forced window");
                    let _ = self.orders.cancel_order(entry.order_id).await?;
                }
                Ok(())
            }
            OrderStatus::Rejected | OrderStatus::Canceled => {
                self.abandon_holding("entry terminally unfilled").await
            }
            OrderStatus::Filled => {
                // Fills are still flowing through the consumer task.
                debug!(order_id = %entry.order_id, "entry filled — waiting for fill ingestion");
                Ok(())
            }
        }
    }

    async fn abandon_holding(&mut self, why: &str) -> Result<()> {
        if let Some(h) = self.holding.clone() {
            info!(worker_id = %self.id, symbol = %h.symbol, why, "abandoning holding");
            self.locks.release(&h.symbol, &self.id).await?;
        }
        self.back_to_scanning().await
    }

    async fn back_to_scanning(&mut self) -> Result<()> {
        self.lifecycle
            .transition(&self.id, WorkerStatus::Scanning, None)
            .await?;
        self.set_status(WorkerStatus::Scanning, None);
        self.holding = None;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exit execution
    // -------------------------------------------------------------------------

    /// Submit the exit and wait for a terminal status, falling back to market
    /// retries. Inside the forced window an unclosable position raises an
    /// operational alert and the worker stays HOLDING with the lock kept.
    async fn execute_exit(
        &mut self,
        holding: &Holding,
        signal: &SellSignal,
        mut qty: i64,
    ) -> Result<()> {
        info!(
            worker_id = %self.id,
            symbol = %holding.symbol,
            qty,
            reason = %signal.reason,
            "submitting exit"
        );

        let mut attempt: u32 = 0;
        // First attempt honours the signal's limit price; retries go market.
        let mut price = signal.price;

        loop {
            let order_type = if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            };
            let order = self
                .orders
                .create_order(NewOrder {
                    idempotency_key: format!("{}:{}:{}", self.id, holding.symbol, Uuid::new_v4()),
                    worker_id: self.id.clone(),
                    symbol: holding.symbol.clone(),
                    side: Side::Sell,
                    order_type,
                    qty,
                    price,
                })
                .await?;

            let sent = match self.orders.send_order(order.order_id).await {
                Ok(sent) => sent,
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "exit placement outcome unknown — will retry");
                    self.orders
                        .get_order(order.order_id)
                        .await?
                        .ok_or_else(|| TradeError::Invariant("exit order vanished".into()))?
                }
                Err(e) => return Err(e),
            };

            if sent.status == OrderStatus::Rejected {
                warn!(order_id = %sent.order_id, "exit rejected");
            } else if let Some(terminal) = self.wait_for_terminal(sent.order_id).await? {
                match terminal.status {
                    OrderStatus::Filled => {
                        return self.finalize_exit(holding, signal, &terminal).await;
                    }
                    OrderStatus::Canceled => {
                        debug!(order_id = %terminal.order_id, "exit canceled — retrying");
                    }
                    _ => {}
                }
            } else {
                // Timed out without a terminal status: try to pull it back
                // before the market retry. The cancel is optimistic.
                let current = self.orders.get_order(sent.order_id).await?;
                if let Some(current) = current {
                    if matches!(current.status, OrderStatus::Sent | OrderStatus::Partial) {
                        let _ = self.orders.cancel_order(current.order_id).await;
                    }
                    if current.status == OrderStatus::Filled {
                        return self.finalize_exit(holding, signal, &current).await;
                    }
                }
            }

            attempt += 1;
            if attempt > EXIT_MAX_RETRIES {
                break;
            }
            price = None; // market fallback

            // Re-derive the remaining quantity: partial exits shrink it.
            let position = self
                .orders
                .position(&self.id, &holding.symbol, None)
                .await?;
            if position.net_qty == 0 {
                // Flattened by fills that landed during the retry dance.
                let last = self.orders.get_order(order.order_id).await?;
                if let Some(last) = last {
                    return self.finalize_exit(holding, signal, &last).await;
                }
                if self.status == WorkerStatus::Exiting {
                    self.holding = None;
                    return Ok(());
                }
                return self.back_to_scanning().await;
            }
            qty = position.net_qty;
        }

        // Retries exhausted.
        let now = self.clock.now();
        if self.session.in_liquidation_window(now) {
            if !holding.stuck_alerted {
                let msg = format!(
                    "worker {} cannot liquidate {} inside the forced window — manual action required",
                    self.id, holding.symbol
                );
                error!("{msg}");
                self.notifier.alert(AlertLevel::Error, &msg).await;
                if let Some(h) = self.holding.as_mut() {
                    h.stuck_alerted = true;
                }
            }
        } else {
            warn!(
                worker_id = %self.id,
                symbol = %holding.symbol,
                "exit retries exhausted — staying in position until next tick"
            );
        }
        // Keep HOLDING and the lock so no other worker re-enters the symbol.
        Ok(())
    }

    /// Poll the local order row until terminal or the bounded wait elapses.
    /// Fills land via the consumer task, so this is a read-only wait.
    async fn wait_for_terminal(&self, order_id: Uuid) -> Result<Option<Order>> {
        let deadline = tokio::time::Instant::now() + self.exit_wait();
        loop {
            if let Some(order) = self.orders.get_order(order_id).await? {
                if order.status.is_terminal() {
                    return Ok(Some(order));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(EXIT_POLL_STEP).await;
        }
    }

    fn exit_wait(&self) -> StdDuration {
        self.config.poll_interval().max(StdDuration::from_millis(500))
    }

    async fn finalize_exit(
        &mut self,
        holding: &Holding,
        signal: &SellSignal,
        exit_order: &Order,
    ) -> Result<()> {
        info!(
            worker_id = %self.id,
            symbol = %holding.symbol,
            reason = %signal.reason,
            avg_fill_price = %exit_order.avg_fill_price,
            filled_qty = exit_order.filled_qty,
            "position closed"
        );

        self.locks.release(&holding.symbol, &self.id).await?;
        if self.status == WorkerStatus::Exiting {
            // Shutdown path: the loop is already tearing down.
            self.holding = None;
            Ok(())
        } else {
            self.back_to_scanning().await
        }
    }

    // -------------------------------------------------------------------------
    // EXITING
    // -------------------------------------------------------------------------

    async fn enter_exiting(&mut self) -> Result<()> {
        info!(worker_id = %self.id, "entering EXITING");
        if let Err(e) = self
            .lifecycle
            .transition(&self.id, WorkerStatus::Exiting, None)
            .await
        {
            // A reaper may have terminated us already; continue the teardown.
            warn!(error = %e, "EXITING transition failed — continuing teardown");
        }
        let held_symbol = self.shared.current_symbol.read().clone();
        self.set_status(WorkerStatus::Exiting, held_symbol);

        // Forced exit of any open position, then release the lock either way.
        if let Some(holding) = self.holding.clone() {
            let position = self
                .orders
                .position(&self.id, &holding.symbol, None)
                .await?;
            if position.net_qty > 0 {
                let signal = SellSignal {
                    confidence: 1.0,
                    price: None,
                    reason: SellReason::Forced,
                };
                if let Err(e) = self
                    .execute_exit(&holding, &signal, position.net_qty)
                    .await
                {
                    error!(error = %e, "forced exit during shutdown failed");
                }
            }
            let _ = self.locks.release(&holding.symbol, &self.id).await;
            self.holding = None;
        }

        // End-of-day rollup: mark whatever is left open against last quotes.
        let unrealized = self.residual_unrealized().await.unwrap_or(Decimal::ZERO);
        if let Err(e) = self.summaries.generate_today(&self.id, unrealized).await {
            error!(error = %e, "daily summary generation failed");
        }

        self.lifecycle.stop(&self.id).await?;
        self.set_status(WorkerStatus::Terminated, None);
        info!(worker_id = %self.id, "worker terminated");
        Ok(())
    }

    /// Mark any residual open quantity against the freshest known quote.
    async fn residual_unrealized(&self) -> Result<Decimal> {
        let now = self.clock.now();
        let mut total = Decimal::ZERO;
        for symbol in &self.config.universe {
            let price = self.current_price(symbol, now).await.ok().flatten();
            let position = self.orders.position(&self.id, symbol, price).await?;
            if let Some(u) = position.unrealized_pnl {
                total += u;
            }
        }
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Price lookup
    // -------------------------------------------------------------------------

    /// Stream cache first; spot poll when the cache is stale or empty.
    async fn current_price(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let cached = self.shared.quotes.read().get(symbol).cloned();
        if let Some(tick) = cached {
            if now - tick.at <= self.config.quote_staleness() {
                return Ok(Some(tick.price));
            }
        }

        let quotes = self.broker.get_quotes(&[symbol.to_string()]).await?;
        Ok(quotes.first().map(|q| q.price))
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    fn spawn_background_tasks(&self) {
        self.spawn_heartbeat_task();
        self.spawn_fill_consumer();
        self.spawn_quote_consumer();
        tokio::spawn(recovery::run_sweeper(
            self.locks.clone(),
            self.lifecycle.clone(),
            self.config.heartbeat_interval(),
            self.shutdown.clone(),
        ));
    }

    /// Worker heartbeat + lock heartbeat/renewal. Any failure logs and waits
    /// for the next beat; the loop itself never dies of a heartbeat error.
    fn spawn_heartbeat_task(&self) {
        let lifecycle = self.lifecycle.clone();
        let locks = self.locks.clone();
        let shared = self.shared.clone();
        let clock = self.clock.clone();
        let id = self.id.clone();
        let interval = self.config.heartbeat_interval();
        let ttl = self.config.lock_ttl();
        let renew_threshold = self.config.lock_renew_threshold();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }

                if let Err(e) = lifecycle.heartbeat(&id).await {
                    warn!(error = %e, "worker heartbeat failed");
                }

                let symbol = shared.current_symbol.read().clone();
                let Some(symbol) = symbol else { continue };

                match locks.heartbeat(&symbol, &id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(symbol = %symbol, "lock heartbeat refused — lock no longer held");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "lock heartbeat failed");
                        continue;
                    }
                }

                match locks.get_lock(&symbol).await {
                    Ok(Some(lock)) if needs_renewal(&lock, clock.now(), renew_threshold) => {
                        match locks.renew(&symbol, &id, ttl).await {
                            Ok(renewed) => {
                                debug!(symbol = %symbol, expires_at = %renewed.expires_at, "lock renewed")
                            }
                            Err(e) => warn!(symbol = %symbol, error = %e, "lock renewal failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "lock read failed during heartbeat"),
                }
            }
        });
    }

    /// Subscribe to the execution stream and feed every report into the
    /// order service. Replays dedup on `broker_fill_id`; reports that arrive
    /// before their order is marked SENT are retried briefly.
    fn spawn_fill_consumer(&self) {
        let broker = self.broker.clone();
        let orders = self.orders.clone();
        let shutdown = self.shutdown.clone();

        let (tx, mut rx) = mpsc::channel::<ExecutionEvent>(CHANNEL_CAPACITY);
        let sub_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.subscribe_executions(tx, sub_shutdown).await {
                error!(error = %e, "execution subscription ended");
            }
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if *shutdown.borrow() {
                    return;
                }
                let mut attempts = 0;
                loop {
                    match orders.process_execution(&event).await {
                        Ok(ProcessedFill::Unmatched) if attempts < UNMATCHED_RETRIES => {
                            attempts += 1;
                            tokio::time::sleep(UNMATCHED_RETRY_DELAY).await;
                        }
                        Ok(ProcessedFill::Unmatched) => {
                            warn!(
                                broker_order_id = %event.broker_order_id,
                                "execution never matched a local order — dropped"
                            );
                            break;
                        }
                        Ok(_) => break,
                        Err(e) => {
                            warn!(error = %e, "fill ingestion failed — retrying once");
                            if attempts >= UNMATCHED_RETRIES {
                                break;
                            }
                            attempts += 1;
                            tokio::time::sleep(UNMATCHED_RETRY_DELAY).await;
                        }
                    }
                }
            }
        });
    }

    /// Subscribe to quote ticks and keep the shared last-quote cache fresh.
    fn spawn_quote_consumer(&self) {
        let broker = self.broker.clone();
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let universe = self.config.universe.clone();

        let (tx, mut rx) = mpsc::channel::<QuoteEvent>(CHANNEL_CAPACITY);
        let sub_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.subscribe_quotes(&universe, tx, sub_shutdown).await {
                error!(error = %e, "quote subscription ended");
            }
        });

        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                if *shutdown.borrow() {
                    return;
                }
                shared.quotes.write().insert(tick.symbol.clone(), tick);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Local state mirror
    // -------------------------------------------------------------------------

    fn set_status(&mut self, status: WorkerStatus, symbol: Option<String>) {
        self.status = status;
        *self.shared.status.write() = status;
        *self.shared.current_symbol.write() = symbol;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, SummaryStore};
    use crate::strategy::{build_strategy, StrategyExecutor};
    use crate::types::LockStatus;
    use rust_decimal_macros::dec;

    struct Fixture {
        broker: MockBroker,
        store: MemoryStore,
        clock: Arc<ManualClock>,
        shared: Arc<WorkerShared>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.universe = vec!["AAPL".into()];
        config.poll_interval_ms = 20;
        config.heartbeat_interval_ms = 50;
        config.lock_ttl_ms = 60_000;
        config.lock_renew_threshold_ms = 20_000;
        config.capital_limit_per_worker = dec!(1000);
        config.daily_loss_limit = dec!(500);
        config.quote_staleness_ms = 3_600_000;
        config
    }

    /// Manual clock pinned to today's real date so fill timestamps (which
    /// come from the wall clock) land on the summary's calendar day.
    fn clock_at(h: u32, m: u32) -> Arc<ManualClock> {
        let today = Utc::now().date_naive();
        let start = today.and_hms_opt(h, m, 0).expect("valid time").and_utc();
        Arc::new(ManualClock::new(start))
    }

    fn spawn_worker(config: Config, clock: Arc<ManualClock>) -> Fixture {
        let broker = MockBroker::new();
        let store = MemoryStore::new();

        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let broker_dyn: Arc<dyn BrokerPort> = Arc::new(broker.clone());
        let locks = Arc::new(LockService::new(Arc::new(store.clone()), clock_dyn.clone()));
        let lifecycle = Arc::new(WorkerLifecycleService::new(
            Arc::new(store.clone()),
            locks.clone(),
            clock_dyn.clone(),
        ));
        let notifier = Arc::new(Notifier::disabled());
        let orders = Arc::new(OrderService::new(
            Arc::new(store.clone()),
            broker_dyn.clone(),
            notifier.clone(),
            clock_dyn.clone(),
            "ACC1".into(),
        ));
        let summaries = Arc::new(DailySummaryService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            clock_dyn.clone(),
        ));
        let strategy = Arc::new(StrategyExecutor::new(
            build_strategy("momentum", &config.strategy_params).unwrap(),
            config.min_buy_confidence,
        ));

        let shared = Arc::new(WorkerShared::new("w1", clock.now()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker::new(
            "w1".into(),
            "ACC1".into(),
            config,
            WorkerServices {
                clock: clock_dyn,
                broker: broker_dyn,
                locks,
                lifecycle,
                orders,
                order_store: Arc::new(store.clone()),
                strategy,
                summaries,
                notifier,
            },
            shared.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(worker.run());

        Fixture {
            broker,
            store,
            clock,
            shared,
            shutdown_tx,
            handle,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(5);
        while !cond() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }

    fn liquid_quote(broker: &MockBroker, price: Decimal) {
        broker.set_quote("AAPL", price, 5_000_000, dec!(1000000000));
    }

    #[tokio::test]
    async fn clean_round_trip_through_take_profit() {
        let clock = clock_at(10, 0);
        let f = spawn_worker(test_config(), clock);
        liquid_quote(&f.broker, dec!(100));
        f.broker.set_cash(dec!(10000));
        f.broker.enable_auto_fill(None);

        // Entry: 1000 capital / 100 = 10 shares, filled at 100.
        wait_for("worker to hold AAPL", || {
            *f.shared.status.read() == WorkerStatus::Holding
        })
        .await;
        assert_eq!(f.shared.current_symbol.read().as_deref(), Some("AAPL"));

        let lock = crate::store::LockStore::get(&f.store, "AAPL")
            .await
            .unwrap()
            .expect("lock row");
        assert_eq!(lock.worker_id, "w1");
        assert_eq!(lock.status, LockStatus::Active);

        // Price reaches the default 3% take-profit; cash is pulled so the
        // scanner cannot immediately re-enter.
        f.broker.set_cash(dec!(0));
        liquid_quote(&f.broker, dec!(110));

        wait_for("position to close", || {
            *f.shared.status.read() == WorkerStatus::Scanning
        })
        .await;

        // Lock released, exactly two broker orders (one buy, one sell).
        let lock = crate::store::LockStore::get(&f.store, "AAPL")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.status, LockStatus::Expired);
        assert_eq!(f.broker.distinct_placements(), 2);

        // Shutdown writes the daily rollup.
        f.shutdown_tx.send(true).unwrap();
        f.handle.await.unwrap().unwrap();

        let summary = SummaryStore::get(&f.store, "w1", f.clock.now().date_naive())
            .await
            .unwrap()
            .expect("summary row");
        assert_eq!(summary.total_trades, 1);
        assert_eq!(summary.winning_trades, 1);
        assert_eq!(summary.net_pnl, dec!(100.0000));
        assert!((summary.win_rate - 1.0).abs() < f64::EPSILON);
        assert!(summary.profit_factor.is_infinite());
        assert_eq!(summary.max_drawdown, dec!(0));

        let worker_row = crate::store::WorkerStore::get(&f.store, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker_row.status, WorkerStatus::Terminated);
    }

    #[tokio::test]
    async fn forced_liquidation_inside_the_window() {
        let clock = clock_at(10, 0);
        let f = spawn_worker(test_config(), clock);
        liquid_quote(&f.broker, dec!(100));
        f.broker.set_cash(dec!(10000));
        f.broker.enable_auto_fill(None);

        wait_for("worker to hold AAPL", || {
            *f.shared.status.read() == WorkerStatus::Holding
        })
        .await;

        // Jump into the forced-exit window. The price never reached any
        // strategy exit; the FORCED signal must fire anyway.
        let today = Utc::now().date_naive();
        f.clock
            .set(today.and_hms_opt(15, 16, 0).unwrap().and_utc());

        wait_for("forced exit to flatten the position", || {
            *f.shared.status.read() == WorkerStatus::Scanning
        })
        .await;

        // Inside the window the scanner must not re-enter.
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        let buys = f
            .broker
            .placed()
            .iter()
            .filter(|r| r.side == Side::Buy)
            .count();
        assert_eq!(buys, 1, "no re-entry inside the liquidation window");

        let lock = crate::store::LockStore::get(&f.store, "AAPL")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.status, LockStatus::Expired);

        f.shutdown_tx.send(true).unwrap();
        f.handle.await.unwrap().unwrap();

        let summary = SummaryStore::get(&f.store, "w1", today)
            .await
            .unwrap()
            .expect("summary row");
        assert_eq!(summary.total_trades, 1);
        // Flat round trip: neither a win nor a loss.
        assert_eq!(summary.winning_trades, 0);
        assert_eq!(summary.losing_trades, 0);
        assert_eq!(summary.net_pnl, dec!(0.0000));
    }

    #[tokio::test]
    async fn shutdown_mid_hold_force_exits_and_summarises() {
        let clock = clock_at(10, 0);
        let f = spawn_worker(test_config(), clock);
        liquid_quote(&f.broker, dec!(100));
        f.broker.set_cash(dec!(10000));
        f.broker.enable_auto_fill(None);

        wait_for("worker to hold AAPL", || {
            *f.shared.status.read() == WorkerStatus::Holding
        })
        .await;

        f.shutdown_tx.send(true).unwrap();
        f.handle.await.unwrap().unwrap();

        // The EXITING path sold the position, released the lock, wrote the
        // summary, and terminated.
        let sells = f
            .broker
            .placed()
            .iter()
            .filter(|r| r.side == Side::Sell)
            .count();
        assert_eq!(sells, 1);

        let lock = crate::store::LockStore::get(&f.store, "AAPL")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.status, LockStatus::Expired);

        let worker_row = crate::store::WorkerStore::get(&f.store, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker_row.status, WorkerStatus::Terminated);
        assert!(worker_row.current_symbol.is_none());

        let summary = SummaryStore::get(&f.store, "w1", f.clock.now().date_naive())
            .await
            .unwrap();
        assert!(summary.is_some(), "summary persisted on stop");
    }

    #[test]
    fn renewal_threshold_check() {
        let now = Utc::now();
        let lock = StockLock {
            id: Uuid::new_v4(),
            symbol: "AAPL".into(),
            worker_id: "w1".into(),
            acquired_at: now,
            expires_at: now + Duration::seconds(90),
            heartbeat_at: now,
            status: LockStatus::Active,
            created_at: now,
            updated_at: now,
        };
        assert!(!needs_renewal(&lock, now, Duration::seconds(60)));
        assert!(needs_renewal(
            &lock,
            now + Duration::seconds(40),
            Duration::seconds(60)
        ));
    }

    #[test]
    fn snapshot_reflects_shared_state() {
        let now = Utc::now();
        let shared = WorkerShared::new("w1", now);
        *shared.status.write() = WorkerStatus::Holding;
        *shared.current_symbol.write() = Some("AAPL".into());

        let snap = shared.snapshot(now + Duration::seconds(30));
        assert_eq!(snap.worker_id, "w1");
        assert_eq!(snap.status, WorkerStatus::Holding);
        assert_eq!(snap.current_symbol.as_deref(), Some("AAPL"));
        assert_eq!(snap.uptime_secs, 30);
    }
}
