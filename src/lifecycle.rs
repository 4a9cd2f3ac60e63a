// =============================================================================
// Worker Lifecycle Service — registration, status transitions, stale reaping
// =============================================================================
//
// Tracks which workers are alive and what they are doing. Transition rules:
// moves must follow the worker state graph, HOLDING always carries a symbol,
// and leaving HOLDING clears it. The reaper releases a dead worker's locks
// first and only then marks it TERMINATED, so no phantom ownership survives.
// =============================================================================

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, TradeError};
use crate::lock::LockService;
use crate::store::WorkerStore;
use crate::types::{WorkerProcess, WorkerStatus};

pub struct WorkerLifecycleService {
    workers: Arc<dyn WorkerStore>,
    locks: Arc<LockService>,
    clock: Arc<dyn Clock>,
}

impl WorkerLifecycleService {
    pub fn new(
        workers: Arc<dyn WorkerStore>,
        locks: Arc<LockService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workers,
            locks,
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register `worker_id` in status IDLE. A TERMINATED row with the same id
    /// is overwritten; a live one is rejected.
    pub async fn start(&self, worker_id: &str) -> Result<WorkerProcess> {
        let now = self.clock.now();
        let worker = WorkerProcess {
            worker_id: worker_id.to_string(),
            status: WorkerStatus::Idle,
            current_symbol: None,
            started_at: now,
            last_heartbeat_at: now,
            created_at: now,
            updated_at: now,
        };

        if !self.workers.register(&worker).await? {
            return Err(TradeError::Invariant(format!(
                "worker '{worker_id}' is already registered and not terminated"
            )));
        }

        info!(worker_id, "worker registered");
        Ok(worker)
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Move `worker_id` to `new_status`, enforcing the state graph and the
    /// HOLDING/current_symbol invariant.
    pub async fn transition(
        &self,
        worker_id: &str,
        new_status: WorkerStatus,
        current_symbol: Option<&str>,
    ) -> Result<WorkerProcess> {
        let current = self
            .workers
            .get(worker_id)
            .await?
            .ok_or_else(|| TradeError::Invariant(format!("unknown worker '{worker_id}'")))?;

        if !current.status.can_transition_to(new_status) {
            return Err(TradeError::Invariant(format!(
                "illegal worker transition {} -> {} for '{worker_id}'",
                current.status, new_status
            )));
        }
        if new_status == WorkerStatus::Holding && current_symbol.is_none() {
            return Err(TradeError::Invariant(format!(
                "transition to HOLDING without a symbol for '{worker_id}'"
            )));
        }

        // Symbol travels only with HOLDING; every other state clears it.
        let symbol = if new_status == WorkerStatus::Holding {
            current_symbol
        } else {
            None
        };

        let now = self.clock.now();
        let changed = self
            .workers
            .set_status(worker_id, current.status, new_status, symbol, now)
            .await?;
        if !changed {
            // Someone (most likely the reaper) moved the row underneath us.
            return Err(TradeError::Invariant(format!(
                "worker '{worker_id}' transitioned concurrently"
            )));
        }

        debug!(worker_id, from = %current.status, to = %new_status, "worker transition");

        Ok(WorkerProcess {
            status: new_status,
            current_symbol: symbol.map(str::to_string),
            updated_at: now,
            ..current
        })
    }

    /// Update `last_heartbeat_at`; no state effect. False when the worker is
    /// gone or terminated.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<bool> {
        self.workers
            .touch_heartbeat(worker_id, self.clock.now())
            .await
    }

    /// Terminate on clean stop, clearing `current_symbol`.
    pub async fn stop(&self, worker_id: &str) -> Result<()> {
        let Some(current) = self.workers.get(worker_id).await? else {
            return Ok(());
        };
        if current.status == WorkerStatus::Terminated {
            return Ok(());
        }
        self.workers
            .set_status(
                worker_id,
                current.status,
                WorkerStatus::Terminated,
                None,
                self.clock.now(),
            )
            .await?;
        info!(worker_id, "worker terminated");
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerProcess>> {
        self.workers.get(worker_id).await
    }

    // -------------------------------------------------------------------------
    // Stale reaping
    // -------------------------------------------------------------------------

    /// Reap every worker whose heartbeat is older than `threshold`: release
    /// its locks, then mark it TERMINATED. Idempotent and safe to run from
    /// many workers concurrently.
    pub async fn cleanup_stale_workers(&self, threshold: Duration) -> Result<u32> {
        let cutoff = self.clock.now() - threshold;
        let stale = self.workers.list_stale(cutoff).await?;
        let mut reaped = 0;

        for worker in stale {
            warn!(
                worker_id = %worker.worker_id,
                status = %worker.status,
                last_heartbeat_at = %worker.last_heartbeat_at,
                "reaping stale worker"
            );

            // Locks first: if we die between the two steps, the worker row
            // stays reapable and the next sweep finishes the job.
            self.locks.expire_worker_locks(&worker.worker_id).await?;

            let changed = self
                .workers
                .set_status(
                    &worker.worker_id,
                    worker.status,
                    WorkerStatus::Terminated,
                    None,
                    self.clock.now(),
                )
                .await?;
            if changed {
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!(reaped, "stale workers terminated");
        }
        Ok(reaped)
    }
}

impl std::fmt::Debug for WorkerLifecycleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLifecycleService").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn setup() -> (WorkerLifecycleService, Arc<LockService>, Arc<ManualClock>) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        let locks = Arc::new(LockService::new(Arc::new(store.clone()), clock.clone()));
        let lifecycle =
            WorkerLifecycleService::new(Arc::new(store), locks.clone(), clock.clone());
        (lifecycle, locks, clock)
    }

    #[tokio::test]
    async fn start_registers_idle_worker() {
        let (lifecycle, _, _) = setup();
        let worker = lifecycle.start("w1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.current_symbol.is_none());
    }

    #[tokio::test]
    async fn duplicate_live_registration_is_rejected() {
        let (lifecycle, _, _) = setup();
        lifecycle.start("w1").await.unwrap();
        assert!(lifecycle.start("w1").await.is_err());

        // After termination the id is reusable.
        lifecycle.stop("w1").await.unwrap();
        assert!(lifecycle.start("w1").await.is_ok());
    }

    #[tokio::test]
    async fn holding_requires_symbol_and_clears_on_exit() {
        let (lifecycle, _, _) = setup();
        lifecycle.start("w1").await.unwrap();
        lifecycle
            .transition("w1", WorkerStatus::Scanning, None)
            .await
            .unwrap();

        // No symbol — rejected.
        assert!(lifecycle
            .transition("w1", WorkerStatus::Holding, None)
            .await
            .is_err());

        let holding = lifecycle
            .transition("w1", WorkerStatus::Holding, Some("AAPL"))
            .await
            .unwrap();
        assert_eq!(holding.current_symbol.as_deref(), Some("AAPL"));

        let scanning = lifecycle
            .transition("w1", WorkerStatus::Scanning, None)
            .await
            .unwrap();
        assert!(scanning.current_symbol.is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (lifecycle, _, _) = setup();
        lifecycle.start("w1").await.unwrap();

        // IDLE cannot jump straight to HOLDING.
        assert!(lifecycle
            .transition("w1", WorkerStatus::Holding, Some("AAPL"))
            .await
            .is_err());

        lifecycle.stop("w1").await.unwrap();
        assert!(lifecycle
            .transition("w1", WorkerStatus::Scanning, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn heartbeat_touches_live_workers_only() {
        let (lifecycle, _, clock) = setup();
        lifecycle.start("w1").await.unwrap();

        clock.advance_secs(30);
        assert!(lifecycle.heartbeat("w1").await.unwrap());
        let worker = lifecycle.get("w1").await.unwrap().unwrap();
        assert_eq!(worker.last_heartbeat_at, clock.now());

        lifecycle.stop("w1").await.unwrap();
        assert!(!lifecycle.heartbeat("w1").await.unwrap());
    }

    #[tokio::test]
    async fn stale_worker_reap_releases_locks_then_terminates() {
        let (lifecycle, locks, clock) = setup();
        lifecycle.start("w1").await.unwrap();
        lifecycle
            .transition("w1", WorkerStatus::Scanning, None)
            .await
            .unwrap();
        lifecycle
            .transition("w1", WorkerStatus::Holding, Some("AAPL"))
            .await
            .unwrap();
        locks
            .acquire("AAPL", "w1", Duration::seconds(600))
            .await
            .unwrap();

        // w2 keeps beating; w1 goes silent.
        lifecycle.start("w2").await.unwrap();
        clock.advance_secs(95);
        lifecycle.heartbeat("w2").await.unwrap();

        let reaped = lifecycle
            .cleanup_stale_workers(Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let worker = lifecycle.get("w1").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Terminated);

        // The lock was released even though its own TTL had not elapsed.
        let lock = locks.get_lock("AAPL").await.unwrap().unwrap();
        assert_eq!(lock.status, crate::types::LockStatus::Expired);

        // And the symbol is immediately available again.
        assert!(locks.acquire("AAPL", "w2", Duration::seconds(600)).await.is_ok());
    }

    #[tokio::test]
    async fn reap_is_idempotent() {
        let (lifecycle, _, clock) = setup();
        lifecycle.start("w1").await.unwrap();
        clock.advance_secs(100);

        assert_eq!(
            lifecycle
                .cleanup_stale_workers(Duration::seconds(90))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            lifecycle
                .cleanup_stale_workers(Duration::seconds(90))
                .await
                .unwrap(),
            0
        );
    }
}
