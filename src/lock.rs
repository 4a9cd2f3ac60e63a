// =============================================================================
// Lock Service — exclusive per-symbol ownership with TTL recovery
// =============================================================================
//
// At any instant at most one worker holds each symbol, and a crashed holder
// needs no manual intervention: its lock ages past the TTL and the sweeper
// (or the next acquirer) reclaims it. Correctness rests on the store's atomic
// conditional upsert keyed on UNIQUE(symbol); no in-process mutex can stand
// in for it. Lock conflicts are not retried here — the caller moves on to the
// next candidate.
// =============================================================================

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, TradeError};
use crate::store::LockStore;
use crate::types::{LockStatus, StockLock};

pub struct LockService {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    // -------------------------------------------------------------------------
    // Acquire
    // -------------------------------------------------------------------------

    /// Try to take ownership of `symbol` for `worker_id` with the given TTL.
    ///
    /// Re-acquiring a symbol this worker already owns is idempotent and
    /// renews the TTL. Whichever worker's conditional insert commits first
    /// wins; losers get `LockAcquisition` with the current holder.
    pub async fn acquire(
        &self,
        symbol: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<StockLock> {
        // Best-effort sweep so an overdue row does not shadow the insert.
        if let Err(e) = self.store.expire_overdue(self.clock.now()).await {
            warn!(error = %e, "pre-acquire expiry sweep failed — continuing");
        }

        let now = self.clock.now();
        let attempt = StockLock {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            worker_id: worker_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            heartbeat_at: now,
            status: LockStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.try_acquire(&attempt).await?;

        // Read back: the row tells us who actually won.
        match self.store.get(symbol).await? {
            Some(lock) if lock.status == LockStatus::Active && lock.worker_id == worker_id => {
                info!(
                    symbol,
                    worker_id,
                    expires_at = %lock.expires_at,
                    "lock acquired"
                );
                Ok(lock)
            }
            Some(lock) => {
                debug!(symbol, worker_id, holder = %lock.worker_id, "lock contention");
                Err(TradeError::LockAcquisition {
                    symbol: symbol.to_string(),
                    holder: lock.worker_id,
                })
            }
            None => Err(TradeError::LockAcquisition {
                symbol: symbol.to_string(),
                holder: "<unknown>".to_string(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Release / renew / heartbeat
    // -------------------------------------------------------------------------

    /// Release `symbol` iff owned by `worker_id`. A foreign or missing
    /// release is not an error: it returns false and logs at warn.
    pub async fn release(&self, symbol: &str, worker_id: &str) -> Result<bool> {
        let released = self
            .store
            .release(symbol, worker_id, self.clock.now())
            .await?;
        if released {
            info!(symbol, worker_id, "lock released");
        } else {
            warn!(symbol, worker_id, "release ignored — lock not held by this worker");
        }
        Ok(released)
    }

    /// Extend the TTL by `ttl` from now and refresh the heartbeat.
    pub async fn renew(&self, symbol: &str, worker_id: &str, ttl: Duration) -> Result<StockLock> {
        let now = self.clock.now();
        match self.store.renew(symbol, worker_id, now + ttl, now).await? {
            Some(lock) => {
                debug!(symbol, worker_id, expires_at = %lock.expires_at, "lock renewed");
                Ok(lock)
            }
            None => {
                // Distinguish "preempted by expiry" from "never ours".
                match self.store.get(symbol).await? {
                    Some(lock) if lock.worker_id == worker_id => {
                        warn!(symbol, worker_id, "renew failed — lock expired");
                        Err(TradeError::LockExpired {
                            symbol: symbol.to_string(),
                        })
                    }
                    _ => Err(TradeError::LockNotFound {
                        symbol: symbol.to_string(),
                        worker_id: worker_id.to_string(),
                    }),
                }
            }
        }
    }

    /// Refresh `heartbeat_at` only; the TTL is untouched. False when the
    /// lock is no longer held.
    pub async fn heartbeat(&self, symbol: &str, worker_id: &str) -> Result<bool> {
        self.store
            .touch_heartbeat(symbol, worker_id, self.clock.now())
            .await
    }

    // -------------------------------------------------------------------------
    // Sweeping & reads
    // -------------------------------------------------------------------------

    /// Mark every overdue ACTIVE lock as EXPIRED. Safe to run from any number
    /// of workers concurrently.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let expired = self.store.expire_overdue(self.clock.now()).await?;
        if expired > 0 {
            info!(expired, "expired stale locks");
        }
        Ok(expired)
    }

    /// Expire every ACTIVE lock owned by `worker_id` (stale-worker reap).
    pub async fn expire_worker_locks(&self, worker_id: &str) -> Result<u64> {
        let expired = self
            .store
            .expire_for_worker(worker_id, self.clock.now())
            .await?;
        if expired > 0 {
            info!(worker_id, expired, "released locks of reaped worker");
        }
        Ok(expired)
    }

    pub async fn get_lock(&self, symbol: &str) -> Result<Option<StockLock>> {
        self.store.get(symbol).await
    }

    pub async fn list_active_locks(&self) -> Result<Vec<StockLock>> {
        self.store.list_active().await
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService").finish()
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

    fn service() -> (LockService, Arc<ManualClock>, MemoryStore) {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        let service = LockService::new(Arc::new(store.clone()), clock.clone());
        (service, clock, store)
    }

    fn ttl() -> Duration {
        Duration::seconds(300)
    }

    #[tokio::test]
    async fn acquire_then_read_back() {
        let (service, clock, _) = service();
        let lock = service.acquire("AAPL", "w1", ttl()).await.unwrap();
        assert_eq!(lock.worker_id, "w1");
        assert_eq!(lock.status, LockStatus::Active);
        assert_eq!(lock.expires_at, clock.now() + ttl());

        let read = service.get_lock("AAPL").await.unwrap().unwrap();
        assert_eq!(read.worker_id, "w1");
    }

    #[tokio::test]
    async fn contention_exactly_one_winner() {
        let (service, _, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();

        let err = service.acquire("AAPL", "w2", ttl()).await.unwrap_err();
        match err {
            TradeError::LockAcquisition { symbol, holder } => {
                assert_eq!(symbol, "AAPL");
                assert_eq!(holder, "w1");
            }
            other => panic!("expected LockAcquisition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_acquire_single_winner() {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap(),
        ));
        let service = Arc::new(LockService::new(Arc::new(store.clone()), clock));

        let mut handles = Vec::new();
        for i in 0..8 {
            let s = service.clone();
            handles.push(tokio::spawn(async move {
                s.acquire("AAPL", &format!("w{i}"), Duration::seconds(300))
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one of N contenders wins");

        let active = service.list_active_locks().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn reacquire_by_owner_renews_ttl() {
        let (service, clock, _) = service();
        let first = service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(100);
        let second = service.acquire("AAPL", "w1", ttl()).await.unwrap();
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.worker_id, "w1");
    }

    #[tokio::test]
    async fn release_then_anyone_can_acquire() {
        let (service, _, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();
        assert!(service.release("AAPL", "w1").await.unwrap());

        let lock = service.acquire("AAPL", "w2", ttl()).await.unwrap();
        assert_eq!(lock.worker_id, "w2");
    }

    #[tokio::test]
    async fn foreign_release_is_ignored() {
        let (service, _, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();

        assert!(!service.release("AAPL", "w2").await.unwrap());
        // Still held by w1.
        let lock = service.get_lock("AAPL").await.unwrap().unwrap();
        assert_eq!(lock.worker_id, "w1");
        assert_eq!(lock.status, LockStatus::Active);
    }

    #[tokio::test]
    async fn renew_extends_expiry_and_heartbeat() {
        let (service, clock, _) = service();
        let lock = service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(120);
        let renewed = service.renew("AAPL", "w1", ttl()).await.unwrap();
        assert!(renewed.expires_at >= lock.expires_at + Duration::seconds(120));
        assert_eq!(renewed.heartbeat_at, clock.now());
        assert_eq!(renewed.expires_at, clock.now() + ttl());
    }

    #[tokio::test]
    async fn renew_after_expiry_raises_lock_expired() {
        let (service, clock, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(301);
        let err = service.renew("AAPL", "w1", ttl()).await.unwrap_err();
        assert!(matches!(err, TradeError::LockExpired { .. }));
    }

    #[tokio::test]
    async fn renew_unowned_raises_not_found() {
        let (service, _, _) = service();
        let err = service.renew("AAPL", "w1", ttl()).await.unwrap_err();
        assert!(matches!(err, TradeError::LockNotFound { .. }));

        service.acquire("AAPL", "w1", ttl()).await.unwrap();
        let err = service.renew("AAPL", "w2", ttl()).await.unwrap_err();
        assert!(matches!(err, TradeError::LockNotFound { .. }));
    }

    #[tokio::test]
    async fn heartbeat_updates_without_extending_ttl() {
        let (service, clock, _) = service();
        let lock = service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(60);
        assert!(service.heartbeat("AAPL", "w1").await.unwrap());

        let read = service.get_lock("AAPL").await.unwrap().unwrap();
        assert_eq!(read.heartbeat_at, clock.now());
        assert_eq!(read.expires_at, lock.expires_at, "TTL untouched");

        assert!(!service.heartbeat("AAPL", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn sweeper_reclaims_crashed_holder() {
        // A worker dies mid-hold; after the TTL the sweeper expires the lock
        // and a fresh worker takes the symbol.
        let (service, clock, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(330);
        let expired = service.cleanup_expired().await.unwrap();
        assert_eq!(expired, 1);

        let lock = service.get_lock("AAPL").await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Expired);

        let fresh = service.acquire("AAPL", "w2", ttl()).await.unwrap();
        assert_eq!(fresh.worker_id, "w2");
    }

    #[tokio::test]
    async fn overdue_lock_is_reclaimable_even_without_sweep() {
        // The acquire path runs its own best-effort sweep first.
        let (service, clock, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();

        clock.advance_secs(301);
        let lock = service.acquire("AAPL", "w2", ttl()).await.unwrap();
        assert_eq!(lock.worker_id, "w2");
    }

    #[tokio::test]
    async fn expire_worker_locks_releases_everything_owned() {
        let (service, _, _) = service();
        service.acquire("AAPL", "w1", ttl()).await.unwrap();
        service.acquire("MSFT", "w1", ttl()).await.unwrap();
        service.acquire("NVDA", "w2", ttl()).await.unwrap();

        let released = service.expire_worker_locks("w1").await.unwrap();
        assert_eq!(released, 2);

        let active = service.list_active_locks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].worker_id, "w2");
    }
}
