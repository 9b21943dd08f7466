//! Reservation manager
//!
//! Assigns, refreshes, and releases time-bounded exclusive leases. All
//! mutation goes through the store's conditional-update primitive; a lost
//! race against a concurrent caller moves on to the next candidate rather
//! than ever double-assigning a proxy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{NestError, Result};
use crate::models::{Proxy, ProxyFilter, Reservation};
use crate::store::{ProxyMutation, ProxyStore, UpdateOutcome};

/// Bound on transparent retries of store-level version conflicts.
const MAX_CAS_RETRIES: u32 = 5;

/// Reservation manager configuration
#[derive(Debug, Clone)]
pub struct ReservationManagerConfig {
    /// Lease time-to-live; an unrefreshed lease expires after this long.
    pub lease_ttl: Duration,
    /// How many lost assignment races to absorb before giving up.
    pub max_assign_retries: u32,
    /// Per-instance lease cap; 0 disables the limit.
    pub max_leases_per_instance: u32,
}

impl Default for ReservationManagerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(600),
            max_assign_retries: 3,
            max_leases_per_instance: 0,
        }
    }
}

/// Assigns, refreshes, and releases proxy leases.
pub struct ReservationManager {
    store: Arc<dyn ProxyStore>,
    config: ReservationManagerConfig,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn ProxyStore>, config: ReservationManagerConfig) -> Self {
        Self { store, config }
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600))
    }

    /// Reserve one eligible proxy for `instance_id`.
    ///
    /// Candidates are ordered healthiest first, then by lowest latency, then
    /// least recently used. An expired reservation counts as free. Losing a
    /// version race moves on to the next candidate up to the configured
    /// retry bound; exhaustion surfaces as `NoEligibleProxy`.
    #[instrument(skip(self, filter), fields(instance_id = %instance_id))]
    pub async fn reserve(&self, instance_id: &str, filter: &ProxyFilter) -> Result<Proxy> {
        let now = Utc::now();

        if self.config.max_leases_per_instance > 0 {
            let held = self.store.find_leased_by(instance_id, now).await?;
            if held.len() >= self.config.max_leases_per_instance as usize {
                return Err(NestError::LeaseLimitExceeded {
                    instance_id: instance_id.to_string(),
                    limit: self.config.max_leases_per_instance,
                });
            }
        }

        let mut candidates = self.store.find(filter).await?;
        candidates.retain(|p| !p.is_leased(now));
        rank_candidates(&mut candidates);

        let reservation = Reservation {
            instance_id: instance_id.to_string(),
            leased_at: now,
            expires_at: now + self.ttl(),
        };

        let mut conflicts = 0u32;
        for candidate in candidates {
            if conflicts > self.config.max_assign_retries {
                break;
            }

            let outcome = self
                .store
                .conditional_update(
                    candidate.id,
                    candidate.version,
                    ProxyMutation::InstallReservation(reservation.clone()),
                )
                .await?;

            match outcome {
                UpdateOutcome::Applied(proxy) => {
                    info!(
                        proxy_id = %proxy.id,
                        address = %proxy.socket_addr(),
                        expires_at = %reservation.expires_at,
                        "Reserved proxy"
                    );
                    return Ok(proxy);
                }
                UpdateOutcome::VersionConflict => {
                    conflicts += 1;
                    debug!(proxy_id = %candidate.id, "Lost assignment race, trying next candidate");
                }
                UpdateOutcome::Missing => {
                    debug!(proxy_id = %candidate.id, "Candidate deleted concurrently, trying next");
                }
            }
        }

        Err(NestError::NoEligibleProxy)
    }

    /// Extend the lease on `proxy_id` to `now + TTL`, owner only.
    #[instrument(skip(self), fields(proxy_id = %proxy_id, instance_id = %instance_id))]
    pub async fn refresh(&self, proxy_id: Uuid, instance_id: &str) -> Result<Proxy> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = Utc::now();
            let proxy = self
                .store
                .get(proxy_id)
                .await?
                .ok_or(NestError::ProxyNotFound { id: proxy_id })?;

            let reservation = proxy
                .active_reservation(now)
                .ok_or(NestError::NoActiveReservation { proxy_id })?;

            if reservation.instance_id != instance_id {
                return Err(NestError::NotOwner {
                    proxy_id,
                    instance_id: instance_id.to_string(),
                });
            }

            let outcome = self
                .store
                .conditional_update(
                    proxy_id,
                    proxy.version,
                    ProxyMutation::ExtendReservation {
                        expires_at: now + self.ttl(),
                    },
                )
                .await?;

            match outcome {
                UpdateOutcome::Applied(updated) => {
                    debug!(
                        expires_at = ?updated.reservation.as_ref().map(|r| r.expires_at),
                        "Refreshed lease"
                    );
                    return Ok(updated);
                }
                // Lost a race; re-read and re-check ownership from scratch.
                UpdateOutcome::VersionConflict => continue,
                UpdateOutcome::Missing => {
                    return Err(NestError::ProxyNotFound { id: proxy_id })
                }
            }
        }

        Err(NestError::StoreUnavailable(format!(
            "persistent version conflicts refreshing proxy {proxy_id}"
        )))
    }

    /// Release the lease on one proxy.
    ///
    /// Idempotent: releasing an already-released (or expired) lease is a
    /// no-op success. Returns whether a reservation was actually cleared.
    #[instrument(skip(self), fields(proxy_id = %proxy_id, instance_id = %instance_id))]
    pub async fn release(&self, proxy_id: Uuid, instance_id: &str) -> Result<bool> {
        for _ in 0..MAX_CAS_RETRIES {
            let now = Utc::now();
            let proxy = self
                .store
                .get(proxy_id)
                .await?
                .ok_or(NestError::ProxyNotFound { id: proxy_id })?;

            let reservation = match proxy.reservation.as_ref() {
                None => return Ok(false),
                // Logically released already; the reaper owns the cleanup.
                Some(r) if r.is_expired(now) => return Ok(false),
                Some(r) => r,
            };

            if reservation.instance_id != instance_id {
                return Err(NestError::NotOwner {
                    proxy_id,
                    instance_id: instance_id.to_string(),
                });
            }

            let outcome = self
                .store
                .conditional_update(proxy_id, proxy.version, ProxyMutation::ClearReservation)
                .await?;

            match outcome {
                UpdateOutcome::Applied(_) => {
                    info!("Released proxy lease");
                    return Ok(true);
                }
                UpdateOutcome::VersionConflict => continue,
                UpdateOutcome::Missing => return Ok(false),
            }
        }

        Err(NestError::StoreUnavailable(format!(
            "persistent version conflicts releasing proxy {proxy_id}"
        )))
    }

    /// Release every lease held by `instance_id`. Returns the cleared ids.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn release_all(&self, instance_id: &str) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let held = self.store.find_leased_by(instance_id, now).await?;

        let mut cleared = Vec::with_capacity(held.len());
        for proxy in held {
            match self.release(proxy.id, instance_id).await {
                Ok(true) => cleared.push(proxy.id),
                Ok(false) => {}
                // Ownership changed between find and release; someone else
                // holds it now, which is a successful release from our side.
                Err(NestError::NotOwner { .. }) => {}
                Err(NestError::ProxyNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(count = cleared.len(), "Released all leases for instance");
        Ok(cleared)
    }

    /// Unconditionally clear every reservation in the pool.
    ///
    /// Administrative escape hatch; last writer wins.
    #[instrument(skip(self))]
    pub async fn reset_all(&self) -> Result<u64> {
        let cleared = self.store.reset_all_reservations().await?;
        info!(count = cleared, "Reset all reservations");
        Ok(cleared)
    }
}

/// Order candidates: healthiest first, then lowest latency, then least
/// recently used (never-leased before everything else) to spread load.
fn rank_candidates(candidates: &mut [Proxy]) {
    candidates.sort_by(|a, b| {
        a.health_status
            .selection_rank()
            .cmp(&b.health_status.selection_rank())
            .then_with(|| {
                a.latency_ms
                    .unwrap_or(i32::MAX)
                    .cmp(&b.latency_ms.unwrap_or(i32::MAX))
            })
            .then_with(|| cmp_last_leased(a.last_leased_at, b.last_leased_at))
    });
}

// Option's derived ordering already puts None (never leased) first.
fn cmp_last_leased(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthStatus, ProxyProtocol};
    use crate::store::MemoryProxyStore;
    use chrono::Duration as ChronoDuration;

    fn proxy(address: &str, status: HealthStatus) -> Proxy {
        let mut p = Proxy::new(address, 3128, ProxyProtocol::Http);
        p.health_status = status;
        p
    }

    fn manager(store: Arc<MemoryProxyStore>) -> ReservationManager {
        ReservationManager::new(
            store,
            ReservationManagerConfig {
                lease_ttl: Duration::from_secs(60),
                max_assign_retries: 3,
                max_leases_per_instance: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_reserve_installs_reservation_with_ttl() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = manager(store.clone());

        let before = Utc::now();
        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();

        let res = leased.reservation.expect("reservation installed");
        assert_eq!(res.instance_id, "scraper-a");
        assert!(res.expires_at >= before + ChronoDuration::seconds(59));
        assert!(res.expires_at <= Utc::now() + ChronoDuration::seconds(61));
        assert_eq!(leased.last_leased_at, Some(res.leased_at));
    }

    #[tokio::test]
    async fn test_reserve_exactly_one_winner_for_single_eligible_proxy() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = Arc::new(manager(store));

        let filter = ProxyFilter::any();
        let (a, b) = tokio::join!(
            mgr.reserve("instance-a", &filter),
            mgr.reserve("instance-b", &filter),
        );

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one concurrent reserve must win");

        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(NestError::NoEligibleProxy)));
    }

    #[tokio::test]
    async fn test_reserve_healthy_filter_over_mixed_pool() {
        // Pool of 3, only one healthy; two instances race with a healthy
        // filter: one wins the healthy proxy, the other gets nothing.
        let store = Arc::new(MemoryProxyStore::with_proxies([
            proxy("10.0.0.1", HealthStatus::Degraded),
            proxy("10.0.0.2", HealthStatus::Healthy),
            proxy("10.0.0.3", HealthStatus::Unreachable),
        ]));
        let mgr = Arc::new(manager(store));

        let filter = ProxyFilter::healthy();
        let (a, b) = tokio::join!(mgr.reserve("A", &filter), mgr.reserve("B", &filter));

        let winners: Vec<_> = [a, b].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_reserve_prefers_healthy_then_latency_then_lru() {
        let now = Utc::now();

        let mut degraded = proxy("10.0.0.1", HealthStatus::Degraded);
        degraded.latency_ms = Some(5);

        let mut healthy_slow = proxy("10.0.0.2", HealthStatus::Healthy);
        healthy_slow.latency_ms = Some(200);

        let mut healthy_fast_recent = proxy("10.0.0.3", HealthStatus::Healthy);
        healthy_fast_recent.latency_ms = Some(50);
        healthy_fast_recent.last_leased_at = Some(now);

        let mut healthy_fast_stale = proxy("10.0.0.4", HealthStatus::Healthy);
        healthy_fast_stale.latency_ms = Some(50);
        healthy_fast_stale.last_leased_at = Some(now - ChronoDuration::hours(2));

        let mut candidates = vec![
            degraded.clone(),
            healthy_slow.clone(),
            healthy_fast_recent.clone(),
            healthy_fast_stale.clone(),
        ];
        rank_candidates(&mut candidates);

        assert_eq!(candidates[0].address, "10.0.0.4"); // healthy, fast, least recent
        assert_eq!(candidates[1].address, "10.0.0.3"); // healthy, fast, recent
        assert_eq!(candidates[2].address, "10.0.0.2"); // healthy, slow
        assert_eq!(candidates[3].address, "10.0.0.1"); // degraded

        // Never-leased sorts before any leased timestamp.
        let mut never = proxy("10.0.0.5", HealthStatus::Healthy);
        never.latency_ms = Some(50);
        let mut candidates = vec![healthy_fast_stale, never];
        rank_candidates(&mut candidates);
        assert_eq!(candidates[0].address, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_reserve_treats_expired_reservation_as_free() {
        let now = Utc::now();
        let mut p = proxy("10.0.0.1", HealthStatus::Healthy);
        p.reservation = Some(Reservation {
            instance_id: "ghost".to_string(),
            leased_at: now - ChronoDuration::seconds(120),
            expires_at: now - ChronoDuration::seconds(30),
        });

        let store = Arc::new(MemoryProxyStore::with_proxies([p]));
        let mgr = manager(store);

        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();
        assert_eq!(
            leased.reservation.as_ref().unwrap().instance_id,
            "scraper-a"
        );
    }

    #[tokio::test]
    async fn test_reserve_no_eligible_proxy() {
        let store = Arc::new(MemoryProxyStore::new());
        let mgr = manager(store);

        let err = mgr
            .reserve("scraper-a", &ProxyFilter::any())
            .await
            .unwrap_err();
        assert!(matches!(err, NestError::NoEligibleProxy));
    }

    #[tokio::test]
    async fn test_reserve_enforces_per_instance_limit() {
        let store = Arc::new(MemoryProxyStore::with_proxies([
            proxy("10.0.0.1", HealthStatus::Healthy),
            proxy("10.0.0.2", HealthStatus::Healthy),
        ]));
        let mgr = ReservationManager::new(
            store,
            ReservationManagerConfig {
                lease_ttl: Duration::from_secs(60),
                max_assign_retries: 3,
                max_leases_per_instance: 1,
            },
        );

        mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();

        let err = mgr
            .reserve("scraper-a", &ProxyFilter::any())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NestError::LeaseLimitExceeded { limit: 1, .. }
        ));

        // A different instance is unaffected.
        mgr.reserve("scraper-b", &ProxyFilter::any()).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry_for_owner() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = manager(store.clone());

        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();
        let first_expiry = leased.reservation.as_ref().unwrap().expires_at;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let refreshed = mgr.refresh(leased.id, "scraper-a").await.unwrap();
        let second_expiry = refreshed.reservation.as_ref().unwrap().expires_at;
        assert!(second_expiry > first_expiry);
    }

    #[tokio::test]
    async fn test_refresh_by_non_owner_fails_without_mutating() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = manager(store.clone());

        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();

        let err = mgr.refresh(leased.id, "scraper-b").await.unwrap_err();
        assert!(matches!(err, NestError::NotOwner { .. }));

        let current = store.get(leased.id).await.unwrap().unwrap();
        assert_eq!(current.version, leased.version);
        assert_eq!(
            current.reservation.unwrap().expires_at,
            leased.reservation.unwrap().expires_at
        );
    }

    #[tokio::test]
    async fn test_refresh_without_reservation_fails() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let id = store.list().await.unwrap()[0].id;
        let mgr = manager(store);

        let err = mgr.refresh(id, "scraper-a").await.unwrap_err();
        assert!(matches!(err, NestError::NoActiveReservation { .. }));
    }

    #[tokio::test]
    async fn test_refresh_expired_reservation_counts_as_absent() {
        let now = Utc::now();
        let mut p = proxy("10.0.0.1", HealthStatus::Healthy);
        p.reservation = Some(Reservation {
            instance_id: "scraper-a".to_string(),
            leased_at: now - ChronoDuration::seconds(120),
            expires_at: now - ChronoDuration::seconds(30),
        });
        let id = p.id;

        let store = Arc::new(MemoryProxyStore::with_proxies([p]));
        let mgr = manager(store);

        let err = mgr.refresh(id, "scraper-a").await.unwrap_err();
        assert!(matches!(err, NestError::NoActiveReservation { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = manager(store.clone());

        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();

        assert!(mgr.release(leased.id, "scraper-a").await.unwrap());
        let current = store.get(leased.id).await.unwrap().unwrap();
        assert!(current.reservation.is_none());

        // Second release: no-op success, no mutation.
        assert!(!mgr.release(leased.id, "scraper-a").await.unwrap());
        let after = store.get(leased.id).await.unwrap().unwrap();
        assert_eq!(after.version, current.version);
    }

    #[tokio::test]
    async fn test_release_by_non_owner_fails() {
        let store = Arc::new(MemoryProxyStore::with_proxies([proxy(
            "10.0.0.1",
            HealthStatus::Healthy,
        )]));
        let mgr = manager(store);

        let leased = mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();

        let err = mgr.release(leased.id, "scraper-b").await.unwrap_err();
        assert!(matches!(err, NestError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_release_all_clears_only_this_instance() {
        let store = Arc::new(MemoryProxyStore::with_proxies([
            proxy("10.0.0.1", HealthStatus::Healthy),
            proxy("10.0.0.2", HealthStatus::Healthy),
            proxy("10.0.0.3", HealthStatus::Healthy),
        ]));
        let mgr = manager(store.clone());

        mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();
        mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();
        let other = mgr.reserve("scraper-b", &ProxyFilter::any()).await.unwrap();

        let cleared = mgr.release_all("scraper-a").await.unwrap();
        assert_eq!(cleared.len(), 2);

        let now = Utc::now();
        assert!(store
            .find_leased_by("scraper-a", now)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .get(other.id)
            .await
            .unwrap()
            .unwrap()
            .is_leased_by("scraper-b", now));

        // Idempotent.
        assert!(mgr.release_all("scraper-a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_all_clears_every_reservation() {
        let store = Arc::new(MemoryProxyStore::with_proxies([
            proxy("10.0.0.1", HealthStatus::Healthy),
            proxy("10.0.0.2", HealthStatus::Healthy),
        ]));
        let mgr = manager(store.clone());

        mgr.reserve("scraper-a", &ProxyFilter::any()).await.unwrap();
        mgr.reserve("scraper-b", &ProxyFilter::any()).await.unwrap();

        assert_eq!(mgr.reset_all().await.unwrap(), 2);

        let now = Utc::now();
        for p in store.list().await.unwrap() {
            assert!(!p.is_leased(now));
        }
    }
}
