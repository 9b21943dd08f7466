//! Health checking for pool proxies
//!
//! Periodically probes every proxy with bounded concurrency and folds the
//! outcomes into the four-state health model with hysteresis: one failure
//! demotes Healthy to Degraded, a run of consecutive failures past the
//! threshold demotes Degraded to Unreachable, and a single success restores
//! Healthy immediately. Failing proxies are re-probed on an exponential
//! backoff rather than every cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{HealthStatus, Proxy};
use crate::probe::ProxyProbe;
use crate::store::{ProxyMutation, ProxyStore, UpdateOutcome};

/// Health checker configuration
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Interval between full-pool sweeps.
    pub check_interval: Duration,
    /// Consecutive failures before Degraded becomes Unreachable.
    pub failure_threshold: u32,
    /// Base delay of the per-proxy probe backoff after a failure.
    pub backoff_base: Duration,
    /// Cap on the per-proxy probe backoff.
    pub backoff_max: Duration,
    /// Scan page size.
    pub batch_size: usize,
    /// Concurrent probes per sweep (additionally bounded by the shared
    /// scheduler semaphore).
    pub workers: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(600),
            batch_size: 200,
            workers: 16,
        }
    }
}

/// Per-proxy consecutive failure tracking.
#[derive(Debug, Clone, Copy)]
struct FailureStreak {
    consecutive: u32,
    retry_after: DateTime<Utc>,
}

/// Health checker for pool proxies
pub struct HealthChecker {
    store: Arc<dyn ProxyStore>,
    probe: Arc<dyn ProxyProbe>,
    limiter: Arc<Semaphore>,
    config: HealthCheckerConfig,
    streaks: DashMap<Uuid, FailureStreak>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        probe: Arc<dyn ProxyProbe>,
        limiter: Arc<Semaphore>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            store,
            probe,
            limiter,
            config,
            streaks: DashMap::new(),
        }
    }

    /// Run the health checker (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            failure_threshold = self.config.failure_threshold,
            "Starting health checker"
        );

        let mut ticker = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all(Utc::now()).await {
                        error!("Health check round failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe the whole pool once. Returns (healthy, unhealthy) counts of
    /// the proxies actually probed this round.
    pub async fn check_all(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        let mut cursor = None;

        loop {
            let page = self.store.scan(cursor, self.config.batch_size).await?;
            let next = page.next;

            let results = futures::stream::iter(page.proxies)
                .map(|proxy| self.check_one(proxy, now))
                .buffer_unordered(self.config.workers.max(1))
                .collect::<Vec<Option<bool>>>()
                .await;

            for result in results.into_iter().flatten() {
                if result {
                    healthy += 1;
                } else {
                    unhealthy += 1;
                }
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        info!(healthy, unhealthy, "Health check sweep complete");
        Ok((healthy, unhealthy))
    }

    /// Probe one proxy and record the outcome. Returns `None` when the
    /// proxy was skipped because its backoff window has not elapsed.
    async fn check_one(&self, proxy: Proxy, now: DateTime<Utc>) -> Option<bool> {
        if let Some(streak) = self.streaks.get(&proxy.id) {
            if now < streak.retry_after {
                debug!(proxy_id = %proxy.id, "Skipping probe, backoff in effect");
                return None;
            }
        }

        let result = {
            // Shared ceiling across health and geo probes; dropped before
            // the store write so probes never serialize behind it.
            let _permit = self.limiter.acquire().await.ok()?;
            self.probe.probe(&proxy).await
        };

        match result {
            Ok(rtt) => {
                self.streaks.remove(&proxy.id);
                let latency_ms = rtt.as_millis().min(i32::MAX as u128) as i32;
                self.record(&proxy, HealthStatus::Healthy, Some(latency_ms))
                    .await;
                Some(true)
            }
            Err(e) => {
                let consecutive = self
                    .streaks
                    .get(&proxy.id)
                    .map(|s| s.consecutive)
                    .unwrap_or(0)
                    + 1;

                let delay = backoff_delay(
                    consecutive,
                    self.config.backoff_base,
                    self.config.backoff_max,
                );
                self.streaks.insert(
                    proxy.id,
                    FailureStreak {
                        consecutive,
                        retry_after: now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(600)),
                    },
                );

                let status = next_status(
                    proxy.health_status,
                    consecutive,
                    self.config.failure_threshold,
                );
                warn!(
                    proxy_id = %proxy.id,
                    address = %proxy.socket_addr(),
                    consecutive,
                    status = %status,
                    "Probe failed: {}", e
                );

                // Latency reflects the last successful probe only.
                self.record(&proxy, status, proxy.latency_ms).await;
                Some(false)
            }
        }
    }

    /// Conditionally write the probe outcome; a lost race is retried once
    /// from a fresh read and a concurrent delete is a no-op.
    async fn record(&self, proxy: &Proxy, status: HealthStatus, latency_ms: Option<i32>) {
        let mut id = proxy.id;
        let mut version = proxy.version;

        for _ in 0..2 {
            let outcome = self
                .store
                .conditional_update(id, version, ProxyMutation::SetHealth { status, latency_ms })
                .await;

            match outcome {
                Ok(UpdateOutcome::Applied(_)) => return,
                Ok(UpdateOutcome::VersionConflict) => match self.store.get(id).await {
                    Ok(Some(fresh)) => {
                        id = fresh.id;
                        version = fresh.version;
                    }
                    _ => return,
                },
                Ok(UpdateOutcome::Missing) => return,
                Err(e) => {
                    warn!(proxy_id = %proxy.id, "Failed to record health check: {}", e);
                    return;
                }
            }
        }
    }
}

/// Hysteresis transition for one more consecutive failure.
fn next_status(current: HealthStatus, consecutive_failures: u32, threshold: u32) -> HealthStatus {
    match current {
        HealthStatus::Healthy | HealthStatus::Unknown => HealthStatus::Degraded,
        HealthStatus::Degraded => {
            if consecutive_failures >= threshold.max(2) {
                HealthStatus::Unreachable
            } else {
                HealthStatus::Degraded
            }
        }
        HealthStatus::Unreachable => HealthStatus::Unreachable,
    }
}

/// Exponential probe backoff: base * 2^(failures-1), capped.
fn backoff_delay(consecutive_failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}
