//! Geolocation classifier
//!
//! Resolves each proxy's egress country code through the proxy itself, on a
//! slower cadence than health checking since geolocation rarely changes and
//! lookups are rate limited upstream. A proxy keeps its last-known tag when
//! lookups fail; a stale tag filters better than a missing one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::Proxy;
use crate::probe::GeoResolver;
use crate::store::{ProxyMutation, ProxyStore, UpdateOutcome};

/// Geo classifier configuration
#[derive(Debug, Clone)]
pub struct GeoClassifierConfig {
    /// Interval between sweeps.
    pub check_interval: Duration,
    /// A resolved tag older than this is re-resolved.
    pub staleness_window: Duration,
    /// Base delay of the per-proxy lookup backoff after a failure.
    pub backoff_base: Duration,
    /// Cap on the per-proxy lookup backoff.
    pub backoff_max: Duration,
    /// Scan page size.
    pub batch_size: usize,
}

impl Default for GeoClassifierConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            staleness_window: Duration::from_secs(24 * 60 * 60),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LookupBackoff {
    consecutive: u32,
    retry_after: DateTime<Utc>,
}

/// Background task maintaining `country_code` tags.
pub struct GeoClassifier {
    store: Arc<dyn ProxyStore>,
    resolver: Arc<dyn GeoResolver>,
    limiter: Arc<Semaphore>,
    config: GeoClassifierConfig,
    backoffs: DashMap<Uuid, LookupBackoff>,
}

impl GeoClassifier {
    pub fn new(
        store: Arc<dyn ProxyStore>,
        resolver: Arc<dyn GeoResolver>,
        limiter: Arc<Semaphore>,
        config: GeoClassifierConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            limiter,
            config,
            backoffs: DashMap::new(),
        }
    }

    /// Run the geo classifier (call in a spawned task)
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.check_interval.as_secs(),
            staleness_secs = self.config.staleness_window.as_secs(),
            "Starting geo classifier"
        );

        let mut ticker = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.classify_all(Utc::now()).await {
                        error!("Geo classification round failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Geo classifier shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sweep the pool once, resolving missing or stale tags. Returns how
    /// many tags were updated.
    pub async fn classify_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut resolved = 0usize;
        let mut cursor = None;

        loop {
            let page = self.store.scan(cursor, self.config.batch_size).await?;
            let next = page.next;

            for proxy in page.proxies {
                if !self.needs_resolution(&proxy, now) {
                    continue;
                }
                if self.classify_one(proxy, now).await {
                    resolved += 1;
                }
            }

            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        if resolved > 0 {
            info!(count = resolved, "Resolved country codes");
        }
        Ok(resolved)
    }

    fn needs_resolution(&self, proxy: &Proxy, now: DateTime<Utc>) -> bool {
        if let Some(backoff) = self.backoffs.get(&proxy.id) {
            if now < backoff.retry_after {
                return false;
            }
        }

        match (&proxy.country_code, proxy.country_resolved_at) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(_), Some(resolved_at)) => {
                let staleness = chrono::Duration::from_std(self.config.staleness_window)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                resolved_at + staleness <= now
            }
        }
    }

    async fn classify_one(&self, proxy: Proxy, now: DateTime<Utc>) -> bool {
        let result = {
            let permit = self.limiter.acquire().await;
            if permit.is_err() {
                return false;
            }
            self.resolver.resolve(&proxy).await
        };

        match result {
            Ok(country_code) => {
                let country_code = country_code.to_uppercase();
                self.backoffs.remove(&proxy.id);
                debug!(proxy_id = %proxy.id, country_code = %country_code, "Resolved country");
                self.record(&proxy, country_code, now).await
            }
            Err(e) => {
                let consecutive = self
                    .backoffs
                    .get(&proxy.id)
                    .map(|b| b.consecutive)
                    .unwrap_or(0)
                    + 1;
                let delay = lookup_backoff_delay(
                    consecutive,
                    self.config.backoff_base,
                    self.config.backoff_max,
                );
                self.backoffs.insert(
                    proxy.id,
                    LookupBackoff {
                        consecutive,
                        retry_after: now
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::hours(1)),
                    },
                );

                // Keep the last-known tag; a stale country is more useful
                // to filtering than none.
                debug!(proxy_id = %proxy.id, consecutive, "Geo lookup failed: {}", e);
                false
            }
        }
    }

    async fn record(&self, proxy: &Proxy, country_code: String, now: DateTime<Utc>) -> bool {
        let mut version = proxy.version;

        for _ in 0..2 {
            let outcome = self
                .store
                .conditional_update(
                    proxy.id,
                    version,
                    ProxyMutation::SetCountry {
                        country_code: country_code.clone(),
                        resolved_at: now,
                    },
                )
                .await;

            match outcome {
                Ok(UpdateOutcome::Applied(_)) => return true,
                Ok(UpdateOutcome::VersionConflict) => match self.store.get(proxy.id).await {
                    Ok(Some(fresh)) => version = fresh.version,
                    _ => return false,
                },
                Ok(UpdateOutcome::Missing) => return false,
                Err(e) => {
                    warn!(proxy_id = %proxy.id, "Failed to record country code: {}", e);
                    return false;
                }
            }
        }

        false
    }
}

fn lookup_backoff_delay(consecutive_failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}
