//! Expiry reaper
//!
//! Converts logically-expired leases into physically-cleared records. Each
//! clear is keyed on the version read during the scan, so a refresh that
//! lands after the scan began wins the race and the lease survives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::error::Result;
use crate::models::Proxy;
use crate::store::{ProxyMutation, ProxyStore, UpdateOutcome};

/// Expiry reaper configuration
#[derive(Debug, Clone)]
pub struct ExpiryReaperConfig {
    /// How often to sweep the pool for expired leases.
    pub interval: Duration,
    /// Page size for the scan; keeps a single pass bounded on large pools.
    pub batch_size: usize,
}

impl Default for ExpiryReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 200,
        }
    }
}

/// Background task clearing leases whose `expires_at` has passed.
pub struct ExpiryReaper {
    store: Arc<dyn ProxyStore>,
    config: ExpiryReaperConfig,
}

impl ExpiryReaper {
    pub fn new(store: Arc<dyn ProxyStore>, config: ExpiryReaperConfig) -> Self {
        Self { store, config }
    }

    /// Run the reaper (call in a spawned task). Never raises; sweep
    /// failures are logged and retried on the next tick.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry reaper"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(0) => {}
                        Ok(cleared) => info!(count = cleared, "Cleared expired leases"),
                        Err(e) => error!("Expiry sweep failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Expiry reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sweep the whole pool once, clearing leases expired at `now`.
    ///
    /// Returns how many leases were cleared.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut cleared = 0usize;
        let mut cursor = None;

        loop {
            let page = self.store.scan(cursor, self.config.batch_size).await?;

            for proxy in &page.proxies {
                let expired = proxy
                    .reservation
                    .as_ref()
                    .map(|r| r.is_expired(now))
                    .unwrap_or(false);

                if expired && self.try_reap(proxy).await? {
                    cleared += 1;
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(cleared)
    }

    /// Clear one expired lease, keyed on the version read at scan time.
    ///
    /// A version conflict means the record changed since the scan — most
    /// likely a legitimate refresh — so the lease is left alone.
    pub async fn try_reap(&self, proxy: &Proxy) -> Result<bool> {
        let outcome = self
            .store
            .conditional_update(proxy.id, proxy.version, ProxyMutation::ClearReservation)
            .await?;

        match outcome {
            UpdateOutcome::Applied(_) => {
                debug!(proxy_id = %proxy.id, "Reaped expired lease");
                Ok(true)
            }
            UpdateOutcome::VersionConflict => {
                debug!(proxy_id = %proxy.id, "Lease changed since scan, skipping");
                Ok(false)
            }
            UpdateOutcome::Missing => Ok(false),
        }
    }
}
