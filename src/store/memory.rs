//! In-memory proxy store
//!
//! Backs tests and single-process deployments. Implements the same
//! conditional-update contract as the Postgres store: per-record atomicity
//! via the map's entry lock, version checked under that lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Proxy, ProxyFilter, UpdateProxyRequest};

use super::{apply_mutation, ProxyMutation, ProxyStore, ScanCursor, ScanPage, UpdateOutcome};

/// DashMap-backed [`ProxyStore`].
#[derive(Default)]
pub struct MemoryProxyStore {
    proxies: DashMap<Uuid, Proxy>,
}

impl MemoryProxyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a set of proxies (test convenience).
    pub fn with_proxies(proxies: impl IntoIterator<Item = Proxy>) -> Self {
        let store = Self::new();
        for proxy in proxies {
            store.proxies.insert(proxy.id, proxy);
        }
        store
    }

}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn get(&self, id: Uuid) -> Result<Option<Proxy>> {
        Ok(self.proxies.get(&id).map(|p| p.clone()))
    }

    async fn find(&self, filter: &ProxyFilter) -> Result<Vec<Proxy>> {
        Ok(self
            .proxies
            .iter()
            .filter(|p| p.matches_filter(filter))
            .map(|p| p.clone())
            .collect())
    }

    async fn find_leased_by(&self, instance_id: &str, now: DateTime<Utc>) -> Result<Vec<Proxy>> {
        Ok(self
            .proxies
            .iter()
            .filter(|p| p.is_leased_by(instance_id, now))
            .map(|p| p.clone())
            .collect())
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutation: ProxyMutation,
    ) -> Result<UpdateOutcome> {
        // The entry guard holds the shard lock; no await happens while the
        // version check and mutation run.
        match self.proxies.get_mut(&id) {
            Some(mut entry) => {
                if entry.version != expected_version {
                    return Ok(UpdateOutcome::VersionConflict);
                }
                apply_mutation(entry.value_mut(), &mutation, Utc::now());
                Ok(UpdateOutcome::Applied(entry.clone()))
            }
            None => Ok(UpdateOutcome::Missing),
        }
    }

    async fn scan(&self, cursor: Option<ScanCursor>, limit: usize) -> Result<ScanPage> {
        let limit = limit.max(1);

        let mut ids: Vec<Uuid> = self.proxies.iter().map(|p| p.id).collect();
        ids.sort();

        let after = cursor.map(|c| c.after);
        let proxies: Vec<Proxy> = ids
            .into_iter()
            .filter(|id| after.map_or(true, |a| *id > a))
            .take(limit)
            .filter_map(|id| self.proxies.get(&id).map(|p| p.clone()))
            .collect();

        let next = if proxies.len() == limit {
            proxies.last().map(|p| ScanCursor { after: p.id })
        } else {
            None
        };

        Ok(ScanPage { proxies, next })
    }

    async fn reset_all_reservations(&self) -> Result<u64> {
        let now = Utc::now();
        let mut cleared = 0u64;
        for mut entry in self.proxies.iter_mut() {
            if entry.reservation.is_some() {
                apply_mutation(entry.value_mut(), &ProxyMutation::ClearReservation, now);
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn insert(&self, proxy: Proxy) -> Result<Proxy> {
        self.proxies.insert(proxy.id, proxy.clone());
        Ok(proxy)
    }

    async fn update_fields(&self, id: Uuid, req: &UpdateProxyRequest) -> Result<Option<Proxy>> {
        match self.proxies.get_mut(&id) {
            Some(mut entry) => {
                let proxy = entry.value_mut();
                if let Some(ref address) = req.address {
                    proxy.address = address.clone();
                }
                if let Some(port) = req.port {
                    proxy.port = port;
                }
                if let Some(protocol) = req.protocol {
                    proxy.protocol = protocol;
                }
                if let Some(ref username) = req.username {
                    proxy.username = Some(username.clone());
                }
                if let Some(ref password) = req.password {
                    proxy.password = Some(password.clone());
                }
                if let Some(ref tags) = req.tags {
                    proxy.tags = tags.clone();
                }
                proxy.version += 1;
                proxy.updated_at = Utc::now();
                Ok(Some(proxy.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.proxies.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<Proxy>> {
        let mut proxies: Vec<Proxy> = self.proxies.iter().map(|p| p.clone()).collect();
        proxies.sort_by_key(|p| p.id);
        Ok(proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthStatus, ProxyProtocol, Reservation};
    use chrono::Duration;

    fn proxy(address: &str) -> Proxy {
        Proxy::new(address, 3128, ProxyProtocol::Http)
    }

    #[tokio::test]
    async fn test_conditional_update_applies_and_bumps_version() {
        let store = MemoryProxyStore::new();
        let p = store.insert(proxy("10.0.0.1")).await.unwrap();
        assert_eq!(p.version, 1);

        let outcome = store
            .conditional_update(
                p.id,
                1,
                ProxyMutation::SetHealth {
                    status: HealthStatus::Healthy,
                    latency_ms: Some(42),
                },
            )
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Applied(updated) => {
                assert_eq!(updated.version, 2);
                assert_eq!(updated.health_status, HealthStatus::Healthy);
                assert_eq!(updated.latency_ms, Some(42));
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_stale_version() {
        let store = MemoryProxyStore::new();
        let p = store.insert(proxy("10.0.0.1")).await.unwrap();

        // Two writers read version 1; only the first write lands.
        let first = store
            .conditional_update(
                p.id,
                1,
                ProxyMutation::SetHealth {
                    status: HealthStatus::Healthy,
                    latency_ms: Some(10),
                },
            )
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = store
            .conditional_update(
                p.id,
                1,
                ProxyMutation::SetHealth {
                    status: HealthStatus::Unreachable,
                    latency_ms: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(second, UpdateOutcome::VersionConflict));

        let current = store.get(p.id).await.unwrap().unwrap();
        assert_eq!(current.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_conditional_update_missing_record() {
        let store = MemoryProxyStore::new();
        let outcome = store
            .conditional_update(Uuid::new_v4(), 1, ProxyMutation::ClearReservation)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Missing));
    }

    #[tokio::test]
    async fn test_scan_pages_whole_pool_without_duplicates() {
        let store = MemoryProxyStore::new();
        for i in 0..7 {
            store.insert(proxy(&format!("10.0.0.{}", i))).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.scan(cursor, 3).await.unwrap();
            seen.extend(page.proxies.iter().map(|p| p.id));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[tokio::test]
    async fn test_reset_all_reservations_counts_only_leased() {
        let store = MemoryProxyStore::new();
        let now = Utc::now();

        let mut leased = proxy("10.0.0.1");
        leased.reservation = Some(Reservation {
            instance_id: "scraper-1".to_string(),
            leased_at: now,
            expires_at: now + Duration::seconds(60),
        });
        store.insert(leased.clone()).await.unwrap();
        store.insert(proxy("10.0.0.2")).await.unwrap();

        let cleared = store.reset_all_reservations().await.unwrap();
        assert_eq!(cleared, 1);

        let after = store.get(leased.id).await.unwrap().unwrap();
        assert!(after.reservation.is_none());
        assert_eq!(after.version, leased.version + 1);
    }

    #[tokio::test]
    async fn test_find_leased_by_ignores_expired() {
        let store = MemoryProxyStore::new();
        let now = Utc::now();

        let mut active = proxy("10.0.0.1");
        active.reservation = Some(Reservation {
            instance_id: "scraper-1".to_string(),
            leased_at: now,
            expires_at: now + Duration::seconds(60),
        });
        let mut expired = proxy("10.0.0.2");
        expired.reservation = Some(Reservation {
            instance_id: "scraper-1".to_string(),
            leased_at: now - Duration::seconds(120),
            expires_at: now - Duration::seconds(60),
        });

        store.insert(active.clone()).await.unwrap();
        store.insert(expired).await.unwrap();

        let held = store.find_leased_by("scraper-1", now).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].id, active.id);
    }

    #[tokio::test]
    async fn test_update_fields_bumps_version() {
        let store = MemoryProxyStore::new();
        let p = store.insert(proxy("10.0.0.1")).await.unwrap();

        let req = UpdateProxyRequest {
            port: Some(1080),
            protocol: Some(ProxyProtocol::Socks5),
            ..Default::default()
        };
        let updated = store.update_fields(p.id, &req).await.unwrap().unwrap();
        assert_eq!(updated.port, 1080);
        assert_eq!(updated.protocol, ProxyProtocol::Socks5);
        assert_eq!(updated.version, 2);

        assert!(store
            .update_fields(Uuid::new_v4(), &req)
            .await
            .unwrap()
            .is_none());
    }
}
