//! Proxy record store boundary
//!
//! All reservation and metadata mutation is serialized through this trait's
//! conditional-update primitive: read a record's version, compute the new
//! state, write iff the version is unchanged, otherwise retry from a fresh
//! read. Components never share an in-process lock; per-proxy
//! linearizability comes from the store alone.

mod memory;
mod postgres;

pub use memory::MemoryProxyStore;
pub use postgres::PgProxyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{HealthStatus, Proxy, ProxyFilter, Reservation, UpdateProxyRequest};

/// A single conditional mutation against one proxy record.
///
/// Modeled as a closed enum so each component can only touch the fields it
/// owns: reservations belong to the lease path, health to the health
/// checker, country to the geo classifier.
#[derive(Debug, Clone)]
pub enum ProxyMutation {
    /// Install a new reservation and stamp `last_leased_at`.
    InstallReservation(Reservation),
    /// Extend the current reservation's expiry.
    ExtendReservation { expires_at: DateTime<Utc> },
    /// Clear the current reservation, if any.
    ClearReservation,
    /// Record a health probe outcome.
    SetHealth {
        status: HealthStatus,
        latency_ms: Option<i32>,
    },
    /// Record a geolocation lookup outcome.
    SetCountry {
        country_code: String,
        resolved_at: DateTime<Utc>,
    },
}

/// Outcome of a conditional update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The mutation was applied; carries the updated record.
    Applied(Proxy),
    /// The record's version no longer matches what the caller read.
    VersionConflict,
    /// The record no longer exists (e.g. concurrent delete).
    Missing,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Opaque keyset cursor for resumable scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub(crate) after: Uuid,
}

/// One page of a scan.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub proxies: Vec<Proxy>,
    /// Cursor for the next page; `None` when the scan is exhausted.
    pub next: Option<ScanCursor>,
}

/// Durable keyed storage of proxy records.
///
/// Injected everywhere (never a process-wide singleton) so reservation
/// logic can be exercised against [`MemoryProxyStore`] in tests.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Fetch one proxy by id.
    async fn get(&self, id: Uuid) -> Result<Option<Proxy>>;

    /// Find proxies whose metadata matches `filter`.
    async fn find(&self, filter: &ProxyFilter) -> Result<Vec<Proxy>>;

    /// Find proxies currently reserved by `instance_id` (active at `now`).
    async fn find_leased_by(&self, instance_id: &str, now: DateTime<Utc>) -> Result<Vec<Proxy>>;

    /// Apply `mutation` iff the record's version equals `expected_version`.
    ///
    /// Every applied mutation increments the version.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutation: ProxyMutation,
    ) -> Result<UpdateOutcome>;

    /// Page through the whole pool in stable id order.
    async fn scan(&self, cursor: Option<ScanCursor>, limit: usize) -> Result<ScanPage>;

    /// Unconditionally clear every reservation. Administrative escape
    /// hatch; last writer wins. Returns the number of records cleared.
    async fn reset_all_reservations(&self) -> Result<u64>;

    // Basic record CRUD (no concurrency hazard; used by the API layer).

    /// Insert a new proxy record.
    async fn insert(&self, proxy: Proxy) -> Result<Proxy>;

    /// Overwrite connection fields of an existing proxy.
    async fn update_fields(&self, id: Uuid, req: &UpdateProxyRequest) -> Result<Option<Proxy>>;

    /// Delete a proxy record. Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// List the whole pool.
    async fn list(&self) -> Result<Vec<Proxy>>;
}

/// Apply a mutation to an owned record, bumping version and `updated_at`.
///
/// Shared by store implementations so both apply identical semantics.
pub(crate) fn apply_mutation(proxy: &mut Proxy, mutation: &ProxyMutation, now: DateTime<Utc>) {
    match mutation {
        ProxyMutation::InstallReservation(res) => {
            proxy.last_leased_at = Some(res.leased_at);
            proxy.reservation = Some(res.clone());
        }
        ProxyMutation::ExtendReservation { expires_at } => {
            if let Some(res) = proxy.reservation.as_mut() {
                res.expires_at = *expires_at;
            }
        }
        ProxyMutation::ClearReservation => {
            proxy.reservation = None;
        }
        ProxyMutation::SetHealth { status, latency_ms } => {
            proxy.health_status = *status;
            proxy.latency_ms = *latency_ms;
        }
        ProxyMutation::SetCountry {
            country_code,
            resolved_at,
        } => {
            proxy.country_code = Some(country_code.clone());
            proxy.country_resolved_at = Some(*resolved_at);
        }
    }
    proxy.version += 1;
    proxy.updated_at = now;
}
