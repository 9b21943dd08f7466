//! Postgres-backed proxy store
//!
//! The conditional-update primitive is a single `UPDATE ... WHERE id = $1
//! AND version = $2` statement, so per-record linearizability comes from the
//! database row lock rather than any in-process synchronization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{HealthStatus, Proxy, ProxyFilter, ProxyProtocol, Reservation, UpdateProxyRequest};

use super::{ProxyMutation, ProxyStore, ScanCursor, ScanPage, UpdateOutcome};

const PROXY_COLUMNS: &str = r#"
    id, address, port, protocol, username, password, tags,
    country_code, country_resolved_at, health_status, latency_ms,
    reservation_instance, reservation_leased_at, reservation_expires_at,
    last_leased_at, version, created_at, updated_at
"#;

/// Row shape as stored; reservation fields are flattened nullable columns.
#[derive(Debug, FromRow)]
struct ProxyRow {
    id: Uuid,
    address: String,
    port: i32,
    protocol: ProxyProtocol,
    username: Option<String>,
    password: Option<String>,
    tags: Vec<String>,
    country_code: Option<String>,
    country_resolved_at: Option<DateTime<Utc>>,
    health_status: HealthStatus,
    latency_ms: Option<i32>,
    reservation_instance: Option<String>,
    reservation_leased_at: Option<DateTime<Utc>>,
    reservation_expires_at: Option<DateTime<Utc>>,
    last_leased_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProxyRow> for Proxy {
    fn from(row: ProxyRow) -> Self {
        let reservation = match (
            row.reservation_instance,
            row.reservation_leased_at,
            row.reservation_expires_at,
        ) {
            (Some(instance_id), Some(leased_at), Some(expires_at)) => Some(Reservation {
                instance_id,
                leased_at,
                expires_at,
            }),
            _ => None,
        };

        Proxy {
            id: row.id,
            address: row.address,
            port: row.port as u16,
            protocol: row.protocol,
            username: row.username,
            password: row.password,
            tags: row.tags,
            country_code: row.country_code,
            country_resolved_at: row.country_resolved_at,
            health_status: row.health_status,
            latency_ms: row.latency_ms,
            reservation,
            last_leased_at: row.last_leased_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn row_to_proxy(row: PgRow) -> Result<Proxy> {
    Ok(ProxyRow::from_row(&row)?.into())
}

/// Postgres [`ProxyStore`] implementation.
#[derive(Clone)]
pub struct PgProxyStore {
    pool: PgPool,
}

impl PgProxyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProxyStore for PgProxyStore {
    async fn get(&self, id: Uuid) -> Result<Option<Proxy>> {
        let row = sqlx::query(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_proxy).transpose()
    }

    async fn find(&self, filter: &ProxyFilter) -> Result<Vec<Proxy>> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {PROXY_COLUMNS} FROM proxies WHERE 1=1"
        ));

        if let Some(ref cc) = filter.country_code {
            query
                .push(" AND country_code = ")
                .push_bind(cc.to_uppercase());
        }
        if filter.require_healthy {
            query.push(" AND health_status = 'healthy'");
        }
        if !filter.tags.is_empty() {
            query.push(" AND tags @> ").push_bind(filter.tags.clone());
        }
        query.push(" ORDER BY id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_proxy).collect()
    }

    async fn find_leased_by(&self, instance_id: &str, now: DateTime<Utc>) -> Result<Vec<Proxy>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROXY_COLUMNS} FROM proxies
            WHERE reservation_instance = $1 AND reservation_expires_at > $2
            ORDER BY id
            "#
        ))
        .bind(instance_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_proxy).collect()
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        mutation: ProxyMutation,
    ) -> Result<UpdateOutcome> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE proxies SET ");

        match &mutation {
            ProxyMutation::InstallReservation(res) => {
                query
                    .push("reservation_instance = ")
                    .push_bind(res.instance_id.clone())
                    .push(", reservation_leased_at = ")
                    .push_bind(res.leased_at)
                    .push(", reservation_expires_at = ")
                    .push_bind(res.expires_at)
                    .push(", last_leased_at = ")
                    .push_bind(res.leased_at);
            }
            ProxyMutation::ExtendReservation { expires_at } => {
                query
                    .push("reservation_expires_at = ")
                    .push_bind(*expires_at);
            }
            ProxyMutation::ClearReservation => {
                query.push(
                    "reservation_instance = NULL, \
                     reservation_leased_at = NULL, \
                     reservation_expires_at = NULL",
                );
            }
            ProxyMutation::SetHealth { status, latency_ms } => {
                query
                    .push("health_status = ")
                    .push_bind(*status)
                    .push(", latency_ms = ")
                    .push_bind(*latency_ms);
            }
            ProxyMutation::SetCountry {
                country_code,
                resolved_at,
            } => {
                query
                    .push("country_code = ")
                    .push_bind(country_code.clone())
                    .push(", country_resolved_at = ")
                    .push_bind(*resolved_at);
            }
        }

        query
            .push(", version = version + 1, updated_at = NOW() WHERE id = ")
            .push_bind(id)
            .push(" AND version = ")
            .push_bind(expected_version)
            .push(format!(" RETURNING {PROXY_COLUMNS}"));

        let row = query.build().fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(UpdateOutcome::Applied(row_to_proxy(row)?)),
            None => {
                // Distinguish a lost race from a concurrent delete.
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT 1 FROM proxies WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;

                if exists.is_some() {
                    Ok(UpdateOutcome::VersionConflict)
                } else {
                    Ok(UpdateOutcome::Missing)
                }
            }
        }
    }

    async fn scan(&self, cursor: Option<ScanCursor>, limit: usize) -> Result<ScanPage> {
        let limit = limit.clamp(1, 1000) as i64;
        let after = cursor.map(|c| c.after);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROXY_COLUMNS} FROM proxies
            WHERE ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let proxies: Vec<Proxy> = rows
            .into_iter()
            .map(row_to_proxy)
            .collect::<Result<_>>()?;

        let next = if proxies.len() == limit as usize {
            proxies.last().map(|p| ScanCursor { after: p.id })
        } else {
            None
        };

        Ok(ScanPage { proxies, next })
    }

    async fn reset_all_reservations(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET reservation_instance = NULL,
                reservation_leased_at = NULL,
                reservation_expires_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE reservation_instance IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        let cleared = result.rows_affected();
        info!(count = cleared, "Reset all reservations");
        Ok(cleared)
    }

    async fn insert(&self, proxy: Proxy) -> Result<Proxy> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO proxies (
                id, address, port, protocol, username, password, tags,
                health_status, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            RETURNING {PROXY_COLUMNS}
            "#
        ))
        .bind(proxy.id)
        .bind(&proxy.address)
        .bind(proxy.port as i32)
        .bind(proxy.protocol)
        .bind(&proxy.username)
        .bind(&proxy.password)
        .bind(&proxy.tags)
        .bind(proxy.health_status)
        .bind(proxy.version)
        .fetch_one(&self.pool)
        .await?;

        let created = row_to_proxy(row)?;
        info!(id = %created.id, address = %created.socket_addr(), "Created proxy");
        Ok(created)
    }

    async fn update_fields(&self, id: Uuid, req: &UpdateProxyRequest) -> Result<Option<Proxy>> {
        let current = match self.get(id).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        let address = req.address.as_ref().unwrap_or(&current.address);
        let port = req.port.unwrap_or(current.port) as i32;
        let protocol = req.protocol.unwrap_or(current.protocol);
        let username = req.username.as_ref().or(current.username.as_ref());
        let password = req.password.as_ref().or(current.password.as_ref());
        let tags = req.tags.as_ref().unwrap_or(&current.tags);

        let row = sqlx::query(&format!(
            r#"
            UPDATE proxies
            SET address = $2, port = $3, protocol = $4,
                username = $5, password = $6, tags = $7,
                version = version + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {PROXY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(address)
        .bind(port)
        .bind(protocol)
        .bind(username)
        .bind(password)
        .bind(tags)
        .fetch_optional(&self.pool)
        .await?;

        let updated = row.map(row_to_proxy).transpose()?;
        if let Some(ref p) = updated {
            info!(id = %p.id, address = %p.socket_addr(), "Updated proxy");
        }
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(id = %id, "Deleted proxy");
        }
        Ok(deleted)
    }

    async fn list(&self) -> Result<Vec<Proxy>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROXY_COLUMNS} FROM proxies ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_proxy).collect()
    }
}
