use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Some(ProxyProtocol::Http),
            "socks5" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proxy health status as maintained by the background health checker.
///
/// Transitions use hysteresis: a single probe failure demotes `Healthy` to
/// `Degraded`, repeated consecutive failures demote `Degraded` to
/// `Unreachable`, and a single success restores `Healthy` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "unknown" => Some(HealthStatus::Unknown),
            "healthy" => Some(HealthStatus::Healthy),
            "degraded" => Some(HealthStatus::Degraded),
            "unreachable" => Some(HealthStatus::Unreachable),
            _ => None,
        }
    }

    /// Ordering rank used for lease candidate selection (lower is better).
    pub fn selection_rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unknown => 2,
            HealthStatus::Unreachable => 3,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time-bounded exclusive claim by one instance on one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub instance_id: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// A reservation past its expiry is logically released even if the
    /// reaper has not yet cleared it physically.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Proxy entity: the unit of leasing and health tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: Uuid,
    pub address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    #[serde(skip_serializing, default)]
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub tags: Vec<String>,
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_resolved_at: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub latency_ms: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_leased_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// Create a new unleased proxy with default metadata.
    pub fn new(address: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        let now = Utc::now();
        Proxy {
            id: Uuid::new_v4(),
            address: address.into(),
            port,
            protocol,
            username: None,
            password: None,
            tags: Vec::new(),
            country_code: None,
            country_resolved_at: None,
            health_status: HealthStatus::Unknown,
            latency_ms: None,
            reservation: None,
            last_leased_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the proxy carries an active (unexpired) reservation at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.reservation
            .as_ref()
            .map(|r| !r.is_expired(now))
            .unwrap_or(false)
    }

    /// The reservation, if it is still active at `now`.
    pub fn active_reservation(&self, now: DateTime<Utc>) -> Option<&Reservation> {
        self.reservation.as_ref().filter(|r| !r.is_expired(now))
    }

    /// Whether the proxy is held by `instance_id` at `now`.
    pub fn is_leased_by(&self, instance_id: &str, now: DateTime<Utc>) -> bool {
        self.active_reservation(now)
            .map(|r| r.instance_id == instance_id)
            .unwrap_or(false)
    }

    /// `host:port` form used for dialing.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Check whether the proxy's metadata matches a lease filter.
    ///
    /// Reservation state is intentionally not part of the filter; the
    /// manager checks availability separately against a single `now`.
    pub fn matches_filter(&self, filter: &ProxyFilter) -> bool {
        if let Some(ref cc) = filter.country_code {
            if self.country_code.as_deref() != Some(cc.to_uppercase().as_str()) {
                return false;
            }
        }

        if filter.require_healthy && self.health_status != HealthStatus::Healthy {
            return false;
        }

        if !filter.tags.is_empty() {
            let has_all = filter.tags.iter().all(|t| self.tags.contains(t));
            if !has_all {
                return false;
            }
        }

        true
    }
}

/// Eligibility filter for lease requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyFilter {
    pub country_code: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub require_healthy: bool,
}

impl ProxyFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn healthy() -> Self {
        Self {
            require_healthy: true,
            ..Self::default()
        }
    }
}

/// Request to create a new proxy
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProxyRequest {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request to update an existing proxy's connection fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProxyRequest {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<ProxyProtocol>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tags: Option<Vec<String>>,
}
