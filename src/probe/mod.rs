//! Outbound probing: connectivity checks and geolocation lookups
//!
//! Both probe kinds are trait seams so the background services can be
//! exercised with scripted fakes; the real implementations dial through the
//! proxy under test.

pub mod transport;

pub use transport::{ProxyConnection, ProxyTransport};

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProbeError;
use crate::models::Proxy;

/// Lightweight connectivity probe through a proxy, measuring round trip.
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn probe(&self, proxy: &Proxy) -> Result<Duration, ProbeError>;
}

/// External IP-to-country lookup issued through the proxy itself.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, proxy: &Proxy) -> Result<String, ProbeError>;
}

/// Probe that tunnels a connection to a well-known target through the
/// proxy. A completed tunnel validates both reachability of the proxy and
/// its ability to reach the outside world.
pub struct ConnectProbe {
    target_host: String,
    target_port: u16,
    timeout: Duration,
}

impl ConnectProbe {
    pub fn new(target_host: impl Into<String>, target_port: u16, timeout: Duration) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            timeout,
        }
    }
}

#[async_trait]
impl ProxyProbe for ConnectProbe {
    async fn probe(&self, proxy: &Proxy) -> Result<Duration, ProbeError> {
        let started = Instant::now();

        let connect = ProxyTransport::connect(proxy, &self.target_host, self.target_port);
        match timeout(self.timeout, connect).await {
            Ok(Ok(_conn)) => {
                let rtt = started.elapsed();
                debug!(
                    proxy = %proxy.socket_addr(),
                    rtt_ms = rtt.as_millis() as u64,
                    "Probe succeeded"
                );
                Ok(rtt)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout),
        }
    }
}

/// Geolocation resolver speaking plain HTTP/1.1 to a country-code endpoint
/// through the proxy under test.
pub struct HttpGeoResolver {
    host: String,
    port: u16,
    path: String,
    timeout: Duration,
}

impl HttpGeoResolver {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            timeout,
        }
    }

    async fn fetch(&self, proxy: &Proxy) -> Result<String, ProbeError> {
        let mut conn = ProxyTransport::connect(proxy, &self.host, self.port).await?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path, self.host
        );
        conn.write_all(request.as_bytes())
            .await
            .map_err(|e| ProbeError::Unreachable(format!("write failed: {}", e)))?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    if response.len() > 16 * 1024 {
                        break;
                    }
                }
                Err(e) => {
                    if response.is_empty() {
                        return Err(ProbeError::Unreachable(format!("read failed: {}", e)));
                    }
                    break;
                }
            }
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

#[async_trait]
impl GeoResolver for HttpGeoResolver {
    async fn resolve(&self, proxy: &Proxy) -> Result<String, ProbeError> {
        let response = match timeout(self.timeout, self.fetch(proxy)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ProbeError::Timeout),
        };

        parse_country_response(&response)
    }
}

/// Extract a two-letter country code from a raw HTTP response.
fn parse_country_response(response: &str) -> Result<String, ProbeError> {
    let status_line = response.lines().next().unwrap_or_default();
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return Err(ProbeError::Unreachable(format!(
            "lookup returned: {}",
            status_line
        )));
    }

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or_default();

    // Chunked responses interleave size lines; the country code is the
    // last line that looks like one.
    let code = body
        .lines()
        .map(str::trim)
        .filter(|l| l.len() == 2 && l.chars().all(|c| c.is_ascii_alphabetic()))
        .next_back();

    match code {
        Some(cc) => Ok(cc.to_uppercase()),
        None => Err(ProbeError::Unreachable(
            "no country code in lookup response".to_string(),
        )),
    }
}
