//! Proxy transport layer for HTTP and SOCKS5 protocols
//!
//! Establishes tunneled connections through the proxy under test. Used by
//! the connectivity probe and the geolocation resolver; every dial is
//! bounded by the caller's timeout.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::error::ProbeError;
use crate::models::{Proxy, ProxyProtocol};

/// Marker trait for established proxied connections.
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl ProxyConnection for TcpStream {}
impl ProxyConnection for Socks5Stream<TcpStream> {}

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Connect to `target_host:target_port` through the given proxy.
    pub async fn connect(
        proxy: &Proxy,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>, ProbeError> {
        match proxy.protocol {
            ProxyProtocol::Http => Self::connect_http(proxy, target_host, target_port).await,
            ProxyProtocol::Socks5 => Self::connect_socks5(proxy, target_host, target_port).await,
        }
    }

    /// Connect through the HTTP CONNECT method
    async fn connect_http(
        proxy: &Proxy,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>, ProbeError> {
        debug!("Connecting to HTTP proxy at {}", proxy.socket_addr());

        let mut stream = TcpStream::connect(proxy.socket_addr())
            .await
            .map_err(|e| ProbeError::Unreachable(format!("TCP connect failed: {}", e)))?;

        let connect_request = Self::build_connect_request(proxy, target_host, target_port);
        stream
            .write_all(connect_request.as_bytes())
            .await
            .map_err(|e| ProbeError::Unreachable(format!("Failed to send CONNECT: {}", e)))?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await.map_err(|e| {
            ProbeError::Unreachable(format!("Failed to read CONNECT response: {}", e))
        })?;

        let response_str = String::from_utf8_lossy(&response[..n]);
        if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
            return Err(ProbeError::Unreachable(format!(
                "CONNECT failed: {}",
                response_str.lines().next().unwrap_or("Unknown error")
            )));
        }

        debug!("HTTP CONNECT tunnel established");
        Ok(Box::new(stream))
    }

    /// Build the HTTP CONNECT request
    fn build_connect_request(proxy: &Proxy, target_host: &str, target_port: u16) -> String {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            target_host, target_port, target_host, target_port
        );

        if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            let credentials = format!("{}:{}", username, password);
            let encoded = BASE64.encode(credentials.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Connect through a SOCKS5 proxy (hostname targets resolved remotely)
    async fn connect_socks5(
        proxy: &Proxy,
        target_host: &str,
        target_port: u16,
    ) -> Result<Box<dyn ProxyConnection>, ProbeError> {
        debug!("Connecting to SOCKS5 proxy at {}", proxy.socket_addr());

        let proxy_addr = proxy.socket_addr();
        let target = (target_host, target_port);

        let stream = if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
            Socks5Stream::connect_with_password(proxy_addr.as_str(), target, username, password)
                .await
        } else {
            Socks5Stream::connect(proxy_addr.as_str(), target).await
        }
        .map_err(|e| ProbeError::Unreachable(format!("SOCKS5 connect failed: {}", e)))?;

        debug!("SOCKS5 connection established");
        Ok(Box::new(stream))
    }
}
