//! TCP Network Transport
//!
//! Inet adapter: the master binds `0.0.0.0:<port>` and listens; slaves
//! resolve the configured hostname and connect with a bounded timeout.

use super::{wrong_listener, Adapter, Endpoint, Link, Listener, TransportType};
use crate::config::Role;
use crate::{Result, TransportError};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upper bound on a single connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP adapter for one host/port pair
#[derive(Debug, Clone)]
pub struct InetAdapter {
    hostname: String,
    port: u16,
    connect_timeout: Duration,
}

impl InetAdapter {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve the configured host: literal address first, then DNS
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.hostname.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let mut addrs = lookup_host((self.hostname.as_str(), self.port))
            .await
            .map_err(|e| TransportError::network_with_source(format!("Failed to resolve {}", self.hostname), e))?;
        addrs
            .next()
            .ok_or_else(|| TransportError::network(format!("No addresses for {}", self.hostname)))
    }

    async fn bind(&self) -> Result<Listener> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to bind TCP listener", e))?;

        info!(addr = %bind_addr, "TCP server listening");
        Ok(Listener::Tcp(listener))
    }

    async fn connect(&self) -> Result<Link> {
        let remote_addr = self.resolve().await?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(remote_addr))
            .await
            .map_err(|_| TransportError::timeout("TCP connect", self.connect_timeout.as_millis() as u64))?
            .map_err(|e| {
                TransportError::connection_with_source(
                    "Failed to connect to TCP peer",
                    Some(&remote_addr.to_string()),
                    e,
                )
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %remote_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(peer = %remote_addr, "Connected to TCP peer");
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer, remote_addr.to_string()))
    }
}

#[async_trait]
impl Adapter for InetAdapter {
    fn kind(&self) -> TransportType {
        TransportType::Inet
    }

    fn describe(&self) -> String {
        format!("inet:{}:{}", self.hostname, self.port)
    }

    async fn try_connect(&self, role: Role) -> Result<Endpoint> {
        match role {
            Role::Master => Ok(Endpoint::Listening(self.bind().await?)),
            Role::Slave => Ok(Endpoint::Connected(self.connect().await?)),
        }
    }

    async fn accept(&self, listener: &Listener) -> Result<Link> {
        let Listener::Tcp(listener) = listener else {
            return Err(wrong_listener(TransportType::Inet, listener));
        };

        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to accept TCP connection", e))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(peer = %peer_addr, "Accepted TCP connection");
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer, peer_addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_literal_address_skips_lookup() {
        let adapter = InetAdapter::new("127.0.0.1", 4321);
        assert_eq!(adapter.resolve().await.unwrap(), "127.0.0.1:4321".parse().unwrap());

        let adapter = InetAdapter::new("::1", 4321);
        assert_eq!(adapter.resolve().await.unwrap(), "[::1]:4321".parse().unwrap());
    }

    #[tokio::test]
    async fn test_accept_and_connect() {
        // Find a free port, then let the adapter bind it
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let adapter = InetAdapter::new("127.0.0.1", port);

        let Endpoint::Listening(listener) = adapter.try_connect(Role::Master).await.unwrap() else {
            panic!("master should listen");
        };

        let slave = adapter.clone();
        let client = tokio::spawn(async move {
            let Endpoint::Connected(mut link) = slave.try_connect(Role::Slave).await.unwrap() else {
                panic!("slave should connect");
            };
            link.writer.write_all(b"hello").await.unwrap();
            link.writer.flush().await.unwrap();
        });

        let mut accepted = adapter.accept(&listener).await.unwrap();
        let mut buf = [0u8; 5];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let adapter = InetAdapter::new("127.0.0.1", port).with_connect_timeout(Duration::from_millis(500));
        let err = adapter.try_connect(Role::Slave).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
