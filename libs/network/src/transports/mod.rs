//! Transport Adapters
//!
//! An adapter turns an endpoint configuration into sockets for the reactor.
//! It exposes exactly two operations: `try_connect(role)`, which binds a
//! listener (master) or connects a data stream (slave), and `accept`, which
//! takes the next connection off a listener. Retry, backoff and connection
//! bookkeeping stay in the reactor, so they are the same for every transport.

use crate::config::{EndpointConfig, Role};
use crate::{Result, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, warn};

pub mod tcp;
pub mod unix;

pub use tcp::InetAdapter;
pub use unix::UnixAdapter;

/// Read half of a data connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a data connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    /// Unix domain socket transport
    Unix,
    /// TCP network transport
    Inet,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Unix => f.write_str("unix"),
            TransportType::Inet => f.write_str("inet"),
        }
    }
}

/// An established data stream split into halves
pub struct Link {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Human-readable remote description for logs
    pub remote: String,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W, remote: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote: remote.into(),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("remote", &self.remote).finish()
    }
}

/// A bound listening socket
///
/// A Unix listener removes its socket file when dropped.
#[derive(Debug)]
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    pub fn kind(&self) -> TransportType {
        match self {
            Listener::Unix { .. } => TransportType::Unix,
            Listener::Tcp(_) => TransportType::Inet,
        }
    }

    /// Bound address for logs (the port matters when binding port 0)
    pub fn local_description(&self) -> String {
        match self {
            Listener::Unix { path, .. } => path.display().to_string(),
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unbound>".to_string()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            match std::fs::remove_file(&*path) {
                Ok(()) => debug!(path = %path.display(), "Removed socket file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
            }
        }
    }
}

/// Result of a successful `try_connect`
#[derive(Debug)]
pub enum Endpoint {
    /// Master side: ready to accept
    Listening(Listener),
    /// Slave side: connected to the master
    Connected(Link),
}

/// Bind/connect/accept strategy for one transport
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> TransportType;

    /// Endpoint description for logs
    fn describe(&self) -> String;

    /// Bind and listen (master) or connect (slave), once
    async fn try_connect(&self, role: Role) -> Result<Endpoint>;

    /// Accept the next data connection from a listener this adapter produced
    async fn accept(&self, listener: &Listener) -> Result<Link>;
}

/// Build the adapter for an endpoint
pub fn create_adapter(endpoint: &EndpointConfig) -> Result<Box<dyn Adapter>> {
    match endpoint {
        EndpointConfig::Unix { path } => Ok(Box::new(UnixAdapter::new(path.clone())?)),
        EndpointConfig::Inet { hostname, port } => Ok(Box::new(InetAdapter::new(hostname.clone(), *port))),
    }
}

pub(crate) fn wrong_listener(expected: TransportType, listener: &Listener) -> TransportError {
    TransportError::configuration(
        format!("{} adapter cannot accept on a {} listener", expected, listener.kind()),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_adapter() {
        let unix = create_adapter(&EndpointConfig::unix("/tmp/emsg-factory.sock")).unwrap();
        assert_eq!(unix.kind(), TransportType::Unix);
        assert_eq!(unix.describe(), "unix:/tmp/emsg-factory.sock");

        let inet = create_adapter(&EndpointConfig::inet("localhost", 7000)).unwrap();
        assert_eq!(inet.kind(), TransportType::Inet);
        assert_eq!(inet.describe(), "inet:localhost:7000");
    }

    #[test]
    fn test_factory_rejects_long_path() {
        let long = format!("/tmp/{}", "x".repeat(200));
        let err = create_adapter(&EndpointConfig::unix(long)).err().unwrap();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_accept_on_foreign_listener_fails() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = Listener::Tcp(tcp);
        let adapter = UnixAdapter::new("/tmp/emsg-foreign.sock").unwrap();
        let err = adapter.accept(&listener).await.unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
