//! Unix Domain Socket Transport
//!
//! Local IPC between processes on the same machine. The master binds and
//! listens on a filesystem path; slaves connect to it.

use super::{wrong_listener, Adapter, Endpoint, Link, Listener, TransportType};
use crate::config::Role;
use crate::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

/// Longest socket path accepted (sockaddr_un.sun_path minus the terminator)
pub const MAX_SOCKET_PATH: usize = 107;

/// How long a listener found by connecting is trusted to still be there
const LIVE_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// `__SO_ACCEPTCON` in the flags column of /proc/net/unix
const PROC_LISTENING_FLAG: u32 = 0x0001_0000;

/// Unix-domain socket adapter
#[derive(Debug, Clone)]
pub struct UnixAdapter {
    path: PathBuf,
    live_until: Arc<Mutex<Option<Instant>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Listening,
    Stale,
    Unknown,
}

/// Split a /proc/net/unix line into its flags and bound path
///
/// Unnamed and abstract sockets yield `None`.
fn parse_proc_line(line: &str) -> Option<(u32, &str)> {
    let mut rest = line.trim_start();
    let mut fields = [""; 7];
    for field in fields.iter_mut() {
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }
    let flags = u32::from_str_radix(fields[3], 16).ok()?;
    let path = rest.trim_end();
    if path.is_empty() || path.starts_with('@') {
        return None;
    }
    Some((flags, path))
}

/// Classify `path` against a /proc/net/unix table
fn scan_listeners(table: &str, path: &Path) -> SocketState {
    let canonical = path.canonicalize().ok();
    let name = path.file_name();
    let mut state = SocketState::Stale;
    for (flags, bound) in table.lines().filter_map(parse_proc_line) {
        if flags & PROC_LISTENING_FLAG == 0 {
            continue;
        }
        let bound = Path::new(bound);
        if bound == path || canonical.as_deref() == Some(bound) {
            return SocketState::Listening;
        }
        // Relative binds are listed as given, so only the name can be compared
        if bound.is_relative() && bound.file_name() == name {
            state = SocketState::Unknown;
        }
    }
    state
}

#[cfg(target_os = "linux")]
fn listener_state(path: &Path) -> SocketState {
    match std::fs::read_to_string("/proc/net/unix") {
        Ok(table) => scan_listeners(&table, path),
        Err(_) => SocketState::Unknown,
    }
}

#[cfg(not(target_os = "linux"))]
fn listener_state(_path: &Path) -> SocketState {
    SocketState::Unknown
}

impl UnixAdapter {
    /// Create an adapter for `path`, rejecting paths that do not fit a sockaddr
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = path.as_os_str().as_bytes().len();
        if len == 0 || len > MAX_SOCKET_PATH {
            return Err(TransportError::configuration(
                format!(
                    "socket path must be 1..={} bytes, got {} ({})",
                    MAX_SOCKET_PATH,
                    len,
                    path.display()
                ),
                Some("socket"),
            ));
        }
        Ok(Self {
            path,
            live_until: Arc::new(Mutex::new(None)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the listening socket
    ///
    /// The path is only unlinked after a failed bind shows it belongs to no
    /// listener. A live listener makes the bind fail so the reactor retries
    /// later, without ever connecting to it.
    async fn bind(&self) -> Result<Listener> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TransportError::network_with_source("Failed to create socket directory", e)
                })?;
            }
        }

        let listener = match UnixListener::bind(&self.path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                self.clear_stale_socket().await?;
                UnixListener::bind(&self.path)
                    .map_err(|e| TransportError::network_with_source("Failed to bind Unix socket", e))?
            }
            Err(e) => return Err(TransportError::network_with_source("Failed to bind Unix socket", e)),
        };

        *self.live_until.lock() = None;
        info!(path = %self.path.display(), "Unix socket listening");
        Ok(Listener::Unix {
            listener,
            path: self.path.clone(),
        })
    }

    /// Remove the socket file at our path if nobody listens on it
    async fn clear_stale_socket(&self) -> Result<()> {
        let metadata = std::fs::symlink_metadata(&self.path)
            .map_err(|e| TransportError::network_with_source("Failed to inspect socket path", e))?;
        if !metadata.file_type().is_socket() {
            return Err(TransportError::configuration(
                format!("{} exists and is not a socket", self.path.display()),
                Some("socket"),
            ));
        }

        let live = match listener_state(&self.path) {
            SocketState::Listening => true,
            SocketState::Stale => false,
            SocketState::Unknown => self.answers_connect().await,
        };
        if live {
            return Err(TransportError::network(format!(
                "socket {} is held by a live listener",
                self.path.display()
            )));
        }

        debug!(path = %self.path.display(), "Removing stale socket file");
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransportError::network_with_source("Failed to remove stale socket", e)),
        }
    }

    /// Last-resort liveness check for hosts without /proc/net/unix
    ///
    /// Connecting shows up as a connection on the other side, so a positive
    /// answer is remembered for `LIVE_RECHECK_INTERVAL`.
    async fn answers_connect(&self) -> bool {
        if let Some(until) = *self.live_until.lock() {
            if Instant::now() < until {
                return true;
            }
        }
        match UnixStream::connect(&self.path).await {
            Ok(_) => {
                *self.live_until.lock() = Some(Instant::now() + LIVE_RECHECK_INTERVAL);
                true
            }
            Err(e) => !matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound),
        }
    }

    async fn connect(&self) -> Result<Link> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            TransportError::connection_with_source(
                "Failed to connect to Unix socket",
                Some(&self.path.display().to_string()),
                e,
            )
        })?;

        debug!(path = %self.path.display(), "Connected to Unix socket");
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer, self.path.display().to_string()))
    }
}

#[async_trait]
impl Adapter for UnixAdapter {
    fn kind(&self) -> TransportType {
        TransportType::Unix
    }

    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    async fn try_connect(&self, role: Role) -> Result<Endpoint> {
        match role {
            Role::Master => Ok(Endpoint::Listening(self.bind().await?)),
            Role::Slave => Ok(Endpoint::Connected(self.connect().await?)),
        }
    }

    async fn accept(&self, listener: &Listener) -> Result<Link> {
        let Listener::Unix { listener, path } = listener else {
            return Err(wrong_listener(TransportType::Unix, listener));
        };

        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| TransportError::network_with_source("Failed to accept connection", e))?;

        debug!(path = %path.display(), "Accepted Unix socket connection");
        let (reader, writer) = stream.into_split();
        Ok(Link::new(reader, writer, format!("{} (accepted)", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_master_slave_link() {
        let dir = tempdir().unwrap();
        let adapter = UnixAdapter::new(dir.path().join("link.sock")).unwrap();

        let Endpoint::Listening(listener) = adapter.try_connect(Role::Master).await.unwrap() else {
            panic!("master should listen");
        };

        let slave = adapter.clone();
        let client = tokio::spawn(async move {
            let Endpoint::Connected(mut link) = slave.try_connect(Role::Slave).await.unwrap() else {
                panic!("slave should connect");
            };
            link.writer.write_all(b"ping").await.unwrap();
            link.writer.flush().await.unwrap();
        });

        let mut accepted = adapter.accept(&listener).await.unwrap();
        let mut buf = [0u8; 4];
        accepted.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // A bound-then-dropped std listener leaves the file with nobody accepting
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let adapter = UnixAdapter::new(&path).unwrap();
        assert!(matches!(
            adapter.try_connect(Role::Master).await.unwrap(),
            Endpoint::Listening(_)
        ));
    }

    #[tokio::test]
    async fn test_live_socket_blocks_bind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.sock");
        let adapter = UnixAdapter::new(&path).unwrap();

        let _first = adapter.try_connect(Role::Master).await.unwrap();
        let err = adapter.try_connect(Role::Master).await.unwrap_err();
        assert_eq!(err.category(), "network");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_regular_file_is_not_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.sock");
        std::fs::write(&path, b"keep").unwrap();

        let adapter = UnixAdapter::new(&path).unwrap();
        let err = adapter.try_connect(Role::Master).await.unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_listener_found_without_connecting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quiet.sock");
        let listener = UnixListener::bind(&path).unwrap();

        assert_eq!(listener_state(&path), SocketState::Listening);
        let adapter = UnixAdapter::new(&path).unwrap();
        assert!(adapter.try_connect(Role::Master).await.is_err());

        // Nothing may have queued on the held listener
        let pending = tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(pending.is_err());
    }

    #[test]
    fn test_parse_proc_lines() {
        let listening = "0000000000000000: 00000002 00000000 00010000 0001 01 41523 /run/emsg/master.sock";
        assert_eq!(parse_proc_line(listening), Some((0x10000, "/run/emsg/master.sock")));

        let spaced = "0000000000000000: 00000003 00000000 00000000 0001 03 41524 /tmp/with space.sock";
        assert_eq!(parse_proc_line(spaced), Some((0, "/tmp/with space.sock")));

        assert_eq!(parse_proc_line("Num       RefCount Protocol Flags    Type St Inode Path"), None);
        assert_eq!(parse_proc_line("0000000000000000: 00000002 00000000 00000000 0001 01 41525"), None);
        assert_eq!(parse_proc_line("0000000000000000: 00000002 00000000 00010000 0001 01 41526 @abstract"), None);
    }

    #[test]
    fn test_scan_listeners() {
        let table = "Num       RefCount Protocol Flags    Type St Inode Path\n\
            0000000000000000: 00000002 00000000 00010000 0001 01 1 /run/a.sock\n\
            0000000000000000: 00000003 00000000 00000000 0001 03 2 /run/b.sock\n\
            0000000000000000: 00000002 00000000 00010000 0001 01 3 c.sock\n";
        assert_eq!(scan_listeners(table, Path::new("/run/a.sock")), SocketState::Listening);
        assert_eq!(scan_listeners(table, Path::new("/run/b.sock")), SocketState::Stale);
        assert_eq!(scan_listeners(table, Path::new("/elsewhere/c.sock")), SocketState::Unknown);
    }

    #[tokio::test]
    async fn test_listener_drop_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        let adapter = UnixAdapter::new(&path).unwrap();

        let endpoint = adapter.try_connect(Role::Master).await.unwrap();
        assert!(path.exists());
        drop(endpoint);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_slave_without_master_fails() {
        let dir = tempdir().unwrap();
        let adapter = UnixAdapter::new(dir.path().join("absent.sock")).unwrap();
        let err = adapter.try_connect(Role::Slave).await.unwrap_err();
        assert_eq!(err.category(), "connection");
    }
}
