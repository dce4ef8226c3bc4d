//! Data connections owned by one reactor
//!
//! Connections are keyed by peer id: slave ids on a master, `0` for the
//! master link on a slave. Only the reactor thread touches the set. Removing
//! a connection aborts its reader, and `remove` returns the entry at most
//! once, which is what keeps the connection count exact.

use super::frame::write_frame;
use crate::transports::BoxedWriter;
use crate::Result;
use futures::future::AbortHandle;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One registered data connection
pub struct Connection {
    pub id: u64,
    pub remote: String,
    writer: BoxedWriter,
    reader_abort: Option<AbortHandle>,
}

impl Connection {
    pub fn new(id: u64, writer: BoxedWriter, remote: impl Into<String>) -> Self {
        Self {
            id,
            remote: remote.into(),
            writer,
            reader_abort: None,
        }
    }

    /// Tie the connection's reader to its lifetime in the set
    pub fn with_reader(mut self, abort: AbortHandle) -> Self {
        self.reader_abort = Some(abort);
        self
    }

    pub async fn write(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, frame).await
    }

    fn close(&mut self) {
        if let Some(abort) = self.reader_abort.take() {
            abort.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Peer id to connection map
#[derive(Debug, Default)]
pub struct ConnectionSet {
    conns: HashMap<u64, Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning any entry it replaced
    pub fn insert(&mut self, conn: Connection) -> Option<Connection> {
        self.conns.insert(conn.id, conn)
    }

    /// Deregister a connection; `None` if it was already gone
    pub fn remove(&mut self, id: u64) -> Option<Connection> {
        let mut conn = self.conns.remove(&id)?;
        conn.close();
        Some(conn)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.conns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Write a frame to one connection
    ///
    /// The caller removes the connection on error.
    pub async fn send_to(&mut self, id: u64, frame: &[u8]) -> Option<Result<()>> {
        let conn = self.conns.get_mut(&id)?;
        let result = conn.write(frame).await;
        if result.is_ok() {
            debug!(peer_id = id, bytes = frame.len(), "Frame sent");
        }
        Some(result)
    }

    /// Write a frame to every connection
    ///
    /// Every connection gets its attempt regardless of earlier failures.
    /// Returns the ids whose write failed, for the caller to tear down.
    pub async fn broadcast(&mut self, frame: &[u8]) -> Vec<u64> {
        let mut failed = Vec::new();
        for (id, conn) in self.conns.iter_mut() {
            if let Err(e) = conn.write(frame).await {
                warn!(peer_id = *id, remote = %conn.remote, error = %e, "Broadcast write failed");
                failed.push(*id);
            }
        }
        debug!(
            targets = self.conns.len(),
            failed = failed.len(),
            bytes = frame.len(),
            "Frame broadcast"
        );
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{AbortHandle, Abortable};
    use tokio_test::io::Builder;

    fn mock_conn(id: u64, mock: tokio_test::io::Mock) -> Connection {
        Connection::new(id, Box::new(mock), format!("mock-{}", id))
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_failure() {
        let frame = b"EMSG-frame".to_vec();
        let mut set = ConnectionSet::new();
        set.insert(mock_conn(1, Builder::new().write(&frame).build()));
        set.insert(mock_conn(
            2,
            Builder::new()
                .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
                .build(),
        ));
        set.insert(mock_conn(3, Builder::new().write(&frame).build()));

        let failed = set.broadcast(&frame).await;
        assert_eq!(failed, vec![2]);

        assert!(set.remove(2).is_some());
        assert!(set.remove(2).is_none());
        assert_eq!(set.ids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_send_to_missing_connection() {
        let mut set = ConnectionSet::new();
        assert!(set.send_to(9, b"x").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_aborts_reader() {
        let (handle, registration) = AbortHandle::new_pair();
        let reader = Abortable::new(std::future::pending::<()>(), registration);

        let mut set = ConnectionSet::new();
        set.insert(mock_conn(4, Builder::new().build()).with_reader(handle));
        assert!(set.contains(4));

        drop(set.remove(4));
        assert!(reader.await.is_err());
        assert!(set.is_empty());
    }
}
