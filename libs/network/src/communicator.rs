//! Communicator: the handle to one reactor
//!
//! Construction spawns the reactor thread immediately. `connect` and
//! `disconnect` only post a token and return; the status reports progress.
//! `send` moves the message onto the outgoing queue and wakes the reactor.
//! Dropping the communicator quits the reactor (after a final flush of the
//! outgoing queue) and joins its thread.

use crate::config::{CommunicatorConfig, Role};
use crate::peer::PeerShared;
use crate::queue::MessageQueue;
use crate::reactor::{ControlToken, Reactor};
use crate::transports::{create_adapter, Adapter};
use crate::{Result, TransportError};
use emsg_codec::{Message, MessageRegistry};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info};

/// Communicator connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Initialized = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Quit = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Initialized,
            1 => Status::Connecting,
            2 => Status::Connected,
            3 => Status::Disconnecting,
            _ => Status::Quit,
        }
    }
}

/// State shared between the handle and its reactor thread
pub(crate) struct CommunicatorShared {
    pub(crate) role: Role,
    pub(crate) registry: Arc<MessageRegistry>,
    status: AtomicU8,
    local_id: AtomicU64,
    connections: AtomicUsize,
    connect_attempts: AtomicU64,
    peer: RwLock<Option<Weak<PeerShared>>>,
    pub(crate) outgoing: MessageQueue,
    pub(crate) incoming: MessageQueue,
}

impl CommunicatorShared {
    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        let previous = Status::from_u8(self.status.swap(status as u8, Ordering::AcqRel));
        if previous != status {
            debug!(from = ?previous, to = ?status, "Communicator status changed");
        }
    }

    /// Count one bind/connect attempt; called by the reactor only
    pub(crate) fn record_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn local_id(&self) -> u64 {
        self.local_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_local_id(&self, id: u64) {
        self.local_id.store(id, Ordering::Release);
    }

    pub(crate) fn peer(&self) -> Option<Arc<PeerShared>> {
        self.peer.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn connection_added(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_removed(&self) {
        // Never wraps: every removal follows exactly one add
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Handle to a reactor thread bound to one endpoint
pub struct Communicator {
    shared: Arc<CommunicatorShared>,
    control: UnboundedSender<ControlToken>,
    thread: Option<JoinHandle<()>>,
    config: CommunicatorConfig,
}

impl Communicator {
    /// Spawn the reactor for `config`
    ///
    /// Fails with a configuration error for an unusable endpoint, or an
    /// initialization error if the runtime or thread cannot be created.
    pub fn new(config: CommunicatorConfig, registry: Arc<MessageRegistry>) -> Result<Self> {
        let adapter = create_adapter(&config.endpoint)?;
        Self::with_adapter(config, registry, adapter)
    }

    pub(crate) fn with_adapter(
        config: CommunicatorConfig,
        registry: Arc<MessageRegistry>,
        adapter: Box<dyn Adapter>,
    ) -> Result<Self> {
        let shared = Arc::new(CommunicatorShared {
            role: config.role,
            registry,
            status: AtomicU8::new(Status::Initialized as u8),
            local_id: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
            connect_attempts: AtomicU64::new(0),
            peer: RwLock::new(None),
            outgoing: MessageQueue::new(),
            incoming: MessageQueue::new(),
        });

        let (control, control_rx) = mpsc::unbounded_channel();
        let reactor = Reactor::new(Arc::clone(&shared), adapter, control_rx);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                error!(error = %e, "Failed to build reactor runtime");
                TransportError::initialization("Failed to build reactor runtime", e)
            })?;

        let thread = std::thread::Builder::new()
            .name(format!("emsg-reactor-{}", config.role))
            .spawn(move || runtime.block_on(reactor.run()))
            .map_err(|e| {
                error!(error = %e, "Failed to spawn reactor thread");
                TransportError::initialization("Failed to spawn reactor thread", e)
            })?;

        info!(endpoint = %config.endpoint, role = %config.role, "Communicator created");

        Ok(Self {
            shared,
            control,
            thread: Some(thread),
            config,
        })
    }

    /// Build from key/value configuration pairs
    pub fn from_pairs<'a, I>(pairs: I, registry: Arc<MessageRegistry>) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::new(CommunicatorConfig::from_pairs(pairs)?, registry)
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Own peer id (0 for the master, assigned by SET_ID on a slave)
    pub fn local_id(&self) -> u64 {
        self.shared.local_id()
    }

    pub fn set_local_id(&self, id: u64) {
        self.shared.set_local_id(id)
    }

    /// Open data connections on this communicator
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Number of bind/connect attempts made so far
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.shared.registry
    }

    fn signal(&self, token: ControlToken) -> Result<()> {
        self.control
            .send(token)
            .map_err(|_| TransportError::connection("reactor has stopped", None))
    }

    /// Request a bind (master) or connect (slave); returns immediately
    pub fn connect(&self) -> Result<()> {
        match self.status() {
            Status::Quit => Err(TransportError::connection("communicator has quit", None)),
            Status::Connected => Ok(()),
            _ => self.signal(ControlToken::Connect),
        }
    }

    /// Request closing every connection; returns immediately
    pub fn disconnect(&self) -> Result<()> {
        match self.status() {
            Status::Quit => Err(TransportError::connection("communicator has quit", None)),
            _ => self.signal(ControlToken::Disconnect),
        }
    }

    /// Queue a message for the reactor
    ///
    /// The message is moved; clone it first to keep using it.
    pub fn send(&self, msg: Message) -> Result<()> {
        if self.status() == Status::Quit {
            return Err(TransportError::connection("communicator has quit", None));
        }
        self.shared.outgoing.push_tail(msg);
        self.signal(ControlToken::MessageQueued)
    }

    /// Messages received while no peer is attached
    pub fn incoming(&self) -> &MessageQueue {
        &self.shared.incoming
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.shared.incoming.pop_filtered()
    }

    /// Route internal and application traffic to a peer
    pub(crate) fn attach_peer(&self, peer: Weak<PeerShared>) -> Vec<Message> {
        *self.shared.peer.write() = Some(peer);
        self.shared.incoming.drain()
    }

    /// Quit the reactor after a final flush and join its thread
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.control.send(ControlToken::Quit);
        if thread.join().is_err() {
            error!(endpoint = %self.config.endpoint, "Reactor thread panicked");
        }
        self.shared.set_status(Status::Quit);
        debug!(endpoint = %self.config.endpoint, "Communicator shut down");
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("endpoint", &self.config.endpoint.to_string())
            .field("role", &self.role())
            .field("status", &self.status())
            .field("local_id", &self.local_id())
            .finish()
    }
}
