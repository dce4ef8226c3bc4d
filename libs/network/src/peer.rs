//! Peer: the session object over one or more communicators
//!
//! A peer owns its communicators, allocates slave ids, and runs an internal
//! thread that consumes the control traffic its reactors hand over:
//!
//! - `CONNECTION_ADD`/`CONNECTION_DEL` adjust the connection count and raise
//!   a `PEER_CHANGED` status event
//! - `SET_ID` assigns this peer's id, propagates it to every communicator,
//!   then raises `PEER_CHANGED` and `PEER_READY`
//! - `TERM` makes a slave acknowledge, flush, and terminate
//!
//! Application messages and status events land on the incoming queue, which
//! the caller drains with [`Peer::try_recv`], the blocking waits, or a
//! dedicated event-loop thread.

use crate::communicator::Communicator;
use crate::config::Role;
use crate::queue::MessageQueue;
use crate::{Result, TransportError};
use emsg_codec::{types, Message, MessageRegistry, PeerIdBody, PeerStatus, RECIPIENT_ALL, RECIPIENT_MASTER};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Re-check interval while the master waits for slaves to leave
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct PeerState {
    communicators: Vec<Communicator>,
    connections: usize,
    next_slave_id: u64,
    shutdown_timeout: Option<Duration>,
}

/// State reachable from the reactors and the peer's threads
pub(crate) struct PeerShared {
    role: Role,
    id: AtomicU64,
    registry: Arc<MessageRegistry>,
    state: Mutex<PeerState>,
    connections_changed: Condvar,
    incoming: MessageQueue,
    internal: MessageQueue,
    stop_internal: AtomicBool,
}

impl PeerShared {
    fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Next slave id; ids start at 1 and never repeat
    pub(crate) fn allocate_slave_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_slave_id;
        state.next_slave_id += 1;
        id
    }

    /// Hand a control message to the internal thread
    pub(crate) fn deliver_internal(&self, msg: Message) {
        self.internal.push_tail(msg);
    }

    /// Queue an application message or status event for the caller
    pub(crate) fn deliver(&self, msg: Message) {
        self.incoming.push_tail(msg);
    }

    fn send(&self, mut msg: Message) -> Result<()> {
        msg.sender_id = self.id();
        let state = self.state.lock();
        let Some((last, rest)) = state.communicators.split_last() else {
            return Err(TransportError::connection("no communicators attached", None));
        };

        let mut first_error = None;
        for comm in rest {
            if let Err(e) = comm.send(msg.dup()) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = last.send(msg) {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop every communicator and disable the incoming queue
    ///
    /// Dropping a communicator flushes its outgoing queue and joins its
    /// reactor, so the list is taken out of the lock first.
    fn terminate(&self) {
        let communicators = std::mem::take(&mut self.state.lock().communicators);
        let count = communicators.len();
        drop(communicators);

        let sentinel_id = self.id();
        self.incoming
            .enable(false, || self.registry.control(types::QUEUE_DISABLED, sentinel_id, sentinel_id));
        if count > 0 {
            info!(peer_id = sentinel_id, communicators = count, "Peer terminated");
        }
    }

    fn handle_internal(&self, msg: Message) {
        match msg.type_id {
            types::CONNECTION_ADD | types::CONNECTION_DEL => self.connection_event(msg),
            types::SET_ID => self.assign_id(msg),
            types::TERM => self.handle_term(),
            other => warn!(type_id = format_args!("{:#010x}", other), "Unexpected internal message"),
        }
    }

    fn connection_event(&self, msg: Message) {
        let remote_id = msg
            .body_as::<PeerIdBody>()
            .map_or(msg.sender_id, |body| body.peer_id);
        let (status, count) = {
            let mut state = self.state.lock();
            if msg.type_id == types::CONNECTION_ADD {
                state.connections += 1;
                (PeerStatus::ConnectionAdded, state.connections)
            } else {
                state.connections = state.connections.saturating_sub(1);
                (PeerStatus::ConnectionDeleted, state.connections)
            }
        };
        self.connections_changed.notify_all();
        debug!(peer_id = remote_id, connections = count, status = ?status, "Connection count changed");

        let id = self.id();
        self.deliver(self.registry.peer_changed(id, status, remote_id));
    }

    fn assign_id(&self, msg: Message) {
        let Some(peer_id) = msg.body_as::<PeerIdBody>().map(|body| body.peer_id) else {
            warn!("SET_ID without a peer id body");
            return;
        };
        self.id.store(peer_id, Ordering::Release);
        for comm in self.state.lock().communicators.iter() {
            comm.set_local_id(peer_id);
        }
        info!(peer_id, "Peer id assigned");

        self.deliver(self.registry.peer_changed(peer_id, PeerStatus::IdChanged, peer_id));
        self.deliver(self.registry.control(types::PEER_READY, peer_id, peer_id));
    }

    fn handle_term(&self) {
        if self.role.is_master() {
            warn!("Master ignoring TERM");
            return;
        }
        let id = self.id();
        info!(peer_id = id, "TERM received");
        if let Err(e) = self.send(self.registry.control(types::TERM_ACK, RECIPIENT_MASTER, id)) {
            warn!(error = %e, "Failed to queue TERM_ACK");
        }
        self.terminate();
    }

    fn run_internal(&self) {
        debug!(role = %self.role, "Internal thread started");
        while let Some(msg) = self.internal.wait_pop_filtered(None, Some(&self.stop_internal)) {
            self.handle_internal(msg);
        }
        debug!(role = %self.role, "Internal thread stopped");
    }
}

struct EventLoop {
    thread: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Session object owning communicators and the application queue
pub struct Peer {
    shared: Arc<PeerShared>,
    internal_thread: Option<JoinHandle<()>>,
    event_loop: Mutex<Option<EventLoop>>,
    shut_down: AtomicBool,
}

impl Peer {
    /// Create a peer and start its internal thread
    ///
    /// A master has id 0; a slave starts at 0 and takes the id sent in
    /// `SET_ID` once a master accepts it.
    pub fn new(role: Role, registry: Arc<MessageRegistry>) -> Result<Self> {
        let shared = Arc::new(PeerShared {
            role,
            id: AtomicU64::new(0),
            registry,
            state: Mutex::new(PeerState {
                communicators: Vec::new(),
                connections: 0,
                next_slave_id: 1,
                shutdown_timeout: None,
            }),
            connections_changed: Condvar::new(),
            incoming: MessageQueue::new(),
            internal: MessageQueue::new(),
            stop_internal: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let internal_thread = std::thread::Builder::new()
            .name(format!("emsg-peer-{}", role))
            .spawn(move || worker.run_internal())
            .map_err(|e| {
                error!(error = %e, "Failed to spawn peer internal thread");
                TransportError::initialization("Failed to spawn peer internal thread", e)
            })?;

        info!(role = %role, "Peer created");
        Ok(Self {
            shared,
            internal_thread: Some(internal_thread),
            event_loop: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.shared.registry
    }

    /// Open connections across every communicator
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections
    }

    pub fn communicator_count(&self) -> usize {
        self.shared.state.lock().communicators.len()
    }

    /// Bound the master's wait for slaves during shutdown
    pub fn set_shutdown_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().shutdown_timeout = timeout;
    }

    /// Take ownership of a communicator
    ///
    /// Attach before connecting: connections opened earlier are not counted.
    /// Anything the communicator received on its own moves to the peer's
    /// incoming queue.
    pub fn attach(&self, comm: Communicator) {
        comm.set_local_id(self.id());
        for msg in comm.attach_peer(Arc::downgrade(&self.shared)) {
            self.shared.deliver(msg);
        }
        debug!(communicator = ?comm, "Communicator attached");
        self.shared.state.lock().communicators.push(comm);
    }

    /// Ask every communicator to bind or connect
    pub fn connect(&self) -> Result<()> {
        for comm in self.shared.state.lock().communicators.iter() {
            comm.connect()?;
        }
        Ok(())
    }

    /// Stamp the sender id and queue on every communicator
    pub fn send(&self, msg: Message) -> Result<()> {
        self.shared.send(msg)
    }

    /// Build a registered message from named fields and send it
    pub fn send_fields<'a, I>(&self, type_id: u32, recipient_id: u64, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, emsg_codec::FieldValue)>,
    {
        let msg = self.shared.registry.new_message(type_id, recipient_id, self.id(), fields)?;
        self.send(msg)
    }

    /// The application queue
    pub fn incoming(&self) -> &MessageQueue {
        &self.shared.incoming
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.shared.incoming.pop_filtered()
    }

    /// Block until a message passes the filters
    ///
    /// After termination this returns the `QUEUE_DISABLED` sentinel.
    pub fn wait_for_message(&self) -> Option<Message> {
        self.shared.incoming.wait_pop_filtered(None, None)
    }

    pub fn wait_for_message_timeout(&self, timeout: Duration) -> Option<Message> {
        self.shared.incoming.wait_pop_filtered(Some(timeout), None)
    }

    pub fn add_filter(&self, type_id: u32) {
        self.shared.incoming.add_filter(type_id);
    }

    pub fn remove_filter(&self, type_id: u32) {
        self.shared.incoming.remove_filter(type_id);
    }

    pub fn clear_filters(&self) {
        self.shared.incoming.clear_filters();
    }

    /// Whether the peer has terminated its communicators
    pub fn is_terminated(&self) -> bool {
        self.shared.incoming.is_disabled()
    }

    /// Run the shutdown handshake and terminate
    ///
    /// A master broadcasts TERM and waits until every slave has gone (or the
    /// shutdown timeout passes). A slave sends LEAVE and terminates without
    /// waiting. Calling this again is a no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id();

        if self.role().is_master() {
            let term = self.shared.registry.control(types::TERM, RECIPIENT_ALL, id);
            match self.shared.send(term) {
                Ok(()) => self.wait_for_slaves(),
                Err(e) => warn!(error = %e, "Failed to broadcast TERM"),
            }
        } else {
            let leave = self.shared.registry.control(types::LEAVE, RECIPIENT_MASTER, id);
            if let Err(e) = self.shared.send(leave) {
                debug!(error = %e, "LEAVE not sent");
            }
        }

        self.shared.terminate();
    }

    fn wait_for_slaves(&self) {
        let mut state = self.shared.state.lock();
        let deadline = state.shutdown_timeout.map(|t| Instant::now() + t);
        info!(connections = state.connections, "Waiting for slaves to leave");

        while state.connections > 0 {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(connections = state.connections, "Shutdown timeout with slaves still connected");
                return;
            }
            // Bounded wait: a lost notification only costs one interval
            self.shared
                .connections_changed
                .wait_for(&mut state, SHUTDOWN_POLL_INTERVAL);
        }
        debug!("All slaves gone");
    }

    /// Start a thread that passes every incoming message to `callback`
    ///
    /// The thread exits on its own once the queue is disabled.
    pub fn start_event_loop<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut slot = self.event_loop.lock();
        if slot.is_some() {
            return Err(TransportError::protocol("event loop already running"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("emsg-peer-events".to_string())
            .spawn(move || {
                while let Some(msg) = shared.incoming.wait_pop_filtered(None, Some(&stop_flag)) {
                    if msg.type_id == types::QUEUE_DISABLED {
                        debug!("Incoming queue disabled, event loop exiting");
                        break;
                    }
                    callback(msg);
                }
            })
            .map_err(|e| TransportError::initialization("Failed to spawn event loop thread", e))?;

        *slot = Some(EventLoop { thread, stop });
        Ok(())
    }

    /// Stop the event loop and wait for it
    pub fn stop_event_loop(&self) {
        let Some(event_loop) = self.event_loop.lock().take() else {
            return;
        };
        event_loop.stop.store(true, Ordering::Release);
        self.shared.incoming.wake_all();

        if event_loop.thread.thread().id() == std::thread::current().id() {
            // Called from the callback itself; the loop sees the flag on return
            return;
        }
        if event_loop.thread.join().is_err() {
            error!("Event loop thread panicked");
        }
    }

    /// Let the event loop run on its own until the queue is disabled
    pub fn detach_event_loop(&self) {
        if self.event_loop.lock().take().is_some() {
            debug!("Event loop detached");
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop_event_loop();
        self.shared.terminate();

        self.shared.stop_internal.store(true, Ordering::Release);
        self.shared.internal.wake_all();
        if let Some(thread) = self.internal_thread.take() {
            if thread.join().is_err() {
                error!("Peer internal thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("connections", &self.connection_count())
            .finish()
    }
}
