//! Socket Reactor
//!
//! One reactor runs per communicator, on its own thread, inside a
//! single-threaded tokio runtime. It exclusively owns the listener, the data
//! connections and their frame readers. Other threads reach it only through
//! the control channel, whose tokens are wakeups that set pending actions.
//!
//! ## Wake cycle
//!
//! 1. Wait for one event: a control token, a new connection on the listener,
//!    a completed frame read, or the connect retry timer.
//! 2. Apply pending actions in priority order: connect, then disconnect, then
//!    quit. A failed connect or accept arms a 100ms retry timer instead of
//!    spinning; the listener is not polled while it runs.
//! 3. When connected, flush the outgoing queue.
//!
//! ## State machine
//!
//! ```text
//! Initialized -> Connecting <-> Connected -> Disconnecting -> Initialized
//!                                                          \-> Quit
//! ```

pub mod connections;
pub mod frame;

use crate::communicator::{CommunicatorShared, Status};
use crate::config::Role;
use crate::transports::{Adapter, BoxedReader, Endpoint, Link, Listener};
use crate::Result;
use connections::{Connection, ConnectionSet};
use emsg_codec::{types, Message, MessageRegistry, PeerIdBody, RECIPIENT_ALL, RECIPIENT_MASTER};
use frame::{read_frame, InboundFrame};
use futures::future::{AbortHandle, Abortable};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Backoff between failed bind/connect attempts
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Single-token wakeups sent to a reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Connect,
    Disconnect,
    MessageQueued,
    Quit,
}

type FrameStream = Abortable<BoxStream<'static, (u64, Result<InboundFrame>)>>;

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    connecting: bool,
    disconnecting: bool,
    quit: bool,
}

enum Wake {
    Control(ControlToken),
    Accepted(Result<Link>),
    Frame(u64, Result<InboundFrame>),
    RetryElapsed,
}

/// Event loop state, owned by the reactor thread
pub(crate) struct Reactor {
    shared: Arc<CommunicatorShared>,
    adapter: Box<dyn Adapter>,
    control: UnboundedReceiver<ControlToken>,
    listener: Option<Listener>,
    connections: ConnectionSet,
    readers: SelectAll<FrameStream>,
    pending: Pending,
    retry_at: Option<Instant>,
    next_local_id: u64,
}

impl Reactor {
    pub(crate) fn new(
        shared: Arc<CommunicatorShared>,
        adapter: Box<dyn Adapter>,
        control: UnboundedReceiver<ControlToken>,
    ) -> Self {
        Self {
            shared,
            adapter,
            control,
            listener: None,
            connections: ConnectionSet::new(),
            readers: SelectAll::new(),
            pending: Pending::default(),
            retry_at: None,
            next_local_id: 1,
        }
    }

    fn role(&self) -> Role {
        self.shared.role
    }

    fn registry(&self) -> &MessageRegistry {
        &self.shared.registry
    }

    /// Run until quit
    pub(crate) async fn run(mut self) {
        info!(endpoint = %self.adapter.describe(), role = %self.role(), "Reactor started");

        loop {
            if !self.action_ready() {
                // The listener is left alone while accepting backs off
                let listener = self.listener.as_ref().filter(|_| self.retry_at.is_none());
                let wake = tokio::select! {
                    token = self.control.recv() => Wake::Control(token.unwrap_or(ControlToken::Quit)),
                    accepted = accept_next(self.adapter.as_ref(), listener) => Wake::Accepted(accepted),
                    Some((id, result)) = self.readers.next(), if !self.readers.is_empty() => Wake::Frame(id, result),
                    _ = retry_sleep(self.retry_at) => Wake::RetryElapsed,
                };
                self.handle_wake(wake).await;
            }

            while let Ok(token) = self.control.try_recv() {
                self.apply_token(token);
            }

            if self.apply_pending().await {
                break;
            }

            if self.shared.status() == Status::Connected {
                self.flush_outgoing().await;
            }
        }

        self.shared.set_status(Status::Quit);
        info!(endpoint = %self.adapter.describe(), "Reactor stopped");
    }

    /// A pending action can run now without waiting for an event
    fn action_ready(&self) -> bool {
        let connect_ready = self.pending.connecting && self.retry_at.is_none();
        connect_ready || self.pending.disconnecting || self.pending.quit
    }

    async fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Control(token) => self.apply_token(token),
            Wake::Accepted(Ok(link)) => self.register_accepted(link).await,
            Wake::Accepted(Err(e)) => {
                if e.is_retryable() {
                    warn!(error = %e, "Accept failed, backing off");
                } else {
                    error!(error = %e, category = e.category(), "Accept failed, backing off");
                }
                self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
            }
            Wake::Frame(id, result) => self.handle_frame(id, result),
            Wake::RetryElapsed => {
                self.retry_at = None;
                debug!("Retry timer elapsed");
            }
        }
    }

    fn apply_token(&mut self, token: ControlToken) {
        match token {
            ControlToken::Connect => {
                if !self.pending.quit {
                    self.pending.connecting = true;
                    self.pending.disconnecting = false;
                }
            }
            ControlToken::Disconnect => {
                self.pending.disconnecting = true;
                self.pending.connecting = false;
            }
            ControlToken::Quit => {
                self.pending.quit = true;
                self.pending.connecting = false;
            }
            ControlToken::MessageQueued => {}
        }
    }

    /// Apply the highest-priority ready action; true when the loop must exit
    async fn apply_pending(&mut self) -> bool {
        if self.pending.connecting {
            if self.retry_at.is_none() {
                self.attempt_connect().await;
            }
        } else if self.pending.disconnecting {
            self.pending.disconnecting = false;
            self.shared.set_status(Status::Disconnecting);
            self.close_all();
            self.retry_at = None;
            self.shared.set_status(Status::Initialized);
            info!(endpoint = %self.adapter.describe(), "Disconnected");
        } else if self.pending.quit {
            if self.shared.status() == Status::Connected {
                self.flush_outgoing().await;
            }
            self.close_all();
            return true;
        }
        false
    }

    async fn attempt_connect(&mut self) {
        if self.shared.status() == Status::Connected {
            self.pending.connecting = false;
            return;
        }
        self.shared.set_status(Status::Connecting);
        self.shared.record_attempt();

        match self.adapter.try_connect(self.role()).await {
            Ok(Endpoint::Listening(listener)) => {
                info!(local = %listener.local_description(), "Listening for slaves");
                self.listener = Some(listener);
                self.connected();
            }
            Ok(Endpoint::Connected(link)) => {
                info!(remote = %link.remote, "Connected to master");
                self.register(RECIPIENT_MASTER, link);
                self.connected();
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    endpoint = %self.adapter.describe(),
                    error = %e,
                    retry_ms = RETRY_INTERVAL.as_millis() as u64,
                    "Connect failed, will retry"
                );
                self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
            }
            Err(e) => {
                // Will not clear by itself; keep backing off so a fix on disk is picked up
                error!(
                    endpoint = %self.adapter.describe(),
                    error = %e,
                    category = e.category(),
                    "Connect failed"
                );
                self.retry_at = Some(Instant::now() + RETRY_INTERVAL);
            }
        }
    }

    fn connected(&mut self) {
        self.pending.connecting = false;
        self.retry_at = None;
        self.shared.set_status(Status::Connected);
    }

    fn allocate_id(&mut self) -> u64 {
        if let Some(peer) = self.shared.peer() {
            return peer.allocate_slave_id();
        }
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }

    /// Register an accepted slave and send it its id before anything else
    async fn register_accepted(&mut self, link: Link) {
        let id = self.allocate_id();
        info!(peer_id = id, remote = %link.remote, "Slave connected");
        self.register(id, link);

        let set_id = self.registry().set_id(id, self.shared.local_id(), id);
        let frame = match self.registry().encode(&set_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer_id = id, error = %e, "Failed to encode SET_ID");
                self.teardown(id, "id assignment failed");
                return;
            }
        };
        if let Some(Err(e)) = self.connections.send_to(id, &frame).await {
            warn!(peer_id = id, error = %e, "Failed to send SET_ID");
            self.teardown(id, "id assignment failed");
        }
    }

    fn register(&mut self, id: u64, link: Link) {
        let Link { reader, writer, remote } = link;
        let abort = self.spawn_reader(id, reader);
        let conn = Connection::new(id, writer, remote).with_reader(abort);
        if let Some(old) = self.connections.insert(conn) {
            warn!(peer_id = id, remote = %old.remote, "Replaced existing connection");
            self.shared.connection_removed();
            self.deliver_internal(self.registry().connection_event(types::CONNECTION_DEL, id));
        }
        self.shared.connection_added();
        self.deliver_internal(self.registry().connection_event(types::CONNECTION_ADD, id));
    }

    fn spawn_reader(&mut self, id: u64, reader: BoxedReader) -> AbortHandle {
        let registry = Arc::clone(&self.shared.registry);
        let frames = stream::unfold(Some(reader), move |state| {
            let registry = Arc::clone(&registry);
            async move {
                let mut reader = state?;
                let result = read_frame(&mut reader, &registry).await;
                let next = result.is_ok().then_some(reader);
                Some(((id, result), next))
            }
        })
        .boxed();

        let (abort, registration) = AbortHandle::new_pair();
        self.readers.push(Abortable::new(frames, registration));
        abort
    }

    /// Remove a connection exactly once and report it
    fn teardown(&mut self, id: u64, reason: &str) {
        let Some(conn) = self.connections.remove(id) else {
            return;
        };
        info!(peer_id = id, remote = %conn.remote, reason, "Connection closed");
        self.shared.connection_removed();
        self.deliver_internal(self.registry().connection_event(types::CONNECTION_DEL, id));

        if !self.role().is_master() && id == RECIPIENT_MASTER && self.shared.status() == Status::Connected {
            info!("Lost master connection");
            self.shared.set_status(Status::Initialized);
        }
    }

    fn close_all(&mut self) {
        for id in self.connections.ids() {
            self.teardown(id, "closing");
        }
        if let Some(listener) = self.listener.take() {
            debug!(local = %listener.local_description(), "Closing listener");
        }
    }

    fn handle_frame(&mut self, id: u64, result: Result<InboundFrame>) {
        if !self.connections.contains(id) {
            return;
        }
        match result {
            Ok(InboundFrame::Message(msg)) => self.dispatch(id, msg),
            Ok(InboundFrame::BadMagic { magic }) => {
                warn!(peer_id = id, magic = ?magic, "Dropping frame with bad magic");
            }
            Ok(InboundFrame::Skipped { type_id, payload_len }) => {
                warn!(
                    peer_id = id,
                    type_id = format_args!("{:#010x}", type_id),
                    bytes = payload_len,
                    "Dropping frame of unregistered type"
                );
            }
            Ok(InboundFrame::Invalid { type_id, error }) => {
                warn!(
                    peer_id = id,
                    type_id = format_args!("{:#010x}", type_id),
                    error = %error,
                    "Dropping undecodable frame"
                );
            }
            Err(e) => {
                debug!(peer_id = id, error = %e, "Read failed");
                self.teardown(id, "read failed");
            }
        }
    }

    fn dispatch(&mut self, id: u64, msg: Message) {
        debug!(
            peer_id = id,
            type_id = format_args!("{:#010x}", msg.type_id),
            sender_id = msg.sender_id,
            "Frame received"
        );

        let type_id = msg.type_id;
        match type_id {
            types::LEAVE => {
                if self.role().is_master() {
                    self.teardown(id, "slave left");
                }
            }
            types::TERM_ACK => info!(peer_id = msg.sender_id, "Slave acknowledged TERM"),
            types::SET_ID | types::TERM => {
                if let Some(peer) = self.shared.peer() {
                    peer.deliver_internal(msg);
                } else if type_id == types::SET_ID {
                    if let Some(body) = msg.body_as::<PeerIdBody>() {
                        info!(peer_id = body.peer_id, "Assigned id");
                        self.shared.set_local_id(body.peer_id);
                    }
                } else {
                    info!("TERM received, quitting");
                    self.pending.quit = true;
                }
            }
            _ if msg.is_internal() || msg.is_status() => {
                warn!(
                    peer_id = id,
                    type_id = format_args!("{:#010x}", type_id),
                    "Dropping local-only message received from the wire"
                );
            }
            _ => match self.shared.peer() {
                Some(peer) => peer.deliver(msg),
                None => self.shared.incoming.push_tail(msg),
            },
        }
    }

    fn deliver_internal(&self, msg: Message) {
        if let Some(peer) = self.shared.peer() {
            peer.deliver_internal(msg);
        }
    }

    /// Send everything queued for output
    async fn flush_outgoing(&mut self) {
        for msg in self.shared.outgoing.drain() {
            let frame = match self.registry().encode(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(type_id = format_args!("{:#010x}", msg.type_id), error = %e, "Dropping unencodable message");
                    continue;
                }
            };

            let failed = if msg.recipient_id == RECIPIENT_ALL {
                self.connections.broadcast(&frame).await
            } else {
                let target = if self.role().is_master() {
                    msg.recipient_id
                } else {
                    RECIPIENT_MASTER
                };
                match self.connections.send_to(target, &frame).await {
                    Some(Ok(())) => Vec::new(),
                    Some(Err(e)) => {
                        warn!(peer_id = target, error = %e, "Write failed");
                        vec![target]
                    }
                    None => {
                        warn!(
                            recipient_id = msg.recipient_id,
                            type_id = format_args!("{:#010x}", msg.type_id),
                            "No connection for recipient, dropping message"
                        );
                        Vec::new()
                    }
                }
            };

            for id in failed {
                self.teardown(id, "write failed");
            }
        }
    }
}

async fn accept_next(adapter: &dyn Adapter, listener: Option<&Listener>) -> Result<Link> {
    match listener {
        Some(listener) => adapter.accept(listener).await,
        None => std::future::pending().await,
    }
}

async fn retry_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
