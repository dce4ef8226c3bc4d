//! EMSG Network Layer
//!
//! Master/slave message transport built on the `emsg-codec` wire format.
//!
//! ## Architecture
//!
//! ```text
//! Peer ── owns ──> Communicator ── control channel ──> Reactor thread
//!  │                   │                                  │
//!  │ incoming queue    │ outgoing queue                   ├── Adapter (unix / inet)
//!  └── internal thread └──────────────────────────────────└── ConnectionSet
//! ```
//!
//! - [`Communicator`]: one endpoint, one reactor thread
//! - [`Peer`]: id allocation, control message dispatch, shutdown handshake
//! - [`MessageQueue`]: filtered FIFO shared between threads
//!
//! ## Example
//!
//! ```no_run
//! use emsg_codec::MessageRegistry;
//! use emsg_network::{Communicator, CommunicatorConfig, Peer, Role};
//! use std::sync::Arc;
//!
//! # fn main() -> emsg_network::Result<()> {
//! let registry = Arc::new(MessageRegistry::new());
//! let peer = Peer::new(Role::Master, Arc::clone(&registry))?;
//! let config: CommunicatorConfig = CommunicatorConfig::from_pairs([("socket", "/tmp/emsg.sock"), ("role", "master")])?;
//! peer.attach(Communicator::new(config, registry)?);
//! peer.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod communicator;
pub mod config;
pub mod error;
pub mod peer;
pub mod queue;
pub mod reactor;
pub mod transports;

pub use communicator::{Communicator, Status};
pub use config::{CommunicatorConfig, EndpointConfig, Role};
pub use error::{Result, TransportError};
pub use peer::{Peer, SHUTDOWN_POLL_INTERVAL};
pub use queue::MessageQueue;
pub use reactor::{ControlToken, RETRY_INTERVAL};
pub use transports::{create_adapter, Adapter, Endpoint, InetAdapter, Link, Listener, TransportType, UnixAdapter};
