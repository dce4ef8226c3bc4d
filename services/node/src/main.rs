//! EMSG demo node
//!
//! A master listens, logs every text message its slaves send and runs the
//! TERM handshake on Ctrl-C. A slave waits for its id, sends a few text
//! messages and leaves.

mod settings;

use anyhow::{bail, Context, Result};
use clap::Parser;
use emsg_codec::{
    types, FieldKind, FieldValue, Message, MessageClass, MessageRegistry, PeerChangedBody, Record, RECIPIENT_MASTER,
};
use emsg_network::{Communicator, EndpointConfig, Peer, Role};
use settings::NodeSettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application message carried by the demo
const TEXT_MESSAGE: u32 = 0x0000_0100;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint: unix:<path> or inet:<host>:<port>
    #[arg(short, long)]
    endpoint: Option<EndpointConfig>,

    /// master or slave
    #[arg(short, long)]
    role: Option<Role>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Text messages a slave sends before leaving
    #[arg(short, long)]
    messages: Option<u64>,

    /// Seconds a slave waits for its id
    #[arg(long, default_value_t = 10)]
    ready_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = NodeSettings::load(args.config.as_deref()).context("Failed to load node settings")?;
    if let Some(endpoint) = args.endpoint.clone() {
        settings.endpoint = endpoint;
    }
    if let Some(role) = args.role {
        settings.role = role;
    }
    if let Some(messages) = args.messages {
        settings.messages = messages;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = %settings.role,
        endpoint = %settings.endpoint,
        "Starting EMSG node"
    );

    let registry = Arc::new(build_registry()?);
    let peer = Arc::new(Peer::new(settings.role, Arc::clone(&registry)).context("Failed to create peer")?);
    peer.set_shutdown_timeout(settings.shutdown_timeout_ms.map(Duration::from_millis));

    let communicator =
        Communicator::new(settings.communicator(), Arc::clone(&registry)).context("Failed to create communicator")?;
    peer.attach(communicator);
    peer.connect().context("Failed to start connecting")?;

    match settings.role {
        Role::Master => run_master(peer).await,
        Role::Slave => {
            let ready_timeout = Duration::from_secs(args.ready_timeout);
            let count = settings.messages;
            tokio::task::spawn_blocking(move || run_slave(&peer, count, ready_timeout))
                .await
                .context("Slave task failed")?
        }
    }
}

fn build_registry() -> Result<MessageRegistry> {
    let registry = MessageRegistry::new();
    registry
        .register_type(MessageClass::record(
            TEXT_MESSAGE,
            "text",
            &[("seq", FieldKind::U64), ("text", FieldKind::Str)],
        ))
        .context("Failed to register text message")?;
    Ok(registry)
}

fn describe(msg: &Message) -> String {
    match msg.type_id {
        TEXT_MESSAGE => {
            let record = msg.body_as::<Record>();
            let seq = record.and_then(|r| r.get(0)).and_then(FieldValue::as_u64).unwrap_or_default();
            let text = record.and_then(|r| r.get(1)).and_then(FieldValue::as_str).unwrap_or_default();
            format!("#{} {:?}", seq, text)
        }
        types::PEER_CHANGED => match msg.body_as::<PeerChangedBody>() {
            Some(body) => format!("{:?} remote={}", body.status(), body.remote_id),
            None => "peer changed".to_string(),
        },
        other => format!("type {:#010x}", other),
    }
}

async fn run_master(peer: Arc<Peer>) -> Result<()> {
    peer.start_event_loop(|msg| match msg.type_id {
        TEXT_MESSAGE => info!(sender_id = msg.sender_id, message = %describe(&msg), "Text received"),
        types::PEER_CHANGED => info!(change = %describe(&msg), "Slaves changed"),
        _ => debug!(sender_id = msg.sender_id, message = %describe(&msg), "Message received"),
    })
    .context("Failed to start event loop")?;

    info!("Master running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!(connections = peer.connection_count(), "Shutting down master");
    let shutdown = Arc::clone(&peer);
    tokio::task::spawn_blocking(move || {
        shutdown.shutdown();
        shutdown.stop_event_loop();
    })
    .await
    .context("Shutdown task failed")?;

    info!("Master stopped");
    Ok(())
}

fn run_slave(peer: &Peer, count: u64, ready_timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + ready_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("no id from master within {:?}", ready_timeout);
        }
        match peer.wait_for_message_timeout(remaining) {
            Some(msg) if msg.type_id == types::PEER_READY => break,
            Some(msg) if msg.type_id == types::QUEUE_DISABLED => bail!("terminated before receiving an id"),
            Some(msg) => debug!(message = %describe(&msg), "Ignoring message before ready"),
            None => {}
        }
    }
    info!(peer_id = peer.id(), "Slave ready");

    for seq in 0..count {
        let text = format!("hello {} from slave {}", seq, peer.id());
        peer.send_fields(
            TEXT_MESSAGE,
            RECIPIENT_MASTER,
            [("seq", FieldValue::U64(seq)), ("text", FieldValue::from(text))],
        )
        .with_context(|| format!("Failed to send message {}", seq))?;
    }
    info!(sent = count, "Messages queued, leaving");

    if peer.is_terminated() {
        warn!("Master terminated the session before we left");
    }
    peer.shutdown();
    Ok(())
}
