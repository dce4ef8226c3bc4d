//! Master/slave sessions over real sockets
//!
//! Each test builds its own registry and socket path, so they run in
//! parallel without sharing state.

use emsg_codec::{
    types, FieldKind, FieldValue, Message, MessageClass, MessageRegistry, PeerChangedBody, PeerStatus, Record,
    RECIPIENT_ALL,
};
use emsg_network::{Communicator, CommunicatorConfig, EndpointConfig, Peer, Role, Status, RETRY_INTERVAL};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const TEXT: u32 = 0x10;
const WAIT: Duration = Duration::from_secs(5);

fn registry() -> Arc<MessageRegistry> {
    let registry = MessageRegistry::new();
    registry
        .register_type(MessageClass::record(TEXT, "text", &[("text", FieldKind::Str)]))
        .unwrap();
    Arc::new(registry)
}

fn unix_peer(role: Role, path: &Path, registry: &Arc<MessageRegistry>) -> Peer {
    let peer = Peer::new(role, Arc::clone(registry)).unwrap();
    let config = CommunicatorConfig::new(role, EndpointConfig::unix(path));
    peer.attach(Communicator::new(config, Arc::clone(registry)).unwrap());
    peer.connect().unwrap();
    peer
}

fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

/// Next message of `type_id`, skipping status events and other traffic
fn next_of(peer: &Peer, type_id: u32) -> Option<Message> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(msg) = peer.wait_for_message_timeout(Duration::from_millis(50)) {
            if msg.type_id == type_id {
                return Some(msg);
            }
        }
    }
    None
}

fn text_of(msg: &Message) -> String {
    msg.body_as::<Record>()
        .and_then(|r| r.get(0))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn text(registry: &MessageRegistry, recipient: u64, body: &str) -> Message {
    registry
        .new_message(TEXT, recipient, 0, [("text", FieldValue::from(body))])
        .unwrap()
}

#[test]
fn test_slaves_get_distinct_ids_and_exchange_messages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.sock");
    let registry = registry();

    let master = unix_peer(Role::Master, &path, &registry);
    assert!(wait_until(|| path.exists()));

    let slaves: Vec<Peer> = (0..3).map(|_| unix_peer(Role::Slave, &path, &registry)).collect();
    for slave in &slaves {
        assert!(next_of(slave, types::PEER_READY).is_some());
    }

    let mut ids: Vec<u64> = slaves.iter().map(Peer::id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(wait_until(|| master.connection_count() == 3));

    // Slave to master, sender stamped with the slave's id
    let sender = &slaves[1];
    sender.send(text(&registry, 0, "hello master")).unwrap();
    let got = next_of(&master, TEXT).unwrap();
    assert_eq!(got.sender_id, sender.id());
    assert_eq!(text_of(&got), "hello master");

    // Broadcast reaches every slave
    master.send(text(&registry, RECIPIENT_ALL, "to all")).unwrap();
    for slave in &slaves {
        let got = next_of(slave, TEXT).unwrap();
        assert_eq!(text_of(&got), "to all");
        assert_eq!(got.sender_id, 0);
    }

    // Directed message reaches only its recipient
    let target = slaves[2].id();
    master.send(text(&registry, target, "just you")).unwrap();
    assert_eq!(text_of(&next_of(&slaves[2], TEXT).unwrap()), "just you");
    for slave in &slaves[..2] {
        assert!(slave.wait_for_message_timeout(Duration::from_millis(200)).map_or(true, |m| m.type_id != TEXT));
    }
}

#[test]
fn test_master_shutdown_drains_all_slaves() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("term.sock");
    let registry = registry();

    let master = unix_peer(Role::Master, &path, &registry);
    assert!(wait_until(|| path.exists()));
    let slaves: Vec<Peer> = (0..4).map(|_| unix_peer(Role::Slave, &path, &registry)).collect();
    assert!(wait_until(|| master.connection_count() == 4));

    let started = Instant::now();
    master.shutdown();
    assert!(started.elapsed() < WAIT);
    assert_eq!(master.connection_count(), 0);
    assert!(master.is_terminated());

    for slave in &slaves {
        assert!(wait_until(|| slave.is_terminated()));
        assert_eq!(slave.wait_for_message().unwrap().type_id, types::QUEUE_DISABLED);
    }
}

#[test]
fn test_slave_leave_closes_one_connection() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("leave.sock");
    let registry = registry();

    let master = unix_peer(Role::Master, &path, &registry);
    assert!(wait_until(|| path.exists()));
    let staying = unix_peer(Role::Slave, &path, &registry);
    let leaving = unix_peer(Role::Slave, &path, &registry);
    assert!(wait_until(|| master.connection_count() == 2));

    leaving.shutdown();
    assert!(leaving.is_terminated());
    assert!(wait_until(|| master.connection_count() == 1));

    master.send(text(&registry, RECIPIENT_ALL, "still here")).unwrap();
    assert_eq!(text_of(&next_of(&staying, TEXT).unwrap()), "still here");
}

#[test]
fn test_slave_retries_until_master_appears() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("late.sock");
    let registry = registry();

    let slave = unix_peer(Role::Slave, &path, &registry);
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(slave.id(), 0);

    let _master = unix_peer(Role::Master, &path, &registry);
    assert!(next_of(&slave, types::PEER_READY).is_some());
    assert_eq!(slave.id(), 1);
}

#[test]
fn test_bind_conflict_backs_off() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.sock");
    let registry = registry();

    let holder = Communicator::new(
        CommunicatorConfig::new(Role::Master, EndpointConfig::unix(&path)),
        Arc::clone(&registry),
    )
    .unwrap();
    holder.connect().unwrap();
    assert!(wait_until(|| holder.is_connected()));

    let contender = Communicator::new(
        CommunicatorConfig::new(Role::Master, EndpointConfig::unix(&path)),
        Arc::clone(&registry),
    )
    .unwrap();
    let started = Instant::now();
    contender.connect().unwrap();
    std::thread::sleep(Duration::from_millis(550));
    let attempts = contender.connect_attempts();
    let elapsed = started.elapsed();

    assert_eq!(contender.status(), Status::Connecting);
    // One attempt up front, then one per elapsed retry interval
    let most = (elapsed.as_millis() / RETRY_INTERVAL.as_millis()) as u64 + 1;
    assert!(attempts <= most, "attempts = {}, at most {}", attempts, most);
    assert!(attempts * 2 >= most, "attempts = {}, expected near {}", attempts, most);
    assert!(holder.is_connected());
    assert!(path.exists());
}

#[test]
fn test_bind_conflict_leaves_live_master_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("busy.sock");
    let registry = registry();

    let master = unix_peer(Role::Master, &path, &registry);
    assert!(wait_until(|| path.exists()));

    let contender = Communicator::new(
        CommunicatorConfig::new(Role::Master, EndpointConfig::unix(&path)),
        Arc::clone(&registry),
    )
    .unwrap();
    contender.connect().unwrap();
    std::thread::sleep(Duration::from_millis(600));
    assert!(contender.connect_attempts() > 1);
    drop(contender);
    assert!(path.exists());

    let slave = unix_peer(Role::Slave, &path, &registry);
    assert!(next_of(&slave, types::PEER_READY).is_some());
    assert_eq!(slave.id(), 1);
    assert!(wait_until(|| master.connection_count() == 1));

    let mut changes = Vec::new();
    while let Some(msg) = master.wait_for_message_timeout(Duration::from_millis(200)) {
        if msg.type_id == types::PEER_CHANGED {
            let body = msg.body_as::<PeerChangedBody>().unwrap();
            changes.push((body.status(), body.remote_id));
        }
    }
    assert_eq!(changes, vec![(Some(PeerStatus::ConnectionAdded), 1)]);
}

#[test]
fn test_inet_session() {
    let port = {
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };
    let registry = registry();

    let master = Peer::new(Role::Master, Arc::clone(&registry)).unwrap();
    master.attach(
        Communicator::from_pairs([("port", port.to_string().as_str()), ("role", "master")], Arc::clone(&registry))
            .unwrap(),
    );
    master.connect().unwrap();

    let slave = Peer::new(Role::Slave, Arc::clone(&registry)).unwrap();
    slave.attach(
        Communicator::new(
            CommunicatorConfig::new(Role::Slave, EndpointConfig::inet("127.0.0.1", port)),
            Arc::clone(&registry),
        )
        .unwrap(),
    );
    slave.connect().unwrap();

    assert!(next_of(&slave, types::PEER_READY).is_some());
    assert_eq!(slave.id(), 1);

    slave.send(text(&registry, 0, "over tcp")).unwrap();
    let got = next_of(&master, TEXT).unwrap();
    assert_eq!((got.sender_id, text_of(&got)), (1, "over tcp".to_string()));

    master.shutdown();
    assert!(wait_until(|| slave.is_terminated()));
}

#[test]
fn test_event_loop_receives_application_messages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.sock");
    let registry = registry();

    let master = unix_peer(Role::Master, &path, &registry);
    master.add_filter(TEXT);
    let (tx, rx) = std::sync::mpsc::channel();
    master
        .start_event_loop(move |msg| {
            let _ = tx.send(text_of(&msg));
        })
        .unwrap();

    assert!(wait_until(|| path.exists()));
    let slave = unix_peer(Role::Slave, &path, &registry);
    assert!(next_of(&slave, types::PEER_READY).is_some());
    for n in 0..3 {
        slave.send(text(&registry, 0, &format!("msg {}", n))).unwrap();
    }

    let received: Vec<String> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(received, vec!["msg 0", "msg 1", "msg 2"]);
    master.stop_event_loop();
}
