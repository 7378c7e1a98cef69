//! Bounded connection store, stale connections and restarts.

use std::time::{Duration, Instant};

use dimux::HandshakeEvent;

use crate::common::*;

#[test]
fn full_store_evicts_least_recently_used() {
    let server = Endpoint::start(config().max_connections(2));
    let clients: Vec<Endpoint> = (0..3).map(|_| Endpoint::start(config())).collect();

    for (i, client) in clients.iter().enumerate() {
        client.send(server.address(), &[i as u8]).expect("sent");
        assert_eq!(server.receive().bytes, vec![i as u8]);
    }

    assert_eq!(server.connector.connection_count(), 2);
    assert!(server.connector.session_id(clients[0].address()).is_none());
    assert!(server.connector.session_id(clients[1].address()).is_some());
    assert!(server.connector.session_id(clients[2].address()).is_some());
}

#[test]
fn stale_connections_are_swept() {
    let server = Endpoint::start(config().stale_connection_threshold(Duration::from_millis(200)));
    let client = Endpoint::start(config());

    client.send(server.address(), b"hello").expect("sent");
    server.receive();

    let deadline = Instant::now() + WAIT;
    while server.connector.connection_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(server.connector.connection_count(), 0);
}

#[test]
fn restart_on_new_address_resumes() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    server.receive();
    let first = match client.next_event() {
        HandshakeEvent::Established { session_id, .. } => session_id,
        other => panic!("unexpected {:?}", other),
    };

    client.connector.stop();
    assert!(!client.connector.is_running());
    client.connector.start().expect("restart");
    assert_eq!(client.connector.connection_count(), 1);

    client.send(server.address(), b"two").expect("sent");
    match client.next_event() {
        HandshakeEvent::Established { session_id, resumed } => {
            assert!(resumed);
            assert_eq!(session_id, first);
        }
        other => panic!("unexpected {:?}", other),
    }
    let data = server.receive();
    assert_eq!(data.bytes, b"two");
    assert_eq!(data.peer, client.address());
}
