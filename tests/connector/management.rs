//! Operations over the connections of a running connector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use dimux::{DtlsConnector, HandshakeEvent};

use crate::common::*;

/// A server with one connection per PSK identity.
fn server_with_two_clients() -> (Endpoint, Endpoint, Endpoint) {
    let server = Endpoint::start(config());
    let first = Endpoint::start(config());
    let second = Endpoint::start(config().psk_store(psk(b"client-2")));
    first.send(server.address(), b"one").expect("sent");
    server.receive();
    second.send(server.address(), b"two").expect("sent");
    server.receive();
    assert_eq!(server.connector.connection_count(), 2);
    (server, first, second)
}

fn resumed(endpoint: &Endpoint) -> bool {
    match endpoint.next_event() {
        HandshakeEvent::Established { resumed, .. } => resumed,
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn for_each_visits_every_connection() {
    let (server, first, second) = server_with_two_clients();

    let (tx, rx) = unbounded();
    let walk = server.connector.for_each(move |context| {
        tx.send((context.peer, context.identity.clone())).unwrap();
        false
    });
    assert!(walk.wait(WAIT));
    assert!(walk.is_done());

    let mut visited: Vec<_> = rx.try_iter().collect();
    visited.sort();
    let mut expected = vec![
        (first.address(), Some(IDENTITY.to_vec())),
        (second.address(), Some(b"client-2".to_vec())),
    ];
    expected.sort();
    assert_eq!(visited, expected);
}

#[test]
fn for_each_stops_when_the_visitor_asks() {
    let (server, _first, _second) = server_with_two_clients();

    let visits = Arc::new(AtomicUsize::new(0));
    let counted = visits.clone();
    let walk = server.connector.for_each(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        true
    });
    assert!(walk.wait(WAIT));
    assert_eq!(visits.load(Ordering::SeqCst), 1);
}

#[test]
fn dropped_identity_needs_a_full_handshake() {
    let (server, first, second) = server_with_two_clients();
    assert!(!resumed(&first));
    assert!(!resumed(&second));

    assert!(server.connector.drop_connections_for_identity(IDENTITY).wait(WAIT));
    assert_eq!(server.connector.connection_count(), 1);
    assert!(server.connector.session_id(first.address()).is_none());
    assert!(server.connector.session_id(second.address()).is_some());

    first.connector.force_resume(server.address());
    first.send(server.address(), b"three").expect("sent");
    assert!(!resumed(&first));
    assert_eq!(server.receive().bytes, b"three");

    second.connector.force_resume(server.address());
    second.send(server.address(), b"four").expect("sent");
    assert!(resumed(&second));
    assert_eq!(server.receive().bytes, b"four");
}

#[test]
fn terminate_by_predicate() {
    let (server, _first, _second) = server_with_two_clients();

    let walk = server
        .connector
        .terminate_connections_for_identity(|identity| identity.starts_with(b"client-"));
    assert!(walk.wait(WAIT));
    assert_eq!(server.connector.connection_count(), 0);
}

#[test]
fn clear_connection_state_forgets_sessions() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());
    client.send(server.address(), b"one").expect("sent");
    assert!(!resumed(&client));
    server.receive();

    server.connector.clear_connection_state();
    assert_eq!(server.connector.connection_count(), 0);

    client.connector.force_resume(server.address());
    client.send(server.address(), b"two").expect("sent");
    assert!(!resumed(&client));
    assert_eq!(server.receive().bytes, b"two");
    assert_eq!(server.connector.connection_count(), 1);
}

#[test]
fn mtu_is_reported_while_running() {
    let connector = DtlsConnector::new(config().mtu(1400).build().unwrap());
    assert_eq!(connector.maximum_transmission_unit(), 0);

    connector.start().unwrap();
    assert_eq!(connector.maximum_transmission_unit(), 1400);
    // 1400 - 48 bytes IP/UDP - 13 bytes record header
    assert_eq!(connector.max_fragment_length("127.0.0.1:9".parse().unwrap()), 1339);

    connector.stop();
    assert_eq!(connector.maximum_transmission_unit(), 0);
}

#[test]
fn max_fragment_length_accounts_for_the_cipher() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());
    client.send(server.address(), b"one").expect("sent");
    server.receive();

    // 1232 byte datagrams less 13 bytes header, 8 bytes explicit nonce and 16 bytes tag
    assert_eq!(server.connector.max_fragment_length(client.address()), 1195);
    assert_eq!(client.connector.max_fragment_length(server.address()), 1195);
}
