//! Abbreviated handshakes.

use std::sync::Arc;
use std::time::Duration;

use dimux::{EndpointContext, HandshakeEvent, HandshakeMode, InMemorySessionCache};

use crate::common::*;

fn established(endpoint: &Endpoint) -> (dimux::SessionId, bool) {
    match endpoint.next_event() {
        HandshakeEvent::Established { session_id, resumed } => (session_id, resumed),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn force_resume_resumes_the_session() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    let (first, resumed) = established(&client);
    assert!(!resumed);
    server.receive();

    client.connector.force_resume(server.address());
    client.send(server.address(), b"two").expect("sent");
    let (second, resumed) = established(&client);
    assert!(resumed);
    assert_eq!(first, second);

    let data = server.receive();
    assert_eq!(data.bytes, b"two");
    assert_eq!(data.context.session_id, Some(first));
    // Epoch 1 again, under the keys of the abbreviated handshake.
    assert_eq!(data.context.epoch, 1);
}

#[test]
fn full_mode_negotiates_a_new_session() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    let (first, _) = established(&client);
    server.receive();

    let context = EndpointContext::new(server.address()).with_handshake_mode(HandshakeMode::Full);
    client.send_in(context, b"two").expect("sent");
    let (second, resumed) = established(&client);
    assert!(!resumed);
    assert_ne!(first, second);
    assert_eq!(server.receive().bytes, b"two");
    assert_eq!(server.connector.connection_count(), 1);
}

#[test]
fn resume_mode_message() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    let (first, _) = established(&client);
    server.receive();

    let context = EndpointContext::new(server.address()).with_handshake_mode(HandshakeMode::Resume);
    client.send_in(context, b"two").expect("sent");
    let (second, resumed) = established(&client);
    assert!(resumed);
    assert_eq!(first, second);
    assert_eq!(server.receive().bytes, b"two");
}

#[test]
fn idle_connection_resumes_automatically() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config().auto_resumption_timeout(Some(Duration::from_millis(300))));

    client.send(server.address(), b"one").expect("sent");
    let (first, _) = established(&client);
    server.receive();

    std::thread::sleep(Duration::from_millis(500));
    client.send(server.address(), b"two").expect("sent");
    let (second, resumed) = established(&client);
    assert!(resumed);
    assert_eq!(first, second);
    assert_eq!(server.receive().bytes, b"two");
}

#[test]
fn session_cache_outlives_the_connection() {
    let cache = Arc::new(InMemorySessionCache::new(16));
    let server = Endpoint::start(config().max_connections(1));
    server.connector.set_session_cache(cache.clone());
    let client = Endpoint::start(config());
    let other = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    let (first, _) = established(&client);
    server.receive();
    assert_eq!(cache.len(), 1);

    // Takes the only slot of the server.
    other.send(server.address(), b"other").expect("sent");
    server.receive();
    assert_eq!(server.connector.session_id(client.address()), None);

    client.connector.force_resume(server.address());
    client.send(server.address(), b"two").expect("sent");
    let (second, resumed) = established(&client);
    assert!(resumed);
    assert_eq!(first, second);
    assert_eq!(server.receive().bytes, b"two");
}

/// HELLO_VERIFY_REQUESTs among the datagrams a server sent.
fn hello_verify_requests(socket: &LossySocket) -> usize {
    socket
        .sent_datagrams
        .lock()
        .unwrap()
        .iter()
        .filter(|d| d.first() == Some(&22) && d.get(13) == Some(&3))
        .count()
}

fn resume_once(server_config: dimux::ConfigBuilder) -> usize {
    let socket = LossySocket::new(|_, _| false);
    let server = Endpoint::start_with(server_config, socket.clone());
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    established(&client);
    server.receive();
    assert_eq!(hello_verify_requests(&socket), 1);

    client.connector.force_resume(server.address());
    client.send(server.address(), b"two").expect("sent");
    let (_, resumed) = established(&client);
    assert!(resumed);
    assert_eq!(server.receive().bytes, b"two");
    hello_verify_requests(&socket)
}

#[test]
fn resumption_below_threshold_skips_cookie_exchange() {
    assert_eq!(resume_once(config()), 1);
}

#[test]
fn zero_threshold_always_verifies_resumption() {
    assert_eq!(resume_once(config().verify_peers_on_resumption_threshold(0)), 2);
}
