//! Full handshakes between two connectors.

use std::net::UdpSocket;
use std::time::Duration;

use dimux::{CipherSuite, EndpointContext, Error, HandshakeEvent, HandshakeMode, RawData};

use crate::common::*;

#[test]
fn psk_handshake_delivers_data() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"hello").expect("sent");

    let data = server.receive();
    assert_eq!(data.bytes, b"hello");
    assert_eq!(data.peer, client.address());
    assert_eq!(data.context.identity.as_deref(), Some(IDENTITY));
    assert_eq!(data.context.cipher_suite, Some(CipherSuite::PskAes128GcmSha256));
    assert_eq!(data.context.epoch, 1);

    match client.next_event() {
        HandshakeEvent::Established { resumed, .. } => assert!(!resumed),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        client.connector.session_id(server.address()),
        server.connector.session_id(client.address())
    );
}

#[test]
fn ecdhe_psk_handshake() {
    let suites = [CipherSuite::EcdhePskAes128GcmSha256];
    let server = Endpoint::start(config().cipher_suites(&suites));
    let client = Endpoint::start(config().cipher_suites(&suites));

    client.send(server.address(), b"ecdhe").expect("sent");

    let data = server.receive();
    assert_eq!(data.bytes, b"ecdhe");
    assert_eq!(data.context.cipher_suite, Some(CipherSuite::EcdhePskAes128GcmSha256));
}

#[test]
fn messages_wait_for_the_handshake() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    let mut outcomes = Vec::new();
    for i in 0..5u8 {
        let (callback, outcome) = Outcome::new();
        let message = RawData::outbound(vec![i], server.address()).with_callback(callback);
        client.connector.send(message);
        outcomes.push(outcome);
    }
    for outcome in outcomes {
        outcome.recv_timeout(WAIT).unwrap().expect("sent");
    }

    // Deferred messages go out in the order they were sent.
    let received: Vec<u8> = (0..5).map(|_| server.receive().bytes[0]).collect();
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
    assert_eq!(client.connector.connection_count(), 1);
}

#[test]
fn unknown_identity_is_refused() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config().psk_store(std::sync::Arc::new(
        dimux::StaticPskStore::new()
            .with_key("stranger", "nope")
            .with_client_identity("stranger"),
    )));

    let error = client.send(server.address(), b"hello").unwrap_err();
    assert!(
        matches!(error, Error::AlertReceived(dimux::AlertDescription::UnknownPskIdentity)),
        "{:?}",
        error
    );
    assert!(matches!(client.next_event(), HandshakeEvent::Failed(_)));
    assert!(server.data.try_recv().is_err());
}

#[test]
fn unanswered_handshake_times_out() {
    // Bound but never read.
    let silent = UdpSocket::bind(loopback()).unwrap();
    let client = Endpoint::start(
        config()
            .retransmission_timeout(Duration::from_millis(50))
            .max_retransmissions(2),
    );

    let error = client.send(silent.local_addr().unwrap(), b"hello").unwrap_err();
    assert!(matches!(error, Error::Timeout), "{:?}", error);
    assert!(matches!(client.next_event(), HandshakeEvent::Failed(Error::Timeout)));
    assert_eq!(client.connector.connection_count(), 0);
}

#[test]
fn server_only_does_not_connect() {
    let server = Endpoint::start(config().server_only(true));
    let peer = "127.0.0.1:9".parse().unwrap();

    let error = server.send(peer, b"hello").unwrap_err();
    assert!(matches!(error, Error::ServerOnly), "{:?}", error);
    assert_eq!(server.connector.connection_count(), 0);
}

#[test]
fn no_handshake_mode_needs_a_session() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    let context = EndpointContext::new(server.address()).with_handshake_mode(HandshakeMode::NoHandshake);
    let error = client.send_in(context.clone(), b"hello").unwrap_err();
    assert!(matches!(error, Error::NoSession), "{:?}", error);

    client.send(server.address(), b"first").expect("sent");
    client.send_in(context, b"second").expect("sent on session");
    assert_eq!(server.receive().bytes, b"first");
    assert_eq!(server.receive().bytes, b"second");
}

#[test]
fn rejects_unsendable_messages() {
    let client = Endpoint::start(config());

    let multicast = "224.0.1.187:5684".parse().unwrap();
    let error = client.send(multicast, b"hello").unwrap_err();
    assert!(matches!(error, Error::MulticastNotSupported));

    let peer = "127.0.0.1:9".parse().unwrap();
    let error = client.send(peer, &vec![0u8; 16_385]).unwrap_err();
    assert!(matches!(error, Error::MessageTooLarge(16_385)));

    client.connector.stop();
    let error = client.send(peer, b"hello").unwrap_err();
    assert!(matches!(error, Error::NotRunning));
}

#[test]
fn strict_matcher_checks_identity() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());
    client
        .connector
        .set_endpoint_context_matcher(std::sync::Arc::new(dimux::StrictContextMatcher));

    client.send(server.address(), b"hello").expect("sent");
    server.receive();

    let wrong = EndpointContext::new(server.address()).with_identity("client-2");
    let error = client.send_in(wrong, b"again").unwrap_err();
    assert!(matches!(error, Error::EndpointMismatch), "{:?}", error);

    let right = EndpointContext::new(server.address()).with_identity(IDENTITY);
    client.send_in(right, b"again").expect("sent");
    assert_eq!(server.receive().bytes, b"again");
}
