//! Lost flights and their retransmission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::*;

const HANDSHAKE: u8 = 22;
const CHANGE_CIPHER_SPEC: u8 = 20;
const APPLICATION_DATA: u8 = 23;
const CLIENT_HELLO: u8 = 1;

fn is_client_hello(datagram: &[u8]) -> bool {
    datagram.first() == Some(&HANDSHAKE) && datagram.get(13) == Some(&CLIENT_HELLO)
}

#[test]
fn lost_client_hello_is_resent() {
    let server = Endpoint::start(config());
    let socket = LossySocket::new(|n, _| n == 0);
    let client = Endpoint::start_with(config(), socket.clone());

    client.send(server.address(), b"hello").expect("sent");
    assert_eq!(server.receive().bytes, b"hello");

    let sent = socket.sent_datagrams.lock().unwrap();
    assert!(is_client_hello(&sent[0]));
    assert!(is_client_hello(&sent[1]), "first flight resent");
}

#[test]
fn lost_final_flight_is_resent_on_duplicate() {
    let dropped = Arc::new(AtomicBool::new(false));
    let drop_once = dropped.clone();
    let socket = LossySocket::new(move |_, datagram| {
        datagram.first() == Some(&CHANGE_CIPHER_SPEC) && !drop_once.swap(true, Ordering::SeqCst)
    });
    let server = Endpoint::start_with(config(), socket.clone());
    let client = Endpoint::start(config());

    client.send(server.address(), b"hello").expect("sent");
    assert_eq!(server.receive().bytes, b"hello");

    assert!(dropped.load(Ordering::SeqCst));
    assert!(socket.count_sent(CHANGE_CIPHER_SPEC) >= 2);
}

#[test]
fn every_flight_survives_one_loss() {
    // Drop every second handshake datagram of the client.
    let socket = LossySocket::new(|n, datagram| n % 2 == 0 && datagram.first() != Some(&APPLICATION_DATA));
    let server = Endpoint::start(config());
    let client = Endpoint::start_with(config().max_retransmissions(6), socket);

    client.send(server.address(), b"hello").expect("sent");
    assert_eq!(server.receive().bytes, b"hello");
}
