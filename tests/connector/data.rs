//! Application data, alerts and address changes on established sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use dimux::{AlertDescription, RawData, RawDataChannel};

use crate::common::*;

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn server_answers_in_the_same_session() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"ping").expect("sent");
    let ping = server.receive();

    server.send(ping.peer, b"pong").expect("sent");
    let pong = client.receive();
    assert_eq!(pong.bytes, b"pong");
    assert_eq!(pong.peer, server.address());
    assert_eq!(pong.context.session_id, ping.context.session_id);
    assert_eq!(server.connector.connection_count(), 1);
}

#[test]
fn duplicate_records_are_dropped() {
    let socket = LossySocket::new(|_, _| false);
    let server = Endpoint::start(config());
    let client = Endpoint::start_with(config(), socket.clone());

    client.send(server.address(), b"once").expect("sent");
    assert_eq!(server.receive().bytes, b"once");

    socket.replay_last(server.address());
    assert!(server.data.recv_timeout(Duration::from_millis(300)).is_err());

    client.send(server.address(), b"twice").expect("sent");
    assert_eq!(server.receive().bytes, b"twice");
}

#[test]
fn plaintext_alerts_cannot_end_a_session() {
    let socket = LossySocket::new(|_, _| false);
    let server = Endpoint::start(config());
    let client = Endpoint::start_with(config(), socket.clone());

    client.send(server.address(), b"one").expect("sent");
    let first = server.receive();
    assert_eq!(server.connector.connection_count(), 1);

    // Fatal handshake_failure at epoch 0, from the client's own address.
    let forged = [21, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 0x10, 0, 2, 2, 40];
    socket.send_raw(&forged, server.address());
    let close_notify = [21, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 0x11, 0, 2, 1, 0];
    socket.send_raw(&close_notify, server.address());
    assert!(server.alerts.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(server.connector.connection_count(), 1);

    client.send(server.address(), b"two").expect("sent");
    let second = server.receive();
    assert_eq!(second.bytes, b"two");
    assert_eq!(second.context.session_id, first.context.session_id);
}

#[test]
fn close_notify_closes_both_sides() {
    let server = Endpoint::start(config());
    let client = Endpoint::start(config());

    client.send(server.address(), b"hello").expect("sent");
    server.receive();

    client.connector.close(server.address());
    let (peer, alert) = server.alerts.recv_timeout(WAIT).expect("alert");
    assert_eq!(peer, client.address());
    assert_eq!(alert.description, AlertDescription::CloseNotify);

    assert!(wait_until(|| server.connector.connection_count() == 0));
    assert!(wait_until(|| client.connector.connection_count() == 0));
}

#[test]
fn connection_id_follows_address_change() {
    let cid = config().connection_id_length(Some(4));
    let server = Endpoint::start(cid);
    let socket = RebindingSocket::new();
    let client = Endpoint::start_with(config().connection_id_length(Some(4)), socket.clone());

    client.send(server.address(), b"before").expect("sent");
    assert_eq!(server.receive().peer, client.address());

    let moved = socket.rebind();
    client.send(server.address(), b"after").expect("sent");
    let data = server.receive();
    assert_eq!(data.bytes, b"after");
    assert_eq!(data.peer, moved);

    // Answers go to the new address.
    server
        .connector
        .send(RawData::outbound(b"welcome back".to_vec(), moved));
    assert_eq!(client.receive().bytes, b"welcome back");
    assert_eq!(server.connector.connection_count(), 1);
}

/// Application whose first delivery panics.
struct FailsOnce {
    failed: AtomicBool,
    data: Sender<RawData>,
}

impl RawDataChannel for FailsOnce {
    fn receive_data(&self, data: RawData) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            panic!("application failed on {:?}", data.bytes);
        }
        let _ = self.data.send(data);
    }
}

#[test]
fn panicking_application_ends_only_that_connection() {
    let server = Endpoint::start(config());
    let (data_tx, data) = unbounded();
    server.connector.set_raw_data_receiver(Arc::new(FailsOnce {
        failed: AtomicBool::new(false),
        data: data_tx,
    }));
    let client = Endpoint::start(config());

    client.send(server.address(), b"one").expect("sent");
    let (_, alert) = client.alerts.recv_timeout(WAIT).expect("alert");
    assert_eq!(alert.description, AlertDescription::InternalError);
    assert!(wait_until(|| client.connector.connection_count() == 0));
    assert!(wait_until(|| server.connector.connection_count() == 0));

    // A new handshake, served by the same worker threads.
    client.send(server.address(), b"two").expect("sent");
    let two = data.recv_timeout(WAIT).expect("application data");
    assert_eq!(two.bytes, b"two");
}
