//! Shared helpers for connector integration tests.

#![allow(unused)]

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dimux::{Alert, AlertHandler, ConfigBuilder, DatagramSocket, DtlsConnector, Error};
use dimux::{EndpointContext, HandshakeEvent, MessageCallback, RawData, RawDataChannel};
use dimux::{Config, SessionListener, StaticPskStore};

pub const WAIT: Duration = Duration::from_secs(5);

pub const IDENTITY: &[u8] = b"client-1";
pub const KEY: &[u8] = b"secret-1";

pub fn init_logger() {
    let _ = env_logger::try_init();
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Keys for `client-1` and `client-2`, presenting `identity` as client.
pub fn psk(identity: &[u8]) -> Arc<StaticPskStore> {
    Arc::new(
        StaticPskStore::new()
            .with_key(IDENTITY, KEY)
            .with_key("client-2", "secret-2")
            .with_client_identity(identity),
    )
}

/// Loopback config with short timeouts.
pub fn config() -> ConfigBuilder {
    Config::builder()
        .address(loopback())
        .psk_store(psk(IDENTITY))
        .retransmission_timeout(Duration::from_millis(200))
        .max_retransmission_timeout(Duration::from_secs(2))
}

/// A started connector and everything it reported.
pub struct Endpoint {
    pub connector: DtlsConnector,
    pub data: Receiver<RawData>,
    pub events: Receiver<(SocketAddr, HandshakeEvent)>,
    pub alerts: Receiver<(SocketAddr, Alert)>,
}

struct Channels {
    data: Sender<RawData>,
    events: Sender<(SocketAddr, HandshakeEvent)>,
    alerts: Sender<(SocketAddr, Alert)>,
}

impl RawDataChannel for Channels {
    fn receive_data(&self, data: RawData) {
        let _ = self.data.send(data);
    }
}

impl SessionListener for Channels {
    fn on_event(&self, peer: SocketAddr, event: &HandshakeEvent) {
        let _ = self.events.send((peer, event.clone()));
    }
}

impl AlertHandler for Channels {
    fn on_alert(&self, peer: SocketAddr, alert: Alert) {
        let _ = self.alerts.send((peer, alert));
    }
}

impl Endpoint {
    pub fn start(builder: ConfigBuilder) -> Endpoint {
        let endpoint = Endpoint::new(builder);
        endpoint.connector.start().expect("start connector");
        endpoint
    }

    pub fn start_with(builder: ConfigBuilder, socket: Arc<dyn DatagramSocket>) -> Endpoint {
        let endpoint = Endpoint::new(builder);
        endpoint.connector.start_with(socket).expect("start connector");
        endpoint
    }

    fn new(builder: ConfigBuilder) -> Endpoint {
        init_logger();
        let connector = DtlsConnector::new(builder.build().expect("valid config"));
        let (data_tx, data) = unbounded();
        let (events_tx, events) = unbounded();
        let (alerts_tx, alerts) = unbounded();
        let channels = Arc::new(Channels {
            data: data_tx,
            events: events_tx,
            alerts: alerts_tx,
        });
        connector.set_raw_data_receiver(channels.clone());
        connector.set_session_listener(channels.clone());
        connector.set_alert_handler(channels);
        Endpoint {
            connector,
            data,
            events,
            alerts,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.connector.local_address().expect("running connector")
    }

    /// Send and wait for the outcome.
    pub fn send(&self, peer: SocketAddr, bytes: &[u8]) -> Result<(), Error> {
        self.send_message(RawData::outbound(bytes.to_vec(), peer))
    }

    pub fn send_in(&self, context: EndpointContext, bytes: &[u8]) -> Result<(), Error> {
        let peer = context.peer;
        self.send_message(RawData::outbound(bytes.to_vec(), peer).with_context(context))
    }

    pub fn send_message(&self, message: RawData) -> Result<(), Error> {
        let (callback, outcome) = Outcome::new();
        self.connector.send(message.with_callback(callback));
        outcome.recv_timeout(WAIT).expect("message outcome")
    }

    pub fn receive(&self) -> RawData {
        self.data.recv_timeout(WAIT).expect("application data")
    }

    /// Next event, skipping `Completed`.
    pub fn next_event(&self) -> HandshakeEvent {
        loop {
            let (_, event) = self.events.recv_timeout(WAIT).expect("handshake event");
            if !matches!(event, HandshakeEvent::Completed) {
                return event;
            }
        }
    }
}

/// Reports the outcome of one message to a channel.
pub struct Outcome {
    tx: Sender<Result<(), Error>>,
    connecting: AtomicUsize,
}

impl Outcome {
    pub fn new() -> (Arc<Outcome>, Receiver<Result<(), Error>>) {
        let (tx, rx) = unbounded();
        let outcome = Arc::new(Outcome {
            tx,
            connecting: AtomicUsize::new(0),
        });
        (outcome, rx)
    }
}

impl MessageCallback for Outcome {
    fn on_connecting(&self) {
        self.connecting.fetch_add(1, Ordering::SeqCst);
    }

    fn on_sent(&self) {
        let _ = self.tx.send(Ok(()));
    }

    fn on_error(&self, error: &Error) {
        let _ = self.tx.send(Err(error.clone()));
    }
}

/// Loopback socket that drops outgoing datagrams the filter rejects.
pub struct LossySocket {
    socket: UdpSocket,
    /// Called with the number of the datagram (from 0) and its bytes.
    drop: Box<dyn Fn(usize, &[u8]) -> bool + Send + Sync>,
    sent: AtomicUsize,
    pub sent_datagrams: Mutex<Vec<Vec<u8>>>,
}

impl LossySocket {
    pub fn new(drop: impl Fn(usize, &[u8]) -> bool + Send + Sync + 'static) -> Arc<LossySocket> {
        Arc::new(LossySocket {
            socket: UdpSocket::bind(loopback()).unwrap(),
            drop: Box::new(drop),
            sent: AtomicUsize::new(0),
            sent_datagrams: Mutex::new(Vec::new()),
        })
    }

    /// Datagrams that started with a record of `content_type`.
    pub fn count_sent(&self, content_type: u8) -> usize {
        self.sent_datagrams
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.first() == Some(&content_type))
            .count()
    }

    /// Send `datagram` from this socket, bypassing the filter.
    pub fn send_raw(&self, datagram: &[u8], peer: SocketAddr) {
        self.socket.send_to(datagram, peer).unwrap();
    }

    /// Send the last sent datagram once more, bypassing the filter.
    pub fn replay_last(&self, peer: SocketAddr) {
        let last = self.sent_datagrams.lock().unwrap().last().cloned();
        if let Some(datagram) = last {
            self.socket.send_to(&datagram, peer).unwrap();
        }
    }
}

impl DatagramSocket for LossySocket {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        self.sent_datagrams.lock().unwrap().push(datagram.to_vec());
        if (self.drop)(n, datagram) {
            return Ok(datagram.len());
        }
        self.socket.send_to(datagram, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }
}

/// Socket whose public address can change, like behind a NAT rebinding.
pub struct RebindingSocket {
    sockets: [UdpSocket; 2],
    active: AtomicUsize,
}

impl RebindingSocket {
    pub fn new() -> Arc<RebindingSocket> {
        Arc::new(RebindingSocket {
            sockets: [
                UdpSocket::bind(loopback()).unwrap(),
                UdpSocket::bind(loopback()).unwrap(),
            ],
            active: AtomicUsize::new(0),
        })
    }

    /// Continue on the other port.
    pub fn rebind(&self) -> SocketAddr {
        self.active.store(1, Ordering::SeqCst);
        self.sockets[1].local_addr().unwrap()
    }

    fn active(&self) -> &UdpSocket {
        &self.sockets[self.active.load(Ordering::SeqCst)]
    }
}

impl DatagramSocket for RebindingSocket {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.active().send_to(datagram, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.active().recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sockets[0].local_addr()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        for socket in &self.sockets {
            socket.set_read_timeout(timeout)?;
        }
        Ok(())
    }
}
