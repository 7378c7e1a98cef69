//! The connector: one socket, many peers.
//!
//! Receiver threads read datagrams and hand records to the serial executor
//! of the connection they belong to. A new CLIENT_HELLO has no connection
//! yet and is answered from the shared worker pool without creating state,
//! until the peer proved it owns its address. All state of one connection
//! is only touched from its serial executor, the timer included.

mod handshake;
mod inbound;
mod outbound;
mod walk;

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::api::{
    AlertHandler, EndpointContext, EndpointContextMatcher, RawData, RawDataChannel, SessionListener,
};
use crate::buffer::Buf;
use crate::connection::{Connection, ConnectionState};
use crate::crypto::CookieGenerator;
use crate::event::HandshakeEvent;
use crate::executor::{run_contained, Task, WorkerPool};
use crate::message::{Alert, AlertDescription, AlertLevel, ConnectionId, SessionId};
use crate::record::RECORD_HEADER_LEN;
use crate::rng::SeededRng;
use crate::socket::DatagramSocket;
use crate::store::{ConnectionStore, SessionCache};
use crate::timer::{Timer, TimerHandle};
use crate::types::ContentType;
use crate::{Config, Error};

pub use walk::ForEach;

/// How long a receiver blocks before checking whether it should stop.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Cookie secrets are replaced this often.
const COOKIE_SECRET_PERIOD: Duration = Duration::from_secs(300);

/// DTLS 1.2 endpoint serving any number of peers over one datagram socket.
///
/// Acts as client towards peers it sends to first and as server towards
/// peers that send it a CLIENT_HELLO, unless configured server only.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use dimux::{Config, DtlsConnector, RawData, StaticPskStore};
/// let psk = StaticPskStore::new()
///     .with_key("sensor-17", b"secret".to_vec())
///     .with_client_identity("sensor-17");
/// let config = Config::builder()
///     .address("0.0.0.0:5684".parse().unwrap())
///     .psk_store(Arc::new(psk))
///     .build()
///     .unwrap();
///
/// let connector = DtlsConnector::new(config);
/// connector.start().unwrap();
/// connector.send(RawData::outbound(b"hello".to_vec(), "192.0.2.1:5684".parse().unwrap()));
/// ```
pub struct DtlsConnector {
    inner: Arc<Inner>,
}

/// Threads and socket of a running connector.
#[derive(Clone)]
struct Runtime {
    socket: Arc<dyn DatagramSocket>,
    pool: Arc<WorkerPool>,
    timer: Arc<Timer>,
}

pub(crate) struct Inner {
    config: Arc<Config>,
    store: ConnectionStore,
    cookies: CookieGenerator,
    rng: SeededRng,
    running: AtomicBool,
    runtime: RwLock<Option<Runtime>>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
    /// Address bound by the last start.
    last_address: Mutex<Option<SocketAddr>>,
    /// Outbound messages that may still be accepted.
    outbound_permits: AtomicUsize,
    /// Resumption handshakes started without a cookie exchange.
    pending_unverified: AtomicUsize,
    /// Serializes creating connections for outbound messages.
    connect_lock: Mutex<()>,
    channel: RwLock<Option<Arc<dyn RawDataChannel>>>,
    alert_handler: RwLock<Option<Arc<dyn AlertHandler>>>,
    session_listener: RwLock<Option<Arc<dyn SessionListener>>>,
    matcher: RwLock<Option<Arc<dyn EndpointContextMatcher>>>,
}

impl DtlsConnector {
    pub fn new(config: Config) -> Self {
        let seed = config.rng_seed();
        let inner = Inner {
            store: ConnectionStore::new(&config),
            cookies: CookieGenerator::new(
                COOKIE_SECRET_PERIOD,
                SeededRng::new(seed.map(|s| s.wrapping_add(2))),
            ),
            rng: SeededRng::new(seed),
            running: AtomicBool::new(false),
            runtime: RwLock::new(None),
            receivers: Mutex::new(Vec::new()),
            last_address: Mutex::new(None),
            outbound_permits: AtomicUsize::new(config.outbound_message_buffer_size()),
            pending_unverified: AtomicUsize::new(0),
            connect_lock: Mutex::new(()),
            channel: RwLock::new(None),
            alert_handler: RwLock::new(None),
            session_listener: RwLock::new(None),
            matcher: RwLock::new(None),
            config: Arc::new(config),
        };
        DtlsConnector {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Where decrypted application data goes.
    pub fn set_raw_data_receiver(&self, channel: Arc<dyn RawDataChannel>) {
        *self.inner.channel.write() = Some(channel);
    }

    pub fn set_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        *self.inner.alert_handler.write() = Some(handler);
    }

    pub fn set_session_listener(&self, listener: Arc<dyn SessionListener>) {
        *self.inner.session_listener.write() = Some(listener);
    }

    pub fn set_endpoint_context_matcher(&self, matcher: Arc<dyn EndpointContextMatcher>) {
        *self.inner.matcher.write() = Some(matcher);
    }

    /// Keep session tickets beyond the lifetime of their connections.
    pub fn set_session_cache(&self, cache: Arc<dyn SessionCache>) {
        self.inner.store.set_session_cache(Some(cache));
    }

    /// Bind the configured address and start processing.
    pub fn start(&self) -> Result<(), Error> {
        if self.is_running() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.inner.config.address())?;
        self.start_with(Arc::new(socket))
    }

    /// Start processing on an already bound socket.
    pub fn start_with(&self, socket: Arc<dyn DatagramSocket>) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = Inner::start(&self.inner, socket) {
            self.inner.running.store(false, Ordering::Release);
            self.inner.shutdown_runtime();
            return Err(e);
        }
        Ok(())
    }

    /// Stop all threads. Established sessions are kept for a later start.
    ///
    /// Messages waiting for a handshake fail with [`Error::NotRunning`].
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop and forget all connections.
    pub fn destroy(&self) {
        self.inner.stop();
        self.inner.store.clear();
        info!("DTLS connector destroyed");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Address the socket is bound to, while running.
    pub fn local_address(&self) -> Option<SocketAddr> {
        let runtime = self.inner.runtime()?;
        runtime.socket.local_addr().ok()
    }

    /// Send application data, starting a handshake if needed.
    ///
    /// The outcome is reported to the message's callback.
    pub fn send(&self, message: RawData) {
        self.inner.send(message);
    }

    /// Send close_notify to `peer` and forget the connection.
    pub fn close(&self, peer: SocketAddr) {
        self.inner.close(peer);
    }

    /// Make the next message to `peer` resume the session first.
    pub fn force_resume(&self, peer: SocketAddr) {
        if let Some(connection) = self.inner.store.get(peer) {
            connection.set_resumption_required(true);
        }
    }

    /// Make the next message to every peer resume its session first.
    pub fn force_resume_all(&self) {
        self.inner.store.mark_all_resumption_required();
    }

    pub fn connection_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Session id of the session established with `peer`.
    pub fn session_id(&self, peer: SocketAddr) -> Option<SessionId> {
        let connection = self.inner.store.get(peer)?;
        connection.ticket().map(|t| t.session_id)
    }

    /// Visit every connection, one at a time on its serial executor.
    ///
    /// Connections without an established session are visited with a
    /// context holding only the peer. `visitor` returns true to stop.
    pub fn for_each<F>(&self, mut visitor: F) -> ForEach
    where
        F: FnMut(&EndpointContext) -> bool + Send + 'static,
    {
        self.inner.for_each(Box::new(
            move |_: &Arc<Inner>, connection: &Arc<Connection>, state: &mut ConnectionState| {
                let peer = connection.peer();
                let context = state
                    .endpoint_context(peer)
                    .unwrap_or_else(|| EndpointContext::new(peer));
                visitor(&context)
            },
        ))
    }

    /// Forget every connection and session of the PSK `identity`.
    pub fn drop_connections_for_identity(&self, identity: &[u8]) -> ForEach {
        let identity = identity.to_vec();
        self.terminate_connections_for_identity(move |candidate| candidate == identity.as_slice())
    }

    /// Forget every connection and session whose PSK identity matches.
    ///
    /// No alert is sent. Connections without an identity are kept.
    pub fn terminate_connections_for_identity<P>(&self, mut matches: P) -> ForEach
    where
        P: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.inner.for_each(Box::new(
            move |inner: &Arc<Inner>, connection: &Arc<Connection>, state: &mut ConnectionState| {
                let ticket = connection.ticket();
                let identity = match &ticket {
                    Some(ticket) => ticket.identity.clone(),
                    None => match &state.session {
                        Some(session) => session.identity().to_vec(),
                        None => return false,
                    },
                };
                if identity.is_empty() || !matches(&identity) {
                    return false;
                }
                debug!("Dropping connection to {} of its identity", connection.peer());
                if let Some(ticket) = ticket {
                    inner.store.remove_ticket(&ticket.session_id);
                }
                inner.terminate(connection, state, Error::Closed);
                false
            },
        ))
    }

    /// Forget all connections, failing their pending work.
    ///
    /// Tickets in the session cache survive.
    pub fn clear_connection_state(&self) {
        let connections = self.inner.store.connections();
        self.inner.store.clear();
        for connection in connections {
            self.inner.discard(connection, Error::Closed);
        }
        info!("Connection state cleared");
    }

    /// MTU of the network the connector sends on. 0 while not running.
    pub fn maximum_transmission_unit(&self) -> usize {
        if self.is_running() {
            self.inner.config.mtu()
        } else {
            0
        }
    }

    /// Max application payload that still fits into one datagram to `peer`.
    pub fn max_fragment_length(&self, peer: SocketAddr) -> usize {
        let datagram = self.inner.config.max_datagram_size();
        let unprotected = datagram.saturating_sub(RECORD_HEADER_LEN);
        let Some(connection) = self.inner.store.get(peer) else {
            return unprotected;
        };
        let state = connection.lock();
        match &state.session {
            Some(session) => {
                let overhead = session.record_overhead(session.write_epoch());
                session
                    .max_fragment_length()
                    .min(datagram.saturating_sub(overhead))
            }
            None => unprotected,
        }
    }
}

impl Drop for DtlsConnector {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl fmt::Debug for DtlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsConnector")
            .field("running", &self.is_running())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl Inner {
    fn start(this: &Arc<Inner>, socket: Arc<dyn DatagramSocket>) -> Result<(), Error> {
        let local = socket.local_addr()?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        let pool = WorkerPool::new("dimux-worker", this.config.connection_threads())?;
        let timer = Arc::new(Timer::new("dimux-timer")?);

        {
            let mut last = this.last_address.lock();
            if let Some(previous) = *last {
                if previous != local {
                    info!(
                        "Address changed from {} to {}, sessions need resumption",
                        previous, local
                    );
                    this.store.mark_all_resumption_required();
                }
            }
            *last = Some(local);
        }
        for connection in this.store.connections() {
            connection.replace_executor(&pool);
        }

        *this.runtime.write() = Some(Runtime {
            socket: Arc::clone(&socket),
            pool,
            timer,
        });

        let mut receivers = this.receivers.lock();
        for i in 0..this.config.receiver_threads() {
            let inner = Arc::clone(this);
            let socket = Arc::clone(&socket);
            let handle = thread::Builder::new()
                .name(format!("dimux-receiver-{}", i))
                .spawn(move || inner.receive_loop(socket))?;
            receivers.push(handle);
        }
        drop(receivers);

        this.schedule_stale_sweep();
        info!("DTLS connector listening on {}", local);
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let receivers: Vec<_> = self.receivers.lock().drain(..).collect();
        for receiver in receivers {
            let _ = receiver.join();
        }

        let Some(runtime) = self.runtime.write().take() else {
            return;
        };
        let dropped = runtime.timer.shutdown();
        let mut tasks = Vec::new();
        for connection in self.store.connections() {
            tasks.extend(connection.shutdown_executor());
        }
        runtime.pool.shutdown();
        debug!(
            "Stopping with {} pending tasks, {} timers dropped",
            tasks.len(),
            dropped
        );
        // Not running any more, so these only report failures.
        for task in tasks {
            task();
        }

        for connection in self.store.connections() {
            let mut state = connection.lock();
            if state.handshaker.is_some() {
                self.abort_handshake(&connection, &mut state, Error::NotRunning);
            }
        }
        info!("DTLS connector stopped");
    }

    /// Release threads after a failed start.
    fn shutdown_runtime(&self) {
        let receivers: Vec<_> = self.receivers.lock().drain(..).collect();
        for receiver in receivers {
            let _ = receiver.join();
        }
        if let Some(runtime) = self.runtime.write().take() {
            runtime.timer.shutdown();
            runtime.pool.shutdown();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn runtime(&self) -> Option<Runtime> {
        self.runtime.read().clone()
    }

    fn send_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Result<(), Error> {
        let Some(runtime) = self.runtime() else {
            return Err(Error::NotRunning);
        };
        trace!("Sending {} bytes to {}", datagram.len(), peer);
        runtime.socket.send_to(datagram, peer).map_err(|e| {
            debug!("Failed to send to {}: {}", peer, e);
            Error::from(e)
        })?;
        Ok(())
    }

    /// Connection id to ask the peer of `connection` to use.
    fn own_cid(&self, connection: &Connection) -> Option<ConnectionId> {
        match self.config.connection_id_length() {
            None => None,
            Some(0) => Some(ConnectionId::empty()),
            Some(_) => connection.cid().copied(),
        }
    }

    /// Run `f` in the serial executor of `connection` after `delay`.
    fn schedule<F>(self: &Arc<Self>, connection: &Arc<Connection>, delay: Duration, f: F) -> Option<TimerHandle>
    where
        F: FnOnce(&Arc<Inner>, &Arc<Connection>) + Send + 'static,
    {
        let runtime = self.runtime()?;
        let inner: Weak<Inner> = Arc::downgrade(self);
        let weak_connection = Arc::downgrade(connection);
        let task = Box::new(move || {
            let (Some(inner), Some(connection)) = (inner.upgrade(), weak_connection.upgrade()) else {
                return;
            };
            let target = Arc::clone(&connection);
            let runner = Arc::clone(&inner);
            let result = runner.execute_on(&connection, Box::new(move || f(&inner, &target)));
            if let Err(e) = result {
                trace!("Timer task for {} rejected: {}", connection.peer(), e);
            }
        });
        match runtime.timer.schedule(delay, task) {
            Ok(handle) => Some(handle),
            Err(e) => {
                debug!("Could not schedule timer: {}", e);
                None
            }
        }
    }

    /// Evict idle connections every stale threshold.
    fn schedule_stale_sweep(self: &Arc<Self>) {
        let Some(runtime) = self.runtime() else {
            return;
        };
        let inner = Arc::downgrade(self);
        let task = Box::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if !inner.is_running() {
                return;
            }
            for connection in inner.store.evict_stale() {
                debug!("Removing stale connection to {}", connection.peer());
                inner.discard(connection, Error::Evicted);
            }
            inner.schedule_stale_sweep();
        });
        let _ = runtime
            .timer
            .schedule(self.config.stale_connection_threshold(), task);
    }

    /// Fail the work of a connection the store let go of.
    fn discard(self: &Arc<Self>, connection: Arc<Connection>, error: Error) {
        let inner = Arc::clone(self);
        let target = Arc::clone(&connection);
        let cause = error.clone();
        let result = self.execute_on(&connection, Box::new(move || {
            let mut state = target.lock();
            inner.terminate(&target, &mut state, cause);
        }));
        if result.is_err() {
            let mut state = connection.lock();
            self.terminate(&connection, &mut state, error);
        }
    }

    /// Queue `task` on the serial executor of `connection`.
    ///
    /// A panicking task ends the connection with an internal_error alert.
    fn execute_on(self: &Arc<Self>, connection: &Arc<Connection>, task: Task) -> Result<(), Error> {
        let inner = Arc::clone(self);
        let target = Arc::clone(connection);
        connection.execute(Box::new(move || {
            let Some(message) = run_contained(task) else {
                return;
            };
            error!("Task for {} panicked: {}", target.peer(), message);
            let mut state = target.lock();
            let alert = Alert::new(AlertLevel::Fatal, AlertDescription::InternalError);
            inner.send_alert(&target, &mut state, alert);
            inner.terminate(&target, &mut state, Error::Internal(message));
        }))
    }

    fn notify(&self, peer: SocketAddr, event: &HandshakeEvent) {
        let listener = self.session_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_event(peer, event);
        }
    }

    fn try_acquire_unverified(&self) -> bool {
        let limit = self.config.resumption_verification_limit();
        self.pending_unverified
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_unverified(&self, state: &mut ConnectionState) {
        if std::mem::take(&mut state.pending_unverified) {
            self.pending_unverified.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn acquire_outbound(&self) -> bool {
        self.outbound_permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn release_outbound(&self) {
        self.outbound_permits.fetch_add(1, Ordering::AcqRel);
    }

    /// Protect and send one alert on the newest session of the connection.
    fn send_alert(&self, connection: &Connection, state: &mut ConnectionState, alert: Alert) {
        let ConnectionState {
            handshaker,
            session,
            ..
        } = state;
        let target = handshaker
            .as_mut()
            .and_then(|h| h.ctx_mut().session_mut().ok())
            .or(session.as_mut());
        let Some(target) = target else {
            return;
        };

        let mut payload = Buf::new();
        alert.serialize(&mut payload);
        let mut datagram = Buf::new();
        let epoch = target.write_epoch();
        if let Err(e) = target.encode(ContentType::Alert, epoch, &payload, &mut datagram) {
            debug!("Could not send {:?}: {}", alert, e);
            return;
        }
        debug!("Sending {:?} to {}", alert, connection.peer());
        let _ = self.send_datagram(&datagram, connection.peer());
    }

    /// Give up on the ongoing handshake. The connection survives only if it
    /// has an established session.
    fn abort_handshake(&self, connection: &Arc<Connection>, state: &mut ConnectionState, error: Error) {
        if state.session.is_none() {
            self.terminate(connection, state, error);
            return;
        }
        state.cancel_timers();
        let deferred = state.take_deferred_messages();
        state.handshaker = None;
        connection.set_handshaking(false);
        connection.set_started_by(None);
        self.release_unverified(state);
        if let Some(previous) = state.replaces.take() {
            self.store.restore_address(&previous);
        }
        self.notify(connection.peer(), &HandshakeEvent::Failed(error.clone()));
        for message in deferred {
            message.failed(&error);
        }
    }

    /// Close the connection for good and fail everything waiting on it.
    fn terminate(&self, connection: &Arc<Connection>, state: &mut ConnectionState, error: Error) {
        if state.closed {
            return;
        }
        debug!("Terminating connection to {}: {}", connection.peer(), error);
        state.closed = true;
        state.cancel_timers();
        let deferred = state.take_deferred_messages();
        let handshaking = state.is_handshaking();
        state.handshaker = None;
        state.session = None;
        connection.set_handshaking(false);
        connection.set_started_by(None);
        self.release_unverified(state);
        if let Some(previous) = state.replaces.take() {
            self.store.restore_address(&previous);
        }
        self.store.remove(connection);

        if handshaking {
            self.notify(connection.peer(), &HandshakeEvent::Failed(error.clone()));
        }
        for message in deferred {
            message.failed(&error);
        }
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("running", &self.is_running())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
