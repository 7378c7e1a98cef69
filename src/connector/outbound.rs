//! Sending application data, starting handshakes on demand.

use std::net::SocketAddr;
use std::sync::Arc;

use super::Inner;
use crate::api::{HandshakeMode, RawData};
use crate::buffer::Buf;
use crate::connection::{Connection, ConnectionState};
use crate::handshake::Handshaker;
use crate::message::Alert;
use crate::session::SessionTicket;
use crate::types::{ContentType, MAX_PLAINTEXT_FRAGMENT_LENGTH};
use crate::Error;

impl Inner {
    pub(super) fn send(self: &Arc<Self>, message: RawData) {
        if !self.is_running() {
            message.failed(&Error::NotRunning);
            return;
        }
        if message.peer.ip().is_multicast() {
            message.failed(&Error::MulticastNotSupported);
            return;
        }
        if message.bytes.len() > MAX_PLAINTEXT_FRAGMENT_LENGTH {
            message.failed(&Error::MessageTooLarge(message.bytes.len()));
            return;
        }
        if !self.acquire_outbound() {
            debug!("Outbound buffer full, dropping message to {}", message.peer);
            message.failed(&Error::Overflow);
            return;
        }

        let connection = match self.connection_for(&message) {
            Ok(connection) => connection,
            Err(e) => {
                self.release_outbound();
                message.failed(&e);
                return;
            }
        };

        let callback = message.callback.clone();
        let inner = Arc::clone(self);
        let target = Arc::clone(&connection);
        let result = self.execute_on(&connection, Box::new(move || {
            inner.release_outbound();
            let mut state = target.lock();
            inner.send_message(&target, &mut state, message);
        }));
        if let Err(e) = result {
            self.release_outbound();
            if let Some(callback) = callback {
                callback.on_error(&e);
            }
        }
    }

    /// The connection to the message's peer, created if allowed.
    fn connection_for(self: &Arc<Self>, message: &RawData) -> Result<Arc<Connection>, Error> {
        let _guard = self.connect_lock.lock();
        if let Some(connection) = self.store.get(message.peer) {
            return Ok(connection);
        }
        if self.config.server_only() {
            return Err(Error::ServerOnly);
        }
        let runtime = self.runtime().ok_or(Error::NotRunning)?;
        let connection = Connection::new(message.peer, &runtime.pool);
        if let Some(evicted) = self.store.put(&connection)? {
            self.discard(evicted, Error::Evicted);
        }
        trace!("New connection to {}", message.peer);
        Ok(connection)
    }

    /// Send on the established session, or get one first.
    fn send_message(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        message: RawData,
    ) {
        if !self.is_running() {
            message.failed(&Error::NotRunning);
            return;
        }
        if state.closed {
            message.failed(&Error::Closed);
            return;
        }

        let mode = message.context.handshake_mode;
        let resumption_needed =
            connection.is_resumption_required() || self.auto_resumption_due(connection);
        let usable = state.session.is_some()
            && match mode {
                HandshakeMode::NoHandshake => true,
                HandshakeMode::Auto => !resumption_needed,
                HandshakeMode::Full | HandshakeMode::Resume => false,
            };
        if usable {
            self.send_application_data(connection, state, message);
            return;
        }

        // The ongoing handshake gets the message out.
        if state.is_handshaking() {
            self.defer(state, message);
            return;
        }

        if mode == HandshakeMode::NoHandshake {
            message.failed(&Error::NoSession);
            return;
        }
        if self.config.server_only() {
            message.failed(&Error::ServerOnly);
            return;
        }

        let resume = mode == HandshakeMode::Resume || resumption_needed;
        self.start_handshake(connection, state, message, resume);
    }

    fn start_handshake(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        state: &mut ConnectionState,
        message: RawData,
        resume: bool,
    ) {
        let peer = connection.peer();
        let server_name = message
            .context
            .server_name
            .clone()
            .or_else(|| self.config.server_name().map(str::to_string));
        let ticket = resume
            .then(|| resumable_ticket(state, connection))
            .flatten()
            .filter(|t| t.server_name == server_name);

        let own_cid = self.own_cid(connection);
        let config = Arc::clone(&self.config);
        let mut handshaker = match &ticket {
            Some(ticket) => {
                debug!("Resuming session {} with {}", ticket.session_id, peer);
                Handshaker::resuming_client(config, peer, own_cid, ticket)
            }
            None => {
                debug!("Starting handshake with {}", peer);
                Handshaker::client(config, peer, own_cid, server_name)
            }
        };
        if let Err(e) = handshaker.start() {
            warn!("Handshake with {} not started: {}", peer, e);
            message.failed(&e);
            return;
        }

        // Messages waiting for an earlier handshake wait for this one.
        state.cancel_timers();
        for waiting in state.take_deferred_messages() {
            if let Err(waiting) = handshaker.ctx_mut().defer_message(waiting) {
                waiting.failed(&Error::Overflow);
            }
        }
        state.handshaker = Some(handshaker);
        connection.set_handshaking(true);

        message.connecting();
        self.defer(state, message);
        self.after_handshake_step(connection, state);
    }

    fn defer(&self, state: &mut ConnectionState, message: RawData) {
        let Some(handshaker) = state.handshaker.as_mut() else {
            message.failed(&Error::NoSession);
            return;
        };
        if let Err(message) = handshaker.ctx_mut().defer_message(message) {
            debug!("Too many messages waiting for handshake with {}", message.peer);
            message.failed(&Error::Overflow);
        }
    }

    /// Protect and send one message on the established session.
    pub(super) fn send_application_data(
        &self,
        connection: &Connection,
        state: &mut ConnectionState,
        message: RawData,
    ) {
        let Some(context) = state.endpoint_context(connection.peer()) else {
            message.failed(&Error::NoSession);
            return;
        };
        let matcher = self.matcher.read().clone();
        if let Some(matcher) = matcher {
            if !matcher.is_to_be_sent(&message.context, &context) {
                debug!("Message to {} does not match the connection", connection.peer());
                message.failed(&Error::EndpointMismatch);
                return;
            }
        }
        message.context_established(&context);

        let Some(session) = state.session.as_mut() else {
            message.failed(&Error::NoSession);
            return;
        };
        let mut datagram = Buf::new();
        let epoch = session.write_epoch();
        if let Err(e) = session.encode(ContentType::ApplicationData, epoch, &message.bytes, &mut datagram) {
            if matches!(e, Error::SequenceExhausted(_)) {
                warn!("Sequence numbers exhausted with {}, resumption required", connection.peer());
                connection.set_resumption_required(true);
            }
            message.failed(&e);
            return;
        }
        match self.send_datagram(&datagram, connection.peer()) {
            Ok(()) => {
                connection.touch();
                message.sent();
            }
            Err(e) => message.failed(&e),
        }
    }

    /// Whether the connection was idle long enough to resume before sending.
    fn auto_resumption_due(&self, connection: &Connection) -> bool {
        self.config
            .auto_resumption_timeout()
            .map(|timeout| connection.idle_for() >= timeout)
            .unwrap_or(false)
    }

    pub(super) fn close(self: &Arc<Self>, peer: SocketAddr) {
        let Some(connection) = self.store.get(peer) else {
            return;
        };
        let inner = Arc::clone(self);
        let target = Arc::clone(&connection);
        let result = self.execute_on(&connection, Box::new(move || {
            let mut state = target.lock();
            inner.send_alert(&target, &mut state, Alert::close_notify());
            inner.terminate(&target, &mut state, Error::Closed);
        }));
        if result.is_err() {
            self.store.remove(&connection);
        }
    }
}

/// Ticket of the session to resume, if any.
fn resumable_ticket(state: &ConnectionState, connection: &Connection) -> Option<SessionTicket> {
    state
        .session
        .as_ref()
        .and_then(|s| s.ticket())
        .or_else(|| connection.ticket())
}
